//! Connection access control: ordered allow/deny host rules.
//!
//! Rules come from a whitespace-separated string such as
//! `"allow 127.0.0.1 deny all"`. Evaluation is first match wins; a
//! peer matching no rule is allowed. A host pattern is an exact IP,
//! a dotted prefix (`"10.0."`), or `all`.

use std::net::IpAddr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct Acl {
    rules: Vec<(Action, String)>,
}

impl Acl {
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        let mut tokens = text.split_whitespace();
        while let Some(word) = tokens.next() {
            let action = match word {
                "allow" => Action::Allow,
                "deny" => Action::Deny,
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "acl: expected allow/deny, got {:?}",
                        other
                    )))
                }
            };
            let Some(host) = tokens.next() else {
                return Err(Error::InvalidArgument(format!(
                    "acl: {} rule is missing its host",
                    word
                )));
            };
            rules.push((action, host.to_string()));
        }
        Ok(Self { rules })
    }

    pub fn permits(&self, peer: &IpAddr) -> bool {
        let peer = peer.to_string();
        for (action, pattern) in &self.rules {
            let hit = pattern == "all"
                || *pattern == peer
                || (pattern.ends_with('.') && peer.starts_with(pattern.as_str()));
            if hit {
                return *action == Action::Allow;
            }
        }
        true
    }
}
