//! Message selectors: the predicate a consumer uses to pick a message.
//!
//! The broker evaluates two forms: an equality map over headers and a
//! single-id literal. General boolean predicates run client side: the
//! client pulls the header list, evaluates its own closure, then
//! resubmits the chosen id as an `Id` selector.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::headers::{HeaderValue, Headers};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Match the first visible message.
    #[default]
    Any,
    /// Match only the message with this id.
    Id(String),
    /// Match when every listed header equals the given value.
    Match(HashMap<String, HeaderValue>),
}

impl Selector {
    pub fn id(id: impl Into<String>) -> Self {
        Selector::Id(id.into())
    }

    pub fn matching<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<HeaderValue>,
    {
        Selector::Match(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn matches(&self, headers: &Headers) -> bool {
        match self {
            Selector::Any => true,
            Selector::Id(id) => headers.id() == Some(id.as_str()),
            Selector::Match(wanted) => wanted
                .iter()
                .all(|(name, value)| headers.get(name) == Some(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::headers::H_ID;

    fn sample() -> Headers {
        let mut headers = Headers::new();
        headers.insert(H_ID, "m-1");
        headers.insert("region", "eu");
        headers.insert("attempt", 2i64);
        headers
    }

    #[test]
    fn any_matches_everything() {
        assert!(Selector::Any.matches(&sample()));
    }

    #[test]
    fn id_literal_matches_only_that_id() {
        assert!(Selector::id("m-1").matches(&sample()));
        assert!(!Selector::id("m-2").matches(&sample()));
    }

    #[test]
    fn equality_map_needs_every_pair() {
        let selector = Selector::matching([("region", "eu")]);
        assert!(selector.matches(&sample()));

        let selector = Selector::matching([
            ("region", HeaderValue::from("eu")),
            ("attempt", HeaderValue::from(2i64)),
        ]);
        assert!(selector.matches(&sample()));

        let selector = Selector::matching([("region", "us")]);
        assert!(!selector.matches(&sample()));

        let selector = Selector::matching([("missing", "x")]);
        assert!(!selector.matches(&sample()));
    }
}
