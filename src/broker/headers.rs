//! Message headers: tagged scalar values plus the reserved header set
//! the manager controls.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ==========================================
// RESERVED HEADER NAMES
// ==========================================

pub const H_ID: &str = "id";
pub const H_CREATED: &str = "created";
pub const H_DELIVERY: &str = "delivery";
pub const H_MAX_DELIVERIES: &str = "max_deliveries";
pub const H_PRIORITY: &str = "priority";
pub const H_EXPIRES: &str = "expires";
pub const H_EXPIRES_AT: &str = "expires_at";
pub const H_REDELIVERY: &str = "redelivery";

pub const DEFAULT_MAX_DELIVERIES: i64 = 5;

// ==========================================
// HEADER VALUES
// ==========================================

/// Scalar header value. Structured values are rejected at the API
/// boundary; anything that deserializes into this enum is legal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// Symbolic constant, kept distinct from plain strings on the wire.
    Sym { sym: String },
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl HeaderValue {
    pub fn sym(name: impl Into<String>) -> Self {
        HeaderValue::Sym { sym: name.into() }
    }

    /// Textual content of a string or symbol value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            HeaderValue::Sym { sym } => Some(sym),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Sym { sym } => write!(f, "{}", sym),
            HeaderValue::Null => write!(f, "null"),
            HeaderValue::Bool(b) => write!(f, "{}", b),
            HeaderValue::Int(n) => write!(f, "{}", n),
            HeaderValue::Float(x) => write!(f, "{}", x),
            HeaderValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Str(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Str(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(n: i64) -> Self {
        HeaderValue::Int(n)
    }
}

impl From<f64> for HeaderValue {
    fn from(x: f64) -> Self {
        HeaderValue::Float(x)
    }
}

impl From<bool> for HeaderValue {
    fn from(b: bool) -> Self {
        HeaderValue::Bool(b)
    }
}

// ==========================================
// DELIVERY MODE
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    BestEffort,
    Repeated,
    Once,
}

impl Delivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::BestEffort => "best_effort",
            Delivery::Repeated => "repeated",
            Delivery::Once => "once",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "best_effort" => Some(Delivery::BestEffort),
            "repeated" => Some(Delivery::Repeated),
            "once" => Some(Delivery::Once),
            _ => None,
        }
    }

    pub fn from_value(value: &HeaderValue) -> Option<Self> {
        value.as_text().and_then(Self::parse)
    }
}

// ==========================================
// HEADER MAP
// ==========================================

/// Header map with typed accessors for the reserved names. Values are
/// immutable once a message is accepted; the only sanctioned mutation
/// is the `redelivery` bump on abort.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(HashMap<String, HeaderValue>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        self.0.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // --- Reserved accessors ---

    pub fn id(&self) -> Option<&str> {
        self.get(H_ID).and_then(HeaderValue::as_text)
    }

    pub fn created(&self) -> i64 {
        self.get(H_CREATED).and_then(HeaderValue::as_int).unwrap_or(0)
    }

    pub fn priority(&self) -> i64 {
        self.get(H_PRIORITY).and_then(HeaderValue::as_int).unwrap_or(0)
    }

    pub fn delivery(&self) -> Delivery {
        self.get(H_DELIVERY)
            .and_then(Delivery::from_value)
            .unwrap_or(Delivery::BestEffort)
    }

    pub fn max_deliveries(&self) -> i64 {
        self.get(H_MAX_DELIVERIES)
            .and_then(HeaderValue::as_int)
            .unwrap_or(DEFAULT_MAX_DELIVERIES)
    }

    pub fn redelivery(&self) -> i64 {
        self.get(H_REDELIVERY).and_then(HeaderValue::as_int).unwrap_or(0)
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.get(H_EXPIRES_AT).and_then(HeaderValue::as_int)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at(), Some(at) if at < now)
    }

    pub fn is_exhausted(&self) -> bool {
        self.redelivery() >= self.max_deliveries()
    }
}

impl FromIterator<(String, HeaderValue)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, HeaderValue)>>(iter: T) -> Self {
        Headers(iter.into_iter().collect())
    }
}

// ==========================================
// VALIDATION
// ==========================================

/// Header names are symbols: identifier characters, leading letter or
/// underscore.
pub fn validate_header_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "header name {:?} is not a symbol",
            name
        )))
    }
}
