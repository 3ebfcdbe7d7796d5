//! Admission control for signaling connections.

use std::collections::HashSet;

use axum::http::HeaderMap;
use axum::http::header::COOKIE;

/// Decides whether a signaling upgrade request may proceed.
pub trait ConnectionGate: Send + Sync {
    fn is_authorized(&self, headers: &HeaderMap) -> bool;
}

/// Admits everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConnectionGate for AllowAll {
    fn is_authorized(&self, _headers: &HeaderMap) -> bool {
        true
    }
}

/// Admits requests carrying one of a fixed set of tokens in a cookie.
#[derive(Debug, Clone)]
pub struct CookieTokenGate {
    cookie_name: String,
    tokens: HashSet<String>,
}

impl CookieTokenGate {
    pub fn new(cookie_name: impl Into<String>, tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl ConnectionGate for CookieTokenGate {
    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .any(|(name, value)| name == self.cookie_name && self.tokens.contains(value))
    }
}
