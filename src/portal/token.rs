//! Correlation tokens and the object paths derived from them

use std::fmt;
use std::marker::PhantomData;

use anyhow::{Context, Result};
use zbus::zvariant::OwnedObjectPath;

use super::DESKTOP_PATH;

/// Marker for tokens used as `handle_token` on requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Request {}

/// Marker for tokens used as `session_handle_token`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Session {}

/// Kind of object a token names, selects the path prefix
pub trait TokenKind {
    const SEGMENT: &'static str;
}

impl TokenKind for Request {
    const SEGMENT: &'static str = "request";
}

impl TokenKind for Session {
    const SEGMENT: &'static str = "session";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token<K> {
    value: u64,
    kind: PhantomData<K>,
}

pub type RequestToken = Token<Request>;
pub type SessionToken = Token<Session>;

impl<K> Token<K> {
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl<K: TokenKind> Token<K> {
    /// Object path the portal will use for this token
    ///
    /// `sender` is the caller's unique bus name in portal form (see [`sender_path_segment`]).
    pub fn object_path(self, sender: &str) -> Result<OwnedObjectPath> {
        let path = format!("{}/{}/{}/{}", DESKTOP_PATH, K::SEGMENT, sender, self);
        OwnedObjectPath::try_from(path.clone())
            .with_context(|| format!("Invalid object path for token: {}", path))
    }
}

impl<K> fmt::Display for Token<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.value())
    }
}

/// Monotonic token source owned by one negotiator
///
/// Values start at 1 and are never handed out twice.
#[derive(Debug)]
pub struct TokenGenerator<K> {
    last: u64,
    kind: PhantomData<K>,
}

impl<K> Default for TokenGenerator<K> {
    fn default() -> Self {
        Self {
            last: 0,
            kind: PhantomData,
        }
    }
}

impl<K> TokenGenerator<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&mut self) -> Token<K> {
        self.last += 1;
        Token {
            value: self.last,
            kind: PhantomData,
        }
    }
}

/// Convert a unique bus name like `:1.42` to the `1_42` form used in portal paths
pub fn sender_path_segment(unique_name: &str) -> String {
    unique_name.trim_start_matches(':').replace('.', "_")
}
