//! Cache key derivation.
//!
//! A [`CacheKey`] is the pair `(url, credential)` flattened into one opaque
//! string. The flattening is reversible: the separator is a newline, which
//! cannot occur in a valid URL, so [`CacheKey::parse`] recovers both parts.
//!
//! On disk the key is never used directly as a file name. Instead
//! [`CacheKey::file_stem`] yields the SHA-256 hex digest of the full key,
//! so two distinct keys can never map to the same file.

use std::fmt;

use sha2::{Digest, Sha256};

const SEPARATOR: char = '\n';

/// Identity of a cached result: URL plus optional credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `url`, scoped by `credential` if present.
    pub fn new(url: &str, credential: Option<&str>) -> Self {
        match credential {
            Some(credential) => Self(format!("{url}{SEPARATOR}{credential}")),
            None => Self(url.to_string()),
        }
    }

    /// Rebuild a key from its string form (e.g. read back from a record).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Split the key back into `(url, credential)`.
    pub fn parse(&self) -> (&str, Option<&str>) {
        match self.0.split_once(SEPARATOR) {
            Some((url, credential)) => (url, Some(credential)),
            None => (&self.0, None),
        }
    }

    /// The URL part of the key.
    pub fn url(&self) -> &str {
        self.parse().0
    }

    /// The opaque string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed-width, collision-resistant file stem for this key.
    pub fn file_stem(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    /// Displays the URL only; credentials stay out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (url, credential) = self.parse();
        match credential {
            Some(_) => write!(f, "{url} (credentialed)"),
            None => f.write_str(url),
        }
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
