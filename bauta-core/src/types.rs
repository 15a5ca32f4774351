//! Shared identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque client identity derived from the Common Name of the presented
/// client certificate. Stable across reconnects of the same client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Wrap a certificate Common Name. Leading/trailing whitespace is not
    /// meaningful in a CN and is stripped.
    pub fn new(cn: impl Into<String>) -> Self {
        Self(cn.into().trim().to_string())
    }

    /// The identity as a printable string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An identity is usable only when the CN was non-empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_trims_and_displays() {
        let id = ClientId::new("  laptop-01 ");
        assert_eq!(id.as_str(), "laptop-01");
        assert_eq!(format!("{id}"), "laptop-01");
        assert!(!id.is_empty());
        assert!(ClientId::new("   ").is_empty());
    }
}
