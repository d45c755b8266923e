use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Wraps a shared-secret API key (zeroized on drop, redacted in Debug).
#[derive(Clone)]
pub struct ApiKey(pub SecretString);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Compare a presented key against this one.
    /// Both sides are hashed first so the comparison length never depends on input.
    pub fn matches(&self, presented: &str) -> bool {
        let expected = Sha256::digest(self.0.expose_secret().as_bytes());
        let actual = Sha256::digest(presented.as_bytes());
        expected
            .iter()
            .zip(actual.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl PartialEq for ApiKey {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other.expose())
    }
}

/// Serializes the plain key. Only the settings loader does this, to merge a
/// file layer over the defaults.
impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_same_key() {
        let key = ApiKey::new("bridge-secret");
        assert!(key.matches("bridge-secret"));
    }

    #[test]
    fn rejects_other_keys() {
        let key = ApiKey::new("bridge-secret");
        assert!(!key.matches("bridge-secreT"));
        assert!(!key.matches(""));
        assert!(!key.matches("bridge-secret-longer"));
    }

    #[test]
    fn debug_is_redacted() {
        let key = ApiKey::new("bridge-secret");
        assert_eq!(format!("{key:?}"), "ApiKey([REDACTED])");
    }

    #[test]
    fn deserializes_from_plain_string() {
        let key: ApiKey = serde_json::from_str("\"bridge-secret\"").unwrap();
        assert!(key.matches("bridge-secret"));
        assert_eq!(key, ApiKey::new("bridge-secret"));
        assert_ne!(key, ApiKey::new("other"));
    }
}
