//! Content digests.

use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

use crate::error::{KilnError, KilnResult};

/// A validated SHA-256 content digest, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Algorithm prefix.
    pub const ALGORITHM: &'static str = "sha256";

    /// Length of the hex-encoded hash.
    pub const HEX_LENGTH: usize = 64;

    /// Digest of a byte slice.
    #[must_use]
    pub fn of_bytes(data: &[u8]) -> Self {
        use sha2::Digest as _;
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Finish a running hasher into a digest.
    #[must_use]
    pub fn from_hasher(hasher: Sha256) -> Self {
        use sha2::Digest as _;
        Self(format!("{}:{}", Self::ALGORITHM, hex::encode(hasher.finalize())))
    }

    /// Parse a digest string, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not `sha256:` followed by 64 lowercase hex characters.
    pub fn parse(value: &str) -> KilnResult<Self> {
        Self::validate(value)?;
        Ok(Self(value.to_string()))
    }

    /// The full `sha256:<hex>` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex part without the algorithm prefix.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.0[Self::ALGORITHM.len() + 1..]
    }

    /// A 12 character abbreviation for display.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.hex()[..12]
    }

    fn validate(value: &str) -> KilnResult<()> {
        let invalid = || KilnError::InvalidDigest {
            value: value.to_string(),
        };

        let hex = value
            .strip_prefix(Self::ALGORITHM)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(invalid)?;

        if hex.len() != Self::HEX_LENGTH
            || !hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = KilnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(Self(value))
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn digest_of_empty_input() {
        let digest = Digest::of_bytes(b"");
        assert_eq!(
            digest.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest.short(), "e3b0c44298fc");
    }

    #[test]
    fn rejects_malformed_digests() {
        assert!(Digest::parse("sha256:abc").is_err());
        let hex = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert!(Digest::parse(&format!("md5:{hex}")).is_err());
        assert!(Digest::parse(&format!("sha256:{}", hex.to_uppercase())).is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let digest = Digest::of_bytes(b"layer");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{digest}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
        assert!(serde_json::from_str::<Digest>("\"sha256:zz\"").is_err());
    }

    proptest! {
        #[test]
        fn computed_digests_always_parse(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let digest = Digest::of_bytes(&data);
            prop_assert_eq!(Digest::parse(digest.as_str()).unwrap(), digest);
        }
    }
}
