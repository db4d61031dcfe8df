use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32;
use serde::{Deserialize, Deserializer, Serialize};

/// A fixed-width, base32-displayable identifier. TTH roots/leaves and ADC
/// CIDs are both 24-byte (192-bit) quantities; this is the shared shape.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<const N: usize>(pub [u8; N]);

impl<const N: usize> Id<N> {
    pub fn new(from: [u8; N]) -> Self {
        Id(from)
    }

    pub fn from_bytes(b: &[u8]) -> anyhow::Result<Self> {
        if b.len() != N {
            anyhow::bail!("expected {} bytes, got {}", N, b.len());
        }
        let mut v = [0u8; N];
        v.copy_from_slice(b);
        Ok(Id(v))
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    pub fn as_base32(&self) -> String {
        BASE32.encode(&self.0)
    }
}

impl<const N: usize> FromStr for Id<N> {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = BASE32
            .decode(s.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid base32: {e}"))?;
        Self::from_bytes(&decoded)
    }
}

impl<const N: usize> fmt::Debug for Id<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_base32())
    }
}

impl<const N: usize> fmt::Display for Id<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_base32())
    }
}

impl<const N: usize> Serialize for Id<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_base32())
    }
}

impl<'de, const N: usize> Deserialize<'de> for Id<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Id::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base32_round_trips() {
        let id: Id<24> = Id::new([7u8; 24]);
        let encoded = id.as_base32();
        let decoded: Id<24> = encoded.parse().unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(Id::<24>::from_bytes(&[0u8; 23]).is_err());
    }
}
