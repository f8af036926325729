use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IDError {
    #[error("invalid hex encoding")]
    InvalidHex(#[from] lowercase_hex::FromHexError),
    #[error("invalid ID length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("invalid hex encoding")]
    InvalidHex(#[from] lowercase_hex::FromHexError),
    #[error("invalid signature length: expected 64 bytes, got {0}")]
    InvalidLength(usize),
}

/// A 32-byte event ID
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ID(pub [u8; 32]);

impl ID {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, IDError> {
        if hex_str.len() != 64 {
            return Err(IDError::InvalidLength(hex_str.len() / 2));
        }
        let mut bytes = [0u8; 32];
        lowercase_hex::decode_to_slice(hex_str, &mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        lowercase_hex::encode(self.0)
    }
}

impl Serialize for ID {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ID {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ID::from_hex(&s).map_err(Error::custom)
    }
}

impl fmt::Debug for ID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<id:{}>", self.to_hex())
    }
}

impl fmt::Display for ID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<id={}>", self.to_hex())
    }
}

/// A 64-byte schnorr signature
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, SignatureError> {
        if hex_str.len() != 128 {
            return Err(SignatureError::InvalidLength(hex_str.len() / 2));
        }
        let mut bytes = [0u8; 64];
        lowercase_hex::decode_to_slice(hex_str, &mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        lowercase_hex::encode(self.0)
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Signature::from_hex(&s).map_err(Error::custom)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<sig:{}>", self.to_hex())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<sig={}>", self.to_hex())
    }
}

/// event kind
#[derive(
    Copy, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Kind(pub u16);

impl Kind {
    pub const METADATA: Kind = Kind(0);
    pub const TEXT_NOTE: Kind = Kind(1);
    pub const CLIENT_AUTH: Kind = Kind(22242);
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Kind {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_hex() {
        let hex = "d91191e30e00444b942c0e82cad470b32af171764c2275bee0bd99377efd4075";
        let id = ID::from_hex(hex).unwrap();
        assert_eq!(id.to_hex(), hex);

        assert!(matches!(
            ID::from_hex("abcd"),
            Err(IDError::InvalidLength(2))
        ));
        assert!(ID::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_signature_json() {
        let sig = Signature([7u8; 64]);
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, format!("\"{}\"", "07".repeat(64)));

        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);

        assert!(serde_json::from_str::<Signature>("\"0707\"").is_err());
    }

    #[test]
    fn test_kind_json() {
        assert_eq!(serde_json::to_string(&Kind(30023)).unwrap(), "30023");
        assert_eq!(serde_json::from_str::<Kind>("0").unwrap(), Kind::METADATA);
        assert!(serde_json::from_str::<Kind>("70000").is_err());
    }
}
