use secp256k1::{global::SECP256K1, rand, Keypair, XOnlyPublicKey};
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretKeyError {
    #[error("secret key should be at most 64-char hex, got {0} chars")]
    InvalidLength(usize),

    #[error("invalid hex encoding")]
    InvalidHex(#[from] lowercase_hex::FromHexError),

    #[error("invalid secret key")]
    InvalidSecretKey,
}

#[derive(Error, Debug)]
pub enum PubKeyError {
    #[error("invalid hex encoding")]
    InvalidHex(#[from] lowercase_hex::FromHexError),

    #[error("invalid public key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("public key not in curve")]
    NotInCurve,
}

/// A 32-byte secret key, always a valid secp256k1 scalar
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// generate a new random secret key
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let keypair = Keypair::new(SECP256K1, &mut rng);
        SecretKey(keypair.secret_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, SecretKeyError> {
        secp256k1::SecretKey::from_byte_array(bytes)
            .map_err(|_| SecretKeyError::InvalidSecretKey)?;

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// accepts unpadded hex, which gets left-padded with zeroes
    pub fn from_hex(hex_str: &str) -> Result<Self, SecretKeyError> {
        let hex_str = if hex_str.len() < 64 {
            format!("{:0>64}", hex_str)
        } else if hex_str.len() > 64 {
            return Err(SecretKeyError::InvalidLength(hex_str.len()));
        } else {
            hex_str.to_string()
        };

        let mut bytes = [0u8; 32];
        lowercase_hex::decode_to_slice(&hex_str, &mut bytes)?;

        Self::from_bytes(bytes)
    }

    pub fn to_hex(&self) -> String {
        lowercase_hex::encode(self.0)
    }

    pub(crate) fn keypair(&self) -> Keypair {
        Keypair::from_seckey_byte_array(SECP256K1, self.0)
            .expect("should always work because SecretKey is validated on construction")
    }

    /// the x-only public key for this secret key
    pub fn pubkey(&self) -> PubKey {
        let (xonly_pk, _) = XOnlyPublicKey::from_keypair(&self.keypair());
        PubKey(xonly_pk.serialize())
    }
}

// never print the key itself
impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<sk for {}>", self.pubkey().to_hex())
    }
}

/// a 32-byte x-only public key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubKey(pub [u8; 32]);

impl PubKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, PubKeyError> {
        XOnlyPublicKey::from_byte_array(bytes).map_err(|_| PubKeyError::NotInCurve)?;

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, PubKeyError> {
        if hex_str.len() != 64 {
            return Err(PubKeyError::InvalidLength(hex_str.len() / 2));
        }
        let mut bytes = [0u8; 32];
        lowercase_hex::decode_to_slice(hex_str, &mut bytes)?;

        Self::from_bytes(bytes)
    }

    pub fn to_hex(&self) -> String {
        lowercase_hex::encode(self.0)
    }
}

impl Serialize for PubKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PubKey::from_hex(&s).map_err(Error::custom)
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<pk:{}>", self.to_hex())
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<pk={}>", self.to_hex())
    }
}
