use crate::{canonical, PubKey, SecretKey, Signature, ID};
use secp256k1::rand;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("unauthorized by user")]
    Unauthorized,

    #[error("draft pubkey {draft} is not the signer's {signer}")]
    PubKeyMismatch { draft: PubKey, signer: PubKey },

    #[error("signer failed: {0}")]
    Failed(String),
}

/// the signing capability the engine is handed, it never holds keys by itself
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PubKey;
    fn sign(&self, id: &ID) -> Result<Signature, SignerError>;
}

impl Signer for SecretKey {
    fn public_key(&self) -> PubKey {
        self.pubkey()
    }

    fn sign(&self, id: &ID) -> Result<Signature, SignerError> {
        let aux_rand: [u8; 32] = rand::random();
        Ok(canonical::sign_with_aux_rand(id, self, &aux_rand))
    }
}
