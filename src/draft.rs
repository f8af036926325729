use crate::{canonical, signer::SignerError, Event, Kind, PubKey, Signer, Tags, Timestamp, ID};

/// an unsigned event (a "rumor"): it has no id and no signature and can only become an
/// [`Event`] by going through a [`Signer`]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UnsignedDraft {
    pub pubkey: PubKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Tags,
    pub content: String,
}

impl UnsignedDraft {
    /// a draft authored by `signer`, stamped with the current time
    pub fn new(signer: &(impl Signer + ?Sized), kind: Kind, tags: Tags, content: String) -> Self {
        Self {
            pubkey: signer.public_key(),
            created_at: Timestamp::now(),
            kind,
            tags,
            content,
        }
    }

    /// serialize the draft for ID computation
    pub fn serialize(&self) -> Vec<u8> {
        canonical::serialize_for_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// the id this draft will have once signed
    pub fn id(&self) -> ID {
        canonical::hash(&self.serialize())
    }

    /// returns a signed event with id and sig
    pub fn finalize(self, signer: &(impl Signer + ?Sized)) -> Result<Event, SignerError> {
        let signer_pubkey = signer.public_key();
        if signer_pubkey != self.pubkey {
            return Err(SignerError::PubKeyMismatch {
                draft: self.pubkey,
                signer: signer_pubkey,
            });
        }

        let id = self.id();
        let sig = signer.sign(&id)?;

        Ok(Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        })
    }
}

impl std::fmt::Display for UnsignedDraft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UnsignedDraft({}, {}, {}, {})",
            self.kind, self.created_at, self.tags, self.content
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SecretKey;

    #[test]
    fn test_finalize() {
        let sk = SecretKey::generate();
        let draft = UnsignedDraft::new(&sk, Kind(1), Tags::default(), "gm".to_string());
        let expected_id = draft.id();

        let event = draft.finalize(&sk).unwrap();
        assert_eq!(event.id, expected_id);
        assert_eq!(event.pubkey, sk.pubkey());
        assert!(event.verify().is_ok());
    }

    #[test]
    fn test_finalize_with_someone_elses_key() {
        let author = SecretKey::generate();
        let other = SecretKey::generate();
        let draft = UnsignedDraft::new(&author, Kind(1), Tags::default(), String::new());

        assert!(matches!(
            draft.finalize(&other),
            Err(SignerError::PubKeyMismatch { .. })
        ));
    }

    #[test]
    fn test_aux_randomness_doesnt_change_id() {
        let sk = SecretKey::generate();
        let draft = UnsignedDraft::new(&sk, Kind(0), Tags::default(), "{}".to_string());

        let a = draft.clone().finalize(&sk).unwrap();
        let b = draft.finalize(&sk).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.verify_signature());
        assert!(b.verify_signature());
    }
}
