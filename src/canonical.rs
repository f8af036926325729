//! canonical form of an event and the signature lifecycle around it
//!
//! the id of an event is the sha256 of `[0,<pubkey>,<created_at>,<kind>,<tags>,<content>]`
//! written without whitespace, with the json string escaping every nostr implementation
//! shares (only `"`, `\` and control characters are escaped, everything else is raw utf-8).

use crate::{Kind, PubKey, SecretKey, Signature, Tags, Timestamp, ID};
use secp256k1::{schnorr, XOnlyPublicKey, SECP256K1};
use sha2::{Digest, Sha256};

/// serialize the fields covered by the event id
pub fn serialize_for_hash(
    pubkey: &PubKey,
    created_at: Timestamp,
    kind: Kind,
    tags: &Tags,
    content: &str,
) -> Vec<u8> {
    // a tuple is written as a json array, in field order
    let array = (0u8, pubkey, created_at, kind, tags, content);
    serde_json::to_vec(&array).expect("plain strings and integers always serialize")
}

pub fn hash(serialized: &[u8]) -> ID {
    ID::from_bytes(Sha256::digest(serialized).into())
}

/// deterministic BIP-340 signature over the id
pub fn sign(id: &ID, secret_key: &SecretKey) -> Signature {
    let signature = SECP256K1.sign_schnorr_no_aux_rand(id.as_bytes(), &secret_key.keypair());
    Signature::from_bytes(signature.to_byte_array())
}

/// BIP-340 signature with auxiliary randomness, verification is unaffected by `aux_rand`
pub fn sign_with_aux_rand(id: &ID, secret_key: &SecretKey, aux_rand: &[u8; 32]) -> Signature {
    let signature =
        SECP256K1.sign_schnorr_with_aux_rand(id.as_bytes(), &secret_key.keypair(), aux_rand);
    Signature::from_bytes(signature.to_byte_array())
}

pub fn verify(id: &ID, pubkey: &PubKey, signature: &Signature) -> bool {
    let pubkey = match XOnlyPublicKey::from_byte_array(pubkey.0) {
        Ok(pk) => pk,
        Err(_) => return false,
    };

    let signature = schnorr::Signature::from_byte_array(signature.0);

    SECP256K1
        .verify_schnorr(&signature, id.as_bytes(), &pubkey)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pubkey() -> PubKey {
        PubKey::from_hex("79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
            .unwrap()
    }

    #[test]
    fn test_serialize_for_hash_shape() {
        let tags = Tags(vec![vec!["p".into(), "abcd".into()]]);
        let bytes = serialize_for_hash(&pubkey(), Timestamp(1700000000), Kind(1), &tags, "hi");
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"[0,"79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",1700000000,1,[["p","abcd"]],"hi"]"#
        );
    }

    #[test]
    fn test_serialize_for_hash_empty_values() {
        let bytes = serialize_for_hash(&pubkey(), Timestamp(0), Kind(0), &Tags::default(), "");
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"[0,"79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",0,0,[],""]"#
        );
    }

    #[test]
    fn test_serialize_for_hash_escaping() {
        let content = "line\nbreak \"quoted\" back\\slash tab\t bell\u{7} é 🌶 </script>";
        let bytes = serialize_for_hash(&pubkey(), Timestamp(1), Kind(1), &Tags::default(), content);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with(
            r#""line\nbreak \"quoted\" back\\slash tab\t bell\u0007 é 🌶 </script>"]"#
        ));
    }

    #[test]
    fn test_hash_determinism() {
        let tags = Tags(vec![
            vec!["e".into(), "x".into()],
            vec!["a".into(), "y".into()],
        ]);
        let first = hash(&serialize_for_hash(&pubkey(), Timestamp(5), Kind(7), &tags, "+"));
        for _ in 0..10 {
            let again = hash(&serialize_for_hash(&pubkey(), Timestamp(5), Kind(7), &tags, "+"));
            assert_eq!(first, again);
        }

        // tag order is part of the hashed form, nothing gets sorted
        let swapped = Tags(vec![tags.0[1].clone(), tags.0[0].clone()]);
        assert_ne!(
            first,
            hash(&serialize_for_hash(&pubkey(), Timestamp(5), Kind(7), &swapped, "+"))
        );
    }

    #[test]
    fn test_hash_known_vector() {
        assert_eq!(
            hash(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sign_verify() {
        let sk = SecretKey::generate();
        let pk = sk.pubkey();
        let id = hash(b"some event");

        let sig = sign(&id, &sk);
        assert!(verify(&id, &pk, &sig));

        // deterministic without aux randomness
        assert_eq!(sig, sign(&id, &sk));

        let sig_aux = sign_with_aux_rand(&id, &sk, &[42u8; 32]);
        assert!(verify(&id, &pk, &sig_aux));
    }

    #[test]
    fn test_single_byte_flips_break_verification() {
        let sk = SecretKey::generate();
        let pk = sk.pubkey();
        let id = hash(b"flip me");
        let sig = sign(&id, &sk);

        for i in 0..64 {
            let mut bad = sig;
            bad.0[i] ^= 0x01;
            assert!(!verify(&id, &pk, &bad), "sig byte {i}");
        }
        for i in 0..32 {
            let mut bad = id;
            bad.0[i] ^= 0x01;
            assert!(!verify(&bad, &pk, &sig), "id byte {i}");
        }
        for i in 0..32 {
            let mut bad = pk;
            bad.0[i] ^= 0x01;
            assert!(!verify(&id, &bad, &sig), "pubkey byte {i}");
        }
    }

    #[test]
    fn test_verify_garbage_is_false() {
        let id = hash(b"x");
        assert!(!verify(&id, &PubKey([0u8; 32]), &Signature([0u8; 64])));
        assert!(!verify(&id, &PubKey([0xffu8; 32]), &Signature([0xffu8; 64])));
    }
}
