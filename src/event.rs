use crate::{canonical, Kind, PubKey, Signature, Tags, Timestamp, ID};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// malformed event json, `field` names the offending member
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid event field '{field}': {reason}")]
pub struct ParseError {
    pub field: &'static str,
    pub reason: String,
}

impl ParseError {
    fn new(field: &'static str, reason: impl fmt::Display) -> Self {
        Self {
            field,
            reason: reason.to_string(),
        }
    }
}

/// a well-formed event whose id or signature doesn't hold
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("id {claimed} doesn't match the computed {computed}")]
    IdMismatch { claimed: ID, computed: ID },

    #[error("bad signature on {0}")]
    BadSignature(ID),
}

/// represents a signed nostr event
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: ID,
    pub pubkey: PubKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Tags,
    pub content: String,
    pub sig: Signature,
}

impl Event {
    pub fn from_json(json: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(json).map_err(|err| ParseError::new("event", err))?;
        Self::from_value(value)
    }

    /// parse from an already decoded json value, checking each field on its own
    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        let Value::Object(mut obj) = value else {
            return Err(ParseError::new("event", "expected a json object"));
        };

        let mut take = |field: &'static str| {
            obj.remove(field)
                .ok_or_else(|| ParseError::new(field, "missing"))
        };

        let id = take("id")?;
        let pubkey = take("pubkey")?;
        let created_at = take("created_at")?;
        let kind = take("kind")?;
        let tags = take("tags")?;
        let content = take("content")?;
        let sig = take("sig")?;

        Ok(Event {
            id: ID::from_hex(as_str("id", &id)?).map_err(|err| ParseError::new("id", err))?,
            pubkey: PubKey::from_hex(as_str("pubkey", &pubkey)?)
                .map_err(|err| ParseError::new("pubkey", err))?,
            created_at: created_at
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Timestamp)
                .ok_or_else(|| ParseError::new("created_at", "expected an unsigned integer"))?,
            kind: kind
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .map(Kind)
                .ok_or_else(|| ParseError::new("kind", "expected an integer up to 65535"))?,
            tags: parse_tags(tags)?,
            content: match content {
                Value::String(s) => s,
                _ => return Err(ParseError::new("content", "expected a string")),
            },
            sig: Signature::from_hex(as_str("sig", &sig)?)
                .map_err(|err| ParseError::new("sig", err))?,
        })
    }

    /// serialize the event for ID computation
    pub fn serialize(&self) -> Vec<u8> {
        canonical::serialize_for_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    pub fn verify_signature(&self) -> bool {
        canonical::verify(&self.id, &self.pubkey, &self.sig)
    }

    /// full integrity check, both id and signature
    pub fn verify(&self) -> Result<(), IntegrityError> {
        let computed = canonical::hash(&self.serialize());
        if computed != self.id {
            return Err(IntegrityError::IdMismatch {
                claimed: self.id,
                computed,
            });
        }

        if !self.verify_signature() {
            return Err(IntegrityError::BadSignature(self.id));
        }

        Ok(())
    }
}

fn as_str<'a>(field: &'static str, value: &'a Value) -> Result<&'a str, ParseError> {
    value
        .as_str()
        .ok_or_else(|| ParseError::new(field, "expected a string"))
}

fn parse_tags(value: Value) -> Result<Tags, ParseError> {
    let Value::Array(items) = value else {
        return Err(ParseError::new("tags", "expected an array"));
    };

    let mut tags = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let Value::Array(elements) = item else {
            return Err(ParseError::new("tags", format!("tag {i} is not an array")));
        };

        let mut tag = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                Value::String(s) => tag.push(s),
                _ => {
                    return Err(ParseError::new(
                        "tags",
                        format!("tag {i} has a non-string element"),
                    ))
                }
            }
        }
        tags.push(tag);
    }

    Ok(Tags(tags))
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Event::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(err) => write!(f, "Event({} >> {})", self.id, err),
        }
    }
}

// events are content-addressed
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl std::hash::Hash for Event {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
