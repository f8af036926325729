use crate::{event::ParseError, Event, Filter, ID};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a json array")]
    NotAnArray,
    #[error("empty message")]
    EmptyMessage,
    #[error("invalid label")]
    InvalidLabel,
    #[error("invalid event in {label} envelope: {source}")]
    InvalidEvent {
        label: &'static str,
        #[source]
        source: ParseError,
    },
    #[error("invalid {label} envelope: {reason}")]
    Invalid { label: &'static str, reason: String },
    #[error("unknown envelope label: {0}")]
    UnknownLabel(String),
}

impl EnvelopeError {
    /// a label we don't speak, safe to ignore
    pub fn is_unknown(&self) -> bool {
        matches!(self, EnvelopeError::UnknownLabel(_))
    }

    /// a known label carrying the wrong elements
    pub fn is_protocol(&self) -> bool {
        matches!(self, EnvelopeError::Invalid { .. })
    }
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// nostr wire messages, both directions
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// relay -> client
    InEvent { subscription_id: String, event: Event },
    /// client -> relay
    OutEvent { event: Event },
    Req { subscription_id: String, filters: Vec<Filter> },
    CountAsk { subscription_id: String, filters: Vec<Filter> },
    CountReply {
        subscription_id: String,
        count: u64,
        hyperloglog: Option<Vec<u8>>,
    },
    Notice(String),
    Eose { subscription_id: String },
    Close { subscription_id: String },
    Closed { subscription_id: String, reason: String },
    Ok { event_id: ID, ok: bool, reason: String },
    AuthChallenge { challenge: String },
    AuthEvent { event: Event },
}

impl Envelope {
    /// get the label for this envelope type
    pub fn label(&self) -> &'static str {
        match self {
            Envelope::InEvent { .. } | Envelope::OutEvent { .. } => "EVENT",
            Envelope::Req { .. } => "REQ",
            Envelope::CountAsk { .. } | Envelope::CountReply { .. } => "COUNT",
            Envelope::Notice(_) => "NOTICE",
            Envelope::Eose { .. } => "EOSE",
            Envelope::Close { .. } => "CLOSE",
            Envelope::Closed { .. } => "CLOSED",
            Envelope::Ok { .. } => "OK",
            Envelope::AuthChallenge { .. } | Envelope::AuthEvent { .. } => "AUTH",
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(None)?;
        seq.serialize_element(self.label())?;
        match self {
            Envelope::InEvent {
                subscription_id,
                event,
            } => {
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(event)?;
            }
            Envelope::OutEvent { event } | Envelope::AuthEvent { event } => {
                seq.serialize_element(event)?;
            }
            Envelope::Req {
                subscription_id,
                filters,
            }
            | Envelope::CountAsk {
                subscription_id,
                filters,
            } => {
                seq.serialize_element(subscription_id)?;
                for filter in filters {
                    seq.serialize_element(filter)?;
                }
            }
            Envelope::CountReply {
                subscription_id,
                count,
                hyperloglog,
            } => {
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(&CountResult {
                    count: *count,
                    hyperloglog: hyperloglog.as_deref(),
                })?;
            }
            Envelope::Notice(message) => seq.serialize_element(message)?,
            Envelope::Eose { subscription_id } | Envelope::Close { subscription_id } => {
                seq.serialize_element(subscription_id)?;
            }
            Envelope::Closed {
                subscription_id,
                reason,
            } => {
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(reason)?;
            }
            Envelope::Ok {
                event_id,
                ok,
                reason,
            } => {
                seq.serialize_element(event_id)?;
                seq.serialize_element(ok)?;
                seq.serialize_element(reason)?;
            }
            Envelope::AuthChallenge { challenge } => seq.serialize_element(challenge)?,
        }
        seq.end()
    }
}

struct CountResult<'a> {
    count: u64,
    hyperloglog: Option<&'a [u8]>,
}

impl Serialize for CountResult<'_> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("count", &self.count)?;
        if let Some(hll) = self.hyperloglog {
            map.serialize_entry("hll", &lowercase_hex::encode(hll))?;
        }
        map.end()
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(err) => write!(f, "[\"{}\" >> {}]", self.label(), err),
        }
    }
}

impl std::str::FromStr for Envelope {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self> {
        parse_message(s)
    }
}

fn invalid(label: &'static str, reason: &str) -> EnvelopeError {
    EnvelopeError::Invalid {
        label,
        reason: reason.to_string(),
    }
}

fn string_at(arr: &[Value], index: usize, label: &'static str, what: &str) -> Result<String> {
    match arr.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(invalid(label, &format!("{what} must be a string"))),
        None => Err(invalid(label, &format!("missing {what}"))),
    }
}

fn event_at(arr: &mut [Value], index: usize, label: &'static str) -> Result<Event> {
    Event::from_value(arr[index].take())
        .map_err(|source| EnvelopeError::InvalidEvent { label, source })
}

fn filters_from(arr: &mut [Value], label: &'static str) -> Result<Vec<Filter>> {
    arr.iter_mut()
        .map(|value| {
            serde_json::from_value::<Filter>(value.take())
                .map_err(|err| invalid(label, &format!("bad filter: {err}")))
        })
        .collect()
}

/// parse a message into an envelope
pub fn parse_message(message: &str) -> Result<Envelope> {
    let Value::Array(mut arr) = serde_json::from_str::<Value>(message)? else {
        return Err(EnvelopeError::NotAnArray);
    };
    if arr.is_empty() {
        return Err(EnvelopeError::EmptyMessage);
    }

    let label = match &arr[0] {
        Value::String(label) => label.clone(),
        _ => return Err(EnvelopeError::InvalidLabel),
    };

    match label.as_str() {
        "EVENT" => match arr.len() {
            2 => Ok(Envelope::OutEvent {
                event: event_at(&mut arr, 1, "EVENT")?,
            }),
            3 => Ok(Envelope::InEvent {
                subscription_id: string_at(&arr, 1, "EVENT", "subscription id")?,
                event: event_at(&mut arr, 2, "EVENT")?,
            }),
            _ => Err(invalid("EVENT", "expected 2 or 3 elements")),
        },
        "REQ" => {
            if arr.len() < 3 {
                return Err(invalid("REQ", "expected at least one filter"));
            }
            Ok(Envelope::Req {
                subscription_id: string_at(&arr, 1, "REQ", "subscription id")?,
                filters: filters_from(&mut arr[2..], "REQ")?,
            })
        }
        "COUNT" => {
            if arr.len() < 3 {
                return Err(invalid("COUNT", "expected at least 3 elements"));
            }
            let subscription_id = string_at(&arr, 1, "COUNT", "subscription id")?;

            // a reply carries {"count": n}, a request carries filters
            let is_reply = arr.len() == 3
                && arr[2]
                    .as_object()
                    .is_some_and(|obj| obj.contains_key("count"));

            if !is_reply {
                return Ok(Envelope::CountAsk {
                    subscription_id,
                    filters: filters_from(&mut arr[2..], "COUNT")?,
                });
            }

            let count = arr[2]["count"]
                .as_u64()
                .ok_or_else(|| invalid("COUNT", "count must be an unsigned integer"))?;
            let hyperloglog = match arr[2].get("hll") {
                None => None,
                Some(Value::String(hll)) if hll.len() == 512 => Some(
                    lowercase_hex::decode(hll)
                        .map_err(|_| invalid("COUNT", "hll must be lowercase hex"))?,
                ),
                Some(_) => return Err(invalid("COUNT", "hll must be 256 bytes of hex")),
            };

            Ok(Envelope::CountReply {
                subscription_id,
                count,
                hyperloglog,
            })
        }
        "NOTICE" => Ok(Envelope::Notice(string_at(&arr, 1, "NOTICE", "message")?)),
        "EOSE" => Ok(Envelope::Eose {
            subscription_id: string_at(&arr, 1, "EOSE", "subscription id")?,
        }),
        "CLOSE" => Ok(Envelope::Close {
            subscription_id: string_at(&arr, 1, "CLOSE", "subscription id")?,
        }),
        "CLOSED" => Ok(Envelope::Closed {
            subscription_id: string_at(&arr, 1, "CLOSED", "subscription id")?,
            reason: match arr.get(2) {
                None => String::new(),
                Some(_) => string_at(&arr, 2, "CLOSED", "message")?,
            },
        }),
        "OK" => {
            let event_id = ID::from_hex(&string_at(&arr, 1, "OK", "event id")?)
                .map_err(|err| invalid("OK", &err.to_string()))?;
            let ok = match arr.get(2) {
                Some(Value::Bool(ok)) => *ok,
                _ => return Err(invalid("OK", "missing boolean status")),
            };
            let reason = match arr.get(3) {
                None => String::new(),
                Some(_) => string_at(&arr, 3, "OK", "message")?,
            };
            Ok(Envelope::Ok {
                event_id,
                ok,
                reason,
            })
        }
        "AUTH" => {
            if arr.len() < 2 {
                return Err(invalid("AUTH", "missing challenge or event"));
            }
            if arr[1].is_object() {
                Ok(Envelope::AuthEvent {
                    event: event_at(&mut arr, 1, "AUTH")?,
                })
            } else {
                Ok(Envelope::AuthChallenge {
                    challenge: string_at(&arr, 1, "AUTH", "challenge")?,
                })
            }
        }
        _ => Err(EnvelopeError::UnknownLabel(label)),
    }
}
