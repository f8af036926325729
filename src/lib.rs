//! # ritual-engine
//!
//! a client-side nostr engine
//!
//! this library signs and verifies content-addressed events, speaks the JSON relay protocol
//! with any number of untrusted relays and keeps live, filter-scoped subscriptions against a
//! concurrent in-memory event index. it never opens sockets itself: each relay is attached
//! with a [`Transport`] for outbound frames and a channel of [`TransportEvent`]s for inbound
//! ones.

pub mod cache;
pub mod canonical;
pub mod envelopes;
pub mod event;
pub mod filter;
pub mod keys;
pub mod timestamp;
pub mod transport;

mod draft;
mod normalize;
mod pool;
mod relay;
mod signer;
mod subscription;
mod tags;
mod types;

// re-export commonly used types
pub use cache::{ConcurrentCache, EventCache, Inserted};
pub use draft::UnsignedDraft;
pub use envelopes::{parse_message, Envelope, EnvelopeError};
pub use event::{Event, IntegrityError, ParseError};
pub use filter::{Filter, TagQuery};
pub use keys::{PubKey, SecretKey};
pub use normalize::*;
pub use pool::{AttachError, Pool, PoolOptions, PublishResult};
pub use relay::{AuthError, PublishError, Relay, RelayRejection, RelayStats};
pub use signer::{Signer, SignerError};
pub use subscription::{CloseReason, Occurrence, SubStatus, Subscription, SubscriptionOptions};
pub use tags::{Tag, Tags};
pub use timestamp::Timestamp;
pub use transport::{Transport, TransportError, TransportEvent};
pub use types::*;
