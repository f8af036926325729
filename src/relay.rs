use crate::{
    cache::{ConcurrentCache, EventCache, Inserted},
    envelopes::{parse_message, Envelope},
    normalize::ok_message_prefix,
    signer::SignerError,
    subscription::{CloseReason, Listener, Refusal, SubStatus, WireSubscription},
    transport::{Transport, TransportError, TransportEvent},
    Event, IntegrityError, Kind, Signer, Tags, UnsignedDraft, ID,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use url::Url;

/// a relay answered OK false (or CLOSED) with this message
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("[{relay}] rejected: {message}")]
pub struct RelayRejection {
    pub relay: Url,
    pub message: String,
}

impl RelayRejection {
    /// the machine-readable part, like `"rate-limited"` or `"blocked"`
    pub fn prefix(&self) -> Option<&str> {
        ok_message_prefix(&self.message)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Rejected(#[from] RelayRejection),

    #[error("failed to send: {0}")]
    Transport(#[from] TransportError),

    #[error("relay connection was lost before it answered")]
    ConnectionLost,

    #[error("relay is not attached")]
    NotAttached,

    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("relay hasn't sent an AUTH challenge")]
    NoChallenge,

    #[error("signer: {0}")]
    Signer(#[from] SignerError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// what went wrong (and how often) with the frames a relay sent us
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub parse_errors: u64,
    pub protocol_errors: u64,
    pub integrity_failures: u64,
    pub unknown_messages: u64,
    pub filter_rejections: u64,
    pub duplicates: u64,
    pub late_frames: u64,
}

impl std::ops::AddAssign for RelayStats {
    fn add_assign(&mut self, other: Self) {
        self.parse_errors += other.parse_errors;
        self.protocol_errors += other.protocol_errors;
        self.integrity_failures += other.integrity_failures;
        self.unknown_messages += other.unknown_messages;
        self.filter_rejections += other.filter_rejections;
        self.duplicates += other.duplicates;
        self.late_frames += other.late_frames;
    }
}

#[derive(Debug, Default)]
struct StatCounters {
    parse_errors: AtomicU64,
    protocol_errors: AtomicU64,
    integrity_failures: AtomicU64,
    unknown_messages: AtomicU64,
    filter_rejections: AtomicU64,
    duplicates: AtomicU64,
    late_frames: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> RelayStats {
        RelayStats {
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            unknown_messages: self.unknown_messages.load(Ordering::Relaxed),
            filter_rejections: self.filter_rejections.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            late_frames: self.late_frames.load(Ordering::Relaxed),
        }
    }
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// one attached relay: its transport, the worker reading its frames and the wire
/// subscriptions open on it. clones share everything
#[derive(Clone)]
pub struct Relay {
    pub url: Url,
    transport: Arc<dyn Transport>,
    cache: EventCache,
    verify_signatures: bool,

    // by connection
    attached: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    challenge: Arc<RwLock<Option<String>>>,
    stats: Arc<StatCounters>,

    // by subscription
    subscriptions: Arc<ConcurrentCache<String, Arc<Mutex<WireSubscription>>>>,

    // by publish
    ok_callbacks: Arc<ConcurrentCache<ID, oneshot::Sender<Result<(), String>>>>,
}

impl Relay {
    /// start processing `inbound` in a task of its own. `on_close` fires when the transport
    /// reports the connection closed, not when we detach
    pub(crate) fn attach(
        url: Url,
        transport: Arc<dyn Transport>,
        mut inbound: mpsc::Receiver<TransportEvent>,
        cache: EventCache,
        verify_signatures: bool,
        on_close: Option<oneshot::Sender<Option<String>>>,
    ) -> Self {
        let relay = Self {
            url,
            transport,
            cache,
            verify_signatures,
            attached: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
            challenge: Arc::new(RwLock::new(None)),
            stats: Arc::new(StatCounters::default()),
            subscriptions: Arc::new(ConcurrentCache::new()),
            ok_callbacks: Arc::new(ConcurrentCache::new()),
        };

        let worker = relay.clone();
        tokio::spawn(async move {
            let reason = loop {
                let next = tokio::select! {
                    _ = worker.shutdown.notified() => return,
                    next = inbound.recv() => next,
                };

                match next {
                    Some(TransportEvent::Frame(frame)) => worker.handle_frame(&frame).await,
                    Some(TransportEvent::Closed(reason)) => break reason,
                    None => break None,
                }
            };

            worker.disconnect(reason.clone()).await;
            if let Some(on_close) = on_close {
                let _ = on_close.send(reason);
            }
        });

        relay
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.snapshot()
    }

    /// the last AUTH challenge this relay sent
    pub async fn challenge(&self) -> Option<String> {
        self.challenge.read().await.clone()
    }

    pub(crate) fn same_connection(&self, other: &Relay) -> bool {
        Arc::ptr_eq(&self.attached, &other.attached)
    }

    /// send an event and wait for the relay's OK
    pub async fn publish(&self, event: Event) -> Result<(), PublishError> {
        let id = event.id;
        self.send_and_wait_ok(id, Envelope::OutEvent { event }).await
    }

    /// NIP-42: sign a kind 22242 event for the last challenge and send it with AUTH
    pub async fn authenticate(&self, signer: &(impl Signer + ?Sized)) -> Result<(), AuthError> {
        let challenge = self.challenge().await.ok_or(AuthError::NoChallenge)?;

        let event = UnsignedDraft::new(
            signer,
            Kind::CLIENT_AUTH,
            Tags(vec![
                vec!["relay".to_string(), self.url.to_string()],
                vec!["challenge".to_string(), challenge],
            ]),
            String::new(),
        )
        .finalize(signer)?;

        let id = event.id;
        self.send_and_wait_ok(id, Envelope::AuthEvent { event }).await?;
        Ok(())
    }

    async fn send_and_wait_ok(&self, id: ID, envelope: Envelope) -> Result<(), PublishError> {
        if !self.is_attached() {
            return Err(PublishError::NotAttached);
        }

        let (tx, rx) = oneshot::channel();
        self.ok_callbacks.put(id, tx);
        if !self.is_attached() {
            self.ok_callbacks.remove(&id);
            return Err(PublishError::ConnectionLost);
        }

        if let Err(err) = self.transport.send(envelope.to_string()) {
            self.ok_callbacks.remove(&id);
            return Err(err.into());
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(RelayRejection {
                relay: self.url.clone(),
                message,
            }
            .into()),
            Err(_) => Err(PublishError::ConnectionLost),
        }
    }

    fn send(&self, envelope: Envelope) {
        if let Err(err) = self.transport.send(envelope.to_string()) {
            log::warn!(
                "[{}] failed to send {}: {}",
                self.url.as_str(),
                envelope.label(),
                err
            );
        }
    }

    /// add `listener` to its wire subscription here, sending a REQ if needed.
    /// false if this relay is gone
    pub(crate) async fn join(&self, listener: &Arc<Listener>, watermark: bool) -> bool {
        loop {
            if !self.is_attached() {
                return false;
            }

            let entry = self.subscriptions.get_or_create(listener.sub_id.clone(), || {
                Arc::new(Mutex::new(WireSubscription::new(listener.sub_id.clone())))
            });

            let mut wire = entry.lock().await;
            if wire.status == SubStatus::Closed {
                // it was closed and removed while we waited, go again for a fresh one
                continue;
            }

            let newcomer = !wire.has_member(listener.key);
            let req = wire.join(listener.clone(), &self.cache, watermark);
            // joined a REQ that is already past its stored events
            let caught_up = req.is_none() && newcomer && wire.status == SubStatus::Eosed;
            drop(wire);

            if let Some(req) = req {
                self.send(req);
            }
            if caught_up {
                listener.relay_eosed(&self.url).await;
            }
            return true;
        }
    }

    pub(crate) async fn leave(&self, listener: &Listener) {
        let Some(entry) = self.subscriptions.get(&listener.sub_id) else {
            return;
        };

        let mut wire = entry.lock().await;
        match wire.leave(listener.key, &self.cache) {
            Some(close @ Envelope::Close { .. }) => {
                self.subscriptions.remove(&wire.id);
                self.cache.clear_counters(&wire.id);
                // we don't wait for the relay to acknowledge this
                self.send(close);
            }
            Some(req) => self.send(req),
            None => {}
        }
    }

    pub(crate) async fn invalidate(&self, listener: &Arc<Listener>) {
        match self.subscriptions.get(&listener.sub_id) {
            Some(entry) => {
                if let Some(req) = entry.lock().await.invalidate(&self.cache) {
                    self.send(req);
                }
            }
            // closed by the relay at some point, ask again
            None => {
                self.join(listener, true).await;
            }
        }
    }

    /// mark everything here as closed. returns false if that had happened already
    pub(crate) async fn disconnect(&self, reason: Option<String>) -> bool {
        if !self.attached.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.notify_one();

        log::info!(
            "[{}] relay connection closed: {}",
            self.url.as_str(),
            reason.as_deref().unwrap_or("no reason")
        );

        // dropping the senders fails whoever is waiting for an OK
        self.ok_callbacks.retain(|_, _| false);

        for entry in self.subscriptions.filter_values(|_, _| true) {
            let members = {
                let mut wire = entry.lock().await;
                self.subscriptions.remove(&wire.id);
                wire.close()
            };
            for listener in members {
                listener
                    .relay_closed(&self.url, CloseReason::ConnectionLost(reason.clone()))
                    .await;
            }
        }

        true
    }

    async fn handle_frame(&self, frame: &str) {
        let envelope = match parse_message(frame) {
            Ok(envelope) => envelope,
            Err(err) if err.is_unknown() => {
                bump(&self.stats.unknown_messages);
                log::debug!("[{}] {}", self.url.as_str(), err);
                return;
            }
            Err(err) if err.is_protocol() => {
                bump(&self.stats.protocol_errors);
                log::info!("[{}] bad message: {}", self.url.as_str(), err);
                return;
            }
            Err(err) => {
                bump(&self.stats.parse_errors);
                log::info!("[{}] wrong message: {}", self.url.as_str(), err);
                return;
            }
        };

        // detached while we were parsing
        if !self.is_attached() {
            bump(&self.stats.late_frames);
            return;
        }

        match envelope {
            Envelope::InEvent {
                subscription_id,
                event,
            } => self.handle_event(subscription_id, event).await,
            Envelope::Eose { subscription_id } => {
                let Some(entry) = self.subscriptions.get(&subscription_id) else {
                    bump(&self.stats.late_frames);
                    return;
                };

                let members = entry.lock().await.eose();
                match members {
                    Some(members) => {
                        for listener in members {
                            listener.relay_eosed(&self.url).await;
                        }
                    }
                    None => bump(&self.stats.late_frames),
                }
            }
            Envelope::Closed {
                subscription_id,
                reason,
            } => {
                let Some(entry) = self.subscriptions.get(&subscription_id) else {
                    bump(&self.stats.late_frames);
                    return;
                };

                log::info!(
                    "[{}] subscription {} closed by relay: {}",
                    self.url.as_str(),
                    subscription_id,
                    reason
                );

                let members = {
                    let mut wire = entry.lock().await;
                    self.subscriptions.remove(&wire.id);
                    wire.close()
                };
                for listener in members {
                    listener
                        .relay_closed(&self.url, CloseReason::ClosedByRelay(reason.clone()))
                        .await;
                }
            }
            Envelope::Ok {
                event_id,
                ok,
                reason,
            } => match self.ok_callbacks.remove(&event_id) {
                Some(sender) => {
                    let _ = sender.send(if ok { Ok(()) } else { Err(reason) });
                }
                None => {
                    log::info!(
                        "[{}] received OK for unknown event {}: {} - {}",
                        self.url.as_str(),
                        event_id,
                        ok,
                        reason
                    );
                }
            },
            Envelope::Notice(notice) => {
                log::info!("[{}] received notice: {}", self.url.as_str(), notice);
            }
            Envelope::AuthChallenge { challenge } => {
                let _ = self.challenge.write().await.insert(challenge);
            }
            Envelope::CountReply {
                subscription_id,
                count,
                ..
            } => {
                log::debug!(
                    "[{}] ignoring COUNT reply for {}: {}",
                    self.url.as_str(),
                    subscription_id,
                    count
                );
            }
            envelope => {
                // messages only a client sends
                bump(&self.stats.protocol_errors);
                log::info!(
                    "[{}] unexpected message: {}",
                    self.url.as_str(),
                    envelope.label()
                );
            }
        }
    }

    async fn handle_event(&self, subscription_id: String, event: Event) {
        let Some(entry) = self.subscriptions.get(&subscription_id) else {
            bump(&self.stats.late_frames);
            log::debug!(
                "[{}] event for unknown subscription {}",
                self.url.as_str(),
                subscription_id
            );
            return;
        };

        // an id we have already checked doesn't need its signature checked again, and we
        // keep using the instance we have
        let cached = self.cache.get(&event.id);
        if cached.is_none() && self.verify_signatures {
            if let Err(err) = event.verify() {
                bump(&self.stats.integrity_failures);
                log::warn!("[{}] {}", self.url.as_str(), err);
                return;
            }
        }

        let accepted = entry
            .lock()
            .await
            .accept(cached.as_deref().unwrap_or(&event));
        let recipients = match accepted {
            Ok(recipients) => recipients,
            Err(Refusal::Closed) => {
                bump(&self.stats.late_frames);
                return;
            }
            Err(Refusal::OutsideFilters) => {
                bump(&self.stats.filter_rejections);
                log::debug!(
                    "[{}] event {} doesn't match {}",
                    self.url.as_str(),
                    event.id,
                    subscription_id
                );
                return;
            }
        };

        let stored = match cached {
            Some(cached) => {
                bump(&self.stats.duplicates);
                cached
            }
            None => match self.cache.insert(event) {
                Inserted::New(stored) => stored,
                Inserted::Duplicate(stored) => {
                    bump(&self.stats.duplicates);
                    stored
                }
            },
        };

        self.cache.bump_counter(&subscription_id, stored.kind);
        for listener in recipients {
            listener.deliver(&stored, &self.url).await;
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("url", &self.url.as_str())
            .field("attached", &self.is_attached())
            .field("subscriptions", &self.subscriptions.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl std::fmt::Display for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<relay url={}>", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SecretKey, Timestamp};
    use std::time::Duration;

    struct Wire {
        relay: Relay,
        outbound: mpsc::UnboundedReceiver<String>,
        inbound: mpsc::Sender<TransportEvent>,
    }

    impl Wire {
        fn new() -> Self {
            let (out_tx, outbound) = mpsc::unbounded_channel();
            let (inbound, in_rx) = mpsc::channel(16);
            let relay = Relay::attach(
                "wss://relay.example.com".parse().unwrap(),
                Arc::new(out_tx),
                in_rx,
                EventCache::new(),
                true,
                None,
            );
            Self {
                relay,
                outbound,
                inbound,
            }
        }

        async fn push(&self, frame: &str) {
            self.inbound
                .send(TransportEvent::Frame(frame.to_string()))
                .await
                .unwrap();
        }

        async fn next_sent(&mut self) -> Envelope {
            let frame = tokio::time::timeout(Duration::from_secs(1), self.outbound.recv())
                .await
                .unwrap()
                .unwrap();
            parse_message(&frame).unwrap()
        }

        /// frames are handled in order, so once this one is answered all before it were too
        async fn settle(&mut self, sk: &SecretKey) {
            let event = UnsignedDraft::new(sk, Kind(1), Tags::default(), String::new())
                .finalize(sk)
                .unwrap();
            let relay = self.relay.clone();
            let publish = tokio::spawn(async move { relay.publish(event).await });
            let Envelope::OutEvent { event } = self.next_sent().await else {
                panic!("expected an EVENT");
            };
            let ok = Envelope::Ok {
                event_id: event.id,
                ok: true,
                reason: String::new(),
            };
            self.push(&ok.to_string()).await;
            publish.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_publish_ok_false_keeps_connection() {
        let sk = SecretKey::generate();
        let mut wire = Wire::new();
        let event = UnsignedDraft::new(&sk, Kind(1), Tags::default(), "hello".to_string())
            .finalize(&sk)
            .unwrap();

        let relay = wire.relay.clone();
        let publish = tokio::spawn({
            let event = event.clone();
            async move { relay.publish(event).await }
        });

        assert_eq!(
            wire.next_sent().await,
            Envelope::OutEvent {
                event: event.clone()
            }
        );
        wire.push(&format!(
            "[\"OK\",\"{}\",false,\"rate-limited: slow down\"]",
            event.id.to_hex()
        ))
        .await;

        match publish.await.unwrap() {
            Err(PublishError::Rejected(rejection)) => {
                assert_eq!(rejection.relay, wire.relay.url);
                assert_eq!(rejection.message, "rate-limited: slow down");
                assert_eq!(rejection.prefix(), Some("rate-limited"));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(wire.relay.is_attached());
        wire.settle(&sk).await;
    }

    #[tokio::test]
    async fn test_frame_errors_are_counted() {
        let sk = SecretKey::generate();
        let mut wire = Wire::new();

        wire.push("not json").await;
        wire.push("{\"EVENT\":1}").await;
        wire.push("[\"EOSE\"]").await;
        wire.push("[\"WHATEVER\",\"x\"]").await;
        wire.push("[\"REQ\",\"x\",{}]").await;
        wire.push("[\"EOSE\",\"nobody\"]").await;
        wire.push("[\"NOTICE\",\"hi\"]").await;
        wire.push("[\"COUNT\",\"x\",{\"count\":3}]").await;
        wire.settle(&sk).await;

        let stats = wire.relay.stats();
        assert_eq!(stats.parse_errors, 2);
        assert_eq!(stats.protocol_errors, 2);
        assert_eq!(stats.unknown_messages, 1);
        assert_eq!(stats.late_frames, 1);
        assert!(wire.relay.is_attached());
    }

    #[tokio::test]
    async fn test_authenticate() {
        let sk = SecretKey::generate();
        let mut wire = Wire::new();

        assert!(matches!(
            wire.relay.authenticate(&sk).await,
            Err(AuthError::NoChallenge)
        ));

        wire.push("[\"AUTH\",\"challenge-123\"]").await;
        wire.settle(&sk).await;
        assert_eq!(wire.relay.challenge().await.as_deref(), Some("challenge-123"));

        let relay = wire.relay.clone();
        let auth_sk = sk;
        let auth = tokio::spawn(async move { relay.authenticate(&auth_sk).await });

        let Envelope::AuthEvent { event } = wire.next_sent().await else {
            panic!("expected AUTH");
        };
        assert_eq!(event.kind, Kind::CLIENT_AUTH);
        assert_eq!(event.pubkey, sk.pubkey());
        assert!(event.verify().is_ok());
        assert_eq!(
            event.tags.find("challenge").map(|t| t[1].as_str()),
            Some("challenge-123")
        );
        assert_eq!(
            event.tags.find("relay").map(|t| t[1].as_str()),
            Some("wss://relay.example.com/")
        );
        assert!(event.created_at <= Timestamp::now());

        let ok = Envelope::Ok {
            event_id: event.id,
            ok: true,
            reason: String::new(),
        };
        wire.push(&ok.to_string()).await;
        auth.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_publish() {
        let sk = SecretKey::generate();
        let mut wire = Wire::new();
        let event = UnsignedDraft::new(&sk, Kind(1), Tags::default(), String::new())
            .finalize(&sk)
            .unwrap();

        let relay = wire.relay.clone();
        let publish = tokio::spawn(async move { relay.publish(event).await });
        wire.next_sent().await;

        wire.inbound
            .send(TransportEvent::Closed(Some("gone".into())))
            .await
            .unwrap();

        assert!(matches!(
            publish.await.unwrap(),
            Err(PublishError::ConnectionLost)
        ));
        assert!(!wire.relay.is_attached());

        let late = UnsignedDraft::new(&sk, Kind(1), Tags::default(), String::new())
            .finalize(&sk)
            .unwrap();
        assert!(matches!(
            wire.relay.publish(late).await,
            Err(PublishError::NotAttached)
        ));
    }
}
