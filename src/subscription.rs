use crate::{
    cache::{ConcurrentCache, EventCache},
    envelopes::Envelope,
    filter, Event, Filter, Pool, Timestamp, ID,
};
use futures::Stream;
use slotmap::{new_key_type, Key};
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::sync::mpsc;
use url::Url;

new_key_type! { pub(crate) struct ListenerKey; }

/// where a wire subscription stands on one relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubStatus {
    /// REQ sent, nothing back yet
    Pending,
    /// stored events are arriving
    Streaming,
    /// past the stored events, only live ones from now on
    Eosed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// the relay sent CLOSED with this message
    ClosedByRelay(String),
    /// the connection went away, with whatever reason the transport had
    ConnectionLost(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Occurrence {
    /// `relay` is `None` for events replayed from the local cache
    Event {
        event: Arc<Event>,
        relay: Option<Url>,
    },
    Eose(Url),
    /// every targeted relay has sent EOSE or closed, emitted once
    AllEose,
    Closed(Url, CloseReason),
}

#[derive(Debug, Default, Clone)]
pub struct SubscriptionOptions {
    /// ends up in the subscription id, for debugging
    pub label: Option<String>,
    /// subscriptions in the same group share a single REQ on each relay, with the union of
    /// their filters. `label` is ignored for grouped subscriptions
    pub group: Option<String>,
}

pub(crate) fn subscription_id(
    key: ListenerKey,
    prefix: &str,
    options: &SubscriptionOptions,
) -> String {
    if let Some(group) = &options.group {
        return format!("{}{}", prefix, group);
    }

    let n = key.data().as_ffi();
    match &options.label {
        Some(label) => format!("{}{:x}:{}", prefix, n, label),
        None => format!("{}{:x}", prefix, n),
    }
}

/// one caller subscription, possibly spread over many relays
#[derive(Debug)]
pub(crate) struct Listener {
    pub(crate) key: ListenerKey,
    pub(crate) sub_id: String,
    pub(crate) filters: Vec<Filter>,
    pub(crate) relays: Vec<Url>,
    sender: mpsc::Sender<Occurrence>,
    closed: AtomicBool,
    /// delivered ids with their `created_at`
    seen: ConcurrentCache<ID, Timestamp>,
    /// relays done with stored events for us
    finished: ConcurrentCache<Url, ()>,
    all_eose_sent: AtomicBool,
}

impl Listener {
    pub(crate) fn new(
        key: ListenerKey,
        sub_id: String,
        filters: Vec<Filter>,
        relays: Vec<Url>,
        sender: mpsc::Sender<Occurrence>,
    ) -> Self {
        Self {
            key,
            sub_id,
            filters,
            relays,
            sender,
            closed: AtomicBool::new(false),
            seen: ConcurrentCache::new(),
            finished: ConcurrentCache::new(),
            all_eose_sent: AtomicBool::new(false),
        }
    }

    pub(crate) fn targets(&self, relay: &Url) -> bool {
        self.relays.contains(relay)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// returns false if it was closed already
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// queue a cached event before anyone is reading, the channel must have room for it
    pub(crate) fn preload(&self, event: Arc<Event>) {
        if self.mark_seen(&event) {
            let _ = self.sender.try_send(Occurrence::Event { event, relay: None });
        }
    }

    pub(crate) async fn deliver(&self, event: &Arc<Event>, relay: &Url) {
        if !self.filters.iter().any(|filter| filter.matches(event)) {
            return;
        }

        // the same event coming from a second relay (or from the cache) is not repeated
        if !self.mark_seen(event) {
            return;
        }

        self.emit(Occurrence::Event {
            event: event.clone(),
            relay: Some(relay.clone()),
        })
        .await;
    }

    pub(crate) async fn relay_eosed(&self, relay: &Url) {
        self.emit(Occurrence::Eose(relay.clone())).await;
        self.finish(relay).await;
    }

    pub(crate) async fn relay_closed(&self, relay: &Url, reason: CloseReason) {
        self.emit(Occurrence::Closed(relay.clone(), reason)).await;
        self.finish(relay).await;
    }

    /// `relay` won't send stored events for this listener anymore
    pub(crate) async fn finish(&self, relay: &Url) {
        self.finished.put(relay.clone(), ());
        self.check_all_eose().await;
    }

    pub(crate) async fn check_all_eose(&self) {
        if !self
            .relays
            .iter()
            .all(|relay| self.finished.contains_key(relay))
        {
            return;
        }

        self.prune_seen();
        if !self.all_eose_sent.swap(true, Ordering::SeqCst) {
            self.emit(Occurrence::AllEose).await;
        }
    }

    /// false if this id was delivered already
    fn mark_seen(&self, event: &Event) -> bool {
        self.seen.put(event.id, event.created_at).is_none()
    }

    /// stored events are done everywhere, only ids at the newest second can still come back
    /// (a watermarked REQ asks for that second again), older ones are forgotten
    fn prune_seen(&self) {
        let newest = self.seen.fold(None, |newest: Option<Timestamp>, _, created_at| {
            Some(newest.map_or(*created_at, |n| n.max(*created_at)))
        });
        if let Some(newest) = newest {
            self.seen.retain(|_, created_at| *created_at >= newest);
        }
    }

    async fn emit(&self, occurrence: Occurrence) {
        if self.is_closed() {
            return;
        }
        // a dropped receiver is handled by the Subscription's Drop
        let _ = self.sender.send(occurrence).await;
    }
}

/// why an inbound event was not accepted on a wire subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refusal {
    Closed,
    OutsideFilters,
}

/// the REQ we hold open on a single relay under one subscription id, shared by all its members
#[derive(Debug)]
pub(crate) struct WireSubscription {
    pub(crate) id: String,
    pub(crate) status: SubStatus,
    /// what the relay was last asked for, empty until the first REQ
    pub(crate) filters: Vec<Filter>,
    members: Vec<Arc<Listener>>,
}

impl WireSubscription {
    pub(crate) fn new(id: String) -> Self {
        Self {
            id,
            status: SubStatus::Pending,
            filters: Vec::new(),
            members: Vec::with_capacity(1),
        }
    }

    pub(crate) fn has_member(&self, key: ListenerKey) -> bool {
        self.members.iter().any(|m| m.key == key)
    }

    /// add a member, returning the REQ to send if what the relay holds no longer covers it
    pub(crate) fn join(
        &mut self,
        listener: Arc<Listener>,
        cache: &EventCache,
        watermark: bool,
    ) -> Option<Envelope> {
        if !self.has_member(listener.key) {
            self.members.push(listener);
        }
        self.sync(cache, watermark)
    }

    /// remove a member. when it was the last one we are closed and return the CLOSE,
    /// otherwise maybe a REQ for what the remaining members need
    pub(crate) fn leave(&mut self, key: ListenerKey, cache: &EventCache) -> Option<Envelope> {
        let before = self.members.len();
        self.members.retain(|m| m.key != key);
        if self.members.len() == before {
            return None;
        }

        if self.members.is_empty() {
            self.status = SubStatus::Closed;
            return Some(Envelope::Close {
                subscription_id: self.id.clone(),
            });
        }

        self.sync(cache, false)
    }

    /// recompute the filters with watermarks, returning the REQ if it must be sent again
    pub(crate) fn invalidate(&mut self, cache: &EventCache) -> Option<Envelope> {
        self.sync(cache, true)
    }

    pub(crate) fn accept(&mut self, event: &Event) -> Result<Vec<Arc<Listener>>, Refusal> {
        if self.status == SubStatus::Closed {
            return Err(Refusal::Closed);
        }

        if !self.filters.iter().any(|filter| filter.matches(event)) {
            return Err(Refusal::OutsideFilters);
        }

        if self.status == SubStatus::Pending {
            self.status = SubStatus::Streaming;
        }

        Ok(self.members.clone())
    }

    /// `None` if we were closed already
    pub(crate) fn eose(&mut self) -> Option<Vec<Arc<Listener>>> {
        if self.status == SubStatus::Closed {
            return None;
        }

        self.status = SubStatus::Eosed;
        Some(self.members.clone())
    }

    /// closed from the other side (CLOSED or connection loss), returns who to tell
    pub(crate) fn close(&mut self) -> Vec<Arc<Listener>> {
        self.status = SubStatus::Closed;
        self.members.clone()
    }

    fn req(&self) -> Envelope {
        Envelope::Req {
            subscription_id: self.id.clone(),
            filters: self.filters.clone(),
        }
    }

    fn desired_filters(&self, cache: &EventCache, watermark: bool) -> Vec<Filter> {
        let all: Vec<Filter> = self
            .members
            .iter()
            .flat_map(|m| m.filters.iter().cloned())
            .collect();

        let mut filters = filter::union(&all);
        if watermark {
            for filter in filters.iter_mut() {
                if let Some(latest) = cache.latest_created_at(filter) {
                    if filter.since.map_or(true, |since| since < latest) {
                        filter.since = Some(latest);
                    }
                }
            }
        }
        filters
    }

    fn sync(&mut self, cache: &EventCache, watermark: bool) -> Option<Envelope> {
        if self.status == SubStatus::Closed {
            return None;
        }

        let desired = self.desired_filters(cache, watermark);
        if desired.is_empty() || !self.needs_resend(&desired, watermark) {
            return None;
        }

        self.filters = desired;
        self.status = SubStatus::Pending;
        Some(self.req())
    }

    fn needs_resend(&self, desired: &[Filter], watermark: bool) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        if self.filters.len() != desired.len() {
            return true;
        }

        let only_since = self
            .filters
            .iter()
            .zip(desired)
            .all(|(sent, wanted)| sent.same_except_since(wanted));
        if !only_since {
            return true;
        }

        if self.filters.as_slice() == desired {
            return false;
        }

        // a moved watermark is only worth a new REQ while stored events are still coming
        watermark && self.status != SubStatus::Eosed
    }
}

/// the caller's end of a subscription: a stream of [`Occurrence`]s.
///
/// dropping it is the same as calling [`Subscription::close`]
pub struct Subscription {
    pub(crate) listener: Arc<Listener>,
    receiver: mpsc::Receiver<Occurrence>,
    pool: Pool,
}

impl Subscription {
    pub(crate) fn new(
        listener: Arc<Listener>,
        receiver: mpsc::Receiver<Occurrence>,
        pool: Pool,
    ) -> Self {
        Self {
            listener,
            receiver,
            pool,
        }
    }

    /// the subscription id used on the wire
    pub fn id(&self) -> &str {
        &self.listener.sub_id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.listener.filters
    }

    pub fn relays(&self) -> &[Url] {
        &self.listener.relays
    }

    /// `None` once closed
    pub async fn recv(&mut self) -> Option<Occurrence> {
        if self.listener.is_closed() {
            return None;
        }

        let occurrence = self.receiver.recv().await;
        if self.listener.is_closed() {
            None
        } else {
            occurrence
        }
    }

    /// ask the relays again from the latest cached events on, see [`Pool::invalidate`]
    pub async fn invalidate(&self) {
        self.pool.invalidate(self).await;
    }

    /// nothing is received after this returns
    pub async fn close(&mut self) {
        self.receiver.close();
        self.pool.close_listener(&self.listener).await;
    }
}

impl Stream for Subscription {
    type Item = Occurrence;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.listener.is_closed() {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.listener.is_closed() {
            return;
        }

        // when the caller stops listening we close it on the relays
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                let listener = self.listener.clone();
                handle.spawn(async move {
                    pool.close_listener(&listener).await;
                });
            }
            Err(_) => {
                self.listener.close();
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.listener.sub_id)
            .field("filters", &self.listener.filters)
            .field("relays", &self.listener.relays)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kind, SecretKey, Tags, Timestamp, UnsignedDraft};
    use slotmap::SlotMap;

    fn listener(
        keys: &mut SlotMap<ListenerKey, ()>,
        filters: Vec<Filter>,
    ) -> (Arc<Listener>, mpsc::Receiver<Occurrence>) {
        let (tx, rx) = mpsc::channel(16);
        let key = keys.insert(());
        let relay: Url = "wss://relay.example.com".parse().unwrap();
        (
            Arc::new(Listener::new(key, "s".into(), filters, vec![relay], tx)),
            rx,
        )
    }

    fn kinds(kinds: &[u16]) -> Filter {
        Filter {
            kinds: Some(kinds.iter().map(|k| Kind(*k)).collect()),
            ..Default::default()
        }
    }

    fn event(sk: &SecretKey, kind: u16, created_at: u32) -> Event {
        UnsignedDraft {
            pubkey: sk.pubkey(),
            created_at: Timestamp(created_at),
            kind: Kind(kind),
            tags: Tags::default(),
            content: String::new(),
        }
        .finalize(sk)
        .unwrap()
    }

    #[test]
    fn test_subscription_ids() {
        let mut keys: SlotMap<ListenerKey, ()> = SlotMap::with_key();
        let key = keys.insert(());

        let plain = subscription_id(key, "app:", &SubscriptionOptions::default());
        assert!(plain.starts_with("app:"));

        let labeled = subscription_id(
            key,
            "",
            &SubscriptionOptions {
                label: Some("feed".into()),
                group: None,
            },
        );
        assert!(labeled.ends_with(":feed"));

        let grouped = subscription_id(
            key,
            "app:",
            &SubscriptionOptions {
                label: Some("ignored".into()),
                group: Some("home".into()),
            },
        );
        assert_eq!(grouped, "app:home");
    }

    #[test]
    fn test_join_batches_filters() {
        let cache = EventCache::new();
        let mut keys = SlotMap::with_key();
        let (a, _ra) = listener(&mut keys, vec![kinds(&[1])]);
        let (b, _rb) = listener(&mut keys, vec![kinds(&[1])]);
        let (c, _rc) = listener(&mut keys, vec![kinds(&[7])]);

        let mut wire = WireSubscription::new("s".into());
        let first = wire.join(a.clone(), &cache, false);
        assert!(matches!(first, Some(Envelope::Req { ref filters, .. }) if filters == &vec![kinds(&[1])]));
        assert_eq!(wire.status, SubStatus::Pending);

        // same filters, the relay already has what b needs
        assert_eq!(wire.join(b.clone(), &cache, false), None);

        let third = wire.join(c.clone(), &cache, false);
        assert_eq!(
            third,
            Some(Envelope::Req {
                subscription_id: "s".into(),
                filters: vec![kinds(&[1, 7])],
            })
        );

        // joining twice changes nothing
        assert_eq!(wire.join(c, &cache, false), None);
        assert_eq!(wire.members.len(), 3);
    }

    #[test]
    fn test_accept_and_transitions() {
        let sk = SecretKey::generate();
        let cache = EventCache::new();
        let mut keys = SlotMap::with_key();
        let (a, _ra) = listener(&mut keys, vec![kinds(&[1])]);

        let mut wire = WireSubscription::new("s".into());
        wire.join(a, &cache, false);

        assert_eq!(
            wire.accept(&event(&sk, 2, 10)).unwrap_err(),
            Refusal::OutsideFilters
        );
        assert_eq!(wire.status, SubStatus::Pending);

        assert_eq!(wire.accept(&event(&sk, 1, 10)).unwrap().len(), 1);
        assert_eq!(wire.status, SubStatus::Streaming);

        assert!(wire.eose().is_some());
        assert_eq!(wire.status, SubStatus::Eosed);

        // live events don't move us back
        wire.accept(&event(&sk, 1, 11)).unwrap();
        assert_eq!(wire.status, SubStatus::Eosed);

        assert_eq!(wire.close().len(), 1);
        assert_eq!(
            wire.accept(&event(&sk, 1, 12)).unwrap_err(),
            Refusal::Closed
        );
        assert!(wire.eose().is_none());
    }

    #[test]
    fn test_invalidate_watermark() {
        let sk = SecretKey::generate();
        let cache = EventCache::new();
        let mut keys = SlotMap::with_key();
        let (a, _ra) = listener(&mut keys, vec![kinds(&[1])]);

        let mut wire = WireSubscription::new("s".into());
        wire.join(a, &cache, false);

        // nothing cached yet, nothing changes
        assert_eq!(wire.invalidate(&cache), None);

        cache.insert(event(&sk, 1, 500));
        cache.insert(event(&sk, 2, 900));
        wire.accept(&event(&sk, 1, 500)).unwrap();

        let req = wire.invalidate(&cache);
        assert_eq!(
            req,
            Some(Envelope::Req {
                subscription_id: "s".into(),
                filters: vec![Filter {
                    since: Some(Timestamp(500)),
                    ..kinds(&[1])
                }],
            })
        );
        assert_eq!(wire.status, SubStatus::Pending);

        wire.eose();
        cache.insert(event(&sk, 1, 600));
        // only since moved and the relay is already live
        assert_eq!(wire.invalidate(&cache), None);
        assert_eq!(wire.filters[0].since, Some(Timestamp(500)));
    }

    #[test]
    fn test_leave() {
        let cache = EventCache::new();
        let mut keys = SlotMap::with_key();
        let (a, _ra) = listener(&mut keys, vec![kinds(&[1])]);
        let (b, _rb) = listener(&mut keys, vec![kinds(&[7])]);

        let mut wire = WireSubscription::new("s".into());
        wire.join(a.clone(), &cache, false);
        wire.join(b.clone(), &cache, false);

        assert_eq!(
            wire.leave(a.key, &cache),
            Some(Envelope::Req {
                subscription_id: "s".into(),
                filters: vec![kinds(&[7])],
            })
        );
        assert_eq!(wire.leave(a.key, &cache), None);

        assert_eq!(
            wire.leave(b.key, &cache),
            Some(Envelope::Close {
                subscription_id: "s".into()
            })
        );
        assert_eq!(wire.status, SubStatus::Closed);
        assert_eq!(wire.join(b, &cache, false), None);
    }

    #[tokio::test]
    async fn test_listener_dedup_and_all_eose() {
        let sk = SecretKey::generate();
        let (tx, mut rx) = mpsc::channel(16);
        let mut keys: SlotMap<ListenerKey, ()> = SlotMap::with_key();
        let r1: Url = "wss://one.example.com".parse().unwrap();
        let r2: Url = "wss://two.example.com".parse().unwrap();
        let listener = Listener::new(
            keys.insert(()),
            "s".into(),
            vec![kinds(&[1])],
            vec![r1.clone(), r2.clone()],
            tx,
        );

        let ev = Arc::new(event(&sk, 1, 10));
        listener.deliver(&ev, &r1).await;
        listener.deliver(&ev, &r2).await;
        listener.deliver(&Arc::new(event(&sk, 3, 10)), &r1).await;

        listener.relay_eosed(&r1).await;
        listener
            .relay_closed(&r2, CloseReason::ClosedByRelay("error: shutting down".into()))
            .await;

        assert_eq!(
            rx.recv().await,
            Some(Occurrence::Event {
                event: ev,
                relay: Some(r1.clone())
            })
        );
        assert_eq!(rx.recv().await, Some(Occurrence::Eose(r1)));
        assert!(matches!(rx.recv().await, Some(Occurrence::Closed(url, _)) if url == r2));
        assert_eq!(rx.recv().await, Some(Occurrence::AllEose));

        // once
        listener.check_all_eose().await;
        assert!(listener.close());
        assert!(!listener.close());
        listener.relay_eosed(&r2).await;
        drop(listener);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_seen_ids_pruned_after_all_eose() {
        let sk = SecretKey::generate();
        let (tx, mut rx) = mpsc::channel(16);
        let mut keys: SlotMap<ListenerKey, ()> = SlotMap::with_key();
        let relay: Url = "wss://relay.example.com".parse().unwrap();
        let listener = Listener::new(
            keys.insert(()),
            "s".into(),
            vec![kinds(&[1])],
            vec![relay.clone()],
            tx,
        );

        let old = Arc::new(event(&sk, 1, 10));
        let newest_a = Arc::new(event(&sk, 1, 20));
        let newest_b = Arc::new(event(&SecretKey::generate(), 1, 20));
        for ev in [&old, &newest_a, &newest_b] {
            listener.deliver(ev, &relay).await;
        }
        assert_eq!(listener.seen.len(), 3);

        listener.relay_eosed(&relay).await;
        for _ in 0..5 {
            rx.recv().await.unwrap();
        }

        // only the newest second is kept, a watermarked REQ redelivers it
        assert_eq!(listener.seen.len(), 2);
        assert!(!listener.seen.contains_key(&old.id));
        listener.deliver(&newest_a, &relay).await;
        listener.deliver(&newest_b, &relay).await;
        assert!(rx.try_recv().is_err());

        // live events keep being deduplicated
        let live = Arc::new(event(&sk, 1, 30));
        listener.deliver(&live, &relay).await;
        listener.deliver(&live, &relay).await;
        assert!(matches!(rx.recv().await, Some(Occurrence::Event { .. })));
        assert!(rx.try_recv().is_err());
    }
}
