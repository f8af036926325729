//! in-memory, content-addressed event index
//!
//! [`ConcurrentCache`] is the only way shared maps get mutated in this crate. it is a sharded
//! map (one lock per shard), so writers to unrelated keys mostly don't contend, and
//! [`ConcurrentCache::get_or_create`] runs its factory under the shard lock: for a given key
//! the factory runs at most once and every caller gets the same value back.

use crate::{Event, Filter, Kind, Timestamp, ID};
use dashmap::DashMap;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct ConcurrentCache<K, V>
where
    K: Eq + Hash,
{
    map: DashMap<K, V>,
}

impl<K, V> Default for ConcurrentCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            map: DashMap::new(),
        }
    }
}

impl<K, V> ConcurrentCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// store `value`, returning what was there before
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// visit every entry, shard by shard. entries inserted concurrently may or may not be seen
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for entry in self.map.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn fold<A>(&self, init: A, mut f: impl FnMut(A, &K, &V) -> A) -> A {
        let mut acc = init;
        for entry in self.map.iter() {
            acc = f(acc, entry.key(), entry.value());
        }
        acc
    }

    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) {
        self.map.retain(|key, value| keep(key, value));
    }
}

impl<K, V> ConcurrentCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// returns the existing value or atomically stores the one built by `factory`.
    ///
    /// `factory` must not touch this same cache, it runs while the key's shard is locked.
    pub fn get_or_create(&self, key: K, factory: impl FnOnce() -> V) -> V {
        self.map.entry(key).or_insert_with(factory).value().clone()
    }

    pub fn filter_values(&self, mut predicate: impl FnMut(&K, &V) -> bool) -> Vec<V> {
        self.fold(Vec::new(), |mut acc, key, value| {
            if predicate(key, value) {
                acc.push(value.clone());
            }
            acc
        })
    }
}

/// outcome of [`EventCache::insert`], both sides carry the stored instance
#[derive(Debug, Clone)]
pub enum Inserted {
    New(Arc<Event>),
    Duplicate(Arc<Event>),
}

impl Inserted {
    pub fn is_new(&self) -> bool {
        matches!(self, Inserted::New(_))
    }

    pub fn event(&self) -> &Arc<Event> {
        match self {
            Inserted::New(event) | Inserted::Duplicate(event) => event,
        }
    }
}

type CounterKey = (String, Kind);

#[derive(Debug, Default)]
struct Inner {
    events: ConcurrentCache<ID, Arc<Event>>,
    counters: ConcurrentCache<CounterKey, Arc<AtomicU64>>,
}

/// events by id plus per-(subscription, kind) counters, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct EventCache {
    inner: Arc<Inner>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// store an event unless its id is already there, in which case nothing changes
    pub fn insert(&self, event: Event) -> Inserted {
        let id = event.id;
        let mut created = false;
        let stored = self.inner.events.get_or_create(id, || {
            created = true;
            Arc::new(event)
        });

        if created {
            Inserted::New(stored)
        } else {
            Inserted::Duplicate(stored)
        }
    }

    pub fn get(&self, id: &ID) -> Option<Arc<Event>> {
        self.inner.events.get(id)
    }

    pub fn contains(&self, id: &ID) -> bool {
        self.inner.events.contains_key(id)
    }

    pub fn remove(&self, id: &ID) -> Option<Arc<Event>> {
        self.inner.events.remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.events.is_empty()
    }

    /// matching events, newest first (ties broken by id), truncated to the filter's limit
    pub fn query(&self, filter: &Filter) -> Vec<Arc<Event>> {
        if filter.search.is_some() {
            log::debug!("ignoring cache query with search field: {}", filter);
            return Vec::new();
        }

        if filter.limit == Some(0) {
            return Vec::new();
        }

        let mut events = self
            .inner
            .events
            .filter_values(|_, event| filter.matches(event));

        glidesort::sort_by(&mut events, |a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        events
    }

    /// newest `created_at` among cached events matching `filter`, disregarding its `since`
    pub fn latest_created_at(&self, filter: &Filter) -> Option<Timestamp> {
        let open = Filter {
            since: None,
            ..filter.clone()
        };

        self.inner.events.fold(None, |latest, _, event| {
            if open.matches(event) {
                Some(latest.map_or(event.created_at, |l: Timestamp| l.max(event.created_at)))
            } else {
                latest
            }
        })
    }

    /// count one more event of `kind` delivered through `subscription_id`
    pub fn bump_counter(&self, subscription_id: &str, kind: Kind) -> u64 {
        let counter = self
            .inner
            .counters
            .get_or_create((subscription_id.to_string(), kind), || {
                Arc::new(AtomicU64::new(0))
            });
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn counter(&self, subscription_id: &str, kind: Kind) -> u64 {
        self.inner
            .counters
            .get(&(subscription_id.to_string(), kind))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// drop every counter belonging to `subscription_id`
    pub fn clear_counters(&self, subscription_id: &str) {
        self.inner
            .counters
            .retain(|(sub_id, _), _| sub_id != subscription_id);
    }

    /// how many cached events there are of each kind, built by a full pass
    pub fn count_by_kind(&self) -> HashMap<Kind, usize> {
        self.inner
            .events
            .fold(HashMap::new(), |mut counts, _, event| {
                *counts.entry(event.kind).or_insert(0) += 1;
                counts
            })
    }
}
