use crate::{
    cache::{ConcurrentCache, EventCache},
    normalize_url,
    relay::{AuthError, PublishError, Relay, RelayStats},
    subscription::{subscription_id, Listener, ListenerKey, Subscription, SubscriptionOptions},
    transport::{Transport, TransportEvent},
    Event, Filter, Signer, ID,
};
use slotmap::SlotMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum AttachError {
    #[error("URL normalization error")]
    Normalize(#[from] url::ParseError),
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// check id and signature of every event not already in the cache
    pub verify_signatures: bool,
    /// capacity of each subscription's channel
    pub channel_capacity: usize,
    /// start subscriptions with the matching events we already have
    pub replay_cached: bool,
    /// prepended to every subscription id we send
    pub subscription_prefix: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            verify_signatures: true,
            channel_capacity: 256,
            replay_cached: true,
            subscription_prefix: String::new(),
        }
    }
}

#[derive(Debug)]
pub struct PublishResult {
    pub relay_url: String,
    pub result: Result<(), PublishError>,
}

/// relays, subscriptions and the event cache they all feed
#[derive(Debug, Clone)]
pub struct Pool {
    options: Arc<PoolOptions>,
    cache: EventCache,
    relays: Arc<ConcurrentCache<String, Relay>>,
    listeners: Arc<Mutex<SlotMap<ListenerKey, Arc<Listener>>>>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub fn new() -> Self {
        Self::with_options(PoolOptions::default())
    }

    pub fn with_options(options: PoolOptions) -> Self {
        Self {
            options: Arc::new(options),
            cache: EventCache::new(),
            relays: Arc::new(ConcurrentCache::new()),
            listeners: Arc::new(Mutex::new(SlotMap::with_capacity_and_key(8))),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn cache(&self) -> &EventCache {
        &self.cache
    }

    /// start reading `inbound` as the connection to `url`, writing through `transport`.
    ///
    /// a relay already attached under the same normalized url is detached first. every open
    /// subscription targeting this url is sent again, starting from what we already have
    pub async fn attach_relay(
        &self,
        url: &str,
        transport: impl Transport + 'static,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Result<Relay, AttachError> {
        let normalized_url = normalize_url(url)?;

        if let Some(previous) = self.relays.remove(&normalized_url.to_string()) {
            previous.disconnect(Some("replaced".to_string())).await;
        }

        let (on_close, handle_close) = oneshot::channel::<Option<String>>();
        let relay = Relay::attach(
            normalized_url.clone(),
            Arc::new(transport),
            inbound,
            self.cache.clone(),
            self.options.verify_signatures,
            Some(on_close),
        );
        self.relays.put(normalized_url.to_string(), relay.clone());
        log::info!("[{}] relay attached", normalized_url.as_str());

        // the relay will be dropped from the map if it disconnects
        let relays = self.relays.clone();
        let closing = relay.clone();
        tokio::spawn(async move {
            if handle_close.await.is_ok() {
                let key = closing.url.to_string();
                if relays
                    .get(&key)
                    .is_some_and(|current| current.same_connection(&closing))
                {
                    relays.remove(&key);
                }
            }
        });

        let listeners: Vec<Arc<Listener>> = self
            .listeners
            .lock()
            .await
            .values()
            .filter(|listener| !listener.is_closed() && listener.targets(&normalized_url))
            .cloned()
            .collect();
        for listener in listeners {
            relay.join(&listener, true).await;
        }

        Ok(relay)
    }

    /// stop reading from this relay. its subscriptions are closed with
    /// [`crate::CloseReason::ConnectionLost`] but stay registered for a future attach
    pub async fn detach_relay(&self, url: &str) -> bool {
        let Ok(normalized_url) = normalize_url(url) else {
            return false;
        };

        match self.relays.remove(&normalized_url.to_string()) {
            Some(relay) => relay.disconnect(Some("detached".to_string())).await,
            None => false,
        }
    }

    /// an attached relay, if there is one at this url
    pub fn relay(&self, url: &str) -> Option<Relay> {
        let normalized_url = normalize_url(url).ok()?;
        self.relays.get(&normalized_url.to_string())
    }

    pub fn relays(&self) -> Vec<Relay> {
        self.relays.filter_values(|_, _| true)
    }

    /// open a subscription on `urls`.
    ///
    /// relays that are not attached yet will get it when they are; for the purposes of
    /// [`crate::Occurrence::AllEose`] they count as done
    pub async fn subscribe(
        &self,
        urls: Vec<String>,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> Subscription {
        let mut relays: Vec<Url> = Vec::with_capacity(urls.len());
        for url in &urls {
            match normalize_url(url) {
                Ok(url) if !relays.contains(&url) => relays.push(url),
                Ok(_) => {}
                Err(err) => log::warn!("skipping relay {}: {}", url, err),
            }
        }

        let replay: Vec<Arc<Event>> = if self.options.replay_cached {
            filters
                .iter()
                .flat_map(|filter| self.cache.query(filter))
                .collect()
        } else {
            Vec::new()
        };

        // room for the whole replay, an EOSE per relay and the AllEose, so nothing here
        // waits for a reader
        let (sender, receiver) = mpsc::channel(
            self.options
                .channel_capacity
                .max(replay.len() + relays.len() + 1),
        );

        let listener = {
            let mut listeners = self.listeners.lock().await;
            let key = listeners.insert_with_key(|key| {
                Arc::new(Listener::new(
                    key,
                    subscription_id(key, &self.options.subscription_prefix, &options),
                    filters,
                    relays,
                    sender,
                ))
            });
            listeners[key].clone()
        };

        for event in replay {
            listener.preload(event);
        }

        let subscription = Subscription::new(listener.clone(), receiver, self.clone());

        // with no filters there is nothing to ask for
        let mut attached = Vec::with_capacity(listener.relays.len());
        for url in &listener.relays {
            match self.relays.get(&url.to_string()) {
                Some(relay) if !listener.filters.is_empty() => attached.push(relay),
                _ => listener.finish(url).await,
            }
        }

        for relay in attached {
            if !relay.join(&listener, false).await {
                listener.finish(&relay.url).await;
            }
        }

        listener.check_all_eose().await;
        subscription
    }

    /// same as [`Subscription::close`]
    pub async fn unsubscribe(&self, subscription: &mut Subscription) {
        subscription.close().await;
    }

    /// recompute this subscription's REQs from the cache: every filter now starts at the
    /// newest event we have for it. relays that already reached EOSE are not asked again
    /// if that is the only change
    pub async fn invalidate(&self, subscription: &Subscription) {
        let listener = &subscription.listener;
        if listener.is_closed() {
            return;
        }

        for url in &listener.relays {
            if let Some(relay) = self.relays.get(&url.to_string()) {
                relay.invalidate(listener).await;
            }
        }
    }

    pub(crate) async fn close_listener(&self, listener: &Arc<Listener>) {
        if !listener.close() {
            return;
        }

        self.listeners.lock().await.remove(listener.key);
        for url in &listener.relays {
            if let Some(relay) = self.relays.get(&url.to_string()) {
                relay.leave(listener).await;
            }
        }
    }

    /// publish an event to multiple relays, results arrive as relays answer.
    ///
    /// an event whose id or signature doesn't hold is neither cached nor sent, every relay
    /// gets [`PublishError::Integrity`]
    pub async fn publish(&self, urls: Vec<String>, event: Event) -> mpsc::Receiver<PublishResult> {
        let (tx, rx) = mpsc::channel(urls.len().max(1));

        if let Err(err) = event.verify() {
            log::warn!("not publishing {}: {}", event.id, err);
            for url in urls {
                let _ = tx.try_send(PublishResult {
                    relay_url: url,
                    result: Err(err.clone().into()),
                });
            }
            return rx;
        }

        self.cache.insert(event.clone());

        for url in urls {
            let tx = tx.clone();
            let event = event.clone();
            let relay = self.relay(&url);

            tokio::spawn(async move {
                let result = match relay {
                    Some(relay) => relay.publish(event).await,
                    None => Err(PublishError::NotAttached),
                };

                if let Err(err) = &result {
                    log::info!("[{}] publish failed: {}", url, err);
                }

                let _ = tx
                    .send(PublishResult {
                        relay_url: url,
                        result,
                    })
                    .await;
            });
        }

        rx
    }

    /// NIP-42 authentication against the challenge `url` sent us
    pub async fn authenticate(
        &self,
        url: &str,
        signer: &(impl Signer + ?Sized),
    ) -> Result<(), AuthError> {
        let relay = self.relay(url).ok_or(PublishError::NotAttached)?;
        relay.authenticate(signer).await
    }

    pub fn get_cached(&self, id: &ID) -> Option<Arc<Event>> {
        self.cache.get(id)
    }

    /// cached events matching `filter`, newest first
    pub fn query(&self, filter: &Filter) -> Vec<Arc<Event>> {
        self.cache.query(filter)
    }

    /// counters summed over every attached relay
    pub fn stats(&self) -> RelayStats {
        self.relays.fold(RelayStats::default(), |mut total, _, relay| {
            total += relay.stats();
            total
        })
    }
}
