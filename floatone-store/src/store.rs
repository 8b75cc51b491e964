//! Per-window store engine.
//!
//! Every window owns one [`Store`]. It hydrates persisted keys from the
//! backend, serves reads from an in-memory cache, writes persisted keys
//! through to the backend and broadcasts every change on the bus so peer
//! windows converge on the same values.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use floatone_ipc::ChangeEvent;
use serde_json::Value;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;

use crate::backend::{lock, Backend};
use crate::bus::{Envelope, EventBus, Subscription};
use crate::error::{BackendError, BusError, StoreError};
use crate::reactive::Binding;
use crate::schema::{Key, KeyDescriptor, Schema, StoreValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Hydrating,
    Ready,
}

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

struct Slot {
    value: Value,
    hydrated: bool,
    watch: watch::Sender<Value>,
    handlers: Vec<(u64, Handler)>,
}

struct Shared {
    window_id: String,
    schema: Arc<Schema>,
    backend: Option<Arc<dyn Backend>>,
    bus: Arc<dyn EventBus>,
    phase: watch::Sender<Phase>,
    init: OnceCell<()>,
    slots: Mutex<HashMap<&'static str, Slot>>,
    next_handler: AtomicU64,
    seq: AtomicU64,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        for pump in lock(&self.pumps).drain(..) {
            pump.abort();
        }
    }
}

/// Handle to one window's store. Clones share the same state.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Store {
    /// A `None` backend runs the store in memory only; persisted keys then
    /// start from their defaults and every set on them reports `Detached`.
    pub fn new(
        window_id: impl Into<String>,
        schema: Arc<Schema>,
        backend: Option<Arc<dyn Backend>>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let slots = schema
            .keys()
            .map(|descriptor| {
                let value = descriptor.default_value().clone();
                let (watch, _) = watch::channel(value.clone());
                let slot = Slot {
                    value,
                    hydrated: false,
                    watch,
                    handlers: Vec::new(),
                };
                (descriptor.name(), slot)
            })
            .collect();
        let (phase, _) = watch::channel(Phase::Uninitialized);

        Self {
            shared: Arc::new(Shared {
                window_id: window_id.into(),
                schema,
                backend,
                bus,
                phase,
                init: OnceCell::new(),
                slots: Mutex::new(slots),
                next_handler: AtomicU64::new(0),
                seq: AtomicU64::new(0),
                pumps: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn window_id(&self) -> &str {
        &self.shared.window_id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.shared.schema
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    /// Whether `name` has been loaded from the backend (or defaulted) yet
    pub fn is_hydrated(&self, name: &str) -> bool {
        lock(&self.shared.slots)
            .get(name)
            .is_some_and(|slot| slot.hydrated)
    }

    /// Wait until another caller has finished `init`
    pub async fn ready(&self) {
        let mut phase = self.shared.phase.subscribe();
        // Err only when the sender is gone, and `self` keeps it alive
        let _ = phase.wait_for(|phase| *phase == Phase::Ready).await;
    }

    /// Hydrate the store and start applying peer changes.
    /// Concurrent and repeated calls share one hydration.
    pub async fn init(&self) {
        self.shared.init.get_or_init(|| self.hydrate()).await;
    }

    async fn hydrate(&self) {
        self.shared.phase.send_replace(Phase::Hydrating);
        tracing::debug!(
            "Window {} hydrating {} keys",
            self.shared.window_id,
            self.shared.schema.len()
        );

        // Subscribed before reading so peer changes made meanwhile are applied afterwards
        let mut subscriptions: Vec<(&'static str, Subscription)> = self
            .shared
            .schema
            .keys()
            .map(|descriptor| {
                let event = ChangeEvent::event_name(descriptor.name());
                (descriptor.name(), self.shared.bus.subscribe(&event))
            })
            .collect();

        let stored = self.read_persisted().await;

        {
            let mut slots = lock(&self.shared.slots);
            for descriptor in self.shared.schema.keys() {
                let Some(slot) = slots.get_mut(descriptor.name()) else {
                    continue;
                };
                let value = stored
                    .get(descriptor.name())
                    .cloned()
                    .unwrap_or_else(|| descriptor.default_value().clone());
                slot.value = value.clone();
                slot.hydrated = true;
                slot.watch.send_replace(value);
            }
        }

        // Peer changes queued while reading are newer than the disk
        for (name, subscription) in &mut subscriptions {
            while let Some(envelope) = subscription.try_recv() {
                self.receive(*name, envelope);
            }
        }

        self.shared.phase.send_replace(Phase::Ready);
        self.spawn_pumps(subscriptions);
        tracing::info!("Window {} store ready", self.shared.window_id);
    }

    async fn read_persisted(&self) -> HashMap<&'static str, Value> {
        let Some(backend) = self.shared.backend.clone() else {
            tracing::warn!(
                "Window {} has no backend, persisted keys start from defaults",
                self.shared.window_id
            );
            return HashMap::new();
        };

        let schema = Arc::clone(&self.shared.schema);
        let task = tokio::task::spawn_blocking(move || {
            let mut stored = HashMap::new();
            for descriptor in schema.keys().filter(|d| d.persist()) {
                let name = descriptor.name();
                match backend.read(name) {
                    Ok(Some(value)) => match descriptor.canonicalize(&value) {
                        Ok(value) => {
                            stored.insert(name, value);
                        }
                        Err(reason) => {
                            tracing::warn!("Ignoring stored value of {}: {}", name, reason)
                        }
                    },
                    Ok(None) => tracing::debug!("No stored value for {}, using default", name),
                    Err(e) => tracing::warn!("Failed to read {}: {}, using default", name, e),
                }
            }
            stored
        });

        match task.await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!("Hydration task failed: {}", e);
                HashMap::new()
            }
        }
    }

    fn spawn_pumps(&self, subscriptions: Vec<(&'static str, Subscription)>) {
        let mut pumps = lock(&self.shared.pumps);
        for (name, mut subscription) in subscriptions {
            let shared = Arc::downgrade(&self.shared);
            pumps.push(tokio::spawn(async move {
                while let Some(envelope) = subscription.recv().await {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    Store { shared }.receive(name, envelope);
                }
            }));
        }
    }

    fn ensure_ready(&self) -> Result<(), StoreError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(StoreError::NotReady)
        }
    }

    pub fn get<V: StoreValue>(&self, key: &Key<V>) -> Result<V, StoreError> {
        let descriptor = self.shared.schema.lookup(key)?;
        let value = self.cached(descriptor)?;
        decode(descriptor.name(), &value)
    }

    /// Current value of `name` as JSON
    pub fn get_raw(&self, name: &str) -> Result<Value, StoreError> {
        let descriptor = self.shared.schema.lookup_name(name)?;
        self.cached(descriptor)
    }

    fn cached(&self, descriptor: &KeyDescriptor) -> Result<Value, StoreError> {
        self.ensure_ready()?;
        lock(&self.shared.slots)
            .get(descriptor.name())
            .map(|slot| slot.value.clone())
            .ok_or_else(|| StoreError::UnknownKey {
                key: descriptor.name().to_string(),
            })
    }

    /// Update the value of `key` in this window, persist it if the key is
    /// persisted and broadcast it to peers.
    ///
    /// The local value is updated even when persisting fails; the failure is
    /// reported as [`StoreError::Persistence`] after the change is published.
    pub async fn set<V: StoreValue>(&self, key: &Key<V>, value: V) -> Result<(), StoreError> {
        let descriptor = self.shared.schema.lookup(key)?;
        self.ensure_ready()?;
        value.validate().map_err(|reason| StoreError::InvalidValue {
            key: descriptor.name().to_string(),
            reason,
        })?;
        let json = serde_json::to_value(&value).map_err(|source| StoreError::Codec {
            key: descriptor.name().to_string(),
            source,
        })?;

        self.commit(descriptor.name(), descriptor.persist(), json)
            .await
    }

    /// Set `name` from JSON, decoding it as the key's declared type
    pub async fn set_raw(&self, name: &str, value: Value) -> Result<(), StoreError> {
        let descriptor = self.shared.schema.lookup_name(name)?;
        self.ensure_ready()?;
        let value = descriptor
            .canonicalize(&value)
            .map_err(|reason| StoreError::InvalidValue {
                key: descriptor.name().to_string(),
                reason,
            })?;

        self.commit(descriptor.name(), descriptor.persist(), value)
            .await
    }

    async fn commit(
        &self,
        name: &'static str,
        persist: bool,
        value: Value,
    ) -> Result<(), StoreError> {
        self.apply(name, value.clone());

        let persisted = if persist {
            self.persist(name).await
        } else {
            Ok(())
        };

        self.publish(name, value);
        persisted
    }

    /// Replace the cached value and notify handlers. No-op for an equal value.
    fn apply(&self, name: &'static str, value: Value) -> bool {
        let handlers: Vec<Handler> = {
            let mut slots = lock(&self.shared.slots);
            let Some(slot) = slots.get_mut(name) else {
                return false;
            };
            if slot.value == value {
                return false;
            }
            slot.value = value.clone();
            slot.watch.send_replace(value.clone());
            slot.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };

        for handler in handlers {
            handler(&value);
        }
        true
    }

    async fn persist(&self, name: &'static str) -> Result<(), StoreError> {
        let Some(backend) = self.shared.backend.clone() else {
            tracing::warn!(
                "Window {} has no backend, {} is kept in memory only",
                self.shared.window_id,
                name
            );
            return Err(StoreError::Persistence {
                key: name.to_string(),
                source: BackendError::Detached,
            });
        };

        let shared = Arc::clone(&self.shared);
        let result = tokio::task::spawn_blocking(move || {
            // Latest cached value, so flushes finishing out of order still match the cache
            let latest = lock(&shared.slots).get(name).map(|slot| slot.value.clone());
            if let Some(latest) = latest {
                backend.write(name, latest)?;
            }
            backend.flush()
        })
        .await
        .unwrap_or_else(|e| Err(BackendError::Task(e.to_string())));

        result.map_err(|source| {
            tracing::warn!(
                "Failed to persist {} in window {}: {}",
                name,
                self.shared.window_id,
                source
            );
            StoreError::Persistence {
                key: name.to_string(),
                source,
            }
        })
    }

    fn publish(&self, name: &'static str, value: Value) {
        let event = ChangeEvent {
            key: name.to_string(),
            value,
            origin: self.shared.window_id.clone(),
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: now_ms(),
        };

        let result = serde_json::to_value(&event)
            .map_err(BusError::from)
            .and_then(|payload| {
                self.shared
                    .bus
                    .publish(&ChangeEvent::event_name(name), payload)
            });
        if let Err(e) = result {
            tracing::warn!("Failed to publish change of {}: {}", name, e);
        }
    }

    fn receive(&self, name: &'static str, envelope: Envelope) {
        let event: ChangeEvent = match serde_json::from_value(envelope.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Dropping malformed {} event: {}", envelope.event, e);
                return;
            }
        };

        if event.origin == self.shared.window_id {
            tracing::trace!("Ignoring echo of {} #{}", name, event.seq);
            return;
        }
        if event.key != name {
            tracing::warn!(
                "Dropping event for {} delivered on {}",
                event.key,
                envelope.event
            );
            return;
        }

        let Some(descriptor) = self.shared.schema.get(name) else {
            return;
        };
        let value = match descriptor.canonicalize(&event.value) {
            Ok(value) => value,
            Err(reason) => {
                tracing::warn!(
                    "Dropping invalid {} from {}: {}",
                    name,
                    event.origin,
                    reason
                );
                return;
            }
        };

        if self.apply(name, value) {
            tracing::debug!(
                "Window {} applied {} from {} (seq {})",
                self.shared.window_id,
                name,
                event.origin,
                event.seq
            );
        }
    }

    /// Call `handler` with every new value of `key`, local or remote.
    /// Handlers run in registration order, after the value is cached.
    pub fn on_change<V, F>(&self, key: &Key<V>, handler: F) -> Result<Listener, StoreError>
    where
        V: StoreValue,
        F: Fn(&V) + Send + Sync + 'static,
    {
        let name = self.shared.schema.lookup(key)?.name();
        let handler: Handler = Arc::new(move |value: &Value| match V::deserialize(value) {
            Ok(value) => handler(&value),
            Err(e) => tracing::warn!("Handler for {} skipped undecodable value: {}", name, e),
        });

        let id = self.shared.next_handler.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = lock(&self.shared.slots).get_mut(name) {
            slot.handlers.push((id, handler));
        }

        Ok(Listener {
            shared: Arc::downgrade(&self.shared),
            key: name,
            id,
            active: true,
        })
    }

    /// Reactive view of one key
    pub fn use_key<V: StoreValue>(&self, key: &Key<V>) -> Result<Binding<V>, StoreError> {
        let name = self.shared.schema.lookup(key)?.name();
        self.ensure_ready()?;
        let rx = lock(&self.shared.slots)
            .get(name)
            .map(|slot| slot.watch.subscribe())
            .ok_or_else(|| StoreError::UnknownKey {
                key: name.to_string(),
            })?;
        Ok(Binding::new(name, rx))
    }

    #[cfg(test)]
    fn handler_count(&self, name: &str) -> usize {
        lock(&self.shared.slots)
            .get(name)
            .map_or(0, |slot| slot.handlers.len())
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("window_id", &self.shared.window_id)
            .field("phase", &self.phase())
            .field("detached", &self.shared.backend.is_none())
            .finish()
    }
}

/// Registration of an `on_change` handler. Dropping it removes the handler.
#[must_use = "dropping a listener removes its handler"]
pub struct Listener {
    shared: Weak<Shared>,
    key: &'static str,
    id: u64,
    active: bool,
}

impl Listener {
    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Keep the handler for as long as the store lives
    pub fn detach(mut self) {
        self.active = false;
    }

    fn remove(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut slots = lock(&shared.slots);
        if let Some(slot) = slots.get_mut(self.key) {
            slot.handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

pub(crate) fn decode<V: StoreValue>(name: &str, value: &Value) -> Result<V, StoreError> {
    V::deserialize(value).map_err(|source| StoreError::Codec {
        key: name.to_string(),
        source,
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MemoryBackend;
    use crate::backend::FileBackend;
    use crate::bus::LocalBus;
    use floatone_ipc::{RotateInterval, Theme};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const ROTATE_INTERVAL: Key<RotateInterval> =
        Key::persisted("rotateInterval", RotateInterval::default);
    const THEME: Key<Theme> = Key::persisted("theme", Theme::default);
    const DOWNLOADED: Key<bool> = Key::memory("newVersionDownloaded", bool::default);
    const UNDECLARED: Key<bool> = Key::memory("undeclared", bool::default);

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .key(ROTATE_INTERVAL)
                .key(THEME)
                .key(DOWNLOADED)
                .build()
                .unwrap(),
        )
    }

    fn window(id: &str, backend: &Arc<MemoryBackend>, bus: &LocalBus) -> Store {
        let backend: Arc<dyn Backend> = backend.clone();
        Store::new(id, schema(), Some(backend), Arc::new(bus.clone()))
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for change")
            .expect("channel closed")
    }

    fn collect<V: StoreValue>(store: &Store, key: &Key<V>) -> (Listener, mpsc::UnboundedReceiver<V>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = store
            .on_change(key, move |value: &V| {
                let _ = tx.send(value.clone());
            })
            .unwrap();
        (listener, rx)
    }

    fn change(key: &str, value: Value, origin: &str) -> Value {
        serde_json::to_value(ChangeEvent {
            key: key.to_string(),
            value,
            origin: origin.to_string(),
            seq: 0,
            timestamp_ms: 0,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_store_returns_defaults_without_writing_them() {
        let backend = Arc::new(MemoryBackend::new());
        let store = window("a", &backend, &LocalBus::new());
        store.init().await;

        assert_eq!(store.get(&ROTATE_INTERVAL).unwrap(), RotateInterval(60));
        assert_eq!(store.get(&THEME).unwrap(), Theme::Dark);
        assert!(!store.get(&DOWNLOADED).unwrap());
        assert!(store.is_hydrated("rotateInterval"));
        assert_eq!(backend.durable("rotateInterval"), None);
        assert_eq!(backend.flush_count(), 0);
    }

    #[tokio::test]
    async fn test_access_before_init_is_not_ready() {
        let store = window("a", &Arc::new(MemoryBackend::new()), &LocalBus::new());

        assert_eq!(store.phase(), Phase::Uninitialized);
        assert!(!store.is_hydrated("theme"));
        assert!(matches!(store.get(&THEME), Err(StoreError::NotReady)));
        assert!(matches!(store.use_key(&THEME), Err(StoreError::NotReady)));
        assert!(matches!(
            store.set(&THEME, Theme::Light).await,
            Err(StoreError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_undeclared_key_is_unknown_in_every_phase() {
        let store = window("a", &Arc::new(MemoryBackend::new()), &LocalBus::new());
        assert!(matches!(
            store.get(&UNDECLARED),
            Err(StoreError::UnknownKey { .. })
        ));

        store.init().await;
        assert!(matches!(
            store.get(&UNDECLARED),
            Err(StoreError::UnknownKey { .. })
        ));
        assert!(matches!(
            store.set(&UNDECLARED, true).await,
            Err(StoreError::UnknownKey { .. })
        ));
        assert!(matches!(
            store.get_raw("nope"),
            Err(StoreError::UnknownKey { .. })
        ));
        assert!(matches!(
            store.on_change(&UNDECLARED, |_| {}),
            Err(StoreError::UnknownKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_type_mismatch_is_rejected() {
        let store = window("a", &Arc::new(MemoryBackend::new()), &LocalBus::new());
        store.init().await;

        let wrong: Key<String> = Key::persisted("theme", String::new);
        assert!(matches!(
            store.get(&wrong),
            Err(StoreError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_then_get_in_same_window() {
        let backend = Arc::new(MemoryBackend::new());
        let store = window("a", &backend, &LocalBus::new());
        store.init().await;

        store.set(&ROTATE_INTERVAL, RotateInterval(90)).await.unwrap();
        assert_eq!(store.get(&ROTATE_INTERVAL).unwrap(), RotateInterval(90));
        assert_eq!(backend.durable("rotateInterval"), Some(json!(90)));
    }

    #[tokio::test]
    async fn test_persisted_value_survives_new_window() {
        let backend = Arc::new(MemoryBackend::new());
        let first = window("a", &backend, &LocalBus::new());
        first.init().await;
        first.set(&THEME, Theme::Light).await.unwrap();
        drop(first);

        let second = window("b", &backend, &LocalBus::new());
        second.init().await;
        assert_eq!(second.get(&THEME).unwrap(), Theme::Light);
    }

    #[tokio::test]
    async fn test_persisted_value_survives_restart_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");

        {
            let backend: Arc<dyn Backend> = Arc::new(FileBackend::load(&path).unwrap());
            let store = Store::new("a", schema(), Some(backend), Arc::new(LocalBus::new()));
            store.init().await;
            store.set(&ROTATE_INTERVAL, RotateInterval(90)).await.unwrap();
        }

        let backend: Arc<dyn Backend> = Arc::new(FileBackend::load(&path).unwrap());
        let store = Store::new("b", schema(), Some(backend), Arc::new(LocalBus::new()));
        store.init().await;
        assert_eq!(store.get(&ROTATE_INTERVAL).unwrap(), RotateInterval(90));
    }

    #[tokio::test]
    async fn test_peer_window_converges() {
        let backend = Arc::new(MemoryBackend::new());
        let bus = LocalBus::new();
        let a = window("a", &backend, &bus);
        let b = window("b", &backend, &bus);
        a.init().await;
        b.init().await;

        let (_listener, mut changes) = collect(&b, &ROTATE_INTERVAL);
        a.set(&ROTATE_INTERVAL, RotateInterval(90)).await.unwrap();

        assert_eq!(next(&mut changes).await, RotateInterval(90));
        assert_eq!(b.get(&ROTATE_INTERVAL).unwrap(), RotateInterval(90));
    }

    #[tokio::test]
    async fn test_repeated_equal_value_notifies_once() {
        let backend = Arc::new(MemoryBackend::new());
        let bus = LocalBus::new();
        let a = window("a", &backend, &bus);
        let b = window("b", &backend, &bus);
        a.init().await;
        b.init().await;

        let (_listener, mut changes) = collect(&b, &ROTATE_INTERVAL);
        a.set(&ROTATE_INTERVAL, RotateInterval(90)).await.unwrap();
        a.set(&ROTATE_INTERVAL, RotateInterval(90)).await.unwrap();
        a.set(&ROTATE_INTERVAL, RotateInterval(120)).await.unwrap();

        assert_eq!(next(&mut changes).await, RotateInterval(90));
        assert_eq!(next(&mut changes).await, RotateInterval(120));
    }

    /// Backend whose reads block until the test releases them
    struct GatedBackend {
        inner: MemoryBackend,
        started: mpsc::UnboundedSender<()>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Backend for GatedBackend {
        fn read(&self, key: &str) -> Result<Option<Value>, BackendError> {
            let _ = self.started.send(());
            let _ = lock(&self.release).recv();
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: Value) -> Result<(), BackendError> {
            self.inner.write(key, value)
        }

        fn flush(&self) -> Result<(), BackendError> {
            self.inner.flush()
        }
    }

    #[tokio::test]
    async fn test_peer_change_during_hydration_wins_over_disk() {
        let bus = LocalBus::new();
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let (release, release_rx) = std::sync::mpsc::channel();
        let backend = GatedBackend {
            inner: MemoryBackend::new().with_entry("theme", json!("system")),
            started: started_tx,
            release: Mutex::new(release_rx),
        };
        let store = Store::new("a", schema(), Some(Arc::new(backend)), Arc::new(bus.clone()));

        let init = tokio::spawn({
            let store = store.clone();
            async move { store.init().await }
        });
        next(&mut started).await;
        assert_eq!(store.phase(), Phase::Hydrating);

        bus.publish("theme-update", change("theme", json!("light"), "peer"))
            .unwrap();
        for _ in 0..2 {
            release.send(()).unwrap();
        }
        init.await.unwrap();

        assert_eq!(store.get(&THEME).unwrap(), Theme::Light);
        assert_eq!(store.get(&ROTATE_INTERVAL).unwrap(), RotateInterval(60));
    }

    #[tokio::test]
    async fn test_duplicate_events_apply_once() {
        let bus = LocalBus::new();
        let store = window("a", &Arc::new(MemoryBackend::new()), &bus);
        store.init().await;
        let (_listener, mut changes) = collect(&store, &THEME);

        let event = change("theme", json!("light"), "peer");
        bus.publish("theme-update", event.clone()).unwrap();
        bus.publish("theme-update", event).unwrap();
        bus.publish("theme-update", change("theme", json!("system"), "peer"))
            .unwrap();

        assert_eq!(next(&mut changes).await, Theme::Light);
        assert_eq!(next(&mut changes).await, Theme::System);
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored() {
        let bus = LocalBus::new();
        let store = window("a", &Arc::new(MemoryBackend::new()), &bus);
        store.init().await;
        let (_listener, mut changes) = collect(&store, &ROTATE_INTERVAL);

        bus.publish("rotateInterval-update", change("rotateInterval", json!(120), "a"))
            .unwrap();
        bus.publish("rotateInterval-update", change("rotateInterval", json!(150), "b"))
            .unwrap();

        assert_eq!(next(&mut changes).await, RotateInterval(150));
    }

    #[tokio::test]
    async fn test_invalid_and_misrouted_events_are_dropped() {
        let bus = LocalBus::new();
        let store = window("a", &Arc::new(MemoryBackend::new()), &bus);
        store.init().await;
        let (_listener, mut changes) = collect(&store, &ROTATE_INTERVAL);

        bus.publish("rotateInterval-update", json!({"garbage": true}))
            .unwrap();
        bus.publish("rotateInterval-update", change("rotateInterval", json!(5), "b"))
            .unwrap();
        bus.publish("rotateInterval-update", change("theme", json!(90), "b"))
            .unwrap();
        bus.publish("rotateInterval-update", change("rotateInterval", json!(45), "b"))
            .unwrap();

        assert_eq!(next(&mut changes).await, RotateInterval(45));
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_value_and_still_broadcasts() {
        let backend = Arc::new(MemoryBackend::new());
        let bus = LocalBus::new();
        let a = window("a", &backend, &bus);
        let b = window("b", &backend, &bus);
        a.init().await;
        b.init().await;
        let (_listener, mut changes) = collect(&b, &THEME);

        backend.set_fail_flush(true);
        let err = a.set(&THEME, Theme::Light).await.unwrap_err();
        assert!(matches!(err, StoreError::Persistence { key, .. } if key == "theme"));

        assert_eq!(a.get(&THEME).unwrap(), Theme::Light);
        assert_eq!(backend.durable("theme"), None);
        assert_eq!(next(&mut changes).await, Theme::Light);
    }

    #[tokio::test]
    async fn test_invalid_value_is_rejected_before_apply() {
        let backend = Arc::new(MemoryBackend::new());
        let store = window("a", &backend, &LocalBus::new());
        store.init().await;

        let err = store
            .set(&ROTATE_INTERVAL, RotateInterval(10))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue { .. }));
        assert_eq!(store.get(&ROTATE_INTERVAL).unwrap(), RotateInterval(60));
        assert_eq!(backend.flush_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_init_hydrates_once() {
        let backend = Arc::new(MemoryBackend::new().with_entry("theme", json!("light")));
        let store = window("a", &backend, &LocalBus::new());

        tokio::join!(store.init(), store.init(), store.ready());
        store.init().await;

        assert!(store.is_ready());
        assert_eq!(store.get(&THEME).unwrap(), Theme::Light);
        // Two persisted keys, read once each
        assert_eq!(backend.read_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_stored_value_falls_back_to_default() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_entry("rotateInterval", json!(5))
                .with_entry("theme", json!(42)),
        );
        let store = window("a", &backend, &LocalBus::new());
        store.init().await;

        assert_eq!(store.get(&ROTATE_INTERVAL).unwrap(), RotateInterval(60));
        assert_eq!(store.get(&THEME).unwrap(), Theme::Dark);
    }

    #[tokio::test]
    async fn test_read_failure_falls_back_to_default() {
        let backend = Arc::new(MemoryBackend::new().with_entry("theme", json!("light")));
        backend.set_fail_reads(true);
        let store = window("a", &backend, &LocalBus::new());
        store.init().await;

        assert!(store.is_ready());
        assert_eq!(store.get(&THEME).unwrap(), Theme::Dark);
    }

    #[tokio::test]
    async fn test_detached_store_keeps_values_in_memory() {
        let store = Store::new("a", schema(), None, Arc::new(LocalBus::new()));
        store.init().await;

        let err = store.set(&THEME, Theme::System).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Persistence {
                source: BackendError::Detached,
                ..
            }
        ));
        assert_eq!(store.get(&THEME).unwrap(), Theme::System);

        store.set(&DOWNLOADED, true).await.unwrap();
        assert!(store.get(&DOWNLOADED).unwrap());
    }

    #[tokio::test]
    async fn test_memory_key_is_broadcast_but_not_persisted() {
        let backend = Arc::new(MemoryBackend::new());
        let bus = LocalBus::new();
        let a = window("a", &backend, &bus);
        let b = window("b", &backend, &bus);
        a.init().await;
        b.init().await;
        let (_listener, mut changes) = collect(&b, &DOWNLOADED);

        a.set(&DOWNLOADED, true).await.unwrap();

        assert!(next(&mut changes).await);
        assert_eq!(backend.durable("newVersionDownloaded"), None);
        assert_eq!(backend.flush_count(), 0);
    }

    #[tokio::test]
    async fn test_handlers_fire_in_registration_order() {
        let store = window("a", &Arc::new(MemoryBackend::new()), &LocalBus::new());
        store.init().await;

        let calls = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&calls);
        let second = Arc::clone(&calls);
        let _a = store
            .on_change(&THEME, move |_| first.lock().unwrap().push("first"))
            .unwrap();
        let _b = store
            .on_change(&THEME, move |_| second.lock().unwrap().push("second"))
            .unwrap();

        store.set(&THEME, Theme::Light).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_listener_unsubscribe_and_detach() {
        let store = window("a", &Arc::new(MemoryBackend::new()), &LocalBus::new());
        store.init().await;

        let dropped = store.on_change(&THEME, |_| {}).unwrap();
        let detached = store.on_change(&THEME, |_| {}).unwrap();
        let removed = store.on_change(&THEME, |_| {}).unwrap();
        assert_eq!(store.handler_count("theme"), 3);

        drop(dropped);
        detached.detach();
        removed.unsubscribe();
        assert_eq!(store.handler_count("theme"), 1);
    }

    #[tokio::test]
    async fn test_set_raw_decodes_declared_type() {
        let backend = Arc::new(MemoryBackend::new());
        let store = window("a", &backend, &LocalBus::new());
        store.init().await;

        store.set_raw("rotateInterval", json!(45)).await.unwrap();
        assert_eq!(store.get_raw("rotateInterval").unwrap(), json!(45));
        assert_eq!(backend.durable("rotateInterval"), Some(json!(45)));

        assert!(matches!(
            store.set_raw("rotateInterval", json!("often")).await,
            Err(StoreError::InvalidValue { .. })
        ));
        assert!(matches!(
            store.set_raw("nope", json!(1)).await,
            Err(StoreError::UnknownKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropping_store_stops_pumps() {
        let bus = LocalBus::new();
        let store = window("a", &Arc::new(MemoryBackend::new()), &bus);
        store.init().await;
        assert_eq!(bus.subscriber_count("theme-update"), 1);

        drop(store);
        tokio::time::timeout(Duration::from_secs(2), async {
            while bus.subscriber_count("theme-update") > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("pump still subscribed after store was dropped");
    }
}
