use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::backend::{self, lock, Backend};
use crate::bus::EventBus;
use crate::error::StoreError;
use crate::schema::Schema;
use crate::store::{Listener, Store};

static NEXT_WINDOW: AtomicU64 = AtomicU64::new(0);

/// One-time setup run against a ready store. Returned listeners live as long as the window.
pub type SetupHook = Box<dyn FnOnce(&Store) -> Result<Vec<Listener>, StoreError> + Send>;

#[derive(Default)]
struct Setup {
    hooks: Vec<SetupHook>,
    done: bool,
}

/// A UI surface with its own store
pub struct Window {
    label: String,
    store: Store,
    setup: Mutex<Setup>,
    listeners: Mutex<Vec<Listener>>,
    /// Set once setup has run, holding the first hook failure if any
    initialized: OnceCell<Option<String>>,
}

impl Window {
    pub fn new(
        label: &str,
        schema: Arc<Schema>,
        backend: Option<Arc<dyn Backend>>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let id = format!(
            "{}#{}-{}",
            label,
            std::process::id(),
            NEXT_WINDOW.fetch_add(1, Ordering::Relaxed)
        );
        tracing::debug!("Creating window {}", id);

        Self {
            label: label.to_string(),
            store: Store::new(id, schema, backend, bus),
            setup: Mutex::new(Setup::default()),
            listeners: Mutex::new(Vec::new()),
            initialized: OnceCell::new(),
        }
    }

    /// Open the store file at `store_path`. If it cannot be opened the window
    /// keeps working in memory and nothing it sets is persisted.
    pub fn open(
        label: &str,
        schema: Arc<Schema>,
        store_path: &Path,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let backend = match backend::open(store_path) {
            Ok(backend) => Some(backend as Arc<dyn Backend>),
            Err(e) => {
                tracing::error!("Window {} continues without persistence: {}", label, e);
                None
            }
        };
        Self::new(label, schema, backend, bus)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn id(&self) -> &str {
        self.store.window_id()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Register a hook to run once the store is ready.
    /// On an already initialized window the hook runs immediately.
    pub fn on_setup<F>(&self, hook: F) -> Result<(), StoreError>
    where
        F: FnOnce(&Store) -> Result<Vec<Listener>, StoreError> + Send + 'static,
    {
        {
            let mut setup = lock(&self.setup);
            if !setup.done {
                setup.hooks.push(Box::new(hook));
                return Ok(());
            }
        }
        self.run_hook(Box::new(hook))
    }

    /// Hydrate the store, then run setup hooks. Safe to call more than once.
    /// A failed setup keeps failing on later calls.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.store.init().await;

        let mut outcome = None;
        let slot = &mut outcome;
        let failure = self
            .initialized
            .get_or_init(|| async move {
                let result = self.run_hooks();
                let failure = result.as_ref().err().map(ToString::to_string);
                *slot = Some(result);
                failure
            })
            .await;

        match (outcome, failure) {
            (Some(result), _) => result,
            (None, Some(reason)) => Err(StoreError::Setup {
                reason: reason.clone(),
            }),
            (None, None) => Ok(()),
        }
    }

    /// Every hook runs even if an earlier one fails; the first error is returned.
    fn run_hooks(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        loop {
            let hooks = {
                let mut setup = lock(&self.setup);
                if setup.hooks.is_empty() {
                    setup.done = true;
                    break;
                }
                std::mem::take(&mut setup.hooks)
            };

            for hook in hooks {
                if let Err(e) = self.run_hook(hook) {
                    tracing::error!("Setup hook of window {} failed: {}", self.id(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::debug!("Window {} setup complete", self.id());
        first_error.map_or(Ok(()), Err)
    }

    fn run_hook(&self, hook: SetupHook) -> Result<(), StoreError> {
        let listeners = hook(&self.store)?;
        lock(&self.listeners).extend(listeners);
        Ok(())
    }
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("label", &self.label)
            .field("store", &self.store)
            .finish()
    }
}
