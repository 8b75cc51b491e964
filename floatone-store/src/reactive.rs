use std::marker::PhantomData;

use serde_json::Value;
use tokio::sync::watch;

use crate::error::StoreError;
use crate::schema::StoreValue;
use crate::store::decode;

/// Live view of one key, obtained from [`Store::use_key`](crate::Store::use_key).
///
/// The underlying channel is only written when the value changes
/// structurally, so `changed` never wakes for equal values or for other keys.
pub struct Binding<V> {
    key: &'static str,
    rx: watch::Receiver<Value>,
    _marker: PhantomData<fn() -> V>,
}

impl<V: StoreValue> Binding<V> {
    pub(crate) fn new(key: &'static str, rx: watch::Receiver<Value>) -> Self {
        Self {
            key,
            rx,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn get(&self) -> Result<V, StoreError> {
        decode(self.key, &self.rx.borrow())
    }

    /// Whether a value arrived that `changed` has not returned yet
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Wait for the next value. Fails with `Closed` once the store is gone.
    pub async fn changed(&mut self) -> Result<V, StoreError> {
        self.rx.changed().await.map_err(|_| StoreError::Closed)?;
        decode(self.key, &self.rx.borrow_and_update())
    }

    /// Project the value; the selector only wakes when the projection changes
    pub fn select<T, F>(self, project: F) -> Result<Selector<V, T, F>, StoreError>
    where
        T: PartialEq + Clone,
        F: Fn(&V) -> T,
    {
        let current = project(&self.get()?);
        Ok(Selector {
            binding: self,
            project,
            current,
        })
    }
}

impl<V> Clone for Binding<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            rx: self.rx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> std::fmt::Debug for Binding<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding").field("key", &self.key).finish()
    }
}

/// A projection over a [`Binding`]
pub struct Selector<V, T, F> {
    binding: Binding<V>,
    project: F,
    current: T,
}

impl<V, T, F> Selector<V, T, F>
where
    V: StoreValue,
    T: PartialEq + Clone,
    F: Fn(&V) -> T,
{
    pub fn get(&self) -> &T {
        &self.current
    }

    /// Wait until the projected value differs from the last one returned
    pub async fn changed(&mut self) -> Result<T, StoreError> {
        loop {
            let value = self.binding.changed().await?;
            let next = (self.project)(&value);
            if next != self.current {
                self.current = next.clone();
                return Ok(next);
            }
        }
    }
}
