//! In-memory store
//!
//! Used for development runs without a database and by tests.

use async_trait::async_trait;
use keel_core::{ControlError, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::ResourceStore;

/// Store keeping objects in a map guarded by a mutex
pub struct InMemoryStore<T> {
    items: Mutex<BTreeMap<String, T>>,
    writes: AtomicUsize,
}

impl<T: Clone> InMemoryStore<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Inserts or replaces an object without going through the trait
    pub fn seed(&self, key: &str, value: T) {
        self.items.lock().unwrap().insert(key.to_string(), value);
    }

    /// Current object for `key`, if any
    pub fn peek(&self, key: &str) -> Option<T> {
        self.items.lock().unwrap().get(key).cloned()
    }

    /// Number of successful writes through the trait
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn replace(&self, key: &str, value: &T) -> Result<()> {
        let mut items = self.items.lock().unwrap();
        match items.get_mut(key) {
            Some(existing) => {
                *existing = value.clone();
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ControlError::NotFound(key.to_string())),
        }
    }
}

impl<T: Clone> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> ResourceStore<T> for InMemoryStore<T>
where
    T: Clone + Send + Sync,
{
    async fn get(&self, key: &str) -> Result<T> {
        self.peek(key)
            .ok_or_else(|| ControlError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<T>> {
        Ok(self.items.lock().unwrap().values().cloned().collect())
    }

    async fn create(&self, key: &str, value: &T) -> Result<()> {
        let mut items = self.items.lock().unwrap();
        if items.contains_key(key) {
            return Err(ControlError::AlreadyExists(key.to_string()));
        }
        items.insert(key.to_string(), value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, key: &str, value: &T) -> Result<()> {
        self.replace(key, value)
    }

    async fn update_status(&self, key: &str, value: &T) -> Result<()> {
        self.replace(key, value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut items = self.items.lock().unwrap();
        match items.remove(key) {
            Some(_) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ControlError::NotFound(key.to_string())),
        }
    }
}
