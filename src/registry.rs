//! Peer registry: bidirectional peer id <-> connection handle mapping.
//!
//! The registry itself is not synchronized. The broker keeps it behind a
//! single mutex so the uniqueness check and the insert happen in one
//! critical section.

use std::collections::HashMap;
use std::hash::Hash;

use tracing::debug;

use crate::{Error, Result};

/// In-memory mapping between peer ids and the connections that own them.
///
/// Invariants: an id is bound to at most one handle and a handle owns at
/// most one id.
#[derive(Debug)]
pub struct Registry<H> {
    by_id: HashMap<String, H>,
    by_handle: HashMap<H, String>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_handle: HashMap::new(),
        }
    }
}

impl<H> Registry<H>
where
    H: Clone + Eq + Hash,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to `handle`.
    ///
    /// Re-registering the same id on the same handle is a no-op. Registering a
    /// different id releases the handle's previous id first. Fails with
    /// [`Error::IdentifierTaken`] if another handle owns `id`.
    pub fn register(&mut self, handle: &H, id: &str) -> Result<String> {
        if let Some(previous) = self.by_handle.get(handle) {
            if previous == id {
                return Ok(id.to_string());
            }
            let previous = previous.clone();
            debug!(%previous, new = %id, "releasing previous id");
            self.by_id.remove(&previous);
            self.by_handle.remove(handle);
        }

        if self.by_id.contains_key(id) {
            return Err(Error::IdentifierTaken(id.to_string()));
        }

        debug!(%id, "add");
        self.by_id.insert(id.to_string(), handle.clone());
        self.by_handle.insert(handle.clone(), id.to_string());
        Ok(id.to_string())
    }

    /// Release whatever id `handle` owns. Idempotent.
    pub fn unregister(&mut self, handle: &H) -> Option<String> {
        let id = self.by_handle.remove(handle)?;
        debug!(%id, "remove");
        self.by_id.remove(&id);
        Some(id)
    }

    /// Handle bound to `id`.
    pub fn find(&self, id: &str) -> Option<&H> {
        self.by_id.get(id)
    }

    /// Id owned by `handle`.
    pub fn id_of(&self, handle: &H) -> Option<&str> {
        self.by_handle.get(handle).map(String::as_str)
    }

    /// Whether `id` is bound locally.
    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
