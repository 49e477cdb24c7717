//! Resource handles
//!
//! Fetched document bytes are registered with the [`HandleManager`] and
//! exposed under a local `blob:` address, the way a browser hands out object
//! URLs. An address dereferences only while its handle is live; releasing
//! revokes it.
//!
//! Invariants:
//! - at most one live handle per session
//! - each handle is released at most once (`release` is idempotent)
//! - dropping the last manager clone releases everything still live

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

/// Address scheme prefix for handles
pub const HANDLE_SCHEME: &str = "blob:paper-loader/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("Session {0} already holds a live handle")]
    AlreadyHeld(Uuid),
}

/// Locally addressable view of fetched document bytes
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    id: Uuid,
    session_id: Uuid,
    bytes: Bytes,
    acquired_at: DateTime<Utc>,
}

impl ResourceHandle {
    /// Handle identity, also the last segment of its address
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Session that owns this handle
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Local address, resolvable through [`HandleManager::resolve`] while live
    pub fn address(&self) -> String {
        format!("{}{}", HANDLE_SCHEME, self.id)
    }

    /// Size of the held document in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The held document
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// When the handle was acquired
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// `data:` URI for surfaces that cannot dereference local addresses
    pub fn to_data_uri(&self) -> String {
        format!(
            "data:application/pdf;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// Registry of live handles, cheap to clone
#[derive(Clone, Default)]
pub struct HandleManager {
    inner: Arc<HandleManagerInner>,
}

#[derive(Default)]
struct HandleManagerInner {
    /// Live handles by handle id
    live: Mutex<HashMap<Uuid, ResourceHandle>>,
}

impl HandleManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `bytes` in a new handle owned by `session_id`
    pub fn acquire(&self, session_id: Uuid, bytes: Bytes) -> Result<ResourceHandle, HandleError> {
        let mut live = self.inner.live.lock();

        if live.values().any(|h| h.session_id == session_id) {
            return Err(HandleError::AlreadyHeld(session_id));
        }

        let handle = ResourceHandle {
            id: Uuid::new_v4(),
            session_id,
            bytes,
            acquired_at: Utc::now(),
        };
        live.insert(handle.id, handle.clone());

        tracing::debug!(
            session_id = %session_id,
            handle_id = %handle.id,
            bytes = handle.len(),
            "Acquired resource handle"
        );

        Ok(handle)
    }

    /// Release a handle. Returns `false` if it was already released.
    pub fn release(&self, handle: &ResourceHandle) -> bool {
        self.release_id(handle.id)
    }

    /// Release whatever handle `session_id` holds
    pub fn release_session(&self, session_id: Uuid) -> bool {
        let id = {
            let live = self.inner.live.lock();
            live.values()
                .find(|h| h.session_id == session_id)
                .map(|h| h.id)
        };
        id.is_some_and(|id| self.release_id(id))
    }

    fn release_id(&self, id: Uuid) -> bool {
        let removed = self.inner.live.lock().remove(&id);
        match removed {
            Some(handle) => {
                tracing::debug!(
                    session_id = %handle.session_id,
                    handle_id = %id,
                    "Released resource handle"
                );
                true
            }
            None => false,
        }
    }

    /// Dereference a handle address
    pub fn resolve(&self, address: &str) -> Option<Bytes> {
        let id = address.strip_prefix(HANDLE_SCHEME)?;
        let id = Uuid::parse_str(id).ok()?;
        self.inner.live.lock().get(&id).map(|h| h.bytes.clone())
    }

    /// Whether `handle` has not been released yet
    pub fn is_live(&self, handle: &ResourceHandle) -> bool {
        self.inner.live.lock().contains_key(&handle.id)
    }

    /// Number of handles not yet released
    pub fn live_count(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Release every live handle. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let drained: Vec<_> = self.inner.live.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Released all resource handles");
        }
        drained.len()
    }
}

impl Drop for HandleManagerInner {
    fn drop(&mut self) {
        let count = self.live.get_mut().len();
        if count > 0 {
            tracing::debug!(count = count, "Releasing resource handles on shutdown");
        }
    }
}
