//! Poll registrations and the per-channel registry

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identifier the proxy assigns to a poll
pub type PollId = u32;

/// Opaque value handed back to the poll callback
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Callback invoked from the dispatch thread for every poll push
pub type PollCallback = Arc<dyn Fn(&PollEvent) + Send + Sync>;

/// What to poll and how often
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRequest {
    pub delay_ms: u32,
    pub address: u8,
    pub register: u8,
    pub count: usize,
}

/// One poll push, as delivered to the callback
#[derive(Clone)]
pub struct PollEvent {
    pub poll_id: PollId,
    pub address: u8,
    pub register: u8,
    /// `None` when the proxy reported a read error or the line was malformed
    pub values: Option<Vec<i32>>,
    pub user_data: Option<UserData>,
}

impl PollEvent {
    /// Downcast the user data to a concrete type
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.user_data.as_deref().and_then(|d| d.downcast_ref::<T>())
    }
}

impl fmt::Debug for PollEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollEvent")
            .field("poll_id", &self.poll_id)
            .field("address", &self.address)
            .field("register", &self.register)
            .field("values", &self.values)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

/// A live poll owned by a channel
pub struct PollRegistration {
    pub id: PollId,
    pub request: PollRequest,
    pub user_data: Option<UserData>,
    pub callback: PollCallback,
}

impl PollRegistration {
    /// Build the event for a decoded push
    pub fn event(&self, values: Option<Vec<i32>>) -> PollEvent {
        PollEvent {
            poll_id: self.id,
            address: self.request.address,
            register: self.request.register,
            values,
            user_data: self.user_data.clone(),
        }
    }
}

impl fmt::Debug for PollRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollRegistration")
            .field("id", &self.id)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Poll id → registration map. Lookups hand out `Arc`s so callbacks run
/// without the registry locked.
#[derive(Default)]
pub struct PollRegistry {
    entries: Mutex<HashMap<PollId, Arc<PollRegistration>>>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a registration, replacing any stale entry with the same id
    pub fn insert(&self, registration: PollRegistration) {
        let id = registration.id;
        if self
            .entries
            .lock()
            .insert(id, Arc::new(registration))
            .is_some()
        {
            log::warn!("Poll {} re-registered, replacing stale entry", id);
        }
    }

    pub fn remove(&self, id: PollId) -> Option<Arc<PollRegistration>> {
        self.entries.lock().remove(&id)
    }

    pub fn get(&self, id: PollId) -> Option<Arc<PollRegistration>> {
        self.entries.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: PollId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
