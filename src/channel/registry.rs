use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Names of the channels currently held open through one client.
#[derive(Debug, Default)]
pub(crate) struct ChannelRegistry {
    live: Mutex<HashSet<String>>,
}

impl ChannelRegistry {
    pub(crate) fn is_live(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive claim on a channel name, released on drop.
#[derive(Debug)]
pub(crate) struct ChannelLease {
    registry: Arc<ChannelRegistry>,
    name: String,
}

impl ChannelLease {
    /// Claims `name`, or returns `None` if another session holds it.
    pub(crate) fn acquire(registry: &Arc<ChannelRegistry>, name: &str) -> Option<Self> {
        if !registry.lock().insert(name.to_owned()) {
            return None;
        }
        Some(Self {
            registry: Arc::clone(registry),
            name: name.to_owned(),
        })
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.name);
    }
}
