//! Deferred plugin deletion.
//!
//! Plugins leaving the registry are parked here and dropped from `idle()`,
//! once the audio thread no longer holds their slot.

use crate::registry::PluginSlot;
use cadenza_plugin::Plugin;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct DeletionQueue {
    pending: Mutex<Vec<Arc<PluginSlot>>>,
}

impl DeletionQueue {
    /// Queue a slot that is no longer reachable from the registry.
    pub fn push(&self, slot: Arc<PluginSlot>) {
        slot.plugin.prepare_for_deletion();
        self.pending.lock().push(slot);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn contains(&self, plugin: &Arc<dyn Plugin>) -> bool {
        self.pending
            .lock()
            .iter()
            .any(|slot| Arc::ptr_eq(&slot.plugin, plugin))
    }

    /// Drop every queued slot nobody else references. Returns how many went.
    pub fn drain(&self) -> usize {
        let released: Vec<Arc<PluginSlot>> = {
            let mut pending = self.pending.lock();
            let (free, busy): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|slot| Arc::strong_count(slot) == 1);
            *pending = busy;
            free
        };
        let count = released.len();
        for slot in &released {
            tracing::debug!("Deleting plugin '{}'", slot.plugin.name());
        }
        drop(released);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubPlugin;

    #[test]
    fn test_push_disables_plugin() {
        let queue = DeletionQueue::default();
        let plugin = StubPlugin::arc(0, "a");
        plugin.common().set_enabled(true);
        queue.push(PluginSlot::new(Arc::clone(&plugin)));

        assert!(!plugin.is_enabled());
        assert!(queue.contains(&plugin));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_keeps_referenced_slots() {
        let queue = DeletionQueue::default();
        let held = PluginSlot::new(StubPlugin::arc(0, "held"));
        queue.push(Arc::clone(&held));
        queue.push(PluginSlot::new(StubPlugin::arc(1, "free")));

        assert_eq!(queue.drain(), 1);
        assert_eq!(queue.len(), 1);

        drop(held);
        assert_eq!(queue.drain(), 1);
        assert_eq!(queue.len(), 0);
    }
}
