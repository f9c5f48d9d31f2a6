//! Fixed-capacity plugin slot array.
//!
//! Slots are swapped atomically so the audio thread can walk them without
//! locking. Occupancy only changes from the main thread (append, replace) or
//! through a [`PendingAction`](crate::PendingAction) applied between blocks.

use crate::action::{PendingAction, PendingActionOpcode};
use arc_swap::ArcSwapOption;
use cadenza_core::PeakMeters;
use cadenza_plugin::Plugin;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One occupied slot: the plugin and its meters.
pub struct PluginSlot {
    pub plugin: Arc<dyn Plugin>,
    pub peaks: PeakMeters,
}

impl PluginSlot {
    pub fn new(plugin: Arc<dyn Plugin>) -> Arc<Self> {
        Arc::new(Self {
            plugin,
            peaks: PeakMeters::default(),
        })
    }
}

impl std::fmt::Debug for PluginSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSlot")
            .field("plugin", self.plugin.common())
            .finish()
    }
}

pub(crate) struct Registry {
    slots: Box<[ArcSwapOption<PluginSlot>]>,
    count: AtomicU32,
    /// Slot the next added plugin replaces, set by `replace_plugin`.
    replace_target: Mutex<Option<u32>>,
}

impl Registry {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: (0..capacity).map(|_| ArcSwapOption::empty()).collect(),
            count: AtomicU32::new(0),
            replace_target: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn slot(&self, id: u32) -> Option<Arc<PluginSlot>> {
        self.slots.get(id as usize)?.load_full()
    }

    /// Borrow slot `id` without touching its reference count.
    pub fn with_slot<R>(&self, id: u32, f: impl FnOnce(&PluginSlot) -> R) -> Option<R> {
        let guard = self.slots.get(id as usize)?.load();
        guard.as_deref().map(f)
    }

    pub fn plugin(&self, id: u32) -> Option<Arc<dyn Plugin>> {
        self.slot(id).map(|slot| Arc::clone(&slot.plugin))
    }

    /// Every occupied slot below the current count, in index order.
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        (0..self.count()).filter_map(|id| self.plugin(id)).collect()
    }

    /// Store `plugin` at the end and publish the new count.
    pub fn append(&self, plugin: Arc<dyn Plugin>) -> Option<u32> {
        let id = self.count();
        let cell = self.slots.get(id as usize)?;
        cell.store(Some(PluginSlot::new(plugin)));
        self.count.store(id + 1, Ordering::Release);
        Some(id)
    }

    /// Put `plugin` into slot `id`, returning the slot it replaced.
    pub fn replace(&self, id: u32, plugin: Arc<dyn Plugin>) -> Option<Arc<PluginSlot>> {
        self.slots
            .get(id as usize)?
            .swap(Some(PluginSlot::new(plugin)))
    }

    /// Empty every slot, returning them in reverse index order.
    pub fn take_all(&self, count: u32) -> Vec<Arc<PluginSlot>> {
        (0..count.min(self.capacity()))
            .rev()
            .filter_map(|id| self.slots[id as usize].swap(None))
            .collect()
    }

    pub fn replace_target(&self) -> Option<u32> {
        *self.replace_target.lock()
    }

    pub fn set_replace_target(&self, id: Option<u32>) {
        *self.replace_target.lock() = id;
    }

    /// Apply a structural action. Never allocates and never drops a plugin.
    pub fn apply(&self, action: PendingAction) {
        match action.opcode {
            PendingActionOpcode::Null => {}
            PendingActionOpcode::RemovePlugin => {
                let count = self.count();
                let id = action.plugin_id;
                if id >= count {
                    return;
                }
                let last = count - 1;
                self.count.store(last, Ordering::Release);

                for i in id..last {
                    let next = self.slots[i as usize + 1].swap(None);
                    if let Some(slot) = &next {
                        slot.plugin.common().set_id(i);
                    }
                    self.slots[i as usize].store(next);
                }
                if id == last {
                    self.slots[last as usize].store(None);
                }
            }
            PendingActionOpcode::ZeroCount => {
                self.count.store(0, Ordering::Release);
            }
            PendingActionOpcode::SwitchPlugins => {
                let (a, b) = (action.plugin_id, action.second_id);
                let count = self.count();
                if a >= count || b >= count || a == b {
                    return;
                }
                let slot_a = self.slots[a as usize].swap(None);
                let slot_b = self.slots[b as usize].swap(slot_a);
                self.slots[a as usize].store(slot_b);

                for id in [a, b] {
                    self.with_slot(id, |slot| slot.plugin.common().set_id(id));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubPlugin;

    fn filled(names: &[&str]) -> Registry {
        let registry = Registry::new(8);
        for (id, name) in names.iter().enumerate() {
            registry.append(StubPlugin::arc(id as u32, name));
        }
        registry
    }

    fn names(registry: &Registry) -> Vec<String> {
        registry.plugins().iter().map(|p| p.name()).collect()
    }

    #[test]
    fn test_append_until_full() {
        let registry = Registry::new(2);
        assert_eq!(registry.append(StubPlugin::arc(0, "a")), Some(0));
        assert_eq!(registry.append(StubPlugin::arc(1, "b")), Some(1));
        assert_eq!(registry.append(StubPlugin::arc(2, "c")), None);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_remove_shifts_and_renumbers() {
        let registry = filled(&["a", "b", "c"]);
        let removed = registry.slot(0).unwrap();
        registry.apply(PendingAction::remove_plugin(0));

        assert_eq!(registry.count(), 2);
        assert_eq!(names(&registry), ["b", "c"]);
        for (id, plugin) in registry.plugins().iter().enumerate() {
            assert_eq!(plugin.id(), id as u32);
        }
        assert!(registry.slot(2).is_none());
        assert_eq!(removed.plugin.name(), "a");
    }

    #[test]
    fn test_remove_last() {
        let registry = filled(&["a", "b"]);
        registry.apply(PendingAction::remove_plugin(1));
        assert_eq!(names(&registry), ["a"]);
        assert!(registry.slot(1).is_none());
    }

    #[test]
    fn test_switch_swaps_ids() {
        let registry = filled(&["a", "b", "c"]);
        registry.apply(PendingAction::switch_plugins(0, 2));
        assert_eq!(names(&registry), ["c", "b", "a"]);
        assert_eq!(registry.plugin(0).unwrap().id(), 0);
        assert_eq!(registry.plugin(2).unwrap().id(), 2);
    }

    #[test]
    fn test_zero_count_then_take_all() {
        let registry = filled(&["a", "b", "c"]);
        registry.apply(PendingAction::zero_count());
        assert_eq!(registry.count(), 0);
        let taken = registry.take_all(3);
        let taken: Vec<String> = taken.iter().map(|s| s.plugin.name()).collect();
        assert_eq!(taken, ["c", "b", "a"]);
        assert!(registry.slot(0).is_none());
    }
}
