//! Synchronization between structural registry changes and the audio thread.
//!
//! A structural change is described by a [`PendingAction`]. While the engine
//! is running, the action is posted and applied by the audio thread between
//! two blocks; otherwise (or when the audio thread does not pick it up in
//! time) the posting thread applies it itself. Either way no block ever sees
//! a half-applied change.
//!
//! [`RunnerGate`] pauses block processing entirely: while a
//! [`RunnerStopper`] is alive, `process()` emits silence.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const ACTION_WAIT_ROUNDS: u32 = 10;
const ACTION_WAIT_STEP: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingActionOpcode {
    #[default]
    Null,
    RemovePlugin,
    ZeroCount,
    SwitchPlugins,
}

/// A structural change waiting to be applied between two blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingAction {
    pub opcode: PendingActionOpcode,
    pub plugin_id: u32,
    pub second_id: u32,
}

impl PendingAction {
    pub fn remove_plugin(id: u32) -> Self {
        Self {
            opcode: PendingActionOpcode::RemovePlugin,
            plugin_id: id,
            second_id: 0,
        }
    }

    pub fn zero_count() -> Self {
        Self {
            opcode: PendingActionOpcode::ZeroCount,
            ..Self::default()
        }
    }

    pub fn switch_plugins(id_a: u32, id_b: u32) -> Self {
        Self {
            opcode: PendingActionOpcode::SwitchPlugins,
            plugin_id: id_a,
            second_id: id_b,
        }
    }

    pub fn is_null(&self) -> bool {
        self.opcode == PendingActionOpcode::Null
    }
}

/// Single slot holding the next structural action.
#[derive(Debug, Default)]
pub(crate) struct ActionSlot {
    next: Mutex<PendingAction>,
    done: Condvar,
}

impl ActionSlot {
    pub fn is_pending(&self) -> bool {
        !self.next.lock().is_null()
    }

    /// Post `action` and return once it has been applied.
    ///
    /// With `wait_for_runner`, the audio thread gets up to two seconds to
    /// apply it; after that, or without waiting, `apply` runs here.
    pub fn post(
        &self,
        action: PendingAction,
        wait_for_runner: bool,
        apply: impl FnOnce(PendingAction),
    ) {
        let mut next = self.next.lock();
        *next = action;

        if wait_for_runner {
            for _ in 0..ACTION_WAIT_ROUNDS {
                if next.is_null() {
                    break;
                }
                self.done.wait_for(&mut next, ACTION_WAIT_STEP);
            }
        }

        if !next.is_null() {
            if wait_for_runner {
                tracing::warn!("Timeout waiting for the audio thread to apply {:?}", action.opcode);
            }
            apply(*next);
            *next = PendingAction::default();
        }
    }

    /// Apply the posted action, if any, without ever blocking.
    ///
    /// Called by the audio thread at the end of each block.
    pub fn run_pending(&self, apply: impl FnOnce(PendingAction)) {
        let Some(mut next) = self.next.try_lock() else {
            return;
        };
        if next.is_null() {
            return;
        }
        apply(*next);
        *next = PendingAction::default();
        drop(next);
        self.done.notify_all();
    }
}

/// Counter of active [`RunnerStopper`]s.
#[derive(Debug, Default)]
pub(crate) struct RunnerGate {
    stoppers: AtomicU32,
}

impl RunnerGate {
    pub fn stop(&self) -> RunnerStopper<'_> {
        self.stoppers.fetch_add(1, Ordering::AcqRel);
        RunnerStopper { gate: self }
    }

    pub fn is_stopped(&self) -> bool {
        self.stoppers.load(Ordering::Acquire) > 0
    }
}

/// Keeps block processing paused until dropped.
#[must_use]
pub(crate) struct RunnerStopper<'a> {
    gate: &'a RunnerGate,
}

impl Drop for RunnerStopper<'_> {
    fn drop(&mut self) {
        self.gate.stoppers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_post_without_runner_applies_inline() {
        let slot = ActionSlot::default();
        let mut applied = None;
        slot.post(PendingAction::remove_plugin(3), false, |action| {
            applied = Some(action)
        });
        assert_eq!(applied, Some(PendingAction::remove_plugin(3)));
        assert!(!slot.is_pending());
    }

    #[test]
    fn test_runner_applies_posted_action() {
        let slot = Arc::new(ActionSlot::default());
        let stop = Arc::new(AtomicBool::new(false));
        let applied_by_runner = Arc::new(Mutex::new(None));

        let runner = {
            let slot = Arc::clone(&slot);
            let stop = Arc::clone(&stop);
            let applied = Arc::clone(&applied_by_runner);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    slot.run_pending(|action| *applied.lock() = Some(action));
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let mut applied_inline = false;
        slot.post(PendingAction::switch_plugins(0, 1), true, |_| {
            applied_inline = true
        });
        stop.store(true, Ordering::Release);
        runner.join().unwrap();

        assert!(!applied_inline);
        assert_eq!(
            *applied_by_runner.lock(),
            Some(PendingAction::switch_plugins(0, 1))
        );
    }

    #[test]
    fn test_run_pending_ignores_empty_slot() {
        let slot = ActionSlot::default();
        let mut called = false;
        slot.run_pending(|_| called = true);
        assert!(!called);
    }

    #[test]
    fn test_runner_gate_nests() {
        let gate = RunnerGate::default();
        assert!(!gate.is_stopped());
        {
            let _outer = gate.stop();
            {
                let _inner = gate.stop();
                assert!(gate.is_stopped());
            }
            assert!(gate.is_stopped());
        }
        assert!(!gate.is_stopped());
    }
}
