use super::core::{ActionContext, ActionItem};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a slot carries to the worker.
pub(crate) struct SlotTask {
    pub(crate) item: Arc<ActionItem>,
    pub(crate) ctx: ActionContext,
}

/// A recyclable carrier for one Async invocation.
pub struct ActionSlot {
    running: AtomicBool,
    task: Mutex<Option<SlotTask>>,
}

impl ActionSlot {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn take_task(&self) -> Option<SlotTask> {
        self.task.lock().take()
    }
}

/// Slots grow on demand and are reused once their running flag drops.
#[derive(Default)]
pub struct SlotPool {
    slots: Mutex<Vec<Arc<ActionSlot>>>,
}

impl SlotPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an idle slot (or a new one) and load it.
    pub(crate) fn acquire(&self, item: Arc<ActionItem>, ctx: ActionContext) -> Arc<ActionSlot> {
        let mut slots = self.slots.lock();
        let slot = match slots.iter().find(|s| !s.is_running()) {
            Some(idle) => Arc::clone(idle),
            None => {
                let fresh = Arc::new(ActionSlot::new());
                slots.push(Arc::clone(&fresh));
                fresh
            }
        };
        slot.running.store(true, Ordering::Release);
        *slot.task.lock() = Some(SlotTask { item, ctx });
        slot
    }

    /// Return a slot to the pool. Done under the pool lock so `acquire`
    /// never sees a half-reset slot.
    pub(crate) fn release(&self, slot: &ActionSlot) {
        let _slots = self.slots.lock();
        slot.task.lock().take();
        slot.running.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots currently carrying an invocation.
    #[must_use]
    pub fn running(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_running()).count()
    }
}
