use crate::core::TaskId;
use crate::executor::{Outcome, StartParam, TaskExecutor};

struct Slot {
    executor: Box<dyn TaskExecutor>,
    task: Option<TaskId>,
}

/// The executors registered for one resource type.
///
/// Busy executors are kept packed at the front of `slots`: the first
/// `running` entries are busy, the rest are free. A finished executor is
/// swapped behind the last busy one, so the next free executor is always at
/// index `running`.
#[derive(Default)]
pub(crate) struct ResourcePool {
    slots: Vec<Slot>,
    running: usize,
}

impl ResourcePool {
    pub fn push(&mut self, executor: Box<dyn TaskExecutor>) {
        self.slots.push(Slot {
            executor,
            task: None,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn has_free(&self) -> bool {
        self.running < self.slots.len()
    }

    /// Starts `param` on the first free executor, or hands it back if every
    /// executor is busy.
    pub fn try_start(&mut self, id: TaskId, param: StartParam) -> Result<(), StartParam> {
        let Some(slot) = self.slots.get_mut(self.running) else {
            return Err(param);
        };

        slot.task = Some(id);
        slot.executor.start(param);
        self.running += 1;
        Ok(())
    }

    /// Polls every busy executor and reports each finished task.
    pub fn collect<F>(&mut self, mut on_finished: F)
    where
        F: FnMut(TaskId, Outcome),
    {
        let mut i = 0;
        while i < self.running {
            let Some(outcome) = self.slots[i].executor.propagate_cb() else {
                i += 1;
                continue;
            };

            let task = self.slots[i].task.take();
            self.running -= 1;
            self.slots.swap(i, self.running);

            if let Some(task) = task {
                on_finished(task, outcome);
            }
        }
    }
}
