//! # Worker Pool
//!
//! A fixed set of OS threads draining one [`EventQueue`]. Each agent loops:
//!
//! ```text
//!   pop ──► Stop ──► exit
//!    │
//!    └──► execute(command, slot) ──► finish slot ──► last? ──► release + complete
//! ```
//!
//! The pool owns its threads. Dropping it shuts the queue down and joins
//! every agent.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::command::{Command, SlotIndex};
use crate::error::{ClError, ClResult};
use crate::queue::{EventQueue, Popped};

// =============================================================================
// DISPATCH TRAIT
// =============================================================================

/// Device-specific command execution
pub trait Dispatch: Send + Sync {
    /// Attach device state to a command before it is queued
    fn prepare(&self, command: &Command) -> ClResult<()>;

    /// Run a command, or one reserved slot of a kernel launch
    fn execute(&self, command: &Command, slot: Option<SlotIndex>) -> ClResult<()>;

    /// Detach device state once the command has finished
    fn release(&self, command: &Command);
}

// =============================================================================
// WORKER POOL
// =============================================================================

/// Execution agents of one device
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    queue: Arc<EventQueue>,
    agents: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` agents named `{name}-{index}` on `queue`
    pub fn spawn(
        name: &str,
        count: usize,
        queue: Arc<EventQueue>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> ClResult<Self> {
        let mut pool = Self {
            name: name.to_owned(),
            queue,
            agents: Vec::with_capacity(count),
        };

        for index in 0..count {
            let queue = pool.queue.clone();
            let dispatcher = dispatcher.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || agent_loop(&queue, dispatcher.as_ref()));
            match spawned {
                Ok(handle) => pool.agents.push(handle),
                Err(err) => {
                    log::error!("{}: spawning agent {} failed: {}", name, index, err);
                    pool.shutdown_and_join();
                    return Err(ClError::OutOfResources);
                },
            }
        }

        log::debug!("{}: {} agents started", name, count);
        Ok(pool)
    }

    /// Number of agents still owned by the pool
    pub fn agents(&self) -> usize {
        self.agents.len()
    }

    /// Queue the agents drain
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Raise shutdown and join every agent
    pub fn shutdown_and_join(&mut self) {
        self.queue.shutdown();
        for handle in self.agents.drain(..) {
            if handle.join().is_err() {
                log::error!("{}: agent panicked", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn agent_loop(queue: &EventQueue, dispatcher: &dyn Dispatch) {
    loop {
        match queue.pop() {
            Popped::Stop => break,
            Popped::Command { command, slot } => run(dispatcher, &command, slot),
        }
    }
}

fn run(dispatcher: &dyn Dispatch, command: &Command, slot: Option<SlotIndex>) {
    command.event().mark_running();
    let result = dispatcher.execute(command, slot);

    let finished = match command.launch() {
        Some(launch) => launch.slots().finish(result),
        None => Some(result),
    };

    if let Some(result) = finished {
        dispatcher.release(command);
        if let Err(err) = result {
            log::warn!("command {} ({}) failed: {}", command.id().0, command.name(), err);
        }
        command.event().complete(result);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::command::{DeviceId, Executable, KernelBinding, LaunchGeometry};
    use crate::event::CommandStatus;

    struct Noop;

    impl KernelBinding for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn executable_for(&self, _root: DeviceId) -> Option<Arc<dyn Executable>> {
            None
        }
    }

    #[derive(Default)]
    struct Recorder {
        executed: Mutex<Vec<(u64, Option<SlotIndex>)>>,
        released: AtomicUsize,
        fail_slot: Option<SlotIndex>,
    }

    impl Dispatch for Recorder {
        fn prepare(&self, _command: &Command) -> ClResult<()> {
            Ok(())
        }

        fn execute(&self, command: &Command, slot: Option<SlotIndex>) -> ClResult<()> {
            self.executed.lock().unwrap().push((command.id().0, slot));
            if slot.is_some() && slot == self.fail_slot {
                return Err(ClError::KernelFault("slot failed"));
            }
            Ok(())
        }

        fn release(&self, _command: &Command) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_single_agent_runs_in_order() {
        let queue = Arc::new(EventQueue::new());
        let recorder = Arc::new(Recorder::default());
        let _pool = WorkerPool::spawn("test", 1, queue.clone(), recorder.clone()).unwrap();

        let commands: Vec<_> = (0..8).map(|_| Command::marker()).collect();
        for c in &commands {
            queue.push(c.clone());
        }
        for c in &commands {
            assert_eq!(c.event().wait(), Ok(()));
        }

        let order: Vec<_> = recorder.executed.lock().unwrap().iter().map(|e| e.0).collect();
        let expected: Vec<_> = commands.iter().map(|c| c.id().0).collect();
        assert_eq!(order, expected);
        assert_eq!(recorder.released.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_launch_completes_after_every_slot() {
        let queue = Arc::new(EventQueue::new());
        let recorder = Arc::new(Recorder::default());
        let _pool = WorkerPool::spawn("test", 4, queue.clone(), recorder.clone()).unwrap();

        let launch = Command::nd_range(Arc::new(Noop), LaunchGeometry::task(), 6);
        queue.push(launch.clone());
        assert_eq!(launch.event().wait(), Ok(()));

        let mut slots: Vec<_> = recorder
            .executed
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.1)
            .collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(recorder.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_slot_failure_fails_launch() {
        let queue = Arc::new(EventQueue::new());
        let recorder = Arc::new(Recorder {
            fail_slot: Some(1),
            ..Recorder::default()
        });
        let _pool = WorkerPool::spawn("test", 2, queue.clone(), recorder.clone()).unwrap();

        let launch = Command::nd_range(Arc::new(Noop), LaunchGeometry::task(), 3);
        queue.push(launch.clone());
        assert_eq!(launch.event().wait(), Err(ClError::KernelFault("slot failed")));
        assert_eq!(recorder.executed.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_drop_joins_and_abandons() {
        let queue = Arc::new(EventQueue::new());
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::spawn("test", 3, queue.clone(), recorder.clone()).unwrap();
        assert_eq!(pool.agents(), 3);
        drop(pool);

        let late = Command::marker();
        queue.push(late.clone());
        assert_eq!(late.event().wait_timeout(Duration::from_millis(20)), None);
        assert_eq!(late.event().status(), CommandStatus::Submitted);
        assert!(recorder.executed.lock().unwrap().is_empty());
    }
}
