//! # Event Queue
//!
//! Blocking FIFO shared by a device's agents. Producers never block; agents
//! block in [`EventQueue::pop`] until work arrives or the queue shuts down.
//!
//! The command sequence, the pending count and the shutdown flag sit behind a
//! single lock, so the pending count always equals the sequence length.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::command::{Command, SlotIndex};

/// Result of a dequeue
#[derive(Debug)]
pub enum Popped {
    /// A command, with the reserved slot for kernel launches
    Command {
        /// The dequeued command
        command: Arc<Command>,
        /// Slot reserved by this dequeue
        slot: Option<SlotIndex>,
    },
    /// The queue shut down; the agent must exit
    Stop,
}

#[derive(Debug, Default)]
struct QueueState {
    commands: VecDeque<Arc<Command>>,
    pending: usize,
    shutdown: bool,
}

/// Device command queue
#[derive(Debug, Default)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl EventQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a command and wake every waiting agent.
    ///
    /// A command is queued at most once; returns `false` and leaves the queue
    /// untouched for one that was already submitted.
    pub fn push(&self, command: Arc<Command>) -> bool {
        if !command.event().mark_submitted() {
            log::warn!("queue: {} {} already submitted", command.name(), command.id().0);
            return false;
        }
        let mut state = self.lock();
        state.commands.push_back(command);
        state.pending += 1;
        drop(state);
        self.ready.notify_all();
        true
    }

    /// Take the next unit of work, blocking while the queue is empty
    pub fn pop(&self) -> Popped {
        let mut state = self.lock();
        loop {
            state = self
                .ready
                .wait_while(state, |s| s.commands.is_empty() && !s.shutdown)
                .unwrap_or_else(PoisonError::into_inner);
            if state.shutdown {
                return Popped::Stop;
            }
            if let Some(popped) = Self::take_head(&mut state) {
                return popped;
            }
        }
    }

    /// Non-blocking [`EventQueue::pop`]; `None` when the queue is empty
    pub fn try_pop(&self) -> Option<Popped> {
        let mut state = self.lock();
        if state.shutdown {
            return Some(Popped::Stop);
        }
        Self::take_head(&mut state)
    }

    /// Dequeue from the head, dropping launches with no slot left; `None`
    /// once the sequence runs dry
    fn take_head(state: &mut QueueState) -> Option<Popped> {
        while let Some(head) = state.commands.front().cloned() {
            let slot = match head.launch() {
                Some(launch) => match launch.slots().reserve() {
                    Some((slot, last)) => {
                        if last {
                            state.commands.pop_front();
                            state.pending -= 1;
                        }
                        Some(slot)
                    },
                    None => {
                        log::warn!("queue: dropping exhausted launch {}", head.id().0);
                        state.commands.pop_front();
                        state.pending -= 1;
                        continue;
                    },
                },
                None => {
                    state.commands.pop_front();
                    state.pending -= 1;
                    None
                },
            };
            return Some(Popped::Command {
                command: head,
                slot,
            });
        }
        None
    }

    /// Stop every agent; queued commands are abandoned
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        let abandoned = state.commands.len();
        drop(state);
        if abandoned > 0 {
            log::debug!("queue: shutdown abandons {} commands", abandoned);
        }
        self.ready.notify_all();
    }

    /// Whether shutdown was requested
    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    /// Commands not yet fully dequeued
    pub fn pending(&self) -> usize {
        self.lock().pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::command::{DeviceId, Executable, KernelBinding, LaunchGeometry};

    struct Noop;

    impl KernelBinding for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn executable_for(&self, _root: DeviceId) -> Option<Arc<dyn Executable>> {
            None
        }
    }

    fn popped(p: Popped) -> (Arc<Command>, Option<SlotIndex>) {
        match p {
            Popped::Command { command, slot } => (command, slot),
            Popped::Stop => panic!("unexpected stop"),
        }
    }

    #[test]
    fn test_fifo() {
        let queue = EventQueue::new();
        let commands: Vec<_> = (0..5).map(|_| Command::marker()).collect();
        for c in &commands {
            queue.push(c.clone());
        }
        assert_eq!(queue.pending(), 5);

        for expected in &commands {
            let (command, slot) = popped(queue.pop());
            assert_eq!(command.id(), expected.id());
            assert_eq!(slot, None);
        }
        assert_eq!(queue.pending(), 0);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_reservation_exhaustion() {
        let queue = EventQueue::new();
        let launch = Command::nd_range(Arc::new(Noop), LaunchGeometry::task(), 3);
        let after = Command::marker();
        queue.push(launch.clone());
        queue.push(after.clone());

        for slot in 0..3 {
            assert_eq!(queue.pending(), 2);
            let (command, got) = popped(queue.pop());
            assert!(Arc::ptr_eq(&command, &launch));
            assert_eq!(got, Some(slot));
        }
        assert_eq!(queue.pending(), 1);

        let (command, _) = popped(queue.pop());
        assert_eq!(command.id(), after.id());
    }

    #[test]
    fn test_shutdown_abandons_queued() {
        let queue = EventQueue::new();
        for _ in 0..4 {
            queue.push(Command::marker());
        }
        queue.shutdown();
        assert!(queue.is_shut_down());
        for _ in 0..3 {
            assert!(matches!(queue.pop(), Popped::Stop));
        }
        assert!(matches!(queue.try_pop(), Some(Popped::Stop)));
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(EventQueue::new());
        let (tx, rx) = mpsc::channel();
        let agent = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let (command, _) = popped(queue.pop());
                tx.send(command.id()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
        let command = Command::marker();
        queue.push(command.clone());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), command.id());
        agent.join().unwrap();
    }

    #[test]
    fn test_shutdown_wakes_waiters() {
        let queue = Arc::new(EventQueue::new());
        let agents: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || matches!(queue.pop(), Popped::Stop))
            })
            .collect();
        std::thread::sleep(Duration::from_millis(10));
        queue.shutdown();
        for agent in agents {
            assert!(agent.join().unwrap());
        }
    }

    #[test]
    fn test_push_marks_submitted() {
        let queue = EventQueue::new();
        let command = Command::marker();
        assert!(queue.push(command.clone()));
        assert_eq!(command.event().status(), crate::event::CommandStatus::Submitted);
    }

    #[test]
    fn test_resubmission_rejected() {
        let queue = EventQueue::new();
        let launch = Command::nd_range(Arc::new(Noop), LaunchGeometry::task(), 1);
        assert!(queue.push(launch.clone()));
        let (command, slot) = popped(queue.pop());
        assert!(Arc::ptr_eq(&command, &launch));
        assert_eq!(slot, Some(0));
        launch.event().complete(Ok(()));

        assert!(!queue.push(launch.clone()));
        assert_eq!(queue.pending(), 0);

        let after = Command::marker();
        queue.push(after.clone());
        let (command, _) = popped(queue.pop());
        assert_eq!(command.id(), after.id());
    }

    #[test]
    fn test_exhausted_launch_skipped() {
        let queue = EventQueue::new();
        let launch = Command::nd_range(Arc::new(Noop), LaunchGeometry::task(), 1);
        assert_eq!(launch.launch().unwrap().slots().reserve(), Some((0, true)));
        let after = Command::marker();
        queue.push(launch);
        queue.push(after.clone());
        assert_eq!(queue.pending(), 2);

        let (command, slot) = popped(queue.pop());
        assert_eq!(command.id(), after.id());
        assert_eq!(slot, None);
        assert_eq!(queue.pending(), 0);
        assert!(queue.try_pop().is_none());
    }
}
