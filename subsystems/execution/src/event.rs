//! # Completion Events
//!
//! The sink a command reports its outcome to. Clients keep a clone and wait
//! on it; the agent that finishes the command completes it exactly once.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{ClError, ClResult};

/// Command execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Created, not yet on a device queue
    Queued,
    /// On a device queue
    Submitted,
    /// At least one agent picked it up
    Running,
    /// Finished successfully
    Complete,
    /// Finished with an error
    Failed(ClError),
}

impl CommandStatus {
    /// Whether the command reached a final state
    pub const fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Complete | CommandStatus::Failed(_))
    }
}

/// Timestamps of each status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilingInfo {
    /// Command created
    pub queued: Instant,
    /// Command pushed to a device queue
    pub submitted: Option<Instant>,
    /// First agent started it
    pub started: Option<Instant>,
    /// Command finished
    pub ended: Option<Instant>,
}

impl ProfilingInfo {
    /// Time from start to end, once both are known
    pub fn execution_time(&self) -> Option<Duration> {
        Some(self.ended?.saturating_duration_since(self.started?))
    }
}

#[derive(Debug)]
struct EventState {
    status: CommandStatus,
    profiling: ProfilingInfo,
}

#[derive(Debug)]
struct EventInner {
    state: Mutex<EventState>,
    done: Condvar,
}

/// Shared completion sink
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    inner: Arc<EventInner>,
}

impl CompletionEvent {
    /// New event in the queued state
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState {
                    status: CommandStatus::Queued,
                    profiling: ProfilingInfo {
                        queued: Instant::now(),
                        submitted: None,
                        started: None,
                        ended: None,
                    },
                }),
                done: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status
    pub fn status(&self) -> CommandStatus {
        self.lock().status
    }

    /// Transition timestamps
    pub fn profiling(&self) -> ProfilingInfo {
        self.lock().profiling
    }

    /// Whether the command has finished
    pub fn is_complete(&self) -> bool {
        self.status().is_terminal()
    }

    /// Queued to Submitted; `false` when the command was already submitted
    pub(crate) fn mark_submitted(&self) -> bool {
        let mut state = self.lock();
        if state.status != CommandStatus::Queued {
            return false;
        }
        state.status = CommandStatus::Submitted;
        state.profiling.submitted = Some(Instant::now());
        true
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.lock();
        if matches!(state.status, CommandStatus::Queued | CommandStatus::Submitted) {
            state.status = CommandStatus::Running;
            state.profiling.started = Some(Instant::now());
        }
    }

    /// Record the final outcome. Only the first call has any effect.
    pub fn complete(&self, result: ClResult<()>) -> bool {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = match result {
            Ok(()) => CommandStatus::Complete,
            Err(err) => CommandStatus::Failed(err),
        };
        state.profiling.ended = Some(Instant::now());
        drop(state);
        self.inner.done.notify_all();
        true
    }

    /// Block until the command finishes
    pub fn wait(&self) -> ClResult<()> {
        let guard = self.lock();
        let state = self
            .inner
            .done
            .wait_while(guard, |s| !s.status.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        outcome(state.status)
    }

    /// Block for at most `timeout`; `None` if still unfinished
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ClResult<()>> {
        let guard = self.lock();
        let (state, _) = self
            .inner
            .done
            .wait_timeout_while(guard, timeout, |s| !s.status.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        state.status.is_terminal().then(|| outcome(state.status))
    }
}

impl Default for CompletionEvent {
    fn default() -> Self {
        Self::new()
    }
}

fn outcome(status: CommandStatus) -> ClResult<()> {
    match status {
        CommandStatus::Failed(err) => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let event = CompletionEvent::new();
        assert_eq!(event.status(), CommandStatus::Queued);
        event.mark_submitted();
        event.mark_running();
        assert_eq!(event.status(), CommandStatus::Running);
        assert!(event.complete(Ok(())));
        assert_eq!(event.wait(), Ok(()));

        let profiling = event.profiling();
        assert!(profiling.submitted.is_some());
        assert!(profiling.execution_time().is_some());
    }

    #[test]
    fn test_first_completion_wins() {
        let event = CompletionEvent::new();
        assert!(event.complete(Err(ClError::InvalidProgramExecutable)));
        assert!(!event.complete(Ok(())));
        assert_eq!(event.wait(), Err(ClError::InvalidProgramExecutable));
    }

    #[test]
    fn test_wait_across_threads() {
        let event = CompletionEvent::new();
        let waiter = {
            let event = event.clone();
            std::thread::spawn(move || event.wait())
        };
        std::thread::sleep(Duration::from_millis(10));
        event.complete(Err(ClError::MapFailure));
        assert_eq!(waiter.join().unwrap(), Err(ClError::MapFailure));
    }

    #[test]
    fn test_wait_timeout() {
        let event = CompletionEvent::new();
        assert_eq!(event.wait_timeout(Duration::from_millis(5)), None);
        event.complete(Ok(()));
        assert_eq!(event.wait_timeout(Duration::from_millis(5)), Some(Ok(())));
    }
}
