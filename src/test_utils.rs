/// # Test Utilities Module
///
/// Recording connection fixtures for unit tests. A `Recorder` is shared by a
/// `MockFactory` and every `MockConnection` it opens, so tests can assert how
/// many handles were acquired, which were committed, rolled back or closed,
/// and inject driver failures at each step.

use crate::core::db::{Connection, ConnectionFactory};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct RecorderState {
    next_id: usize,
    opened: usize,
    closed: Vec<usize>,
    dropped: Vec<usize>,
    commits: Vec<usize>,
    rollbacks: Vec<usize>,
    auto_commit_changes: Vec<(usize, bool)>,
    fail_connect: bool,
    fail_auto_commit: bool,
    fail_commit: bool,
    fail_rollback: bool,
    fail_close: bool,
}

/// Shared log of everything the mock connections went through
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    state: Arc<Mutex<RecorderState>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RecorderState> {
        // A panicking test thread must not hide the log from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn opened(&self) -> usize {
        self.state().opened
    }

    /// Handles released through an explicit `close`
    pub fn closed_ids(&self) -> Vec<usize> {
        self.state().closed.clone()
    }

    /// Handles released by being dropped without `close`
    pub fn dropped_ids(&self) -> Vec<usize> {
        self.state().dropped.clone()
    }

    /// Every released handle, however it was released
    pub fn released_ids(&self) -> Vec<usize> {
        let state = self.state();
        state.closed.iter().chain(state.dropped.iter()).copied().collect()
    }

    pub fn commits(&self) -> Vec<usize> {
        self.state().commits.clone()
    }

    pub fn rollbacks(&self) -> Vec<usize> {
        self.state().rollbacks.clone()
    }

    pub fn auto_commit_changes(&self) -> Vec<(usize, bool)> {
        self.state().auto_commit_changes.clone()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn fail_auto_commit(&self, fail: bool) {
        self.state().fail_auto_commit = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.state().fail_commit = fail;
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.state().fail_rollback = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.state().fail_close = fail;
    }
}

/// Builds the driver error the mocks report for injected failures
pub fn injected_failure(message: &str) -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
        Some(message.to_string()),
    )
}

#[derive(Debug)]
pub struct MockConnection {
    id: usize,
    recorder: Recorder,
    released: bool,
}

impl MockConnection {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Connection for MockConnection {
    fn set_auto_commit(&self, enabled: bool) -> rusqlite::Result<()> {
        let mut state = self.recorder.state();
        if state.fail_auto_commit {
            return Err(injected_failure("auto-commit toggle failed"));
        }
        state.auto_commit_changes.push((self.id, enabled));
        Ok(())
    }

    fn commit(&self) -> rusqlite::Result<()> {
        let mut state = self.recorder.state();
        if state.fail_commit {
            return Err(injected_failure("commit failed"));
        }
        state.commits.push(self.id);
        Ok(())
    }

    fn rollback(&self) -> rusqlite::Result<()> {
        let mut state = self.recorder.state();
        if state.fail_rollback {
            return Err(injected_failure("rollback failed"));
        }
        state.rollbacks.push(self.id);
        Ok(())
    }

    fn close(mut self) -> rusqlite::Result<()> {
        self.released = true;
        let mut state = self.recorder.state();
        state.closed.push(self.id);
        if state.fail_close {
            return Err(injected_failure("close failed"));
        }
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        if !self.released {
            self.recorder.state().dropped.push(self.id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockFactory {
    recorder: Recorder,
}

impl MockFactory {
    pub fn new(recorder: Recorder) -> Self {
        MockFactory { recorder }
    }
}

impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    fn connect(&self) -> rusqlite::Result<MockConnection> {
        let mut state = self.recorder.state();
        if state.fail_connect {
            return Err(injected_failure("unable to open database"));
        }
        state.next_id += 1;
        state.opened += 1;
        Ok(MockConnection {
            id: state.next_id,
            recorder: self.recorder.clone(),
            released: false,
        })
    }
}
