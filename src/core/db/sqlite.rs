/// SQLite Binding Module
///
/// This module adapts `rusqlite` to the connection contracts: a connection with
/// explicit auto-commit control and a factory that opens configured handles.

use crate::core::db::connection::{Connection, ConnectionFactory};
use rusqlite::OpenFlags;
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Path that selects an in-memory database
pub const MEMORY_PATH: &str = ":memory:";

static NEXT_MEMORY_DATABASE: AtomicU64 = AtomicU64::new(1);

/// Default time a connection waits on a locked database before failing
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// A `rusqlite` connection with driver-style auto-commit semantics.
///
/// SQLite runs in auto-commit mode unless a transaction is opened explicitly.
/// Disabling auto-commit opens one with `BEGIN DEFERRED`; while it stays
/// disabled, every `commit` or `rollback` immediately opens the next one.
///
/// Dereferences to [`rusqlite::Connection`] for running statements.
#[derive(Debug)]
pub struct SqliteConnection {
    inner: rusqlite::Connection,
    auto_commit: Cell<bool>,
}

impl SqliteConnection {
    pub fn new(inner: rusqlite::Connection) -> Self {
        SqliteConnection {
            inner,
            auto_commit: Cell::new(true),
        }
    }

    /// Returns whether auto-commit is enabled.
    pub fn auto_commit(&self) -> bool {
        self.auto_commit.get()
    }

    pub fn into_inner(self) -> rusqlite::Connection {
        self.inner
    }

    fn finish(&self, statement: &str) -> rusqlite::Result<()> {
        if !self.inner.is_autocommit() {
            self.inner.execute_batch(statement)?;
        }
        if !self.auto_commit.get() {
            self.inner.execute_batch("BEGIN DEFERRED")?;
        }
        Ok(())
    }
}

impl std::ops::Deref for SqliteConnection {
    type Target = rusqlite::Connection;

    fn deref(&self) -> &rusqlite::Connection {
        &self.inner
    }
}

impl Connection for SqliteConnection {
    fn set_auto_commit(&self, enabled: bool) -> rusqlite::Result<()> {
        if enabled == self.auto_commit.get() {
            return Ok(());
        }

        if enabled {
            // Turning auto-commit back on commits the pending work
            if !self.inner.is_autocommit() {
                self.inner.execute_batch("COMMIT")?;
            }
        } else {
            self.inner.execute_batch("BEGIN DEFERRED")?;
        }
        self.auto_commit.set(enabled);
        Ok(())
    }

    fn commit(&self) -> rusqlite::Result<()> {
        self.finish("COMMIT")
    }

    fn rollback(&self) -> rusqlite::Result<()> {
        self.finish("ROLLBACK")
    }

    fn close(self) -> rusqlite::Result<()> {
        self.inner.close().map_err(|(_, e)| e)
    }
}

/// A named shared-cache in-memory database, kept alive by one idle
/// connection for as long as any factory clone exists.
#[derive(Debug)]
struct SharedMemory {
    uri: String,
    keeper: Mutex<Option<rusqlite::Connection>>,
}

impl SharedMemory {
    fn new() -> Self {
        let n = NEXT_MEMORY_DATABASE.fetch_add(1, Ordering::Relaxed);
        SharedMemory {
            uri: format!("file:txconn-memory-{}?mode=memory&cache=shared", n),
            keeper: Mutex::new(None),
        }
    }

    fn ensure_open(&self) -> rusqlite::Result<()> {
        let mut keeper = self.keeper.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if keeper.is_none() {
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            *keeper = Some(rusqlite::Connection::open_with_flags(&self.uri, flags)?);
        }
        Ok(())
    }
}

/// Opens [`SqliteConnection`]s for one database file.
///
/// With [`MEMORY_PATH`] every connection of the factory (and of its clones)
/// attaches to the same in-memory database instead of a private one. That
/// database uses SQLite's shared cache, where a reader blocked by another
/// connection's uncommitted write fails with `SQLITE_LOCKED` rather than
/// waiting for the busy timeout.
#[derive(Debug, Clone)]
pub struct SqliteConnectionFactory {
    path: PathBuf,
    memory: Option<Arc<SharedMemory>>,
    read_only: bool,
    busy_timeout: Duration,
    pragmas: Vec<String>,
}

impl SqliteConnectionFactory {
    /// Creates a factory for the database at `path` (or [`MEMORY_PATH`]).
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let memory = (path.as_os_str() == MEMORY_PATH).then(|| Arc::new(SharedMemory::new()));
        SqliteConnectionFactory {
            path,
            memory,
            read_only: false,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            pragmas: Vec::new(),
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Adds a pragma applied to every new connection, e.g. `"foreign_keys = ON"`.
    pub fn pragma<S: Into<String>>(mut self, pragma: S) -> Self {
        self.pragmas.push(pragma.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_flags(&self) -> OpenFlags {
        let access = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        };
        access | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX
    }
}

impl ConnectionFactory for SqliteConnectionFactory {
    type Connection = SqliteConnection;

    fn connect(&self) -> rusqlite::Result<SqliteConnection> {
        let conn = match &self.memory {
            Some(memory) => {
                memory.ensure_open()?;
                rusqlite::Connection::open_with_flags(&memory.uri, self.open_flags())?
            }
            None => rusqlite::Connection::open_with_flags(&self.path, self.open_flags())?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        for pragma in &self.pragmas {
            conn.execute_batch(&format!("PRAGMA {};", pragma))?;
        }
        debug!("Opened SQLite connection to {:?}", self.path);
        Ok(SqliteConnection::new(conn))
    }
}
