//! SQLite-based storage implementation for Courier.
//!
//! This crate implements the
//! [`MessageStorage`](courier_storage_traits::messages::MessageStorage) trait on
//! top of a single SQLite database file. Records, tombstones and edit chains are
//! persisted, so the ingestion core can rebuild its deduplication index after a
//! restart.
//!
//! ```no_run
//! use courier_sqlite_storage::CourierSqliteStorage;
//!
//! let storage = CourierSqliteStorage::new("/path/to/courier.sqlite")?;
//! # Ok::<(), courier_sqlite_storage::error::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use courier_storage_traits::messages::error::MessageError;
use rusqlite::Connection;

mod db;
pub mod error;
mod messages;
mod migrations;
mod validation;

use self::error::Error;

/// A SQLite-based storage implementation for Courier.
///
/// One connection is shared behind a mutex. Every mutating operation runs in
/// its own transaction while holding the mutex, which makes each per-key
/// read-modify-write atomic and crash safe.
pub struct CourierSqliteStorage {
    connection: Arc<Mutex<Connection>>,
}

impl fmt::Debug for CourierSqliteStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CourierSqliteStorage")
            .field("connection", &"Arc<Mutex<Connection>>")
            .finish()
    }
}

impl CourierSqliteStorage {
    /// Opens (or creates) the database at `file_path` and applies migrations.
    ///
    /// Parent directories are created when missing.
    pub fn new<P>(file_path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let file_path = file_path.as_ref();

        if let Some(parent) = file_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let mut connection = Connection::open(file_path)?;
        Self::configure(&connection, true)?;
        migrations::run_migrations(&mut connection)?;

        tracing::debug!(
            target: "courier_sqlite_storage",
            "Opened database at {}",
            file_path.display()
        );

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Creates a new in-memory [`CourierSqliteStorage`].
    ///
    /// Nothing is persisted. Useful for tests and for running the same queries
    /// as the file-backed store without touching disk.
    pub fn new_in_memory() -> Result<Self, Error> {
        let mut connection = Connection::open_in_memory()?;
        Self::configure(&connection, false)?;
        migrations::run_migrations(&mut connection)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn configure(conn: &Connection, on_disk: bool) -> Result<(), Error> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        if on_disk {
            // journal_mode answers with the mode now in effect
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }
        Ok(())
    }

    /// Provides access to the underlying connection for storage operations.
    pub(crate) fn with_connection<F, T>(&self, f: F) -> Result<T, MessageError>
    where
        F: FnOnce(&Connection) -> Result<T, MessageError>,
    {
        let conn = self
            .connection
            .lock()
            .map_err(|_| MessageError::DatabaseError("Connection lock poisoned".to_string()))?;
        f(&conn)
    }
}
