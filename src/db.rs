//! Shared embedded-database handle.
//!
//! Every stateful component (Module Registry, Provides Graph, Chat History
//! Store, Profile Document Store) stores JSON-serialized rows in its own
//! `redb` table inside one shared database file, following the teacher's
//! `db::Db` convention (`TableDefinition<&str, &str>` tables, synchronous
//! write-txn/read-txn blocks) generalized from a single hard-coded table
//! set to one table per component module.

use crate::error::{CoreError, Result};
use redb::Database;
use std::path::Path;
use std::sync::Arc;

/// Opens (creating if absent) the shared `redb` database file at
/// `<db_dir>/platform.redb`.
pub fn open(db_dir: &Path) -> Result<Arc<Database>> {
    std::fs::create_dir_all(db_dir)
        .map_err(|e| CoreError::DbError(format!("failed to create {db_dir:?}: {e}")))?;
    let db_path = db_dir.join("platform.redb");
    let db = Database::create(db_path)?;
    Ok(Arc::new(db))
}
