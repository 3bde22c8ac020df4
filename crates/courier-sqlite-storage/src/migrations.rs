use rusqlite::Connection;

use crate::error::Error;

// Embed the SQL migrations
refinery::embed_migrations!("migrations");

/// Run database migrations to set up or upgrade the database schema.
///
/// A crate-specific migration table name keeps the history separate from any
/// other refinery user sharing the same database file.
pub fn run_migrations(conn: &mut Connection) -> Result<(), Error> {
    let migration_table_name = "_refinery_schema_history_courier";
    let report = migrations::runner()
        .set_migration_table_name(migration_table_name)
        .run(conn)?;

    for migration in report.applied_migrations() {
        tracing::info!(
            "Applied migration: {} (version: {})",
            migration.name(),
            migration.version()
        );
    }

    Ok(())
}
