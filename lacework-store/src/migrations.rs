//! Schema migrations.

use crate::database::Database;
use crate::{Dialect, Result, StoreError};
use sqlx::Row;
use tracing::{info, instrument};

struct Migration {
    id: &'static str,
    statement: fn(Dialect) -> String,
}

fn create_subnets(dialect: Dialect) -> String {
    dialect.create_subnets_table()
}

// Append only. Applied ids are recorded and never run twice.
const MIGRATIONS: &[Migration] = &[Migration {
    id: "1-create-subnets",
    statement: create_subnets,
}];

/// Bring the schema up to date, returning the number of migrations applied
#[instrument(skip(db), fields(dialect = %db.dialect()))]
pub async fn run(db: &Database) -> Result<usize> {
    db.execute(
        "creating migration table",
        "CREATE TABLE IF NOT EXISTS lacework_migrations (\
         id varchar(255) NOT NULL PRIMARY KEY\
         , applied_at bigint NOT NULL\
         )",
        &[],
    )
    .await
    .map_err(|e| StoreError::Migration(e.to_string()))?;

    let applied: Vec<String> = db
        .fetch_all("reading applied migrations", "SELECT id FROM lacework_migrations", &[])
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?
        .iter()
        .map(|row| row.try_get::<String, _>("id"))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| StoreError::Migration(e.to_string()))?;

    let mut count = 0;
    for migration in MIGRATIONS {
        if applied.iter().any(|id| id == migration.id) {
            continue;
        }

        info!(id = migration.id, "applying migration");
        db.execute("applying migration", &(migration.statement)(db.dialect()), &[])
            .await
            .map_err(|e| StoreError::Migration(format!("{}: {}", migration.id, e)))?;

        let record = format!(
            "INSERT INTO lacework_migrations (id, applied_at) VALUES (?, {})",
            db.dialect().now()
        );
        match db
            .execute("recording migration", &record, &[migration.id.into()])
            .await
        {
            Ok(_) => count += 1,
            // Another instance finished the same migration first.
            Err(e) if e.is_constraint_violation() => {
                info!(id = migration.id, "migration already recorded");
            }
            Err(e) => return Err(StoreError::Migration(format!("{}: {}", migration.id, e))),
        }
    }

    if count == 0 {
        info!("database schema is up to date");
    } else {
        info!(count, "database schema migrated");
    }

    Ok(count)
}
