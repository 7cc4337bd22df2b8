use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::PathBuf;
use std::time::Duration;

use crate::settings;

pub type DbPool = Pool<SqliteConnectionManager>;

const DB_FILE: &str = "intake.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the intake database inside `workspace_dir`, apply the
/// embedded migrations and seed default settings.
pub fn init_db(workspace_dir: PathBuf) -> Result<DbPool> {
    std::fs::create_dir_all(&workspace_dir)
        .with_context(|| format!("failed to create {}", workspace_dir.display()))?;
    let db_path = workspace_dir.join(DB_FILE);
    let mgr = SqliteConnectionManager::file(&db_path).with_init(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
    });
    let pool = Pool::new(mgr).context("failed to open connection pool")?;
    {
        let conn = pool.get()?;
        apply_migrations(&conn)?;
        settings::seed_defaults(&conn)?;
    }
    log::info!("intake database ready at {}", db_path.display());
    Ok(pool)
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    let migrations: &[(&str, &str)] = &[
        (
            "0001_init.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0001_init.sql"
            )),
        ),
        (
            "0002_board_and_log.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0002_board_and_log.sql"
            )),
        ),
    ];

    for (name, sql) in migrations {
        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {name}"))?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::TempDir;

    /// A fresh on-disk database; keep the `TempDir` alive for the test's duration.
    pub fn temp_pool() -> (TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().to_path_buf()).unwrap();
        (dir, pool)
    }
}
