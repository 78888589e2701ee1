use anyhow::{Context, Result};
use std::path::Path;
use tokio_rusqlite::Connection;

pub mod settings;

/// Open (or create) the settings database and apply the schema.
pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let conn = Connection::open(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to open settings database {}: {}", path.display(), e)
    })?;
    apply_schema(&conn).await?;
    Ok(conn)
}

/// In-memory database with the schema applied. Used by tests.
pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open in-memory database: {}", e))?;
    apply_schema(&conn).await?;
    Ok(conn)
}

async fn apply_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to apply settings schema: {}", e))?;

    Ok(())
}
