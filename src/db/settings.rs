use std::collections::HashMap;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};
use tokio_rusqlite::{Connection, params};

use crate::core::error::SettingsError;

pub async fn get(conn: &Connection, key: String) -> Result<Option<String>, SettingsError> {
    conn.call(move |c| {
        c.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    })
    .await
    .map_err(SettingsError::database)
}

/// All settings whose key starts with `prefix`.
pub async fn get_prefixed(
    conn: &Connection,
    prefix: String,
) -> Result<HashMap<String, String>, SettingsError> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT key, value FROM settings
             WHERE substr(key, 1, length(?1)) = ?1",
        )?;

        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, rusqlite::Error>>()?;
        Ok::<_, rusqlite::Error>(rows)
    })
    .await
    .map_err(SettingsError::database)
}

/// Upsert several settings in one transaction.
pub async fn set_many(
    conn: &Connection,
    entries: Vec<(String, String)>,
) -> Result<(), SettingsError> {
    conn.call(move |c| {
        let tx = c.transaction()?;
        for (key, value) in &entries {
            tx.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = CURRENT_TIMESTAMP",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(SettingsError::database)
}
