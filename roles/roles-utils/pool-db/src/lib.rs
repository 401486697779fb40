//! MySQL access shared by the stats roles.
//!
//! Both flush paths use the same pattern: build rows as SQL value tuples,
//! multi-insert them into a session-local temporary table, then merge into
//! the persistent table with `INSERT … SELECT … ON DUPLICATE KEY UPDATE`.
//! Temporary tables are per-connection, so a whole flush must run on a
//! single acquired connection.

use sqlx::mysql::{MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::{Connection, Row};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unsupported server configuration: {0}")]
    ServerConfig(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Rows per INSERT statement. Bounds statement size well under the
/// required 16 MiB `max_allowed_packet`.
const MAX_ROWS_PER_INSERT: usize = 10_000;

/// Connect a small pool to the pool database.
pub async fn connect(database_url: &str) -> Result<MySqlPool> {
    let pool = MySqlPoolOptions::new()
        .max_connections(4)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Ping the server and verify `max_allowed_packet` is at least 16 MiB.
/// Multi-insert batches rely on it; a smaller limit is fatal at init.
pub async fn check_server(pool: &MySqlPool) -> Result<()> {
    let mut conn = pool.acquire().await?;
    conn.ping().await?;

    let row = sqlx::query("SHOW VARIABLES LIKE 'max_allowed_packet'")
        .fetch_optional(&mut *conn)
        .await?;

    let value: u64 = row
        .and_then(|r| r.try_get::<String, _>("Value").ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if value < 16 * 1024 * 1024 {
        return Err(DbError::ServerConfig(format!(
            "max_allowed_packet is {} bytes, need at least 16 MiB",
            value
        )));
    }
    Ok(())
}

/// PID-suffixed temporary table name, so concurrent processes never
/// collide on the same session-table name.
pub fn tmp_table_name(table: &str) -> String {
    format!("{}_tmp_{}", table, std::process::id())
}

/// Build the chunked multi-insert statements for `values`.
pub fn multi_insert_sql(table: &str, fields: &str, values: &[String]) -> Vec<String> {
    values
        .chunks(MAX_ROWS_PER_INSERT)
        .map(|chunk| {
            let rows: Vec<String> = chunk.iter().map(|v| format!("({})", v)).collect();
            format!(
                "INSERT INTO `{}` ({}) VALUES {}",
                table,
                fields,
                rows.join(",")
            )
        })
        .collect()
}

/// Build the temp-to-persistent merge statement.
pub fn merge_sql(table: &str, tmp_table: &str, update_cols: &[&str]) -> String {
    let updates: Vec<String> = update_cols
        .iter()
        .map(|col| format!("`{table}`.`{col}` = `{tmp_table}`.`{col}`"))
        .collect();
    format!(
        "INSERT INTO `{}` SELECT * FROM `{}` ON DUPLICATE KEY UPDATE {}",
        table,
        tmp_table,
        updates.join(", ")
    )
}

/// Multi-insert `values` (pre-rendered SQL tuples) into `table`.
pub async fn multi_insert(
    conn: &mut MySqlConnection,
    table: &str,
    fields: &str,
    values: &[String],
) -> Result<()> {
    for sql in multi_insert_sql(table, fields, values) {
        sqlx::query(&sql).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Run the full temp-table merge: create a session temp table shaped like
/// `table`, multi-insert the rows, merge, and drop the temp table.
pub async fn flush_via_temp_table(
    conn: &mut MySqlConnection,
    table: &str,
    fields: &str,
    values: &[String],
    update_cols: &[&str],
) -> Result<()> {
    if values.is_empty() {
        info!("flush {}: no rows", table);
        return Ok(());
    }

    let tmp = tmp_table_name(table);

    sqlx::query(&format!("DROP TEMPORARY TABLE IF EXISTS `{}`", tmp))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TEMPORARY TABLE `{}` LIKE `{}`",
        tmp, table
    ))
    .execute(&mut *conn)
    .await?;

    multi_insert(conn, &tmp, fields, values).await?;

    sqlx::query(&merge_sql(table, &tmp, update_cols))
        .execute(&mut *conn)
        .await?;

    sqlx::query(&format!("DROP TEMPORARY TABLE IF EXISTS `{}`", tmp))
        .execute(&mut *conn)
        .await?;

    Ok(())
}
