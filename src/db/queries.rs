//! Persistence gateway. The sync core consumes these operations; it mutates
//! sync-owned fields (status, last-sync, last-error, job rows, address rows)
//! and never owns account/proxy lifecycle.

use anyhow::{anyhow, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db::now_epoch;
use crate::models::account::{Account, ConnectionStatus, MailProtocol};
use crate::models::job::{JobStatus, SyncJob};
use crate::models::proxy::{Proxy, ProxyProtocol};

fn account_from_row(row: &SqliteRow) -> Result<Account> {
    let protocol: String = row.try_get("protocol")?;
    let status: String = row.try_get("status")?;
    Ok(Account {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        protocol: MailProtocol::from_str(&protocol)
            .ok_or_else(|| anyhow!("unknown protocol {protocol}"))?,
        host: row.try_get("host")?,
        port: row.try_get::<i64, _>("port")? as u16,
        use_tls: row.try_get("use_tls")?,
        endpoint: row.try_get("endpoint")?,
        credentials_encrypted: row.try_get("credentials_encrypted")?,
        status: ConnectionStatus::from_str(&status)
            .ok_or_else(|| anyhow!("unknown status {status}"))?,
        proxy_id: row.try_get("proxy_id")?,
        last_sync_ts: row.try_get("last_sync_ts")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        credentials: None,
    })
}

pub async fn get_account(pool: &SqlitePool, account_id: &str) -> Result<Option<Account>> {
    let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
        .bind(account_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| account_from_row(&r)).transpose()
}

pub async fn insert_account(pool: &SqlitePool, account: &Account) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO accounts (
            id, email, protocol, host, port, use_tls, endpoint,
            credentials_encrypted, status, proxy_id, last_sync_ts, last_error,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&account.id)
    .bind(&account.email)
    .bind(account.protocol.as_str())
    .bind(&account.host)
    .bind(account.port as i64)
    .bind(account.use_tls)
    .bind(&account.endpoint)
    .bind(&account.credentials_encrypted)
    .bind(account.status.as_str())
    .bind(&account.proxy_id)
    .bind(account.last_sync_ts)
    .bind(&account.last_error)
    .bind(account.created_at)
    .bind(account.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_account_status(
    pool: &SqlitePool,
    account_id: &str,
    status: ConnectionStatus,
    last_error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE accounts SET status = ?, last_error = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(last_error)
        .bind(now_epoch())
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn touch_account_last_sync(pool: &SqlitePool, account_id: &str) -> Result<()> {
    let now = now_epoch();
    sqlx::query("UPDATE accounts SET last_sync_ts = ?, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(now)
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_proxy(pool: &SqlitePool, proxy_id: &str) -> Result<Option<Proxy>> {
    let row = sqlx::query("SELECT * FROM proxies WHERE id = ?")
        .bind(proxy_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| {
        let protocol: String = r.try_get("protocol")?;
        anyhow::Ok(Proxy {
            id: r.try_get("id")?,
            host: r.try_get("host")?,
            port: r.try_get::<i64, _>("port")? as u16,
            protocol: ProxyProtocol::from_str(&protocol)
                .ok_or_else(|| anyhow!("unknown proxy protocol {protocol}"))?,
            username: r.try_get("username")?,
            password: r.try_get("password")?,
        })
    })
    .transpose()
}

pub async fn insert_proxy(pool: &SqlitePool, proxy: &Proxy) -> Result<()> {
    sqlx::query(
        "INSERT INTO proxies (id, host, port, protocol, username, password, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&proxy.id)
    .bind(&proxy.host)
    .bind(proxy.port as i64)
    .bind(proxy.protocol.as_str())
    .bind(&proxy.username)
    .bind(&proxy.password)
    .bind(now_epoch())
    .execute(pool)
    .await?;
    Ok(())
}

fn job_from_row(row: &SqliteRow) -> Result<SyncJob> {
    let status: String = row.try_get("status")?;
    let folders: String = row.try_get("folders")?;
    Ok(SyncJob {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        name: row.try_get("name")?,
        status: JobStatus::from_str(&status).ok_or_else(|| anyhow!("unknown status {status}"))?,
        folders: serde_json::from_str(&folders)?,
        proxy_id: row.try_get("proxy_id")?,
        current_count: row.try_get("current_count")?,
        result_count: row.try_get("result_count")?,
        processed_folders: row.try_get("processed_folders")?,
        total_folders: row.try_get("total_folders")?,
        error: row.try_get("error")?,
        parent_id: row.try_get("parent_id")?,
        children_total: row.try_get("children_total")?,
        children_done: row.try_get("children_done")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

pub async fn create_job(pool: &SqlitePool, job: &SyncJob) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_jobs (
            id, account_id, name, status, folders, proxy_id,
            current_count, result_count, processed_folders, total_folders,
            error, parent_id, children_total, children_done,
            created_at, started_at, completed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(&job.account_id)
    .bind(&job.name)
    .bind(job.status.as_str())
    .bind(serde_json::to_string(&job.folders)?)
    .bind(&job.proxy_id)
    .bind(job.current_count)
    .bind(job.result_count)
    .bind(job.processed_folders)
    .bind(job.total_folders)
    .bind(&job.error)
    .bind(&job.parent_id)
    .bind(job.children_total)
    .bind(job.children_done)
    .bind(job.created_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_job(pool: &SqlitePool, job_id: &str) -> Result<Option<SyncJob>> {
    let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| job_from_row(&r)).transpose()
}

/// pending -> running, exactly once. Returns false when the job was already
/// claimed or finalized.
pub async fn claim_job(pool: &SqlitePool, job_id: &str) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE sync_jobs SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(now_epoch())
    .bind(job_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn update_job_progress(
    pool: &SqlitePool,
    job_id: &str,
    current_count: i64,
    result_count: i64,
    processed_folders: i64,
    total_folders: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_jobs
        SET current_count = ?, result_count = ?, processed_folders = ?, total_folders = ?
        WHERE id = ?
        "#,
    )
    .bind(current_count)
    .bind(result_count)
    .bind(processed_folders)
    .bind(total_folders)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal transition, guarded so a finished job is never re-entered.
/// Returns false when another path (watchdog, duplicate worker) already
/// finalized the job. On a real transition the parent batch job, if any, is
/// advanced and completed once all children are terminal.
pub async fn finish_job(
    pool: &SqlitePool,
    job_id: &str,
    status: JobStatus,
    error: Option<&str>,
) -> Result<bool> {
    let now = now_epoch();
    let rows = sqlx::query(
        r#"
        UPDATE sync_jobs SET status = ?, error = ?, completed_at = ?
        WHERE id = ? AND status IN ('pending', 'running')
        "#,
    )
    .bind(status.as_str())
    .bind(error)
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?
    .rows_affected();
    if rows == 0 {
        return Ok(false);
    }

    let parent_id: Option<String> =
        sqlx::query_scalar("SELECT parent_id FROM sync_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(pool)
            .await?;
    if let Some(parent_id) = parent_id {
        sqlx::query("UPDATE sync_jobs SET children_done = children_done + 1 WHERE id = ?")
            .bind(&parent_id)
            .execute(pool)
            .await?;
        sqlx::query(
            r#"
            UPDATE sync_jobs SET status = 'completed', completed_at = ?
            WHERE id = ? AND status = 'running' AND children_done >= children_total
            "#,
        )
        .bind(now)
        .bind(&parent_id)
        .execute(pool)
        .await?;
    }
    Ok(true)
}

/// Idempotent append of newly observed addresses; re-runs and overlapping
/// folders collapse onto the (job, email) key.
pub async fn append_addresses(
    pool: &SqlitePool,
    job_id: &str,
    rows: &[(String, String)],
) -> Result<()> {
    let now = now_epoch();
    for (email, folder) in rows {
        sqlx::query(
            "INSERT OR IGNORE INTO extracted_addresses (job_id, email, folder, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(email)
        .bind(folder)
        .bind(now)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn job_addresses(pool: &SqlitePool, job_id: &str) -> Result<Vec<String>> {
    let rows =
        sqlx::query_scalar("SELECT email FROM extracted_addresses WHERE job_id = ? ORDER BY email")
            .bind(job_id)
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

pub async fn count_job_addresses(pool: &SqlitePool, job_id: &str) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM extracted_addresses WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
