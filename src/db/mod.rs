use std::fs;

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub mod queries;

/// Connect to the configured database, creating the backing file when needed.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let db_url = normalize_sqlite_url(database_url);
    if let Some(path) = db_file_path(&db_url) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }
        if !path.exists() {
            fs::File::create(&path).ok();
        }
    }
    Ok(SqlitePool::connect(&db_url).await?)
}

/// Single-connection in-memory pool for tests (separate connections would
/// each get their own empty memory database).
pub async fn connect_memory() -> Result<SqlitePool> {
    Ok(SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?)
}

/// Apply every .sql file under migrations/ in sorted order.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir("migrations")?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("sql") {
            let sql = fs::read_to_string(&path)?;
            for statement in sql.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                sqlx::query(statement).execute(pool).await?;
            }
        }
    }
    Ok(())
}

pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn normalize_sqlite_url(input: &str) -> String {
    // Accept forms: sqlite:foo.db (fix), sqlite://foo.db (ok), file:foo.db (convert), bare path (prepend)
    if input.starts_with("sqlite://") || input.starts_with("sqlite::memory:") {
        return input.to_string();
    }
    if input.starts_with("sqlite:") {
        let rest = input.trim_start_matches("sqlite:");
        return format!("sqlite://{}", rest.trim_start_matches('/'));
    }
    if input.starts_with("file:") {
        return format!("sqlite://{}", input.trim_start_matches("file:"));
    }
    format!("sqlite://{}", input)
}

fn db_file_path(url: &str) -> Option<std::path::PathBuf> {
    if let Some(rest) = url.strip_prefix("sqlite://") {
        if rest == ":memory:" {
            return None;
        }
        return Some(std::path::PathBuf::from(rest));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_urls_normalize() {
        assert_eq!(normalize_sqlite_url("sqlite://a.db"), "sqlite://a.db");
        assert_eq!(normalize_sqlite_url("sqlite:a.db"), "sqlite://a.db");
        assert_eq!(normalize_sqlite_url("file:a.db"), "sqlite://a.db");
        assert_eq!(normalize_sqlite_url("a.db"), "sqlite://a.db");
        assert_eq!(
            normalize_sqlite_url("sqlite::memory:"),
            "sqlite::memory:"
        );
    }

    #[test]
    fn memory_url_has_no_file_path() {
        assert!(db_file_path("sqlite://:memory:").is_none());
        assert_eq!(
            db_file_path("sqlite://data/m.db"),
            Some(std::path::PathBuf::from("data/m.db"))
        );
    }
}
