use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

/// One row per tenant domain: the tenant's connector identity and
/// per-platform credentials. Rows are created lazily on first contact and
/// never deleted, only deactivated.
#[derive(Debug, Clone)]
pub struct TenantConnector {
    pub domain: String,
    /// Opaque, globally unique, immutable once assigned.
    pub connector_id: String,
    /// Credential issued to the tenant; secondary lookup key.
    pub api_token: Option<String>,
    /// Target open line inside the CRM. Set by the activation event.
    pub line_id: Option<i64>,
    pub telegram_token: Option<String>,
    pub max_token: Option<String>,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Thread-safe SQLite tenant store.
#[derive(Clone)]
pub struct TenantStore {
    conn: Arc<Mutex<Connection>>,
}

impl TenantStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // Enable WAL mode for better concurrent read performance.
        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Tenant store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tenants (
                domain TEXT PRIMARY KEY,
                connector_id TEXT NOT NULL UNIQUE,
                api_token TEXT UNIQUE,
                line_id INTEGER,
                telegram_token TEXT,
                max_token TEXT,
                active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_tenants_connector
                ON tenants(connector_id);
            ",
        )?;
        Ok(())
    }

    /// Get-or-create the tenant row for a domain.
    ///
    /// The insert is a single atomic upsert keyed on `domain`: under
    /// concurrent first-contact requests exactly one row is persisted and
    /// every caller observes the same connector id. The freshly generated
    /// candidate id is simply discarded when another request won the insert.
    pub async fn resolve_by_domain(&self, domain: &str) -> Result<TenantConnector> {
        let candidate = new_connector_id();
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT INTO tenants (domain, connector_id) VALUES (?1, ?2)
             ON CONFLICT(domain) DO NOTHING",
            rusqlite::params![domain, &candidate],
        )?;

        let tenant = conn.query_row(
            "SELECT domain, connector_id, api_token, line_id, telegram_token,
                    max_token, active, created_at, updated_at
             FROM tenants WHERE domain = ?1",
            rusqlite::params![domain],
            parse_tenant_row,
        )?;

        Ok(tenant)
    }

    /// Pure lookup by the tenant's API credential. Unknown tokens are not
    /// an error; callers fall back to `resolve_by_domain`.
    pub async fn resolve_by_api_token(&self, token: &str) -> Result<Option<TenantConnector>> {
        let conn = self.conn.lock().await;
        let tenant = conn
            .query_row(
                "SELECT domain, connector_id, api_token, line_id, telegram_token,
                        max_token, active, created_at, updated_at
                 FROM tenants WHERE api_token = ?1",
                rusqlite::params![token],
                parse_tenant_row,
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(tenant)
    }

    /// Bind the connector to its target open line and mark it active.
    /// Idempotent: repeating the same activation leaves the row unchanged.
    pub async fn activate_line(&self, connector_id: &str, line_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tenants
             SET line_id = ?2, active = 1, updated_at = datetime('now')
             WHERE connector_id = ?1
               AND (line_id IS NULL OR line_id != ?2 OR active = 0)",
            rusqlite::params![connector_id, line_id],
        )?;
        Ok(())
    }

    /// Flag the tenant inactive on uninstall. The row persists so a
    /// reinstallation keeps the same connector id.
    pub async fn deactivate(&self, connector_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tenants
             SET active = 0, updated_at = datetime('now')
             WHERE connector_id = ?1 AND active != 0",
            rusqlite::params![connector_id],
        )?;
        Ok(())
    }

    /// Persist the tenant's API credential on first sight so later requests
    /// can resolve by token alone.
    pub async fn set_api_token(&self, connector_id: &str, token: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tenants
             SET api_token = ?2, updated_at = datetime('now')
             WHERE connector_id = ?1
               AND (api_token IS NULL OR api_token != ?2)",
            rusqlite::params![connector_id, token],
        )?;
        Ok(())
    }

    /// Store per-tenant bot credentials. A `None` leaves the column as-is.
    pub async fn set_bot_tokens(
        &self,
        connector_id: &str,
        telegram_token: Option<&str>,
        max_token: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tenants
             SET telegram_token = coalesce(?2, telegram_token),
                 max_token = coalesce(?3, max_token),
                 updated_at = datetime('now')
             WHERE connector_id = ?1",
            rusqlite::params![connector_id, telegram_token, max_token],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn tenant_count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count = conn.query_row("SELECT count(*) FROM tenants", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Fresh connector id: literal prefix plus a 32-char random hex suffix.
fn new_connector_id() -> String {
    format!("connector_{}", Uuid::new_v4().simple())
}

fn parse_tenant_row(row: &rusqlite::Row) -> rusqlite::Result<TenantConnector> {
    Ok(TenantConnector {
        domain: row.get(0)?,
        connector_id: row.get(1)?,
        api_token: row.get(2)?,
        line_id: row.get(3)?,
        telegram_token: row.get(4)?,
        max_token: row.get(5)?,
        active: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_id_format() {
        let id = new_connector_id();
        assert!(id.starts_with("connector_"));
        let suffix = &id["connector_".len()..];
        assert_eq!(suffix.len(), 32);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_resolve_by_domain_creates_once() {
        let store = TenantStore::open_in_memory().unwrap();

        let first = store.resolve_by_domain("acme.test").await.unwrap();
        let second = store.resolve_by_domain("acme.test").await.unwrap();

        assert_eq!(first.connector_id, second.connector_id);
        assert_eq!(store.tenant_count().await.unwrap(), 1);
        assert!(first.line_id.is_none());
        assert!(!first.active);
    }

    #[tokio::test]
    async fn test_resolve_by_domain_concurrent_idempotence() {
        let store = TenantStore::open_in_memory().unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.resolve_by_domain("race.test").await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().connector_id);
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.tenant_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_activate_line_is_idempotent() {
        let store = TenantStore::open_in_memory().unwrap();
        let tenant = store.resolve_by_domain("acme.test").await.unwrap();

        store.activate_line(&tenant.connector_id, 7).await.unwrap();
        let after_first = store.resolve_by_domain("acme.test").await.unwrap();
        assert_eq!(after_first.line_id, Some(7));
        assert!(after_first.active);

        store.activate_line(&tenant.connector_id, 7).await.unwrap();
        let after_second = store.resolve_by_domain("acme.test").await.unwrap();
        assert_eq!(after_second.line_id, Some(7));
        assert_eq!(after_second.updated_at, after_first.updated_at);
    }

    #[tokio::test]
    async fn test_reactivation_moves_line() {
        let store = TenantStore::open_in_memory().unwrap();
        let tenant = store.resolve_by_domain("acme.test").await.unwrap();

        store.activate_line(&tenant.connector_id, 7).await.unwrap();
        store.activate_line(&tenant.connector_id, 9).await.unwrap();

        let row = store.resolve_by_domain("acme.test").await.unwrap();
        assert_eq!(row.line_id, Some(9));
    }

    #[tokio::test]
    async fn test_resolve_by_api_token() {
        let store = TenantStore::open_in_memory().unwrap();
        assert!(store.resolve_by_api_token("nope").await.unwrap().is_none());

        let tenant = store.resolve_by_domain("acme.test").await.unwrap();
        store
            .set_api_token(&tenant.connector_id, "secret-token")
            .await
            .unwrap();

        let found = store
            .resolve_by_api_token("secret-token")
            .await
            .unwrap()
            .expect("token should resolve");
        assert_eq!(found.domain, "acme.test");
        assert_eq!(found.connector_id, tenant.connector_id);
    }

    #[tokio::test]
    async fn test_deactivate_keeps_row() {
        let store = TenantStore::open_in_memory().unwrap();
        let tenant = store.resolve_by_domain("acme.test").await.unwrap();
        store.activate_line(&tenant.connector_id, 3).await.unwrap();

        store.deactivate(&tenant.connector_id).await.unwrap();

        let row = store.resolve_by_domain("acme.test").await.unwrap();
        assert!(!row.active);
        assert_eq!(row.connector_id, tenant.connector_id);
        assert_eq!(store.tenant_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_bot_tokens_partial_update() {
        let store = TenantStore::open_in_memory().unwrap();
        let tenant = store.resolve_by_domain("acme.test").await.unwrap();

        store
            .set_bot_tokens(&tenant.connector_id, Some("tg-tok"), None)
            .await
            .unwrap();
        store
            .set_bot_tokens(&tenant.connector_id, None, Some("max-tok"))
            .await
            .unwrap();

        let row = store.resolve_by_domain("acme.test").await.unwrap();
        assert_eq!(row.telegram_token.as_deref(), Some("tg-tok"));
        assert_eq!(row.max_token.as_deref(), Some("max-tok"));
    }
}
