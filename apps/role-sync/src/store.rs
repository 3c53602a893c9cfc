use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::RoleSyncDb;
use crate::types::{AuditRecord, BalanceRecord, RoleDefinition, WalletLink};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

#[async_trait]
pub trait LinkedAccountDirectory: Send + Sync {
    /// Links that carry both an account id and a wallet address.
    async fn list_linked_accounts(&self) -> Result<Vec<WalletLink>, StoreError>;
}

#[async_trait]
pub trait BalanceHistoryStore: Send + Sync {
    /// Appends `record` and moves the owning link's last-known balance and
    /// last-check time to the same sample, as one write.
    async fn append_sample(&self, user_id: &str, record: BalanceRecord) -> Result<(), StoreError>;

    /// Records for `wallet_address` sampled at or after `since`, oldest first.
    async fn query(
        &self,
        wallet_address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BalanceRecord>, StoreError>;
}

#[async_trait]
pub trait RoleCatalog: Send + Sync {
    async fn list_roles(&self) -> Result<Vec<RoleDefinition>, StoreError>;
}

/// Destination for blocked reconciliation attempts.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<(), StoreError>;
}

/// The persistence collaborators the engine consumes, resolved once at startup.
#[derive(Clone)]
pub struct RoleSyncStores {
    pub directory: Arc<dyn LinkedAccountDirectory>,
    pub history: Arc<dyn BalanceHistoryStore>,
    pub roles: Arc<dyn RoleCatalog>,
    pub audit: Arc<dyn AuditSink>,
}

impl RoleSyncStores {
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: LinkedAccountDirectory + BalanceHistoryStore + RoleCatalog + AuditSink + 'static,
    {
        Self {
            directory: store.clone(),
            history: store.clone(),
            roles: store.clone(),
            audit: store,
        }
    }
}

pub fn memory() -> RoleSyncStores {
    RoleSyncStores::from_shared(Arc::new(MemoryRoleSyncStore::default()))
}

pub fn postgres(db: Arc<RoleSyncDb>) -> RoleSyncStores {
    RoleSyncStores::from_shared(Arc::new(PostgresRoleSyncStore { db }))
}

const MEMORY_AUDIT_LOG_CAPACITY: usize = 500;

#[derive(Default)]
pub struct MemoryRoleSyncStore {
    inner: Mutex<MemoryRoleSyncInner>,
}

#[derive(Default)]
struct MemoryRoleSyncInner {
    links_by_user_id: HashMap<String, WalletLink>,
    history_by_wallet: HashMap<String, Vec<BalanceRecord>>,
    roles: Vec<RoleDefinition>,
    audit: VecDeque<AuditRecord>,
}

impl MemoryRoleSyncStore {
    pub async fn upsert_link(&self, link: WalletLink) {
        let mut inner = self.inner.lock().await;
        inner.links_by_user_id.insert(link.user_id.clone(), link);
    }

    pub async fn upsert_role(&self, role: RoleDefinition) {
        let mut inner = self.inner.lock().await;
        match inner
            .roles
            .iter_mut()
            .find(|existing| existing.role_id == role.role_id)
        {
            Some(existing) => *existing = role,
            None => inner.roles.push(role),
        }
    }

    pub async fn link(&self, user_id: &str) -> Option<WalletLink> {
        self.inner.lock().await.links_by_user_id.get(user_id).cloned()
    }

    pub async fn history(&self, wallet_address: &str) -> Vec<BalanceRecord> {
        self.inner
            .lock()
            .await
            .history_by_wallet
            .get(wallet_address)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn audit_records(&self) -> Vec<AuditRecord> {
        self.inner.lock().await.audit.iter().cloned().collect()
    }
}

#[async_trait]
impl LinkedAccountDirectory for MemoryRoleSyncStore {
    async fn list_linked_accounts(&self) -> Result<Vec<WalletLink>, StoreError> {
        let inner = self.inner.lock().await;
        let mut links = inner
            .links_by_user_id
            .values()
            .filter(|link| link.linked_pair().is_some())
            .cloned()
            .collect::<Vec<_>>();
        links.sort_by(|left, right| left.user_id.cmp(&right.user_id));
        Ok(links)
    }
}

#[async_trait]
impl BalanceHistoryStore for MemoryRoleSyncStore {
    async fn append_sample(&self, user_id: &str, record: BalanceRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.links_by_user_id.contains_key(user_id) {
            return Err(StoreError::NotFound(format!("wallet link {user_id}")));
        }
        let history = inner
            .history_by_wallet
            .entry(record.wallet_address.clone())
            .or_default();
        ensure_sample_is_latest(&record, history.last().map(|last| last.sampled_at))?;
        history.push(record.clone());

        if let Some(link) = inner.links_by_user_id.get_mut(user_id) {
            link.last_known_balance = record.balance;
            link.last_check_at = Some(record.sampled_at);
        }
        Ok(())
    }

    async fn query(
        &self,
        wallet_address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BalanceRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .history_by_wallet
            .get(wallet_address)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record.sampled_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl RoleCatalog for MemoryRoleSyncStore {
    async fn list_roles(&self) -> Result<Vec<RoleDefinition>, StoreError> {
        Ok(self.inner.lock().await.roles.clone())
    }
}

#[async_trait]
impl AuditSink for MemoryRoleSyncStore {
    async fn append(&self, record: AuditRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .audit
            .iter()
            .any(|existing| existing.audit_id == record.audit_id)
        {
            return Err(StoreError::Conflict(format!(
                "audit record {} already written",
                record.audit_id
            )));
        }
        if inner.audit.len() >= MEMORY_AUDIT_LOG_CAPACITY {
            inner.audit.pop_front();
        }
        inner.audit.push_back(record);
        Ok(())
    }
}

struct PostgresRoleSyncStore {
    db: Arc<RoleSyncDb>,
}

#[async_trait]
impl LinkedAccountDirectory for PostgresRoleSyncStore {
    async fn list_linked_accounts(&self) -> Result<Vec<WalletLink>, StoreError> {
        let client = self.db.client();
        let rows = client
            .lock()
            .await
            .query(
                r#"
                SELECT user_id,
                       account_id,
                       wallet_address,
                       last_known_balance,
                       last_check_at
                  FROM role_sync.users
                 WHERE account_id IS NOT NULL AND account_id <> ''
                   AND wallet_address IS NOT NULL AND wallet_address <> ''
                 ORDER BY user_id
                "#,
                &[],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        Ok(rows.iter().map(map_link_row).collect())
    }
}

#[async_trait]
impl BalanceHistoryStore for PostgresRoleSyncStore {
    async fn append_sample(&self, user_id: &str, record: BalanceRecord) -> Result<(), StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;

        // Per-wallet lock so a concurrent writer cannot slip a later sample in.
        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1))",
            &[&record.wallet_address],
        )
        .await
        .map_err(|error| StoreError::Db(error.to_string()))?;
        let latest: Option<DateTime<Utc>> = tx
            .query_one(
                r#"
                SELECT MAX(sampled_at) AS latest
                  FROM role_sync.balance_history
                 WHERE wallet_address = $1
                "#,
                &[&record.wallet_address],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?
            .get("latest");
        ensure_sample_is_latest(&record, latest)?;

        tx.execute(
            r#"
            INSERT INTO role_sync.balance_history (wallet_address, balance, sampled_at)
            VALUES ($1, $2, $3)
            "#,
            &[&record.wallet_address, &record.balance, &record.sampled_at],
        )
        .await
        .map_err(|error| StoreError::Db(error.to_string()))?;

        let updated = tx
            .execute(
                r#"
                UPDATE role_sync.users
                   SET last_known_balance = $2,
                       last_check_at = $3
                 WHERE user_id = $1
                "#,
                &[&user_id, &record.balance, &record.sampled_at],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("wallet link {user_id}")));
        }

        tx.commit()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))
    }

    async fn query(
        &self,
        wallet_address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BalanceRecord>, StoreError> {
        let client = self.db.client();
        let rows = client
            .lock()
            .await
            .query(
                r#"
                SELECT wallet_address, balance, sampled_at
                  FROM role_sync.balance_history
                 WHERE wallet_address = $1
                   AND sampled_at >= $2
                 ORDER BY sampled_at ASC, id ASC
                "#,
                &[&wallet_address, &since],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| BalanceRecord {
                wallet_address: row.get("wallet_address"),
                balance: row.get("balance"),
                sampled_at: row.get("sampled_at"),
            })
            .collect())
    }
}

#[async_trait]
impl RoleCatalog for PostgresRoleSyncStore {
    async fn list_roles(&self) -> Result<Vec<RoleDefinition>, StoreError> {
        let client = self.db.client();
        let rows = client
            .lock()
            .await
            .query(
                r#"
                SELECT role_id, name, kind, amount_threshold
                  FROM role_sync.roles
                 ORDER BY created_at, role_id
                "#,
                &[],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                RoleDefinition::from_parts(
                    row.get("role_id"),
                    row.get("name"),
                    kind.as_str(),
                    row.get("amount_threshold"),
                )
                .map_err(StoreError::Db)
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for PostgresRoleSyncStore {
    async fn append(&self, record: AuditRecord) -> Result<(), StoreError> {
        let requested_role_ids = serde_json::to_value(&record.requested_role_ids)
            .map_err(|error| StoreError::Db(error.to_string()))?;
        let blocked_reasons = serde_json::to_value(&record.blocked_reasons)
            .map_err(|error| StoreError::Db(error.to_string()))?;
        let checks = serde_json::to_value(&record.checks)
            .map_err(|error| StoreError::Db(error.to_string()))?;

        let client = self.db.client();
        let inserted = client
            .lock()
            .await
            .execute(
                r#"
                INSERT INTO role_sync.blocked_role_assignments (
                  audit_id,
                  schema,
                  recorded_at,
                  wallet_address,
                  account_id,
                  balance,
                  requested_role_ids,
                  blocked_reasons,
                  checks
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (audit_id) DO NOTHING
                "#,
                &[
                    &record.audit_id,
                    &record.schema,
                    &record.recorded_at,
                    &record.wallet_address,
                    &record.account_id,
                    &record.balance,
                    &requested_role_ids,
                    &blocked_reasons,
                    &checks,
                ],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "audit record {} already written",
                record.audit_id
            )));
        }
        Ok(())
    }
}

/// Balance history only grows forward in time per wallet.
fn ensure_sample_is_latest(
    record: &BalanceRecord,
    latest: Option<DateTime<Utc>>,
) -> Result<(), StoreError> {
    match latest {
        Some(latest) if record.sampled_at < latest => Err(StoreError::Conflict(format!(
            "sample for {} predates the latest record",
            record.wallet_address
        ))),
        _ => Ok(()),
    }
}

fn map_link_row(row: &tokio_postgres::Row) -> WalletLink {
    WalletLink {
        user_id: row.get("user_id"),
        account_id: row.get("account_id"),
        wallet_address: row.get("wallet_address"),
        last_known_balance: row.get("last_known_balance"),
        last_check_at: row.get("last_check_at"),
    }
}
