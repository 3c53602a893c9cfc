use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use chrono::{Duration, Utc};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};

use crate::chain::{ChainError, ChainGateway, DenomAmount, FirstTransaction};
use crate::platform::{PlatformError, PlatformRoleApi};

pub(crate) struct StubHandle {
    pub base_url: String,
    _shutdown: oneshot::Sender<()>,
}

/// Serves `app` on an ephemeral local port until the handle is dropped.
pub(crate) async fn spawn_stub(app: Router) -> Result<StubHandle> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });

    Ok(StubHandle {
        base_url: format!("http://{addr}"),
        _shutdown: shutdown_tx,
    })
}

/// In-memory chain: balances in whole units, one shared wallet age.
pub(crate) struct FakeChain {
    balances: Mutex<HashMap<String, f64>>,
    failing: Mutex<HashSet<String>>,
    age_days: Option<i64>,
}

impl FakeChain {
    pub(crate) fn aged(days: i64) -> Self {
        Self {
            balances: Mutex::default(),
            failing: Mutex::default(),
            age_days: Some(days),
        }
    }

    pub(crate) fn without_history() -> Self {
        Self {
            balances: Mutex::default(),
            failing: Mutex::default(),
            age_days: None,
        }
    }

    pub(crate) async fn set_balance(&self, wallet: &str, balance: f64) {
        self.balances
            .lock()
            .await
            .insert(wallet.to_string(), balance);
    }

    pub(crate) async fn fail_wallet(&self, wallet: &str) {
        self.failing.lock().await.insert(wallet.to_string());
    }
}

#[async_trait]
impl ChainGateway for FakeChain {
    async fn get_balances(&self, address: &str) -> Result<Vec<DenomAmount>, ChainError> {
        if self.failing.lock().await.contains(address) {
            return Err(ChainError::Http {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        let balance = self.balances.lock().await.get(address).copied();
        Ok(balance
            .map(|balance| DenomAmount {
                denom: "uosmo".to_string(),
                amount: format!("{}", (balance * 1_000_000.0).round() as u64),
            })
            .into_iter()
            .collect())
    }

    async fn get_first_transaction(&self, _address: &str) -> Result<FirstTransaction, ChainError> {
        Ok(match self.age_days {
            Some(days) => FirstTransaction::At(Utc::now() - Duration::days(days)),
            None => FirstTransaction::NoHistory,
        })
    }
}

/// In-memory guild: member role sets plus a log of every full-set write.
#[derive(Default)]
pub(crate) struct FakePlatform {
    members: Mutex<HashMap<String, BTreeSet<String>>>,
    writes: Mutex<Vec<(String, BTreeSet<String>)>>,
    reject_writes: Mutex<bool>,
    next_read_delay: Mutex<Option<std::time::Duration>>,
}

impl FakePlatform {
    pub(crate) async fn set_member(&self, account_id: &str, roles: &[&str]) {
        self.members.lock().await.insert(
            account_id.to_string(),
            roles.iter().map(ToString::to_string).collect(),
        );
    }

    pub(crate) async fn member_roles(&self, account_id: &str) -> BTreeSet<String> {
        self.members
            .lock()
            .await
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn writes(&self) -> Vec<(String, BTreeSet<String>)> {
        self.writes.lock().await.clone()
    }

    pub(crate) async fn reject_writes(&self, reject: bool) {
        *self.reject_writes.lock().await = reject;
    }

    /// Stalls only the next member read, simulating one slow request.
    pub(crate) async fn delay_next_read(&self, delay: std::time::Duration) {
        *self.next_read_delay.lock().await = Some(delay);
    }
}

#[async_trait]
impl PlatformRoleApi for FakePlatform {
    async fn get_member_roles(&self, account_id: &str) -> Result<BTreeSet<String>, PlatformError> {
        let delay = self.next_read_delay.lock().await.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.members
            .lock()
            .await
            .get(account_id)
            .cloned()
            .ok_or_else(|| PlatformError::MemberNotFound(account_id.to_string()))
    }

    async fn set_member_roles(
        &self,
        account_id: &str,
        role_ids: &BTreeSet<String>,
    ) -> Result<(), PlatformError> {
        if *self.reject_writes.lock().await {
            return Err(PlatformError::Http {
                status: 403,
                body: "Missing Permissions".to_string(),
            });
        }
        let mut members = self.members.lock().await;
        let Some(roles) = members.get_mut(account_id) else {
            return Err(PlatformError::MemberNotFound(account_id.to_string()));
        };
        *roles = role_ids.clone();
        self.writes
            .lock()
            .await
            .push((account_id.to_string(), role_ids.clone()));
        Ok(())
    }
}

pub(crate) fn roles(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(ToString::to_string).collect()
}
