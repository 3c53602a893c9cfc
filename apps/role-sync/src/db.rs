use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

const SCHEMA_SQL: &str = include_str!("../migrations/0001_role_sync.sql");

#[derive(Clone)]
pub struct RoleSyncDb {
    client: Arc<Mutex<Client>>,
}

impl RoleSyncDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "role sync postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    /// Applies the idempotent schema script.
    pub async fn migrate(&self) -> Result<()> {
        self.client
            .lock()
            .await
            .batch_execute(SCHEMA_SQL)
            .await
            .context("apply role_sync schema")
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }
}
