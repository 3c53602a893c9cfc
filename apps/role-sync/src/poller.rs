use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;

use crate::config::PollerConfig;
use crate::fetcher::{BalanceFetch, BalanceFetcher};
use crate::store::{BalanceHistoryStore, LinkedAccountDirectory, StoreError};
use crate::types::{BalanceDelta, WalletLink, balance_changed};

/// Counters for one poll pass, reported alongside the deltas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub wallets: usize,
    pub batches: usize,
    pub fetch_failures: usize,
    pub persist_failures: usize,
    pub deltas: usize,
}

pub struct BalancePoller {
    directory: Arc<dyn LinkedAccountDirectory>,
    history: Arc<dyn BalanceHistoryStore>,
    fetcher: BalanceFetcher,
    config: PollerConfig,
}

impl BalancePoller {
    pub fn new(
        directory: Arc<dyn LinkedAccountDirectory>,
        history: Arc<dyn BalanceHistoryStore>,
        fetcher: BalanceFetcher,
        config: PollerConfig,
    ) -> Self {
        Self {
            directory,
            history,
            fetcher,
            config,
        }
    }

    pub async fn run_cycle(&self) -> Result<Vec<BalanceDelta>, StoreError> {
        self.run_cycle_with_summary()
            .await
            .map(|(deltas, _summary)| deltas)
    }

    /// Only the directory read can fail the cycle; everything after it is
    /// isolated per wallet.
    pub async fn run_cycle_with_summary(
        &self,
    ) -> Result<(Vec<BalanceDelta>, CycleSummary), StoreError> {
        let links = self.directory.list_linked_accounts().await?;
        let mut summary = CycleSummary {
            wallets: links.len(),
            ..CycleSummary::default()
        };
        let mut deltas = Vec::new();
        let batch_size = self.config.batch_size.max(1);

        for (index, batch) in links.chunks(batch_size).enumerate() {
            if index > 0 && !self.config.batch_pause().is_zero() {
                tokio::time::sleep(self.config.batch_pause()).await;
            }
            summary.batches += 1;

            let samples = join_all(batch.iter().map(|link| self.sample(link))).await;
            for sample in samples {
                match sample {
                    Sample::Unchanged => {}
                    Sample::FetchFailed => summary.fetch_failures += 1,
                    Sample::Changed(delta) => match self.persist(&delta).await {
                        Ok(()) => deltas.push(delta),
                        Err(error) => {
                            summary.persist_failures += 1;
                            tracing::error!(
                                user_id = %delta.user_id,
                                wallet = %delta.wallet_address,
                                reason = %error,
                                "balance sample persist failed"
                            );
                        }
                    },
                }
            }
        }

        summary.deltas = deltas.len();
        if deltas.is_empty() {
            tracing::info!(wallets = summary.wallets, "poll cycle found no balance changes");
        } else {
            tracing::info!(
                wallets = summary.wallets,
                deltas = summary.deltas,
                fetch_failures = summary.fetch_failures,
                persist_failures = summary.persist_failures,
                "poll cycle found balance changes"
            );
        }
        Ok((deltas, summary))
    }

    async fn sample(&self, link: &WalletLink) -> Sample {
        let Some((account_id, wallet_address)) = link.linked_pair() else {
            return Sample::Unchanged;
        };
        let current_balance = match self.fetcher.fetch_detailed(wallet_address).await {
            BalanceFetch::Fetched(balance) => balance,
            BalanceFetch::Failed(_) if self.config.skip_failed_fetches => {
                return Sample::FetchFailed;
            }
            BalanceFetch::Failed(_) => 0.0,
        };
        if !balance_changed(link.last_known_balance, current_balance) {
            return Sample::Unchanged;
        }

        tracing::debug!(
            user_id = %link.user_id,
            wallet = %wallet_address,
            previous = link.last_known_balance,
            current = current_balance,
            "balance changed"
        );
        Sample::Changed(BalanceDelta {
            user_id: link.user_id.clone(),
            account_id: account_id.to_string(),
            wallet_address: wallet_address.to_string(),
            previous_balance: link.last_known_balance,
            current_balance,
            sampled_at: Utc::now(),
        })
    }

    async fn persist(&self, delta: &BalanceDelta) -> Result<(), StoreError> {
        self.history
            .append_sample(&delta.user_id, delta.to_record())
            .await
    }
}

enum Sample {
    Unchanged,
    FetchFailed,
    Changed(BalanceDelta),
}
