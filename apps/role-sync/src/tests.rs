use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{Duration, Utc};

use crate::RoleSyncContext;
use crate::config::{Config, DiscordConfig, PollerConfig, SchedulerConfig, ValidatorConfig};
use crate::executor::{ReconcileOutcome, SkipReason};
use crate::store::{BalanceHistoryStore, MemoryRoleSyncStore, RoleSyncStores};
use crate::test_support::{FakeChain, FakePlatform, roles};
use crate::types::{BalanceRecord, RoleDefinition, WalletLink};

struct Engine {
    store: Arc<MemoryRoleSyncStore>,
    chain: Arc<FakeChain>,
    platform: Arc<FakePlatform>,
    context: RoleSyncContext,
}

fn test_config(skip_failed_fetches: bool) -> Result<Config> {
    Ok(Config {
        service_name: "role-sync-test".to_string(),
        bind_addr: "127.0.0.1:0".parse()?,
        db_url: None,
        chain_base_url: "http://127.0.0.1:1".to_string(),
        validator: ValidatorConfig::default(),
        poller: PollerConfig {
            batch_pause_ms: 0,
            skip_failed_fetches,
            ..PollerConfig::default()
        },
        scheduler: SchedulerConfig::default(),
        discord: DiscordConfig::default(),
    })
}

async fn engine(chain: FakeChain, skip_failed_fetches: bool) -> Result<Engine> {
    let store = Arc::new(MemoryRoleSyncStore::default());
    store.upsert_role(RoleDefinition::holder("H", "Holder")).await;
    store.upsert_role(RoleDefinition::amount("A1", "Tier 1", 50.0)).await;
    store.upsert_role(RoleDefinition::amount("A2", "Tier 2", 100.0)).await;

    let chain = Arc::new(chain);
    let platform = Arc::new(FakePlatform::default());
    let context = RoleSyncContext::assemble(
        test_config(skip_failed_fetches)?,
        RoleSyncStores::from_shared(store.clone()),
        chain.clone(),
        platform.clone(),
    );
    Ok(Engine {
        store,
        chain,
        platform,
        context,
    })
}

async fn link_wallet(engine: &Engine, index: usize, last_known_balance: f64) {
    engine
        .store
        .upsert_link(WalletLink {
            user_id: format!("user-{index}"),
            account_id: Some(format!("{}", 500 + index)),
            wallet_address: Some(format!("osmo1wallet{index}")),
            last_known_balance,
            last_check_at: None,
        })
        .await;
}

fn outcome_for<'a>(
    outcomes: &'a [(String, ReconcileOutcome)],
    account_id: &str,
) -> Result<&'a ReconcileOutcome> {
    outcomes
        .iter()
        .find(|(account, _)| account == account_id)
        .map(|(_, outcome)| outcome)
        .ok_or_else(|| anyhow!("no outcome for account {account_id}"))
}

#[tokio::test]
async fn funded_wallet_converges_to_holder_and_top_tier() -> Result<()> {
    let engine = engine(FakeChain::aged(90), false).await?;
    link_wallet(&engine, 0, 0.0).await;
    engine.platform.set_member("500", &["H", "unmanaged"]).await;
    engine.chain.set_balance("osmo1wallet0", 120.0).await;

    let report = engine.context.scheduler.run_once().await?;
    assert_eq!(report.deltas, 1);
    assert_eq!(
        outcome_for(&report.outcomes, "500")?,
        &ReconcileOutcome::Applied {
            added: roles(&["A2"]),
            removed: roles(&[]),
        }
    );
    assert_eq!(
        engine.platform.member_roles("500").await,
        roles(&["A2", "H", "unmanaged"])
    );

    let link = engine
        .store
        .link("user-0")
        .await
        .ok_or_else(|| anyhow!("link missing"))?;
    assert_eq!(link.last_known_balance, 120.0);
    let history = engine.store.history("osmo1wallet0").await;
    assert_eq!(history.len(), 1);
    assert_eq!(link.last_check_at, Some(history[0].sampled_at));

    let again = engine.context.scheduler.run_once().await?;
    assert_eq!(again.deltas, 0);
    assert_eq!(engine.platform.writes().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn one_broken_wallet_does_not_hold_back_its_batch() -> Result<()> {
    let engine = engine(FakeChain::aged(90), true).await?;
    for index in 0..10 {
        link_wallet(&engine, index, 0.0).await;
        engine.platform.set_member(&format!("{}", 500 + index), &[]).await;
        engine
            .chain
            .set_balance(&format!("osmo1wallet{index}"), 60.0)
            .await;
    }
    engine.chain.fail_wallet("osmo1wallet4").await;

    let report = engine.context.scheduler.run_once().await?;
    assert_eq!(report.wallets, 10);
    assert_eq!(report.deltas, 9);
    assert_eq!(report.fetch_failures, 1);
    for index in (0..10).filter(|index| *index != 4) {
        assert_eq!(
            engine
                .store
                .history(&format!("osmo1wallet{index}"))
                .await
                .len(),
            1
        );
        assert_eq!(
            engine
                .platform
                .member_roles(&format!("{}", 500 + index))
                .await,
            roles(&["A1", "H"])
        );
    }
    assert!(engine.store.history("osmo1wallet4").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn balance_spike_is_blocked_and_audited() -> Result<()> {
    let engine = engine(FakeChain::aged(90), false).await?;
    link_wallet(&engine, 0, 100.0).await;
    engine.platform.set_member("500", &["H", "A2"]).await;
    let now = Utc::now();
    for minutes_ago in [4, 2] {
        engine
            .store
            .append_sample(
                "user-0",
                BalanceRecord {
                    wallet_address: "osmo1wallet0".to_string(),
                    balance: 100.0,
                    sampled_at: now - Duration::minutes(minutes_ago),
                },
            )
            .await?;
    }
    engine.chain.set_balance("osmo1wallet0", 160.0).await;

    let report = engine.context.scheduler.run_once().await?;
    let ReconcileOutcome::Blocked { reasons } = outcome_for(&report.outcomes, "500")? else {
        return Err(anyhow!("expected a blocked outcome"));
    };
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].starts_with("Balance Volatility: Extreme balance volatility detected: 60.0%"));
    assert!(engine.platform.writes().await.is_empty());

    let audit = engine.store.audit_records().await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].balance, 160.0);
    assert_eq!(audit[0].requested_role_ids, vec!["A2".to_string(), "H".to_string()]);
    assert!(audit[0].checks["wallet_age"].valid);
    assert!(!audit[0].checks["balance_volatility"].valid);

    let metrics = engine.context.scheduler.metrics().await;
    assert_eq!(metrics.reconciliations_blocked, 1);
    Ok(())
}

#[tokio::test]
async fn failed_fetch_revokes_by_default_but_not_when_skipping() -> Result<()> {
    for (skip_failed_fetches, expected_roles) in [(false, roles(&[])), (true, roles(&["A1", "H"]))]
    {
        let engine = engine(FakeChain::aged(90), skip_failed_fetches).await?;
        link_wallet(&engine, 0, 75.0).await;
        engine.platform.set_member("500", &["A1", "H"]).await;
        engine.chain.fail_wallet("osmo1wallet0").await;

        engine.context.scheduler.run_once().await?;
        assert_eq!(
            engine.platform.member_roles("500").await,
            expected_roles,
            "skip_failed_fetches={skip_failed_fetches}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn unknown_member_is_skipped_without_touching_history() -> Result<()> {
    let engine = engine(FakeChain::aged(90), false).await?;
    link_wallet(&engine, 0, 0.0).await;
    engine.chain.set_balance("osmo1wallet0", 10.0).await;

    let report = engine.context.scheduler.run_once().await?;
    assert_eq!(
        outcome_for(&report.outcomes, "500")?,
        &ReconcileOutcome::Skipped(SkipReason::MemberNotFound)
    );
    assert_eq!(engine.store.history("osmo1wallet0").await.len(), 1);
    assert_eq!(
        engine.context.scheduler.metrics().await.reconciliations_failed,
        1
    );
    Ok(())
}
