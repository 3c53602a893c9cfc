use anyhow::{Context, Result};
use clap::Parser;
use role_sync_service::{build_context, config::Config, serve};

#[derive(Parser, Debug)]
#[command(about = "Reconciles chat roles against on-chain wallet balances")]
struct Args {
    /// Run a single poll cycle, reconcile its deltas and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = Config::from_env().context("load role sync config")?;

    if args.once {
        let context = build_context(config).await?;
        let report = context.scheduler.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    serve(config, async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(reason = %error, "ctrl-c handler failed");
        }
        tracing::info!("shutdown requested");
    })
    .await
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("ROLE_SYNC_LOG_FORMAT")
        .is_ok_and(|format| format.trim().eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
