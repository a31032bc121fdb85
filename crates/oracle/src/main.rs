//! # SecuRizz Oracle Entry Point
//!
//! Configuration comes from the environment only; see
//! [`securizz_oracle::config`] for the variable list.
//!
//! ## Initialization Flow
//! 1. Read and validate configuration
//! 2. Load the signing key
//! 3. Build ledger, report store and content gateway clients
//! 4. Ledger health check (3 attempts, fatal on failure)
//! 5. Start the ops endpoint if `ORACLE_HTTP_ADDR` is set
//! 6. Run the scheduler until SIGINT/SIGTERM
//!
//! Any failure before step 6 exits with status 1.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};

use securizz_oracle::{
    join_task, unix_now, ChainClient, ChainError, HttpContentGateway, HttpReportStore,
    IntegrityVerifier, JsonRpcChainTransport, OpsState, OracleConfig, OracleMetrics,
    ProofSubmitter, Scheduler, SchedulerSettings, StateTracker,
};

// ════════════════════════════════════════════════════════════════════════════
// LEDGER STARTUP HEALTH CHECK
// ════════════════════════════════════════════════════════════════════════════

async fn startup_ledger_health_check(chain: &ChainClient) -> Result<(), ChainError> {
    let max_attempts = 3;
    let retry_delay = Duration::from_secs(2);

    for attempt in 1..=max_attempts {
        info!("ledger health check (attempt {}/{})", attempt, max_attempts);
        match chain.health_check().await {
            Ok(()) => {
                info!("ledger reachable");
                return Ok(());
            }
            Err(e) if attempt < max_attempts => {
                warn!("ledger health check error: {}, retrying...", e);
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(ChainError::Timeout)
}

// ════════════════════════════════════════════════════════════════════════════
// SHUTDOWN SIGNAL
// ════════════════════════════════════════════════════════════════════════════

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            error!("failed to listen for Ctrl+C: {}", e);
                        }
                    }
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MAIN
// ════════════════════════════════════════════════════════════════════════════

async fn run() -> Result<()> {
    let config = OracleConfig::from_env().context("configuration")?;
    config.validate().context("configuration")?;

    let signer = Arc::new(config.load_signer().context("loading signing key")?);
    let transport = JsonRpcChainTransport::new(&config.rpc_url, config.call_timeout)
        .context("ledger client")?;
    let chain = Arc::new(
        ChainClient::new(Arc::new(transport), signer, config.program_id.clone())
            .with_timeouts(config.call_timeout, config.confirm_poll_interval),
    );
    let oracle_pubkey = hex::encode(chain.oracle_public_key());

    info!("═══════════════════════════════════════════════════════════════");
    info!("                    SecuRizz Oracle                            ");
    info!("═══════════════════════════════════════════════════════════════");
    info!(program_id = %config.program_id, oracle = %oracle_pubkey, "identity loaded");

    let store = Arc::new(
        HttpReportStore::new(&config.backend_url, config.call_timeout)
            .context("report store client")?,
    );
    let gateway = Arc::new(
        HttpContentGateway::new(&config.gateway_url, config.call_timeout)
            .context("content gateway client")?,
    );

    startup_ledger_health_check(&chain)
        .await
        .context("ledger unreachable at startup")?;

    let metrics = Arc::new(OracleMetrics::new());
    let tracker = Arc::new(StateTracker::new(store.clone(), config.max_attempts));
    let submitter = Arc::new(ProofSubmitter::new(
        chain.clone(),
        tracker.clone(),
        metrics.clone(),
    ));
    let verifier = Arc::new(IntegrityVerifier::new(
        chain,
        gateway,
        tracker.clone(),
        metrics.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        store,
        submitter,
        verifier,
        metrics.clone(),
        SchedulerSettings {
            submission_interval: config.submission_interval,
            integrity_interval: config.integrity_interval,
            max_in_flight: config.max_in_flight,
            shutdown_grace: config.shutdown_grace,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ops_handle = config.http_addr.map(|addr| {
        let state = Arc::new(OpsState {
            tracker,
            metrics,
            program_id: config.program_id.clone(),
            oracle: oracle_pubkey.clone(),
            start_time: unix_now(),
        });
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = securizz_oracle::ops::serve(addr, state, rx).await {
                error!("ops endpoint failed: {}", e);
            }
        })
    });

    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    wait_for_signal().await;
    info!("shutdown signal received, stopping");
    let _ = shutdown_tx.send(true);

    join_task("scheduler", scheduler_handle).await;
    if let Some(h) = ops_handle {
        join_task("ops endpoint", h).await;
    }

    info!("═══════════════════════════════════════════════════════════════");
    info!("                  Oracle stopped cleanly                       ");
    info!("═══════════════════════════════════════════════════════════════");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}
