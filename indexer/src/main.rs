//! `chainscope` binary: run one indexing session end to end.

use chainscope_indexer::cli::{self, CliArgs};
use chainscope_indexer::config::{AppConfig, TierTable};
use chainscope_indexer::locate::DeploymentLocator;
use chainscope_indexer::pipeline::{
    BroadcastSink, ChunkIndexer, IndexerOptions, ProgressEvent, ProgressStep, TailMonitor,
};
use chainscope_indexer::provider::{ProviderOrchestrator, ProviderSnapshot, DEFAULT_PROBE_INTERVAL};
use chainscope_indexer::rpc::{
    HttpConnection, RetryPolicy, RpcTransport, TransportConfig, TransportStats,
};
use chainscope_indexer::session::{
    IndexingSession, MetricsSnapshot, SessionHandle, SessionKey, SessionRegistry, SessionStatus,
};
use chainscope_indexer::store::MemoryStore;
use chainscope_indexer::tier::{StaticSubscriptionLookup, SubscriptionLookup, TierRangeCalculator};
use clap::Parser;
use eyre::{eyre, Result, WrapErr};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct SessionSummary {
    session: SessionKey,
    status: SessionStatus,
    tier: String,
    fail_closed: bool,
    deployment_block: u64,
    deployment_degraded: bool,
    start_block: u64,
    end_block: u64,
    metrics: MetricsSnapshot,
    transport: TransportStats,
    providers: Vec<ProviderSnapshot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    cli::init_tracing(&args.log_filter)?;

    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::builtin(),
    };
    let chain = config
        .chain_by_name(&args.chain)
        .ok_or_else(|| eyre!("unknown chain {:?}", args.chain))?
        .clone();
    let chunk_size = args.chunk_size.unwrap_or(chain.chunk_size);

    let connection = Arc::new(HttpConnection::new(HTTP_TIMEOUT)?);
    let transport_config = TransportConfig::new(chain.chain_id, chain.endpoints.clone())
        .with_avg_block_time(chain.avg_block_time());
    let tiers = config.tier_table();
    let fallback_limits = tiers
        .most_restrictive()
        .ok_or_else(|| eyre!("no tiers configured"))?
        .queue_limits();
    let transport = Arc::new(RpcTransport::new(
        transport_config,
        RetryPolicy::default(),
        connection,
        fallback_limits,
    )?);

    let orchestrator = Arc::new(ProviderOrchestrator::new(DEFAULT_PROBE_INTERVAL));
    orchestrator
        .register(chain.name.clone(), transport.clone())
        .await
        .wrap_err_with(|| format!("could not register provider for {}", chain.name))?;
    let (stop_probe, probe_stopped) = watch::channel(false);
    let probe_task = orchestrator.spawn_health_probe(probe_stopped);

    // Resolve the subscriber's window before any chunk work.
    let mut entries = StaticSubscriptionLookup::new();
    if let Some(tier) = &args.tier {
        entries = entries.with_account(args.account.clone(), tier.clone());
    }
    let lookup: Arc<dyn SubscriptionLookup> = Arc::new(entries);
    let calculator = TierRangeCalculator::new(lookup.clone(), tiers.clone())?;

    let head = transport.block_number().await?;
    tracing::info!(chain = %chain.name, head, "observed chain head");

    let locator = DeploymentLocator::new(transport.clone(), chain.blocks_per_day);
    let deployment = locator.locate(args.contract, head).await?;
    tracing::info!(
        contract = %args.contract,
        block = deployment.block,
        degraded = deployment.degraded,
        "deployment located"
    );

    let decision = calculator
        .decide(&args.account, &chain, deployment.block, head)
        .await?;
    if let Some(tier) = tiers.get(&decision.tier) {
        transport.set_tier(tier.queue_limits());
    }

    let will_tail = args.follow && decision.continuous_sync;
    let mut session = IndexingSession::new(
        SessionKey {
            account: args.account.clone(),
            chain_id: chain.chain_id,
            contract: args.contract,
        },
        decision.clone(),
        deployment,
        chunk_size,
    );
    if will_tail {
        session = session.with_tail();
    }
    let session = Arc::new(session);
    let registry = SessionRegistry::new();
    let handle = registry.create(session)?;

    let ctrlc_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling session");
            ctrlc_handle.cancel();
        }
    });

    let progress_task = spawn_progress_bar(&handle);

    // Replay the resolution steps to observers before chunk work starts.
    let events = handle.events_sender();
    for step in [
        ProgressStep::HeadObserved { head },
        ProgressStep::DeploymentLocated {
            block: deployment.block,
            degraded: deployment.degraded,
        },
        ProgressStep::RangeResolved {
            tier: decision.tier.clone(),
            start_block: decision.start_block,
            end_block: decision.end_block,
            fail_closed: decision.fail_closed,
        },
    ] {
        let _ = events.send(ProgressEvent {
            session: handle.session.key.clone(),
            step,
        });
    }

    let indexer = Arc::new(ChunkIndexer::new(
        orchestrator.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(BroadcastSink::new(handle.events_sender())),
        IndexerOptions {
            chunk_size,
            ..Default::default()
        },
    ));

    let run_outcome = run_session(&args, &handle, indexer, lookup, tiers).await;

    let _ = stop_probe.send(true);
    probe_task.abort();
    progress_task.abort();
    let _ = progress_task.await;

    let summary = SessionSummary {
        session: handle.session.key.clone(),
        status: handle.session.status(),
        tier: decision.tier.clone(),
        fail_closed: decision.fail_closed,
        deployment_block: deployment.block,
        deployment_degraded: deployment.degraded,
        start_block: decision.start_block,
        end_block: decision.end_block,
        metrics: handle.session.metrics.snapshot(),
        transport: transport.stats(),
        providers: orchestrator.snapshots(),
    };
    if args.json_summary {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        tracing::info!(
            status = ?summary.status,
            blocks = summary.metrics.blocks_indexed,
            logs = summary.metrics.logs_fetched,
            txs = summary.metrics.txs_fetched,
            chunks = summary.metrics.chunks_completed,
            elapsed_ms = summary.metrics.elapsed_ms,
            "session finished"
        );
    }

    run_outcome
}

async fn run_session(
    args: &CliArgs,
    handle: &Arc<SessionHandle>,
    indexer: Arc<ChunkIndexer>,
    lookup: Arc<dyn SubscriptionLookup>,
    tiers: TierTable,
) -> Result<()> {
    indexer.run_backfill(handle).await?;
    if handle.session.is_cancelled() {
        return Ok(());
    }
    if args.follow {
        if handle.session.decision.continuous_sync {
            let monitor = TailMonitor::new(indexer, Duration::from_secs(args.poll_secs.max(1)))
                .with_tier_check(lookup, tiers);
            monitor.run(handle).await?;
        } else {
            tracing::warn!(
                tier = %handle.session.decision.tier,
                "tier does not include continuous sync; skipping follow"
            );
        }
    }
    Ok(())
}

/// Render progress events as a block-level bar until the session's event
/// channel closes.
fn spawn_progress_bar(handle: &Arc<SessionHandle>) -> tokio::task::JoinHandle<()> {
    let mut events = handle.subscribe();
    let total: u64 = handle.session.chunks.iter().map(|chunk| chunk.len()).sum();
    let task = async move {
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} blocks {msg}",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        loop {
            match events.recv().await {
                Ok(event) => match event.step {
                    ProgressStep::ChunkStarted {
                        index,
                        start_block,
                        end_block,
                    } => bar.set_message(format!("chunk {index} [{start_block}..{end_block})")),
                    ProgressStep::ChunkCompleted { metrics } => bar.inc(metrics.blocks),
                    ProgressStep::ChunkFailed { index, reason } => {
                        bar.set_message(format!("chunk {index} failed: {reason}"))
                    }
                    ProgressStep::TailTick { head, lag } => {
                        bar.set_message(format!("tail head={head} lag={lag}"))
                    }
                    ProgressStep::BackfillFinished => bar.set_message("backfill finished"),
                    _ => {}
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        bar.finish_and_clear();
    };
    tokio::spawn(task)
}
