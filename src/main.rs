// aerolithdb-index-advisor - Automatic Compound-Index Advisor and Synchronizer
//
// Main application entry point for the index-recommendation engine.
//
// This binary wires the `aerolithdb-index-engine` library against a small
// in-memory reference implementation of the external collaborators it
// expects (profiling stream, random-access document sampler, index admin,
// state store) and drives the observe -> sample -> synchronize loop on the
// configured interval. A real deployment swaps these reference
// collaborators for transport that actually talks to a running database;
// that transport is out of scope for this crate (see SPEC_FULL.md §1).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use aerolithdb_index_engine::collaborators::{
    InMemoryDocumentSampler, InMemoryIndexAdmin, InMemoryProfileSource, InMemoryStateStore,
};
use aerolithdb_index_engine::{EngineConfig, IndexAdvisor};

/// Main application entry point with async runtime initialization.
///
/// This function coordinates the engine's lifecycle:
/// 1. **Logging setup**: structured JSON logging, environment-filtered.
/// 2. **Configuration**: load `config.json` or persist the documented
///    defaults.
/// 3. **State restore**: resume the `QuerySet` and sampler caches from the
///    last persisted state document, if any.
/// 4. **Scheduling loop**: drain the profiling stream, resample stale
///    collections, and run a synchronization cycle every
///    `index_synchronization_interval_secs`.
/// 5. **Shutdown**: on Ctrl+C, persist state one last time and exit 0; a
///    fatal collaborator error (connection loss, auth failure, state
///    persistence failure, profiling stream exhaustion) exits non-zero
///    immediately, relying on external supervision to restart the process.
#[tokio::main]
async fn main() -> Result<()> {
    // Structured JSON logging, matching the teacher's top-level binary:
    // environment-based level filtering (RUST_LOG=debug,aerolithdb_index_advisor=trace)
    // defaulting to 'info', JSON-formatted for log aggregation.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("aerolithdb_index_advisor=info".parse()?),
        )
        .json()
        .init();

    info!("starting aerolithdb-index-advisor");

    let config = EngineConfig::load_or_default().await?;
    info!(
        sample_size = config.sample_size,
        minimum_cardinality = config.minimum_cardinality,
        minimum_reduction = config.minimum_reduction,
        do_changes = config.do_changes,
        "loaded engine configuration"
    );

    // Reference collaborators: an empty profiling stream, an empty document
    // store, an empty index registry, and an empty state store. A real
    // deployment replaces every one of these with database transport; see
    // SPEC_FULL.md §1/§6. The demo seeds nothing so the loop is inert but
    // exercises every suspension point without requiring a live database.
    let advisor = Arc::new(IndexAdvisor::new(
        config.clone(),
        Arc::new(InMemoryProfileSource::new(Vec::new())),
        Arc::new(InMemoryDocumentSampler::new(HashMap::new())),
        Arc::new(InMemoryIndexAdmin::new()),
        Arc::new(InMemoryStateStore::new()),
    ));

    if let Err(e) = advisor.restore_state().await {
        error!(error = %e, "failed to restore persisted engine state");
        if e.is_fatal() {
            std::process::exit(1);
        }
    }
    info!("engine state restored (or none persisted yet)");

    let sync_interval = Duration::from_secs(config.index_synchronization_interval_secs);
    let mut ticker = tokio::time::interval(sync_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_cycle(&advisor).await {
                    error!(error = %e, "synchronization cycle failed");
                    if e.is_fatal() {
                        std::process::exit(1);
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("received shutdown signal, stopping aerolithdb-index-advisor..."),
                    Err(err) => error!(error = %err, "unable to listen for shutdown signal"),
                }
                break;
            }
        }
    }

    if let Err(e) = advisor.persist_state().await {
        error!(error = %e, "failed to persist engine state during shutdown");
        std::process::exit(1);
    }

    info!("aerolithdb-index-advisor stopped successfully");
    Ok(())
}

/// One observe -> sample -> synchronize cycle. Recoverable collaborator
/// errors from draining the profiling stream are logged and do not abort
/// the cycle; a fatal error propagates to the caller, which exits the
/// process (§7 propagation policy).
async fn run_cycle(advisor: &IndexAdvisor) -> Result<(), aerolithdb_index_engine::EngineError> {
    match advisor.drain_profile_stream().await {
        Ok(observed) => info!(observed, "drained profiling stream"),
        Err(e) if !e.is_fatal() => warn!(error = %e, "transient error draining profiling stream"),
        Err(e) => return Err(e),
    }

    let plans = advisor.run_sync_cycle().await?;
    for (namespace, plan) in &plans {
        info!(
            namespace = %namespace,
            create = plan.create.len(),
            drop = plan.drop.len(),
            keep = plan.keep.len(),
            "reconciliation plan"
        );
    }
    Ok(())
}
