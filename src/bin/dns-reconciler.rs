//! CLI entrypoint: parses flags, wires a [`Source`]/[`Provider`]/[`Registry`]
//! together behind a [`ControllerLoop`], and runs it to completion.
//!
//! Grounded on the teacher's `main()` (`src/bin/clouddns-nat-helper.rs`):
//! same `clap::Parser::parse()` → `env_logger::Builder` → run-loop shape.
//! Concrete `Source`/`Provider` implementations are out of scope (spec.md
//! §1), so this binary wires the crate's own in-memory test doubles —
//! a real deployment supplies its own `Source`/`Provider` and calls
//! [`dns_reconciler::controller::ControllerLoop`] directly instead of this
//! binary.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use env_logger::Builder;
use log::{error, info};

use dns_reconciler::config::{build_shared_provider, Cli, RegistryFactories};
use dns_reconciler::controller::{ControllerConfig, ControllerLoop};
use dns_reconciler::errors::Classify;
use dns_reconciler::metrics::PrometheusMetrics;
use dns_reconciler::provider::InMemoryProvider;
use dns_reconciler::source::StaticSource;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    Builder::new().filter_level(cli.loglevel.into()).init();

    if cli.dry_run {
        info!("running in dry-run mode, no changes will be applied");
    }

    let provider = build_shared_provider(InMemoryProvider::new(vec![]), std::time::Duration::from_secs(cli.provider_cache_time));
    let registry = match RegistryFactories::default().build(cli.registry, &cli, provider) {
        Ok(registry) => registry,
        Err(e) => {
            error!("failed to construct registry: {e}");
            return ExitCode::FAILURE;
        }
    };
    let domain_filter = match cli.domain_filter() {
        Ok(filter) => filter,
        Err(e) => {
            error!("invalid domain filter configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let metrics = match PrometheusMetrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!("failed to register metrics: {e}");
            return ExitCode::FAILURE;
        }
    };

    let source: Arc<dyn dns_reconciler::source::Source> = Arc::new(StaticSource::new(vec![]));

    let config = ControllerConfig {
        domain_filter,
        managed_types: cli.managed_types(),
        excluded_types: cli.excluded_types(),
        policies: vec![cli.policy.into()],
        resolver_factory: None,
        property_comparator: None,
        interval: cli.interval(),
        min_event_sync_interval: cli.min_event_sync_interval(),
        dry_run: cli.dry_run,
    };

    let controller = Arc::new(ControllerLoop::new(source, registry, metrics, config));
    controller.wire_source_events();

    if cli.once {
        return match controller.run_once() {
            Ok(changes) => {
                info!("reconciliation complete: {} changes applied", changes.len());
                ExitCode::SUCCESS
            }
            Err(e) if e.is_soft() => {
                error!("soft error on single run: {e}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("hard error on single run: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_signal.store(true, Ordering::Relaxed);
        }
    });

    match controller.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("controller loop terminated with a hard error: {e}");
            ExitCode::FAILURE
        }
    }
}
