//! The controller loop (spec.md §4.F): schedules and drives the plan
//! calculator, the registry, and the provider with batching,
//! event-triggered runs, dry-run, and soft/hard error handling.
//!
//! No teacher module plays quite this role — the closest analogue is the
//! teacher's `main()`/`run_job` pair (`src/bin/clouddns-nat-helper.rs`),
//! which sleeps for a fixed interval and calls a single synchronous
//! `run_job` each time. This module keeps that "one worker, one sleep
//! loop" shape (grounded on the teacher's `tokio::time::sleep` loop) but
//! generalizes it to the debounce/coalescing schedule and soft/hard error
//! classification spec.md §4.F specifies.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::time::interval;

use crate::changes::Changes;
use crate::domainfilter::DomainFilter;
use crate::endpoint::RecordType;
use crate::errors::{Classify, ErrorClass};
use crate::events::EventEmitter;
use crate::metrics::MetricsRegistry;
use crate::plan::{ConflictResolver, PlanCalculator};
use crate::policy::Policy;
use crate::registry::{Registry, RegistryError};
use crate::source::{Source, SourceError};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl Classify for ControllerError {
    fn class(&self) -> ErrorClass {
        match self {
            ControllerError::Source(e) => e.class(),
            ControllerError::Registry(e) => e.class(),
        }
    }
}

struct ScheduleState {
    last_run_at: Instant,
    next_run_at: Instant,
}

/// Configuration a [`ControllerLoop`] is built with; mirrors the plan
/// calculator's own constructor parameters plus the scheduling and
/// dry-run knobs from spec.md §6's CLI surface.
pub struct ControllerConfig {
    pub domain_filter: DomainFilter,
    pub managed_types: std::collections::HashSet<RecordType>,
    pub excluded_types: std::collections::HashSet<RecordType>,
    pub policies: Vec<Policy>,
    /// Builds a fresh resolver for each tick's `PlanCalculator`, since
    /// `Box<dyn ConflictResolver>` can't be cloned out of a shared config.
    pub resolver_factory: Option<Box<dyn Fn() -> Box<dyn ConflictResolver + Send + Sync> + Send + Sync>>,
    /// Shared rather than boxed so it can be handed to a fresh
    /// `PlanCalculator` every tick without needing `Clone` on the closure
    /// itself.
    pub property_comparator: Option<Arc<dyn Fn(&str, &str, &str) -> bool + Send + Sync>>,
    pub interval: Duration,
    pub min_event_sync_interval: Duration,
    pub dry_run: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            domain_filter: DomainFilter::default(),
            managed_types: std::collections::HashSet::from([RecordType::A, RecordType::Aaaa, RecordType::Cname]),
            excluded_types: std::collections::HashSet::new(),
            policies: vec![Policy::Sync],
            resolver_factory: None,
            property_comparator: None,
            interval: Duration::from_secs(60),
            min_event_sync_interval: Duration::from_secs(5),
            dry_run: false,
        }
    }
}

pub struct ControllerLoop {
    source: Arc<dyn Source>,
    registry: Arc<dyn Registry>,
    metrics: Arc<dyn MetricsRegistry>,
    events: Option<Arc<EventEmitter>>,
    config: ControllerConfig,
    schedule: Mutex<ScheduleState>,
    consecutive_soft_errors: AtomicU64,
}

impl ControllerLoop {
    pub fn new(source: Arc<dyn Source>, registry: Arc<dyn Registry>, metrics: Arc<dyn MetricsRegistry>, config: ControllerConfig) -> Self {
        let now = Instant::now();
        ControllerLoop {
            source,
            registry,
            metrics,
            events: None,
            config,
            schedule: Mutex::new(ScheduleState {
                last_run_at: now,
                next_run_at: now,
            }),
            consecutive_soft_errors: AtomicU64::new(0),
        }
    }

    pub fn with_event_emitter(mut self, emitter: Arc<EventEmitter>) -> Self {
        self.events = Some(emitter);
        self
    }

    /// Registers `ScheduleRunOnce` as the source's event handler, wiring
    /// event-triggered runs (spec.md §6 `AddEventHandler`).
    pub fn wire_source_events(self: &Arc<Self>) {
        let this = self.clone();
        self.source.add_event_handler(Box::new(move || {
            this.schedule_run_once(Instant::now());
        }));
    }

    /// `now < nextRunAt` ⇒ false; else advances `nextRunAt` by `Interval`
    /// and returns true (spec.md §4.F, property 10).
    pub fn should_run_once(&self, now: Instant) -> bool {
        let mut state = self.schedule.lock().unwrap();
        if now < state.next_run_at {
            return false;
        }
        state.next_run_at = now + self.config.interval;
        true
    }

    /// Debounces source events within `min_event_sync_interval`, never
    /// scheduling earlier than `lastRunAt + minEventSyncInterval`
    /// (spec.md §4.F, property 10):
    /// `nextRunAt = max(lastRunAt + minEventSyncInterval, min(now + 5s, nextRunAt))`.
    pub fn schedule_run_once(&self, now: Instant) {
        let mut state = self.schedule.lock().unwrap();
        let floor = state.last_run_at + self.config.min_event_sync_interval;
        let ceiling = std::cmp::min(now + Duration::from_secs(5), state.next_run_at);
        state.next_run_at = std::cmp::max(floor, ceiling);
    }

    fn build_plan_calculator(&self) -> PlanCalculator {
        let mut managed_types = self.config.managed_types.clone();
        managed_types.extend(crate::registry::txt::always_managed_types());
        let mut calculator = PlanCalculator::new(self.config.domain_filter.clone(), managed_types, self.registry.owner_id())
            .excluding_types(self.config.excluded_types.clone())
            .with_policies(self.config.policies.clone())
            .with_extra_domain_filter(self.registry.domain_filter());
        if let Some(factory) = &self.config.resolver_factory {
            calculator = calculator.with_resolver(factory());
        }
        if let Some(cmp) = &self.config.property_comparator {
            let cmp = cmp.clone();
            calculator = calculator.with_property_comparator(Box::new(move |name, current, desired| cmp(name, current, desired)));
        }
        calculator
    }

    /// Runs one reconciliation tick end-to-end (spec.md §4.F `RunOnce`).
    pub fn run_once(&self) -> Result<Changes, ControllerError> {
        let unix_now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        self.metrics.set_last_reconcile_timestamp(unix_now);
        {
            let mut state = self.schedule.lock().unwrap();
            state.last_run_at = Instant::now();
        }

        let current = match self.registry.records() {
            Ok(records) => records,
            Err(e) => {
                self.metrics.inc_registry_errors();
                return Err(e.into());
            }
        };

        let source_endpoints = match self.source.endpoints() {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.metrics.inc_source_errors();
                return Err(e.into());
            }
        };

        let desired = match self.registry.adjust_endpoints(source_endpoints) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.metrics.inc_registry_errors();
                return Err(e.into());
            }
        };

        let calculator = self.build_plan_calculator();
        let missing = self.registry.missing_records();
        let changes = calculator.calculate(current, desired, missing, self.metrics.as_ref());

        if !changes.is_empty() {
            if self.config.dry_run {
                info!(
                    "dry-run: would create {}, update {}, delete {} records",
                    changes.create.len(),
                    changes.update_len(),
                    changes.delete.len()
                );
            } else {
                match self.registry.apply_changes(changes.clone()) {
                    Ok(()) => {
                        if let Some(events) = &self.events {
                            events.emit_changes(&changes);
                        }
                    }
                    Err(e) => {
                        let soft = e.is_soft();
                        self.metrics.inc_provider_errors(soft);
                        return Err(e.into());
                    }
                }
            }
        }

        let unix_now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        self.metrics.set_last_sync_timestamp(unix_now);
        Ok(changes)
    }

    /// Drives `run_once` on a 1-second ticker until `shutdown` is set
    /// (spec.md §4.F `Run`). A soft error is logged and the loop
    /// continues with an incremented consecutive-soft-error gauge; a hard
    /// error is returned to the caller, which is expected to terminate the
    /// process (spec.md §4.F, §9 "fatal-on-error loop").
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<(), ControllerError> {
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                debug!("shutdown requested, exiting controller loop");
                return Ok(());
            }
            if !self.should_run_once(Instant::now()) {
                continue;
            }
            match self.run_once() {
                Ok(_) => {
                    self.consecutive_soft_errors.store(0, Ordering::Relaxed);
                    self.metrics.set_consecutive_soft_errors(0);
                }
                Err(e) if e.is_soft() => {
                    let n = self.consecutive_soft_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    self.metrics.set_consecutive_soft_errors(n);
                    warn!("soft error during reconciliation (consecutive: {n}): {e}");
                }
                Err(e) => {
                    error!("hard error during reconciliation, terminating: {e}");
                    return Err(e);
                }
            }
        }
    }
}
