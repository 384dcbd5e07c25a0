//! The change-event emitter (spec.md §4.H): turns an applied [`Changes`]
//! value into per-record notifications. A bounded queue with
//! drop-on-full feeds a single rate-limited worker thread (spec.md §5
//! "one event worker"), matching the crate's "N blocking suspension
//! points, one dedicated thread per auxiliary concern" model.
//!
//! No teacher module covers this (the teacher has no event surface at
//! all); grounded on `governor`'s `DefaultDirectRateLimiter` as used for
//! worker-side throttling in `RoeeJ-heimdall/src/rate_limiter.rs`, and on
//! the bounded-channel-plus-worker-thread shape the crate already uses for
//! its single-reconciler-thread model (spec.md §5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::{debug, warn};

use crate::changes::Changes;
use crate::endpoint::EndpointKey;

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Created,
    Modified,
    Deleted,
}

/// Why the event is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    Ready,
    Error,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: EndpointKey,
    pub action: EventAction,
    pub reason: EventReason,
    pub message: Option<String>,
}

/// A sink that actually delivers an event (to an orchestrator event API, a
/// log line, a test double...). Returning `Err` triggers a bounded number
/// of retries before the event is dropped.
pub trait EventSink: Send + Sync + 'static {
    fn deliver(&self, event: &ChangeEvent) -> Result<(), String>;
}

impl<F: Fn(&ChangeEvent) -> Result<(), String> + Send + Sync + 'static> EventSink for F {
    fn deliver(&self, event: &ChangeEvent) -> Result<(), String> {
        self(event)
    }
}

const DEFAULT_MAX_RETRIES: u32 = 3;

pub struct EventEmitter {
    sender: SyncSender<ChangeEvent>,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl EventEmitter {
    /// `capacity` bounds the queue; `quota` bounds the worker's delivery
    /// rate. The worker retries a failing delivery up to
    /// `DEFAULT_MAX_RETRIES` times before dropping the event.
    pub fn new(capacity: usize, quota: Quota, sink: impl EventSink) -> Self {
        let (sender, receiver) = sync_channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let shutdown_worker = shutdown.clone();
        let limiter: DefaultDirectRateLimiter = RateLimiter::direct(quota);

        let worker = std::thread::spawn(move || {
            while !shutdown_worker.load(Ordering::Relaxed) {
                match receiver.recv_timeout(Duration::from_millis(200)) {
                    Ok(event) => {
                        while limiter.check().is_err() {
                            std::thread::sleep(Duration::from_millis(10));
                        }
                        let mut attempts = 0;
                        loop {
                            attempts += 1;
                            match sink.deliver(&event) {
                                Ok(()) => break,
                                Err(err) if attempts < DEFAULT_MAX_RETRIES => {
                                    debug!("retrying event delivery ({attempts}/{DEFAULT_MAX_RETRIES}): {err}");
                                }
                                Err(err) => {
                                    warn!("dropping event after {attempts} attempts: {err}");
                                    break;
                                }
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        EventEmitter {
            sender,
            dropped,
            worker: Some(worker),
            shutdown,
        }
    }

    /// Emit one event per endpoint in `changes`, non-blocking: a full
    /// queue drops the event and bumps the drop counter rather than
    /// stalling the reconciler thread (spec.md §4.H).
    pub fn emit_changes(&self, changes: &Changes) {
        for endpoint in &changes.create {
            self.try_send(ChangeEvent {
                key: endpoint.key(),
                action: EventAction::Created,
                reason: EventReason::Ready,
                message: None,
            });
        }
        for endpoint in &changes.update_new {
            self.try_send(ChangeEvent {
                key: endpoint.key(),
                action: EventAction::Modified,
                reason: EventReason::Ready,
                message: None,
            });
        }
        for endpoint in &changes.delete {
            self.try_send(ChangeEvent {
                key: endpoint.key(),
                action: EventAction::Deleted,
                reason: EventReason::Deleted,
                message: None,
            });
        }
    }

    pub fn emit_error(&self, key: EndpointKey, message: impl Into<String>) {
        self.try_send(ChangeEvent {
            key,
            action: EventAction::Modified,
            reason: EventReason::Error,
            message: Some(message.into()),
        });
    }

    fn try_send(&self, event: ChangeEvent) {
        if let Err(TrySendError::Full(_)) = self.sender.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for EventEmitter {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
