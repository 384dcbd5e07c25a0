//! The `Source` contract (spec.md §6): produces the desired-endpoint list
//! each tick. Concrete sources (orchestrator ingress/service/route watchers)
//! are out of scope (spec.md §1) — only the trait and a couple of in-memory
//! implementations used for testing ship here.

use std::sync::{Arc, Mutex};

#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::errors::{Classify, ErrorClass};

/// Produces the desired-endpoint list. `add_event_handler` is optional:
/// sources that can't watch for upstream changes simply don't call `fn`,
/// and the controller falls back to its own interval ticker.
#[cfg_attr(test, automock)]
pub trait Source: Send + Sync {
    fn endpoints(&self) -> Result<Vec<Endpoint>, SourceError>;

    /// Register a callback invoked whenever the upstream declaration this
    /// source watches changes. The callback is expected to call
    /// [`crate::controller::ControllerLoop::schedule_run_once`]. The
    /// default implementation does nothing — polling sources have no
    /// event stream to subscribe to.
    fn add_event_handler(&self, _handler: Box<dyn Fn() + Send + Sync>) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("failed to list desired endpoints: {0}")]
    ListFailed(String),
}

impl Classify for SourceError {
    fn class(&self) -> ErrorClass {
        // Spec.md §7: "Source error ... soft-retry on next tick".
        ErrorClass::Soft
    }
}

/// A fixed desired-endpoint list, set at construction or swapped in later.
/// Grounded on the teacher's `FixedSource`/`ipv4source::fixed` split between
/// a static value and a resolved one (`src/ipv4source/fixed/mod.rs`).
pub struct StaticSource {
    endpoints: Mutex<Vec<Endpoint>>,
    handlers: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

impl StaticSource {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        StaticSource {
            endpoints: Mutex::new(endpoints),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Replace the desired set and notify any registered event handlers,
    /// simulating an upstream declaration change for controller-loop tests.
    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) {
        *self.endpoints.lock().unwrap() = endpoints;
        for handler in self.handlers.lock().unwrap().iter() {
            handler();
        }
    }
}

impl Source for StaticSource {
    fn endpoints(&self) -> Result<Vec<Endpoint>, SourceError> {
        Ok(self.endpoints.lock().unwrap().clone())
    }

    fn add_event_handler(&self, handler: Box<dyn Fn() + Send + Sync>) {
        self.handlers.lock().unwrap().push(Arc::from(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RecordType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn static_source_returns_configured_endpoints() {
        let source = StaticSource::new(vec![Endpoint::new("foo.example.com", RecordType::A, vec!["1.1.1.1".into()])]);
        let endpoints = source.endpoints().unwrap();
        assert_eq!(endpoints.len(), 1);
    }

    #[test]
    fn set_endpoints_invokes_registered_handlers() {
        let source = StaticSource::new(vec![]);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        source.add_event_handler(Box::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));
        source.set_endpoints(vec![Endpoint::new("a.example.com", RecordType::A, vec!["1.1.1.1".into()])]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.endpoints().unwrap().len(), 1);
    }
}
