//! Soft/hard error classification shared by sources, providers, and the
//! registry (spec.md §7). The plan calculator is exempt — it cannot fail.

use std::error::Error as StdError;

/// How the controller loop should react to a failure (spec.md §7, §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: rate limit, 5xx, DNS timeout, failed source list. The
    /// loop logs, bumps a counter, and retries on the next tick.
    Soft,
    /// Fatal: authentication, bad config, unknown provider. The process
    /// exits non-zero (spec.md §4.F, §9 "fatal-on-error loop").
    Hard,
}

/// Implemented by provider/source/registry errors that can distinguish a
/// transient failure from a fatal one. Each concrete error enum carries its
/// own sentinel rather than relying on downcasting, so the controller loop
/// classifies a failure by calling `.class()` directly on whichever
/// component error it receives (spec.md §7 "checking for the soft sentinel
/// via error chaining" — the chain here is the `Result` conversion chain
/// the loop already walks, not a runtime `source()` traversal).
pub trait Classify: StdError {
    fn class(&self) -> ErrorClass;

    fn is_soft(&self) -> bool {
        self.class() == ErrorClass::Soft
    }
}
