//! Progress-callback trait for per-stage analysis events.
//!
//! Inject an [`Arc<dyn AnalysisProgressCallback>`] via
//! [`crate::config::AnalyzerConfigBuilder::progress_callback`] to receive
//! events as the orchestrator moves through its stages. The CLI uses this to
//! drive a spinner; a server could forward the same events to a log sink.
//!
//! # Example
//!
//! ```rust
//! use subsidy_analyzer::{AnalysisProgressCallback, AnalyzerConfig, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl AnalysisProgressCallback for CountingCallback {
//!     fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{stage} done in {elapsed_ms}ms");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = AnalyzerConfig::builder()
//!     .progress_callback(counter as Arc<dyn AnalysisProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::error::ErrorKind;
use crate::pipeline::Stage;
use std::sync::Arc;

/// Called by the orchestrator as it runs each stage.
///
/// All methods default to no-ops so callers only override what they need.
/// Implementations must be `Send + Sync`; the callback is shared through an
/// `Arc` and may be moved into spawned tasks.
pub trait AnalysisProgressCallback: Send + Sync {
    /// Called before a stage starts (once per attempt).
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when a stage attempt succeeds.
    fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
        let _ = (stage, elapsed_ms);
    }

    /// Called when a stage attempt fails.
    ///
    /// `error` is owned so implementations can move it into a spawned task.
    fn on_stage_error(&self, stage: Stage, kind: ErrorKind, error: String) {
        let _ = (stage, kind, error);
    }

    /// Called when the orchestrator grants a failed stage its one retry.
    ///
    /// `detail` names the fallback path (alternate URL or fallback model).
    fn on_retry(&self, stage: Stage, detail: String) {
        let _ = (stage, detail);
    }

    /// Called once when the run reaches `Done` or `Failed`.
    fn on_analysis_complete(&self, final_stage: Stage, total_ms: u64) {
        let _ = (final_stage, total_ms);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl AnalysisProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::AnalyzerConfig`].
pub type ProgressCallback = Arc<dyn AnalysisProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: Mutex<Vec<(Stage, ErrorKind)>>,
        retries: AtomicUsize,
        finished: Mutex<Option<Stage>>,
    }

    impl AnalysisProgressCallback for TrackingCallback {
        fn on_stage_start(&self, _stage: Stage) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stage_complete(&self, _stage: Stage, _elapsed_ms: u64) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stage_error(&self, stage: Stage, kind: ErrorKind, _error: String) {
            self.errors.lock().unwrap().push((stage, kind));
        }

        fn on_retry(&self, _stage: Stage, _detail: String) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }

        fn on_analysis_complete(&self, final_stage: Stage, _total_ms: u64) {
            *self.finished.lock().unwrap() = Some(final_stage);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_stage_start(Stage::Fetching);
        cb.on_stage_complete(Stage::Fetching, 12);
        cb.on_stage_error(Stage::Fetching, ErrorKind::Fetch, "HTTP 404".into());
        cb.on_retry(Stage::Fetching, "alternate URL".into());
        cb.on_analysis_complete(Stage::Failed, 30);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_stage_start(Stage::Fetching);
        tracker.on_stage_error(Stage::Fetching, ErrorKind::Fetch, "timeout".into());
        tracker.on_retry(Stage::Fetching, "same URL".into());
        tracker.on_stage_start(Stage::Fetching);
        tracker.on_stage_complete(Stage::Fetching, 80);
        tracker.on_analysis_complete(Stage::Done, 100);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.retries.load(Ordering::SeqCst), 1);
        assert_eq!(
            *tracker.errors.lock().unwrap(),
            vec![(Stage::Fetching, ErrorKind::Fetch)]
        );
        assert_eq!(*tracker.finished.lock().unwrap(), Some(Stage::Done));
    }

    #[tokio::test]
    async fn arc_dyn_callback_moves_into_spawned_task() {
        let cb: Arc<dyn AnalysisProgressCallback> = Arc::new(NoopProgressCallback);
        tokio::spawn(async move {
            cb.on_stage_error(Stage::InvokingLlm, ErrorKind::Llm, "429".to_string());
        })
        .await
        .expect("spawn must succeed");
    }
}
