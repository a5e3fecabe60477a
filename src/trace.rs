//! Uniform step instrumentation.
//!
//! Every pipeline step runs through [`StepTracer::run`]. The wrapper opens a
//! `step` span (stage, attempt and project as fields), times the step, emits
//! start and finish events, appends a [`StepRecord`] and forwards progress
//! events. Step functions contain no logging of their own beyond `debug!`
//! detail.
//!
//! With tracing enabled the start/finish events are emitted at INFO, otherwise
//! at DEBUG so a default CLI run stays quiet. Failures are always WARN.

use crate::config::AnalyzerConfig;
use crate::error::AnalysisError;
use crate::output::StepRecord;
use crate::pipeline::Stage;
use crate::progress::ProgressCallback;
use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

macro_rules! step_event {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            info!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    };
}

/// Records and reports the steps of one run.
pub struct StepTracer {
    enabled: bool,
    project: String,
    progress: Option<ProgressCallback>,
    steps: Mutex<Vec<StepRecord>>,
    started: Instant,
}

impl StepTracer {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            enabled: config.tracing_enabled,
            project: config.tracing_project.clone().unwrap_or_default(),
            progress: config.progress_callback.clone(),
            steps: Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    /// Run one attempt of `stage`.
    pub async fn run<T, F>(&self, stage: Stage, attempt: u32, step: F) -> Result<T, AnalysisError>
    where
        F: Future<Output = Result<T, AnalysisError>>,
    {
        let span = info_span!(
            "step",
            stage = stage.as_str(),
            attempt,
            project = self.project.as_str()
        );

        if let Some(cb) = &self.progress {
            cb.on_stage_start(stage);
        }

        let start = Instant::now();
        let result = async {
            step_event!(self.enabled, "step started");
            step.await
        }
        .instrument(span.clone())
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let _entered = span.enter();
        let record = match &result {
            Ok(_) => {
                step_event!(self.enabled, duration_ms, "step finished");
                if let Some(cb) = &self.progress {
                    cb.on_stage_complete(stage, duration_ms);
                }
                StepRecord {
                    stage,
                    attempt,
                    duration_ms,
                    ok: true,
                    error_kind: None,
                    error: None,
                }
            }
            Err(e) => {
                warn!(duration_ms, kind = %e.kind(), "step failed: {}", e);
                if let Some(cb) = &self.progress {
                    cb.on_stage_error(stage, e.kind(), e.to_string());
                }
                StepRecord {
                    stage,
                    attempt,
                    duration_ms,
                    ok: false,
                    error_kind: Some(e.kind()),
                    error: Some(e.to_string()),
                }
            }
        };
        self.push(record);
        result
    }

    /// Announce the one retry granted to a failed stage.
    pub fn retry(&self, stage: Stage, detail: impl Into<String>) {
        let detail = detail.into();
        warn!("Retrying {} via {}", stage, detail);
        if let Some(cb) = &self.progress {
            cb.on_retry(stage, detail);
        }
    }

    /// Close the run and hand back the step log and total duration.
    pub fn finish(&self, final_stage: Stage) -> (Vec<StepRecord>, u64) {
        let total_ms = self.elapsed_ms();
        step_event!(self.enabled, stage = final_stage.as_str(), total_ms, "analysis finished");
        if let Some(cb) = &self.progress {
            cb.on_analysis_complete(final_stage, total_ms);
        }
        let steps = match self.steps.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        (steps, total_ms)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn push(&self, record: StepRecord) {
        match self.steps.lock() {
            Ok(mut guard) => guard.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
