//! Telemetry hooks for generation performance measurement.
//!
//! [`InferenceTimer`] stamps prefill and per-token progress for one run and hands a
//! final [`InferenceMetrics`] to a [`TelemetryHook`]. [`NoopTelemetry`], [`LogTelemetry`]
//! and [`TracingTelemetry`] are the built-in hooks.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::info;

/// Why a generation run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Eos,
    MaxTokens,
    Cancelled,
    Error,
}

/// Aggregate metrics from a generation run.
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    pub finish_reason: FinishReason,
    /// Time to first token in milliseconds (prompt evaluation latency).
    pub ttft_ms: f64,
    /// Tokens generated per second (excludes prompt evaluation).
    pub tokens_per_sec: f64,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    /// Total wall-clock time in milliseconds.
    pub total_time_ms: f64,
}

/// Callback trait for real-time generation telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called once the prompt has been evaluated.
    fn on_prefill_complete(&self, _ttft_ms: f64) {}

    /// Called after each generated token.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when generation finishes with the full metrics summary.
    fn on_generation_complete(&self, _metrics: &InferenceMetrics) {}
}

/// Hook that ignores every event.
#[derive(Debug, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Collects the last completed run's metrics into a retrievable report.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<InferenceMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve the last completed generation's metrics.
    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.last_report.lock().clone()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        *self.last_report.lock() = Some(metrics.clone());
    }
}

/// Emits one `info` event per completed run.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_generation_complete(&self, m: &InferenceMetrics) {
        info!(
            reason = ?m.finish_reason,
            ttft_ms = m.ttft_ms,
            tokens_per_sec = m.tokens_per_sec,
            prompt_tokens = m.prompt_tokens,
            generated_tokens = m.generated_tokens,
            "generation complete"
        );
    }
}

/// Records timestamps during generation to compute [`InferenceMetrics`].
///
/// Usage:
/// 1. Call [`InferenceTimer::new`] at generation start
/// 2. Call [`InferenceTimer::mark_prefill_complete`] after the prompt is evaluated
/// 3. Call [`InferenceTimer::mark_token`] after each generated token
/// 4. Call [`InferenceTimer::finish`] to compute final metrics
pub struct InferenceTimer {
    prompt_tokens: usize,
    start: Instant,
    prefill_end: Option<Instant>,
    token_count: usize,
    hook: Box<dyn TelemetryHook>,
}

impl InferenceTimer {
    pub fn new(prompt_tokens: usize, hook: Box<dyn TelemetryHook>) -> Self {
        Self {
            prompt_tokens,
            start: Instant::now(),
            prefill_end: None,
            token_count: 0,
            hook,
        }
    }

    pub fn set_hook(&mut self, hook: Box<dyn TelemetryHook>) {
        self.hook = hook;
    }

    /// Restart the clock, e.g. when generation begins later than construction.
    pub fn restart(&mut self) {
        self.start = Instant::now();
        self.prefill_end = None;
        self.token_count = 0;
    }

    pub fn mark_prefill_complete(&mut self) {
        let now = Instant::now();
        self.prefill_end = Some(now);
        let ttft_ms = now.duration_since(self.start).as_secs_f64() * 1000.0;
        self.hook.on_prefill_complete(ttft_ms);
    }

    pub fn mark_token(&mut self) {
        self.token_count += 1;
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.hook.on_token_generated(self.token_count, elapsed_ms);
    }

    /// Finalize and return metrics. Fires `on_generation_complete`.
    pub fn finish(self, finish_reason: FinishReason) -> InferenceMetrics {
        let total_time_ms = self.start.elapsed().as_secs_f64() * 1000.0;

        let ttft_ms = self
            .prefill_end
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let decode_time_ms = total_time_ms - ttft_ms;
        let tokens_per_sec = if decode_time_ms > 0.0 && self.token_count > 0 {
            self.token_count as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = InferenceMetrics {
            finish_reason,
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            total_time_ms,
        };

        self.hook.on_generation_complete(&metrics);
        metrics
    }
}

impl std::fmt::Debug for InferenceTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceTimer")
            .field("prompt_tokens", &self.prompt_tokens)
            .field("token_count", &self.token_count)
            .finish()
    }
}
