//! # llama-runtime
//!
//! Runtime services around an inference engine: the [`MemoryGuard`] watchdog with its
//! pluggable [`MemorySampler`], and telemetry hooks (TTFT, tok/s) for generation runs.

pub mod memory;
pub mod sampler;
pub mod telemetry;

pub use memory::{
    recommended_limit_for, MemoryGuard, MemoryGuardConfig, PressureCallback, PressureEvent,
};
pub use sampler::{DeviceClass, MemorySampler, SystemSampler};
pub use telemetry::{
    FinishReason, InferenceMetrics, InferenceTimer, LogTelemetry, NoopTelemetry, TelemetryHook,
    TracingTelemetry,
};
