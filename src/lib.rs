//! On-device streaming generation with memory supervision.
//!
//! A [`Context`] wraps an already-loaded [`InferenceEngine`] and a shared
//! [`MemoryGuard`]. [`Context::start_stream`] returns a [`GenerationSession`], a
//! pull-based, cancellable token stream that also reports per-token confidence so
//! callers can hand a low-confidence generation off to a larger model.
//!
//! ```no_run
//! use llama_edge::{Context, ContextConfig, GenerationParams};
//! use llama_edge::engine::mock::MockEngine;
//!
//! let ctx = Context::with_system_guard(Box::new(MockEngine::new()), ContextConfig::default());
//! let mut stream = ctx.start_stream("hello there", GenerationParams::default())?;
//! for fragment in &mut stream {
//!     print!("{fragment}");
//! }
//! println!("\nended: {:?}", stream.status());
//! # Ok::<(), llama_edge::StreamError>(())
//! ```

pub mod confidence;
pub mod config;
pub mod context;
pub mod error;
pub mod session;

pub use llama_engine as engine;
pub use llama_engine::{EngineError, InferenceEngine, ModelInfo, TokenConstraint, TokenId};
pub use llama_runtime::{
    DeviceClass, InferenceMetrics, MemoryGuard, MemoryGuardConfig, MemorySampler, PressureCallback,
    PressureEvent, SystemSampler, TelemetryHook,
};
pub use llama_sampling::{SamplingParams, StageKind};

pub use config::{ContextConfig, GenerationParams, GrammarSpec};
pub use context::{Completion, Context, Embedding, MemoryStats};
pub use error::{ConfigError, Result, StreamError};
pub use session::{CancelHandle, GenerationSession, SessionState, StopReason, TokenInfo};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
