//! The [`Context`]: one loaded engine, its memory accounting, and the sessions that
//! take turns on it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use llama_engine::{EngineError, InferenceEngine, ModelInfo};
use llama_runtime::{InferenceMetrics, MemoryGuard, PressureCallback, SystemSampler};
use llama_sampling::SamplerPipeline;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ContextConfig, GenerationParams};
use crate::error::{Result, StreamError};
use crate::session::{GenerationSession, StopReason, TokenInfo};

/// Tokens kept free at the end of the context window.
pub const SAFETY_MARGIN: usize = 4;

/// The engine plus a record of whose tokens its sequence cache holds.
pub(crate) struct EngineSlot {
    pub(crate) engine: Box<dyn InferenceEngine>,
    pub(crate) owner: Option<Uuid>,
}

impl EngineSlot {
    pub(crate) fn clear(&mut self) {
        self.engine.clear_sequence_cache();
        self.owner = None;
    }
}

/// Snapshot returned by [`Context::memory_usage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub current_bytes: usize,
    /// Highest reading this context has observed.
    pub peak_bytes: usize,
    pub limit_bytes: usize,
    pub model_bytes: usize,
    pub context_bytes: usize,
}

/// Result of [`Context::generate`].
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub tokens_generated: usize,
    pub stop_reason: Option<StopReason>,
    pub token_info: TokenInfo,
    pub metrics: Option<InferenceMetrics>,
}

/// Result of [`Context::embed`].
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// L2-normalized; all zeros if the engine returned a zero vector.
    pub values: Vec<f32>,
    pub dimensions: usize,
    /// Tokens embedded, BOS included.
    pub token_count: usize,
}

/// Owns one engine behind a single mutex. Every engine operation, from any session,
/// goes through that mutex, so sessions sharing a context run one step at a time.
pub struct Context {
    slot: Mutex<Option<EngineSlot>>,
    guard: Arc<MemoryGuard>,
    /// Limit this context last handed to the guard, 0 if none.
    applied_limit: AtomicUsize,
    memory_limit: AtomicUsize,
    auto_unload: bool,
    peak_memory: AtomicUsize,
    last_error: Mutex<String>,
}

impl Context {
    pub fn new(
        engine: Box<dyn InferenceEngine>,
        config: ContextConfig,
        guard: Arc<MemoryGuard>,
    ) -> Arc<Self> {
        let ctx = Arc::new(Self {
            slot: Mutex::new(Some(EngineSlot {
                engine,
                owner: None,
            })),
            guard,
            applied_limit: AtomicUsize::new(0),
            memory_limit: AtomicUsize::new(0),
            auto_unload: config.auto_unload_on_memory_pressure,
            peak_memory: AtomicUsize::new(0),
            last_error: Mutex::new(String::new()),
        });
        if config.memory_limit_bytes > 0 {
            ctx.apply_limit(config.memory_limit_bytes);
        }
        info!(
            limit = config.memory_limit_bytes,
            auto_unload = ctx.auto_unload,
            "context created"
        );
        ctx
    }

    /// A context with its own guard over the host OS sampler.
    pub fn with_system_guard(engine: Box<dyn InferenceEngine>, config: ContextConfig) -> Arc<Self> {
        let guard = Arc::new(MemoryGuard::with_config(SystemSampler, config.guard.clone()));
        guard.init();
        Self::new(engine, config, guard)
    }

    pub fn guard(&self) -> &Arc<MemoryGuard> {
        &self.guard
    }

    fn apply_limit(&self, bytes: usize) {
        self.memory_limit.store(bytes, Ordering::Release);
        self.applied_limit.store(bytes, Ordering::Release);
        self.guard.set_limit(bytes);
    }

    pub fn set_memory_limit(&self, bytes: usize) -> Result<()> {
        self.ensure_valid().map_err(|e| self.record_error(e))?;
        self.apply_limit(bytes);
        Ok(())
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit.load(Ordering::Acquire)
    }

    pub fn memory_usage(&self) -> Result<MemoryStats> {
        let (model_bytes, context_bytes) = self
            .with_engine(|slot| (slot.engine.model_bytes(), slot.engine.context_bytes()))
            .map_err(|e| self.record_error(e))?;
        let current = self.guard.current_usage();
        let peak = self.peak_memory.fetch_max(current, Ordering::AcqRel).max(current);
        Ok(MemoryStats {
            current_bytes: current,
            peak_bytes: peak,
            limit_bytes: self.memory_limit(),
            model_bytes,
            context_bytes,
        })
    }

    /// Install or clear (`None`) the guard's pressure callback.
    pub fn set_memory_pressure_callback(&self, callback: Option<PressureCallback>) -> Result<()> {
        self.ensure_valid().map_err(|e| self.record_error(e))?;
        self.guard.set_callback(callback);
        Ok(())
    }

    /// Drop the sequence cache and take a fresh memory reading.
    pub fn memory_cleanup(&self) -> Result<()> {
        self.with_engine(EngineSlot::clear)
            .map_err(|e| self.record_error(e))?;
        let current = self.guard.cleanup();
        info!(current, "memory cleanup");
        Ok(())
    }

    /// Tokenize `prompt` and prepare a session. No engine work beyond tokenization
    /// happens until the session's first `next`.
    pub fn start_stream(
        self: &Arc<Self>,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<GenerationSession> {
        self.prepare(prompt, params).map_err(|e| self.record_error(e))
    }

    fn prepare(self: &Arc<Self>, prompt: &str, params: GenerationParams) -> Result<GenerationSession> {
        params.validate()?;

        let (tokens, pipeline) = self.with_engine(|slot| -> Result<_> {
            if self.auto_unload && self.guard.take_cleanup_request() {
                info!("clearing sequence cache on memory pressure");
                slot.clear();
            }

            let tokens = slot.engine.tokenize(prompt, true)?;
            if tokens.is_empty() {
                return Err(EngineError::Tokenization("prompt produced no tokens".to_string()).into());
            }

            let usable = slot.engine.max_context_size().saturating_sub(SAFETY_MARGIN);
            if tokens.len() > usable {
                return Err(StreamError::TooLong {
                    tokens: tokens.len(),
                    usable,
                });
            }

            let grammar = params
                .grammar
                .as_ref()
                .map(|g| slot.engine.compile_grammar(&g.source, &g.root))
                .transpose()?;
            let pipeline = SamplerPipeline::build(&params.sampling, grammar)?;
            Ok((tokens, pipeline))
        })??;

        let session = GenerationSession::new(Arc::downgrade(self), tokens, params, pipeline);
        debug!(session = %session.id(), prompt_tokens = session.prompt_len(), "stream started");
        Ok(session)
    }

    /// Run a stream to completion and collect its text.
    pub fn generate(self: &Arc<Self>, prompt: &str, params: GenerationParams) -> Result<Completion> {
        let mut session = self.start_stream(prompt, params)?;
        let mut text = String::new();
        while let Some(fragment) = session.next_fragment() {
            if let Err(e) = text.try_reserve(fragment.len()) {
                session.cancel();
                return Err(self.record_error(StreamError::OutOfMemory(e.to_string())));
            }
            text.push_str(&fragment);
        }

        if let Some(err) = session.error() {
            return Err(err.clone());
        }
        Ok(Completion {
            text,
            tokens_generated: session.generated_tokens().len(),
            stop_reason: session.stop_reason(),
            token_info: session.token_info(),
            metrics: session.metrics().cloned(),
        })
    }

    /// Embed `text` as one normalized vector. Streams on this context are unaffected.
    pub fn embed(&self, text: &str) -> Result<Embedding> {
        self.with_engine(|slot| embed_text(slot, text))
            .and_then(|embedding| embedding)
            .map_err(|e| self.record_error(e))
    }

    /// Clear the sequence cache.
    pub fn reset(&self) -> Result<()> {
        self.with_engine(EngineSlot::clear)
            .map_err(|e| self.record_error(e))
    }

    pub fn model_info(&self) -> Result<ModelInfo> {
        self.with_engine(|slot| slot.engine.model_info())
            .map_err(|e| self.record_error(e))
    }

    /// Message of the most recent failure on this context or its sessions.
    pub fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Release the engine. Later operations fail with `NotReady`. Idempotent.
    ///
    /// The guard limit is cleared only if it is still the one this context set.
    pub fn free(&self) {
        let slot = self.slot.lock().take();
        if slot.is_none() {
            return;
        }
        drop(slot);
        // Leave the guard alone if another context has set its own limit since.
        let applied = self.applied_limit.swap(0, Ordering::AcqRel);
        if applied > 0 {
            self.guard.release_limit(applied);
        }
        info!("context freed");
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(not_ready())
        }
    }

    /// Run `f` with the engine locked. Fails with `NotReady` once freed.
    pub(crate) fn with_engine<R>(&self, f: impl FnOnce(&mut EngineSlot) -> R) -> Result<R> {
        self.slot.lock().as_mut().map(f).ok_or_else(not_ready)
    }

    /// Store `err` as the last error and hand it back.
    pub(crate) fn record_error(&self, err: StreamError) -> StreamError {
        warn!(error = %err, "context error");
        *self.last_error.lock() = err.to_string();
        err
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.free();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("valid", &self.is_valid())
            .field("memory_limit", &self.memory_limit())
            .field("auto_unload", &self.auto_unload)
            .finish()
    }
}

fn embed_text(slot: &mut EngineSlot, text: &str) -> Result<Embedding> {
    let tokens = slot.engine.tokenize(text, true)?;
    if tokens.is_empty() {
        return Err(EngineError::Tokenization("text produced no tokens".to_string()).into());
    }

    let mut values = slot.engine.embeddings(&tokens)?;
    l2_normalize(&mut values);
    debug!(tokens = tokens.len(), dimensions = values.len(), "embedded text");
    Ok(Embedding {
        dimensions: values.len(),
        token_count: tokens.len(),
        values,
    })
}

fn l2_normalize(values: &mut [f32]) {
    let sum_sq: f64 = values.iter().map(|&v| v as f64 * v as f64).sum();
    let scale = if sum_sq > 0.0 { 1.0 / sum_sq.sqrt() } else { 0.0 };
    for v in values.iter_mut() {
        *v = (*v as f64 * scale) as f32;
    }
}

fn not_ready() -> StreamError {
    StreamError::NotReady("context has been freed".to_string())
}
