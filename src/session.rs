//! Streaming generation sessions.
//!
//! A [`GenerationSession`] is a pull-based token stream over a [`Context`]. Each call to
//! [`GenerationSession::next_fragment`] (or [`Iterator::next`]) runs at most one decode
//! step with the context's engine locked and returns the text of one token.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──> PromptPending ──> Streaming ──┬──> EndedNatural   (EOS or max_tokens)
//!                                           ├──> EndedCancelled (cancel observed)
//!                                           └──> EndedError     (engine failure)
//! ```
//!
//! Terminal states are absorbing: every later call returns `None` without touching the
//! engine. Cancellation is cooperative. [`CancelHandle::cancel`] only sets a flag; the
//! stream notices it before the prompt is evaluated and again before each sample, so a
//! cancel lands within one decode step.
//!
//! # Shared engines
//!
//! Sessions on the same context interleave freely. The context remembers which session
//! last wrote the engine's sequence cache; a session that finds someone else's tokens
//! there (or an empty cache after `reset`) replays its prompt and generated tokens
//! before sampling.

use std::iter::FusedIterator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use llama_engine::TokenId;
use llama_runtime::{FinishReason, InferenceMetrics, InferenceTimer, NoopTelemetry, TelemetryHook};
use llama_sampling::SamplerPipeline;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::confidence::{normalized_confidence, ConfidenceTracker};
use crate::config::GenerationParams;
use crate::context::{Context, EngineSlot};
use crate::error::{Result, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    PromptPending,
    Streaming,
    EndedNatural,
    EndedCancelled,
    EndedError,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::EndedNatural | SessionState::EndedCancelled | SessionState::EndedError
        )
    }
}

/// Why a naturally ended stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Eos,
    MaxTokens,
}

/// Confidence snapshot for the most recent token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenInfo {
    /// -1.0 when not computed.
    pub last_confidence: f32,
    /// -1.0 when not computed.
    pub avg_confidence: f32,
    pub needs_handoff: bool,
    /// Number of fragments returned so far.
    pub token_index: usize,
}

/// Clonable, thread-safe cancellation trigger for one session.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

pub struct GenerationSession {
    id: Uuid,
    ctx: Weak<Context>,
    prompt: Vec<TokenId>,
    params: GenerationParams,
    /// Tokens of this session currently in the engine's sequence cache.
    cursor: usize,
    prompt_evaluated: bool,
    state: SessionState,
    stop_reason: Option<StopReason>,
    error: Option<StreamError>,
    cancelled: Arc<AtomicBool>,
    pipeline: SamplerPipeline,
    confidence: ConfidenceTracker,
    generated: Vec<TokenId>,
    token_index: usize,
    timer: Option<InferenceTimer>,
    metrics: Option<InferenceMetrics>,
}

/// What one step under the engine lock produced.
enum Step {
    Fragment(String),
    Finished(SessionState, Option<StopReason>),
    Failed(StreamError),
}

impl GenerationSession {
    pub(crate) fn new(
        ctx: Weak<Context>,
        prompt: Vec<TokenId>,
        params: GenerationParams,
        pipeline: SamplerPipeline,
    ) -> Self {
        let timer = InferenceTimer::new(prompt.len(), Box::new(NoopTelemetry));
        Self {
            id: Uuid::new_v4(),
            ctx,
            prompt,
            params,
            cursor: 0,
            prompt_evaluated: false,
            state: SessionState::Created,
            stop_reason: None,
            error: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            pipeline,
            confidence: ConfidenceTracker::new(),
            generated: Vec::new(),
            token_index: 0,
            timer: Some(timer),
            metrics: None,
        }
    }

    /// Report timing for this stream to `hook`.
    pub fn with_telemetry(mut self, hook: Box<dyn TelemetryHook>) -> Self {
        if let Some(timer) = self.timer.as_mut() {
            timer.set_hook(hook);
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionState {
        self.state
    }

    /// Set once the stream has ended naturally.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Set once the stream has ended in error.
    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt.len()
    }

    pub fn generated_tokens(&self) -> &[TokenId] {
        &self.generated
    }

    /// Timing summary, available once the stream has ended.
    pub fn metrics(&self) -> Option<&InferenceMetrics> {
        self.metrics.as_ref()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: Arc::clone(&self.cancelled),
        }
    }

    /// Request cancellation. Non-blocking; observed at the next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether another call to `next_fragment` may produce text.
    pub fn has_next(&self) -> bool {
        !self.state.is_terminal() && !self.cancelled.load(Ordering::Acquire)
    }

    pub fn token_info(&self) -> TokenInfo {
        TokenInfo {
            last_confidence: self.confidence.last(),
            avg_confidence: self.confidence.average(),
            needs_handoff: self.confidence.needs_handoff(),
            token_index: self.token_index,
        }
    }

    /// Produce the next text fragment, or `None` once the stream has ended.
    ///
    /// A fragment may be empty (a token with no printable text); that is not the end
    /// of the stream. After `None`, [`status`](Self::status) says how it ended.
    pub fn next_fragment(&mut self) -> Option<String> {
        if self.state.is_terminal() {
            return None;
        }
        if self.cancelled.load(Ordering::Acquire) {
            self.finish(SessionState::EndedCancelled, None);
            return None;
        }

        let Some(ctx) = self.ctx.upgrade() else {
            self.fail(StreamError::NotReady("context has been dropped".to_string()));
            return None;
        };

        let step = ctx
            .with_engine(|slot| self.step(slot))
            .unwrap_or_else(Step::Failed);

        match step {
            Step::Fragment(text) => Some(text),
            Step::Finished(state, reason) => {
                self.finish(state, reason);
                None
            }
            Step::Failed(err) => {
                ctx.record_error(err.clone());
                self.fail(err);
                None
            }
        }
    }

    fn step(&mut self, slot: &mut EngineSlot) -> Step {
        if !self.prompt_evaluated {
            self.state = SessionState::PromptPending;
            if let Some(timer) = self.timer.as_mut() {
                timer.restart();
            }
            if let Err(e) = self.load_sequence(slot, false) {
                return Step::Failed(e);
            }
            self.prompt_evaluated = true;
            self.state = SessionState::Streaming;
            if let Some(timer) = self.timer.as_mut() {
                timer.mark_prefill_complete();
            }
        }

        if self.cursor - self.prompt.len() >= self.params.max_tokens {
            return Step::Finished(SessionState::EndedNatural, Some(StopReason::MaxTokens));
        }

        if self.cancelled.load(Ordering::Acquire) {
            return Step::Finished(SessionState::EndedCancelled, None);
        }

        if slot.owner != Some(self.id) {
            if let Err(e) = self.load_sequence(slot, true) {
                return Step::Failed(e);
            }
        }

        let token = match self.pipeline.sample(slot.engine.logits()) {
            Ok(token) => token,
            Err(e) => return Step::Failed(e.into()),
        };

        if slot.engine.is_end_of_sequence(token) {
            return Step::Finished(SessionState::EndedNatural, Some(StopReason::Eos));
        }

        let threshold = self.params.confidence_threshold;
        if threshold > 0.0 {
            let confidence = normalized_confidence(slot.engine.logits());
            self.confidence.record(confidence, threshold);
        }

        let piece = slot.engine.token_to_text(token);
        if let Err(e) = slot.engine.decode(&[token]) {
            return Step::Failed(e.into());
        }
        self.generated.push(token);
        self.cursor += 1;
        self.token_index += 1;
        if let Some(timer) = self.timer.as_mut() {
            timer.mark_token();
        }
        trace!(session = %self.id, token, index = self.token_index, "token");

        Step::Fragment(piece)
    }

    /// Clear the engine's sequence cache and decode this session's tokens into it in
    /// batch-sized chunks: the prompt, plus everything generated so far on replay.
    fn load_sequence(&mut self, slot: &mut EngineSlot, replay: bool) -> Result<()> {
        if replay {
            debug!(
                session = %self.id,
                tokens = self.prompt.len() + self.generated.len(),
                "replaying sequence cache"
            );
        }

        slot.clear();
        slot.owner = Some(self.id);
        self.cursor = 0;

        let batch = slot.engine.max_batch_size().max(1);
        let generated: &[TokenId] = if replay { &self.generated } else { &[] };
        for chunk in self.prompt.chunks(batch).chain(generated.chunks(batch)) {
            slot.engine.decode(chunk)?;
            self.cursor += chunk.len();
        }
        Ok(())
    }

    fn finish(&mut self, state: SessionState, reason: Option<StopReason>) {
        self.state = state;
        self.stop_reason = reason;

        let finish_reason = match (state, reason) {
            (SessionState::EndedCancelled, _) => FinishReason::Cancelled,
            (SessionState::EndedError, _) => FinishReason::Error,
            (_, Some(StopReason::Eos)) => FinishReason::Eos,
            _ => FinishReason::MaxTokens,
        };
        if let Some(timer) = self.timer.take() {
            self.metrics = Some(timer.finish(finish_reason));
        }
        debug!(
            session = %self.id,
            state = ?state,
            reason = ?reason,
            tokens = self.generated.len(),
            "stream ended"
        );
    }

    fn fail(&mut self, err: StreamError) {
        self.error = Some(err);
        self.finish(SessionState::EndedError, None);
    }

    /// Cancel and release the session.
    pub fn free(self) {
        self.cancel();
        trace!(session = %self.id, "session freed");
    }
}

impl Iterator for GenerationSession {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.next_fragment()
    }
}

impl FusedIterator for GenerationSession {}

impl std::fmt::Debug for GenerationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("prompt_len", &self.prompt.len())
            .field("generated", &self.generated.len())
            .field("token_index", &self.token_index)
            .finish()
    }
}
