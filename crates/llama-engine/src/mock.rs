//! Scriptable in-memory engine.
//!
//! [`MockEngine`] implements [`InferenceEngine`] without a model: logits follow a
//! configurable [`LogitsPattern`], tokenization hashes whitespace-separated words, and
//! every decode call is recorded in a shared [`MockLog`] so tests can observe the
//! engine after handing it to a runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{EngineError, InferenceEngine, ModelInfo, Result, TokenConstraint, TokenId};

pub const EOS_TOKEN: TokenId = 0;
pub const BOS_TOKEN: TokenId = 1;

/// First token ID available to ordinary words.
const FIRST_WORD_TOKEN: TokenId = 2;

/// Logit of the dominant token in spiked patterns. Large enough that every
/// other token's probability underflows to ~0.
const SPIKE_LOGIT: f32 = 100.0;

/// Shape of the logits the mock reports after each decode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogitsPattern {
    /// Every token equally likely.
    Uniform,
    /// One token dominates.
    Spike(TokenId),
    /// The dominant token advances with the sequence position.
    Cycle,
}

/// Shared record of what the engine was asked to do.
#[derive(Debug, Default)]
pub struct MockLog {
    decode_calls: AtomicUsize,
    clears: AtomicUsize,
    batches: Mutex<Vec<usize>>,
    sequence: Mutex<Vec<TokenId>>,
}

impl MockLog {
    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::Acquire)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::Acquire)
    }

    /// Size of every successful decode batch, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    /// Tokens currently held in the sequence cache.
    pub fn sequence(&self) -> Vec<TokenId> {
        self.sequence.lock().clone()
    }
}

pub struct MockEngine {
    vocab_size: usize,
    max_context: usize,
    max_batch: usize,
    pattern: LogitsPattern,
    eos: Option<TokenId>,
    eos_at_position: Option<usize>,
    fail_decode_on_call: Option<usize>,
    fail_tokenize: bool,
    silent: Vec<TokenId>,
    decode_delay: Option<Duration>,
    embedding_dims: usize,
    zero_embeddings: bool,
    position: usize,
    logits: Vec<f32>,
    log: Arc<MockLog>,
}

impl MockEngine {
    /// A mock with a 32-token vocabulary, 64-token context and batch size 8.
    pub fn new() -> Self {
        Self::with_dims(32, 64, 8)
    }

    pub fn with_dims(vocab_size: usize, max_context: usize, max_batch: usize) -> Self {
        let vocab_size = vocab_size.max(FIRST_WORD_TOKEN as usize + 1);
        Self {
            vocab_size,
            max_context,
            max_batch: max_batch.max(1),
            pattern: LogitsPattern::Cycle,
            eos: None,
            eos_at_position: None,
            fail_decode_on_call: None,
            fail_tokenize: false,
            silent: Vec::new(),
            decode_delay: None,
            embedding_dims: 16,
            zero_embeddings: false,
            position: 0,
            logits: vec![0.0; vocab_size],
            log: Arc::new(MockLog::default()),
        }
    }

    pub fn with_pattern(mut self, pattern: LogitsPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Recognise `EOS_TOKEN` as end-of-sequence. Without this the mock never ends.
    pub fn with_eos(mut self) -> Self {
        self.eos = Some(EOS_TOKEN);
        self
    }

    /// Spike the EOS token once the sequence cache reaches `position` tokens.
    pub fn with_eos_at_position(mut self, position: usize) -> Self {
        self.eos = Some(EOS_TOKEN);
        self.eos_at_position = Some(position);
        self
    }

    /// Fail the `n`th decode call (1-based, counted over the engine's lifetime).
    pub fn with_decode_failure_on_call(mut self, n: usize) -> Self {
        self.fail_decode_on_call = Some(n);
        self
    }

    pub fn with_tokenize_failure(mut self) -> Self {
        self.fail_tokenize = true;
        self
    }

    /// Tokens that render as the empty string.
    pub fn with_silent_tokens(mut self, tokens: &[TokenId]) -> Self {
        self.silent = tokens.to_vec();
        self
    }

    /// Sleep inside every decode call, to widen race windows in tests.
    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    /// Width of the vectors `embeddings` returns. Defaults to 16.
    pub fn with_embedding_dims(mut self, dims: usize) -> Self {
        self.embedding_dims = dims;
        self
    }

    /// Make every embedding the zero vector.
    pub fn with_zero_embeddings(mut self) -> Self {
        self.zero_embeddings = true;
        self
    }

    /// Handle to the decode log; stays valid after the engine is moved.
    pub fn log(&self) -> Arc<MockLog> {
        Arc::clone(&self.log)
    }

    /// Token ID the mock assigns to a single word.
    pub fn word_token(&self, word: &str) -> TokenId {
        let span = (self.vocab_size as u64).saturating_sub(FIRST_WORD_TOKEN as u64).max(1);
        let hash = word
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        FIRST_WORD_TOKEN + (hash % span) as TokenId
    }

    /// Fixed per-token vector with components in [-6, 6].
    fn token_vector(&self, token: TokenId) -> impl Iterator<Item = f32> {
        let token = token as i64;
        (0..self.embedding_dims as i64)
            .map(move |j| ((token * 31 + j * 7).rem_euclid(13) - 6) as f32)
    }

    fn refresh_logits(&mut self) {
        let dominant = match (self.eos, self.eos_at_position) {
            (Some(eos), Some(at)) if self.position >= at => Some(eos),
            _ => match self.pattern {
                LogitsPattern::Uniform => None,
                LogitsPattern::Spike(token) => Some(token),
                LogitsPattern::Cycle => {
                    let span = self.vocab_size - FIRST_WORD_TOKEN as usize;
                    Some(FIRST_WORD_TOKEN + (self.position % span) as TokenId)
                }
            },
        };

        self.logits.iter_mut().for_each(|l| *l = 0.0);
        if let Some(token) = dominant {
            if let Some(slot) = self.logits.get_mut(token as usize) {
                *slot = SPIKE_LOGIT;
            }
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for MockEngine {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        if self.fail_tokenize {
            return Err(EngineError::Tokenization("tokenizer unavailable".to_string()));
        }
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(BOS_TOKEN);
        }
        tokens.extend(text.split_whitespace().map(|w| self.word_token(w)));
        Ok(tokens)
    }

    fn decode(&mut self, tokens: &[TokenId]) -> Result<()> {
        let call = self.log.decode_calls.fetch_add(1, Ordering::AcqRel) + 1;

        if let Some(delay) = self.decode_delay {
            std::thread::sleep(delay);
        }
        if self.fail_decode_on_call == Some(call) {
            return Err(EngineError::Decode(format!("injected failure on call {call}")));
        }
        if tokens.len() > self.max_batch {
            return Err(EngineError::Decode(format!(
                "batch of {} exceeds max batch size {}",
                tokens.len(),
                self.max_batch
            )));
        }
        if self.position + tokens.len() > self.max_context {
            return Err(EngineError::Decode("context window full".to_string()));
        }

        self.position += tokens.len();
        self.log.batches.lock().push(tokens.len());
        self.log.sequence.lock().extend_from_slice(tokens);
        self.refresh_logits();
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        self.eos == Some(token)
    }

    fn token_to_text(&self, token: TokenId) -> String {
        if token == BOS_TOKEN || token == EOS_TOKEN || self.silent.contains(&token) {
            return String::new();
        }
        format!(" t{token}")
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    fn max_context_size(&self) -> usize {
        self.max_context
    }

    fn clear_sequence_cache(&mut self) {
        self.position = 0;
        self.log.clears.fetch_add(1, Ordering::AcqRel);
        self.log.sequence.lock().clear();
        self.refresh_logits();
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "mock".to_string(),
            architecture: "mock".to_string(),
            parameters: (self.vocab_size * 16) as u64,
            context_length: self.max_context,
            vocab_size: self.vocab_size,
            num_layers: 1,
        }
    }

    fn model_bytes(&self) -> usize {
        self.vocab_size * 16 * std::mem::size_of::<f32>()
    }

    fn context_bytes(&self) -> usize {
        self.position * 64
    }

    /// Mean of fixed per-token vectors.
    fn embeddings(&mut self, tokens: &[TokenId]) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(EngineError::Inference("no tokens to embed".to_string()));
        }
        if tokens.len() > self.max_context {
            return Err(EngineError::Decode("embedding input exceeds context".to_string()));
        }

        let mut pooled = vec![0.0f32; self.embedding_dims];
        if self.zero_embeddings {
            return Ok(pooled);
        }
        for &token in tokens {
            for (slot, value) in pooled.iter_mut().zip(self.token_vector(token)) {
                *slot += value;
            }
        }
        let n = tokens.len() as f32;
        pooled.iter_mut().for_each(|v| *v /= n);
        Ok(pooled)
    }

    /// Grammar source is a whitespace-separated list of permitted token IDs.
    fn compile_grammar(&self, source: &str, _root: &str) -> Result<Box<dyn TokenConstraint>> {
        let allowed = source
            .split_whitespace()
            .map(|s| {
                s.parse::<TokenId>()
                    .map_err(|_| EngineError::Grammar(format!("not a token id: {s}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if allowed.is_empty() {
            return Err(EngineError::Grammar("empty allow-list".to_string()));
        }
        Ok(Box::new(AllowList { allowed, accepted: 0 }))
    }
}

/// Constraint that permits a fixed token set.
#[derive(Debug)]
struct AllowList {
    allowed: Vec<TokenId>,
    accepted: usize,
}

impl TokenConstraint for AllowList {
    fn allows(&self, token: TokenId) -> bool {
        self.allowed.contains(&token)
    }

    fn accept(&mut self, _token: TokenId) {
        self.accepted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_prefixes_bos() {
        let engine = MockEngine::new();
        let tokens = engine.tokenize("hello world", true).unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0], BOS_TOKEN);
        assert!(tokens[1..].iter().all(|&t| t >= FIRST_WORD_TOKEN));
    }

    #[test]
    fn decode_rejects_oversized_batch() {
        let mut engine = MockEngine::with_dims(16, 64, 2);
        let err = engine.decode(&[2, 3, 4]).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[test]
    fn cycle_pattern_follows_position() {
        let mut engine = MockEngine::with_dims(8, 64, 4);
        engine.decode(&[2]).unwrap();
        let first = argmax(engine.logits());
        engine.decode(&[3]).unwrap();
        let second = argmax(engine.logits());
        assert_ne!(first, second);
    }

    #[test]
    fn eos_spikes_at_position() {
        let mut engine = MockEngine::new().with_eos_at_position(2);
        engine.decode(&[2]).unwrap();
        assert_ne!(argmax(engine.logits()), EOS_TOKEN as usize);
        engine.decode(&[3]).unwrap();
        assert_eq!(argmax(engine.logits()), EOS_TOKEN as usize);
    }

    #[test]
    fn clear_resets_sequence() {
        let mut engine = MockEngine::new();
        let log = engine.log();
        engine.decode(&[2, 3]).unwrap();
        engine.clear_sequence_cache();
        assert!(log.sequence().is_empty());
        assert_eq!(log.clears(), 1);
        assert_eq!(engine.context_bytes(), 0);
    }

    #[test]
    fn allow_list_grammar() {
        let engine = MockEngine::new();
        let constraint = engine.compile_grammar("4 5", "root").unwrap();
        assert!(constraint.allows(4));
        assert!(!constraint.allows(6));
        assert!(engine.compile_grammar("four", "root").is_err());
    }

    #[test]
    fn embeddings_are_mean_pooled() {
        let mut engine = MockEngine::new().with_embedding_dims(4);
        let single = engine.embeddings(&[5]).unwrap();
        assert_eq!(single.len(), 4);

        let doubled = engine.embeddings(&[5, 5]).unwrap();
        assert_eq!(single, doubled);
        assert!(engine.embeddings(&[]).is_err());
        assert_eq!(engine.log().decode_calls(), 0);
    }

    fn argmax(values: &[f32]) -> usize {
        values
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0
    }
}
