//! # llama-engine
//!
//! The "narrow waist" of the llama-edge stack. Defines the [`InferenceEngine`] contract
//! that the streaming runtime drives, plus the small set of types every other crate
//! shares. The tokenizer, the forward pass and the sequence cache all live behind this
//! trait; the runtime never looks inside.
//!
//! ## Design Notes
//!
//! ### Exclusive access
//! Mutating operations (`decode`, `clear_sequence_cache`) take `&mut self`. An engine
//! instance holds one sequence cache, so callers serialize access themselves; the
//! runtime's `Context` does this with a single mutex around the engine.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are logically
//! non-negative.

pub mod mock;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Errors reported by an engine backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Grammar rejected: {0}")]
    Grammar(String),
    #[error("Not supported by this engine: {0}")]
    Unsupported(String),
}

/// Static description of the loaded model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub architecture: String,
    pub parameters: u64,
    pub context_length: usize,
    pub vocab_size: usize,
    pub num_layers: usize,
}

/// A stateful token filter produced by the engine from grammar source.
///
/// The sampler asks `allows` for every surviving candidate and reports the
/// chosen token through `accept` so the constraint can advance its parse state.
pub trait TokenConstraint: Send {
    fn allows(&self, token: TokenId) -> bool;

    fn accept(&mut self, token: TokenId);
}

/// The engine contract consumed by the streaming runtime.
pub trait InferenceEngine: Send {
    /// Convert text into token IDs, optionally prefixed with the BOS token.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>>;

    /// Run a batch of tokens through the model, appending them to the sequence cache.
    fn decode(&mut self, tokens: &[TokenId]) -> Result<()>;

    /// Logits for the last decoded position, `vocab_size()` entries.
    fn logits(&self) -> &[f32];

    fn vocab_size(&self) -> usize;

    fn is_end_of_sequence(&self, token: TokenId) -> bool;

    /// Render one token as UTF-8. Special/control tokens may render as `""`.
    fn token_to_text(&self, token: TokenId) -> String;

    /// Maximum number of tokens accepted by a single `decode` call.
    fn max_batch_size(&self) -> usize;

    /// Total sequence capacity of the context window.
    fn max_context_size(&self) -> usize;

    /// Drop all cached sequence state; the next `decode` starts at position 0.
    fn clear_sequence_cache(&mut self);

    fn model_info(&self) -> ModelInfo;

    /// Approximate resident size of the model weights in bytes.
    fn model_bytes(&self) -> usize {
        0
    }

    /// Approximate size of the sequence cache and scratch state in bytes.
    fn context_bytes(&self) -> usize {
        0
    }

    /// Pooled embedding of `tokens`, one float per embedding dimension, not normalized.
    ///
    /// Runs outside the generation sequence: the sequence cache is left untouched.
    fn embeddings(&mut self, tokens: &[TokenId]) -> Result<Vec<f32>> {
        let _ = tokens;
        Err(EngineError::Unsupported("embeddings".to_string()))
    }

    /// Compile grammar source into a token constraint starting at rule `root`.
    fn compile_grammar(&self, source: &str, root: &str) -> Result<Box<dyn TokenConstraint>> {
        let _ = (source, root);
        Err(EngineError::Unsupported("grammar-constrained sampling".to_string()))
    }
}
