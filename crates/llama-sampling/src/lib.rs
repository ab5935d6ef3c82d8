//! # llama-sampling
//!
//! Token selection for llama-edge, expressed as an ordered pipeline of stages.
//!
//! A [`SamplerPipeline`] is built once per generation from [`SamplingParams`] and an
//! optional grammar constraint. Each call to [`SamplerPipeline::sample`] copies the
//! engine's logits into a scratch buffer, runs every stage over it in order, and draws
//! the final token from the surviving distribution.
//!
//! Stage order is fixed:
//!
//! | Stage         | Present when            | Effect                                      |
//! |---------------|-------------------------|---------------------------------------------|
//! | `Penalties`   | always                  | repeat / frequency / presence over history  |
//! | `TopK`        | `top_k > 0`             | keep exactly the k best candidates          |
//! | `TopP`        | `top_p < 1.0`           | keep the smallest nucleus reaching `top_p`  |
//! | `Temperature` | `temperature > 0.0`     | divide surviving logits                     |
//! | `Grammar`     | a constraint is given   | mask tokens the constraint rejects          |
//! | `FinalSample` | always                  | draw from the softmax with the seeded RNG   |
//!
//! Filtering stages mask candidates to `-inf` rather than shrinking the buffer, so
//! token IDs always equal buffer indices.

use std::collections::VecDeque;
use std::fmt;
use std::hash::{BuildHasher, Hasher};

use serde::Deserialize;

pub use llama_engine::{TokenConstraint, TokenId};

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,
    #[error("Invalid sampling parameter: {0}")]
    InvalidParameter(String),
    #[error("No valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Seed from the process's per-instance hash keys.
    pub fn from_entropy() -> Self {
        let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
        hasher.write_u64(0x9e37_79b9_7f4a_7c15);
        Self::new(hasher.finish())
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// User-facing sampling knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplingParams {
    /// Softmax temperature. 0.0 omits the temperature stage entirely.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Keep the K most likely tokens. 0 = disabled.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Nucleus mass. 1.0 = disabled.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Multiplicative penalty on recently generated tokens (1.0 = none).
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// Subtracted once per recent occurrence.
    #[serde(default)]
    pub frequency_penalty: f32,

    /// Subtracted once if the token occurred recently at all.
    #[serde(default)]
    pub presence_penalty: f32,

    /// How many recent tokens the penalties look at. 0 disables them.
    #[serde(default = "default_penalty_last_n")]
    pub penalty_last_n: usize,

    /// Fixed RNG seed; `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_temperature() -> f32 {
    0.8
}
fn default_top_k() -> usize {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_penalty_last_n() -> usize {
    64
}

impl Default for SamplingParams {
    fn default() -> Self {
        SamplingParams {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            penalty_last_n: default_penalty_last_n(),
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Always pick the most likely token.
    pub fn greedy() -> Self {
        SamplingParams {
            temperature: 0.0,
            top_k: 1,
            top_p: 1.0,
            repeat_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            penalty_last_n: 0,
            seed: Some(0),
        }
    }

    pub fn validate(&self) -> SamplingResult<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SamplingError::InvalidParameter(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(SamplingError::InvalidParameter(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err(SamplingError::InvalidParameter(format!(
                "repeat_penalty must be > 0, got {}",
                self.repeat_penalty
            )));
        }
        if !self.frequency_penalty.is_finite() || !self.presence_penalty.is_finite() {
            return Err(SamplingError::InvalidParameter(
                "frequency and presence penalties must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenaltyConfig {
    pub last_n: usize,
    pub repeat: f32,
    pub frequency: f32,
    pub presence: f32,
}

impl PenaltyConfig {
    fn is_noop(&self) -> bool {
        self.last_n == 0
            || (self.repeat == 1.0 && self.frequency == 0.0 && self.presence == 0.0)
    }
}

/// One step of the pipeline.
pub enum Stage {
    Penalties(PenaltyConfig),
    TopK(usize),
    TopP(f32),
    Temperature(f32),
    Grammar(Box<dyn TokenConstraint>),
    FinalSample,
}

/// Data-free tag of a [`Stage`], for inspecting pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Penalties,
    TopK,
    TopP,
    Temperature,
    Grammar,
    FinalSample,
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Penalties(_) => StageKind::Penalties,
            Stage::TopK(_) => StageKind::TopK,
            Stage::TopP(_) => StageKind::TopP,
            Stage::Temperature(_) => StageKind::Temperature,
            Stage::Grammar(_) => StageKind::Grammar,
            Stage::FinalSample => StageKind::FinalSample,
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Penalties(cfg) => f.debug_tuple("Penalties").field(cfg).finish(),
            Stage::TopK(k) => f.debug_tuple("TopK").field(k).finish(),
            Stage::TopP(p) => f.debug_tuple("TopP").field(p).finish(),
            Stage::Temperature(t) => f.debug_tuple("Temperature").field(t).finish(),
            Stage::Grammar(_) => f.write_str("Grammar(..)"),
            Stage::FinalSample => f.write_str("FinalSample"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Ordered sampler stages plus the state they share across calls.
pub struct SamplerPipeline {
    stages: Vec<Stage>,
    history: VecDeque<TokenId>,
    history_cap: usize,
    rng: SeededRng,
    scratch: Vec<f32>,
}

impl SamplerPipeline {
    pub fn build(
        params: &SamplingParams,
        grammar: Option<Box<dyn TokenConstraint>>,
    ) -> SamplingResult<Self> {
        params.validate()?;

        let mut stages = vec![Stage::Penalties(PenaltyConfig {
            last_n: params.penalty_last_n,
            repeat: params.repeat_penalty,
            frequency: params.frequency_penalty,
            presence: params.presence_penalty,
        })];
        if params.top_k > 0 {
            stages.push(Stage::TopK(params.top_k));
        }
        if params.top_p < 1.0 {
            stages.push(Stage::TopP(params.top_p));
        }
        if params.temperature > 0.0 {
            stages.push(Stage::Temperature(params.temperature));
        }
        if let Some(constraint) = grammar {
            stages.push(Stage::Grammar(constraint));
        }
        stages.push(Stage::FinalSample);

        let rng = match params.seed {
            Some(seed) => SeededRng::new(seed),
            None => SeededRng::from_entropy(),
        };

        Ok(Self {
            stages,
            history: VecDeque::with_capacity(params.penalty_last_n),
            history_cap: params.penalty_last_n,
            rng,
            scratch: Vec::new(),
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(Stage::kind).collect()
    }

    /// Recent accepted tokens, oldest first.
    pub fn history(&self) -> Vec<TokenId> {
        self.history.iter().copied().collect()
    }

    /// Select the next token and accept it into the pipeline state.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<TokenId> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }

        self.scratch.clear();
        self.scratch
            .extend(logits.iter().map(|&l| if l.is_nan() { f32::NEG_INFINITY } else { l }));

        let mut chosen = None;
        for stage in &self.stages {
            match stage {
                Stage::Penalties(cfg) => apply_penalties(&mut self.scratch, &self.history, cfg),
                Stage::TopK(k) => apply_top_k(&mut self.scratch, *k),
                Stage::TopP(p) => apply_top_p(&mut self.scratch, *p),
                Stage::Temperature(t) => apply_temperature(&mut self.scratch, *t),
                Stage::Grammar(constraint) => {
                    apply_grammar(&mut self.scratch, constraint.as_ref())?
                }
                Stage::FinalSample => {
                    chosen = Some(sample_from_logits(&self.scratch, &mut self.rng)?);
                    break;
                }
            }
        }

        let token = chosen.ok_or(SamplingError::NoValidTokens)?;
        self.accept(token);
        Ok(token)
    }

    /// Record a token as generated: feeds the penalty window and advances the grammar.
    pub fn accept(&mut self, token: TokenId) {
        if self.history_cap > 0 {
            if self.history.len() == self.history_cap {
                self.history.pop_front();
            }
            self.history.push_back(token);
        }
        for stage in &mut self.stages {
            if let Stage::Grammar(constraint) = stage {
                constraint.accept(token);
            }
        }
    }
}

impl fmt::Debug for SamplerPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplerPipeline")
            .field("stages", &self.stages)
            .field("history_len", &self.history.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stage kernels
// ---------------------------------------------------------------------------

/// Repeat penalty divides positive logits and multiplies negative ones, so a
/// repeated token always becomes less likely; frequency and presence are then
/// subtracted.
fn apply_penalties(logits: &mut [f32], history: &VecDeque<TokenId>, cfg: &PenaltyConfig) {
    if cfg.is_noop() || history.is_empty() {
        return;
    }

    let window = history.len().min(cfg.last_n);
    let mut counts: Vec<(TokenId, u32)> = Vec::with_capacity(window);
    for &token in history.iter().skip(history.len() - window) {
        match counts.iter_mut().find(|(t, _)| *t == token) {
            Some((_, n)) => *n += 1,
            None => counts.push((token, 1)),
        }
    }

    for (token, count) in counts {
        let Some(logit) = usize::try_from(token).ok().and_then(|i| logits.get_mut(i)) else {
            continue;
        };
        if *logit <= 0.0 {
            *logit *= cfg.repeat;
        } else {
            *logit /= cfg.repeat;
        }
        *logit -= count as f32 * cfg.frequency + cfg.presence;
    }
}

fn ranked(logits: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| {
        logits[b]
            .partial_cmp(&logits[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    for &idx in ranked(logits).iter().skip(k) {
        logits[idx] = f32::NEG_INFINITY;
    }
}

/// Keeps at least one candidate.
fn apply_top_p(logits: &mut [f32], p: f32) {
    let probs = softmax(logits);
    let order = ranked(logits);

    let mut cumsum = 0.0;
    let mut keep = 0;
    for &idx in &order {
        cumsum += probs[idx];
        keep += 1;
        if cumsum >= p {
            break;
        }
    }
    for &idx in order.iter().skip(keep.max(1)) {
        logits[idx] = f32::NEG_INFINITY;
    }
}

fn apply_temperature(logits: &mut [f32], temperature: f32) {
    for logit in logits.iter_mut().filter(|l| l.is_finite()) {
        *logit /= temperature;
    }
}

fn apply_grammar(logits: &mut [f32], constraint: &dyn TokenConstraint) -> SamplingResult<()> {
    let mut any = false;
    for (idx, logit) in logits.iter_mut().enumerate() {
        if *logit == f32::NEG_INFINITY {
            continue;
        }
        if constraint.allows(idx as TokenId) {
            any = true;
        } else {
            *logit = f32::NEG_INFINITY;
        }
    }
    if any {
        Ok(())
    } else {
        Err(SamplingError::NoValidTokens)
    }
}

/// Numerically stable softmax. Masked (`-inf`) entries get probability 0; an
/// all-masked input yields all zeros.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max_logit == f32::NEG_INFINITY {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

fn sample_from_logits(logits: &[f32], rng: &mut SeededRng) -> SamplingResult<TokenId> {
    let probs = softmax(logits);
    let r = rng.next_f32();
    let mut cumsum = 0.0;

    for (i, &prob) in probs.iter().enumerate() {
        cumsum += prob;
        if r < cumsum {
            return Ok(i as TokenId);
        }
    }

    // Fallback to last token with nonzero probability
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .map(|i| i as TokenId)
        .ok_or(SamplingError::NoValidTokens)
}
