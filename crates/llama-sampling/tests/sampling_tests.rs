//! Integration tests for llama-sampling.
//!
//! Validates:
//! - Softmax mathematical properties and masking
//! - Stage selection and ordering from parameters
//! - Top-k / top-p / temperature behaviour through the public pipeline
//! - Penalty history across successive samples
//! - Grammar constraints (masking and parse-state advancement)
//! - Determinism (seeded RNG reproducibility)
//! - SamplingParams defaults and JSON deserialization

use llama_sampling::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn seeded(seed: u64) -> SamplingParams {
    SamplingParams {
        seed: Some(seed),
        ..SamplingParams::default()
    }
}

/// Parameters with every filter and penalty disabled.
fn plain(seed: u64) -> SamplingParams {
    SamplingParams {
        temperature: 1.0,
        top_k: 0,
        top_p: 1.0,
        repeat_penalty: 1.0,
        frequency_penalty: 0.0,
        presence_penalty: 0.0,
        penalty_last_n: 0,
        seed: Some(seed),
    }
}

// ===========================================================================
// Softmax
// ===========================================================================

#[test]
fn softmax_sums_to_one() {
    let test_cases: Vec<Vec<f32>> = vec![
        vec![1.0, 2.0, 3.0],
        vec![0.0, 0.0, 0.0],
        vec![-1.0, -2.0, -3.0],
        vec![100.0, 200.0, 300.0],
        vec![1.0],
    ];

    for logits in &test_cases {
        let sum: f32 = softmax(logits).iter().sum();
        assert!(
            (sum - 1.0).abs() < 1e-5,
            "softmax sum = {} for logits {:?}",
            sum,
            logits
        );
    }
}

#[test]
fn softmax_preserves_ordering() {
    let probs = softmax(&[1.0, 3.0, 2.0]);
    assert!(probs[1] > probs[2]);
    assert!(probs[2] > probs[0]);
}

#[test]
fn softmax_numerical_stability_large_values() {
    let probs = softmax(&[1000.0, 1001.0, 1002.0]);
    assert!(probs.iter().all(|p| p.is_finite()));
}

// ===========================================================================
// Stage Selection
// ===========================================================================

#[test]
fn default_params_build_full_chain() {
    let pipeline = SamplerPipeline::build(&seeded(1), None).unwrap();
    let kinds = pipeline.stage_kinds();
    assert_eq!(kinds.first(), Some(&StageKind::Penalties));
    assert_eq!(kinds.last(), Some(&StageKind::FinalSample));
    assert_eq!(kinds.len(), 5);
}

#[test]
fn grammar_stage_sits_before_final_sample() {
    let pipeline = SamplerPipeline::build(&seeded(1), Some(Box::new(AllowOnly(vec![1])))).unwrap();
    let kinds = pipeline.stage_kinds();
    assert_eq!(kinds[kinds.len() - 2], StageKind::Grammar);
    assert_eq!(kinds[kinds.len() - 3], StageKind::Temperature);
}

#[test]
fn stage_parameters_are_inspectable() {
    let p = SamplingParams {
        top_k: 7,
        top_p: 0.5,
        ..seeded(1)
    };
    let pipeline = SamplerPipeline::build(&p, None).unwrap();
    assert!(matches!(pipeline.stages()[1], Stage::TopK(7)));
    assert!(matches!(pipeline.stages()[2], Stage::TopP(p) if (p - 0.5).abs() < 1e-6));
}

// ===========================================================================
// Filtering Through the Pipeline
// ===========================================================================

#[test]
fn top_k_1_is_greedy() {
    let p = SamplingParams {
        top_k: 1,
        ..plain(9)
    };
    let mut pipeline = SamplerPipeline::build(&p, None).unwrap();
    for _ in 0..20 {
        assert_eq!(pipeline.sample(&[1.0, 5.0, 2.0, 3.0]).unwrap(), 1);
    }
}

#[test]
fn greedy_params_pick_argmax() {
    let mut pipeline = SamplerPipeline::build(&SamplingParams::greedy(), None).unwrap();
    assert_eq!(pipeline.sample(&[0.1, 0.2, 9.0, 0.3]).unwrap(), 2);
}

#[test]
fn top_k_restricts_to_k_tokens() {
    let p = SamplingParams {
        top_k: 2,
        ..plain(3)
    };
    let mut pipeline = SamplerPipeline::build(&p, None).unwrap();
    let logits = [0.0, 1.0, 0.9, 0.0, 0.0];
    for _ in 0..200 {
        let t = pipeline.sample(&logits).unwrap();
        assert!(t == 1 || t == 2, "token {} outside top-2", t);
    }
}

#[test]
fn top_p_very_small_is_greedy() {
    let p = SamplingParams {
        top_p: 0.01,
        ..plain(5)
    };
    let mut pipeline = SamplerPipeline::build(&p, None).unwrap();
    for _ in 0..50 {
        assert_eq!(pipeline.sample(&[1.0, 2.0, 4.0, 3.0]).unwrap(), 2);
    }
}

#[test]
fn low_temperature_concentrates_choices() {
    let logits = [1.0, 2.0, 1.5];
    let count_top = |temperature: f32| {
        let p = SamplingParams {
            temperature,
            ..plain(11)
        };
        let mut pipeline = SamplerPipeline::build(&p, None).unwrap();
        (0..500)
            .filter(|_| pipeline.sample(&logits).unwrap() == 1)
            .count()
    };
    assert!(count_top(0.1) > count_top(5.0));
}

#[test]
fn zero_temperature_draws_from_raw_distribution() {
    let p = SamplingParams {
        temperature: 0.0,
        ..plain(13)
    };
    let mut pipeline = SamplerPipeline::build(&p, None).unwrap();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..200 {
        seen.insert(pipeline.sample(&[0.0, 0.0, 0.0, 0.0]).unwrap());
    }
    assert!(seen.len() > 1);
}

#[test]
fn nan_logits_are_never_chosen() {
    let mut pipeline = SamplerPipeline::build(&plain(2), None).unwrap();
    for _ in 0..50 {
        assert_ne!(pipeline.sample(&[f32::NAN, 0.0, 0.0]).unwrap(), 0);
    }
}

// ===========================================================================
// Penalties
// ===========================================================================

#[test]
fn repeat_penalty_moves_choice_off_repeated_token() {
    // Token 0 barely wins; once sampled, the penalty hands the lead to token 1.
    let p = SamplingParams {
        top_k: 1,
        repeat_penalty: 2.0,
        penalty_last_n: 4,
        ..plain(1)
    };
    let mut pipeline = SamplerPipeline::build(&p, None).unwrap();
    let logits = [3.0, 2.5, 0.0];
    assert_eq!(pipeline.sample(&logits).unwrap(), 0);
    assert_eq!(pipeline.sample(&logits).unwrap(), 1);
}

#[test]
fn penalty_window_forgets_old_tokens() {
    let p = SamplingParams {
        top_k: 1,
        repeat_penalty: 100.0,
        penalty_last_n: 1,
        ..plain(1)
    };
    let mut pipeline = SamplerPipeline::build(&p, None).unwrap();
    let logits = [3.0, 2.5, 0.0];
    // Alternates because only the previous token is penalised.
    let picks: Vec<TokenId> = (0..4).map(|_| pipeline.sample(&logits).unwrap()).collect();
    assert_eq!(picks, vec![0, 1, 0, 1]);
}

#[test]
fn accept_primes_history() {
    let p = SamplingParams {
        top_k: 1,
        repeat_penalty: 2.0,
        penalty_last_n: 4,
        ..plain(1)
    };
    let mut pipeline = SamplerPipeline::build(&p, None).unwrap();
    pipeline.accept(0);
    assert_eq!(pipeline.sample(&[3.0, 2.5, 0.0]).unwrap(), 1);
}

#[test]
fn disabled_penalties_keep_no_history() {
    let mut pipeline = SamplerPipeline::build(&plain(1), None).unwrap();
    pipeline.sample(&[1.0, 2.0]).unwrap();
    assert!(pipeline.history().is_empty());
}

// ===========================================================================
// Grammar
// ===========================================================================

struct AllowOnly(Vec<TokenId>);

impl TokenConstraint for AllowOnly {
    fn allows(&self, token: TokenId) -> bool {
        self.0.contains(&token)
    }
    fn accept(&mut self, _token: TokenId) {}
}

/// Counts accepted tokens through a shared counter.
struct Counting(Arc<AtomicUsize>);

impl TokenConstraint for Counting {
    fn allows(&self, _token: TokenId) -> bool {
        true
    }
    fn accept(&mut self, _token: TokenId) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn grammar_masks_disallowed_tokens() {
    let mut pipeline =
        SamplerPipeline::build(&plain(4), Some(Box::new(AllowOnly(vec![2, 3])))).unwrap();
    for _ in 0..100 {
        let t = pipeline.sample(&[5.0, 5.0, 0.0, 0.0]).unwrap();
        assert!(t == 2 || t == 3);
    }
}

#[test]
fn grammar_sees_every_accepted_token() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline =
        SamplerPipeline::build(&plain(4), Some(Box::new(Counting(Arc::clone(&counter))))).unwrap();
    for _ in 0..5 {
        pipeline.sample(&[0.0, 1.0]).unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[test]
fn grammar_with_no_survivors_errors() {
    let mut pipeline =
        SamplerPipeline::build(&plain(4), Some(Box::new(AllowOnly(vec![9])))).unwrap();
    assert_eq!(
        pipeline.sample(&[1.0, 2.0, 3.0]),
        Err(SamplingError::NoValidTokens)
    );
}

// ===========================================================================
// Determinism
// ===========================================================================

#[test]
fn same_seed_same_sequence() {
    let logits = [0.1, 0.2, 0.3, 0.4, 0.5];
    let mut a = SamplerPipeline::build(&seeded(42), None).unwrap();
    let mut b = SamplerPipeline::build(&seeded(42), None).unwrap();
    for _ in 0..500 {
        assert_eq!(a.sample(&logits).unwrap(), b.sample(&logits).unwrap());
    }
}

#[test]
fn different_seeds_diverge() {
    let logits = [0.0; 8];
    let mut a = SamplerPipeline::build(&plain(1), None).unwrap();
    let mut b = SamplerPipeline::build(&plain(2), None).unwrap();
    let seq_a: Vec<_> = (0..50).map(|_| a.sample(&logits).unwrap()).collect();
    let seq_b: Vec<_> = (0..50).map(|_| b.sample(&logits).unwrap()).collect();
    assert_ne!(seq_a, seq_b);
}

#[test]
fn seeded_rng_zero_seed_is_usable() {
    let mut rng = SeededRng::new(0);
    let values: Vec<f32> = (0..10).map(|_| rng.next_f32()).collect();
    assert!(values.iter().any(|&v| v > 0.0));
}

#[test]
fn unseeded_pipelines_still_sample() {
    let p = SamplingParams::default();
    assert!(p.seed.is_none());
    let mut pipeline = SamplerPipeline::build(&p, None).unwrap();
    assert!(pipeline.sample(&[0.0, 1.0, 2.0]).unwrap() < 3);
}

// ===========================================================================
// Configuration
// ===========================================================================

#[test]
fn params_defaults() {
    let p = SamplingParams::default();
    assert!((p.temperature - 0.8).abs() < 1e-6);
    assert_eq!(p.top_k, 40);
    assert!((p.top_p - 0.95).abs() < 1e-6);
    assert!((p.repeat_penalty - 1.1).abs() < 1e-6);
    assert_eq!(p.frequency_penalty, 0.0);
    assert_eq!(p.presence_penalty, 0.0);
    assert_eq!(p.penalty_last_n, 64);
}

#[test]
fn params_deserialize_partial_json() {
    let p: SamplingParams = serde_json::from_str(r#"{"temperature": 0.2, "seed": 7}"#).unwrap();
    assert!((p.temperature - 0.2).abs() < 1e-6);
    assert_eq!(p.seed, Some(7));
    assert_eq!(p.top_k, 40);
}

#[test]
fn params_deserialize_empty_object_is_default() {
    let p: SamplingParams = serde_json::from_str("{}").unwrap();
    assert_eq!(p, SamplingParams::default());
}

#[test]
fn invalid_params_fail_build() {
    for bad in [
        SamplingParams {
            top_p: -0.1,
            ..SamplingParams::default()
        },
        SamplingParams {
            repeat_penalty: 0.0,
            ..SamplingParams::default()
        },
        SamplingParams {
            presence_penalty: f32::INFINITY,
            ..SamplingParams::default()
        },
    ] {
        assert!(matches!(
            SamplerPipeline::build(&bad, None),
            Err(SamplingError::InvalidParameter(_))
        ));
    }
}

#[test]
fn error_display() {
    assert_eq!(
        SamplingError::NoValidTokens.to_string(),
        "No valid tokens after filtering"
    );
    assert!(SamplingError::InvalidParameter("x".into())
        .to_string()
        .contains("x"));
}
