//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use llama_edge::engine::mock::{MockEngine, BOS_TOKEN};
use llama_edge::{
    Context, ContextConfig, DeviceClass, InferenceEngine, MemoryGuard, MemoryGuardConfig,
    MemorySampler, TokenId,
};

pub const MIB: usize = 1024 * 1024;

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Memory sampler whose reading the test controls.
#[derive(Clone)]
pub struct ScriptedSampler {
    resident: Arc<AtomicUsize>,
}

impl ScriptedSampler {
    pub fn new(resident: usize) -> Self {
        Self {
            resident: Arc::new(AtomicUsize::new(resident)),
        }
    }

    pub fn set(&self, bytes: usize) {
        self.resident.store(bytes, Ordering::SeqCst);
    }
}

impl MemorySampler for ScriptedSampler {
    fn resident_bytes(&self) -> usize {
        self.resident.load(Ordering::SeqCst)
    }

    fn total_physical_bytes(&self) -> usize {
        4096 * MIB
    }

    fn device_class(&self) -> DeviceClass {
        DeviceClass::Desktop
    }
}

pub fn guard(resident: usize) -> (Arc<MemoryGuard>, ScriptedSampler) {
    let sampler = ScriptedSampler::new(resident);
    let guard = MemoryGuard::with_config(
        sampler.clone(),
        MemoryGuardConfig {
            check_interval_ms: 100,
            ..MemoryGuardConfig::default()
        },
    );
    (Arc::new(guard), sampler)
}

pub fn context(engine: MockEngine) -> Arc<Context> {
    init_tracing();
    let (guard, _sampler) = guard(10 * MIB);
    Context::new(Box::new(engine), ContextConfig::default(), guard)
}

/// Tokens the mock produces for `prompt`, BOS included.
pub fn prompt_tokens(engine: &MockEngine, prompt: &str) -> Vec<TokenId> {
    let mut tokens = vec![BOS_TOKEN];
    tokens.extend(engine.tokenize(prompt, false).unwrap_or_default());
    tokens
}

pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
