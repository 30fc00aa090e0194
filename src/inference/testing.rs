//! Fake engines for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::inference::engine::{Engine, EngineError, EngineLoader, SamplingConfig};
use crate::inference::registry::ModelSpec;

#[derive(Default)]
struct Counters {
    loads: HashMap<String, usize>,
    released: HashMap<String, usize>,
    started: HashSet<String>,
}

/// Loader that counts constructions and releases per model.
pub struct FakeLoader {
    counters: Arc<Mutex<Counters>>,
    failures: Mutex<HashMap<String, usize>>,
    gates: Arc<(Mutex<HashSet<String>>, Condvar)>,
    load_delay: Duration,
    completion: String,
    fail_generation: bool,
    generate_delay: Duration,
    generate_calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Mutex::new(Counters::default())),
            failures: Mutex::new(HashMap::new()),
            gates: Arc::new((Mutex::new(HashSet::new()), Condvar::new())),
            load_delay: Duration::ZERO,
            completion: "abc".to_string(),
            fail_generation: false,
            generate_delay: Duration::ZERO,
            generate_calls: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// The first `count` loads of `model` fail.
    pub fn failing_loads(self, model: &str, count: usize) -> Self {
        self.failures.lock().unwrap().insert(model.to_string(), count);
        self
    }

    /// Loads of `model` block until `open_gate` is called.
    pub fn gated(self, model: &str) -> Self {
        self.gates.0.lock().unwrap().insert(model.to_string());
        self
    }

    /// Text appended to the prompt by every engine.
    pub fn with_completion(mut self, completion: &str) -> Self {
        self.completion = completion.to_string();
        self
    }

    pub fn failing_generation(mut self) -> Self {
        self.fail_generation = true;
        self
    }

    pub fn with_generate_delay(mut self, delay: Duration) -> Self {
        self.generate_delay = delay;
        self
    }

    pub fn open_gate(&self, model: &str) {
        let (closed, cvar) = &*self.gates;
        closed.lock().unwrap().remove(model);
        cvar.notify_all();
    }

    pub async fn wait_until_loading(&self, model: &str) {
        while !self.counters.lock().unwrap().started.contains(model) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn loads(&self, model: &str) -> usize {
        *self.counters.lock().unwrap().loads.get(model).unwrap_or(&0)
    }

    pub fn total_loads(&self) -> usize {
        self.counters.lock().unwrap().loads.values().sum()
    }

    pub fn released(&self, model: &str) -> usize {
        *self.counters.lock().unwrap().released.get(model).unwrap_or(&0)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Highest number of generations observed running at the same time.
    pub fn max_concurrent_generations(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl EngineLoader for FakeLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Engine>, EngineError> {
        {
            let mut counters = self.counters.lock().unwrap();
            *counters.loads.entry(spec.name.clone()).or_default() += 1;
            counters.started.insert(spec.name.clone());
        }

        {
            let (closed, cvar) = &*self.gates;
            let mut closed = closed.lock().unwrap();
            while closed.contains(&spec.name) {
                closed = cvar.wait(closed).unwrap();
            }
        }

        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&spec.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(EngineError::ModelLoad(format!(
                        "simulated failure for {}",
                        spec.name
                    )));
                }
            }
        }

        Ok(Box::new(FakeEngine {
            model: spec.name.clone(),
            counters: self.counters.clone(),
            completion: self.completion.clone(),
            fail: self.fail_generation,
            delay: self.generate_delay,
            calls: self.generate_calls.clone(),
            active: self.active.clone(),
            max_active: self.max_active.clone(),
        }))
    }
}

struct FakeEngine {
    model: String,
    counters: Arc<Mutex<Counters>>,
    completion: String,
    fail: bool,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl Engine for FakeEngine {
    fn generate(&self, prompt: &str, _config: &SamplingConfig) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(EngineError::Inference("CUDA out of memory".to_string()));
        }
        Ok(format!("{prompt}{}", self.completion))
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.released.entry(self.model.clone()).or_default() += 1;
        }
    }
}
