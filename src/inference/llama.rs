//! llama.cpp generation backend
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, and the backend may only be initialized
//! once per process, a single worker thread owns the backend and every loaded
//! model. Engines handed to the cache are thin clients that talk to the worker
//! over channels; dropping one unloads its model.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;

use crate::inference::engine::{Engine, EngineError, EngineLoader, SamplingConfig};
use crate::inference::registry::ModelSpec;

/// Tokens considered by the repetition penalty
const PENALTY_WINDOW: i32 = 64;

/// Commands sent to the worker thread
enum WorkerCommand {
    LoadModel {
        key: String,
        path: PathBuf,
        gpu_layers: u32,
        response_tx: Sender<Result<(), EngineError>>,
    },
    UnloadModel {
        key: String,
    },
    Generate {
        key: String,
        prompt: String,
        config: SamplingConfig,
        response_tx: Sender<Result<String, EngineError>>,
    },
    Shutdown,
}

/// Loads GGUF models from a directory onto the shared llama.cpp worker.
///
/// A model identifier maps to `<models_directory>/<identifier>.gguf`, with
/// `/` replaced by `--` (`microsoft/DialoGPT-small` becomes
/// `microsoft--DialoGPT-small.gguf`).
pub struct LlamaLoader {
    models_directory: PathBuf,
    gpu_layers: u32,
    command_tx: Sender<WorkerCommand>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    next_key: AtomicU64,
}

impl LlamaLoader {
    /// Spawns the worker thread and initializes the backend on it.
    ///
    /// # Arguments
    /// * `models_directory` - Directory containing `.gguf` files
    /// * `gpu_layers` - Number of layers to offload to GPU (0 = CPU only)
    pub fn new(models_directory: impl Into<PathBuf>, gpu_layers: u32) -> Self {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let handle = thread::spawn(move || worker_thread_main(command_rx));

        tracing::info!("llama.cpp worker thread started");

        Self {
            models_directory: models_directory.into(),
            gpu_layers,
            command_tx,
            worker_handle: Mutex::new(Some(handle)),
            next_key: AtomicU64::new(0),
        }
    }

    /// File the given identifier loads from
    pub fn model_path(&self, name: &str) -> PathBuf {
        model_file_path(&self.models_directory, name)
    }
}

fn model_file_path(directory: &Path, name: &str) -> PathBuf {
    directory.join(format!("{}.gguf", name.replace('/', "--")))
}

impl EngineLoader for LlamaLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Engine>, EngineError> {
        let path = self.model_path(&spec.name);
        if !path.is_file() {
            return Err(EngineError::ModelNotFound(path.display().to_string()));
        }

        let key = format!(
            "{}#{}",
            spec.name,
            self.next_key.fetch_add(1, Ordering::Relaxed)
        );
        let (response_tx, response_rx) = mpsc::channel();

        self.command_tx
            .send(WorkerCommand::LoadModel {
                key: key.clone(),
                path,
                gpu_layers: self.gpu_layers,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        Ok(Box::new(LlamaEngine {
            key,
            command_tx: self.command_tx.clone(),
        }))
    }
}

impl Drop for LlamaLoader {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        let handle = self
            .worker_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// One loaded model on the worker thread
struct LlamaEngine {
    key: String,
    command_tx: Sender<WorkerCommand>,
}

impl Engine for LlamaEngine {
    fn generate(&self, prompt: &str, config: &SamplingConfig) -> Result<String, EngineError> {
        let (response_tx, response_rx) = mpsc::channel();

        self.command_tx
            .send(WorkerCommand::Generate {
                key: self.key.clone(),
                prompt: prompt.to_string(),
                config: config.clone(),
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::UnloadModel {
            key: self.key.clone(),
        });
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and every LlamaModel, processes commands in order.
fn worker_thread_main(command_rx: Receiver<WorkerCommand>) {
    let backend = match LlamaBackend::init() {
        Ok(b) => {
            tracing::info!("LlamaBackend initialized in worker thread");
            Some(b)
        }
        Err(e) => {
            tracing::error!("Failed to init backend: {}", e);
            None
        }
    };
    let mut models: HashMap<String, LlamaModel> = HashMap::new();

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::LoadModel {
                key,
                path,
                gpu_layers,
                response_tx,
            }) => {
                let result = match &backend {
                    Some(b) => {
                        let model_params =
                            LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
                        LlamaModel::load_from_file(b, &path, &model_params)
                            .map_err(|e| EngineError::ModelLoad(e.to_string()))
                    }
                    None => Err(EngineError::BackendUnavailable(
                        "llama.cpp backend failed to initialize".to_string(),
                    )),
                };
                let result = result.map(|model| {
                    tracing::info!(
                        "Model loaded: {} ({} params, {} ctx)",
                        path.display(),
                        model.n_params(),
                        model.n_ctx_train()
                    );
                    models.insert(key, model);
                });
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::UnloadModel { key }) => {
                if models.remove(&key).is_some() {
                    tracing::info!("Model unloaded in worker thread: {}", key);
                }
            }
            Ok(WorkerCommand::Generate {
                key,
                prompt,
                config,
                response_tx,
            }) => {
                let result = match (&backend, models.get(&key)) {
                    (Some(b), Some(m)) => run_generation(b, m, &prompt, &config),
                    _ => Err(EngineError::Inference(format!("model {key} is not loaded"))),
                };
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Generate a completion and return it with the prompt echoed in front.
///
/// `max_length` bounds prompt plus generated tokens. llama.cpp has no
/// no-repeat-n-gram sampler; the repetition penalty is the closest control.
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    prompt: &str,
    config: &SamplingConfig,
) -> Result<String, EngineError> {
    let tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| EngineError::Tokenization(e.to_string()))?;

    let max_length = config.max_length as usize;
    if tokens.is_empty() || tokens.len() >= max_length {
        return Ok(prompt.to_string());
    }
    let max_new_tokens = max_length - tokens.len();

    let n_ctx = (max_length as u32).max(512).min(model.n_ctx_train().max(512));
    let n_ctx = NonZeroU32::new(n_ctx)
        .ok_or_else(|| EngineError::Inference("context size must be non-zero".to_string()))?;
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx))
        .with_n_batch(n_ctx.get());

    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| EngineError::Inference(format!("Failed to create context: {e}")))?;

    let mut batch = LlamaBatch::new(tokens.len().max(512), 1);
    let last_index = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        batch
            .add(*token, i as i32, &[0], i == last_index)
            .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
    }
    ctx.decode(&mut batch)
        .map_err(|e| EngineError::Inference(format!("Failed to decode prompt: {e}")))?;

    let mut sampler = if config.temperature < 0.01 {
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::penalties(PENALTY_WINDOW, config.repetition_penalty, 0.0, 0.0),
            LlamaSampler::top_p(config.top_p, 1),
            LlamaSampler::temp(config.temperature),
            LlamaSampler::dist(config.seed),
        ])
    };

    let mut generated: Vec<u8> = Vec::new();
    let mut n_decoded = tokens.len() as i32;

    for _ in 0..max_new_tokens {
        let new_token = sampler.sample(&ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            tracing::debug!("End of generation token encountered");
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| EngineError::Inference(format!("Failed to convert token: {e}")))?;
        generated.extend_from_slice(&token_bytes);

        batch.clear();
        batch
            .add(new_token, n_decoded, &[0], true)
            .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(format!("Failed to decode: {e}")))?;

        n_decoded += 1;
    }

    let mut output = prompt.to_string();
    output.push_str(&String::from_utf8_lossy(&generated));
    Ok(output)
}
