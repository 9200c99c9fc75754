use candle_core::{DType, Device, Tensor};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::batch::{Batch, PRIMARY_SEQ};
use crate::config::ModelConfig;
use crate::engine::EngineError;
use crate::prompting::{infer_family_from_filename, PromptFamily};

use super::runtime::{ModelArch, RuntimeModel};
use super::tokenizer::{load_tokenizer, resolve_eos_token, TokenStream};
use super::{ModelBackend, TokenId};

/// Mutable decode state. Built after the model and dropped before it.
struct InferenceContext {
    n_ctx: usize,
    n_past: usize,
    logits: Option<Vec<f32>>,
    stream: TokenStream,
}

impl InferenceContext {
    /// `max_positions` is what the loaded runtime can serve, see
    /// [`GgufFacts::max_positions`](super::runtime::GgufFacts::max_positions).
    fn new(n_ctx: usize, max_positions: Option<usize>) -> Result<Self, EngineError> {
        if n_ctx == 0 {
            return Err(EngineError::ContextInit(
                "context length must be greater than zero".to_string(),
            ));
        }
        if let Some(limit) = max_positions {
            if n_ctx > limit {
                return Err(EngineError::ContextInit(format!(
                    "requested context of {} tokens exceeds the {} positions this model can serve",
                    n_ctx, limit
                )));
            }
        }
        Ok(Self {
            n_ctx,
            n_past: 0,
            logits: None,
            stream: TokenStream::default(),
        })
    }
}

/// Read-only half: weights, tokenizer and vocabulary facts.
struct LoadedModel {
    runtime: RuntimeModel,
    tokenizer: Tokenizer,
    family: PromptFamily,
    eos_token_id: TokenId,
    vocab_size: usize,
    device: Device,
}

/// A GGUF model and its inference context as one owning handle.
///
/// Field order is drop order: `context` goes before `model`.
pub struct LocalModel {
    context: InferenceContext,
    model: LoadedModel,
}

impl LocalModel {
    pub fn load(config: &ModelConfig) -> Result<Self, EngineError> {
        let path = config.model_path.to_string_lossy().to_string();
        info!(path = %path, "loading model");

        if config.use_gpu || config.gpu_layers > 0 {
            warn!(
                use_gpu = config.use_gpu,
                gpu_layers = config.gpu_layers,
                "GPU offload requested but not supported; running on CPU"
            );
        }

        let device = Device::Cpu;
        let (runtime, facts) = RuntimeModel::load_from_gguf(&path, &device)?;
        info!(
            arch = ?facts.arch,
            trained_context = ?facts.trained_context,
            max_positions = ?facts.max_positions(),
            "weights loaded"
        );

        let tokenizer = load_tokenizer(
            &path,
            config.tokenizer_path.as_deref(),
            config.tokenizer_repo.as_deref(),
        )?;

        let family = config
            .family
            .unwrap_or_else(|| family_for(&config.model_path, runtime.arch()));
        let eos_token_id = resolve_eos_token(&tokenizer, family, facts.eos_token_id)
            .map_err(|e| EngineError::model_load(&path, e))?;
        let vocab_size = tokenizer.get_vocab_size(true);

        let model = LoadedModel {
            runtime,
            tokenizer,
            family,
            eos_token_id,
            vocab_size,
            device,
        };
        let context = InferenceContext::new(config.context_length, facts.max_positions())?;

        info!(
            family = ?family,
            eos = eos_token_id,
            vocab = vocab_size,
            n_ctx = context.n_ctx,
            "model ready"
        );

        Ok(Self { context, model })
    }

    pub fn family(&self) -> PromptFamily {
        self.model.family
    }
}

fn family_for(model_path: &std::path::Path, arch: ModelArch) -> PromptFamily {
    let from_name = model_path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(infer_family_from_filename)
        .unwrap_or(PromptFamily::Unknown);

    match (from_name, arch) {
        (PromptFamily::Unknown, ModelArch::Qwen2) => PromptFamily::Qwen,
        (family, _) => family,
    }
}

/// A batch must continue the cache at `n_past`, stay inside `n_ctx`, use the
/// primary sequence and ask for logits on its last token at most.
fn check_batch(batch: &Batch, n_past: usize, n_ctx: usize) -> Result<(), EngineError> {
    if batch.is_empty() {
        return Err(EngineError::decode("empty batch"));
    }
    if batch.start_pos() != n_past || !batch.positions_are_contiguous() {
        return Err(EngineError::decode(format!(
            "batch must continue the cache at position {} (got {}..{})",
            n_past,
            batch.start_pos(),
            batch.end_pos()
        )));
    }
    if batch.end_pos() > n_ctx {
        return Err(EngineError::decode(format!(
            "context window full ({} positions)",
            n_ctx
        )));
    }
    if batch.entries().iter().any(|e| e.seq_id != PRIMARY_SEQ) {
        return Err(EngineError::decode("only the primary sequence is supported"));
    }
    if batch.wants_any_logits() && !batch.wants_last_logits_only() {
        return Err(EngineError::decode(
            "logits can only be requested for the last token of a batch",
        ));
    }
    Ok(())
}

impl ModelBackend for LocalModel {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        let encoding = self
            .model
            .tokenizer
            .encode(text, true)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;
        let tokens = encoding.get_ids().to_vec();
        if tokens.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }
        Ok(tokens)
    }

    fn decode(&mut self, batch: Batch) -> Result<(), EngineError> {
        check_batch(&batch, self.context.n_past, self.context.n_ctx)?;
        let wants_logits = batch.wants_any_logits();

        let tokens = batch.tokens();
        let input = Tensor::new(tokens.as_slice(), &self.model.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(EngineError::decode)?;
        let logits = self
            .model
            .runtime
            .forward(&input, self.context.n_past)
            .and_then(|l| l.flatten_all())
            .and_then(|l| l.to_dtype(DType::F32))
            .and_then(|l| l.to_vec1::<f32>())
            .map_err(EngineError::decode)?;

        self.context.n_past = batch.end_pos();
        self.context.logits = if wants_logits { Some(logits) } else { None };
        Ok(())
    }

    fn logits(&self) -> Result<&[f32], EngineError> {
        self.context
            .logits
            .as_deref()
            .ok_or_else(|| EngineError::decode("no logits requested by the last decode"))
    }

    fn detokenize(&mut self, token: TokenId) -> Result<String, EngineError> {
        self.context
            .stream
            .next(&self.model.tokenizer, token)
            .map_err(EngineError::decode)
    }

    fn reset_cache(&mut self) {
        // The per-layer caches inside the candle weights restart on the next
        // forward at position 0; dropping n_past makes that the only legal
        // next batch.
        self.context.n_past = 0;
        self.context.logits = None;
        self.context.stream.clear();
        debug!("kv cache reset");
    }

    fn vocabulary_size(&self) -> usize {
        self.model.vocab_size
    }

    fn eos_token_id(&self) -> TokenId {
        self.model.eos_token_id
    }

    fn context_length(&self) -> usize {
        self.context.n_ctx
    }
}
