use std::collections::HashMap;
use std::fs::File;

use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;

use crate::engine::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArch {
    Llama,
    Qwen2,
}

impl ModelArch {
    fn from_gguf(name: &str) -> Option<Self> {
        match name {
            // Mistral GGUF exports declare the llama architecture.
            "llama" | "mistral" => Some(Self::Llama),
            "qwen2" => Some(Self::Qwen2),
            _ => None,
        }
    }

    fn metadata_prefix(self) -> &'static str {
        match self {
            Self::Llama => "llama",
            Self::Qwen2 => "qwen2",
        }
    }

    /// Rotary tables built by the runtime itself, independent of the GGUF.
    fn runtime_position_limit(self) -> Option<usize> {
        match self {
            Self::Llama => Some(quantized_llama::MAX_SEQ_LEN),
            // Sized from `qwen2.context_length`.
            Self::Qwen2 => None,
        }
    }
}

/// Facts read from the GGUF header before the weights are materialized.
#[derive(Debug, Clone)]
pub struct GgufFacts {
    pub arch: ModelArch,
    pub trained_context: Option<usize>,
    pub eos_token_id: Option<u32>,
}

impl GgufFacts {
    /// Positions the runtime can actually serve: the trained context, capped
    /// by any fixed-size rotary table.
    pub fn max_positions(&self) -> Option<usize> {
        match (self.trained_context, self.arch.runtime_position_limit()) {
            (Some(trained), Some(runtime)) => Some(trained.min(runtime)),
            (trained, runtime) => trained.or(runtime),
        }
    }
}

/// Quantized weights for one of the supported architectures. Each variant
/// keeps its own per-layer key/value cache, which candle restarts whenever
/// `forward` is called at position 0.
pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    pub fn load_from_gguf(path: &str, device: &Device) -> Result<(Self, GgufFacts), EngineError> {
        let mut file = File::open(path).map_err(|e| EngineError::model_load(path, e))?;
        let content =
            gguf_file::Content::read(&mut file).map_err(|e| EngineError::model_load(path, e))?;

        let arch_name = metadata_string(&content.metadata, "general.architecture")
            .ok_or_else(|| EngineError::model_load(path, "GGUF has no general.architecture"))?;
        let arch = ModelArch::from_gguf(&arch_name).ok_or_else(|| {
            EngineError::model_load(path, format!("unsupported architecture '{}'", arch_name))
        })?;

        let facts = GgufFacts {
            arch,
            trained_context: metadata_usize(
                &content.metadata,
                &format!("{}.context_length", arch.metadata_prefix()),
            ),
            eos_token_id: metadata_usize(&content.metadata, "tokenizer.ggml.eos_token_id")
                .map(|id| id as u32),
        };

        let model = match arch {
            ModelArch::Llama => {
                quantized_llama::ModelWeights::from_gguf(content, &mut file, device)
                    .map(Self::Llama)
            }
            ModelArch::Qwen2 => {
                quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device)
                    .map(Self::Qwen2)
            }
        }
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("cannot find tensor info for output_norm.weight") {
                EngineError::model_load(
                    path,
                    "missing 'output_norm.weight': the GGUF is likely an incomplete split shard. \
                     Use a full single-file GGUF, or merge all split parts.",
                )
            } else {
                EngineError::model_load(path, msg)
            }
        })?;

        Ok((model, facts))
    }

    /// Runs `input` (shape `[1, seq_len]`) starting at `position` and returns
    /// the logits of the last position.
    pub fn forward(&mut self, input: &Tensor, position: usize) -> candle_core::Result<Tensor> {
        match self {
            Self::Llama(model) => model.forward(input, position),
            Self::Qwen2(model) => model.forward(input, position),
        }
    }

    pub fn arch(&self) -> ModelArch {
        match self {
            Self::Llama(_) => ModelArch::Llama,
            Self::Qwen2(_) => ModelArch::Qwen2,
        }
    }
}

fn metadata_string(metadata: &HashMap<String, gguf_file::Value>, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|v| v.to_string().ok())
        .map(|s| s.to_string())
}

fn metadata_usize(metadata: &HashMap<String, gguf_file::Value>, key: &str) -> Option<usize> {
    let value = metadata.get(key)?;
    value
        .to_u32()
        .map(|v| v as usize)
        .or_else(|_| value.to_u64().map(|v| v as usize))
        .ok()
}
