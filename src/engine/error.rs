use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to load model '{path}': {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("failed to initialize inference context: {0}")]
    ContextInit(String),

    #[error("failed to tokenize prompt: {0}")]
    Tokenize(String),

    #[error("no tokens produced for prompt")]
    EmptyPrompt,

    #[error("prompt exceeds context window ({tokens} tokens > {limit} allowed)")]
    ContextOverflow { tokens: usize, limit: usize },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("batch capacity error: {0}")]
    BatchCapacity(String),
}

impl EngineError {
    pub(crate) fn model_load(path: &str, reason: impl ToString) -> Self {
        Self::ModelLoad {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn decode(reason: impl ToString) -> Self {
        Self::Decode(reason.to_string())
    }
}
