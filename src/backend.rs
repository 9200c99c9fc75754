//! Model backend abstraction.
//!
//! A [`ModelBackend`] is one loaded model plus its inference context. The
//! engine owns it exclusively; decode mutates the key/value cache with no
//! internal locking, so parallel callers need one backend each.

mod local;
mod runtime;
mod tokenizer;

pub use local::LocalModel;
pub use runtime::{ModelArch, RuntimeModel};

use crate::batch::Batch;
use crate::engine::EngineError;
use crate::sampling::{argmax, SamplingPolicy};

pub type TokenId = u32;

pub trait ModelBackend {
    /// Text to token ids, special tokens included as the tokenizer defines
    /// them. Zero tokens is [`EngineError::EmptyPrompt`].
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError>;

    /// Runs the batch, appending its positions to the key/value cache and
    /// keeping logits for the flagged token.
    fn decode(&mut self, batch: Batch) -> Result<(), EngineError>;

    /// Logits produced by the last decode that requested them.
    fn logits(&self) -> Result<&[f32], EngineError>;

    /// Text for one generated token. May be empty.
    fn detokenize(&mut self, token: TokenId) -> Result<String, EngineError>;

    /// Clears the key/value cache and any per-prompt decode state.
    fn reset_cache(&mut self);

    fn vocabulary_size(&self) -> usize;

    fn eos_token_id(&self) -> TokenId;

    /// Maximum number of positions the context can hold.
    fn context_length(&self) -> usize;

    /// The logits row cut to the vocabulary. Output layers are often padded
    /// past the last real token id.
    fn vocabulary_logits(&self) -> Result<&[f32], EngineError> {
        let row = self.logits()?;
        Ok(&row[..row.len().min(self.vocabulary_size())])
    }

    fn sample_greedy(&self) -> Result<TokenId, EngineError> {
        argmax(self.vocabulary_logits()?).ok_or_else(|| EngineError::decode("empty logits row"))
    }

    fn sample_with<S: SamplingPolicy>(&self, policy: &mut S) -> Result<TokenId, EngineError>
    where
        Self: Sized,
    {
        policy
            .select(self.vocabulary_logits()?)
            .ok_or_else(|| EngineError::decode("empty logits row"))
    }
}
