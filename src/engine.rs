//! Sequential generation over a shared backend.
//!
//! Each prompt runs `Idle -> Prefilling -> Generating -> {Done | Failed}` and
//! the key/value cache is reset after every prompt whatever the outcome, so
//! one prompt's output never depends on the prompts before it.

mod error;

pub use error::EngineError;

use std::fmt;

use tracing::{debug, info, trace};

use crate::backend::ModelBackend;
use crate::batch::{build_prefill_batch, build_step_batch};
use crate::sampling::{Greedy, SamplingPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPhase {
    Idle,
    Prefilling,
    Generating,
    Done,
    Failed,
}

impl fmt::Display for PromptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Prefilling => "prefilling",
            Self::Generating => "generating",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    MaxTokens,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub text: String,
    pub stop_reason: StopReason,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
}

pub struct GenerationEngine<B: ModelBackend, S: SamplingPolicy = Greedy> {
    backend: B,
    sampler: S,
}

impl<B: ModelBackend> GenerationEngine<B, Greedy> {
    pub fn new(backend: B) -> Self {
        Self::with_sampler(backend, Greedy)
    }
}

impl<B: ModelBackend, S: SamplingPolicy> GenerationEngine<B, S> {
    pub fn with_sampler(backend: B, sampler: S) -> Self {
        Self { backend, sampler }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// One string per prompt, in input order. The first failure aborts the
    /// call; the failed prompt's cache is reset before returning.
    pub fn process_batch<P: AsRef<str>>(
        &mut self,
        prompts: &[P],
        max_tokens: usize,
    ) -> Result<Vec<String>, EngineError> {
        let mut responses = Vec::with_capacity(prompts.len());
        for (index, prompt) in prompts.iter().enumerate() {
            let result = self.generate(index, prompt.as_ref(), max_tokens)?;
            responses.push(result.text);
        }
        Ok(responses)
    }

    /// Like [`process_batch`](Self::process_batch) but every prompt is
    /// attempted and each gets its own outcome.
    pub fn process_each<P: AsRef<str>>(
        &mut self,
        prompts: &[P],
        max_tokens: usize,
    ) -> Vec<Result<GenerationResult, EngineError>> {
        prompts
            .iter()
            .enumerate()
            .map(|(index, prompt)| self.generate(index, prompt.as_ref(), max_tokens))
            .collect()
    }

    pub fn process(&mut self, prompt: &str, max_tokens: usize) -> Result<String, EngineError> {
        self.generate(0, prompt, max_tokens).map(|r| r.text)
    }

    fn generate(
        &mut self,
        index: usize,
        prompt: &str,
        max_tokens: usize,
    ) -> Result<GenerationResult, EngineError> {
        let outcome = self.run_prompt(index, prompt, max_tokens);
        let phase = if outcome.is_ok() {
            PromptPhase::Done
        } else {
            PromptPhase::Failed
        };
        debug!(prompt = index, %phase, "prompt finished");

        self.backend.reset_cache();

        match &outcome {
            Ok(result) => info!(
                prompt = index,
                prompt_tokens = result.prompt_tokens,
                generated = result.generated_tokens,
                stop = ?result.stop_reason,
                "generation complete"
            ),
            Err(e) => info!(prompt = index, error = %e, "generation failed"),
        }
        outcome
    }

    fn run_prompt(
        &mut self,
        index: usize,
        prompt: &str,
        max_tokens: usize,
    ) -> Result<GenerationResult, EngineError> {
        debug!(prompt = index, phase = %PromptPhase::Idle, bytes = prompt.len());
        let tokens = self.backend.tokenize(prompt)?;
        let limit = self.backend.context_length();
        if tokens.len() > limit {
            return Err(EngineError::ContextOverflow {
                tokens: tokens.len(),
                limit,
            });
        }
        let prompt_tokens = tokens.len();

        debug!(prompt = index, phase = %PromptPhase::Prefilling, tokens = prompt_tokens);
        let batch = build_prefill_batch(&tokens)?;
        self.backend.decode(batch)?;

        debug!(prompt = index, phase = %PromptPhase::Generating, max_tokens);
        let eos = self.backend.eos_token_id();
        let mut text = String::new();
        let mut generated = 0usize;

        let stop_reason = loop {
            if generated >= max_tokens {
                break StopReason::MaxTokens;
            }

            let next = self.backend.sample_with(&mut self.sampler)?;
            if next == eos {
                break StopReason::EndOfSequence;
            }

            let piece = self.backend.detokenize(next)?;
            trace!(prompt = index, token = next, piece = %piece);
            text.push_str(&piece);

            self.backend
                .decode(build_step_batch(next, prompt_tokens + generated))?;
            generated += 1;
        };

        Ok(GenerationResult {
            text,
            stop_reason,
            prompt_tokens,
            generated_tokens: generated,
        })
    }
}
