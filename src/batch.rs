//! Decode batches.
//!
//! A [`Batch`] is built for exactly one `decode` call. Its storage is a boxed
//! slice, so the declared capacity is the number of tokens it carries, and
//! `ModelBackend::decode` takes it by value so it is dropped as soon as the
//! call returns, on success or error.

use crate::backend::TokenId;
use crate::engine::EngineError;

pub type SeqId = i32;

/// The only sequence id used: prompts are never interleaved.
pub const PRIMARY_SEQ: SeqId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: usize,
    pub seq_id: SeqId,
    pub logits: bool,
}

#[derive(Debug)]
pub struct Batch {
    entries: Box<[BatchEntry]>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn tokens(&self) -> Vec<TokenId> {
        self.entries.iter().map(|e| e.token).collect()
    }

    /// Position of the first token, i.e. the cache length the batch expects.
    pub fn start_pos(&self) -> usize {
        self.entries.first().map(|e| e.pos).unwrap_or(0)
    }

    /// Position one past the last token.
    pub fn end_pos(&self) -> usize {
        self.entries.last().map(|e| e.pos + 1).unwrap_or(0)
    }

    pub fn positions_are_contiguous(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[1].pos == pair[0].pos + 1)
    }

    /// True when logits are requested for the last token and no other.
    pub fn wants_last_logits_only(&self) -> bool {
        match self.entries.split_last() {
            Some((last, rest)) => last.logits && rest.iter().all(|e| !e.logits),
            None => false,
        }
    }

    pub fn wants_any_logits(&self) -> bool {
        self.entries.iter().any(|e| e.logits)
    }
}

#[cfg(test)]
impl Batch {
    /// Arbitrary layouts, for exercising decode-side validation.
    pub(crate) fn from_entries(entries: Vec<BatchEntry>) -> Self {
        Self {
            entries: entries.into_boxed_slice(),
        }
    }
}

/// Prompt prefill: positions `0..n`, one sequence, logits only for the last
/// token.
pub fn build_prefill_batch(tokens: &[TokenId]) -> Result<Batch, EngineError> {
    if tokens.is_empty() {
        return Err(EngineError::BatchCapacity(
            "prefill batch needs at least one token".to_string(),
        ));
    }

    let last = tokens.len() - 1;
    let entries = tokens
        .iter()
        .enumerate()
        .map(|(i, &token)| BatchEntry {
            token,
            pos: i,
            seq_id: PRIMARY_SEQ,
            logits: i == last,
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();

    Ok(Batch { entries })
}

/// Single generated token at `pos`, logits required.
pub fn build_step_batch(token: TokenId, pos: usize) -> Batch {
    Batch {
        entries: Box::new([BatchEntry {
            token,
            pos,
            seq_id: PRIMARY_SEQ,
            logits: true,
        }]),
    }
}
