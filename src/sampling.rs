use crate::backend::TokenId;

/// Picks the next token from a row of logits.
///
/// The generation loop only ever talks to this trait, so a new strategy is a
/// new implementor, not a change to the loop.
pub trait SamplingPolicy {
    /// Returns `None` only for an empty logits row.
    fn select(&mut self, logits: &[f32]) -> Option<TokenId>;
}

/// Highest logit wins; ties go to the lowest token id.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greedy;

impl SamplingPolicy for Greedy {
    fn select(&mut self, logits: &[f32]) -> Option<TokenId> {
        argmax(logits)
    }
}

/// Linear scan in ascending id order keeping the first strict maximum.
/// NaN never compares greater, so a row of NaN or `-inf` yields id 0.
pub fn argmax(logits: &[f32]) -> Option<TokenId> {
    if logits.is_empty() {
        return None;
    }

    let mut best: TokenId = 0;
    let mut best_logit = f32::NEG_INFINITY;
    for (id, &logit) in logits.iter().enumerate() {
        if logit > best_logit {
            best_logit = logit;
            best = id as TokenId;
        }
    }
    Some(best)
}
