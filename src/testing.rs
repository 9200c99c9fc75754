//! Deterministic stand-ins for a model and an HTTP server.
//!
//! In [`ScriptedBackend`] words become tokens, and the "model" predicts the
//! next token from a hash of everything in its cache, so anything left over
//! from an earlier prompt changes the output.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{ModelBackend, TokenId};
use crate::batch::Batch;
use crate::engine::EngineError;
use crate::remote::{HttpReply, HttpTransport, RemoteError, Sleeper};

const FIRST_WORD_ID: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedBatch {
    pub positions: Vec<usize>,
    pub logits: Vec<bool>,
    pub capacity: usize,
}

pub struct ScriptedBackend {
    vocab: usize,
    eos: TokenId,
    n_ctx: usize,
    cache: Vec<TokenId>,
    logits: Option<Vec<f32>>,
    steps_since_prefill: usize,
    eos_after: Option<usize>,
    fail_decode_at: Option<usize>,
    fail_tokenize_on: Option<String>,
    tolerate_stale: bool,
    decode_calls: usize,
    tokenize_calls: Cell<usize>,
    resets: usize,
    batch_log: Vec<LoggedBatch>,
}

impl ScriptedBackend {
    pub fn new(vocab: usize, eos: TokenId, n_ctx: usize) -> Self {
        assert!(vocab > FIRST_WORD_ID as usize + 1, "vocab too small");
        assert!(eos < FIRST_WORD_ID, "eos must not collide with word ids");
        Self {
            vocab,
            eos,
            n_ctx,
            cache: Vec::new(),
            logits: None,
            steps_since_prefill: 0,
            eos_after: None,
            fail_decode_at: None,
            fail_tokenize_on: None,
            tolerate_stale: false,
            decode_calls: 0,
            tokenize_calls: Cell::new(0),
            resets: 0,
            batch_log: Vec::new(),
        }
    }

    /// Predict EOS once `steps` generated tokens have been decoded.
    pub fn emit_eos_after(&mut self, steps: usize) {
        self.eos_after = Some(steps);
    }

    /// Fail the `call`-th decode (1-based, counted over the backend's life).
    pub fn fail_decode_at(&mut self, call: usize) {
        self.fail_decode_at = Some(call);
    }

    pub fn fail_tokenize_on(&mut self, needle: &str) {
        self.fail_tokenize_on = Some(needle.to_string());
    }

    /// Accept batches that do not continue the cache, the way a real
    /// backend silently mixes state when nobody clears it.
    pub fn tolerate_stale_cache(&mut self) {
        self.tolerate_stale = true;
    }

    /// Replaces the current logits row, padding included.
    pub fn override_logits(&mut self, row: Vec<f32>) {
        self.logits = Some(row);
    }

    pub fn decode_raw(&mut self, tokens: &[TokenId]) {
        self.cache.extend_from_slice(tokens);
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls
    }

    pub fn tokenize_calls(&self) -> usize {
        self.tokenize_calls.get()
    }

    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn batch_log(&self) -> &[LoggedBatch] {
        &self.batch_log
    }

    fn word_id(&self, word: &str) -> TokenId {
        let span = (self.vocab as u64) - u64::from(FIRST_WORD_ID);
        FIRST_WORD_ID + (fnv1a(word.bytes().map(u64::from)) % span) as TokenId
    }

    fn predict(&self) -> TokenId {
        if let Some(after) = self.eos_after {
            if self.steps_since_prefill >= after {
                return self.eos;
            }
        }
        let span = (self.vocab as u64) - u64::from(FIRST_WORD_ID);
        FIRST_WORD_ID + (fnv1a(self.cache.iter().map(|&t| u64::from(t))) % span) as TokenId
    }
}

fn fnv1a(items: impl Iterator<Item = u64>) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for item in items {
        hash ^= item;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl ModelBackend for ScriptedBackend {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        self.tokenize_calls.set(self.tokenize_calls.get() + 1);
        if let Some(needle) = &self.fail_tokenize_on {
            if text.contains(needle.as_str()) {
                return Err(EngineError::Tokenize(format!("cannot tokenize '{}'", needle)));
            }
        }
        let tokens: Vec<TokenId> = text.split_whitespace().map(|w| self.word_id(w)).collect();
        if tokens.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }
        Ok(tokens)
    }

    fn decode(&mut self, batch: Batch) -> Result<(), EngineError> {
        self.decode_calls += 1;
        if self.fail_decode_at == Some(self.decode_calls) {
            return Err(EngineError::decode("scripted decode failure"));
        }
        if !self.tolerate_stale && batch.start_pos() != self.cache.len() {
            return Err(EngineError::decode(format!(
                "batch starts at {} but cache holds {}",
                batch.start_pos(),
                self.cache.len()
            )));
        }
        if batch.end_pos() > self.n_ctx {
            return Err(EngineError::decode("context window full"));
        }

        self.batch_log.push(LoggedBatch {
            positions: batch.entries().iter().map(|e| e.pos).collect(),
            logits: batch.entries().iter().map(|e| e.logits).collect(),
            capacity: batch.len(),
        });

        if batch.start_pos() == 0 {
            self.steps_since_prefill = 0;
        } else {
            self.steps_since_prefill += 1;
        }
        self.cache.extend(batch.tokens());

        self.logits = if batch.wants_any_logits() {
            let mut row = vec![0.0f32; self.vocab];
            row[self.predict() as usize] = 1.0;
            Some(row)
        } else {
            None
        };
        Ok(())
    }

    fn logits(&self) -> Result<&[f32], EngineError> {
        self.logits
            .as_deref()
            .ok_or_else(|| EngineError::decode("no logits"))
    }

    fn detokenize(&mut self, token: TokenId) -> Result<String, EngineError> {
        Ok(format!("t{} ", token))
    }

    fn reset_cache(&mut self) {
        self.cache.clear();
        self.logits = None;
        self.steps_since_prefill = 0;
        self.resets += 1;
    }

    fn vocabulary_size(&self) -> usize {
        self.vocab
    }

    fn eos_token_id(&self) -> TokenId {
        self.eos
    }

    fn context_length(&self) -> usize {
        self.n_ctx
    }
}

/// Replays canned replies in order and records every POSTed body.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<HttpReply, RemoteError>>>,
    posts: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Result<HttpReply, RemoteError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            posts: Mutex::new(Vec::new()),
        })
    }

    pub fn posts(&self) -> Vec<serde_json::Value> {
        self.posts.lock().expect("posts lock").clone()
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().expect("posts lock").len()
    }

    fn next(&self) -> Result<HttpReply, RemoteError> {
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Ok(reply(500, "script exhausted")))
    }
}

impl HttpTransport for Arc<ScriptedTransport> {
    fn get(&self, _url: &str, _timeout: Duration) -> Result<HttpReply, RemoteError> {
        self.next()
    }

    fn post_json(
        &self,
        _url: &str,
        body: &serde_json::Value,
        _timeout: Duration,
    ) -> Result<HttpReply, RemoteError> {
        self.posts.lock().expect("posts lock").push(body.clone());
        self.next()
    }
}

pub fn reply(status: u16, body: &str) -> HttpReply {
    HttpReply {
        status,
        body: body.to_string(),
    }
}

pub fn completion(text: &str) -> HttpReply {
    reply(
        200,
        &serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": text}}]
        })
        .to_string(),
    )
}

/// A sleeper that records the delays it was asked for instead of waiting.
pub fn recording_sleeper() -> (Sleeper, Arc<Mutex<Vec<Duration>>>) {
    let delays = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&delays);
    let sleeper: Sleeper = Arc::new(move |d| recorded.lock().expect("delays lock").push(d));
    (sleeper, delays)
}
