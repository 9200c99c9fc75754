use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;
use tracing::info;

use crate::engine::EngineError;
use crate::prompting::PromptFamily;

use super::TokenId;

pub(super) fn resolve_tokenizer_path(
    model_path: &str,
    tokenizer_hint: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(hint) = tokenizer_hint {
        if hint.exists() {
            return Some(hint.to_path_buf());
        }
    }

    let model_path = Path::new(model_path);
    let parent_dir = model_path.parent().unwrap_or(Path::new("."));
    let local_tok_path = parent_dir.join("tokenizer.json");
    if local_tok_path.exists() {
        return Some(local_tok_path);
    }

    let root_tok_path = Path::new("tokenizer.json");
    if root_tok_path.exists() {
        return Some(root_tok_path.to_path_buf());
    }

    let models_tok_path = Path::new("models").join("tokenizer.json");
    if models_tok_path.exists() {
        return Some(models_tok_path);
    }

    None
}

pub(super) fn load_tokenizer(
    model_path: &str,
    tokenizer_hint: Option<&Path>,
    tokenizer_repo: Option<&str>,
) -> Result<Tokenizer, EngineError> {
    let path = match resolve_tokenizer_path(model_path, tokenizer_hint) {
        Some(path) => path,
        None => {
            let repo = tokenizer_repo.ok_or_else(|| {
                EngineError::model_load(model_path, "tokenizer.json not found next to the model")
            })?;
            info!(repo, "tokenizer.json not found locally, fetching from HF hub");
            let api = hf_hub::api::sync::Api::new()
                .map_err(|e| EngineError::model_load(model_path, e))?;
            api.model(repo.to_string())
                .get("tokenizer.json")
                .map_err(|e| EngineError::model_load(model_path, e))?
        }
    };

    info!(path = %path.display(), "using tokenizer");
    Tokenizer::from_file(&path).map_err(|e| EngineError::model_load(model_path, e))
}

/// Chat-template turn terminator, for families whose template has one.
fn end_of_turn_marker(family: PromptFamily) -> Option<&'static str> {
    match family {
        PromptFamily::Llama => Some("<|eot_id|>"),
        PromptFamily::Qwen => Some("<|im_end|>"),
        PromptFamily::Mistral | PromptFamily::Unknown => None,
    }
}

fn end_of_text_markers(family: PromptFamily) -> &'static [&'static str] {
    match family {
        PromptFamily::Llama => &["<|end_of_text|>", "</s>"],
        PromptFamily::Qwen => &["<|endoftext|>", "</s>"],
        PromptFamily::Mistral => &["</s>", "<|end_of_text|>"],
        PromptFamily::Unknown => &["<|end_of_text|>", "</s>", "<|endoftext|>", "<|im_end|>"],
    }
}

/// The token generation stops on. Prompts are always chat-rendered, so the
/// family's end-of-turn marker wins when the tokenizer has it; otherwise the
/// GGUF eos id, then the family's end-of-text markers.
pub(super) fn resolve_eos_token(
    tokenizer: &Tokenizer,
    family: PromptFamily,
    gguf_eos: Option<TokenId>,
) -> Result<TokenId, String> {
    if let Some(eot) = end_of_turn_marker(family).and_then(|m| tokenizer.token_to_id(m)) {
        return Ok(eot);
    }
    if let Some(eos) = gguf_eos {
        return Ok(eos);
    }

    let candidates = end_of_text_markers(family);
    candidates
        .iter()
        .find_map(|marker| tokenizer.token_to_id(marker))
        .ok_or_else(|| {
            let mut wanted: Vec<&str> = end_of_turn_marker(family).into_iter().collect();
            wanted.extend_from_slice(candidates);
            format!(
                "Tokenizer/model incompatibility: {:?} requires one of {}.",
                family,
                wanted.join(", ")
            )
        })
}

/// Incremental detokenizer. Decodes a sliding window of recent tokens and
/// emits only the newly completed text, so word-boundary spaces survive and a
/// multi-byte character split across tokens is emitted once it is whole.
#[derive(Debug, Default)]
pub(super) struct TokenStream {
    tokens: Vec<TokenId>,
    prefix_offset: usize,
    read_offset: usize,
}

impl TokenStream {
    pub(super) fn next(&mut self, tokenizer: &Tokenizer, token: TokenId) -> Result<String, String> {
        let prefix_text = tokenizer
            .decode(&self.tokens[self.prefix_offset..self.read_offset], true)
            .map_err(|e| e.to_string())?;
        self.tokens.push(token);
        let new_text = tokenizer
            .decode(&self.tokens[self.prefix_offset..], true)
            .map_err(|e| e.to_string())?;

        if new_text.len() <= prefix_text.len() || new_text.ends_with('\u{FFFD}') {
            return Ok(String::new());
        }

        let fragment = match new_text.strip_prefix(prefix_text.as_str()) {
            Some(suffix) => suffix.to_string(),
            // Re-decoding changed earlier text; skip by characters instead.
            None => new_text.chars().skip(prefix_text.chars().count()).collect(),
        };
        self.prefix_offset = self.read_offset;
        self.read_offset = self.tokens.len();
        Ok(fragment)
    }

    pub(super) fn clear(&mut self) {
        self.tokens.clear();
        self.prefix_offset = 0;
        self.read_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn word_tokenizer(vocab: &str) -> Tokenizer {
        let json = format!(
            r#"{{
                "version": "1.0",
                "truncation": null,
                "padding": null,
                "added_tokens": [],
                "normalizer": null,
                "pre_tokenizer": {{ "type": "Whitespace" }},
                "post_processor": null,
                "decoder": null,
                "model": {{ "type": "WordLevel", "vocab": {{ {} }}, "unk_token": "[UNK]" }}
            }}"#,
            vocab
        );
        Tokenizer::from_str(&json).expect("word level tokenizer")
    }

    fn chat_vocab() -> Tokenizer {
        word_tokenizer(r#""[UNK]": 0, "</s>": 1, "<|im_end|>": 2, "hello": 3, "world": 4"#)
    }

    #[test]
    fn end_of_turn_marker_beats_metadata_eos() {
        let tok = word_tokenizer(r#""[UNK]": 0, "<|end_of_text|>": 1, "<|eot_id|>": 2"#);
        assert_eq!(resolve_eos_token(&tok, PromptFamily::Llama, Some(1)), Ok(2));

        let qwen = chat_vocab();
        assert_eq!(resolve_eos_token(&qwen, PromptFamily::Qwen, Some(151643)), Ok(2));
    }

    #[test]
    fn metadata_eos_is_used_without_an_end_of_turn_marker() {
        let tok = chat_vocab();
        assert_eq!(resolve_eos_token(&tok, PromptFamily::Mistral, Some(151645)), Ok(151645));
        assert_eq!(resolve_eos_token(&tok, PromptFamily::Llama, Some(7)), Ok(7));
    }

    #[test]
    fn family_markers_are_searched_in_order() {
        let tok = chat_vocab();
        assert_eq!(resolve_eos_token(&tok, PromptFamily::Qwen, None), Ok(2));
        assert_eq!(resolve_eos_token(&tok, PromptFamily::Mistral, None), Ok(1));
        assert_eq!(resolve_eos_token(&tok, PromptFamily::Llama, None), Ok(1));
    }

    #[test]
    fn missing_markers_are_reported() {
        let tok = word_tokenizer(r#""[UNK]": 0, "hello": 1"#);
        let err = resolve_eos_token(&tok, PromptFamily::Llama, None).expect_err("no eos");
        assert!(err.contains("<|eot_id|>"));
    }

    #[test]
    fn stream_emits_each_new_word() {
        let tok = chat_vocab();
        let mut stream = TokenStream::default();
        let first = stream.next(&tok, 3).expect("decode hello");
        let second = stream.next(&tok, 4).expect("decode world");
        assert_eq!(first, "hello");
        assert_eq!(format!("{}{}", first, second), "hello world");

        stream.clear();
        assert_eq!(stream.next(&tok, 4).expect("decode after clear"), "world");
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time ok")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "agentic_review_tok_{}_{}_{}",
            tag,
            std::process::id(),
            ts
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn hint_path_is_preferred_when_it_exists() {
        let dir = scratch_dir("hint");
        let hint = dir.join("custom-tokenizer.json");
        std::fs::write(&hint, b"{}").expect("write hint");
        std::fs::write(dir.join("tokenizer.json"), b"{}").expect("write sibling");

        let model = dir.join("model.gguf");
        let resolved = resolve_tokenizer_path(&model.to_string_lossy(), Some(&hint));
        assert_eq!(resolved, Some(hint));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_hint_falls_back_to_the_model_directory() {
        let dir = scratch_dir("sibling");
        let sibling = dir.join("tokenizer.json");
        std::fs::write(&sibling, b"{}").expect("write sibling");

        let model = dir.join("model.gguf");
        let missing_hint = dir.join("not-there.json");
        let resolved = resolve_tokenizer_path(&model.to_string_lossy(), Some(&missing_hint));
        assert_eq!(resolved, Some(sibling.clone()));
        assert_eq!(resolve_tokenizer_path(&model.to_string_lossy(), None), Some(sibling));

        let _ = std::fs::remove_dir_all(dir);
    }
}
