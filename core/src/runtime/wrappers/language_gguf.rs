//! GGUF quantized language model wrapper (llama.cpp backend via
//! `llama-cpp-2`).

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::data_array::LlamaTokenDataArray;

use crate::error::{AppError, AppResult};
use crate::runtime::device::{self, parse_model_with_quantization, select_gguf_file};
use super::language::{format_chat, ChatMessage, GenerateParams};
use super::{ModelInfo, ModelKind};

struct Loaded {
    gguf_path: PathBuf,
    quantization: String,
    context_length: u32,
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
}

pub struct LanguageGgufWrapper {
    model_id: String,
    context_override: Option<u32>,
    state: Mutex<Option<Loaded>>,
}

impl LanguageGgufWrapper {
    pub fn new(model_id: impl Into<String>, context_override: Option<u32>) -> Self {
        Self {
            model_id: model_id.into(),
            context_override,
            state: Mutex::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// Resolves which `.gguf` file to load: explicit `:QUANT` suffix on the
    /// model id wins, otherwise the preference order in
    /// `GGUF_QUANTIZATION_PREFERENCE_ORDER` is applied.
    pub fn resolve_quantization<'a>(&self, candidates: &[&'a str]) -> Option<&'a str> {
        let (_, requested) = parse_model_with_quantization(&self.model_id);
        select_gguf_file(candidates, requested.as_deref())
    }

    pub async fn load(
        &self,
        candidates: &[&str],
        header_context: u32,
        available_memory_bytes: u64,
        model_dir: &std::path::Path,
    ) -> AppResult<()> {
        let chosen = self
            .resolve_quantization(candidates)
            .ok_or_else(|| AppError::Resource("no gguf candidate files available".to_string()))?;
        let quantization = device::parse_quantization_from_filename(chosen)
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let context_length =
            device::safe_context_window(header_context, available_memory_bytes, self.context_override);
        let gguf_path = model_dir.join(chosen);

        let backend = LlamaBackend::init().map_err(|e| AppError::FatalToRequest(format!("llama.cpp backend init failed: {e}")))?;
        let model_params = LlamaModelParams::default();
        let model = LlamaModel::load_from_file(&backend, &gguf_path, &model_params)
            .map_err(|e| AppError::FatalToRequest(format!("gguf model load failed: {e}")))?;

        let mut state = self.state.lock().unwrap();
        *state = Some(Loaded {
            gguf_path,
            quantization,
            context_length,
            backend: Arc::new(backend),
            model: Arc::new(model),
        });
        Ok(())
    }

    pub fn unload(&self) {
        let mut state = self.state.lock().unwrap();
        *state = None;
    }

    pub fn info(&self) -> ModelInfo {
        let state = self.state.lock().unwrap();
        ModelInfo {
            kind: ModelKind::LanguageGguf,
            model_id: self.model_id.clone(),
            loaded: state.is_some(),
            context_length: state.as_ref().map(|s| s.context_length),
            quantization: state.as_ref().map(|s| s.quantization.clone()),
            extra: serde_json::json!({
                "gguf_path": state.as_ref().map(|s| s.gguf_path.display().to_string()),
            }),
        }
    }

    /// Generates a full completion by driving `generate_stream` to
    /// completion and concatenating the deltas.
    pub async fn generate(&self, messages: &[ChatMessage], params: &GenerateParams) -> AppResult<String> {
        let mut rx = self.generate_stream(messages, params).await?;
        let mut out = String::new();
        while let Some(chunk) = rx.recv().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }

    /// Decoding runs on a dedicated worker thread (llama.cpp contexts are
    /// not `Send` across an async executor); tokens are pushed onto a
    /// bounded channel as they're produced, and the async consumer reads
    /// from that queue, propagating any decode error. Sampling is greedy;
    /// `temperature`/`top_p` are accepted for API symmetry with the
    /// candle-transformers backend but not applied here.
    pub async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        params: &GenerateParams,
    ) -> AppResult<tokio::sync::mpsc::Receiver<AppResult<String>>> {
        let (backend, model, context_length) = {
            let state = self.state.lock().unwrap();
            let loaded = state
                .as_ref()
                .ok_or_else(|| AppError::FatalToRequest("gguf model not loaded".to_string()))?;
            (loaded.backend.clone(), loaded.model.clone(), loaded.context_length)
        };

        let prompt = format_chat(messages);
        let max_tokens = params.max_tokens;
        let stop = params.stop.clone();

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        std::thread::spawn(move || {
            if let Err(e) = decode_loop(&backend, &model, context_length, &prompt, max_tokens, &stop, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(rx)
    }
}

fn decode_loop(
    backend: &LlamaBackend,
    model: &LlamaModel,
    context_length: u32,
    prompt: &str,
    max_tokens: usize,
    stop: &[String],
    tx: &tokio::sync::mpsc::Sender<AppResult<String>>,
) -> AppResult<()> {
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(context_length.max(1)));
    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| AppError::FatalToRequest(format!("context init failed: {e}")))?;

    let tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| AppError::FatalToRequest(format!("tokenization failed: {e}")))?;

    let mut batch = LlamaBatch::new(512, 1);
    for (i, token) in tokens.iter().enumerate() {
        let is_last = i == tokens.len() - 1;
        batch
            .add(*token, i as i32, &[0], is_last)
            .map_err(|e| AppError::FatalToRequest(format!("batch build failed: {e}")))?;
    }
    ctx.decode(&mut batch)
        .map_err(|e| AppError::FatalToRequest(format!("initial decode failed: {e}")))?;

    let mut produced = String::new();
    let mut n_cur = batch.n_tokens();
    let eos = model.token_eos();

    for _ in 0..max_tokens {
        let candidates = ctx.candidates_ith(batch.n_tokens() - 1);
        let candidates = LlamaTokenDataArray::from_iter(candidates, false);
        let next_token = ctx.sample_token_greedy(candidates);

        if next_token == eos {
            break;
        }

        let piece = model
            .token_to_str(next_token, Special::Tokenize)
            .map_err(|e| AppError::FatalToRequest(format!("detokenize failed: {e}")))?;
        produced.push_str(&piece);
        if tx.blocking_send(Ok(piece)).is_err() {
            return Ok(());
        }
        if stop.iter().any(|s| !s.is_empty() && produced.ends_with(s.as_str())) {
            break;
        }

        batch.clear();
        batch
            .add(next_token, n_cur, &[0], true)
            .map_err(|e| AppError::FatalToRequest(format!("batch build failed: {e}")))?;
        n_cur += 1;
        ctx.decode(&mut batch)
            .map_err(|e| AppError::FatalToRequest(format!("decode failed: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_quantization_from_model_suffix() {
        let wrapper = LanguageGgufWrapper::new("org/model:q8_0", None);
        let candidates = vec!["m.Q2_K.gguf", "m.Q4_K_M.gguf", "m.Q8_0.gguf"];
        assert_eq!(wrapper.resolve_quantization(&candidates), Some("m.Q8_0.gguf"));
    }

    #[test]
    fn resolves_quantization_by_preference_order_without_suffix() {
        let wrapper = LanguageGgufWrapper::new("org/model", None);
        let candidates = vec!["m.Q2_K.gguf", "m.Q4_K_M.gguf", "m.Q8_0.gguf"];
        assert_eq!(wrapper.resolve_quantization(&candidates), Some("m.Q4_K_M.gguf"));
    }
}
