//! HF transformer language model wrapper (candle backend).

use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache, Llama, LlamaConfig};
use tokenizers::Tokenizer;

use crate::error::{AppError, AppResult};
use crate::runtime::device::Accelerator;
use super::{ModelInfo, ModelKind};

/// One role-tagged chat message, formatted through the model's chat
/// template before tokenization.
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

pub struct GenerateParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
}

/// Renders a chat-template-formatted prompt from `messages`. Free function so
/// `LanguageGgufWrapper` can reuse the same formatting without depending on a
/// `LanguageWrapper` instance.
pub fn format_chat(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&format!("<|{}|>\n{}\n", message.role, message.content));
    }
    out.push_str("<|assistant|>\n");
    out
}

struct Loaded {
    device: Device,
    dtype: DType,
    tokenizer: Arc<Tokenizer>,
    model: Arc<Llama>,
    config: Arc<candle_transformers::models::llama::Config>,
    model_id: String,
}

pub struct LanguageWrapper {
    model_id: String,
    state: Mutex<Option<Loaded>>,
}

impl LanguageWrapper {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            state: Mutex::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// Loads tokenizer + weights for a Llama-architecture model from a local
    /// HF-layout directory (`config.json`, `tokenizer.json`,
    /// `model.safetensors`), selecting CUDA/Metal/CPU per
    /// `detect_accelerator`.
    pub async fn load(&self, model_dir: &std::path::Path) -> AppResult<()> {
        let accelerator = crate::runtime::device::detect_accelerator();
        let device = match accelerator {
            Accelerator::Cuda => Device::new_cuda(0).map_err(|e| AppError::FatalToRequest(e.to_string()))?,
            Accelerator::Metal => Device::new_metal(0).map_err(|e| AppError::FatalToRequest(e.to_string()))?,
            Accelerator::Cpu => Device::Cpu,
        };
        let dtype = DType::F32;

        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| AppError::FatalToRequest(format!("tokenizer load failed: {e}")))?;

        let config_str = std::fs::read_to_string(model_dir.join("config.json"))
            .map_err(|e| AppError::FatalToRequest(format!("config read failed: {e}")))?;
        let llama_config: LlamaConfig = serde_json::from_str(&config_str)
            .map_err(|e| AppError::FatalToRequest(format!("config parse failed: {e}")))?;
        let config = llama_config.into_config(false);

        let weights_path = model_dir.join("model.safetensors");
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, &device)
                .map_err(|e| AppError::FatalToRequest(format!("weight load failed: {e}")))?
        };
        let model = Llama::load(vb, &config).map_err(|e| AppError::FatalToRequest(format!("model init failed: {e}")))?;

        let mut state = self.state.lock().unwrap();
        *state = Some(Loaded {
            device,
            dtype,
            tokenizer: Arc::new(tokenizer),
            model: Arc::new(model),
            config: Arc::new(config),
            model_id: self.model_id.clone(),
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
            kind: ModelKind::Language,
            model_id: self.model_id.clone(),
            loaded: state.is_some(),
            context_length: None,
            quantization: None,
            extra: serde_json::json!({ "dtype": format!("{:?}", DType::F32) }),
        }
    }

    /// Renders a chat-template-formatted prompt from `messages`.
    pub fn format_chat(&self, messages: &[ChatMessage]) -> String {
        format_chat(messages)
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

    /// Streams text deltas. The decode loop runs greedy/temperature sampling
    /// token-by-token on a dedicated OS thread (candle's CPU/GPU forward
    /// pass is blocking work, and we don't want it holding up the tokio
    /// executor), pushing each detokenized piece onto a bounded channel.
    pub async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        params: &GenerateParams,
    ) -> AppResult<tokio::sync::mpsc::Receiver<AppResult<String>>> {
        let (tokenizer, model, config, device, dtype) = {
            let state = self.state.lock().unwrap();
            let loaded = state
                .as_ref()
                .ok_or_else(|| AppError::FatalToRequest("language model not loaded".to_string()))?;
            (
                loaded.tokenizer.clone(),
                loaded.model.clone(),
                loaded.config.clone(),
                loaded.device.clone(),
                loaded.dtype,
            )
        };

        let prompt = format_chat(messages);
        let max_tokens = params.max_tokens;
        let temperature = params.temperature;
        let top_p = params.top_p;
        let stop = params.stop.clone();

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        std::thread::spawn(move || {
            if let Err(e) = decode_loop(
                &tokenizer, &model, &config, &device, dtype, &prompt, max_tokens, temperature, top_p, &stop, &tx,
            ) {
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(rx)
    }
}

/// Greedy/temperature-sampled autoregressive decode loop, one token per
/// iteration, stopping at `max_tokens` or the first stop string matched
/// against the text produced so far.
#[allow(clippy::too_many_arguments)]
fn decode_loop(
    tokenizer: &Tokenizer,
    model: &Llama,
    config: &candle_transformers::models::llama::Config,
    device: &Device,
    dtype: DType,
    prompt: &str,
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
    stop: &[String],
    tx: &tokio::sync::mpsc::Sender<AppResult<String>>,
) -> AppResult<()> {
    let encoding = tokenizer
        .encode(prompt, true)
        .map_err(|e| AppError::FatalToRequest(format!("tokenization failed: {e}")))?;
    let mut tokens = encoding.get_ids().to_vec();

    let mut cache =
        Cache::new(true, dtype, config, device).map_err(|e| AppError::FatalToRequest(format!("kv cache init failed: {e}")))?;
    let mut logits_processor = LogitsProcessor::new(1, Some(temperature as f64), Some(top_p as f64));

    let mut produced = String::new();
    let mut index_pos = 0usize;

    for index in 0..max_tokens {
        let (context_size, context_index) = if index > 0 { (1, index_pos) } else { (tokens.len(), 0) };
        let ctxt = &tokens[tokens.len().saturating_sub(context_size)..];
        let input = Tensor::new(ctxt, device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| AppError::FatalToRequest(format!("tensor build failed: {e}")))?;
        let logits = model
            .forward(&input, context_index, &mut cache)
            .map_err(|e| AppError::FatalToRequest(format!("forward pass failed: {e}")))?;
        let logits = logits
            .squeeze(0)
            .map_err(|e| AppError::FatalToRequest(format!("logits reshape failed: {e}")))?;
        index_pos += ctxt.len();

        let next_token = logits_processor
            .sample(&logits)
            .map_err(|e| AppError::FatalToRequest(format!("sampling failed: {e}")))?;
        tokens.push(next_token);

        let piece = tokenizer
            .decode(&[next_token], true)
            .map_err(|e| AppError::FatalToRequest(format!("detokenize failed: {e}")))?;
        produced.push_str(&piece);
        if tx.blocking_send(Ok(piece)).is_err() {
            return Ok(());
        }
        if stop.iter().any(|s| !s.is_empty() && produced.ends_with(s.as_str())) {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unload_clears_state() {
        let wrapper = LanguageWrapper::new("org/model");
        assert!(!wrapper.is_loaded());
        wrapper.unload();
        assert!(!wrapper.is_loaded());
    }

    #[test]
    fn format_chat_includes_every_message() {
        let wrapper = LanguageWrapper::new("org/model");
        let messages = vec![
            ChatMessage { role: "system".to_string(), content: "be terse".to_string() },
            ChatMessage { role: "user".to_string(), content: "hi".to_string() },
        ];
        let prompt = wrapper.format_chat(&messages);
        assert!(prompt.contains("be terse"));
        assert!(prompt.contains("hi"));
        assert!(prompt.ends_with("<|assistant|>\n"));
    }
}
