//! Text encoder (embedding) model wrapper (candle BERT backend).

use std::sync::Mutex;

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::{PaddingParams, Tokenizer};

use crate::error::{AppError, AppResult};
use super::{ModelInfo, ModelKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pooling {
    Mean,
    Cls,
}

struct Loaded {
    tokenizer: Tokenizer,
    model: BertModel,
    device: Device,
    dim: usize,
}

pub struct EncoderWrapper {
    model_id: String,
    pooling: Pooling,
    max_batch_size: usize,
    state: Mutex<Option<Loaded>>,
}

impl EncoderWrapper {
    pub fn new(model_id: impl Into<String>, pooling: Pooling, max_batch_size: usize) -> Self {
        Self {
            model_id: model_id.into(),
            pooling,
            max_batch_size,
            state: Mutex::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// Loads tokenizer + weights for a BERT-architecture encoder from a
    /// local HF-layout directory (`config.json`, `tokenizer.json`,
    /// `model.safetensors`). `dim` is the caller-declared output embedding
    /// width, used only for reporting; the pooled vector's actual length is
    /// the model's own hidden size.
    pub async fn load(&self, model_dir: &std::path::Path, dim: usize) -> AppResult<()> {
        let mut tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| AppError::FatalToRequest(format!("tokenizer load failed: {e}")))?;
        tokenizer.with_padding(Some(PaddingParams::default()));

        let config_str = std::fs::read_to_string(model_dir.join("config.json"))
            .map_err(|e| AppError::FatalToRequest(format!("config read failed: {e}")))?;
        let config: BertConfig = serde_json::from_str(&config_str)
            .map_err(|e| AppError::FatalToRequest(format!("config parse failed: {e}")))?;

        let device = Device::Cpu;
        let weights_path = model_dir.join("model.safetensors");
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)
                .map_err(|e| AppError::FatalToRequest(format!("weight load failed: {e}")))?
        };
        let model = BertModel::load(vb, &config).map_err(|e| AppError::FatalToRequest(format!("model init failed: {e}")))?;

        let mut state = self.state.lock().unwrap();
        *state = Some(Loaded { tokenizer, model, device, dim });
        Ok(())
    }

    pub fn unload(&self) {
        *self.state.lock().unwrap() = None;
    }

    pub fn info(&self) -> ModelInfo {
        let state = self.state.lock().unwrap();
        ModelInfo {
            kind: ModelKind::Encoder,
            model_id: self.model_id.clone(),
            loaded: state.is_some(),
            context_length: None,
            quantization: None,
            extra: serde_json::json!({
                "pooling": format!("{:?}", self.pooling),
                "dim": state.as_ref().map(|s| s.dim),
            }),
        }
    }

    /// Embeds `texts`, splitting into batches of at most `max_batch_size`
    /// and running one BERT forward pass per batch.
    pub async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let state = self.state.lock().unwrap();
        let loaded = state
            .as_ref()
            .ok_or_else(|| AppError::FatalToRequest("encoder not loaded".to_string()))?;

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.max_batch_size.max(1)) {
            out.extend(self.embed_batch(loaded, batch)?);
        }
        Ok(out)
    }

    fn embed_batch(&self, loaded: &Loaded, batch: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let encodings = loaded
            .tokenizer
            .encode_batch(batch.iter().map(String::as_str).collect::<Vec<_>>(), true)
            .map_err(|e| AppError::FatalToRequest(format!("tokenization failed: {e}")))?;

        let token_ids: Vec<Vec<u32>> = encodings.iter().map(|e| e.get_ids().to_vec()).collect();
        let attention_mask: Vec<Vec<u32>> = encodings.iter().map(|e| e.get_attention_mask().to_vec()).collect();

        let token_ids = Tensor::new(token_ids, &loaded.device)
            .map_err(|e| AppError::FatalToRequest(format!("input tensor build failed: {e}")))?;
        let attention_mask = Tensor::new(attention_mask, &loaded.device)
            .map_err(|e| AppError::FatalToRequest(format!("mask tensor build failed: {e}")))?;
        let token_type_ids = token_ids
            .zeros_like()
            .map_err(|e| AppError::FatalToRequest(format!("segment tensor build failed: {e}")))?;

        let hidden = loaded
            .model
            .forward(&token_ids, &token_type_ids, Some(&attention_mask))
            .map_err(|e| AppError::FatalToRequest(format!("forward pass failed: {e}")))?;

        let pooled = match self.pooling {
            Pooling::Mean => mean_pool(&hidden, &attention_mask)?,
            Pooling::Cls => hidden
                .i((.., 0, ..))
                .map_err(|e| AppError::FatalToRequest(format!("cls pooling failed: {e}")))?,
        };
        let normalized = l2_normalize(&pooled)?;

        let (rows, dim) = normalized
            .dims2()
            .map_err(|e| AppError::FatalToRequest(format!("pooled tensor shape error: {e}")))?;
        let flat = normalized
            .to_vec2::<f32>()
            .map_err(|e| AppError::FatalToRequest(format!("pooled tensor read failed: {e}")))?;
        debug_assert_eq!(flat.len(), rows);
        debug_assert!(flat.first().map(|v| v.len() == dim).unwrap_or(true));
        Ok(flat)
    }
}

fn mean_pool(hidden: &Tensor, attention_mask: &Tensor) -> AppResult<Tensor> {
    let mask = attention_mask
        .to_dtype(hidden.dtype())
        .map_err(|e| AppError::FatalToRequest(format!("mask dtype cast failed: {e}")))?
        .unsqueeze(2)
        .map_err(|e| AppError::FatalToRequest(format!("mask reshape failed: {e}")))?;
    let masked = hidden
        .broadcast_mul(&mask)
        .map_err(|e| AppError::FatalToRequest(format!("mask multiply failed: {e}")))?;
    let summed = masked
        .sum(1)
        .map_err(|e| AppError::FatalToRequest(format!("sum pooling failed: {e}")))?;
    let counts = mask
        .sum(1)
        .map_err(|e| AppError::FatalToRequest(format!("mask sum failed: {e}")))?;
    summed
        .broadcast_div(&counts)
        .map_err(|e| AppError::FatalToRequest(format!("mean pooling divide failed: {e}")))
}

fn l2_normalize(tensor: &Tensor) -> AppResult<Tensor> {
    let norm = tensor
        .sqr()
        .and_then(|t| t.sum_keepdim(1))
        .and_then(|t| t.sqrt())
        .map_err(|e| AppError::FatalToRequest(format!("norm computation failed: {e}")))?;
    tensor
        .broadcast_div(&norm)
        .map_err(|e| AppError::FatalToRequest(format!("normalization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_reports_unloaded_before_load() {
        let wrapper = EncoderWrapper::new("org/encoder", Pooling::Mean, 32);
        assert!(!wrapper.info().loaded);
    }
}
