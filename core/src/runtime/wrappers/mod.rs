//! Model wrappers: one concrete type per model kind, behind a narrow common
//! surface (`load`, `unload`, `info`). Kind-specific operations
//! (`generate`, `embed`, `recognize`, `fit`/`score`) live on the concrete
//! type — callers downcast through [`ModelHandle`] rather than relying on
//! a fat shared trait.

pub mod anomaly;
pub mod encoder;
pub mod language;
pub mod language_gguf;
pub mod ocr;

use serde::Serialize;

use crate::runtime::cache::Unloadable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Language,
    LanguageGguf,
    Encoder,
    Ocr,
    Anomaly,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub kind: ModelKind,
    pub model_id: String,
    pub loaded: bool,
    pub context_length: Option<u32>,
    pub quantization: Option<String>,
    pub extra: serde_json::Value,
}

/// The cache holds one of these per `kind:id` key. Dispatch to the
/// concrete wrapper's own operations by matching on the variant.
pub enum ModelHandle {
    Language(language::LanguageWrapper),
    LanguageGguf(language_gguf::LanguageGgufWrapper),
    Encoder(encoder::EncoderWrapper),
    Ocr(ocr::OcrWrapper),
    Anomaly(anomaly::AnomalyWrapper),
}

impl ModelHandle {
    pub fn info(&self) -> ModelInfo {
        match self {
            ModelHandle::Language(w) => w.info(),
            ModelHandle::LanguageGguf(w) => w.info(),
            ModelHandle::Encoder(w) => w.info(),
            ModelHandle::Ocr(w) => w.info(),
            ModelHandle::Anomaly(w) => w.info(),
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.info().kind
    }
}

impl Unloadable for ModelHandle {
    fn unload(&self) {
        match self {
            ModelHandle::Language(w) => w.unload(),
            ModelHandle::LanguageGguf(w) => w.unload(),
            ModelHandle::Encoder(w) => w.unload(),
            ModelHandle::Ocr(w) => w.unload(),
            ModelHandle::Anomaly(w) => w.unload(),
        }
    }
}
