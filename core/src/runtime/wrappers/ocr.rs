//! OCR model wrapper: four normalized backends behind one `recognize` call.
//!
//! None of the four backends (surya, easyocr, paddleocr, tesseract) are
//! native Rust; each is reached as an external process the way
//! `orchestrator::rag::SubprocessRagBackend` reaches an external retrieval
//! service, rather than vendoring an ONNX/ORT pipeline into this crate.

use std::process::Stdio;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{AppError, AppResult};
use super::{ModelInfo, ModelKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrBackend {
    Surya,
    Easyocr,
    Paddleocr,
    Tesseract,
}

impl OcrBackend {
    /// The external command invoked for this backend. Tesseract is assumed
    /// to be the system `tesseract` binary; the others are assumed to be a
    /// same-named CLI wrapper on `PATH` that speaks the JSON convention in
    /// `parse_json_boxes`.
    fn command(self) -> &'static str {
        match self {
            OcrBackend::Surya => "surya_ocr",
            OcrBackend::Easyocr => "easyocr",
            OcrBackend::Paddleocr => "paddleocr",
            OcrBackend::Tesseract => "tesseract",
        }
    }
}

/// ISO-639-1 to tesseract's 3-letter language codes. Table-driven per the
/// runtime's language-mapping contract; extend as new languages are wired.
const ISO639_1_TO_TESSERACT: &[(&str, &str)] = &[
    ("en", "eng"),
    ("de", "deu"),
    ("fr", "fra"),
    ("es", "spa"),
    ("it", "ita"),
    ("pt", "por"),
    ("nl", "nld"),
    ("ru", "rus"),
    ("ja", "jpn"),
    ("zh", "chi_sim"),
    ("ko", "kor"),
    ("ar", "ara"),
];

pub fn iso639_1_to_tesseract(code: &str) -> Option<&'static str> {
    ISO639_1_TO_TESSERACT
        .iter()
        .find(|(iso, _)| *iso == code)
        .map(|(_, tess)| *tess)
}

#[derive(Debug, Clone, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct OcrResult {
    pub boxes: Vec<BoundingBox>,
}

/// Wire shape produced on stdout by the surya/easyocr/paddleocr CLI
/// wrappers: a JSON array of boxes per invocation.
#[derive(Debug, Deserialize)]
struct RawBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    text: String,
    #[serde(default)]
    confidence: f32,
}

struct Loaded {
    init_languages: Vec<String>,
}

pub struct OcrWrapper {
    model_id: String,
    backend: OcrBackend,
    state: Mutex<Option<Loaded>>,
}

impl OcrWrapper {
    pub fn new(model_id: impl Into<String>, backend: OcrBackend) -> Self {
        Self {
            model_id: model_id.into(),
            backend,
            state: Mutex::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    pub async fn load(&self, init_languages: Vec<String>) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        *state = Some(Loaded { init_languages });
        Ok(())
    }

    pub fn unload(&self) {
        *self.state.lock().unwrap() = None;
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            kind: ModelKind::Ocr,
            model_id: self.model_id.clone(),
            loaded: self.is_loaded(),
            context_length: None,
            quantization: None,
            extra: serde_json::json!({ "backend": self.backend }),
        }
    }

    /// Recognizes text in `images`. Only `tesseract` honors a per-request
    /// `languages` override; other backends fall back to their init-time
    /// languages and log a warning if an override was requested.
    pub async fn recognize(
        &self,
        images: &[Vec<u8>],
        languages: Option<&[String]>,
        detect_layout: bool,
        return_boxes: bool,
    ) -> AppResult<Vec<OcrResult>> {
        let init_languages = {
            let state = self.state.lock().unwrap();
            let loaded = state
                .as_ref()
                .ok_or_else(|| AppError::FatalToRequest("ocr backend not loaded".to_string()))?;
            loaded.init_languages.clone()
        };

        let effective_languages: Vec<String> = match (self.backend, languages) {
            (OcrBackend::Tesseract, Some(requested)) => requested
                .iter()
                .map(|l| iso639_1_to_tesseract(l).map(str::to_string).unwrap_or_else(|| l.clone()))
                .collect(),
            (_, Some(_)) => {
                tracing::warn!(
                    backend = ?self.backend,
                    "per-request language override ignored; only tesseract honors it"
                );
                init_languages.clone()
            }
            (_, None) => init_languages.clone(),
        };

        let mut out = Vec::with_capacity(images.len());
        for image in images {
            let boxes = match self.backend {
                OcrBackend::Tesseract => self.run_tesseract(image, &effective_languages).await?,
                _ => self.run_json_backend(image, &effective_languages, detect_layout).await?,
            };
            out.push(OcrResult {
                boxes: if return_boxes { boxes } else { collapse_boxes(boxes) },
            });
        }
        Ok(out)
    }

    /// `tesseract <image> stdout -l <langs> tsv` emits a TSV table with one
    /// row per recognized word, including its bounding box and confidence.
    async fn run_tesseract(&self, image: &[u8], languages: &[String]) -> AppResult<Vec<BoundingBox>> {
        let image_path = write_temp_image(image)?;
        let lang_arg = if languages.is_empty() { "eng".to_string() } else { languages.join("+") };

        let output = Command::new(self.backend.command())
            .arg(image_path.path())
            .arg("stdout")
            .arg("-l")
            .arg(&lang_arg)
            .arg("tsv")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AppError::Transient(format!("tesseract failed to spawn: {e}")))?;

        if !output.status.success() {
            return Err(AppError::Transient(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        parse_tesseract_tsv(&String::from_utf8_lossy(&output.stdout))
    }

    /// Surya/easyocr/paddleocr are invoked as `<command> --image <path>
    /// --lang <langs> [--detect-layout]`, writing a JSON array of
    /// `{x1,y1,x2,y2,text,confidence}` boxes to stdout.
    async fn run_json_backend(
        &self,
        image: &[u8],
        languages: &[String],
        detect_layout: bool,
    ) -> AppResult<Vec<BoundingBox>> {
        let image_path = write_temp_image(image)?;

        let mut command = Command::new(self.backend.command());
        command
            .arg("--image")
            .arg(image_path.path())
            .arg("--lang")
            .arg(languages.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if detect_layout {
            command.arg("--detect-layout");
        }

        let output = command
            .output()
            .await
            .map_err(|e| AppError::Transient(format!("{} failed to spawn: {e}", self.backend.command())))?;

        if !output.status.success() {
            return Err(AppError::Transient(format!(
                "{} exited with {}: {}",
                self.backend.command(),
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let raw: Vec<RawBox> = serde_json::from_slice(&output.stdout)
            .map_err(|e| AppError::Transient(format!("{} produced invalid JSON: {e}", self.backend.command())))?;
        Ok(raw
            .into_iter()
            .map(|b| BoundingBox { x1: b.x1, y1: b.y1, x2: b.x2, y2: b.y2, text: b.text, confidence: b.confidence })
            .collect())
    }
}

/// When the caller doesn't want per-word boxes, collapse to a single entry
/// per image covering all recognized text, concatenated in reading order
/// with the page's overall bounding extent and mean confidence.
fn collapse_boxes(boxes: Vec<BoundingBox>) -> Vec<BoundingBox> {
    if boxes.is_empty() {
        return Vec::new();
    }
    let x1 = boxes.iter().map(|b| b.x1).fold(f32::INFINITY, f32::min);
    let y1 = boxes.iter().map(|b| b.y1).fold(f32::INFINITY, f32::min);
    let x2 = boxes.iter().map(|b| b.x2).fold(f32::NEG_INFINITY, f32::max);
    let y2 = boxes.iter().map(|b| b.y2).fold(f32::NEG_INFINITY, f32::max);
    let confidence = boxes.iter().map(|b| b.confidence).sum::<f32>() / boxes.len() as f32;
    let text = boxes.iter().map(|b| b.text.as_str()).collect::<Vec<_>>().join(" ");
    vec![BoundingBox { x1, y1, x2, y2, text, confidence }]
}

fn write_temp_image(bytes: &[u8]) -> AppResult<tempfile::NamedTempFile> {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to create temp image file: {e}")))?;
    file.write_all(bytes)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to write temp image file: {e}")))?;
    Ok(file)
}

fn parse_tesseract_tsv(tsv: &str) -> AppResult<Vec<BoundingBox>> {
    let mut boxes = Vec::new();
    for line in tsv.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }
        let text = fields[11].trim();
        if text.is_empty() {
            continue;
        }
        let left: f32 = fields[6].parse().unwrap_or(0.0);
        let top: f32 = fields[7].parse().unwrap_or(0.0);
        let width: f32 = fields[8].parse().unwrap_or(0.0);
        let height: f32 = fields[9].parse().unwrap_or(0.0);
        let confidence: f32 = fields[10].parse().unwrap_or(0.0);
        boxes.push(BoundingBox {
            x1: left,
            y1: top,
            x2: left + width,
            y2: top + height,
            text: text.to_string(),
            confidence: confidence.max(0.0) / 100.0,
        });
    }
    Ok(boxes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_iso_codes() {
        assert_eq!(iso639_1_to_tesseract("en"), Some("eng"));
        assert_eq!(iso639_1_to_tesseract("zh"), Some("chi_sim"));
        assert_eq!(iso639_1_to_tesseract("xx"), None);
    }

    #[test]
    fn parses_tesseract_tsv_rows() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   5\t1\t1\t1\t1\t1\t10\t20\t30\t15\t95.5\thello\n\
                   5\t1\t1\t1\t1\t2\t0\t0\t0\t0\t-1\t\n";
        let boxes = parse_tesseract_tsv(tsv).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].text, "hello");
        assert_eq!(boxes[0].x1, 10.0);
        assert_eq!(boxes[0].x2, 40.0);
        assert!((boxes[0].confidence - 0.955).abs() < 1e-6);
    }
}
