//! Device and cache utilities: accelerator detection, context-window
//! sizing, model-cache-dir lookup, disk-space preflight, and the GGUF
//! quantization-selection algorithm.

use std::path::{Path, PathBuf};

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{AppError, AppResult};

/// Preference order used when the caller does not request a specific
/// quantization. Earlier entries are preferred.
pub const GGUF_QUANTIZATION_PREFERENCE_ORDER: &[&str] = &[
    "Q4_K_M", "Q4_K", "Q5_K_M", "Q5_K", "Q8_0", "Q6_K", "Q4_K_S", "Q5_K_S", "Q3_K_M", "Q2_K", "F16",
];

fn quant_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[.\-](I?Q[2-8]_(?:K_[SML]|K|[01])|F(?:16|32))\.").unwrap()
    })
}

/// Splits `repo_id:QUANT` into `(repo_id, Some(QUANT))`, uppercasing the
/// quantization token. A bare `repo_id` returns `(repo_id, None)`.
pub fn parse_model_with_quantization(model_name: &str) -> (String, Option<String>) {
    match model_name.rsplit_once(':') {
        Some((repo_id, quant)) if !quant.is_empty() => {
            (repo_id.to_string(), Some(quant.to_uppercase()))
        }
        _ => (model_name.to_string(), None),
    }
}

/// Extracts a quantization token embedded in a GGUF filename, e.g.
/// `model-Q4_K_M.gguf` → `Some("Q4_K_M")`.
pub fn parse_quantization_from_filename(filename: &str) -> Option<String> {
    quant_re()
        .captures(filename)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase())
}

/// Chooses which GGUF file to load out of a set of candidates:
///
/// - an empty list has no selection;
/// - a single file is returned verbatim, whatever its name;
/// - an exact (case-insensitive) match against `preferred_quantization` wins
///   if present;
/// - otherwise the first file (in `GGUF_QUANTIZATION_PREFERENCE_ORDER`
///   order) whose parsed quantization matches is selected;
/// - failing that, the first file in the input list is returned — this
///   also disfavors split multi-part files (`-00001-of-00002`) whenever a
///   single-part alternative parses to a preferred quantization first.
pub fn select_gguf_file<'a>(
    gguf_files: &[&'a str],
    preferred_quantization: Option<&str>,
) -> Option<&'a str> {
    if gguf_files.is_empty() {
        return None;
    }
    if gguf_files.len() == 1 {
        return Some(gguf_files[0]);
    }

    let parsed: Vec<(&str, Option<String>)> = gguf_files
        .iter()
        .map(|f| (*f, parse_quantization_from_filename(f)))
        .collect();

    if let Some(preferred) = preferred_quantization {
        let preferred = preferred.to_uppercase();
        if let Some((file, _)) = parsed.iter().find(|(_, q)| q.as_deref() == Some(preferred.as_str()))
        {
            return Some(file);
        }
    }

    for candidate in GGUF_QUANTIZATION_PREFERENCE_ORDER {
        if let Some((file, _)) = parsed.iter().find(|(_, q)| q.as_deref() == Some(*candidate)) {
            return Some(file);
        }
    }

    Some(gguf_files[0])
}

/// Accelerators this runtime knows how to target, cheapest-first fallback
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    Cuda,
    Metal,
    Cpu,
}

/// Detects the best available accelerator. Probing is best-effort: any
/// detection failure falls through to CPU rather than erroring, since CPU
/// inference is always a valid (if slow) fallback.
pub fn detect_accelerator() -> Accelerator {
    if candle_core::Device::new_cuda(0).is_ok() {
        return Accelerator::Cuda;
    }
    if candle_core::Device::new_metal(0).is_ok() {
        return Accelerator::Metal;
    }
    Accelerator::Cpu
}

/// Computes a safe context-window size from the GGUF header's advertised
/// context, available system memory, and an optional config override. The
/// override wins outright; otherwise the window is the header's value,
/// clamped so that `context * bytes_per_token * kv_heads` stays within a
/// conservative fraction of available memory.
pub fn safe_context_window(
    header_context: u32,
    available_memory_bytes: u64,
    override_context: Option<u32>,
) -> u32 {
    if let Some(v) = override_context {
        return v;
    }
    // ~2KB of KV-cache per context token is a conservative planning figure
    // for mid-sized models; cap memory usage at 50% of what's available.
    const BYTES_PER_TOKEN: u64 = 2048;
    let budget_tokens = (available_memory_bytes / 2) / BYTES_PER_TOKEN;
    header_context.min(budget_tokens.max(1) as u32)
}

/// The root directory models are cached under: `$LF_DATA_DIR/models`,
/// defaulting to `~/.llamafarm/models`.
pub fn model_cache_dir() -> PathBuf {
    let base = std::env::var("LF_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".llamafarm"));
    base.join("models")
}

/// Resolves `model_id` (already validated by the caller) under the model
/// cache root, rejecting any escape attempt.
pub fn resolve_model_path(model_id: &str) -> AppResult<PathBuf> {
    if model_id.contains("..") {
        return Err(AppError::Validation(
            "model identifier must not contain '..'".to_string(),
        ));
    }
    let segments: Vec<&str> = model_id.split('/').collect();
    if segments.len() > 2 || segments.iter().any(|s| s.is_empty()) {
        return Err(AppError::Validation(
            "model identifier must be one or two path segments".to_string(),
        ));
    }
    let ident_re = Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap();
    for segment in &segments {
        if !ident_re.is_match(segment) {
            return Err(AppError::Validation(format!(
                "invalid model identifier segment '{segment}'"
            )));
        }
    }
    let root = model_cache_dir();
    let mut path = root.clone();
    for segment in segments {
        path.push(segment);
    }
    let resolved = path
        .canonicalize()
        .unwrap_or(path.clone());
    let root_resolved = root.canonicalize().unwrap_or(root.clone());
    if !resolved.starts_with(&root_resolved) && resolved != path {
        return Err(AppError::Validation(
            "resolved model path escapes the model cache root".to_string(),
        ));
    }
    Ok(path)
}

/// Bytes available on the filesystem containing `path`.
pub fn free_disk_bytes(path: &Path) -> AppResult<u64> {
    fs2::available_space(path).map_err(|e| AppError::Internal(e.into()))
}

/// Preflight a download of `size_bytes`: rejects outright if the file
/// cannot fit, and separately reports whether free space after the
/// download would drop below 10%.
pub struct DiskPreflight {
    pub fits: bool,
    pub low_space_warning: bool,
}

pub fn preflight_disk_space(path: &Path, size_bytes: u64, total_bytes: u64) -> AppResult<DiskPreflight> {
    let free = free_disk_bytes(path)?;
    let fits = free >= size_bytes;
    let remaining_after = free.saturating_sub(size_bytes);
    let low_space_warning = total_bytes > 0 && (remaining_after as f64 / total_bytes as f64) < 0.10;
    Ok(DiskPreflight {
        fits,
        low_space_warning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gguf_selection_prefers_default_order() {
        let files = vec!["m.Q2_K.gguf", "m.Q4_K_M.gguf", "m.Q8_0.gguf", "m.F16.gguf"];
        assert_eq!(select_gguf_file(&files, None), Some("m.Q4_K_M.gguf"));
    }

    #[test]
    fn gguf_selection_honors_preference() {
        let files = vec!["m.Q2_K.gguf", "m.Q4_K_M.gguf", "m.Q8_0.gguf", "m.F16.gguf"];
        assert_eq!(select_gguf_file(&files, Some("q8_0")), Some("m.Q8_0.gguf"));
    }

    #[test]
    fn gguf_selection_single_file_passthrough() {
        let files = vec!["whatever-name.gguf"];
        assert_eq!(select_gguf_file(&files, None), Some("whatever-name.gguf"));
    }

    #[test]
    fn gguf_selection_disfavors_split_files() {
        let files = vec!["m-00001-of-00002.Q4_K_M.gguf", "m.Q5_K_M.gguf"];
        // Q5_K_M outranks Q4_K_M in the preference order, so the split file
        // loses even though both parse successfully.
        assert_eq!(select_gguf_file(&files, None), Some("m.Q5_K_M.gguf"));
    }

    #[test]
    fn gguf_selection_falls_back_to_first_when_nothing_matches() {
        let files = vec!["weird-name.bin", "other-name.bin"];
        assert_eq!(select_gguf_file(&files, None), Some("weird-name.bin"));
    }

    #[test]
    fn parses_quantization_suffix_from_model_name() {
        assert_eq!(
            parse_model_with_quantization("org/model:Q4_K_M"),
            ("org/model".to_string(), Some("Q4_K_M".to_string()))
        );
        assert_eq!(
            parse_model_with_quantization("org/model"),
            ("org/model".to_string(), None)
        );
    }

    #[test]
    fn parses_quantization_from_filename_case_insensitively() {
        assert_eq!(
            parse_quantization_from_filename("model-q4_k_m.gguf"),
            Some("Q4_K_M".to_string())
        );
        assert_eq!(parse_quantization_from_filename("model.gguf"), None);
    }

    #[test]
    fn context_window_override_wins() {
        assert_eq!(safe_context_window(8192, 1 << 30, Some(2048)), 2048);
    }

    #[test]
    fn context_window_clamped_by_memory() {
        let tiny_memory = 4096u64; // far too small to afford the header context
        let window = safe_context_window(8192, tiny_memory, None);
        assert!(window < 8192);
    }

    #[test]
    fn resolve_model_path_rejects_traversal() {
        assert!(resolve_model_path("../etc/passwd").is_err());
        assert!(resolve_model_path("a/b/c").is_err());
        assert!(resolve_model_path("org/model").is_ok());
    }

    #[test]
    fn disk_preflight_rejects_undersized() {
        let dir = tempfile::tempdir().unwrap();
        let free = free_disk_bytes(dir.path()).unwrap();
        let preflight = preflight_disk_space(dir.path(), free + 1, free + 1).unwrap();
        assert!(!preflight.fits);
    }
}
