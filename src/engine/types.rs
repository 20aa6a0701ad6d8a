use crate::config;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::warn;

static LANGUAGE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocDiag {
    pub program: String,
    pub program_version: Option<String>,
    pub image: String,
    pub image_present: bool,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// One engine invocation. Both paths are host paths inside the shared
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertIn {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Language codes joined with `+`, e.g. `eng+hin`.
    pub languages: String,
}

/// Build the engine's language flag from the requested codes.
///
/// Codes that are malformed or not in `allowed_languages` (when that list is
/// non-empty) are dropped, duplicates collapse, at most `max_languages` are
/// kept. An empty selection falls back to `default_language`.
pub fn language_flag(cfg: &config::Engine, requested: &[String]) -> String {
    let mut picked: Vec<&str> = Vec::new();
    for raw in requested {
        let code = raw.trim();
        if code.is_empty() {
            continue;
        }
        if !LANGUAGE_CODE.is_match(code) {
            warn!("ignoring malformed language code: {code:?}");
            continue;
        }
        if !cfg.allowed_languages.is_empty() && !cfg.allowed_languages.iter().any(|l| l == code) {
            warn!("ignoring language not in allowed_languages: {code}");
            continue;
        }
        if picked.contains(&code) {
            continue;
        }
        if picked.len() == cfg.max_languages.max(1) {
            warn!("more than {} languages requested; ignoring {code}", cfg.max_languages.max(1));
            continue;
        }
        picked.push(code);
    }

    if picked.is_empty() {
        cfg.default_language.clone()
    } else {
        picked.join("+")
    }
}
