use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;
use time::format_description::well_known::Rfc3339;
use unicode_normalization::UnicodeNormalization;

static UNSAFE_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("static regex"));

pub fn ensure_dir(p: &Path) -> Result<()> {
    std::fs::create_dir_all(p).with_context(|| format!("create_dir_all {}", p.display()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut h = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(format!("{:x}", h.finalize()))
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Reduce an uploaded file name to a flat, ASCII-only name that is safe to
/// place inside the shared directory. May return an empty string.
pub fn sanitize_filename(raw: &str) -> String {
    let ascii: String = raw.nfkd().filter(|c| c.is_ascii()).collect();
    let flat = ascii.replace(['/', '\\'], " ");
    let joined = flat.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned = UNSAFE_FILENAME_CHARS.replace_all(&joined, "");
    cleaned.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Sanitize every name and make the results unique, keeping input order.
/// Empty names become `document_<n>`; collisions get `_2`, `_3`, ... before
/// the extension. Names differing only in ASCII case count as collisions.
pub fn unique_names<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut taken = HashSet::new();
    let mut out = Vec::new();
    for (i, name) in raw.into_iter().enumerate() {
        let mut base = sanitize_filename(name);
        if base.is_empty() {
            base = format!("document_{}", i + 1);
        }
        let mut candidate = base.clone();
        let mut n = 2;
        while taken.contains(&candidate.to_ascii_lowercase()) {
            candidate = match split_extension(&base) {
                (stem, Some(ext)) => format!("{stem}_{n}.{ext}"),
                (stem, None) => format!("{stem}_{n}"),
            };
            n += 1;
        }
        taken.insert(candidate.to_ascii_lowercase());
        out.push(candidate);
    }
    out
}

pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

pub fn extension_lowercase(name: &str) -> Option<String> {
    split_extension(name).1.map(|e| e.to_ascii_lowercase())
}

/// `scan.pdf` -> `scan<suffix>.<extension>`.
pub fn output_name(input: &str, suffix: &str, extension: &str) -> String {
    let (stem, _) = split_extension(input);
    format!("{stem}{suffix}.{extension}")
}

/// Output names for a task's inputs, in order. Names never collide with each
/// other or with any input name, ignoring ASCII case; clashes get `_2`,
/// `_3`, ... on the stem.
pub fn output_names(inputs: &[String], suffix: &str, extension: &str) -> Vec<String> {
    let mut taken: HashSet<String> = inputs.iter().map(|i| i.to_ascii_lowercase()).collect();
    let mut out = Vec::with_capacity(inputs.len());
    for input in inputs {
        let (stem, _) = split_extension(input);
        let mut candidate = output_name(input, suffix, extension);
        let mut n = 2;
        while taken.contains(&candidate.to_ascii_lowercase()) {
            candidate = format!("{stem}{suffix}_{n}.{extension}");
            n += 1;
        }
        taken.insert(candidate.to_ascii_lowercase());
        out.push(candidate);
    }
    out
}
