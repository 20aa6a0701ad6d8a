use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub debug: Debug,
    #[serde(default)]
    pub security: Security,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    /// Directory that holds every file belonging to one task.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        PathBuf::from(&self.paths.shared_dir).join(task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Global {
    pub max_parallel_jobs: usize,
    pub keep_inputs: bool,
    pub print_summary: bool,
    pub poll_interval_ms: u64,
}
impl Default for Global {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 1,
            keep_inputs: true,
            print_summary: true,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub shared_dir: String,
    pub progress_dir: String,
    pub log_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            shared_dir: "uploads".into(),
            progress_dir: "progress".into(),
            log_dir: "logs".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Inputs {
    pub allowed_extensions: Vec<String>,
    pub max_inputs: usize,
    pub max_input_bytes: u64,
}
impl Default for Inputs {
    fn default() -> Self {
        Self {
            allowed_extensions: vec!["pdf".into()],
            max_inputs: 64,
            max_input_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Engine {
    pub program: String,
    pub image: String,
    pub mount_point: String,
    pub jobs: u32,
    pub optimize: u32,
    pub skip_text: bool,
    pub skip_big_mb: u32,
    pub timeout_seconds: u64,
    pub extra_args: Vec<String>,
    pub default_language: String,
    pub max_languages: usize,
    pub allowed_languages: Vec<String>,
}
impl Default for Engine {
    fn default() -> Self {
        Self {
            program: "docker".into(),
            image: "samyaktechlabsocr:v1".into(),
            mount_point: "/data".into(),
            jobs: 4,
            optimize: 0,
            skip_text: true,
            skip_big_mb: 10,
            timeout_seconds: 0,
            extra_args: Vec::new(),
            default_language: "eng".into(),
            max_languages: 3,
            allowed_languages: vec!["eng".into(), "hin".into(), "guj".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Output {
    pub suffix: String,
    pub extension: String,
    pub archive_prefix: String,
    pub write_index_json: bool,
}
impl Default for Output {
    fn default() -> Self {
        Self {
            suffix: "-ocr".into(),
            extension: "pdf".into(),
            archive_prefix: "ocr_results_".into(),
            write_index_json: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: true,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Debug {
    pub keep_tool_stderr: bool,
    pub dump_effective_config: bool,
}
impl Default for Debug {
    fn default() -> Self {
        Self {
            keep_tool_stderr: true,
            dump_effective_config: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Security {
    pub reject_url_inputs: bool,
}
impl Default for Security {
    fn default() -> Self {
        Self {
            reject_url_inputs: true,
        }
    }
}
