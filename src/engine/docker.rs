use super::{types::*, Engine};
use crate::{config::Config, error::ConversionError, task::ArtifactRef, util::ensure_dir};
use anyhow::{anyhow, Context, Result};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// `docker run` reserves this status for failures of the daemon itself.
const DOCKER_DAEMON_ERROR: i32 = 125;

/// Runs the OCR image in a throwaway container that only sees the shared
/// directory.
pub struct DockerEngine {
    cfg: crate::config::Engine,
    shared_dir: PathBuf,
    keep_stderr: bool,
}

impl DockerEngine {
    pub fn new(cfg: &Config) -> Result<Self> {
        if cfg.engine.program.trim().is_empty() {
            return Err(anyhow!("engine.program is empty"));
        }
        if cfg.engine.image.trim().is_empty() {
            return Err(anyhow!("engine.image is empty"));
        }
        if !cfg.engine.mount_point.starts_with('/') {
            return Err(anyhow!(
                "engine.mount_point must be absolute: {}",
                cfg.engine.mount_point
            ));
        }
        let shared = PathBuf::from(&cfg.paths.shared_dir);
        ensure_dir(&shared)?;
        let shared_dir = shared
            .canonicalize()
            .with_context(|| format!("canonicalize shared_dir: {}", shared.display()))?;
        Ok(Self {
            cfg: cfg.engine.clone(),
            shared_dir,
            keep_stderr: cfg.debug.keep_tool_stderr,
        })
    }

    /// Arguments passed to `engine.program` for one conversion.
    pub fn command_args(&self, req: &ConvertIn) -> Result<Vec<String>, ConversionError> {
        let input = self.container_path(&self.relative_to_shared(&req.input_path)?);
        let output = self.container_path(&self.relative_to_shared(&req.output_path)?);

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "-v".to_string(),
            format!("{}:{}", self.shared_dir.display(), self.mount_point()),
            self.cfg.image.clone(),
            input,
            output,
            "-l".to_string(),
            req.languages.clone(),
            "--jobs".to_string(),
            self.cfg.jobs.to_string(),
            "--optimize".to_string(),
            self.cfg.optimize.to_string(),
        ];
        if self.cfg.skip_text {
            args.push("--skip-text".to_string());
        }
        args.push("--skip-big".to_string());
        args.push(self.cfg.skip_big_mb.to_string());
        args.extend(self.cfg.extra_args.iter().cloned());
        Ok(args)
    }

    fn mount_point(&self) -> &str {
        self.cfg.mount_point.trim_end_matches('/')
    }

    fn container_path(&self, rel: &str) -> String {
        format!("{}/{}", self.mount_point(), rel)
    }

    /// `/`-joined path of `host` relative to the shared directory. The file
    /// itself may not exist yet; its parent must.
    fn relative_to_shared(&self, host: &Path) -> Result<String, ConversionError> {
        let file_name = host.file_name().ok_or_else(|| ConversionError::OutsideSharedDir {
            path: host.to_path_buf(),
        })?;
        let parent = match host.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let abs = parent.canonicalize()?.join(file_name);
        let rel = abs
            .strip_prefix(&self.shared_dir)
            .map_err(|_| ConversionError::OutsideSharedDir { path: abs.clone() })?;

        let mut parts = Vec::new();
        for c in rel.components() {
            match c {
                Component::Normal(p) => parts.push(p.to_string_lossy().into_owned()),
                _ => return Err(ConversionError::OutsideSharedDir { path: abs.clone() }),
            }
        }
        Ok(parts.join("/"))
    }
}

impl Engine for DockerEngine {
    fn doctor(&self) -> Result<DocDiag> {
        let version = Command::new(&self.cfg.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output();

        let (program_version, mut error) = match version {
            Ok(out) if out.status.success() => (
                Some(String::from_utf8_lossy(&out.stdout).trim().to_string()),
                None,
            ),
            Ok(out) => (
                None,
                Some(format!(
                    "{} --version exited with {:?}",
                    self.cfg.program,
                    out.status.code()
                )),
            ),
            Err(e) => (None, Some(format!("cannot run {}: {e}", self.cfg.program))),
        };

        let image_present = program_version.is_some()
            && Command::new(&self.cfg.program)
                .args(["image", "inspect", self.cfg.image.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false);

        if program_version.is_some() && !image_present {
            error = Some(format!("image not found locally: {}", self.cfg.image));
        }

        Ok(DocDiag {
            program: self.cfg.program.clone(),
            program_version,
            image: self.cfg.image.clone(),
            image_present,
            ok: error.is_none(),
            error,
        })
    }

    fn convert(&self, req: &ConvertIn) -> Result<ArtifactRef, ConversionError> {
        let args = self.command_args(req)?;
        debug!("engine run {} {}", self.cfg.program, args.join(" "));

        let mut child = Command::new(&self.cfg.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ConversionError::EngineUnavailable {
                reason: format!("spawning {}: {e}", self.cfg.program),
            })?;

        let output = if self.cfg.timeout_seconds > 0 {
            wait_with_timeout(&mut child, Duration::from_secs(self.cfg.timeout_seconds))?
        } else {
            child.wait_with_output()?
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if self.keep_stderr && !stderr.is_empty() {
            debug!("engine stderr {}: {}", req.input_path.display(), stderr);
        }

        if !output.status.success() {
            let code = output.status.code();
            if code == Some(DOCKER_DAEMON_ERROR) {
                return Err(ConversionError::EngineUnavailable {
                    reason: format!("{} daemon error: {stderr}", self.cfg.program),
                });
            }
            return Err(ConversionError::ToolFailed { code, stderr });
        }

        if !req.output_path.is_file() {
            return Err(ConversionError::MissingOutput {
                path: req.output_path.clone(),
            });
        }

        Ok(ArtifactRef {
            name: self.relative_to_shared(&req.output_path)?,
            path: req.output_path.clone(),
        })
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Output, ConversionError> {
    // Drain pipes while waiting so a chatty engine can't block on a full
    // stdout/stderr buffer.
    let stdout_reader = child.stdout.take();
    let stderr_reader = child.stderr.take();

    let stdout_thread = std::thread::spawn(move || -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout_reader {
            out.read_to_end(&mut buf)?;
        }
        Ok(buf)
    });

    let stderr_thread = std::thread::spawn(move || -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr_reader {
            err.read_to_end(&mut buf)?;
        }
        Ok(buf)
    });

    let join = |h: std::thread::JoinHandle<io::Result<Vec<u8>>>| -> io::Result<Vec<u8>> {
        h.join()
            .map_err(|_| io::Error::other("pipe reader thread panicked"))?
    };

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            let stdout = join(stdout_thread)?;
            let stderr = join(stderr_thread)?;
            return Ok(Output {
                status,
                stdout,
                stderr,
            });
        }

        if start.elapsed() > timeout {
            warn!("engine process timed out after {:?}", timeout);
            let _ = child.kill();
            child.wait()?;
            let _ = join(stdout_thread);
            let _ = join(stderr_thread);
            return Err(ConversionError::TimedOut {
                secs: timeout.as_secs(),
            });
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}
