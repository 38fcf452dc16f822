//! Slicing Adapter
//!
//! Runs the external slicing engine as a bounded-time child process and
//! returns its textual report (the exported G-code). Callers reach this only
//! through `SequentialJobQueue`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::error::QuoteError;
use crate::profile::SlicerProfile;

const DIAGNOSTIC_CHARS: usize = 600;

#[derive(Debug, Clone)]
pub struct SliceRequest {
    /// Correlates log lines for one slicing job.
    pub job_id: String,
    pub model: PathBuf,
    pub profile: SlicerProfile,
}

/// Anything that can turn a model + profile into a slicer report.
#[async_trait]
pub trait SlicingEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn slice(&self, request: &SliceRequest) -> Result<String, QuoteError>;
}

/// PrusaSlicer (or a CLI-compatible fork) invoked as a subprocess.
#[derive(Debug, Clone)]
pub struct PrusaSlicerEngine {
    binary: PathBuf,
    timeout: Duration,
}

impl PrusaSlicerEngine {
    /// Resolves the binary up front so a missing engine fails at startup.
    pub fn locate(configured: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let binary = find_executable(configured).ok_or_else(|| {
            ConfigError::EngineUnavailable(format!("'{configured}' not found"))
        })?;
        info!(binary = %binary.display(), timeout_s = timeout.as_secs(), "slicing engine located");
        Ok(Self { binary, timeout })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl SlicingEngine for PrusaSlicerEngine {
    fn name(&self) -> &str {
        "prusa-slicer"
    }

    async fn slice(&self, request: &SliceRequest) -> Result<String, QuoteError> {
        ensure_model_exists(&request.model)?;

        let workdir = tempfile::tempdir()?;
        let output_path = workdir.path().join("model.gcode");

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--export-gcode")
            .arg(&request.model)
            .arg("--output")
            .arg(&output_path)
            .args(request.profile.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(job_id = %request.job_id, model = %request.model.display(), "spawning slicer");

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                QuoteError::Config(ConfigError::EngineUnavailable(e.to_string()))
            }
            _ => QuoteError::slicing("could not start slicing engine", e.to_string()),
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| QuoteError::slicing("slicing engine I/O failed", e.to_string()))?,
            Err(_) => {
                warn!(job_id = %request.job_id, timeout_s = self.timeout.as_secs(), "slicer timed out, killed");
                return Err(QuoteError::Timeout(format!(
                    "slicing exceeded {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let diagnostic = excerpt(if stderr.trim().is_empty() { &stdout } else { &stderr });
            warn!(job_id = %request.job_id, status = %output.status, %diagnostic, "slicer failed");
            return Err(QuoteError::slicing(
                format!("engine exited with {}", output.status),
                diagnostic,
            ));
        }

        let bytes = match tokio::fs::read(&output_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(QuoteError::slicing(
                    "engine produced no G-code",
                    excerpt(&String::from_utf8_lossy(&output.stdout)),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        info!(job_id = %request.job_id, bytes = bytes.len(), "slicing complete");
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Replays a recorded engine report instead of running the engine.
#[derive(Debug, Clone)]
pub struct FixtureEngine {
    report: String,
}

impl FixtureEngine {
    pub fn new(report: impl Into<String>) -> Self {
        Self { report: report.into() }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::new(std::fs::read_to_string(path)?))
    }
}

#[async_trait]
impl SlicingEngine for FixtureEngine {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn slice(&self, request: &SliceRequest) -> Result<String, QuoteError> {
        ensure_model_exists(&request.model)?;
        Ok(self.report.clone())
    }
}

fn ensure_model_exists(model: &Path) -> Result<(), QuoteError> {
    if model.is_file() {
        Ok(())
    } else {
        Err(QuoteError::slicing("model file not found", ""))
    }
}

/// Bare names are searched on `PATH`; anything with a separator is taken as a path.
fn find_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

/// Last `DIAGNOSTIC_CHARS` characters, trimmed.
fn excerpt(text: &str) -> String {
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(DIAGNOSTIC_CHARS.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::quote::QuoteParams;

    fn request(model: PathBuf) -> SliceRequest {
        let params = QuoteParams {
            material: "pla".into(),
            quality: "standard".into(),
            printer: "prusa_mk3s".into(),
            quantity: 1,
            infill_percent: 20,
            supports: false,
            post_processing: vec![],
        };
        SliceRequest {
            job_id: "job-test".into(),
            model,
            profile: SlicerProfile::resolve(&params, &AppConfig::default()).unwrap(),
        }
    }

    #[test]
    fn test_missing_binary_is_config_error() {
        let err = PrusaSlicerEngine::locate("definitely-not-a-slicer-binary", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EngineUnavailable(_)));

        let err = PrusaSlicerEngine::locate("/nonexistent/dir/prusa-slicer", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EngineUnavailable(_)));
    }

    #[test]
    fn test_excerpt_keeps_tail() {
        let long = format!("{}tail", "a".repeat(2000));
        let e = excerpt(&long);
        assert_eq!(e.chars().count(), DIAGNOSTIC_CHARS);
        assert!(e.ends_with("tail"));
        assert_eq!(excerpt("  short \n"), "short");
    }

    #[tokio::test]
    async fn test_fixture_engine_requires_model() {
        let engine = FixtureEngine::new(";TIME:60\n");
        let err = engine.slice(&request(PathBuf::from("/nonexistent/model.stl"))).await.unwrap_err();
        assert!(matches!(err, QuoteError::Slicing { .. }));

        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("cube.stl");
        std::fs::write(&model, "solid cube\nendsolid cube\n").unwrap();
        assert_eq!(engine.slice(&request(model)).await.unwrap(), ";TIME:60\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_slicing_failure() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("broken.stl");
        std::fs::write(&model, "garbage").unwrap();

        let Some(false_bin) = find_executable("false") else { return };
        let engine = PrusaSlicerEngine { binary: false_bin, timeout: Duration::from_secs(10) };
        let err = engine.slice(&request(model)).await.unwrap_err();
        assert!(matches!(err, QuoteError::Slicing { .. }), "{err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_engine() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("slow.stl");
        std::fs::write(&model, "solid").unwrap();
        let script = dir.path().join("slow-slicer.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = PrusaSlicerEngine { binary: script, timeout: Duration::from_millis(200) };
        let started = std::time::Instant::now();
        let err = engine.slice(&request(model)).await.unwrap_err();
        assert!(matches!(err, QuoteError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
