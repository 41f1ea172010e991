use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_LISTEN: &str = "127.0.0.1:4014";
pub(crate) const DEFAULT_RECV_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub segment_backend: SegmentBackend,
    #[serde(default)]
    pub debug: DebugConfig,
    /// Program image loaded at the start of the code region.
    pub image: Option<PathBuf>,
}

/// Where segment descriptors are installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentBackend {
    /// In-process table; works everywhere.
    #[default]
    Software,
    /// The process's local descriptor table (Linux x86 only).
    Ldt,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub listen: String,
    /// Receive timeout; 0 waits forever.
    pub recv_timeout_ms: u64,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
        }
    }
}

impl DebugConfig {
    pub fn listen_addr(&self) -> RunnerResult<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| RunnerError::Config(format!("debug.listen {}: {e}", self.listen)))
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        (self.recv_timeout_ms > 0).then(|| Duration::from_millis(self.recv_timeout_ms))
    }
}

/// Load and validate a runner config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate().await?;
    Ok(config)
}

async fn check_path_exists(path: &Path, label: &str) -> RunnerResult<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| RunnerError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(RunnerError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

impl RunnerConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if let Some(image) = &mut self.image
            && image.is_relative()
        {
            *image = config_dir.join(&*image);
        }
    }

    async fn validate(&self) -> RunnerResult<()> {
        self.sandbox
            .validate()
            .map_err(|e| RunnerError::Config(format!("sandbox layout: {e}")))?;
        self.debug.listen_addr()?;
        if let Some(image) = &self.image {
            check_path_exists(image, "image").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("sandbox.yaml");
        tokio::fs::write(&path, yaml).await.unwrap();
        path
    }

    #[tokio::test]
    async fn load_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "{}\n").await;

        let config = load(&path).await.unwrap();
        assert_eq!(config.segment_backend, SegmentBackend::Software);
        assert_eq!(config.debug, DebugConfig::default());
        assert_eq!(config.sandbox.bundle_size, 32);
        assert_eq!(config.sandbox.code_region.start, 0x8_0000);
        assert!(config.image.is_none());
    }

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("prog.bin"), [0x90, 0xF4])
            .await
            .unwrap();
        let yaml = r#"
sandbox:
  base_address: 0x20000000
  memory_size: 0x100000
  code_region:
    start: 0x1000
    size: 0xF000
  dyncode:
    allow_replacement: false
segment_backend: ldt
debug:
  listen: 0.0.0.0:9999
  recv_timeout_ms: 0
image: prog.bin
"#;
        let path = write_config(dir.path(), yaml).await;

        let config = load(&path).await.unwrap();
        assert_eq!(config.sandbox.base_address, 0x2000_0000);
        assert_eq!(config.sandbox.memory_size, 0x10_0000);
        assert!(!config.sandbox.dyncode.allow_replacement);
        assert_eq!(config.segment_backend, SegmentBackend::Ldt);
        assert_eq!(config.debug.listen_addr().unwrap().port(), 9999);
        assert_eq!(config.debug.recv_timeout(), None);
        assert_eq!(config.image, Some(dir.path().join("prog.bin")));
    }

    #[tokio::test]
    async fn load_rejects_bad_layout() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
sandbox:
  memory_size: 0x100000
  code_region:
    start: 0x1000
    size: 0x200000
"#;
        let path = write_config(dir.path(), yaml).await;
        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("sandbox layout"), "got: {err}");
    }

    #[tokio::test]
    async fn load_rejects_bad_listen_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "debug:\n  listen: not-an-address\n").await;
        assert!(matches!(load(&path).await, Err(RunnerError::Config(_))));
    }

    #[tokio::test]
    async fn load_fails_on_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "image: missing.bin\n").await;
        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("not found"), "got: {err}");
    }

    #[test]
    fn default_timeout_is_bounded() {
        assert_eq!(
            DebugConfig::default().recv_timeout(),
            Some(Duration::from_millis(DEFAULT_RECV_TIMEOUT_MS))
        );
    }
}
