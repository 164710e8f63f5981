//! GPU utilization probe.
//!
//! Shells out to the accelerator query tool (`nvidia-smi` by default) with a
//! bounded timeout. Every failure mode collapses into `GpuReading::Unavailable`
//! so callers can treat a missing reading as "no evidence either way".

use crate::config::GpuConfig;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// One sample from the query tool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GpuReading {
    Available(f64),
    Unavailable,
}

impl GpuReading {
    pub fn value(self) -> Option<f64> {
        match self {
            GpuReading::Available(v) => Some(v),
            GpuReading::Unavailable => None,
        }
    }
}

impl std::fmt::Display for GpuReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuReading::Available(v) => write!(f, "{v}"),
            GpuReading::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Source of GPU readings for the orchestrator.
pub trait GpuProbe {
    /// Utilization of the first GPU, in percent.
    async fn utilization(&mut self) -> GpuReading;
    /// Memory used on the first GPU, in MB.
    async fn memory_used_mb(&mut self) -> GpuReading;
}

/// `nvidia-smi --query-gpu=<field> --format=csv,noheader,nounits`
pub struct NvidiaSmi {
    command: String,
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(config: &GpuConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn query(&self, field: &str) -> GpuReading {
        let output = Command::new(&self.command)
            .arg(format!("--query-gpu={field}"))
            .arg("--format=csv,noheader,nounits")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!(command = %self.command, field, error = %e, "failed to run GPU query tool");
                return GpuReading::Unavailable;
            }
            Err(_) => {
                tracing::warn!(
                    command = %self.command,
                    field,
                    timeout_secs = self.timeout.as_secs(),
                    "GPU query timed out"
                );
                return GpuReading::Unavailable;
            }
        };

        if !output.status.success() {
            tracing::warn!(
                command = %self.command,
                field,
                exit_code = ?output.status.code(),
                "GPU query tool exited with failure"
            );
            return GpuReading::Unavailable;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_first_value(&stdout) {
            Some(v) => GpuReading::Available(v),
            None => {
                tracing::warn!(field, output = %stdout.trim(), "unparseable GPU query output");
                GpuReading::Unavailable
            }
        }
    }
}

impl GpuProbe for NvidiaSmi {
    async fn utilization(&mut self) -> GpuReading {
        self.query("utilization.gpu").await
    }

    async fn memory_used_mb(&mut self) -> GpuReading {
        self.query("memory.used").await
    }
}

/// First field of the first line: one line per GPU, only GPU 0 counts.
fn parse_first_value(stdout: &str) -> Option<f64> {
    let line = stdout.lines().next()?;
    let field = line.split(',').next()?.trim();
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn fake_tool(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-smi");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn probe(command: String, timeout_secs: u64) -> NvidiaSmi {
        NvidiaSmi::new(&GpuConfig {
            command,
            timeout_secs,
        })
    }

    #[test]
    fn test_parse_single_gpu() {
        assert_eq!(parse_first_value("37\n"), Some(37.0));
    }

    #[test]
    fn test_parse_takes_first_gpu_only() {
        assert_eq!(parse_first_value("3\n98\n97\n"), Some(3.0));
    }

    #[test]
    fn test_parse_takes_first_field() {
        assert_eq!(parse_first_value(" 12.5 , 4096\n"), Some(12.5));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_first_value("[N/A]\n"), None);
        assert_eq!(parse_first_value(""), None);
        assert_eq!(parse_first_value("NaN\n"), None);
    }

    #[test]
    fn test_reading_display() {
        assert_eq!(GpuReading::Available(4.0).to_string(), "4");
        assert_eq!(GpuReading::Unavailable.to_string(), "unavailable");
        assert_eq!(GpuReading::Unavailable.value(), None);
    }

    #[tokio::test]
    async fn test_utilization_from_tool_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "echo 42\necho 99");
        let mut p = probe(tool, 5);
        assert_eq!(p.utilization().await, GpuReading::Available(42.0));
    }

    #[tokio::test]
    async fn test_memory_query_uses_memory_field() {
        let dir = tempfile::tempdir().unwrap();
        // Echo back which field was requested
        let tool = fake_tool(
            dir.path(),
            r#"case "$1" in --query-gpu=memory.used) echo 20480 ;; *) echo 1 ;; esac"#,
        );
        let mut p = probe(tool, 5);
        assert_eq!(p.memory_used_mb().await, GpuReading::Available(20480.0));
        assert_eq!(p.utilization().await, GpuReading::Available(1.0));
    }

    #[tokio::test]
    async fn test_missing_tool_is_unavailable() {
        let mut p = probe("nonexistent-gpu-tool-xyz".to_string(), 5);
        assert_eq!(p.utilization().await, GpuReading::Unavailable);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "echo 50\nexit 3");
        let mut p = probe(tool, 5);
        assert_eq!(p.utilization().await, GpuReading::Unavailable);
    }

    #[tokio::test]
    async fn test_unparseable_output_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "echo 'NVIDIA-SMI has failed'");
        let mut p = probe(tool, 5);
        assert_eq!(p.utilization().await, GpuReading::Unavailable);
    }

    #[tokio::test]
    async fn test_timeout_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "sleep 10\necho 50");
        let mut p = probe(tool, 1);
        let start = std::time::Instant::now();
        assert_eq!(p.utilization().await, GpuReading::Unavailable);
        assert!(start.elapsed().as_secs() < 5);
    }
}
