//! Quality Gate Runner (C5): detects the project toolchain, runs build then
//! test subprocesses between waves and before finalization, honors
//! cancellation with process-tree kill.
//!
//! Grounded on the deleted verifier pipeline's `run_with_timeout` pattern:
//! `kill_on_drop(true)` plus a detached process group so a cancelled build
//! doesn't leave orphaned children, wrapped in `tokio::time::timeout`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::GateError;
use crate::model::{GateResult, GateType};

const SKIP_DIRS: &[&str] = &["bin", "obj", "node_modules", ".git", "target", ".venv"];
const NORMALIZED_EXTENSIONS: &[&str] = &["cs", "rs", "ts", "tsx", "js", "jsx", "py", "go", "java"];

#[derive(Debug, Clone)]
struct Toolchain {
    build_command: Vec<String>,
    test_command: Vec<String>,
    needs_dotnet_restore: bool,
}

fn detect_toolchain(worktree: &Path) -> Option<Toolchain> {
    let has = |name: &str| worktree.join(name).exists();
    let has_glob_ext = |ext: &str| {
        ignore::WalkBuilder::new(worktree)
            .max_depth(Some(2))
            .build()
            .flatten()
            .any(|e| e.path().extension().and_then(|x| x.to_str()) == Some(ext))
    };

    if has("Cargo.toml") {
        return Some(Toolchain {
            build_command: vec!["cargo".into(), "build".into()],
            test_command: vec!["cargo".into(), "test".into()],
            needs_dotnet_restore: false,
        });
    }
    if has("go.mod") {
        return Some(Toolchain {
            build_command: vec!["go".into(), "build".into(), "./...".into()],
            test_command: vec!["go".into(), "test".into(), "./...".into()],
            needs_dotnet_restore: false,
        });
    }
    if has("package.json") {
        return Some(Toolchain {
            build_command: vec!["npm".into(), "run".into(), "build".into()],
            test_command: vec!["npm".into(), "test".into()],
            needs_dotnet_restore: false,
        });
    }
    if has("pyproject.toml") || has("setup.py") {
        return Some(Toolchain {
            build_command: vec!["python".into(), "-m".into(), "compileall".into(), ".".into()],
            test_command: vec!["pytest".into()],
            needs_dotnet_restore: false,
        });
    }
    if has_glob_ext("sln") || has_glob_ext("csproj") {
        return Some(Toolchain {
            build_command: vec!["dotnet".into(), "build".into()],
            test_command: vec!["dotnet".into(), "test".into()],
            needs_dotnet_restore: true,
        });
    }
    if has("Makefile") {
        return Some(Toolchain {
            build_command: vec!["make".into(), "build".into()],
            test_command: vec!["make".into(), "test".into()],
            needs_dotnet_restore: false,
        });
    }
    None
}

/// Replaces CRLF with LF for tracked source extensions, skipping vendored/
/// generated directories.
fn normalize_line_endings(worktree: &Path) -> std::io::Result<()> {
    for entry in ignore::WalkBuilder::new(worktree).hidden(true).git_ignore(true).build().flatten() {
        let path = entry.path();
        if path
            .components()
            .any(|c| SKIP_DIRS.contains(&c.as_os_str().to_string_lossy().as_ref()))
        {
            continue;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !NORMALIZED_EXTENSIONS.contains(&ext) {
            continue;
        }
        if let Ok(bytes) = std::fs::read(path) {
            if bytes.contains(&b'\r') {
                let normalized: Vec<u8> = {
                    let mut out = Vec::with_capacity(bytes.len());
                    let mut i = 0;
                    while i < bytes.len() {
                        if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
                            out.push(b'\n');
                            i += 2;
                        } else {
                            out.push(bytes[i]);
                            i += 1;
                        }
                    }
                    out
                };
                std::fs::write(path, normalized)?;
            }
        }
    }
    Ok(())
}

/// Runs `program args...` in `worktree`, detached into its own process group
/// so the whole tree can be killed on cancel/timeout.
async fn run_subprocess(
    worktree: &Path,
    command: &[String],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(bool, String, bool), GateError> {
    let Some((program, args)) = command.split_first() else {
        return Err(GateError::Spawn("empty command".to_string()));
    };

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(worktree)
        .kill_on_drop(true)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|e| GateError::Spawn(e.to_string()))?;
    let pid = child.id();

    let wait_with_output = child.wait_with_output();
    tokio::pin!(wait_with_output);

    tokio::select! {
        result = &mut wait_with_output => {
            let output = result.map_err(|e| GateError::Io(e))?;
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            Ok((output.status.success(), combined, false))
        }
        _ = tokio::time::sleep(timeout) => {
            kill_process_group(pid);
            Ok((false, "gate timed out".to_string(), false))
        }
        _ = cancel.cancelled() => {
            kill_process_group(pid);
            Ok((false, "gate cancelled".to_string(), true))
        }
    }
}

fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    #[cfg(unix)]
    {
        let target = format!("-{pid}");
        let status = std::process::Command::new("kill").args(["-TERM", &target]).status();
        if let Err(e) = status {
            warn!(error = %e, pid, "failed to send SIGTERM to gate process group");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .status();
    }
}

fn parse_test_counts(output: &str) -> (u32, u32) {
    // cargo: "test result: ok. 3 passed; 0 failed"
    if let Some(caps) = Regex::new(r"(\d+) passed;\s*(\d+) failed")
        .unwrap()
        .captures(output)
    {
        let passed: u32 = caps[1].parse().unwrap_or(0);
        let failed: u32 = caps[2].parse().unwrap_or(0);
        return (passed, failed);
    }
    // pytest: "3 passed, 1 failed"
    if let Some(caps) = Regex::new(r"(\d+) passed(?:,\s*(\d+) failed)?")
        .unwrap()
        .captures(output)
    {
        let passed: u32 = caps[1].parse().unwrap_or(0);
        let failed: u32 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        return (passed, failed);
    }
    // go test: "--- FAIL:" / "--- PASS:" lines
    let passed = output.matches("--- PASS:").count() as u32;
    let failed = output.matches("--- FAIL:").count() as u32;
    (passed, failed)
}

pub struct QualityGateRunner {
    timeout: Duration,
}

impl QualityGateRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn run_build_gate(
        &self,
        worktree: &Path,
        after_wave: u32,
        cancel: &CancellationToken,
    ) -> Result<GateResult, GateError> {
        normalize_line_endings(worktree)?;

        let Some(toolchain) = detect_toolchain(worktree) else {
            return Err(GateError::NoToolchainDetected(worktree.to_path_buf()));
        };

        if toolchain.needs_dotnet_restore {
            let (ok, output, cancelled) =
                run_subprocess(worktree, &["dotnet".into(), "restore".into()], self.timeout, cancel).await?;
            if cancelled {
                return Ok(cancelled_result(GateType::Build, after_wave));
            }
            if !ok {
                return Ok(GateResult {
                    passed: false,
                    gate_type: GateType::Build,
                    after_wave,
                    build_output: output.clone(),
                    test_output: String::new(),
                    tests_passed: 0,
                    tests_failed: 0,
                    error: Some("dotnet restore failed".to_string()),
                    was_cancelled: false,
                });
            }
        }

        let (passed, output, cancelled) =
            run_subprocess(worktree, &toolchain.build_command, self.timeout, cancel).await?;
        if cancelled {
            return Ok(cancelled_result(GateType::Build, after_wave));
        }

        Ok(GateResult {
            passed,
            gate_type: GateType::Build,
            after_wave,
            build_output: output,
            test_output: String::new(),
            tests_passed: 0,
            tests_failed: 0,
            error: if passed { None } else { Some("build failed".to_string()) },
            was_cancelled: false,
        })
    }

    pub async fn run_test_gate(
        &self,
        worktree: &Path,
        after_wave: u32,
        cancel: &CancellationToken,
    ) -> Result<GateResult, GateError> {
        let Some(toolchain) = detect_toolchain(worktree) else {
            return Err(GateError::NoToolchainDetected(worktree.to_path_buf()));
        };

        let (passed, output, cancelled) =
            run_subprocess(worktree, &toolchain.test_command, self.timeout, cancel).await?;
        if cancelled {
            return Ok(cancelled_result(GateType::Test, after_wave));
        }

        let (tests_passed, tests_failed) = parse_test_counts(&output);
        Ok(GateResult {
            passed: passed && tests_failed == 0,
            gate_type: GateType::Test,
            after_wave,
            build_output: String::new(),
            test_output: output,
            tests_passed,
            tests_failed,
            error: if passed { None } else { Some("tests failed".to_string()) },
            was_cancelled: false,
        })
    }

    /// Build then test; short-circuits on build failure.
    pub async fn run_full_gate(
        &self,
        worktree: &Path,
        after_wave: u32,
        cancel: &CancellationToken,
    ) -> Result<GateResult, GateError> {
        let build = self.run_build_gate(worktree, after_wave, cancel).await?;
        if build.was_cancelled {
            return Ok(GateResult { gate_type: GateType::Full, ..build });
        }
        if !build.passed {
            return Ok(GateResult {
                gate_type: GateType::Full,
                ..build
            });
        }

        let test = self.run_test_gate(worktree, after_wave, cancel).await?;
        Ok(GateResult {
            passed: test.passed,
            gate_type: GateType::Full,
            after_wave,
            build_output: build.build_output,
            test_output: test.test_output,
            tests_passed: test.tests_passed,
            tests_failed: test.tests_failed,
            error: test.error,
            was_cancelled: test.was_cancelled,
        })
    }
}

fn cancelled_result(gate_type: GateType, after_wave: u32) -> GateResult {
    GateResult {
        passed: false,
        gate_type,
        after_wave,
        build_output: String::new(),
        test_output: String::new(),
        tests_passed: 0,
        tests_failed: 0,
        error: None,
        was_cancelled: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cargo_toolchain() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname=\"x\"").unwrap();
        let toolchain = detect_toolchain(dir.path()).unwrap();
        assert_eq!(toolchain.build_command, vec!["cargo", "build"]);
    }

    #[test]
    fn falls_back_to_make_when_nothing_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "build:\n\ttrue").unwrap();
        let toolchain = detect_toolchain(dir.path()).unwrap();
        assert_eq!(toolchain.build_command, vec!["make", "build"]);
    }

    #[test]
    fn no_toolchain_detected_for_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_toolchain(dir.path()).is_none());
    }

    #[test]
    fn normalizes_crlf_skipping_vendored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn x() {}\r\n").unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target/b.rs"), "fn y() {}\r\n").unwrap();

        normalize_line_endings(dir.path()).unwrap();

        let a = std::fs::read(dir.path().join("a.rs")).unwrap();
        assert!(!a.contains(&b'\r'));
        let b = std::fs::read(dir.path().join("target/b.rs")).unwrap();
        assert!(b.contains(&b'\r'));
    }

    #[test]
    fn parses_cargo_test_counts() {
        let output = "test result: ok. 5 passed; 1 failed; 0 ignored";
        assert_eq!(parse_test_counts(output), (5, 1));
    }

    #[tokio::test]
    async fn cancelled_build_gate_is_reported_without_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "build:\n\tsleep 30").unwrap();
        let runner = QualityGateRunner::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner.run_build_gate(dir.path(), 1, &cancel).await.unwrap();
        assert!(result.was_cancelled);
        assert!(result.error.is_none());
    }
}
