//! GOROOT resolution.
//!
//! Priority order: explicit override, the caller-supplied `GOROOT`
//! environment value, then `go env GOROOT`. Ambient process state is never
//! read here; the caller passes the environment value in so the resolver is
//! testable with injected fakes.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long to wait for `go env GOROOT` before killing it.
pub const DEFAULT_INTROSPECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("go binary not found; set --goroot or GOROOT")]
    BinaryMissing,

    #[error("failed to run 'go env GOROOT' (exit status {status}); set --goroot or GOROOT")]
    CommandFailed { status: String },

    #[error("'go env GOROOT' produced no output; set --goroot or GOROOT")]
    EmptyOutput,

    #[error("'go env GOROOT' did not finish within {timeout:?}; set --goroot or GOROOT")]
    TimedOut { timeout: Duration },

    #[error("failed to invoke {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },
}

/// Resolve the toolchain root.
///
/// `explicit` wins outright, then a non-empty `env_value`, then the
/// toolchain's own introspection command. Each introspection failure mode
/// maps to its own [`ResolveError`] variant so callers can tell "Go not
/// installed" from "Go installed but misconfigured".
pub fn resolve_goroot(
    explicit: Option<&Path>,
    env_value: Option<&str>,
    go_binary: &Path,
    timeout: Duration,
) -> Result<PathBuf, ResolveError> {
    if let Some(path) = explicit {
        if !path.as_os_str().is_empty() {
            return Ok(path.to_path_buf());
        }
    }

    if let Some(value) = env_value {
        if !value.is_empty() {
            return Ok(PathBuf::from(value));
        }
    }

    introspect_goroot(go_binary, timeout)
}

/// Ask the toolchain itself: `go env GOROOT`, trimmed stdout.
fn introspect_goroot(go_binary: &Path, timeout: Duration) -> Result<PathBuf, ResolveError> {
    let mut child = Command::new(go_binary)
        .args(["env", "GOROOT"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ResolveError::BinaryMissing
            } else {
                ResolveError::Spawn {
                    binary: go_binary.to_path_buf(),
                    source,
                }
            }
        })?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ResolveError::TimedOut { timeout });
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(source) => {
                return Err(ResolveError::Spawn {
                    binary: go_binary.to_path_buf(),
                    source,
                });
            }
        }
    };

    if !status.success() {
        return Err(ResolveError::CommandFailed {
            status: status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
        });
    }

    let mut output = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        use std::io::Read;
        stdout
            .read_to_string(&mut output)
            .map_err(|source| ResolveError::Spawn {
                binary: go_binary.to_path_buf(),
                source,
            })?;
    }

    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(ResolveError::EmptyOutput);
    }

    Ok(PathBuf::from(trimmed))
}
