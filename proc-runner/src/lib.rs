//! External tool invocation with per-map log teeing.
//!
//! Every invocation receives its argv as a list — never a shell string —
//! captures both stdout and stderr, appends them to the caller-supplied
//! log file prefixed by the full command line, and reports a non-zero exit
//! as a structured error carrying the stderr tail. A tool failure never
//! exits the hosting process.

use std::io::Write;
use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};

/// How much stderr to keep in a failure report.
const STDERR_TAIL_BYTES: usize = 2000;

#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("empty command")]
    EmptyCommand,
    #[error("could not spawn {program:?}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program:?} exited with {status}: {stderr_tail}")]
    NonZeroExit {
        program: String,
        status: String,
        stderr_tail: String,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Captured output of a successful invocation.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `argv`, teeing combined output into `log_path` when given.
pub fn run_logged(argv: &[String], log_path: Option<&Path>) -> Result<ToolOutput> {
    let (program, args) = argv.split_first().ok_or(RunnerError::EmptyCommand)?;
    debug!(command = %argv.join(" "), "running external tool");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| RunnerError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if let Some(log_path) = log_path {
        let mut entry = format!("\nLog from command: {}\n", argv.join(" "));
        entry.push_str(&stdout);
        entry.push_str(&stderr);
        append_raw(log_path, &entry)?;
    }

    if !output.status.success() {
        warn!(command = %argv.join(" "), status = %output.status, "external tool failed");
        let tail_start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
        return Err(RunnerError::NonZeroExit {
            program: program.clone(),
            status: output.status.to_string(),
            stderr_tail: stderr[tail_start..].to_string(),
        });
    }

    Ok(ToolOutput { stdout, stderr })
}

/// Append one line to a build log; used for stage banners alongside the
/// tool output tee.
pub fn append_log_line(log_path: &Path, line: &str) -> Result<()> {
    append_raw(log_path, &format!("{line}\n"))
}

fn append_raw(log_path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    f.write_all(text.as_bytes())?;
    Ok(())
}

/// Read the log from `offset`, returning the new text and the offset to
/// resume from. Readers poll by byte offset; the file is append-only.
pub fn read_log_from(log_path: &Path, offset: u64) -> Result<(String, u64)> {
    let bytes = match std::fs::read(log_path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((String::new(), offset)),
        Err(e) => return Err(e.into()),
    };
    let start = (offset as usize).min(bytes.len());
    let text = String::from_utf8_lossy(&bytes[start..]).into_owned();
    Ok((text, bytes.len() as u64))
}
