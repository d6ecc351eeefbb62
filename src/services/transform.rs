use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

/// Which entities survive filtering. Empty lists impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionCriteria {
    pub guids: Vec<String>,
    pub ifc_types: Vec<String>,
    pub storeys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    /// The transformation ran out of memory or was killed for it.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    Failed(String),
}

/// The model filtering operation.
///
/// Implementations are blocking and run on the worker pool's threads. On
/// success a new file exists at `output`; on failure nothing should be read
/// from it.
pub trait Transformer: Send + Sync + 'static {
    fn transform(
        &self,
        input: &Path,
        output: &Path,
        criteria: &SelectionCriteria,
    ) -> Result<(), TransformError>;
}

impl<F> Transformer for F
where
    F: Fn(&Path, &Path, &SelectionCriteria) -> Result<(), TransformError> + Send + Sync + 'static,
{
    fn transform(
        &self,
        input: &Path,
        output: &Path,
        criteria: &SelectionCriteria,
    ) -> Result<(), TransformError> {
        self(input, output, criteria)
    }
}

/// Runs an external filter program:
/// `<program> <args..> <input> <output> [--guid G].. [--type T].. [--storey S]..`
#[derive(Debug, Clone)]
pub struct CommandTransformer {
    program: String,
    base_args: Vec<String>,
}

impl CommandTransformer {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// Build from a whitespace separated command line such as `ifc-splitter split`.
    pub fn from_command_line(command_line: &str) -> Result<Self, TransformError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| TransformError::Failed("transform command is empty".to_string()))?;
        Ok(Self::new(program, parts.collect()))
    }

    fn args(&self, input: &Path, output: &Path, criteria: &SelectionCriteria) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.base_args.iter().map(OsString::from).collect();
        args.push(input.as_os_str().to_owned());
        args.push(output.as_os_str().to_owned());

        let flags = [
            ("--guid", &criteria.guids),
            ("--type", &criteria.ifc_types),
            ("--storey", &criteria.storeys),
        ];
        for (flag, values) in flags {
            for value in values {
                args.push(flag.into());
                args.push(value.into());
            }
        }
        args
    }
}

impl Transformer for CommandTransformer {
    fn transform(
        &self,
        input: &Path,
        output: &Path,
        criteria: &SelectionCriteria,
    ) -> Result<(), TransformError> {
        let result = Command::new(&self.program)
            .args(self.args(input, output, criteria))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| TransformError::Failed(format!("failed to launch {}: {e}", self.program)))?;

        if result.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&result.stderr);
        Err(classify_failure(result.status, &stderr))
    }
}

fn classify_failure(status: ExitStatus, stderr: &str) -> TransformError {
    let last_line = stderr
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .map(str::to_string);

    let lowered = stderr.to_lowercase();
    if killed_by_oom(status) || lowered.contains("memoryerror") || lowered.contains("out of memory") {
        return TransformError::ResourceExhausted(
            last_line.unwrap_or_else(|| "process was killed".to_string()),
        );
    }

    TransformError::Failed(last_line.unwrap_or_else(|| format!("transform exited with {status}")))
}

// The kernel OOM killer delivers SIGKILL.
#[cfg(unix)]
fn killed_by_oom(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(9)
}

#[cfg(not(unix))]
fn killed_by_oom(_status: ExitStatus) -> bool {
    false
}
