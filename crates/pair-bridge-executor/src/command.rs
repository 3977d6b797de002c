//! Building the command line for subprocess pair agents.

use std::path::{Path, PathBuf};

use pair_bridge_core::AdapterError;
use thiserror::Error;

/// Command build error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandBuildError {
    #[error("Command line cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Command line is empty")]
    EmptyCommand,
}

impl From<CommandBuildError> for AdapterError {
    fn from(err: CommandBuildError) -> Self {
        Self::InvalidCommand(err.to_string())
    }
}

/// Program plus arguments, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if the program is not an existing file and is not on
    /// `PATH`.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), AdapterError> {
        let Self { program, args } = self;
        let executable = resolve_executable(&program)
            .await
            .ok_or(AdapterError::ExecutableNotFound(program))?;
        Ok((executable, args))
    }
}

/// Configured agent command line plus per-launch arguments.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    base: String,
    params: Vec<String>,
}

impl CommandBuilder {
    /// Start from a shell-style command line such as `codex --model o3`.
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    /// Append arguments after the base command line.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.params.push(arg.into());
        self
    }

    /// Split the base and append the extra arguments.
    ///
    /// # Errors
    /// Returns error if the base has unbalanced quotes or is empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = shlex::split(&self.base).ok_or_else(|| CommandBuildError::InvalidBase(self.base.clone()))?;
        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        parts.extend(self.params.iter().cloned());

        let program = parts.remove(0);
        Ok(CommandParts { program, args: parts })
    }
}

/// Find an executable by explicit path or on `PATH`.
pub async fn resolve_executable(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
