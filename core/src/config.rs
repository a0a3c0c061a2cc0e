//! Launch files: processes to start, described in TOML
//!
//! ```toml
//! [[process]]
//! name = "swap"
//! program = "/bin/sh"
//! args = ["-c", "exit 3"]
//! inherit_stdio = true
//! fds = [{ source = 5, target = 3 }]
//! ```
//!
//! Parsing goes through `serde`; [`LaunchFile::validate`] then checks every
//! entry and reports failures with field paths such as
//! `process[1].fds[0].target`.

use crate::fdmap::{find_fault, FdMapping};
use crate::process::Process;
use crate::{ProcessError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Top-level TOML structure of a launch file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchFile {
    /// Processes to start, in order
    #[serde(rename = "process", default)]
    pub processes: Vec<LaunchSpec>,
}

/// One process to start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Label used in logs; defaults to the program path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Map stdin, stdout and stderr onto themselves before `fds`
    #[serde(default)]
    pub inherit_stdio: bool,
    #[serde(default)]
    pub fds: Vec<FdMapping>,
}

impl LaunchSpec {
    /// Label for logs
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.program)
    }

    /// The mapping handed to [`run`](crate::run): stdio first when inherited,
    /// then the explicit entries
    pub fn fd_mapping(&self) -> Vec<FdMapping> {
        let mut mapping = Vec::with_capacity(self.fds.len() + 3);
        if self.inherit_stdio {
            mapping.extend(FdMapping::inherit_stdio());
        }
        mapping.extend_from_slice(&self.fds);
        mapping
    }

    /// Start this process
    pub fn launch(&self) -> Result<Process> {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        let mapping = self.fd_mapping();
        debug!("Launching '{}'", self.label());
        crate::run(&self.program, &args, Some(mapping.as_slice()))
    }

    fn validate(&self, index: usize) -> Result<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(ProcessError::ValidationError(format!(
                    "process[{}].name: cannot be empty",
                    index
                )));
            }
        }
        if self.program.trim().is_empty() {
            return Err(ProcessError::ValidationError(format!(
                "process[{}].program: cannot be empty",
                index
            )));
        }
        if self.program.contains('\0') {
            return Err(ProcessError::ValidationError(format!(
                "process[{}].program: cannot contain NUL bytes",
                index
            )));
        }
        if let Some(j) = self.args.iter().position(|arg| arg.contains('\0')) {
            return Err(ProcessError::ValidationError(format!(
                "process[{}].args[{}]: cannot contain NUL bytes",
                index, j
            )));
        }

        // stdio entries come first, so fault positions past them index `fds`
        let stdio = if self.inherit_stdio { 3 } else { 0 };
        if let Some((at, msg)) = find_fault(&self.fd_mapping()) {
            let field = if msg.starts_with("duplicate") {
                ".target"
            } else {
                ""
            };
            return Err(ProcessError::ValidationError(format!(
                "process[{}].fds[{}]{}: {}",
                index,
                at.saturating_sub(stdio),
                field,
                msg
            )));
        }
        Ok(())
    }
}

impl LaunchFile {
    /// Validate the file and return field-path errors
    pub fn validate(&self) -> Result<()> {
        if self.processes.is_empty() {
            return Err(ProcessError::ValidationError(
                "process: must contain at least one entry".to_string(),
            ));
        }
        for (i, spec) in self.processes.iter().enumerate() {
            spec.validate(i)?;
        }
        Ok(())
    }
}

/// Load a launch file from a TOML file path
pub fn load_launch_file_from_toml_path(path: impl AsRef<Path>) -> Result<LaunchFile> {
    let data = fs::read_to_string(&path).map_err(|e| {
        ProcessError::ConfigurationError(format!(
            "Failed to read launch file {:?}: {}",
            path.as_ref(),
            e
        ))
    })?;
    load_launch_file_from_toml_str(&data)
}

/// Load a launch file from a TOML string
pub fn load_launch_file_from_toml_str(input: &str) -> Result<LaunchFile> {
    let file: LaunchFile = toml::from_str(input)
        .map_err(|e| ProcessError::ConfigurationError(format!("TOML parse error: {}", e)))?;
    file.validate()?;
    Ok(file)
}
