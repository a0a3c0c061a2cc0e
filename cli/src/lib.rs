//! Command-line front end for brood-core
//!
//! Turns command-line words into programs, arguments and descriptor mappings,
//! starts the children and reports how they ended.

pub mod error;

pub use error::{CliError, Result};

use brood_core::{load_launch_file_from_toml_path, FdMapping, Process, ProcessError, Signal};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use tracing::{info, warn};

/// Parse a `--map` value: `SRC:DST` moves SRC onto DST, a bare `FD` keeps it
pub fn parse_mapping(value: &str) -> Result<FdMapping> {
    let invalid = || {
        CliError::InvalidArgument(format!(
            "invalid fd mapping '{}': expected SRC:DST or FD",
            value
        ))
    };
    let fd = |part: &str| part.trim().parse::<i32>().ok().filter(|&fd| fd >= 0);

    match value.split_once(':') {
        Some((source, target)) => Ok(FdMapping::new(
            fd(source).ok_or_else(invalid)?,
            fd(target).ok_or_else(invalid)?,
        )),
        None => fd(value).map(FdMapping::keep).ok_or_else(invalid),
    }
}

/// Build the full mapping for `brood run`
pub fn build_mapping(maps: &[String], inherit_stdio: bool) -> Result<Vec<FdMapping>> {
    let mut mapping = Vec::with_capacity(maps.len() + 3);
    if inherit_stdio {
        mapping.extend(FdMapping::inherit_stdio());
    }
    for value in maps {
        mapping.push(parse_mapping(value)?);
    }
    brood_core::validate_mapping(&mapping)?;
    Ok(mapping)
}

/// Shell-style exit code: the exit status, or 128 + signal number
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// One-line summary of how a process ended
pub fn describe(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(number)) => match Signal::try_from(number) {
            Ok(signal) => format!("killed by {}", signal.as_str()),
            Err(_) => format!("killed by signal {}", number),
        },
        (None, None) => "ended".to_string(),
    }
}

/// `brood run`: start one program, wait for it and return its exit code
pub fn run_program(
    program: &str,
    args: &[String],
    maps: &[String],
    inherit_stdio: bool,
) -> Result<i32> {
    let mapping = build_mapping(maps, inherit_stdio)?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let child = brood_core::run(program, &args, Some(mapping.as_slice()))?;
    let status = wait_for(&child)?;
    info!("{} {}", program, describe(status));
    Ok(exit_code(status))
}

/// `brood launch`: start every process in a launch file, wait for all of them
/// and print one line per process. Returns 0 when all succeeded, 1 otherwise.
pub fn launch_file(path: &Path) -> Result<i32> {
    let file = load_launch_file_from_toml_path(path).map_err(|e| match e {
        ProcessError::ConfigurationError(msg) | ProcessError::ValidationError(msg) => {
            CliError::ConfigError(msg)
        }
        other => other.into(),
    })?;

    let mut started = Vec::with_capacity(file.processes.len());
    for spec in &file.processes {
        match spec.launch() {
            Ok(child) => started.push((spec.label(), child)),
            Err(e) => {
                for (_, child) in &started {
                    let _ = child.kill(false);
                    let _ = child.wait();
                }
                return Err(CliError::CommandFailed(format!(
                    "failed to launch '{}': {}",
                    spec.label(),
                    e
                )));
            }
        }
    }

    let mut failures = 0;
    for (label, child) in &started {
        let status = wait_for(child)?;
        if !status.success() {
            failures += 1;
        }
        println!("{}: {}", label, describe(status));
    }
    if failures > 0 {
        warn!("{} of {} processes failed", failures, started.len());
        return Ok(1);
    }
    Ok(0)
}

fn wait_for(child: &Process) -> Result<ExitStatus> {
    Ok(child.wait()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mapping_pair() {
        assert_eq!(parse_mapping("5:3").unwrap(), FdMapping::new(5, 3));
        assert_eq!(parse_mapping(" 0 : 1 ").unwrap(), FdMapping::new(0, 1));
    }

    #[test]
    fn test_parse_mapping_keep() {
        assert_eq!(parse_mapping("2").unwrap(), FdMapping::keep(2));
    }

    #[test]
    fn test_parse_mapping_rejects_garbage() {
        for value in ["", "a:b", "3:", ":3", "-1:3", "1:2:3"] {
            assert!(
                matches!(parse_mapping(value), Err(CliError::InvalidArgument(_))),
                "accepted {:?}",
                value
            );
        }
    }

    #[test]
    fn test_build_mapping_with_stdio() {
        let mapping = build_mapping(&["7:3".to_string()], true).unwrap();
        assert_eq!(mapping.len(), 4);
        assert_eq!(mapping[3], FdMapping::new(7, 3));
    }

    #[test]
    fn test_build_mapping_rejects_duplicate_target() {
        let err = build_mapping(&["7:1".to_string()], true).unwrap_err();
        assert!(matches!(
            err,
            CliError::ProcessError(ProcessError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_exit_code_and_description() {
        let exited = ExitStatus::from_raw(3 << 8);
        assert_eq!(exit_code(exited), 3);
        assert_eq!(describe(exited), "exited with code 3");

        // raw wait status of a child killed by SIGKILL
        let killed = ExitStatus::from_raw(Signal::SIGKILL as i32);
        assert_eq!(exit_code(killed), 137);
        assert_eq!(describe(killed), "killed by SIGKILL");
    }
}
