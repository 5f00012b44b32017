//! Host command execution.

use std::io;
use std::process::{Command, Stdio};

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run `program` with `args` to completion, capturing stdout and stderr.
///
/// On Windows the program is resolved through `cmd /C` so that batch shims
/// such as `conda.bat` on `PATH` are found.
pub fn run_command(program: &str, args: &[&str]) -> io::Result<RunOutput> {
    let mut command = configured_command(program, args);
    command.stdin(Stdio::null());

    let output = command.output()?;
    Ok(RunOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Human-readable form of a command line, for logs and diagnostics.
pub fn display_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(windows)]
fn configured_command(program: &str, args: &[&str]) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(program).args(args);
    command
}

#[cfg(not(windows))]
fn configured_command(program: &str, args: &[&str]) -> Command {
    let mut command = Command::new(program);
    command.args(args);
    command
}
