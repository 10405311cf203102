// ============================================
// winprovision - process.rs
// ============================================
// Running external programs (winget, choco, scoop, dism, powershell).
//
// Everything that spawns a process goes through the CommandRunner trait
// so the orchestrator and adapters can be exercised with a fake runner.
// ============================================

use std::io;
use std::path::PathBuf;
use std::process::Command;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Hide the console window of child processes on Windows.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated without one
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[cfg(test)]
impl CommandOutput {
    pub fn with_code(code: i32) -> Self {
        CommandOutput {
            code: Some(code),
            ..Default::default()
        }
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }
}

impl CommandOutput {
    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Spawns programs and locates them on PATH.
pub trait CommandRunner {
    /// Run `program` with `args` to completion, capturing output.
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;

    /// Resolve a program name on PATH (honouring PATHEXT on Windows).
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Runs real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        // .cmd / .ps1 shims (scoop) only resolve through `which`
        let resolved = which::which(program).unwrap_or_else(|_| PathBuf::from(program));
        tracing::debug!("running {} {:?}", resolved.display(), args);

        let mut command = Command::new(&resolved);
        command.args(args);

        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let output = command.output()?;
        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::trace!("{} exited with {:?}", program, result.code);
        Ok(result)
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Quote a string as a PowerShell single-quoted literal.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Arguments for running an inline PowerShell command.
pub fn powershell_command_args(script: &str) -> Vec<String> {
    vec![
        "-NoProfile".to_string(),
        "-NonInteractive".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
        script.to_string(),
    ]
}

#[cfg(test)]
pub mod fake {
    //! A scripted runner for tests.

    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    /// Returns canned outputs keyed by "program first-arg", records every call.
    #[derive(Default)]
    pub struct FakeRunner {
        responses: RefCell<HashMap<String, Vec<CommandOutput>>>,
        available: RefCell<HashSet<String>>,
        calls: RefCell<Vec<(String, Vec<String>)>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Mark `program` as present on PATH.
        pub fn provide(&self, program: &str) -> &Self {
            self.available.borrow_mut().insert(program.to_string());
            self
        }

        /// Queue a response for calls whose "program first-arg" key matches.
        /// The last queued response repeats once the queue drains.
        pub fn respond(&self, key: &str, output: CommandOutput) -> &Self {
            self.responses
                .borrow_mut()
                .entry(key.to_string())
                .or_default()
                .push(output);
            self
        }

        pub fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.borrow().clone()
        }

        pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
            self.calls
                .borrow()
                .iter()
                .filter(|(p, _)| p == program)
                .map(|(_, a)| a.clone())
                .collect()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
            self.calls
                .borrow_mut()
                .push((program.to_string(), args.to_vec()));

            let key = match args.first() {
                Some(first) => format!("{program} {first}"),
                None => program.to_string(),
            };

            let mut responses = self.responses.borrow_mut();
            match responses.get_mut(&key).filter(|q| !q.is_empty()) {
                Some(q) if q.len() > 1 => Ok(q.remove(0)),
                Some(q) => Ok(q[0].clone()),
                None => Ok(CommandOutput::with_code(0)),
            }
        }

        fn locate(&self, program: &str) -> Option<PathBuf> {
            self.available
                .borrow()
                .contains(program)
                .then(|| PathBuf::from(program))
        }
    }
}
