//! Command execution seam for node-side actions.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code; `None` if killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Short failure description: exit code plus first stderr line.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        let code = self
            .status
            .map_or_else(|| "signal".to_string(), |c| format!("exit {c}"));
        match self.stderr.lines().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("{code}: {}", line.trim()),
            None => code,
        }
    }
}

/// Runs a program with arguments on the local node.
///
/// A spawn failure (program missing) is an `Err`; a non-zero exit is an
/// `Ok` with the status set.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runner backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Scripted reply for [`ScriptedRunner`].
#[derive(Debug, Clone)]
pub enum Scripted {
    Output(CommandOutput),
    /// Program is not installed
    Missing,
    /// Reply after a delay
    Delayed(Duration, CommandOutput),
}

/// Runner that replays canned responses instead of touching the host.
///
/// Responses are keyed by the full command line (`program arg1 arg2`) or,
/// failing that, by the program name. Keyed queues are consumed in order;
/// the last entry repeats. Unscripted commands succeed with empty output.
/// Every call is recorded.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    replies: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for a command line or program name.
    #[must_use]
    pub fn on(self, command: &str, reply: Scripted) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Shorthand for a successful reply.
    #[must_use]
    pub fn ok(self, command: &str, stdout: &str) -> Self {
        self.on(command, Scripted::Output(CommandOutput::ok(stdout)))
    }

    /// Shorthand for a failing reply.
    #[must_use]
    pub fn fail(self, command: &str, code: i32, stderr: &str) -> Self {
        self.on(command, Scripted::Output(CommandOutput::failed(code, stderr)))
    }

    /// Command lines run so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn next_reply(&self, line: &str, program: &str) -> Option<Scripted> {
        let mut replies = self
            .replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let queue = if replies.contains_key(line) {
            replies.get_mut(line)
        } else {
            replies.get_mut(program)
        }?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

/// Render a program and its args as one command line.
#[must_use]
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let line = command_line(program, args);
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(line.clone());

        match self.next_reply(&line, program) {
            None => Ok(CommandOutput::ok("")),
            Some(Scripted::Output(out)) => Ok(out),
            Some(Scripted::Missing) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{program}: command not found"),
            )),
            Some(Scripted::Delayed(delay, out)) => {
                tokio::time::sleep(delay).await;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_scripted_runner_prefers_full_line() {
        let runner = ScriptedRunner::new()
            .fail("systemctl", 1, "generic")
            .ok("systemctl --version", "systemd 252");

        let out = runner.run("systemctl", &args(&["--version"])).await.unwrap();
        assert!(out.success());
        let out = runner
            .run("systemctl", &args(&["restart", "nginx"]))
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(
            runner.calls(),
            vec!["systemctl --version", "systemctl restart nginx"]
        );
    }

    #[tokio::test]
    async fn test_scripted_queue_repeats_last() {
        let runner = ScriptedRunner::new().ok("df", "95%").ok("df", "70%");
        assert_eq!(runner.run("df", &[]).await.unwrap().stdout, "95%");
        assert_eq!(runner.run("df", &[]).await.unwrap().stdout, "70%");
        assert_eq!(runner.run("df", &[]).await.unwrap().stdout, "70%");
    }

    #[tokio::test]
    async fn test_missing_program_is_error() {
        let runner = ScriptedRunner::new().on("service", Scripted::Missing);
        let err = runner.run("service", &[]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_failure_summary() {
        let out = CommandOutput::failed(5, "\nUnit nginx.service not found.\nmore");
        assert_eq!(out.failure_summary(), "exit 5: Unit nginx.service not found.");
        assert_eq!(CommandOutput::failed(1, "").failure_summary(), "exit 1");
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let out = SystemRunner.run("echo", &args(&["hello"])).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }
}
