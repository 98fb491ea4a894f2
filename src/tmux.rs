use std::path::Path;
use std::process::{Command, Output};

use tracing::{debug, trace, warn};

use crate::{Error, Result};

/// Prefix shared by every session this crate creates.
pub const SESSION_PREFIX: &str = "conductor_";

pub struct Tmux;

impl Tmux {
    /// Create a detached session running `cmd` through `sh -c`.
    ///
    /// `env` is passed with `-e`, so the variables reach the worker without
    /// leaking into the caller's tmux server environment. The pane stays
    /// around after the command exits so a dead worker can be detected.
    pub fn create_session(name: &str, cwd: &Path, cmd: &str, env: &[(&str, String)]) -> Result<()> {
        if cmd.trim().is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }

        let cwd = cwd.display().to_string();
        let shell_cmd = format!("sh -c {}", shell_escape(cmd));
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            name.into(),
            "-c".into(),
            cwd.clone(),
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(shell_cmd.clone());

        debug!(session = name, cwd = %cwd, cmd = %shell_cmd, "Tmux::create_session");
        let output = run_tmux(&args)?;
        if !output.status.success() {
            let err = format!("Failed to create session '{}': {}", name, stderr(&output));
            warn!("tmux create_session failed: {}", err);
            return Err(Error::Tmux(err));
        }

        // Keep the pane when the command exits so pane_dead can see it.
        let _ = run_tmux(&["set-option", "-t", name, "remain-on-exit", "on"]);

        debug!(session = name, "Tmux session created");
        Ok(())
    }

    pub fn kill_session(name: &str) -> Result<()> {
        debug!(session = name, "Tmux::kill_session");
        let output = run_tmux(&["kill-session", "-t", name])?;
        if !output.status.success() {
            let stderr = stderr(&output);
            if !stderr.contains("session not found") && !stderr.contains("can't find session") {
                warn!(session = name, %stderr, "Failed to kill tmux session");
                return Err(Error::Tmux(format!("Failed to kill session '{}': {}", name, stderr)));
            }
            debug!(session = name, "Tmux session not found (already dead?)");
        }
        Ok(())
    }

    /// Capture only the last `lines` lines of a pane.
    ///
    /// Restricting to the tail keeps earlier output from matching status
    /// patterns.
    pub fn capture_pane_tail(name: &str, lines: u16) -> Result<String> {
        let start = format!("-{}", lines);
        let output = run_tmux(&["capture-pane", "-t", name, "-p", "-S", &start])?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to capture pane tail '{}': {}",
                name,
                stderr(&output)
            )));
        }
        let content = String::from_utf8_lossy(&output.stdout).to_string();
        trace!(session = name, bytes = content.len(), "capture_pane_tail");
        Ok(content)
    }

    pub fn session_exists(name: &str) -> bool {
        run_tmux(&["has-session", "-t", name])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Whether the session's pane command has exited.
    pub fn pane_dead(name: &str) -> Result<bool> {
        let output = run_tmux(&["display-message", "-t", name, "-p", "#{pane_dead}"])?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to query pane state for '{}': {}",
                name,
                stderr(&output)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "1")
    }

    /// Paste `text` into the pane as one bracketed paste.
    ///
    /// Goes through a named buffer rather than `send-keys` so multi-line
    /// payloads are not submitted line by line.
    pub fn paste_text(name: &str, text: &str) -> Result<()> {
        debug!(session = name, bytes = text.len(), "Tmux::paste_text");
        let buffer = format!("{}buf", name);
        let mut child = Command::new("tmux")
            .args(["load-buffer", "-b", &buffer, "-"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            use std::io::Write;
            stdin.write_all(text.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to load buffer for '{}': {}",
                name,
                stderr(&output)
            )));
        }

        let output = run_tmux(&["paste-buffer", "-p", "-d", "-b", &buffer, "-t", name])?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to paste into '{}': {}",
                name,
                stderr(&output)
            )));
        }
        Ok(())
    }

    pub fn send_enter(name: &str) -> Result<()> {
        let output = run_tmux(&["send-keys", "-t", name, "Enter"])?;
        if !output.status.success() {
            warn!(session = name, stderr = %stderr(&output), "Failed to send Enter");
            return Err(Error::Tmux(format!(
                "Failed to send keys to '{}': {}",
                name,
                stderr(&output)
            )));
        }
        Ok(())
    }

    pub fn list_sessions() -> Result<Vec<String>> {
        let output = run_tmux(&["list-sessions", "-F", "#{session_name}"])?;
        if !output.status.success() {
            debug!("No tmux sessions found");
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect())
    }

    /// Sessions created by this crate, possibly left over from a killed run.
    pub fn list_conductor_sessions() -> Result<Vec<String>> {
        let sessions: Vec<String> = Self::list_sessions()?
            .into_iter()
            .filter(|s| s.starts_with(SESSION_PREFIX))
            .collect();
        debug!(count = sessions.len(), "list_conductor_sessions");
        Ok(sessions)
    }

    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    pub fn session_name(task: &str, port: u16) -> String {
        format!("{}{}_{}", SESSION_PREFIX, sanitize_session_name(task), port)
    }
}

fn run_tmux<S: AsRef<std::ffi::OsStr>>(args: &[S]) -> Result<Output> {
    Ok(Command::new("tmux").args(args).output()?)
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

pub(crate) fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

fn sanitize_session_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
