//! Subprocess prompter: the agent's only source of interaction with a
//! human. Isolated behind the two synchronous calls below rather than
//! mixing `fork`/`exec` concerns into callers, per spec §9's explicit note
//! to avoid the original's intermingling of process control with the rest
//! of the agent's state.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

const MAX_ASKPASS_OUTPUT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
    Error,
}

/// Lazily resolves `SSH_ASKPASS`/`SSH_CONFIRM` once and remembers the
/// result for the process lifetime, mirroring the original's
/// `if (askpass == NULL) askpass = getenv(...)` caching (spec §4.3
/// supplement): once resolved, a later change to the environment variable
/// has no effect.
pub struct Prompter {
    askpass: OnceLock<Option<String>>,
    confirm: OnceLock<Option<String>>,
    /// Set by `-a`-equivalent configuration; if present, takes priority
    /// over `SSH_ASKPASS` and is never re-resolved.
    configured_askpass: Option<String>,
}

impl Prompter {
    pub fn new(configured_askpass: Option<String>) -> Self {
        Prompter {
            askpass: OnceLock::new(),
            confirm: OnceLock::new(),
            configured_askpass,
        }
    }

    fn askpass_path(&self) -> Option<&str> {
        if let Some(p) = &self.configured_askpass {
            return Some(p.as_str());
        }
        self.askpass
            .get_or_init(|| std::env::var("SSH_ASKPASS").ok())
            .as_deref()
    }

    fn confirm_path(&self) -> Option<&str> {
        self.confirm
            .get_or_init(|| std::env::var("SSH_CONFIRM").ok())
            .as_deref()
    }

    /// Spawn the configured askpass helper with `prompt` as argv[1],
    /// capture at most 1 KiB of stdout, strip a trailing CR/LF. Returns
    /// `None` if no helper is configured, it fails to spawn, or it exits
    /// non-zero.
    pub fn ask(&self, prompt: &str) -> Option<String> {
        let path = self.askpass_path()?;
        let mut child = Command::new(path)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .ok()?;
        let mut out = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            let mut buf = [0u8; MAX_ASKPASS_OUTPUT];
            if let Ok(n) = stdout.read(&mut buf) {
                out.extend_from_slice(&buf[..n]);
            }
        }
        let status = child.wait().ok()?;
        if !status.success() {
            return None;
        }
        while matches!(out.last(), Some(b'\n') | Some(b'\r')) {
            out.pop();
        }
        String::from_utf8(out).ok()
    }

    /// Ask for yes/no authorization. Exit status 0 = allow, 1 = deny,
    /// anything else = error. If the confirm helper's basename is
    /// `zenity`, a zenity-flavored argv is used instead of a bare prompt
    /// argument. If no confirm helper is configured but askpass is,
    /// askpass is invoked with `SSH_ASKPASS_PROMPT=confirm` so the helper
    /// can switch to a yes/no UI on its own.
    pub fn confirm(&self, prompt: &str) -> Decision {
        if let Some(path) = self.confirm_path() {
            return self.run_confirm(path, prompt, false);
        }
        if let Some(path) = self.askpass_path() {
            return self.run_confirm(path, prompt, true);
        }
        Decision::Error
    }

    fn run_confirm(&self, path: &str, prompt: &str, via_askpass: bool) -> Decision {
        let is_zenity = std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n == "zenity")
            .unwrap_or(false);

        let mut cmd = Command::new(path);
        if is_zenity {
            cmd.arg("--question")
                .arg(format!("--text={}", prompt))
                .arg("--ok-label=Allow")
                .arg("--cancel-label=Deny");
        } else {
            cmd.arg(prompt);
        }
        if via_askpass {
            cmd.env("SSH_ASKPASS_PROMPT", "confirm");
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

        match cmd.status() {
            Ok(status) => match status.code() {
                Some(0) => Decision::Allowed,
                Some(1) => Decision::Denied,
                _ => Decision::Error,
            },
            Err(_) => Decision::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_helpers_configured_errors_on_confirm() {
        std::env::remove_var("SSH_ASKPASS");
        std::env::remove_var("SSH_CONFIRM");
        let p = Prompter::new(None);
        assert_eq!(p.confirm("allow?"), Decision::Error);
    }

    #[test]
    fn ask_returns_none_without_a_helper() {
        std::env::remove_var("SSH_ASKPASS");
        let p = Prompter::new(None);
        assert!(p.ask("PIN:").is_none());
    }

    #[test]
    fn configured_askpass_takes_priority_over_env_and_is_fixed() {
        std::env::set_var("SSH_ASKPASS", "/usr/bin/env-askpass");
        let p = Prompter::new(Some("/usr/bin/configured-askpass".into()));
        assert_eq!(p.askpass_path(), Some("/usr/bin/configured-askpass"));
    }
}
