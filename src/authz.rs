//! Client authorization policy (spec §4.4). A small closed set of modes
//! and decisions, modeled as tagged variants per spec §9 ("Tagged variants
//! replace enums-of-ints") rather than the original's bare integers.

use crate::peer_cred::PeerCred;
use crate::prompter::{Decision as PromptDecision, Prompter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    Never,
    Forwarded,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Pending,
    Allowed,
    Denied,
}

pub struct Policy {
    pub mode: ConfirmMode,
}

impl Policy {
    pub fn new(mode: ConfirmMode) -> Self {
        Policy { mode }
    }

    /// Decide authorization for a connection's first card-using operation.
    /// A `Denied` result is sticky for the connection (spec §4.4); callers
    /// must not call this again once a decision other than `Pending` has
    /// been cached.
    pub fn decide(&self, peer: &PeerCred, is_first_connection: bool, prompter: &Prompter) -> Decision {
        match self.mode {
            ConfirmMode::Never => Decision::Allowed,
            ConfirmMode::Forwarded => {
                let forwarded_ssh = peer.exe_basename() == Some("ssh") && !is_first_connection;
                if forwarded_ssh {
                    prompt_for_decision(prompter)
                } else {
                    Decision::Allowed
                }
            }
            ConfirmMode::Always => prompt_for_decision(prompter),
        }
    }
}

fn prompt_for_decision(prompter: &Prompter) -> Decision {
    match prompter.confirm("Allow use of the PIV key?") {
        PromptDecision::Allowed => Decision::Allowed,
        PromptDecision::Denied => Decision::Denied,
        PromptDecision::Error => Decision::Denied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(exe: Option<&str>) -> PeerCred {
        PeerCred {
            uid: 0,
            gid: 0,
            pid: 1,
            start_time: 0,
            exe_path: exe.map(|s| s.into()),
            argv: None,
        }
    }

    #[test]
    fn never_mode_always_allows() {
        let policy = Policy::new(ConfirmMode::Never);
        let prompter = Prompter::new(None);
        assert_eq!(
            policy.decide(&peer(Some("/usr/bin/ssh")), false, &prompter),
            Decision::Allowed
        );
    }

    #[test]
    fn forwarded_mode_allows_first_connection_from_ssh() {
        let policy = Policy::new(ConfirmMode::Forwarded);
        let prompter = Prompter::new(None);
        assert_eq!(
            policy.decide(&peer(Some("/usr/bin/ssh")), true, &prompter),
            Decision::Allowed
        );
    }

    #[test]
    fn forwarded_mode_prompts_on_second_connection_from_ssh() {
        std::env::remove_var("SSH_ASKPASS");
        std::env::remove_var("SSH_CONFIRM");
        let policy = Policy::new(ConfirmMode::Forwarded);
        let prompter = Prompter::new(None);
        // no helper configured -> prompter errors -> denied
        assert_eq!(
            policy.decide(&peer(Some("/usr/bin/ssh")), false, &prompter),
            Decision::Denied
        );
    }

    #[test]
    fn forwarded_mode_allows_non_ssh_peers_unconditionally() {
        let policy = Policy::new(ConfirmMode::Forwarded);
        let prompter = Prompter::new(None);
        assert_eq!(
            policy.decide(&peer(Some("/usr/bin/bash")), false, &prompter),
            Decision::Allowed
        );
    }
}
