//! CLI surface (spec §6), `clap` derive style matching `warpgate-cli`.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "PIV smartcard authentication agent", long_about = None)]
pub struct Args {
    /// Socket path to listen on (default: $TMPDIR/ssh-XXXXXXXXXXXX/agent.<pid>).
    #[arg(short = 'a', value_name = "PATH")]
    pub socket_path: Option<String>,

    /// Emit csh-syntax shell-eval output on startup.
    #[arg(short = 'c')]
    pub csh: bool,

    /// Emit Bourne-syntax shell-eval output on startup.
    #[arg(short = 's')]
    pub bourne: bool,

    /// Stay in the foreground (no daemonize).
    #[arg(short = 'D')]
    pub foreground: bool,

    /// Foreground with debug-level logging.
    #[arg(short = 'd')]
    pub debug_foreground: bool,

    /// Foreground with info-level logging.
    #[arg(short = 'i')]
    pub info_foreground: bool,

    /// Confirmation requirement: once = Forwarded, twice = Always.
    #[arg(short = 'C', action = clap::ArgAction::Count)]
    pub confirm: u8,

    /// Allow signing with the Key-Management slot (0x9D).
    #[arg(short = 'm')]
    pub sign_9d: bool,

    /// Override the default signature hash algorithm name.
    #[arg(short = 'E', value_name = "HASH")]
    pub hash_name: Option<String>,

    /// Hex prefix of the card's GUID to select (required; partial bytes allowed,
    /// colon/space/tab/newline separators tolerated, same as the pivy-agent
    /// `parse_hex` helper this is grounded on).
    #[arg(short = 'g', value_name = "GUID_PREFIX_HEX")]
    pub guid_prefix: String,

    /// Card-Authentication Key (slot 0x9E) expected public key, given as an
    /// `authorized_keys`-style line (`ecdsa-sha2-nistp256 AAAA...`).
    #[arg(short = 'K', value_name = "CAK_PUBKEY")]
    pub cak_pubkey: Option<String>,

    /// Terminate a running agent located via SSH_AUTH_SOCK/SSH_AGENT_PID.
    #[arg(short = 'k')]
    pub kill: bool,

    /// Disable the peer uid check at accept time.
    #[arg(short = 'U')]
    pub disable_uid_check: bool,

    /// Disable the peer zone check at accept time (platforms that support it).
    #[arg(short = 'Z')]
    pub disable_zone_check: bool,
}

impl Args {
    pub fn confirm_mode(&self) -> crate::authz::ConfirmMode {
        match self.confirm {
            0 => crate::authz::ConfirmMode::Never,
            1 => crate::authz::ConfirmMode::Forwarded,
            _ => crate::authz::ConfirmMode::Always,
        }
    }

    pub fn verbosity(&self) -> u8 {
        if self.debug_foreground {
            1
        } else if self.info_foreground {
            0
        } else {
            0
        }
    }

    pub fn runs_in_foreground(&self) -> bool {
        self.foreground || self.debug_foreground || self.info_foreground
    }
}

/// Bourne vs. csh output is chosen from `$SHELL` when neither `-c` nor
/// `-s` is given (spec §6 env vars).
pub fn use_csh_output(args: &Args) -> bool {
    if args.csh {
        return true;
    }
    if args.bourne {
        return false;
    }
    std::env::var("SHELL")
        .map(|s| s.ends_with("csh"))
        .unwrap_or(false)
}

/// Print the `SSH_AUTH_SOCK`/`SSH_AGENT_PID` shell-eval block (spec §6
/// "Stdout on startup").
pub fn print_shell_eval(socket_path: &str, pid: u32, csh: bool) {
    if csh {
        println!("setenv SSH_AUTH_SOCK {};", socket_path);
        println!("setenv SSH_AGENT_PID {};", pid);
    } else {
        println!("SSH_AUTH_SOCK={}; export SSH_AUTH_SOCK;", socket_path);
        println!("SSH_AGENT_PID={}; export SSH_AGENT_PID;", pid);
    }
    println!("echo Agent pid {};", pid);
}

/// Print the `unset`/`unsetenv` block emitted by `-k` kill mode.
pub fn print_shell_unset(csh: bool) {
    if csh {
        println!("unsetenv SSH_AUTH_SOCK;");
        println!("unsetenv SSH_AGENT_PID;");
    } else {
        println!("unset SSH_AUTH_SOCK;");
        println!("unset SSH_AGENT_PID;");
    }
}

/// Decode a `-g` GUID prefix the way `pivy-agent.c`'s `parse_hex` does:
/// nibble pairs with `:`, space, tab, CR and LF tolerated as separators
/// anywhere, and an odd total nibble count rejected as an incomplete byte
/// (spec §6 supplement, grounded on `original_source/pivy-agent.c`).
pub fn parse_guid_prefix(s: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    let mut high_nibble: Option<u8> = None;
    for c in s.chars() {
        let nibble = match c {
            '0'..='9' => c as u8 - b'0',
            'a'..='f' => c as u8 - b'a' + 0xa,
            'A'..='F' => c as u8 - b'A' + 0xA,
            ':' | ' ' | '\t' | '\n' | '\r' => continue,
            other => return Err(format!("invalid hex digit: '{}'", other)),
        };
        match high_nibble.take() {
            Some(high) => out.push((high << 4) | nibble),
            None => high_nibble = Some(nibble),
        }
    }
    if high_nibble.is_some() {
        return Err("odd number of hex digits (incomplete)".into());
    }
    if out.len() > 16 {
        return Err(format!("GUID must be <=16 bytes in length (you gave {})", out.len()));
    }
    Ok(out)
}

/// Parse a `-K` argument given as an `authorized_keys`-style line
/// (`ecdsa-sha2-nistp256 AAAA...[ comment]`) into the wire key blob.
pub fn parse_ssh_pubkey_line(s: &str) -> Result<crate::keyfmt::PublicKey, String> {
    let b64 = s
        .split_ascii_whitespace()
        .nth(1)
        .ok_or_else(|| "expected \"algo base64\" format".to_string())?;
    let blob = data_encoding::BASE64
        .decode(b64.as_bytes())
        .map_err(|e| format!("invalid base64: {}", e))?;
    crate::keyfmt::PublicKey::parse(&blob).map_err(|e| format!("invalid key blob: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_count_maps_to_modes() {
        let base = Args {
            socket_path: None,
            csh: false,
            bourne: false,
            foreground: false,
            debug_foreground: false,
            info_foreground: false,
            confirm: 0,
            sign_9d: false,
            hash_name: None,
            guid_prefix: "aabb".into(),
            cak_pubkey: None,
            kill: false,
            disable_uid_check: false,
            disable_zone_check: false,
        };
        assert!(matches!(base.confirm_mode(), crate::authz::ConfirmMode::Never));

        let mut once = base;
        once.confirm = 1;
        assert!(matches!(once.confirm_mode(), crate::authz::ConfirmMode::Forwarded));

        let mut twice = once;
        twice.confirm = 2;
        assert!(matches!(twice.confirm_mode(), crate::authz::ConfirmMode::Always));
    }

    #[test]
    fn guid_prefix_accepts_plain_hex() {
        assert_eq!(parse_guid_prefix("aabbcc").unwrap(), vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn guid_prefix_skips_colon_separators() {
        assert_eq!(parse_guid_prefix("aa:bb:cc").unwrap(), vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn guid_prefix_rejects_odd_digit_count() {
        assert!(parse_guid_prefix("aab").is_err());
    }

    #[test]
    fn guid_prefix_rejects_longer_than_16_bytes() {
        let s = "aa".repeat(17);
        assert!(parse_guid_prefix(&s).is_err());
    }

    #[test]
    fn guid_prefix_rejects_invalid_digit() {
        assert!(parse_guid_prefix("zz").is_err());
    }

    #[test]
    fn ssh_pubkey_line_round_trips_through_to_blob() {
        let key = crate::keyfmt::PublicKey::Rsa {
            e: vec![0x01, 0x00, 0x01],
            n: vec![0x80, 0x01, 0x02, 0x03],
        };
        let b64 = data_encoding::BASE64.encode(&key.to_blob());
        let line = format!("ssh-rsa {} comment", b64);
        let parsed = parse_ssh_pubkey_line(&line).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn ssh_pubkey_line_rejects_missing_base64_field() {
        assert!(parse_ssh_pubkey_line("ssh-rsa").is_err());
    }
}
