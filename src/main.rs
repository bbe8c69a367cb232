//! CLI entry point: argument parsing, socket/temp-directory setup,
//! daemonization, signal handling and `-k` kill mode (spec §6, §4.11).
//!
//! Everything up to and including `daemonize()` runs before any async
//! runtime exists, matching the original's `fork()` happening on a
//! single-threaded process; only after that does this file build a
//! `current_thread` Tokio runtime and hand off into `agent::run`.

mod agent;
mod authz;
mod card;
mod cli;
mod connection;
mod dispatcher;
mod eboxfmt;
mod error;
mod handlers;
mod keyfmt;
mod logging;
mod peer_cred;
mod pid_registry;
mod pin_store;
mod prompter;
mod wire;

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use tracing::{error, info};

use crate::agent::{AgentState, Config};
use crate::card::pcsc_driver::PcscCard;
use crate::cli::Args;

const ENV_AUTH_SOCK: &str = "SSH_AUTH_SOCK";
const ENV_AGENT_PID: &str = "SSH_AGENT_PID";

fn main() {
    let args = Args::parse();

    if args.kill {
        match kill_running_agent(&args) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = logging::init_logging(args.verbosity()) {
        eprintln!("failed to initialize logging: {e:#}");
        std::process::exit(1);
    }

    match run(args) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "fatal error");
            std::process::exit(1);
        }
    }
}

/// `-k`: locate a running agent via `SSH_AGENT_PID`, send it `SIGTERM`, and
/// print the matching `unset`/`unsetenv` shell-eval block (spec §6, §9
/// "parse_hex" / kill-mode block grounded on `original_source/pivy-agent.c`).
fn kill_running_agent(args: &Args) -> Result<()> {
    let use_csh = cli::use_csh_output(args);
    let pid_str = std::env::var(ENV_AGENT_PID)
        .map_err(|_| anyhow::anyhow!("{ENV_AGENT_PID} not set, cannot kill agent"))?;
    let pid: i32 = pid_str
        .parse()
        .ok()
        .filter(|p| *p >= 2)
        .ok_or_else(|| anyhow::anyhow!("{ENV_AGENT_PID}=\"{pid_str}\", which is not a good PID"))?;

    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        anyhow::bail!("kill: {}", std::io::Error::last_os_error());
    }

    cli::print_shell_unset(use_csh);
    println!("echo Agent pid {pid} killed;");
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let guid_prefix =
        cli::parse_guid_prefix(&args.guid_prefix).map_err(|e| anyhow::anyhow!("invalid -g GUID prefix: {e}"))?;

    let cak = args
        .cak_pubkey
        .as_deref()
        .map(cli::parse_ssh_pubkey_line)
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid -K public key: {e}"))?;

    let (socket_path, socket_dir) = resolve_socket_path(&args)?;
    let std_listener = match bind_listener(&socket_path) {
        Ok(l) => l,
        Err(e) => {
            cleanup_socket(&socket_path, &socket_dir);
            return Err(e);
        }
    };

    let use_csh = cli::use_csh_output(&args);
    let foreground = args.runs_in_foreground();

    // Either we stay in the foreground and print the shell-eval block
    // immediately (spec §6 "skip" path), or we fork: the original invoking
    // process prints the block (naming the *daemon's* pid) and exits,
    // while the child continues as the agent (spec §4.11 supplement).
    if foreground {
        cli::print_shell_eval(&socket_path, std::process::id(), use_csh);
        let _ = std::io::stdout().flush();
    } else if let Err(e) = daemonize(&socket_path, use_csh) {
        cleanup_socket(&socket_path, &socket_dir);
        return Err(e);
    }

    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "mlockall failed, sensitive data may be swapped out under memory pressure"
            );
        }
    }

    let driver = match PcscCard::establish() {
        Ok(d) => d,
        Err(e) => {
            cleanup_socket(&socket_path, &socket_dir);
            return Err(e.into());
        }
    };

    let config = Config {
        guid_prefix,
        cak,
        sign_9d: args.sign_9d,
        confirm_mode: args.confirm_mode(),
        askpass: std::env::var("SSH_ASKPASS").ok(),
        disable_uid_check: args.disable_uid_check,
        disable_zone_check: args.disable_zone_check,
        hash_name: args.hash_name.clone(),
    };
    let state = AgentState::new(driver, config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    std_listener
        .set_nonblocking(true)
        .context("failed to set listener nonblocking")?;

    runtime.block_on(async_main(std_listener, state, foreground));
    cleanup_socket(&socket_path, &socket_dir);
    Ok(())
}

/// Install the signal handlers (spec §4.11), run the event loop until one
/// of them fires, then return so `run()` can clean up the socket/directory.
async fn async_main(std_listener: std::os::unix::net::UnixListener, state: AgentState<PcscCard>, foreground: bool) {
    use tokio::signal::unix::{signal, SignalKind};

    let listener = match tokio::net::UnixListener::from_std(std_listener) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to adopt listener into the async runtime");
            return;
        }
    };

    let (tx, rx) = tokio::sync::watch::channel(false);

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("received SIGHUP, shutting down");
                    let _ = tx.send(true);
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    let _ = tx.send(true);
                    break;
                }
                // SIGINT is only a shutdown trigger in foreground/debug
                // modes; elsewhere it is ignored (spec §4.11).
                _ = sigint.recv(), if foreground => {
                    info!("received SIGINT, shutting down");
                    let _ = tx.send(true);
                    break;
                }
            }
        }
    });

    let peer_source = peer_cred::default_source();
    agent::run(listener, state, peer_source, rx).await;
}

fn resolve_socket_path(args: &Args) -> Result<(String, Option<PathBuf>)> {
    if let Some(p) = &args.socket_path {
        return Ok((p.clone(), None));
    }
    let base = std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    let dir = make_temp_dir(&base)?;
    let path = dir.join(format!("agent.{}", std::process::id()));
    Ok((path.to_string_lossy().into_owned(), Some(dir)))
}

/// `mkdtemp("$TMPDIR/ssh-XXXXXXXXXXXX")` equivalent: 12 random
/// alphanumeric characters, mode 0700, retried on collision.
fn make_temp_dir(base: &Path) -> Result<PathBuf> {
    const SUFFIX_LEN: usize = 12;
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    for _ in 0..8 {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        let candidate = base.join(format!("ssh-{suffix}"));
        match std::fs::create_dir(&candidate) {
            Ok(()) => {
                std::fs::set_permissions(&candidate, std::fs::Permissions::from_mode(0o700))
                    .context("failed to set socket directory permissions")?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).context("failed to create private socket directory"),
        }
    }
    anyhow::bail!("failed to create a unique socket directory after 8 attempts")
}

/// Bind the listening socket at `path` with mode 0600 (spec §6: "file-mode
/// mask 0177", i.e. owner-only access) and backlog 128.
fn bind_listener(path: &str) -> Result<std::os::unix::net::UnixListener> {
    let listener = std::os::unix::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind socket at {path}"))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("failed to set socket permissions")?;
    Ok(listener)
}

/// `fork()` + `setsid()` + `chdir("/")` + stdio redirection to
/// `/dev/null`. Must run before the Tokio runtime is built: this process
/// is still single-threaded at this point, the same precondition the
/// original relies on (spec §4.11 supplement, from
/// `original_source/pivy-agent.c`'s daemonizing block). Only `stdin`/
/// `stdout` are redirected — `stderr` is left attached, exactly as the
/// original leaves it (its `dup2` for stderr is commented out) so that a
/// daemonized agent's warnings are not silently lost.
fn daemonize(socket_path: &str, csh: bool) -> Result<()> {
    // SAFETY: fork() is called before any additional threads exist.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        anyhow::bail!("fork failed: {}", std::io::Error::last_os_error());
    }
    if pid > 0 {
        // Original process: print the shell-eval block naming the child
        // (the real daemon) and exit.
        cli::print_shell_eval(socket_path, pid as u32, csh);
        let _ = std::io::stdout().flush();
        std::process::exit(0);
    }

    // Child: become the daemon.
    if unsafe { libc::setsid() } == -1 {
        anyhow::bail!("setsid failed: {}", std::io::Error::last_os_error());
    }
    std::env::set_current_dir("/").context("chdir(\"/\") failed")?;
    redirect_stdio_to_devnull()?;
    Ok(())
}

fn redirect_stdio_to_devnull() -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("failed to open /dev/null")?;
    let fd = devnull.as_raw_fd();
    unsafe {
        libc::dup2(fd, libc::STDIN_FILENO);
        libc::dup2(fd, libc::STDOUT_FILENO);
    }
    Ok(())
}

/// Unlink the socket and remove the directory we created for it, if any
/// (spec §3 "Listening socket": "path unlinked on cleanup; directory
/// removed if we created it").
fn cleanup_socket(socket_path: &str, socket_dir: &Option<PathBuf>) {
    let _ = std::fs::remove_file(socket_path);
    if let Some(dir) = socket_dir {
        let _ = std::fs::remove_dir(dir);
    }
}
