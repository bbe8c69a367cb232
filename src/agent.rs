//! Top-level agent state and the single-threaded event loop (spec §4.10).
//!
//! The loop never `tokio::spawn`s a connection onto a second task; it
//! `select_all`s over the listener's `accept()`, every live connection's
//! readability, and a deadline sleep, all polled from the one worker
//! thread of a `current_thread` runtime. That discipline is what makes
//! `AgentState` safe to hold as a plain struct with no locks (spec §5, §9).

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use futures::future::select_all;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::authz::{ConfirmMode, Policy};
use crate::card::session::CardSession;
use crate::card::CardDriver;
use crate::connection::Connection;
use crate::dispatcher;
use crate::keyfmt::PublicKey;
use crate::peer_cred::{PeerCredSource, PeerCred};
use crate::pid_registry::PidRegistry;
use crate::pin_store::PinStore;
use crate::prompter::Prompter;

/// Liveness check interval for the parent process (spec §4.10 "post-wake"
/// step). Not independently configurable via a CLI flag; always on, the
/// way ssh-agent itself always exits when its parent dies.
const PARENT_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub struct Config {
    pub guid_prefix: Vec<u8>,
    pub cak: Option<PublicKey>,
    pub sign_9d: bool,
    pub confirm_mode: ConfirmMode,
    pub askpass: Option<String>,
    pub disable_uid_check: bool,
    #[allow(dead_code)] // zone checks are illumos-specific; see peer_cred.
    pub disable_zone_check: bool,
    /// `-E`: hash algorithm used for key fingerprints in log output: purely
    /// cosmetic, distinct from the per-signature hash selection in
    /// `keyfmt::RsaHash`/`EcCurve` (spec §6 `-E`).
    #[allow(dead_code)]
    pub hash_name: Option<String>,
}

pub struct AgentState<D: CardDriver> {
    pub session: CardSession<D>,
    pub pin_store: PinStore,
    pub prompter: Prompter,
    pub policy: Policy,
    pub pid_registry: PidRegistry,
    pub config: Config,
}

impl<D: CardDriver> AgentState<D> {
    pub fn new(driver: D, config: Config) -> Self {
        let session = CardSession::new(
            driver,
            config.guid_prefix.clone(),
            config.cak.clone(),
            config.sign_9d,
        );
        AgentState {
            session,
            pin_store: PinStore::new(),
            prompter: Prompter::new(config.askpass.clone()),
            policy: Policy::new(config.confirm_mode),
            pid_registry: PidRegistry::new(),
            config,
        }
    }
}

enum WakeReason {
    Accept(std::io::Result<(UnixStream, tokio::net::unix::SocketAddr)>),
    Readable(usize),
    Timeout,
}

type BoxedWait<'a> = Pin<Box<dyn Future<Output = WakeReason> + 'a>>;

fn deadline_for<D: CardDriver>(state: &AgentState<D>, now: Instant) -> Instant {
    let mut candidates = Vec::with_capacity(3);
    if state.session.is_open() {
        candidates.push(state.session.deadline());
    }
    // Omitted entirely while probing is suppressed (spec §4.10 "omitting
    // zero terms") so a card that never comes back can't pin this to an
    // instant that never advances and spin the loop (see
    // `CardSession::next_probe_deadline`).
    if let Some(probe_deadline) = state.session.next_probe_deadline() {
        candidates.push(probe_deadline);
    }
    candidates.push(now + PARENT_ALIVE_INTERVAL);
    candidates.into_iter().min().unwrap_or(now + PARENT_ALIVE_INTERVAL)
}

/// Main event loop. Runs until `shutdown` fires.
pub async fn run<D: CardDriver, S: PeerCredSource>(
    listener: UnixListener,
    mut state: AgentState<D>,
    peer_cred_source: S,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut connections: Vec<Connection> = Vec::new();
    let parent_pid_at_start = unsafe { libc::getppid() };

    loop {
        let now = Instant::now();

        if parent_pid_at_start != 1 && unsafe { libc::getppid() } == 1 {
            info!("parent process exited, shutting down");
            break;
        }

        if state.session.probe_due(now) {
            state.session.probe(&mut state.pin_store);
        }
        state.session.close(false);

        let deadline = deadline_for(&state, now);

        let reason = {
            let accept_fut: BoxedWait = Box::pin(async {
                WakeReason::Accept(listener.accept().await)
            });
            let sleep_fut: BoxedWait = Box::pin(async move {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                WakeReason::Timeout
            });
            let shutdown_fut: BoxedWait = Box::pin(async {
                let _ = shutdown.changed().await;
                WakeReason::Timeout
            });

            let mut futs: Vec<BoxedWait> = vec![accept_fut, sleep_fut, shutdown_fut];
            for (conn_idx, conn) in connections.iter().enumerate() {
                let stream = &conn.stream;
                futs.push(Box::pin(async move {
                    let _ = stream.readable().await;
                    WakeReason::Readable(conn_idx)
                }));
            }

            let (result, _i, _rest) = select_all(futs).await;
            result
        };

        if *shutdown.borrow() {
            info!("shutdown requested");
            break;
        }

        match reason {
            WakeReason::Timeout => {}
            WakeReason::Accept(Ok((stream, _addr))) => {
                handle_accept(&mut state, &mut connections, stream, &peer_cred_source).await;
            }
            WakeReason::Accept(Err(e)) => {
                warn!(error = %e, "accept failed");
            }
            WakeReason::Readable(idx) => {
                if idx < connections.len() {
                    service_connection(&mut state, &mut connections, idx).await;
                }
            }
        }
    }

    shutdown_cleanup(&mut state);
}

async fn handle_accept<D: CardDriver, S: PeerCredSource>(
    state: &mut AgentState<D>,
    connections: &mut Vec<Connection>,
    stream: UnixStream,
    peer_cred_source: &S,
) {
    let std_stream = match stream.into_std() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to convert accepted stream");
            return;
        }
    };
    let unix_std = std::os::unix::net::UnixStream::from(std_stream);
    let peer = match peer_cred_source.peer_cred(&unix_std) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to retrieve peer credentials, rejecting connection");
            return;
        }
    };
    unix_std.set_nonblocking(true).ok();
    let stream = match UnixStream::from_std(unix_std) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to re-wrap accepted stream");
            return;
        }
    };

    if !state.config.disable_uid_check && !is_authorized_uid(&peer) {
        warn!(uid = peer.uid, "rejecting connection from disallowed uid");
        return;
    }

    let is_first = state.pid_registry.note_connection(peer.pid, peer.start_time);
    debug!(pid = peer.pid, uid = peer.uid, is_first, "accepted connection");
    connections.push(Connection::new(stream, peer, is_first));
}

fn is_authorized_uid(peer: &PeerCred) -> bool {
    let our_uid = unsafe { libc::getuid() };
    peer.uid == our_uid || peer.uid == 0
}

async fn service_connection<D: CardDriver>(
    state: &mut AgentState<D>,
    connections: &mut Vec<Connection>,
    idx: usize,
) {
    match connections[idx].read_chunk().await {
        Ok(0) => {
            connections.remove(idx);
            return;
        }
        Ok(_) => {}
        Err(e) => {
            debug!(error = %e, "connection read error, closing");
            connections.remove(idx);
            return;
        }
    }

    loop {
        match connections[idx].take_frame() {
            Ok(Some(frame)) => {
                let response = dispatcher::dispatch(state, &mut connections[idx], &frame).await;
                connections[idx].queue_response(response);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "oversized or malformed frame, closing connection");
                connections.remove(idx);
                return;
            }
        }
    }

    if connections[idx].has_pending_output() {
        if let Err(e) = connections[idx].flush().await {
            debug!(error = %e, "connection write error, closing");
            connections.remove(idx);
        }
    }
}

fn shutdown_cleanup<D: CardDriver>(state: &mut AgentState<D>) {
    if state.session.is_open() {
        state.session.close(true);
    }
    state.pin_store.clear();
}
