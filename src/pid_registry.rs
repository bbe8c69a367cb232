//! Bounded table of per-process connection state, used by the `Forwarded`
//! authorization policy to tell a process's first connection from its
//! later ones (spec §3 `PID entry`, §4.4).

use std::time::{Duration, Instant};

/// Stale entries are reclaimed once this long has passed since they were
/// first seen without a matching re-probe (spec §3: "30 s").
const STALE_AFTER: Duration = Duration::from_secs(30);

/// No unbounded growth: a misbehaving or spoofing client re-using many
/// pids cannot grow this table past a fixed cap.
const MAX_ENTRIES: usize = 256;

struct PidEntry {
    pid: i32,
    start_time: u64,
    first_seen: Instant,
    connection_count: u32,
}

/// Tracks, for each (pid, start_time) identity, how many connections have
/// been attributed to it so far.
pub struct PidRegistry {
    entries: Vec<PidEntry>,
}

impl PidRegistry {
    pub fn new() -> Self {
        PidRegistry {
            entries: Vec::new(),
        }
    }

    /// Record a new connection from `pid` (whose process start time is
    /// `start_time`, used to detect pid reuse) and return whether this is
    /// the first connection ever attributed to this (pid, start_time)
    /// identity.
    pub fn note_connection(&mut self, pid: i32, start_time: u64) -> bool {
        self.expire_stale();

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.pid == pid && e.start_time == start_time)
        {
            entry.connection_count += 1;
            return entry.connection_count == 1;
        }

        if self.entries.len() >= MAX_ENTRIES {
            self.reclaim_oldest();
        }

        self.entries.push(PidEntry {
            pid,
            start_time,
            first_seen: Instant::now(),
            connection_count: 1,
        });
        true
    }

    fn expire_stale(&mut self) {
        let now = Instant::now();
        self.entries
            .retain(|e| now.duration_since(e.first_seen) < STALE_AFTER);
    }

    fn reclaim_oldest(&mut self) {
        if let Some((idx, _)) = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.first_seen)
        {
            self.entries.remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_connection_from_a_pid_is_reported_as_first() {
        let mut reg = PidRegistry::new();
        assert!(reg.note_connection(100, 1));
    }

    #[test]
    fn second_connection_from_same_pid_is_not_first() {
        let mut reg = PidRegistry::new();
        assert!(reg.note_connection(100, 1));
        assert!(!reg.note_connection(100, 1));
    }

    #[test]
    fn pid_reuse_with_different_start_time_is_a_new_identity() {
        let mut reg = PidRegistry::new();
        assert!(reg.note_connection(100, 1));
        assert!(!reg.note_connection(100, 1));
        assert!(reg.note_connection(100, 2));
    }

    #[test]
    fn table_does_not_grow_past_the_cap() {
        let mut reg = PidRegistry::new();
        for pid in 0..(MAX_ENTRIES as i32 + 10) {
            reg.note_connection(pid, 1);
        }
        assert!(reg.entries.len() <= MAX_ENTRIES);
    }
}
