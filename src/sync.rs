//! Startup rendezvous between controller processes through a shared directory.
//!
//! Every roster member drops a `<identity>.ready.json` marker into the
//! directory and polls until all members' markers are present. The agreed
//! start is the latest marker timestamp, so nobody starts before a peer was
//! ready. If the wait budget runs out first, the caller gets its own entry time
//! back with `synchronized = false` and decides what that means for its clock.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;

const MARKER_SUFFIX: &str = ".ready.json";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("roster is empty")]
    EmptyRoster,
    #[error("roster lists {0:?} twice")]
    DuplicateMember(String),
    #[error("invalid identity {0:?}")]
    InvalidIdentity(String),
    #[error("{0:?} is not on the roster")]
    NotOnRoster(String),
    #[error("rendezvous {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encode marker: {0}")]
    Marker(#[from] serde_json::Error),
    #[error("rendezvous cancelled")]
    Cancelled,
    #[error("peers not ready after {waited:?}: {}", missing.join(", "))]
    Timeout {
        waited: Duration,
        missing: Vec<String>,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> SyncError {
    move |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Fixed set of peer identities taking part in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    members: Vec<String>,
}

impl Roster {
    pub fn new<I, S>(members: I) -> Result<Self, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: Vec<String> = members.into_iter().map(Into::into).collect();
        if members.is_empty() {
            return Err(SyncError::EmptyRoster);
        }
        let mut seen = HashSet::new();
        for m in &members {
            check_identity(m)?;
            if !seen.insert(m.as_str()) {
                return Err(SyncError::DuplicateMember(m.clone()));
            }
        }
        Ok(Self { members })
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.members.iter().any(|m| m == identity)
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Identities double as file names.
fn check_identity(identity: &str) -> Result<(), SyncError> {
    let ok = !identity.is_empty()
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !identity.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(SyncError::InvalidIdentity(identity.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Marker {
    identity: String,
    ready: bool,
    timestamp: DateTime<Utc>,
}

/// A peer whose readiness marker was found.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub name: String,
    pub ready: bool,
    /// Timestamp the peer wrote into its marker
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    /// Agreed elapsed-time zero. Equal to `local_time` when unsynchronized.
    pub reference_start_time: DateTime<Utc>,
    /// This process's own wall-clock time at barrier entry
    pub local_time: DateTime<Utc>,
    pub synchronized: bool,
    pub peers: Vec<PeerRecord>,
    pub missing: Vec<String>,
}

pub struct SyncBarrier {
    identity: String,
    roster: Roster,
    dir: PathBuf,
    poll_interval: Duration,
    wait_budget: Duration,
    cancel: Option<Arc<AtomicBool>>,
}

impl SyncBarrier {
    pub fn new(cfg: &SyncConfig) -> Result<Self, SyncError> {
        let roster = Roster::new(cfg.roster.iter().cloned())?;
        if !roster.contains(&cfg.identity) {
            return Err(SyncError::NotOnRoster(cfg.identity.clone()));
        }
        Ok(Self {
            identity: cfg.identity.clone(),
            roster,
            dir: cfg.dir.clone(),
            poll_interval: cfg.poll_interval().max(Duration::from_millis(1)),
            wait_budget: cfg.wait_budget(),
            cancel: None,
        })
    }

    /// Give up with [`SyncError::Cancelled`] once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Announce readiness, then block until every roster member is ready or
    /// the wait budget is spent. Runs once per process.
    ///
    /// A peer marker older than one wait budget before our entry is left over
    /// from an earlier run: its writer would have given up by now.
    pub fn wait(self) -> Result<SyncResult, SyncError> {
        let started = Instant::now();
        let local_time = Utc::now();
        let stale_before = TimeDelta::from_std(self.wait_budget)
            .ok()
            .and_then(|budget| local_time.checked_sub_signed(budget));

        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let own = Marker {
            identity: self.identity.clone(),
            ready: true,
            timestamp: local_time,
        };
        write_marker(&self.dir, &own)?;
        info!(
            target: "sync",
            "{} ready at {}, waiting for {} peer(s) in {}",
            self.identity,
            local_time.to_rfc3339(),
            self.roster.len() - 1,
            self.dir.display()
        );

        loop {
            let peers = self.observe(stale_before);
            let missing: Vec<String> = self
                .roster
                .members()
                .iter()
                .filter(|m| !peers.iter().any(|p| &p.name == *m))
                .cloned()
                .collect();

            if missing.is_empty() {
                let reference_start_time = peers
                    .iter()
                    .map(|p| p.observed_at)
                    .max()
                    .unwrap_or(local_time);
                info!(
                    target: "sync",
                    "all {} controller(s) ready, reference start {}",
                    peers.len(),
                    reference_start_time.to_rfc3339()
                );
                return Ok(SyncResult {
                    reference_start_time,
                    local_time,
                    synchronized: true,
                    peers,
                    missing,
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= self.wait_budget {
                let err = SyncError::Timeout {
                    waited: elapsed,
                    missing: missing.clone(),
                };
                warn!(target: "sync", "{}; starting unsynchronized", err);
                return Ok(SyncResult {
                    reference_start_time: local_time,
                    local_time,
                    synchronized: false,
                    peers,
                    missing,
                });
            }

            if self.cancelled() {
                info!(target: "sync", "rendezvous cancelled");
                return Err(SyncError::Cancelled);
            }
            debug!(target: "sync", "waiting for {}", missing.join(", "));
            thread::sleep(self.poll_interval.min(self.wait_budget - elapsed));
        }
    }

    /// Roster members whose marker is currently readable and ready.
    fn observe(&self, stale_before: Option<DateTime<Utc>>) -> Vec<PeerRecord> {
        self.roster
            .members()
            .iter()
            .filter_map(|name| read_marker(&self.dir, name))
            .filter(|p| {
                let fresh = p.name == self.identity
                    || stale_before.is_none_or(|cutoff| p.observed_at >= cutoff);
                if !fresh {
                    debug!(
                        target: "sync",
                        "ignoring stale marker of {} from {}",
                        p.name,
                        p.observed_at.to_rfc3339()
                    );
                }
                fresh
            })
            .collect()
    }
}

fn marker_path(dir: &Path, identity: &str) -> PathBuf {
    dir.join(format!("{identity}{MARKER_SUFFIX}"))
}

/// Create or replace the marker in one rename so readers never see half a file.
fn write_marker(dir: &Path, marker: &Marker) -> Result<(), SyncError> {
    let path = marker_path(dir, &marker.identity);
    let tmp = dir.join(format!(".{}{}.tmp", marker.identity, MARKER_SUFFIX));
    let body = serde_json::to_vec_pretty(marker)?;
    fs::write(&tmp, body).map_err(io_err(&tmp))?;
    fs::rename(&tmp, &path).map_err(io_err(&path))
}

fn read_marker(dir: &Path, identity: &str) -> Option<PeerRecord> {
    let path = marker_path(dir, identity);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            debug!(target: "sync", "read {}: {}", path.display(), e);
            return None;
        }
    };
    let marker: Marker = match serde_json::from_slice(&bytes) {
        Ok(m) => m,
        Err(e) => {
            debug!(target: "sync", "unreadable marker {}: {}", path.display(), e);
            return None;
        }
    };
    if marker.identity != identity || !marker.ready {
        return None;
    }
    Some(PeerRecord {
        name: marker.identity,
        ready: marker.ready,
        observed_at: marker.timestamp,
    })
}

/// Remove this process's marker. Returns whether one was present.
pub fn withdraw(cfg: &SyncConfig) -> Result<bool, SyncError> {
    check_identity(&cfg.identity)?;
    remove_marker(&cfg.dir, &cfg.identity)
}

/// Whether this process's ready marker is still in place. A run that finds its
/// marker gone was cleared from outside and winds down.
pub fn still_marked(cfg: &SyncConfig) -> bool {
    read_marker(&cfg.dir, &cfg.identity).is_some()
}

/// Remove every roster member's marker, e.g. before a fresh run.
pub fn clear_markers(cfg: &SyncConfig) -> Result<usize, SyncError> {
    let roster = Roster::new(cfg.roster.iter().cloned())?;
    let mut removed = 0;
    for m in roster.members() {
        if remove_marker(&cfg.dir, m)? {
            removed += 1;
        }
    }
    Ok(removed)
}

fn remove_marker(dir: &Path, identity: &str) -> Result<bool, SyncError> {
    let path = marker_path(dir, identity);
    match fs::remove_file(&path) {
        Ok(()) => {
            info!(target: "sync", "removed {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SyncError::Io { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn config(dir: &Path, identity: &str, roster: &[&str], budget_ms: u64) -> SyncConfig {
        SyncConfig {
            enabled: true,
            identity: identity.into(),
            roster: roster.iter().map(|s| s.to_string()).collect(),
            dir: dir.to_path_buf(),
            poll_interval_ms: 10,
            wait_budget_ms: budget_ms,
        }
    }

    fn drop_marker(dir: &Path, identity: &str, timestamp: DateTime<Utc>) {
        write_marker(
            dir,
            &Marker {
                identity: identity.into(),
                ready: true,
                timestamp,
            },
        )
        .unwrap();
    }

    #[test]
    fn roster_rejects_bad_members() {
        assert!(matches!(
            Roster::new(Vec::<String>::new()),
            Err(SyncError::EmptyRoster)
        ));
        assert!(matches!(
            Roster::new(["a", "b", "a"]),
            Err(SyncError::DuplicateMember(_))
        ));
        assert!(matches!(
            Roster::new(["a", "../b"]),
            Err(SyncError::InvalidIdentity(_))
        ));
        let r = Roster::new(["heater", "gauge"]).unwrap();
        assert_eq!(r.len(), 2);
        assert!(r.contains("gauge"));
        assert!(!r.contains("camera"));
    }

    #[test]
    fn identity_must_be_on_roster() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "camera", &["heater", "gauge"], 100);
        assert!(matches!(
            SyncBarrier::new(&cfg),
            Err(SyncError::NotOnRoster(_))
        ));
    }

    #[test]
    fn both_present_agree_on_later_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let later = Utc::now() + ChronoDuration::seconds(5);
        drop_marker(dir.path(), "heater", later);

        let cfg = config(dir.path(), "gauge", &["heater", "gauge"], 2_000);
        let res = SyncBarrier::new(&cfg).unwrap().wait().unwrap();

        assert!(res.synchronized);
        assert_eq!(res.reference_start_time, later);
        assert!(res.local_time < later);
        assert!(res.missing.is_empty());
        assert_eq!(res.peers.len(), 2);
        assert!(res.peers.iter().all(|p| p.ready));
    }

    #[test]
    fn own_marker_can_be_the_latest() {
        let dir = tempfile::tempdir().unwrap();
        let earlier = Utc::now() - ChronoDuration::seconds(30);
        drop_marker(dir.path(), "heater", earlier);

        let cfg = config(dir.path(), "gauge", &["heater", "gauge"], 60_000);
        let res = SyncBarrier::new(&cfg).unwrap().wait().unwrap();
        assert!(res.synchronized);
        assert_eq!(res.reference_start_time, res.local_time);
    }

    #[test]
    fn missing_peer_times_out_after_budget() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Duration::from_millis(200);
        let cfg = config(dir.path(), "gauge", &["heater", "gauge"], 200);

        let started = Instant::now();
        let res = SyncBarrier::new(&cfg).unwrap().wait().unwrap();
        let waited = started.elapsed();

        assert!(!res.synchronized);
        assert_eq!(res.reference_start_time, res.local_time);
        assert_eq!(res.missing, vec!["heater".to_string()]);
        assert!(waited >= budget, "returned early after {waited:?}");
        assert!(waited < budget + Duration::from_millis(500), "took {waited:?}");
    }

    #[test]
    fn marker_left_by_an_earlier_run_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        drop_marker(dir.path(), "heater", Utc::now() - ChronoDuration::days(1));

        let cfg = config(dir.path(), "gauge", &["heater", "gauge"], 200);
        let res = SyncBarrier::new(&cfg).unwrap().wait().unwrap();

        assert!(!res.synchronized);
        assert_eq!(res.missing, vec!["heater".to_string()]);
        assert_eq!(res.reference_start_time, res.local_time);
        assert!(res.peers.iter().all(|p| p.name == "gauge"));
    }

    #[test]
    fn cancel_flag_ends_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "gauge", &["heater", "gauge"], 60_000);
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                flag.store(true, Ordering::Relaxed);
            })
        };

        let started = Instant::now();
        let res = SyncBarrier::new(&cfg).unwrap().with_cancel(flag).wait();
        setter.join().unwrap();

        assert!(matches!(res, Err(SyncError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(still_marked(&cfg));
    }

    #[test]
    fn peer_arriving_late_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let peer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop_marker(&path, "heater", Utc::now());
        });

        let cfg = config(dir.path(), "gauge", &["heater", "gauge"], 5_000);
        let res = SyncBarrier::new(&cfg).unwrap().wait().unwrap();
        peer.join().unwrap();

        assert!(res.synchronized);
        assert!(res.reference_start_time > res.local_time);
    }

    #[test]
    fn garbage_and_foreign_markers_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(marker_path(dir.path(), "heater"), b"{\"identity\": \"hea").unwrap();
        assert!(read_marker(dir.path(), "heater").is_none());

        drop_marker(dir.path(), "gauge", Utc::now());
        fs::copy(
            marker_path(dir.path(), "gauge"),
            marker_path(dir.path(), "heater"),
        )
        .unwrap();
        assert!(read_marker(dir.path(), "heater").is_none());
        assert!(read_marker(dir.path(), "gauge").is_some());
    }

    #[test]
    fn marker_write_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let first = Utc::now() - ChronoDuration::minutes(10);
        let second = Utc::now();
        drop_marker(dir.path(), "gauge", first);
        drop_marker(dir.path(), "gauge", second);
        assert_eq!(
            read_marker(dir.path(), "gauge").unwrap().observed_at,
            second
        );
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn withdraw_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "gauge", &["heater", "gauge"], 100);
        drop_marker(dir.path(), "gauge", Utc::now());
        drop_marker(dir.path(), "heater", Utc::now());

        assert!(still_marked(&cfg));
        assert!(withdraw(&cfg).unwrap());
        assert!(!still_marked(&cfg));
        assert!(!withdraw(&cfg).unwrap());
        assert_eq!(clear_markers(&cfg).unwrap(), 1);
        assert!(read_marker(dir.path(), "heater").is_none());
    }
}
