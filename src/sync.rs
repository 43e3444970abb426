// ABOUTME: Checkpoint-sync gate - forces a checkpoint and waits for mirror apply
// ABOUTME: Pluggable replication control; the CLI shells out and re-reads a status file

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::AuditError;

/// How many seconds to wait for the checkpoint record to be applied on
/// the mirror before giving up.
pub const CHECKPOINT_SYNC_TIMEOUT_SECS: u64 = 600;

/// Divisor splitting a second into poll intervals while waiting for the
/// checkpoint to make it through to the mirror.
pub const WAITS_PER_SEC: u64 = 5;

/// A position in the primary's write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl std::str::FromStr for Lsn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (hi, lo) = s
            .split_once('/')
            .with_context(|| format!("invalid log position {:?}, expected HI/LO", s))?;
        let hi = u64::from_str_radix(hi, 16)
            .with_context(|| format!("invalid log position {:?}", s))?;
        let lo = u64::from_str_radix(lo, 16)
            .with_context(|| format!("invalid log position {:?}", s))?;
        if lo > 0xFFFF_FFFF {
            bail!("invalid log position {:?}: low half out of range", s);
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

impl TryFrom<String> for Lsn {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Lsn> for String {
    fn from(lsn: Lsn) -> Self {
        lsn.to_string()
    }
}

/// State of one replication stream as exposed by the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSenderState {
    Startup,
    Backup,
    Catchup,
    Streaming,
    Stopping,
}

/// One row of the primary's shared replication-stream table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalSenderInfo {
    pub pid: i32,
    /// Whether this stream services the mirror replication role. Other
    /// consumers of the streaming protocol (ad hoc backup clients) also
    /// appear in the table and must be ignored.
    #[serde(default)]
    pub is_mirror_receiver: bool,
    pub state: WalSenderState,
    /// Log position the mirror has durably replayed up to.
    pub apply_lsn: Lsn,
}

/// Control surface on the primary: forced checkpoints and the shared
/// replication-stream table.
pub trait ReplicationControl {
    /// Force an immediate, synchronous checkpoint and return its log
    /// position. Every call produces a fresh checkpoint.
    fn request_checkpoint(&self) -> Result<Lsn>;

    /// A fresh snapshot of the active replication streams.
    fn wal_senders(&self) -> Result<Vec<WalSenderInfo>>;
}

/// Cooperative cancellation flag, checked at the top of every poll
/// iteration and every block read.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), AuditError> {
        if self.is_cancelled() {
            Err(AuditError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Forces a checkpoint and blocks until every mirror replication stream
/// reports it has applied at least that checkpoint's log position.
pub struct SyncGate<'a> {
    control: &'a dyn ReplicationControl,
    cancel: CancelToken,
    timeout: Duration,
    waits_per_sec: u64,
}

impl<'a> SyncGate<'a> {
    pub fn new(control: &'a dyn ReplicationControl, cancel: CancelToken) -> Self {
        Self {
            control,
            cancel,
            timeout: Duration::from_secs(CHECKPOINT_SYNC_TIMEOUT_SECS),
            waits_per_sec: WAITS_PER_SEC,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checkpoint the primary and wait for the mirror to apply it.
    ///
    /// Re-entrant: every call requests a fresh checkpoint and waits for
    /// that checkpoint's position, never a prior one. Returns `false`
    /// without further waiting when any mirror stream is dead or not
    /// streaming (a fallback condition, not a retryable one), or when
    /// the wait budget runs out before the mirror catches up.
    pub fn wait_for_apply(&self) -> Result<bool> {
        self.cancel.check()?;

        // Flush pending changes out of shared buffers and pin the target.
        let target = self.control.request_checkpoint()?;
        tracing::debug!(checkpoint = %target, "waiting for mirror to apply checkpoint");

        let max_polls = self.timeout.as_secs() * self.waits_per_sec;
        for _ in 0..max_polls {
            self.cancel.check()?;

            let mut all_applied = true;
            for sender in self.control.wal_senders()? {
                if !sender.is_mirror_receiver {
                    continue;
                }

                // Fail early in case primary and mirror are not in sync.
                if sender.pid == 0 || sender.state != WalSenderState::Streaming {
                    tracing::info!("primary and mirror not in sync");
                    return Ok(false);
                }

                if sender.apply_lsn < target {
                    all_applied = false;
                    break;
                }
            }

            if all_applied {
                return Ok(true);
            }

            thread::sleep(Duration::from_millis(1000 / self.waits_per_sec));
        }

        tracing::info!(checkpoint = %target, "mirror did not apply checkpoint within the wait budget");
        Ok(false)
    }
}

/// Replication status as maintained externally in a JSON file: the most
/// recent checkpoint position plus the replication-stream table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub checkpoint_lsn: Lsn,
    #[serde(default)]
    pub wal_senders: Vec<WalSenderInfo>,
}

/// `ReplicationControl` for the CLI: optionally runs an external command
/// to force the checkpoint, then re-reads the status file for the fresh
/// checkpoint position and stream states.
pub struct CommandControl {
    status_path: PathBuf,
    checkpoint_cmd: Option<String>,
}

impl CommandControl {
    pub fn new(status_path: PathBuf, checkpoint_cmd: Option<String>) -> Self {
        Self {
            status_path,
            checkpoint_cmd,
        }
    }

    fn read_status(&self) -> Result<ReplicationStatus> {
        let file = std::fs::File::open(&self.status_path).with_context(|| {
            format!(
                "failed to open replication status file {}",
                self.status_path.display()
            )
        })?;
        let status = serde_json::from_reader(file).with_context(|| {
            format!(
                "failed to parse replication status file {}",
                self.status_path.display()
            )
        })?;
        Ok(status)
    }
}

impl ReplicationControl for CommandControl {
    fn request_checkpoint(&self) -> Result<Lsn> {
        if let Some(cmd) = &self.checkpoint_cmd {
            let status = Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .status()
                .with_context(|| format!("failed to run checkpoint command {:?}", cmd))?;
            if !status.success() {
                bail!("checkpoint command {:?} exited with {}", cmd, status);
            }
        }

        Ok(self.read_status()?.checkpoint_lsn)
    }

    fn wal_senders(&self) -> Result<Vec<WalSenderInfo>> {
        Ok(self.read_status()?.wal_senders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fake control whose checkpoint bumps the target and whose senders
    /// are scripted per poll.
    struct ScriptedControl {
        checkpoint: Lsn,
        polls: Mutex<Vec<Vec<WalSenderInfo>>>,
        checkpoints_requested: Mutex<u32>,
    }

    impl ScriptedControl {
        fn new(checkpoint: Lsn, polls: Vec<Vec<WalSenderInfo>>) -> Self {
            Self {
                checkpoint,
                polls: Mutex::new(polls),
                checkpoints_requested: Mutex::new(0),
            }
        }
    }

    impl ReplicationControl for ScriptedControl {
        fn request_checkpoint(&self) -> Result<Lsn> {
            *self.checkpoints_requested.lock().unwrap() += 1;
            Ok(self.checkpoint)
        }

        fn wal_senders(&self) -> Result<Vec<WalSenderInfo>> {
            let mut polls = self.polls.lock().unwrap();
            if polls.len() > 1 {
                Ok(polls.remove(0))
            } else {
                Ok(polls[0].clone())
            }
        }
    }

    fn sender(is_mirror: bool, state: WalSenderState, apply: u64) -> WalSenderInfo {
        WalSenderInfo {
            pid: if state == WalSenderState::Streaming { 100 } else { 0 },
            is_mirror_receiver: is_mirror,
            state,
            apply_lsn: Lsn(apply),
        }
    }

    #[test]
    fn succeeds_when_mirror_has_applied_target() {
        let control = ScriptedControl::new(
            Lsn(100),
            vec![vec![sender(true, WalSenderState::Streaming, 150)]],
        );
        let gate = SyncGate::new(&control, CancelToken::new());
        assert!(gate.wait_for_apply().unwrap());
    }

    #[test]
    fn waits_until_apply_reaches_target() {
        let control = ScriptedControl::new(
            Lsn(100),
            vec![
                vec![sender(true, WalSenderState::Streaming, 50)],
                vec![sender(true, WalSenderState::Streaming, 99)],
                vec![sender(true, WalSenderState::Streaming, 100)],
            ],
        );
        let gate = SyncGate::new(&control, CancelToken::new());
        assert!(gate.wait_for_apply().unwrap());
    }

    #[test]
    fn fails_immediately_on_dead_sender() {
        let control = ScriptedControl::new(
            Lsn(100),
            vec![vec![sender(true, WalSenderState::Backup, 0)]],
        );
        let gate = SyncGate::new(&control, CancelToken::new());
        assert!(!gate.wait_for_apply().unwrap());
        // Exactly one poll: a dead stream is a fallback, not a wait.
        assert_eq!(control.polls.lock().unwrap().len(), 1);
    }

    #[test]
    fn ignores_non_mirror_senders() {
        // A lagging backup client must not hold the gate open.
        let control = ScriptedControl::new(
            Lsn(100),
            vec![vec![
                sender(false, WalSenderState::Backup, 0),
                sender(true, WalSenderState::Streaming, 200),
            ]],
        );
        let gate = SyncGate::new(&control, CancelToken::new());
        assert!(gate.wait_for_apply().unwrap());
    }

    #[test]
    fn no_mirror_senders_counts_as_applied() {
        let control = ScriptedControl::new(Lsn(100), vec![vec![]]);
        let gate = SyncGate::new(&control, CancelToken::new());
        assert!(gate.wait_for_apply().unwrap());
    }

    #[test]
    fn times_out_when_mirror_never_catches_up() {
        let control = ScriptedControl::new(
            Lsn(100),
            vec![vec![sender(true, WalSenderState::Streaming, 10)]],
        );
        let gate = SyncGate::new(&control, CancelToken::new())
            .with_timeout(Duration::from_secs(1));
        assert!(!gate.wait_for_apply().unwrap());
    }

    #[test]
    fn each_call_requests_a_fresh_checkpoint() {
        let control = ScriptedControl::new(
            Lsn(100),
            vec![vec![sender(true, WalSenderState::Streaming, 150)]],
        );
        let gate = SyncGate::new(&control, CancelToken::new());
        gate.wait_for_apply().unwrap();
        gate.wait_for_apply().unwrap();
        assert_eq!(*control.checkpoints_requested.lock().unwrap(), 2);
    }

    #[test]
    fn cancellation_aborts_the_wait() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let control = ScriptedControl::new(
            Lsn(100),
            vec![vec![sender(true, WalSenderState::Streaming, 150)]],
        );
        let gate = SyncGate::new(&control, cancel);
        let err = gate.wait_for_apply().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AuditError>(),
            Some(AuditError::Cancelled)
        ));
    }

    #[test]
    fn lsn_round_trips_through_display_and_parse() {
        let lsn = Lsn(0x1_2345_6789);
        let text = lsn.to_string();
        assert_eq!(text, "1/23456789");
        let back: Lsn = text.parse().unwrap();
        assert_eq!(back, lsn);
    }

    #[test]
    fn lsn_rejects_malformed_input() {
        assert!("nope".parse::<Lsn>().is_err());
        assert!("1/GG".parse::<Lsn>().is_err());
        assert!("1/100000000".parse::<Lsn>().is_err());
    }
}
