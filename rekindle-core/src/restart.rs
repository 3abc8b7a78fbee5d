/*!
Process state bookkeeping and the restart policy.

[`ProcessState`] is a small JSON document kept next to the database file
and, when remote replication is enabled, in the shared blob. The running
instance stamps a heartbeat into it; operators and outside automation flip
`restart_requested` to ask for a restart without host access.

The policy is evaluated in a fixed order:

1. `restart_requested` set: restart with reason `manual`
2. last restart older than the freeze-prevention age: restart with reason
   `freeze-prevention`
3. otherwise keep running

A restart means clearing the flag, persisting, then triggering the shared
[`ShutdownSignal`]. The host supervisor relaunches the process.
*/

use crate::clock::Clock;
use crate::codec::parse_timestamp;
use crate::shutdown::{ShutdownReason, ShutdownSignal};
use crate::storage::{BlobHandle, PROCESS_STATE_FILE};
use crate::{ErrorKind, RekindleError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared restart bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_restart: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_requested: bool,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub restart_requested_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "last_active", deserialize_with = "lenient_timestamp")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Never decreases over the lifetime of the blob
    #[serde(default)]
    pub restart_count: u64,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub last_shutdown: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_shutdown_reason: Option<String>,
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .filter(|raw| !raw.is_empty())
        .map(|raw| parse_timestamp(&raw).map_err(serde::de::Error::custom))
        .transpose()
}

impl ProcessState {
    /// State of a process that has never booted
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            last_restart: None,
            restart_requested: false,
            restart_requested_at: None,
            last_heartbeat: None,
            restart_count: 0,
            created_at: Some(now),
            last_shutdown: None,
            last_shutdown_reason: None,
        }
    }

    pub fn from_document(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| RekindleError::codec(format!("malformed process state: {e}")))
    }

    pub fn to_document(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Fold in a copy read back from shared storage
    ///
    /// Picks up a restart request written by someone else and keeps the
    /// larger restart count. Everything else stays ours.
    pub fn merge_from(&mut self, other: &ProcessState) {
        if other.restart_requested && !self.restart_requested {
            self.restart_requested = true;
            self.restart_requested_at = other.restart_requested_at;
        }
        self.restart_count = self.restart_count.max(other.restart_count);
        if self.created_at.is_none() {
            self.created_at = other.created_at;
        }
    }

    /// Fold in the shared copy after a boot that could not read it
    ///
    /// The boot is counted on top of the shared count, and a restart request
    /// made before the boot counts as honored.
    pub fn reconcile_boot(&mut self, shared: &ProcessState) {
        let mut shared = shared.clone();
        let honored = match (shared.restart_requested_at, self.last_restart) {
            (Some(asked), Some(booted)) => asked <= booted,
            (None, _) => true,
            (Some(_), None) => false,
        };
        if honored {
            shared.clear_request();
        }
        self.merge_from(&shared);
        self.restart_count = self.restart_count.max(shared.restart_count + 1);
        self.created_at = shared.created_at.or(self.created_at);
    }

    fn clear_request(&mut self) {
        self.restart_requested = false;
        self.restart_requested_at = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartReason {
    Manual,
    FreezePrevention,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::Manual => f.write_str("manual"),
            RestartReason::FreezePrevention => f.write_str("freeze-prevention"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Continue,
    Restart(RestartReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Maximum age of the running instance
    pub freeze_prevention: Duration,
}

impl RestartPolicy {
    pub fn new(freeze_prevention: Duration) -> Self {
        Self { freeze_prevention }
    }

    /// Decide whether `state` calls for a restart at `now`
    pub fn evaluate(&self, state: &ProcessState, now: DateTime<Utc>) -> RestartDecision {
        if state.restart_requested {
            return RestartDecision::Restart(RestartReason::Manual);
        }
        let expired = state
            .last_restart
            .and_then(|last| now.signed_duration_since(last).to_std().ok())
            .is_some_and(|age| age > self.freeze_prevention);
        if expired {
            return RestartDecision::Restart(RestartReason::FreezePrevention);
        }
        RestartDecision::Continue
    }
}

/// Result of the read-only restart check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartCheck {
    pub restart_needed: bool,
    /// `manual`, `freeze-prevention`, `first_start` or `not_needed`
    pub restart_reason: String,
    pub last_restart: Option<DateTime<Utc>>,
    pub hours_since_restart: Option<f64>,
    pub restart_count: u64,
}

impl RestartCheck {
    /// Evaluate without side effects
    ///
    /// A state that has never recorded a boot reports `first_start`, so
    /// outside automation launches the service.
    pub fn evaluate(policy: &RestartPolicy, state: &ProcessState, now: DateTime<Utc>) -> Self {
        let hours_since_restart = state
            .last_restart
            .map(|last| now.signed_duration_since(last).num_seconds() as f64 / 3600.0);

        let (restart_needed, restart_reason) = match policy.evaluate(state, now) {
            RestartDecision::Restart(reason) => (true, reason.to_string()),
            RestartDecision::Continue if state.last_restart.is_none() => {
                (true, "first_start".to_string())
            }
            RestartDecision::Continue => (false, "not_needed".to_string()),
        };

        Self {
            restart_needed,
            restart_reason,
            last_restart: state.last_restart,
            hours_since_restart,
            restart_count: state.restart_count,
        }
    }

    /// `key=value` lines in the format CI step outputs expect
    pub fn to_step_outputs(&self) -> String {
        let last_restart = self
            .last_restart
            .map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
        format!(
            "restart_needed={}\nrestart_reason={}\nlast_restart={}\n",
            self.restart_needed, self.restart_reason, last_restart
        )
    }
}

/// Owns the live [`ProcessState`] of this instance
#[derive(Debug)]
pub struct RestartCoordinator {
    handle: Option<Arc<BlobHandle>>,
    state_file: PathBuf,
    policy: RestartPolicy,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownSignal,
    state: Mutex<Option<ProcessState>>,
    /// Cleared when boot could not read the shared copy; the shared copy is
    /// not written again until it has been read back
    shared_in_sync: AtomicBool,
}

impl RestartCoordinator {
    /// # Arguments
    /// * `handle` - Shared blob, `None` in local mode
    /// * `state_file` - Local copy of the state document
    /// * `policy` - Restart policy
    /// * `clock` - Wall clock for timestamps
    /// * `shutdown` - Signal triggered when the policy fires
    pub fn new(
        handle: Option<Arc<BlobHandle>>,
        state_file: PathBuf,
        policy: RestartPolicy,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            handle,
            state_file,
            policy,
            clock,
            shutdown,
            state: Mutex::new(None),
            shared_in_sync: AtomicBool::new(true),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Last state this instance wrote
    pub async fn current(&self) -> Option<ProcessState> {
        self.state.lock().await.clone()
    }

    /// Record a boot
    ///
    /// Bumps `restart_count`, stamps `last_restart` and the heartbeat, and
    /// clears a restart request that this boot has just honored.
    pub async fn on_boot(&self) -> Result<ProcessState> {
        let now = self.clock.now();
        let mut state = match self.load_state().await {
            Ok(Some(state)) => state,
            Ok(None) => ProcessState::fresh(now),
            Err(err) => {
                warn!(
                    error = %err,
                    "Failed to load process state, keeping it local until the shared copy is readable"
                );
                self.shared_in_sync.store(false, Ordering::SeqCst);
                self.load_local().await.ok().flatten().unwrap_or_else(|| ProcessState::fresh(now))
            }
        };

        if state.restart_requested {
            info!("Clearing restart request honored by this boot");
            state.clear_request();
        }
        state.restart_count += 1;
        state.last_restart = Some(now);
        state.last_heartbeat = Some(now);

        let mut current = self.state.lock().await;
        self.persist(&state).await?;
        *current = Some(state.clone());
        info!(restart_count = state.restart_count, "Recorded boot");
        Ok(state)
    }

    /// Heartbeat and policy evaluation
    ///
    /// Storage failures are logged; the policy is still evaluated on the
    /// in-memory state.
    pub async fn periodic_check(&self) -> Result<RestartDecision> {
        let now = self.clock.now();
        let mut current = self.state.lock().await;
        let mut state = match current.clone() {
            Some(state) => state,
            None => self.load_state().await?.unwrap_or_else(|| ProcessState::fresh(now)),
        };

        if self.shared_in_sync.load(Ordering::SeqCst) {
            match self.load_state().await {
                Ok(Some(shared)) => state.merge_from(&shared),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "Failed to refresh process state"),
            }
        } else {
            match self.load_shared().await {
                Ok(shared) => {
                    if let Some(shared) = shared {
                        state.reconcile_boot(&shared);
                    }
                    self.shared_in_sync.store(true, Ordering::SeqCst);
                    info!(restart_count = state.restart_count, "Shared process state readable again");
                }
                Err(err) => warn!(error = %err, "Shared process state still unreadable"),
            }
        }

        state.last_heartbeat = Some(now);
        if let Err(err) = self.persist(&state).await {
            warn!(error = %err, "Failed to persist heartbeat");
        }
        #[cfg(feature = "metrics")]
        crate::observability::with_metrics(|m| m.record_heartbeat());
        debug!(at = %now, "Heartbeat");

        let decision = self.policy.evaluate(&state, now);
        if let RestartDecision::Restart(reason) = decision {
            info!(reason = %reason, restart_count = state.restart_count, "Restart policy fired");
            state.clear_request();
            if let Err(err) = self.persist(&state).await {
                warn!(error = %err, "Failed to clear restart request before shutdown");
            }
            self.shutdown.trigger(ShutdownReason::Restart(reason));
        }

        *current = Some(state);
        Ok(decision)
    }

    /// Evaluate the policy against the shared state without writing anything
    pub async fn check_restart(&self) -> Result<RestartCheck> {
        let now = self.clock.now();
        let state = self
            .load_state()
            .await?
            .unwrap_or_else(|| ProcessState::fresh(now));
        Ok(RestartCheck::evaluate(&self.policy, &state, now))
    }

    /// Ask the running instance to restart at its next heartbeat
    pub async fn request_restart(&self) -> Result<ProcessState> {
        let now = self.clock.now();
        let mut state = self
            .load_state()
            .await?
            .unwrap_or_else(|| ProcessState::fresh(now));
        state.restart_requested = true;
        state.restart_requested_at = Some(now);
        self.persist(&state).await?;
        info!("Restart requested");
        Ok(state)
    }

    /// Stamp the shutdown time and reason
    pub async fn record_shutdown(&self, reason: ShutdownReason) -> Result<()> {
        let now = self.clock.now();
        let mut current = self.state.lock().await;
        let mut state = match current.clone() {
            Some(state) => state,
            None => self.load_state().await?.unwrap_or_else(|| ProcessState::fresh(now)),
        };
        state.last_shutdown = Some(now);
        state.last_shutdown_reason = Some(reason.to_string());
        self.persist(&state).await?;
        *current = Some(state);
        Ok(())
    }

    /// Run [`RestartCoordinator::periodic_check`] every `heartbeat_interval`
    /// until cancelled or the policy fires
    ///
    /// The first check happens one interval after the call, since
    /// [`RestartCoordinator::on_boot`] has just written a heartbeat.
    pub async fn run(self: Arc<Self>, heartbeat_interval: Duration, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = heartbeat_interval.as_secs(), "Restart coordinator started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Restart coordinator cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    match self.periodic_check().await {
                        Ok(RestartDecision::Restart(_)) => break,
                        Ok(RestartDecision::Continue) => {}
                        Err(err) => warn!(error = %err, "Periodic restart check failed"),
                    }
                }
            }
        }
        info!("Restart coordinator stopped");
    }

    /// Current state: the shared copy first, the local file when the blob
    /// has none
    pub async fn load_state(&self) -> Result<Option<ProcessState>> {
        match self.load_shared().await? {
            Some(state) => Ok(Some(state)),
            None => self.load_local().await,
        }
    }

    /// The shared copy alone; `None` when there is no blob or it holds no state
    async fn load_shared(&self) -> Result<Option<ProcessState>> {
        let Some(handle) = &self.handle else {
            return Ok(None);
        };
        if handle.blob_id().await.is_none() {
            return Ok(None);
        }
        match handle.fetch_file(PROCESS_STATE_FILE).await {
            Ok(text) => ProcessState::from_document(&text).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("No shared process state yet");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn load_local(&self) -> Result<Option<ProcessState>> {
        match tokio::fs::read_to_string(&self.state_file).await {
            Ok(text) => ProcessState::from_document(&text).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn persist(&self, state: &ProcessState) -> Result<()> {
        let document = state.to_document()?;
        write_atomically(&self.state_file, &document).await?;
        if !self.shared_in_sync.load(Ordering::SeqCst) {
            debug!("Shared process state unread, wrote the local copy only");
            return Ok(());
        }
        if let Some(handle) = &self.handle {
            handle.write_file(PROCESS_STATE_FILE, &document).await?;
        }
        Ok(())
    }
}

async fn write_atomically(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = path.with_extension("json.partial");
    tokio::fs::write(&partial, content).await?;
    tokio::fs::rename(&partial, path).await?;
    Ok(())
}
