//! Peer recovery state machine
//!
//! Restart and watchdog decisions are a pure transition table over
//! `(RecoveryState, RecoveryEvent)`. The manager owns the timers and executes
//! the returned [`RecoveryAction`]s, so the retry bound and cancellation rules
//! can be checked without a runtime.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::manager::MeshEvent;

/// Restart policy for one peer
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Restarts allowed before giving up (default: 3)
    pub max_attempts: u32,
    /// Fixed delay before a restart (default: 2s)
    pub restart_delay: Duration,
    /// Time allowed for remote media to show up (default: 8s)
    pub stream_timeout: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            restart_delay: Duration::from_millis(2000),
            stream_timeout: Duration::from_millis(8000),
        }
    }
}

impl From<&crate::config::ConfigOptions> for RecoveryPolicy {
    fn from(options: &crate::config::ConfigOptions) -> Self {
        Self {
            max_attempts: options.max_restart_attempts,
            restart_delay: options.peer_restart_delay(),
            stream_timeout: options.stream_watchdog(),
        }
    }
}

/// Where a peer is in the recovery cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Healthy, or not yet connected
    Idle,
    /// Watchdog armed, waiting for remote media
    AwaitingStream,
    /// Restart timer armed
    RestartScheduled,
    /// Attempts used up; the peer stays unconnected
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryEvent {
    /// Transport reached connected
    Connected { has_stream: bool },
    /// Remote media observed
    StreamObserved,
    /// Transport reported failed, disconnected or closed
    ConnectionLost,
    WatchdogExpired,
    RestartTimerFired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    ArmWatchdog,
    CancelWatchdog,
    ScheduleRestart,
    CancelRestart,
    /// Destroy and recreate the connection context
    Restart,
    /// Stop retrying
    GiveUp,
}

/// Per-peer recovery bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryState {
    pub attempts: u32,
    pub phase: RecoveryPhase,
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self {
            attempts: 0,
            phase: RecoveryPhase::Idle,
        }
    }
}

impl RecoveryState {
    /// Apply one event, returning the side effects to run in order
    pub fn apply(&mut self, event: RecoveryEvent, policy: &RecoveryPolicy) -> Vec<RecoveryAction> {
        use RecoveryAction::*;
        use RecoveryPhase::*;

        match (self.phase, event) {
            (_, RecoveryEvent::StreamObserved) => {
                self.attempts = 0;
                self.phase = Idle;
                vec![CancelWatchdog, CancelRestart]
            }

            (Exhausted, RecoveryEvent::Connected { .. }) => vec![],
            (_, RecoveryEvent::Connected { has_stream: true }) => {
                let cancel_restart = self.phase == RestartScheduled;
                self.phase = Idle;
                if cancel_restart {
                    vec![CancelRestart]
                } else {
                    vec![]
                }
            }
            (RestartScheduled, RecoveryEvent::Connected { has_stream: false }) => {
                self.phase = AwaitingStream;
                vec![CancelRestart, ArmWatchdog]
            }
            (AwaitingStream, RecoveryEvent::Connected { has_stream: false }) => vec![],
            (Idle, RecoveryEvent::Connected { has_stream: false }) => {
                self.phase = AwaitingStream;
                vec![ArmWatchdog]
            }

            (RestartScheduled | Exhausted, RecoveryEvent::ConnectionLost) => vec![],
            (Idle, RecoveryEvent::WatchdogExpired)
            | (RestartScheduled | Exhausted, RecoveryEvent::WatchdogExpired) => vec![],
            (_, RecoveryEvent::ConnectionLost | RecoveryEvent::WatchdogExpired) => {
                if self.attempts >= policy.max_attempts {
                    self.phase = Exhausted;
                    vec![CancelWatchdog, GiveUp]
                } else {
                    self.phase = RestartScheduled;
                    vec![CancelWatchdog, ScheduleRestart]
                }
            }

            (RestartScheduled, RecoveryEvent::RestartTimerFired) => {
                self.attempts += 1;
                self.phase = AwaitingStream;
                vec![Restart, ArmWatchdog]
            }
            (_, RecoveryEvent::RestartTimerFired) => vec![],
        }
    }
}

/// Which recovery timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Watchdog,
    Restart,
}

/// Armed timer; aborting the handle cancels it
#[derive(Debug)]
pub(crate) struct Timer {
    pub(crate) token: u64,
    handle: JoinHandle<()>,
}

impl Timer {
    /// Post `MeshEvent::Timer` after `delay`
    pub(crate) fn arm(
        tx: mpsc::UnboundedSender<MeshEvent>,
        peer_id: &str,
        kind: TimerKind,
        token: u64,
        delay: Duration,
    ) -> Self {
        let peer_id = peer_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(MeshEvent::Timer {
                peer_id,
                kind,
                token,
            });
        });
        Self { token, handle }
    }

    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}

/// Recovery state plus the timers it owns
#[derive(Debug, Default)]
pub(crate) struct PeerRecovery {
    pub(crate) state: RecoveryState,
    pub(crate) watchdog: Option<Timer>,
    pub(crate) restart: Option<Timer>,
}

impl PeerRecovery {
    pub(crate) fn slot(&mut self, kind: TimerKind) -> &mut Option<Timer> {
        match kind {
            TimerKind::Watchdog => &mut self.watchdog,
            TimerKind::Restart => &mut self.restart,
        }
    }

    pub(crate) fn pending_timers(&self) -> usize {
        self.watchdog.is_some() as usize + self.restart.is_some() as usize
    }

    pub(crate) fn cancel_all(&mut self) {
        if let Some(timer) = self.watchdog.take() {
            timer.cancel();
        }
        if let Some(timer) = self.restart.take() {
            timer.cancel();
        }
    }
}
