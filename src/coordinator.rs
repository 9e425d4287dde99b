//! Test-run lifecycle and fan-out.
//!
//! The coordinator is a pure state machine: operations validate,
//! mutate run state, and return the channel messages to emit. It does
//! no I/O itself, so every lifecycle rule is testable without a
//! transport. A run's state is always a function of the results
//! received so far and the fixed target set.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::PlatformResult;
use crate::channel::message::{Outbound, StartTest, StopTest};
use crate::channel::ChannelError;
use crate::config::TestCase;
use crate::registry::PlatformRegistry;

pub type RunId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Validating,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }
}

/// Per-platform sub-status within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl PlatformRunStatus {
    /// Settled statuses no longer count toward completion tracking.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformProgress {
    pub status: PlatformRunStatus,
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_step: Option<String>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestRun {
    pub id: RunId,
    pub case_key: String,
    pub created_at: DateTime<Utc>,
    pub state: RunState,
    pub platforms: BTreeMap<String, PlatformProgress>,
}

impl TestRun {
    /// Overall progress in [0, 1]: settled platforms count as done,
    /// running ones contribute their reported percentage.
    pub fn progress_fraction(&self) -> f64 {
        if self.platforms.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .platforms
            .values()
            .map(|p| match p.status {
                s if s.is_settled() => 1.0,
                PlatformRunStatus::Running => (p.percent / 100.0).clamp(0.0, 1.0),
                _ => 0.0,
            })
            .sum();
        sum / self.platforms.len() as f64
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("unknown test case: {0}")]
    NoTestCase(String),
    #[error("no target platforms selected")]
    NoPlatformSelected,
    #[error("a run is already in progress: {0}")]
    RunInProgress(RunId),
    #[error("platforms unavailable: {}", .0.join(", "))]
    PlatformUnavailable(Vec<String>),
    #[error("no run is currently running")]
    NotRunning,
    #[error("fan-out rejected by channel")]
    Channel(#[from] ChannelError),
}

/// Platforms force-failed by the watchdog in one sweep, plus the run
/// state if the sweep drove the run to a terminal state.
#[derive(Debug)]
pub struct WatchdogReport {
    pub run_id: RunId,
    pub expired: Vec<(String, PlatformResult)>,
    pub new_state: Option<RunState>,
}

pub struct TestRunCoordinator {
    cases: BTreeMap<String, TestCase>,
    watchdog: chrono::Duration,
    active: Option<TestRun>,
    history: VecDeque<TestRun>,
    history_cap: usize,
}

impl TestRunCoordinator {
    pub fn new(cases: Vec<TestCase>, watchdog: chrono::Duration) -> Self {
        Self {
            cases: cases.into_iter().map(|c| (c.key.clone(), c)).collect(),
            watchdog,
            active: None,
            history: VecDeque::new(),
            history_cap: 32,
        }
    }

    pub fn state(&self) -> RunState {
        self.active
            .as_ref()
            .map(|r| r.state)
            .unwrap_or(RunState::Idle)
    }

    pub fn active_run(&self) -> Option<&TestRun> {
        self.active.as_ref()
    }

    pub fn run(&self, run_id: &str) -> Option<&TestRun> {
        self.active
            .as_ref()
            .filter(|r| r.id == run_id)
            .or_else(|| self.history.iter().rev().find(|r| r.id == run_id))
    }

    pub fn test_cases(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.values()
    }

    /// Accept a run and produce the fan-out messages, one per target.
    /// Validation is atomic: either every target is eligible or the
    /// run is rejected with no message emitted and no state touched.
    pub fn start_run(
        &mut self,
        case_key: &str,
        targets: &[String],
        registry: &PlatformRegistry,
        now: DateTime<Utc>,
    ) -> Result<(RunId, Vec<Outbound>), RunError> {
        let case = self
            .cases
            .get(case_key)
            .ok_or_else(|| RunError::NoTestCase(case_key.to_string()))?;
        if targets.is_empty() {
            return Err(RunError::NoPlatformSelected);
        }
        if let Some(active) = &self.active {
            if !active.state.is_terminal() {
                return Err(RunError::RunInProgress(active.id.clone()));
            }
        }

        let offline: Vec<String> = targets
            .iter()
            .filter(|t| !registry.is_online(t))
            .cloned()
            .collect();
        if !offline.is_empty() {
            return Err(RunError::PlatformUnavailable(offline));
        }

        let run_id = format!(
            "{}-{}-{}",
            case_key,
            now.timestamp(),
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let platforms = targets
            .iter()
            .map(|t| {
                (
                    t.clone(),
                    PlatformProgress {
                        status: PlatformRunStatus::Pending,
                        percent: 0.0,
                        last_step: None,
                        last_activity: now,
                    },
                )
            })
            .collect();

        let mut run = TestRun {
            id: run_id.clone(),
            case_key: case_key.to_string(),
            created_at: now,
            state: RunState::Validating,
            platforms,
        };
        run.state = RunState::Running;

        let messages = targets
            .iter()
            .map(|t| {
                Outbound::StartTest(StartTest {
                    run_id: run_id.clone(),
                    test_case: case_key.to_string(),
                    platform: t.clone(),
                    steps: case.steps.clone(),
                    parameters: case.parameters.clone(),
                })
            })
            .collect();

        info!(run_id = %run_id, case = %case_key, targets = targets.len(), "run started");
        self.active = Some(run);
        Ok((run_id, messages))
    }

    /// A run-level fault (e.g. the channel rejected the fan-out
    /// itself). Per-platform failures never come through here.
    pub fn fail_run(&mut self, reason: &str) -> Option<RunId> {
        let run = self.active.as_mut()?;
        if run.state.is_terminal() {
            return None;
        }
        warn!(run_id = %run.id, reason, "run failed");
        for progress in run.platforms.values_mut() {
            if !progress.status.is_settled() {
                progress.status = PlatformRunStatus::Cancelled;
            }
        }
        run.state = RunState::Failed;
        let id = run.id.clone();
        self.retire_active();
        Some(id)
    }

    /// Progress push for one platform. Returns true if the run's
    /// tracked state changed.
    pub fn handle_progress(
        &mut self,
        run_id: &str,
        platform: &str,
        step: Option<&str>,
        percent: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(run) = self.active.as_mut().filter(|r| r.id == run_id) else {
            debug!(run_id, "progress for inactive run ignored");
            return false;
        };
        let Some(progress) = run.platforms.get_mut(platform) else {
            warn!(run_id, platform, "progress from platform outside the target set ignored");
            return false;
        };
        if progress.status.is_settled() {
            return false;
        }
        progress.status = PlatformRunStatus::Running;
        progress.percent = percent;
        progress.last_step = step.map(str::to_string);
        progress.last_activity = now;
        true
    }

    /// Final result for one platform. Returns the run's new state if
    /// this result drove it to a terminal state.
    pub fn handle_result(
        &mut self,
        run_id: &str,
        platform: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> Option<RunState> {
        let Some(run) = self.active.as_mut().filter(|r| r.id == run_id) else {
            debug!(run_id, platform, "result for inactive run ignored");
            return None;
        };
        let Some(progress) = run.platforms.get_mut(platform) else {
            warn!(run_id, platform, "result from platform outside the target set ignored");
            return None;
        };
        progress.status = if success {
            PlatformRunStatus::Succeeded
        } else {
            PlatformRunStatus::Failed
        };
        progress.percent = 100.0;
        progress.last_activity = now;
        self.maybe_complete()
    }

    /// Cancellation acknowledgment from the backend; informational.
    pub fn handle_stopped(&self, run_id: &str) {
        debug!(run_id, "backend acknowledged stop");
    }

    /// Force-fail platforms that have been silent longer than the
    /// watchdog window, so an unreachable platform cannot stall the
    /// run forever.
    pub fn check_watchdog(&mut self, now: DateTime<Utc>) -> Option<WatchdogReport> {
        let watchdog = self.watchdog;
        let run = self.active.as_mut().filter(|r| r.state == RunState::Running)?;
        let run_id = run.id.clone();

        let mut expired = Vec::new();
        for (platform, progress) in run.platforms.iter_mut() {
            if progress.status.is_settled() {
                continue;
            }
            if now - progress.last_activity >= watchdog {
                warn!(run_id = %run_id, platform = %platform, "platform timed out, failing it");
                progress.status = PlatformRunStatus::Failed;
                progress.last_activity = now;
                expired.push((platform.clone(), PlatformResult::timed_out(watchdog, now)));
            }
        }
        if expired.is_empty() {
            return None;
        }
        let new_state = self.maybe_complete();
        Some(WatchdogReport {
            run_id,
            expired,
            new_state,
        })
    }

    /// Stop the active run. Best-effort and advisory: the run is
    /// marked Stopped immediately, without waiting for platform
    /// acknowledgments.
    pub fn stop_run(&mut self, _now: DateTime<Utc>) -> Result<(RunId, Outbound), RunError> {
        let run = self
            .active
            .as_mut()
            .filter(|r| r.state == RunState::Running)
            .ok_or(RunError::NotRunning)?;

        for progress in run.platforms.values_mut() {
            if !progress.status.is_settled() {
                progress.status = PlatformRunStatus::Cancelled;
            }
        }
        run.state = RunState::Stopped;
        let id = run.id.clone();
        info!(run_id = %id, "run stopped");
        self.retire_active();
        Ok((id.clone(), Outbound::StopTest(StopTest { run_id: id })))
    }

    /// Completed exactly when no platform is still pending or
    /// running. All-failed is still Completed; Failed is reserved for
    /// run-level faults.
    fn maybe_complete(&mut self) -> Option<RunState> {
        let run = self.active.as_mut()?;
        if run.state != RunState::Running {
            return None;
        }
        if run.platforms.values().all(|p| p.status.is_settled()) {
            run.state = RunState::Completed;
            info!(run_id = %run.id, "run completed");
            self.retire_active();
            return Some(RunState::Completed);
        }
        None
    }

    fn retire_active(&mut self) {
        if let Some(run) = self.active.take() {
            if self.history.len() == self.history_cap {
                self.history.pop_front();
            }
            self.history.push_back(run);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::stub::StubCommander;
    use std::collections::BTreeMap as Map;

    fn coordinator() -> TestRunCoordinator {
        TestRunCoordinator::new(Config::default().test_cases, chrono::Duration::seconds(60))
    }

    fn registry_with_online(keys: &[&str]) -> PlatformRegistry {
        let mut reg = PlatformRegistry::new(&Config::default().platforms, StubCommander::ok());
        let push: Map<String, bool> = keys.iter().map(|k| (k.to_string(), true)).collect();
        reg.apply_status_update(&push);
        reg
    }

    fn targets(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_start_run_validation_errors() {
        let mut coord = coordinator();
        let reg = registry_with_online(&["real_robot", "gazebo"]);
        let now = Utc::now();

        let err = coord
            .start_run("backflip", &targets(&["gazebo"]), &reg, now)
            .unwrap_err();
        assert!(matches!(err, RunError::NoTestCase(_)));

        let err = coord.start_run("walk_forward", &[], &reg, now).unwrap_err();
        assert!(matches!(err, RunError::NoPlatformSelected));

        assert_eq!(coord.state(), RunState::Idle);
    }

    #[test]
    fn test_offline_target_rejects_whole_run() {
        let mut coord = coordinator();
        // Only the robot is online; gazebo stays Offline.
        let reg = registry_with_online(&["real_robot"]);

        let err = coord
            .start_run(
                "walk_forward",
                &targets(&["real_robot", "gazebo"]),
                &reg,
                Utc::now(),
            )
            .unwrap_err();
        match err {
            RunError::PlatformUnavailable(keys) => assert_eq!(keys, vec!["gazebo".to_string()]),
            other => panic!("expected PlatformUnavailable, got {other:?}"),
        }
        // No partial start: nothing active, nothing would have been sent.
        assert_eq!(coord.state(), RunState::Idle);
        assert!(coord.active_run().is_none());
    }

    #[test]
    fn test_fan_out_emits_one_message_per_target() {
        let mut coord = coordinator();
        let reg = registry_with_online(&["real_robot", "gazebo"]);

        let (run_id, messages) = coord
            .start_run(
                "walk_forward",
                &targets(&["real_robot", "gazebo"]),
                &reg,
                Utc::now(),
            )
            .unwrap();

        assert_eq!(messages.len(), 2);
        let mut seen = Vec::new();
        for msg in &messages {
            match msg {
                Outbound::StartTest(st) => {
                    assert_eq!(st.run_id, run_id);
                    assert_eq!(st.test_case, "walk_forward");
                    assert!(!st.steps.is_empty());
                    seen.push(st.platform.clone());
                }
                other => panic!("expected start_test, got {other:?}"),
            }
        }
        assert_eq!(seen, vec!["real_robot".to_string(), "gazebo".to_string()]);
        assert_eq!(coord.state(), RunState::Running);
    }

    #[test]
    fn test_second_run_rejected_while_running() {
        let mut coord = coordinator();
        let reg = registry_with_online(&["real_robot", "gazebo"]);
        let (run_id, _) = coord
            .start_run("walk_forward", &targets(&["gazebo"]), &reg, Utc::now())
            .unwrap();

        let err = coord
            .start_run("walk_forward", &targets(&["real_robot"]), &reg, Utc::now())
            .unwrap_err();
        match err {
            RunError::RunInProgress(id) => assert_eq!(id, run_id),
            other => panic!("expected RunInProgress, got {other:?}"),
        }
        // The original run is untouched.
        let active = coord.active_run().unwrap();
        assert_eq!(active.id, run_id);
        assert_eq!(active.state, RunState::Running);
        assert_eq!(active.platforms.len(), 1);
    }

    #[test]
    fn test_mixed_results_complete_the_run() {
        let mut coord = coordinator();
        let reg = registry_with_online(&["real_robot", "gazebo"]);
        let (run_id, _) = coord
            .start_run(
                "walk_forward",
                &targets(&["real_robot", "gazebo"]),
                &reg,
                Utc::now(),
            )
            .unwrap();

        let now = Utc::now();
        assert!(coord.handle_progress(&run_id, "real_robot", Some("walk"), 40.0, now));
        assert_eq!(coord.handle_result(&run_id, "real_robot", true, now), None);
        assert_eq!(coord.state(), RunState::Running);

        // One platform failing does not fail the run.
        let state = coord.handle_result(&run_id, "gazebo", false, now);
        assert_eq!(state, Some(RunState::Completed));

        let run = coord.run(&run_id).unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(
            run.platforms["real_robot"].status,
            PlatformRunStatus::Succeeded
        );
        assert_eq!(run.platforms["gazebo"].status, PlatformRunStatus::Failed);
        assert!((run.progress_fraction() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_all_failed_is_completed_not_failed() {
        let mut coord = coordinator();
        let reg = registry_with_online(&["real_robot", "gazebo"]);
        let (run_id, _) = coord
            .start_run(
                "walk_forward",
                &targets(&["real_robot", "gazebo"]),
                &reg,
                Utc::now(),
            )
            .unwrap();

        let now = Utc::now();
        coord.handle_result(&run_id, "real_robot", false, now);
        let state = coord.handle_result(&run_id, "gazebo", false, now);
        assert_eq!(state, Some(RunState::Completed));
    }

    #[test]
    fn test_watchdog_force_fails_silent_platform() {
        let mut coord =
            TestRunCoordinator::new(Config::default().test_cases, chrono::Duration::seconds(30));
        let reg = registry_with_online(&["real_robot", "gazebo"]);
        let start = Utc::now();
        let (run_id, _) = coord
            .start_run(
                "walk_forward",
                &targets(&["real_robot", "gazebo"]),
                &reg,
                start,
            )
            .unwrap();

        coord.handle_result(&run_id, "real_robot", true, start);

        // Before the window closes nothing expires.
        assert!(coord
            .check_watchdog(start + chrono::Duration::seconds(29))
            .is_none());

        let report = coord
            .check_watchdog(start + chrono::Duration::seconds(31))
            .expect("gazebo should have timed out");
        assert_eq!(report.run_id, run_id);
        assert_eq!(report.expired.len(), 1);
        let (platform, result) = &report.expired[0];
        assert_eq!(platform, "gazebo");
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("watchdog"));
        // The run reaches a terminal state instead of hanging.
        assert_eq!(report.new_state, Some(RunState::Completed));
    }

    #[test]
    fn test_stop_run_cancels_outstanding_platforms() {
        let mut coord = coordinator();
        let reg = registry_with_online(&["real_robot", "gazebo"]);
        let (run_id, _) = coord
            .start_run(
                "walk_forward",
                &targets(&["real_robot", "gazebo"]),
                &reg,
                Utc::now(),
            )
            .unwrap();
        coord.handle_result(&run_id, "real_robot", true, Utc::now());

        let (stopped_id, msg) = coord.stop_run(Utc::now()).unwrap();
        assert_eq!(stopped_id, run_id);
        assert!(matches!(msg, Outbound::StopTest(ref st) if st.run_id == run_id));

        let run = coord.run(&run_id).unwrap();
        assert_eq!(run.state, RunState::Stopped);
        assert_eq!(
            run.platforms["real_robot"].status,
            PlatformRunStatus::Succeeded
        );
        assert_eq!(run.platforms["gazebo"].status, PlatformRunStatus::Cancelled);

        // Stopping again is invalid outside Running.
        assert!(matches!(
            coord.stop_run(Utc::now()),
            Err(RunError::NotRunning)
        ));
        // And a new run may start once the previous one is terminal.
        assert!(coord
            .start_run("walk_forward", &targets(&["gazebo"]), &reg, Utc::now())
            .is_ok());
    }

    #[test]
    fn test_late_result_does_not_reopen_terminal_run() {
        let mut coord = coordinator();
        let reg = registry_with_online(&["gazebo"]);
        let (run_id, _) = coord
            .start_run("walk_forward", &targets(&["gazebo"]), &reg, Utc::now())
            .unwrap();
        coord.handle_result(&run_id, "gazebo", true, Utc::now());
        assert_eq!(coord.run(&run_id).unwrap().state, RunState::Completed);

        assert_eq!(coord.handle_result(&run_id, "gazebo", false, Utc::now()), None);
        assert_eq!(coord.run(&run_id).unwrap().state, RunState::Completed);
    }

    #[test]
    fn test_fail_run_is_terminal_run_level_fault() {
        let mut coord = coordinator();
        let reg = registry_with_online(&["gazebo"]);
        let (run_id, _) = coord
            .start_run("walk_forward", &targets(&["gazebo"]), &reg, Utc::now())
            .unwrap();

        assert_eq!(coord.fail_run("channel rejected fan-out"), Some(run_id.clone()));
        let run = coord.run(&run_id).unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.platforms["gazebo"].status, PlatformRunStatus::Cancelled);
    }

    #[test]
    fn test_run_ids_disambiguate_consecutive_runs() {
        let mut coord = coordinator();
        let reg = registry_with_online(&["gazebo"]);
        let now = Utc::now();
        let (first, _) = coord
            .start_run("walk_forward", &targets(&["gazebo"]), &reg, now)
            .unwrap();
        coord.handle_result(&first, "gazebo", true, now);
        let (second, _) = coord
            .start_run("walk_forward", &targets(&["gazebo"]), &reg, now)
            .unwrap();
        assert_ne!(first, second);
    }
}
