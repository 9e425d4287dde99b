//! Single-writer event loop tying the pieces together.
//!
//! One task owns the registry, coordinator, aggregator, and log ring.
//! Every mutation happens on this task: inbound channel messages,
//! caller commands, and watchdog ticks all flow through one ordered
//! queue and are processed to completion before the next is drawn.
//! Presentation layers observe through the `StateChange` broadcast
//! stream and the handle's query commands; nothing mutates state from
//! outside.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

use crate::aggregate::{
    AggregateError, ComparisonSummary, ExportDocument, PlatformResult, ResultAggregator,
};
use crate::channel::message::{Inbound, MessageKind};
use crate::channel::ChannelSupervisor;
use crate::config::Config;
use crate::coordinator::{RunId, RunState, TestRun, TestRunCoordinator};
use crate::logbuf::{LogEntry, LogLevel, LogRing};
use crate::registry::{Platform, PlatformCommander, PlatformRegistry, PlatformState, RegistryError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator is not running")]
    Shutdown,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Run(#[from] crate::coordinator::RunError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// State-change notifications for presentation layers.
#[derive(Debug, Clone)]
pub enum StateChange {
    Platform {
        key: String,
        state: PlatformState,
    },
    Run {
        run_id: RunId,
        state: RunState,
    },
    RunProgress {
        run_id: RunId,
        platform: String,
        fraction: f64,
    },
}

enum Command {
    ConnectPlatform {
        key: String,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    DisconnectPlatform {
        key: String,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    DisconnectAll {
        reply: oneshot::Sender<Vec<(String, RegistryError)>>,
    },
    StartRun {
        case_key: String,
        platforms: Vec<String>,
        reply: oneshot::Sender<Result<RunId, crate::coordinator::RunError>>,
    },
    StopRun {
        reply: oneshot::Sender<Result<RunId, crate::coordinator::RunError>>,
    },
    Summarize {
        run_id: String,
        reply: oneshot::Sender<Result<ComparisonSummary, AggregateError>>,
    },
    Export {
        run_id: String,
        reply: oneshot::Sender<Result<ExportDocument, AggregateError>>,
    },
    Platforms {
        reply: oneshot::Sender<Vec<Platform>>,
    },
    QueryRun {
        run_id: Option<String>,
        reply: oneshot::Sender<Option<TestRun>>,
    },
    RecentLogs {
        reply: oneshot::Sender<Vec<LogEntry>>,
    },
}

enum Event {
    Inbound(Inbound),
    Command(Command),
}

/// Cloneable front door to the orchestrator task.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<Event>,
    changes: broadcast::Sender<StateChange>,
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Command(build(reply)))
            .map_err(|_| OrchestratorError::Shutdown)?;
        rx.await.map_err(|_| OrchestratorError::Shutdown)
    }

    pub async fn connect_platform(&self, key: &str) -> Result<(), OrchestratorError> {
        let key = key.to_string();
        self.request(|reply| Command::ConnectPlatform { key, reply })
            .await?
            .map_err(Into::into)
    }

    pub async fn disconnect_platform(&self, key: &str) -> Result<(), OrchestratorError> {
        let key = key.to_string();
        self.request(|reply| Command::DisconnectPlatform { key, reply })
            .await?
            .map_err(Into::into)
    }

    pub async fn disconnect_all(&self) -> Result<Vec<(String, RegistryError)>, OrchestratorError> {
        self.request(|reply| Command::DisconnectAll { reply }).await
    }

    pub async fn start_run(
        &self,
        case_key: &str,
        platforms: Vec<String>,
    ) -> Result<RunId, OrchestratorError> {
        let case_key = case_key.to_string();
        self.request(|reply| Command::StartRun {
            case_key,
            platforms,
            reply,
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn stop_run(&self) -> Result<RunId, OrchestratorError> {
        self.request(|reply| Command::StopRun { reply })
            .await?
            .map_err(Into::into)
    }

    pub async fn summarize(&self, run_id: &str) -> Result<ComparisonSummary, OrchestratorError> {
        let run_id = run_id.to_string();
        self.request(|reply| Command::Summarize { run_id, reply })
            .await?
            .map_err(Into::into)
    }

    pub async fn export(&self, run_id: &str) -> Result<ExportDocument, OrchestratorError> {
        let run_id = run_id.to_string();
        self.request(|reply| Command::Export { run_id, reply })
            .await?
            .map_err(Into::into)
    }

    pub async fn platforms(&self) -> Result<Vec<Platform>, OrchestratorError> {
        self.request(|reply| Command::Platforms { reply }).await
    }

    /// Query the active run (`None` id) or a specific run by id.
    pub async fn run_snapshot(
        &self,
        run_id: Option<String>,
    ) -> Result<Option<TestRun>, OrchestratorError> {
        self.request(|reply| Command::QueryRun { run_id, reply }).await
    }

    pub async fn recent_logs(&self) -> Result<Vec<LogEntry>, OrchestratorError> {
        self.request(|reply| Command::RecentLogs { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Wait until `run_id` reaches a terminal state.
    pub async fn wait_for_run(&self, run_id: &str) -> Result<RunState, OrchestratorError> {
        let mut rx = self.changes.subscribe();
        // The run may already be terminal; check after subscribing so
        // no transition can slip between the two.
        if let Some(run) = self.run_snapshot(Some(run_id.to_string())).await? {
            if run.state.is_terminal() {
                return Ok(run.state);
            }
        }
        loop {
            match rx.recv().await {
                Ok(StateChange::Run { run_id: id, state }) if id == run_id && state.is_terminal() => {
                    return Ok(state);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(run) = self.run_snapshot(Some(run_id.to_string())).await? {
                        if run.state.is_terminal() {
                            return Ok(run.state);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(OrchestratorError::Shutdown),
            }
        }
    }
}

pub struct Orchestrator {
    registry: PlatformRegistry,
    coordinator: TestRunCoordinator,
    aggregator: ResultAggregator,
    log: LogRing,
    supervisor: Arc<ChannelSupervisor>,
    events: mpsc::UnboundedReceiver<Event>,
    events_tx: mpsc::UnboundedSender<Event>,
    changes: broadcast::Sender<StateChange>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        commander: Arc<dyn PlatformCommander>,
        supervisor: Arc<ChannelSupervisor>,
    ) -> (Self, OrchestratorHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(256);
        let orchestrator = Self {
            registry: PlatformRegistry::new(&config.platforms, commander),
            coordinator: TestRunCoordinator::new(
                config.test_cases.clone(),
                config.channel.watchdog(),
            ),
            aggregator: ResultAggregator::default(),
            log: LogRing::default(),
            supervisor,
            events,
            events_tx: events_tx.clone(),
            changes: changes.clone(),
        };
        // Register before anything can arrive on the channel, so no
        // early push is dropped.
        orchestrator.register_channel_handlers();
        let handle = OrchestratorHandle {
            tx: events_tx,
            changes,
        };
        (orchestrator, handle)
    }

    /// Spawn the event loop.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// The single consumer of the event queue. Each event is handled
    /// to completion before the next is drawn.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(Event::Inbound(msg)) => self.handle_inbound(msg),
                    Some(Event::Command(cmd)) => self.handle_command(cmd).await,
                    None => {
                        info!("orchestrator queue closed, shutting down");
                        break;
                    }
                },
                _ = tick.tick() => self.check_watchdog(),
            }
        }
    }

    fn register_channel_handlers(&self) {
        for kind in MessageKind::ALL {
            let tx = self.events_tx.clone();
            self.supervisor.on_message(kind, move |msg| {
                tx.send(Event::Inbound(msg.clone()))
                    .map_err(|_| anyhow::anyhow!("orchestrator queue closed"))
            });
        }
    }

    fn notify(&self, change: StateChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    fn handle_inbound(&mut self, msg: Inbound) {
        let now = Utc::now();
        match msg {
            Inbound::StatusUpdate(update) => {
                for (key, state) in self.registry.apply_status_update(&update.platforms) {
                    self.notify(StateChange::Platform { key, state });
                }
            }
            Inbound::TestProgress(progress) => {
                if self.coordinator.handle_progress(
                    &progress.run_id,
                    &progress.platform,
                    progress.step.as_deref(),
                    progress.percent,
                    now,
                ) {
                    let fraction = self
                        .coordinator
                        .active_run()
                        .map(|r| r.progress_fraction())
                        .unwrap_or(0.0);
                    self.notify(StateChange::RunProgress {
                        run_id: progress.run_id,
                        platform: progress.platform,
                        fraction,
                    });
                }
            }
            Inbound::TestResult(result) => {
                // Membership gates recording: only runs we started and
                // platforms in their fixed target set may reach the
                // aggregator, or a stray result would skew summaries.
                match self.coordinator.run(&result.run_id) {
                    None => {
                        warn!(run_id = %result.run_id, "result for unknown run dropped");
                        return;
                    }
                    Some(run) if !run.platforms.contains_key(&result.platform) => {
                        warn!(
                            run_id = %result.run_id,
                            platform = %result.platform,
                            "result from platform outside the target set dropped"
                        );
                        return;
                    }
                    Some(_) => {}
                }
                let record = PlatformResult {
                    success: result.success,
                    metrics: result.metrics,
                    error: result.error.clone(),
                    completed_at: now,
                };
                self.aggregator
                    .record(&result.run_id, &result.platform, record);
                if !result.success {
                    let detail = result.error.as_deref().unwrap_or("unspecified failure");
                    self.log.push(
                        LogLevel::Warning,
                        format!("{} failed on {}: {detail}", result.run_id, result.platform),
                    );
                }
                if let Some(state) =
                    self.coordinator
                        .handle_result(&result.run_id, &result.platform, result.success, now)
                {
                    self.notify(StateChange::Run {
                        run_id: result.run_id,
                        state,
                    });
                }
            }
            Inbound::TestStopped(stopped) => {
                self.coordinator.handle_stopped(&stopped.run_id);
            }
        }
    }

    fn check_watchdog(&mut self) {
        let Some(report) = self.coordinator.check_watchdog(Utc::now()) else {
            return;
        };
        for (platform, result) in report.expired {
            self.log.push(
                LogLevel::Error,
                format!("{platform} timed out during {}", report.run_id),
            );
            self.aggregator.record(&report.run_id, &platform, result);
        }
        if let Some(state) = report.new_state {
            self.notify(StateChange::Run {
                run_id: report.run_id,
                state,
            });
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::ConnectPlatform { key, reply } => {
                let result = self.registry.connect(&key).await;
                if let Err(e) = &result {
                    self.log.push(LogLevel::Error, e.to_string());
                }
                if let Some(p) = self.registry.platform(&key) {
                    self.notify(StateChange::Platform {
                        key: key.clone(),
                        state: p.state,
                    });
                }
                let _ = reply.send(result);
            }
            Command::DisconnectPlatform { key, reply } => {
                let result = self.registry.disconnect(&key).await;
                if let Err(e) = &result {
                    self.log.push(LogLevel::Error, e.to_string());
                }
                if let Some(p) = self.registry.platform(&key) {
                    self.notify(StateChange::Platform {
                        key: key.clone(),
                        state: p.state,
                    });
                }
                let _ = reply.send(result);
            }
            Command::DisconnectAll { reply } => {
                let failures = self.registry.disconnect_all().await;
                for (key, e) in &failures {
                    self.log
                        .push(LogLevel::Error, format!("disconnect {key}: {e}"));
                }
                let _ = reply.send(failures);
            }
            Command::StartRun {
                case_key,
                platforms,
                reply,
            } => {
                let result = self.start_run(&case_key, &platforms);
                if let Err(e) = &result {
                    self.log.push(LogLevel::Error, e.to_string());
                }
                let _ = reply.send(result);
            }
            Command::StopRun { reply } => {
                let result = self.stop_run();
                let _ = reply.send(result);
            }
            Command::Summarize { run_id, reply } => {
                let _ = reply.send(self.aggregator.summarize(&run_id));
            }
            Command::Export { run_id, reply } => {
                let _ = reply.send(self.aggregator.export(&run_id));
            }
            Command::Platforms { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::QueryRun { run_id, reply } => {
                let run = match run_id {
                    Some(id) => self.coordinator.run(&id).cloned(),
                    None => self.coordinator.active_run().cloned(),
                };
                let _ = reply.send(run);
            }
            Command::RecentLogs { reply } => {
                let _ = reply.send(self.log.snapshot());
            }
        }
    }

    fn start_run(
        &mut self,
        case_key: &str,
        platforms: &[String],
    ) -> Result<RunId, crate::coordinator::RunError> {
        let (run_id, messages) =
            self.coordinator
                .start_run(case_key, platforms, &self.registry, Utc::now())?;
        self.notify(StateChange::Run {
            run_id: run_id.clone(),
            state: RunState::Running,
        });

        for msg in messages {
            if let Err(e) = self.supervisor.send(msg) {
                // The fan-out itself was rejected: a run-level fault.
                error!(run_id = %run_id, error = %e, "fan-out rejected");
                self.log
                    .push(LogLevel::Error, format!("fan-out for {run_id} rejected: {e}"));
                self.coordinator.fail_run("channel rejected fan-out");
                self.notify(StateChange::Run {
                    run_id: run_id.clone(),
                    state: RunState::Failed,
                });
                return Err(e.into());
            }
        }
        self.log
            .push(LogLevel::Info, format!("run {run_id} fanned out to {} platforms", platforms.len()));
        Ok(run_id)
    }

    fn stop_run(&mut self) -> Result<RunId, crate::coordinator::RunError> {
        let (run_id, msg) = self.coordinator.stop_run(Utc::now())?;
        // Cancellation is advisory; a send failure is logged, not fatal.
        if let Err(e) = self.supervisor.send(msg) {
            warn!(run_id = %run_id, error = %e, "stop broadcast not delivered");
            self.log.push(
                LogLevel::Warning,
                format!("stop for {run_id} not delivered: {e}"),
            );
        }
        self.notify(StateChange::Run {
            run_id: run_id.clone(),
            state: RunState::Stopped,
        });
        self.log.push(LogLevel::Info, format!("run {run_id} stopped"));
        Ok(run_id)
    }
}
