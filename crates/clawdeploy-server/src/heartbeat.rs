//! Periodic self-healing driven by the external decision agent.
//!
//! Each cycle runs the agent under three breakers (turn count, wall-clock
//! timeout, per-cycle spend) and feeds its validated report into the
//! per-instance restart failure counters. A daily spend ceiling skips whole
//! cycles until the local date changes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clawdeploy_agent_report::{AgentEvent, HealthReport, ReportEnvelope, HEARTBEAT_PROMPT};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::agent_clients::decision_agent::{AgentRunRequest, DecisionAgent};

pub const DEFAULT_GIVE_UP_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct CycleLimits {
    pub max_turns: u32,
    pub timeout: Duration,
    pub max_cycle_cost: f64,
    pub warn_percent: f64,
}

impl Default for CycleLimits {
    fn default() -> Self {
        Self {
            max_turns: 10,
            timeout: Duration::from_secs(300),
            max_cycle_cost: 0.05,
            warn_percent: 80.0,
        }
    }
}

/// Spend of all cycles on one local calendar day.
#[derive(Debug, Clone)]
pub struct DailyCostCounter {
    ceiling: f64,
    spent: f64,
    day: NaiveDate,
}

impl DailyCostCounter {
    pub fn new(ceiling: f64, today: NaiveDate) -> Self {
        Self {
            ceiling,
            spent: 0.0,
            day: today,
        }
    }

    /// Resets the counter when `today` differs from the tracked day.
    pub fn roll_to(&mut self, today: NaiveDate) {
        if today != self.day {
            info!(previous_day = %self.day, previous_day_cost = self.spent, "resetting daily cost counter");
            self.spent = 0.0;
            self.day = today;
        }
    }

    pub fn add(&mut self, cost: f64) {
        if cost.is_finite() && cost > 0.0 {
            self.spent += cost;
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.spent >= self.ceiling
    }

    pub fn spent(&self) -> f64 {
        self.spent
    }
}

/// Consecutive failed restarts per instance. Lives for the process lifetime.
#[derive(Debug, Clone)]
pub struct RestartFailureTracker {
    threshold: u32,
    failures: HashMap<String, u32>,
}

impl Default for RestartFailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_GIVE_UP_THRESHOLD)
    }
}

impl RestartFailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            failures: HashMap::new(),
        }
    }

    /// Returns the new consecutive failure count.
    pub fn record_failure(&mut self, instance_id: &str) -> u32 {
        let count = self.failures.entry(instance_id.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        if count >= self.threshold {
            error!(
                instance_id,
                failures = count,
                "instance exceeded max restart failures, giving up"
            );
        } else {
            warn!(instance_id, failures = count, "heartbeat restart failed");
        }
        count
    }

    pub fn record_success(&mut self, instance_id: &str) {
        if self.failures.remove(instance_id).is_some() {
            info!(instance_id, "restart succeeded, clearing failure count");
        }
    }

    pub fn failures(&self, instance_id: &str) -> u32 {
        self.failures.get(instance_id).copied().unwrap_or(0)
    }

    /// Instances at or past the threshold, sorted by id.
    pub fn given_up(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .failures
            .iter()
            .filter(|(_, count)| **count >= self.threshold)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn apply(&mut self, report: &HealthReport) {
        for id in &report.restarted_instances {
            self.record_success(id);
        }
        for id in &report.failed_restarts {
            self.record_failure(id);
        }
    }
}

/// Spend of a single cycle, with a one-time warning before the ceiling.
#[derive(Debug, Clone)]
struct CycleCostMonitor {
    max_cost: f64,
    warn_at: f64,
    spent: f64,
    warned: bool,
}

impl CycleCostMonitor {
    fn new(limits: &CycleLimits) -> Self {
        Self {
            max_cost: limits.max_cycle_cost,
            warn_at: limits.max_cycle_cost * limits.warn_percent / 100.0,
            spent: 0.0,
            warned: false,
        }
    }

    /// Returns `true` once the ceiling is reached.
    fn add(&mut self, cost: f64) -> bool {
        self.spent += cost;
        if !self.warned && self.spent >= self.warn_at {
            self.warned = true;
            warn!(cost = self.spent, max = self.max_cost, "cycle cost approaching limit");
        }
        self.spent >= self.max_cost
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ToolStats {
    invocations: u32,
    errors: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    TurnLimit { turns: u32 },
    BudgetExceeded { cost: f64 },
    Timeout,
    Agent(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The daily ceiling was reached; the agent was not invoked.
    Skipped,
    Completed {
        report: Option<HealthReport>,
        turns: u32,
        cost: f64,
    },
    Aborted {
        reason: AbortReason,
        turns: u32,
        cost: f64,
    },
}

struct CycleState {
    monitor: CycleCostMonitor,
    turns: u32,
    report: Option<HealthReport>,
    tools: BTreeMap<String, ToolStats>,
}

pub struct HeartbeatSupervisor {
    agent: Arc<dyn DecisionAgent>,
    limits: CycleLimits,
    interval: Duration,
    daily: DailyCostCounter,
    tracker: RestartFailureTracker,
}

impl HeartbeatSupervisor {
    pub fn new(
        agent: Arc<dyn DecisionAgent>,
        limits: CycleLimits,
        interval: Duration,
        daily: DailyCostCounter,
        tracker: RestartFailureTracker,
    ) -> Self {
        Self {
            agent,
            limits,
            interval,
            daily,
            tracker,
        }
    }

    pub fn tracker(&self) -> &RestartFailureTracker {
        &self.tracker
    }

    pub fn daily(&self) -> &DailyCostCounter {
        &self.daily
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "heartbeat loop starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let today = chrono::Local::now().date_naive();
            self.tick_on(today).await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("heartbeat loop stopped");
    }

    /// Runs one cycle as of the given local date.
    pub async fn tick_on(&mut self, today: NaiveDate) -> CycleOutcome {
        self.daily.roll_to(today);
        if self.daily.is_exhausted() {
            warn!(
                daily_cost = self.daily.spent(),
                limit = self.daily.ceiling,
                "daily cost limit reached, skipping heartbeat"
            );
            return CycleOutcome::Skipped;
        }

        debug!("starting heartbeat cycle");
        let outcome = self.run_cycle().await;

        match &outcome {
            CycleOutcome::Completed {
                report,
                turns,
                cost,
            } => {
                self.daily.add(*cost);
                info!(
                    turns,
                    cost,
                    daily_cost = self.daily.spent(),
                    reported = report.is_some(),
                    "heartbeat cycle completed"
                );
                if let Some(report) = report {
                    self.tracker.apply(report);
                }
            }
            CycleOutcome::Aborted {
                reason,
                turns,
                cost,
            } => {
                self.daily.add(*cost);
                warn!(
                    ?reason,
                    turns,
                    cost,
                    daily_cost = self.daily.spent(),
                    "heartbeat cycle aborted"
                );
            }
            CycleOutcome::Skipped => {}
        }
        outcome
    }

    async fn run_cycle(&self) -> CycleOutcome {
        let mut state = CycleState {
            monitor: CycleCostMonitor::new(&self.limits),
            turns: 0,
            report: None,
            tools: BTreeMap::new(),
        };

        let driven = tokio::time::timeout(self.limits.timeout, self.drive(&mut state)).await;
        let cost = state.monitor.spent;
        let turns = state.turns;
        if !state.tools.is_empty() {
            debug!(tools = ?state.tools, "heartbeat tool usage");
        }

        match driven {
            Ok(Ok(())) => CycleOutcome::Completed {
                report: state.report,
                turns,
                cost,
            },
            Ok(Err(reason)) => CycleOutcome::Aborted {
                reason,
                turns,
                cost,
            },
            Err(_) => CycleOutcome::Aborted {
                reason: AbortReason::Timeout,
                turns,
                cost,
            },
        }
    }

    async fn drive(&self, state: &mut CycleState) -> Result<(), AbortReason> {
        let request = AgentRunRequest::new(HEARTBEAT_PROMPT, self.limits.max_turns);
        let mut events = self
            .agent
            .start_run(&request)
            .await
            .map_err(|e| AbortReason::Agent(format!("{e:#}")))?;

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "skipping undecodable agent event");
                    continue;
                }
            };

            if let Some(cost) = event.assistant_cost() {
                if state.monitor.add(cost) {
                    return Err(AbortReason::BudgetExceeded {
                        cost: state.monitor.spent,
                    });
                }
            }

            match &event {
                AgentEvent::TurnStart => {
                    state.turns += 1;
                    if state.turns > self.limits.max_turns {
                        return Err(AbortReason::TurnLimit { turns: state.turns });
                    }
                }
                AgentEvent::ToolExecutionStart { tool_name, .. } => {
                    state
                        .tools
                        .entry(tool_name.clone())
                        .or_default()
                        .invocations += 1;
                }
                AgentEvent::ToolExecutionEnd {
                    tool_name,
                    is_error,
                    ..
                } => {
                    if *is_error {
                        state.tools.entry(tool_name.clone()).or_default().errors += 1;
                    }
                    if let Some(payload) = event.report_payload() {
                        match ReportEnvelope::from_tool_result(payload) {
                            Ok(envelope) => state.report = Some(envelope.data),
                            Err(e) => warn!(error = %e, "ignoring invalid heartbeat report"),
                        }
                    }
                }
                AgentEvent::AutoRetryStart { error_message } => {
                    warn!(error = ?error_message, "agent retrying after error");
                }
                AgentEvent::AgentEnd => break,
                AgentEvent::AgentStart | AgentEvent::TurnEnd | AgentEvent::MessageEnd { .. } => {}
            }
        }
        Ok(())
    }
}
