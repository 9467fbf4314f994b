//! Per-run usage/cost accumulator with budget enforcement

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::pricing::{PricingProvider, round_usd, tokens_to_usd};
use crate::error::RunError;
use crate::events::{
    BudgetExceeded, BudgetMetric, EventKind, RequestDelta, RequestFinished, RequestStarted, Stopped, UsagePayload,
};
use crate::run::RunHandle;

/// Stop reason recorded when a budget ceiling trips
pub const BUDGET_EXCEEDED: &str = "budget-exceeded";

/// Hard ceilings for one run; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RunBudget {
    pub max_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
}

impl RunBudget {
    pub fn is_unlimited(&self) -> bool {
        self.max_tokens.is_none() && self.max_cost_usd.is_none()
    }

    pub fn validate(&self) -> Result<(), RunError> {
        if let Some(cost) = self.max_cost_usd
            && (!cost.is_finite() || cost < 0.0)
        {
            return Err(RunError::Validation(format!(
                "budget max-cost-usd must be a non-negative number, got {}",
                cost
            )));
        }
        Ok(())
    }
}

/// Running aggregate for one model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTotals {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryStatus {
    #[default]
    Running,
    Stopped,
}

/// Read-only view of accumulated usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_requests: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    /// Rounded to 6 decimal places
    pub cost_usd: f64,
    pub per_model: BTreeMap<String, ModelTotals>,
    pub status: TelemetryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<RunBudget>,
}

impl TelemetrySnapshot {
    /// Usage payload as carried by `run/usage`
    pub fn usage(&self) -> UsagePayload {
        UsagePayload {
            requests: self.total_requests,
            prompt_tokens: self.total_prompt_tokens,
            completion_tokens: self.total_completion_tokens,
            total_tokens: self.total_tokens,
            cost_usd: Some(self.cost_usd),
        }
    }
}

struct RequestState {
    model: String,
    streamed_completion_tokens: u64,
    started_at: Instant,
}

struct State {
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    total_requests: u64,
    total_prompt_tokens: u64,
    total_completion_tokens: u64,
    cost_usd: f64,
    per_model: BTreeMap<String, ModelTotals>,
    requests: HashMap<String, RequestState>,
    status: TelemetryStatus,
    stop_reason: Option<String>,
}

impl State {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            updated_at: now,
            total_requests: 0,
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            cost_usd: 0.0,
            per_model: BTreeMap::new(),
            requests: HashMap::new(),
            status: TelemetryStatus::Running,
            stop_reason: None,
        }
    }

    fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens + self.total_completion_tokens
    }

    fn usage(&self) -> UsagePayload {
        UsagePayload {
            requests: self.total_requests,
            prompt_tokens: self.total_prompt_tokens,
            completion_tokens: self.total_completion_tokens,
            total_tokens: self.total_tokens(),
            cost_usd: Some(round_usd(self.cost_usd)),
        }
    }

    /// Trip the budget if a ceiling is exceeded; returns the event to publish
    fn check_budget(&mut self, budget: Option<&RunBudget>) -> Option<BudgetExceeded> {
        let budget = budget?;
        if self.status == TelemetryStatus::Stopped {
            return None;
        }

        let total_tokens = self.total_tokens();
        let tripped = match (budget.max_tokens, budget.max_cost_usd) {
            (Some(max), _) if total_tokens > max => Some((BudgetMetric::Tokens, total_tokens as f64, max as f64)),
            (_, Some(max)) if self.cost_usd > max => Some((BudgetMetric::Cost, self.cost_usd, max)),
            _ => None,
        }?;

        self.status = TelemetryStatus::Stopped;
        self.stop_reason = Some(BUDGET_EXCEEDED.to_string());
        let (metric, value, limit) = tripped;
        Some(BudgetExceeded {
            metric,
            value,
            limit,
            usage: self.usage(),
        })
    }
}

/// Usage and cost accounting for one run
///
/// Driven by direct calls from the provider adapter; publishes `llm/request-*`,
/// `run/usage` and, once, `run/budget-exceeded` + `run/stopped` on the run's bus.
pub struct Telemetry {
    run: RunHandle,
    pricing: Arc<dyn PricingProvider>,
    budget: Option<RunBudget>,
    state: Mutex<State>,
}

impl Telemetry {
    pub fn new(run: RunHandle, pricing: Arc<dyn PricingProvider>, budget: Option<RunBudget>) -> Self {
        debug!(run_id = %run.id(), ?budget, "Telemetry::new");
        Self {
            run,
            pricing,
            budget: budget.filter(|b| !b.is_unlimited()),
            state: Mutex::new(State::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn run(&self) -> &RunHandle {
        &self.run
    }

    pub fn budget(&self) -> Option<&RunBudget> {
        self.budget.as_ref()
    }

    pub fn status(&self) -> TelemetryStatus {
        self.lock().status
    }

    pub fn is_stopped(&self) -> bool {
        self.status() == TelemetryStatus::Stopped
    }

    /// Number of requests started but not yet finished
    pub fn in_flight(&self) -> usize {
        self.lock().requests.len()
    }

    /// Register a new in-flight request
    pub fn request_started(&self, request_id: &str, model: &str) {
        debug!(run_id = %self.run.id(), %request_id, %model, "Telemetry::request_started");
        {
            let mut state = self.lock();
            state.requests.insert(
                request_id.to_string(),
                RequestState {
                    model: model.to_string(),
                    streamed_completion_tokens: 0,
                    started_at: Instant::now(),
                },
            );
            state.updated_at = Utc::now();
        }
        self.run.emit(EventKind::RequestStarted(RequestStarted {
            request_id: request_id.to_string(),
            model: model.to_string(),
        }));
    }

    /// Account streamed output tokens as they arrive
    ///
    /// Ignored for unknown requests and non-positive deltas. Unpriced models
    /// accrue tokens but no cost.
    pub fn stream_delta(&self, request_id: &str, delta_tokens_out: u64) {
        if delta_tokens_out == 0 {
            return;
        }

        let (model, usage, tripped) = {
            let mut state = self.lock();
            let Some(req) = state.requests.get_mut(request_id) else {
                debug!(run_id = %self.run.id(), %request_id, "Telemetry::stream_delta: unknown request, ignoring");
                return;
            };
            req.streamed_completion_tokens += delta_tokens_out;
            let model = req.model.clone();

            let cost = self
                .pricing
                .pricing(&model)
                .map(|p| tokens_to_usd(delta_tokens_out, p.output_per_1k));

            state.total_completion_tokens += delta_tokens_out;
            let totals = state.per_model.entry(model.clone()).or_default();
            totals.completion_tokens += delta_tokens_out;
            if let Some(cost) = cost {
                totals.cost_usd += cost;
                state.cost_usd += cost;
            }
            state.updated_at = Utc::now();

            let tripped = state.check_budget(self.budget.as_ref());
            (model, state.usage(), tripped)
        };

        debug!(run_id = %self.run.id(), %request_id, delta_tokens_out, "Telemetry::stream_delta");
        self.run.emit(EventKind::RequestDelta(RequestDelta {
            request_id: request_id.to_string(),
            model,
            delta_tokens_out,
        }));
        self.publish(usage, tripped);
    }

    /// Reconcile final usage for a request
    ///
    /// Only completion tokens beyond what was already streamed are billed; prompt
    /// tokens are always billed here in full.
    pub fn request_finished(&self, request_id: &str, model: &str, prompt_tokens: u64, completion_tokens: u64) {
        let (usage, tripped, elapsed_ms) = {
            let mut state = self.lock();
            let (streamed, elapsed_ms) = match state.requests.remove(request_id) {
                Some(req) => (req.streamed_completion_tokens, req.started_at.elapsed().as_millis() as u64),
                None => {
                    debug!(run_id = %self.run.id(), %request_id, "Telemetry::request_finished: not started, billing in full");
                    (0, 0)
                }
            };
            let additional_out = completion_tokens.saturating_sub(streamed);

            state.total_requests += 1;
            state.total_prompt_tokens += prompt_tokens;
            state.total_completion_tokens += additional_out;

            let cost = self.pricing.pricing(model).map(|p| {
                tokens_to_usd(prompt_tokens, p.input_per_1k) + tokens_to_usd(additional_out, p.output_per_1k)
            });

            let totals = state.per_model.entry(model.to_string()).or_default();
            totals.requests += 1;
            totals.prompt_tokens += prompt_tokens;
            totals.completion_tokens += additional_out;
            if let Some(cost) = cost {
                totals.cost_usd += cost;
                state.cost_usd += cost;
            }
            state.updated_at = Utc::now();

            let tripped = state.check_budget(self.budget.as_ref());
            (state.usage(), tripped, elapsed_ms)
        };

        debug!(
            run_id = %self.run.id(),
            %request_id,
            %model,
            prompt_tokens,
            completion_tokens,
            elapsed_ms,
            "Telemetry::request_finished"
        );
        self.run.emit(EventKind::RequestFinished(RequestFinished {
            request_id: request_id.to_string(),
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
        }));
        self.publish(usage, tripped);
    }

    fn publish(&self, usage: UsagePayload, tripped: Option<BudgetExceeded>) {
        self.run.emit(EventKind::Usage(usage));

        if let Some(exceeded) = tripped {
            warn!(
                run_id = %self.run.id(),
                metric = ?exceeded.metric,
                value = exceeded.value,
                limit = exceeded.limit,
                "Telemetry: budget exceeded, stopping run"
            );
            self.run.emit(EventKind::BudgetExceeded(exceeded));
            self.run.cancel(Some(BUDGET_EXCEEDED));
            self.run.emit(EventKind::Stopped(Stopped {
                reason: BUDGET_EXCEEDED.to_string(),
            }));
            info!(run_id = %self.run.id(), "Telemetry: run stopped");
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let state = self.lock();
        TelemetrySnapshot {
            started_at: state.started_at,
            updated_at: state.updated_at,
            total_requests: state.total_requests,
            total_prompt_tokens: state.total_prompt_tokens,
            total_completion_tokens: state.total_completion_tokens,
            total_tokens: state.total_tokens(),
            cost_usd: round_usd(state.cost_usd),
            per_model: state.per_model.clone(),
            status: state.status,
            stop_reason: state.stop_reason.clone(),
            budget: self.budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventType, RunEvent, RunId, SimpleEventBus};
    use crate::telemetry::PricingTable;

    fn setup(budget: Option<RunBudget>) -> (Telemetry, Arc<Mutex<Vec<RunEvent>>>) {
        let bus: Arc<dyn EventBus> = Arc::new(SimpleEventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.on(Arc::new(move |e: &RunEvent| sink.lock().unwrap().push(e.clone())));
        let run = RunHandle::with_id(RunId::from("run-tel"), bus);
        let telemetry = Telemetry::new(run, Arc::new(PricingTable::builtin()), budget);
        (telemetry, seen)
    }

    fn count(seen: &Arc<Mutex<Vec<RunEvent>>>, event_type: EventType) -> usize {
        seen.lock().unwrap().iter().filter(|e| e.event_type() == event_type).count()
    }

    #[test]
    fn test_cost_on_finish() {
        let (telemetry, _seen) = setup(None);
        telemetry.request_started("req1", "gpt-4o");
        telemetry.request_finished("req1", "gpt-4o", 1000, 500);

        let snap = telemetry.snapshot();
        assert_eq!(snap.total_prompt_tokens, 1000);
        assert_eq!(snap.total_completion_tokens, 500);
        assert_eq!(snap.total_tokens, 1500);
        assert_eq!(snap.total_requests, 1);
        // 1000 in @ 0.005 + 500 out @ 0.015
        assert!((snap.cost_usd - 0.0125).abs() < 1e-9);
        assert_eq!(snap.per_model["gpt-4o"].requests, 1);
        assert_eq!(telemetry.in_flight(), 0);
    }

    #[test]
    fn test_stream_then_finish_reconciles() {
        let (telemetry, _seen) = setup(None);
        telemetry.request_started("req", "gpt-4o");
        telemetry.stream_delta("req", 100);
        telemetry.request_finished("req", "gpt-4o", 0, 150);

        let snap = telemetry.snapshot();
        assert_eq!(snap.total_completion_tokens, 150);
        assert!((snap.cost_usd - (0.0015 + 0.00075)).abs() < 1e-9);
        assert_eq!(snap.per_model["gpt-4o"].completion_tokens, 150);
    }

    #[test]
    fn test_finish_below_streamed_bills_nothing_extra() {
        let (telemetry, _seen) = setup(None);
        telemetry.request_started("req", "gpt-4o");
        telemetry.stream_delta("req", 200);
        telemetry.request_finished("req", "gpt-4o", 0, 150);

        assert_eq!(telemetry.snapshot().total_completion_tokens, 200);
    }

    #[test]
    fn test_delta_ignored_for_unknown_or_zero() {
        let (telemetry, seen) = setup(None);
        telemetry.stream_delta("missing", 50);
        telemetry.request_started("req", "gpt-4o");
        telemetry.stream_delta("req", 0);

        assert_eq!(telemetry.snapshot().total_completion_tokens, 0);
        assert_eq!(count(&seen, EventType::RequestDelta), 0);
        assert_eq!(count(&seen, EventType::Usage), 0);
    }

    #[test]
    fn test_unpriced_model_accrues_tokens_only() {
        let (telemetry, _seen) = setup(None);
        telemetry.request_started("req", "mystery-model");
        telemetry.stream_delta("req", 40);
        telemetry.request_finished("req", "mystery-model", 100, 40);

        let snap = telemetry.snapshot();
        assert_eq!(snap.total_tokens, 140);
        assert_eq!(snap.cost_usd, 0.0);
    }

    #[test]
    fn test_finish_without_start_bills_in_full() {
        let (telemetry, _seen) = setup(None);
        telemetry.request_finished("late", "gpt-4o-mini", 1000, 1000);

        let snap = telemetry.snapshot();
        assert_eq!(snap.total_completion_tokens, 1000);
        assert!((snap.cost_usd - (0.00015 + 0.0006)).abs() < 1e-9);
    }

    #[test]
    fn test_events_emitted_per_call() {
        let (telemetry, seen) = setup(None);
        telemetry.request_started("req", "gpt-4o");
        telemetry.stream_delta("req", 10);
        telemetry.request_finished("req", "gpt-4o", 5, 10);

        let types: Vec<EventType> = seen.lock().unwrap().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                EventType::RequestStarted,
                EventType::RequestDelta,
                EventType::Usage,
                EventType::RequestFinished,
                EventType::Usage,
            ]
        );
    }

    #[test]
    fn test_cost_budget_scenario() {
        let budget = RunBudget {
            max_cost_usd: Some(0.001),
            ..Default::default()
        };
        let (telemetry, seen) = setup(Some(budget));
        telemetry.request_started("req-budget", "gpt-4o");

        telemetry.stream_delta("req-budget", 60);
        assert_eq!(telemetry.status(), TelemetryStatus::Running);
        assert!(!telemetry.run().is_cancelled());

        telemetry.stream_delta("req-budget", 10);

        assert_eq!(count(&seen, EventType::BudgetExceeded), 1);
        let seen_events = seen.lock().unwrap().clone();
        let exceeded = seen_events
            .iter()
            .find_map(|e| match e.kind() {
                EventKind::BudgetExceeded(b) => Some(b.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(exceeded.metric, BudgetMetric::Cost);
        assert!((exceeded.value - 0.00105).abs() < 1e-9);
        assert_eq!(exceeded.limit, 0.001);

        assert!(telemetry.run().is_cancelled());
        let snap = telemetry.snapshot();
        assert_eq!(snap.status, TelemetryStatus::Stopped);
        assert_eq!(snap.stop_reason.as_deref(), Some(BUDGET_EXCEEDED));

        let types: Vec<EventType> = seen_events.iter().map(|e| e.event_type()).collect();
        let tail = &types[types.len() - 3..];
        assert_eq!(tail, &[EventType::BudgetExceeded, EventType::Cancelled, EventType::Stopped]);
    }

    #[test]
    fn test_token_budget() {
        let budget = RunBudget {
            max_tokens: Some(100),
            ..Default::default()
        };
        let (telemetry, seen) = setup(Some(budget));
        telemetry.request_started("req", "mystery-model");
        telemetry.request_finished("req", "mystery-model", 80, 21);

        assert!(telemetry.is_stopped());
        assert_eq!(count(&seen, EventType::BudgetExceeded), 1);
        let seen = seen.lock().unwrap();
        match seen.iter().find(|e| e.event_type() == EventType::BudgetExceeded).unwrap().kind() {
            EventKind::BudgetExceeded(b) => {
                assert_eq!(b.metric, BudgetMetric::Tokens);
                assert_eq!(b.value, 101.0);
                assert_eq!(b.usage.total_tokens, 101);
            }
            other => panic!("Expected budget exceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_budget_monotonic_after_stop() {
        let budget = RunBudget {
            max_tokens: Some(10),
            ..Default::default()
        };
        let (telemetry, seen) = setup(Some(budget));
        telemetry.request_started("a", "gpt-4o");
        telemetry.stream_delta("a", 20);
        assert!(telemetry.is_stopped());

        telemetry.stream_delta("a", 20);
        telemetry.request_finished("a", "gpt-4o", 100, 100);
        telemetry.request_started("b", "gpt-4o");
        telemetry.stream_delta("b", 500);

        assert!(telemetry.is_stopped());
        assert_eq!(count(&seen, EventType::BudgetExceeded), 1);
        assert_eq!(count(&seen, EventType::Stopped), 1);
        assert_eq!(count(&seen, EventType::Cancelled), 1);
    }

    #[test]
    fn test_exact_limit_does_not_trip() {
        let budget = RunBudget {
            max_tokens: Some(100),
            ..Default::default()
        };
        let (telemetry, _seen) = setup(Some(budget));
        telemetry.request_finished("req", "gpt-4o", 50, 50);
        assert!(!telemetry.is_stopped());
    }

    #[test]
    fn test_unlimited_budget_is_dropped() {
        let (telemetry, _seen) = setup(Some(RunBudget::default()));
        assert!(telemetry.budget().is_none());
        assert!(telemetry.snapshot().budget.is_none());
    }

    #[test]
    fn test_budget_validation() {
        assert!(RunBudget::default().validate().is_ok());
        let bad = RunBudget {
            max_cost_usd: Some(-1.0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let nan = RunBudget {
            max_cost_usd: Some(f64::NAN),
            ..Default::default()
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let (telemetry, _seen) = setup(None);
        telemetry.request_finished("r", "gpt-4o", 10, 10);
        let json = serde_json::to_value(telemetry.snapshot()).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["totalTokens"], 20);
        assert!(json["perModel"]["gpt-4o"]["costUsd"].is_number());
        assert!(json.get("stopReason").is_none());
    }
}
