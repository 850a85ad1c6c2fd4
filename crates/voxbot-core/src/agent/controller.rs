//! Per-agent controller: the tick loop, retry policy, loop guard,
//! speculative planning and the reconnect pipeline. Each controller owns
//! its task state exclusively; everything shared lives behind the injected
//! service handles.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::adapter::{AgentAdapter, Position};
use crate::agent::guard::FeasibilityGuard;
use crate::agent::history::{HistoryBuffer, HistoryEntry};
use crate::agent::planner::{PlanOutcome, PlanRequest, PlanStatus, PlannerService};
use crate::agent::reflex::{spawn_reflex, ReflexHandle};
use crate::agent::skills::SkillEngine;
use crate::agent::snapshot::{Snapshot, SnapshotBuilder, TaskContext};
use crate::agent::subgoal::{
    FailureCode, RuntimeSubgoal, SkillResult, Subgoal, Trigger, SUBGOAL_NAMES,
};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::coord::SkillLimiter;
use crate::metrics::MetricsRegistry;
use crate::store::{AttemptRow, IncidentRow, LlmCallRow, Store};
use crate::util::now_ms;

const IDLE_PROBE_PERIOD: Duration = Duration::from_millis(700);
const IDLE_PROGRESS_POSITION_EPSILON: f64 = 0.15;
const STUCK_MIN_ELAPSED: Duration = Duration::from_secs(5);
const STUCK_HANDLING_GAP: Duration = Duration::from_secs(2);
const PREFETCH_MIN_ELAPSED: Duration = Duration::from_millis(1_200);
const FAST_RECOVERY_BASE_DELAY: Duration = Duration::from_millis(700);
const RECONNECT_STREAK_PENALTY_MS: u64 = 1_000;
const RECONNECT_STREAK_PENALTY_CAP_MS: u64 = 30_000;

/// Controller states visible through `state_view`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Disconnected,
    ConnectedIdle,
    Planning,
    Executing,
    AwaitingRetry,
}

/// Retryability by failure code: dependency and death failures go back to
/// the planner instead of the retry queue.
pub fn can_retry_failure(code: FailureCode) -> bool {
    matches!(
        code,
        FailureCode::ResourceNotFound
            | FailureCode::PathfindFailed
            | FailureCode::InterruptedByHostiles
            | FailureCode::StuckTimeout
            | FailureCode::InventoryFull
            | FailureCode::CombatLostTarget
            | FailureCode::PlacementFailed
    )
}

/// Per-code retry budget on top of the configured base.
pub fn retry_limit_bonus(code: FailureCode) -> u32 {
    match code {
        FailureCode::PathfindFailed | FailureCode::ResourceNotFound => 4,
        FailureCode::InterruptedByHostiles | FailureCode::CombatLostTarget => 3,
        FailureCode::StuckTimeout | FailureCode::PlacementFailed => 2,
        _ => 0,
    }
}

#[derive(Debug)]
struct ActiveExecution {
    subgoal: RuntimeSubgoal,
    epoch: u64,
    started_at: Instant,
    started_at_ms: u64,
    start_items: BTreeMap<String, u32>,
    start_health: f64,
    last_probe_at: Instant,
    last_progress_at: Instant,
    last_position: Option<Position>,
    last_inventory_total: u32,
    last_stuck_handled: Option<Instant>,
}

#[derive(Debug)]
struct ExecDone {
    epoch: u64,
    result: SkillResult,
}

struct PrefetchDone {
    for_subgoal_id: u64,
    outcome: PlanOutcome,
    duration_ms: u64,
}

struct SpeculativePlan {
    prepared_at: Instant,
    for_subgoal_id: u64,
    next_goal: String,
    subgoals: Vec<Subgoal>,
    planner_status: PlanStatus,
}

pub struct ControllerContext {
    pub bot_id: String,
    pub adapter: Arc<dyn AgentAdapter>,
    pub catalog: Arc<Catalog>,
    pub planner: Arc<PlannerService>,
    pub engine: Arc<SkillEngine>,
    pub skill_limiter: Arc<Mutex<SkillLimiter>>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<MetricsRegistry>,
    pub config: Arc<Config>,
}

pub struct AgentController {
    bot_id: String,
    adapter: Arc<dyn AgentAdapter>,
    planner: Arc<PlannerService>,
    engine: Arc<SkillEngine>,
    skill_limiter: Arc<Mutex<SkillLimiter>>,
    store: Arc<dyn Store>,
    metrics: Arc<MetricsRegistry>,
    cfg: Arc<Config>,
    guard: FeasibilityGuard,
    snapshots: SnapshotBuilder,

    // Task state.
    current_goal: Option<String>,
    queue: VecDeque<RuntimeSubgoal>,
    progress_counters: BTreeMap<String, u64>,
    last_error: Option<String>,
    history: HistoryBuffer,
    pending_triggers: BTreeSet<Trigger>,
    planner_cooldown_until: Option<Instant>,

    busy: Arc<AtomicBool>,
    active: Option<ActiveExecution>,
    holding_skill_slot: bool,
    exec_epoch: u64,
    exec_task: Option<JoinHandle<()>>,
    exec_tx: mpsc::UnboundedSender<ExecDone>,
    exec_rx: mpsc::UnboundedReceiver<ExecDone>,

    // Speculative planning.
    speculative: Option<SpeculativePlan>,
    prefetch_task: Option<JoinHandle<()>>,
    last_prefetch_at: Option<Instant>,
    prefetch_tx: mpsc::UnboundedSender<PrefetchDone>,
    prefetch_rx: mpsc::UnboundedReceiver<PrefetchDone>,

    // Failure streaks for the loop guard, keyed `name:code`.
    streaks: BTreeMap<String, (u32, u64)>,

    // Connection lifecycle. The atomic mirrors feed the fleet gauges.
    connected: bool,
    connected_flag: Arc<AtomicBool>,
    queue_depth_flag: Arc<AtomicU64>,
    reconnect_due: Option<Instant>,
    reconnect_streak: u32,
    reflex: Option<ReflexHandle>,
    triggers_tx: mpsc::UnboundedSender<Trigger>,
    triggers_rx: mpsc::UnboundedReceiver<Trigger>,
    reflex_cancel: CancellationToken,

    last_activity: Instant,
    next_subgoal_id: u64,
    in_tick: AtomicBool,
    planner_inflight: bool,
    /// When set, an empty idle queue refills from the local progression
    /// planner even without triggers.
    pub always_active_plan: bool,
}

impl AgentController {
    pub fn new(ctx: ControllerContext) -> Self {
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let (prefetch_tx, prefetch_rx) = mpsc::unbounded_channel();
        let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();
        let snapshots = SnapshotBuilder::new(
            Arc::clone(&ctx.adapter),
            Arc::clone(&ctx.catalog),
            ctx.bot_id.clone(),
            ctx.config.loop_cfg.snapshot_refresh_ms,
            ctx.config.loop_cfg.snapshot_nearby_cache_ms,
        );
        let guard = FeasibilityGuard::new(Arc::clone(&ctx.catalog));
        let mut pending = BTreeSet::new();
        pending.insert(Trigger::Idle);

        Self {
            bot_id: ctx.bot_id,
            adapter: ctx.adapter,
            planner: ctx.planner,
            engine: ctx.engine,
            skill_limiter: ctx.skill_limiter,
            store: ctx.store,
            metrics: ctx.metrics,
            cfg: ctx.config,
            guard,
            snapshots,
            current_goal: None,
            queue: VecDeque::new(),
            progress_counters: BTreeMap::new(),
            last_error: None,
            history: HistoryBuffer::default(),
            pending_triggers: pending,
            planner_cooldown_until: None,
            busy: Arc::new(AtomicBool::new(false)),
            active: None,
            holding_skill_slot: false,
            exec_epoch: 0,
            exec_task: None,
            exec_tx,
            exec_rx,
            speculative: None,
            prefetch_task: None,
            last_prefetch_at: None,
            prefetch_tx,
            prefetch_rx,
            streaks: BTreeMap::new(),
            connected: false,
            connected_flag: Arc::new(AtomicBool::new(false)),
            queue_depth_flag: Arc::new(AtomicU64::new(0)),
            reconnect_due: None,
            reconnect_streak: 0,
            reflex: None,
            triggers_tx,
            triggers_rx,
            reflex_cancel: CancellationToken::new(),
            last_activity: Instant::now(),
            next_subgoal_id: 1,
            in_tick: AtomicBool::new(false),
            planner_inflight: false,
            always_active_plan: false,
        }
    }

    /// Gauge handles for the orchestrator; cheap to clone before `run`.
    pub fn gauges(&self) -> (Arc<AtomicBool>, Arc<AtomicBool>, Arc<AtomicU64>) {
        (
            Arc::clone(&self.connected_flag),
            Arc::clone(&self.busy),
            Arc::clone(&self.queue_depth_flag),
        )
    }

    pub fn state_view(&self) -> ControllerState {
        if !self.connected {
            return ControllerState::Disconnected;
        }
        if self.planner_inflight {
            return ControllerState::Planning;
        }
        if self.busy.load(Ordering::Relaxed) {
            return ControllerState::Executing;
        }
        let now = now_ms();
        if !self.queue.is_empty() && self.queue.iter().all(|sg| !sg.ready(now)) {
            return ControllerState::AwaitingRetry;
        }
        ControllerState::ConnectedIdle
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_head(&self) -> Option<&RuntimeSubgoal> {
        self.queue.front()
    }

    pub fn pending_triggers(&self) -> &BTreeSet<Trigger> {
        &self.pending_triggers
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn progress_counter(&self, name: &str) -> u64 {
        self.progress_counters.get(name).copied().unwrap_or(0)
    }

    pub fn current_goal(&self) -> Option<&str> {
        self.current_goal.as_deref()
    }

    /// Seeds the queue directly; used by embedders and tests.
    pub fn enqueue_subgoals(&mut self, subgoals: Vec<Subgoal>) {
        let now = now_ms();
        for subgoal in subgoals {
            let id = self.next_subgoal_id;
            self.next_subgoal_id += 1;
            self.queue.push_back(RuntimeSubgoal {
                id,
                subgoal,
                assigned_at_ms: now,
                retry_count: 0,
                not_before_ms: 0,
            });
        }
    }

    pub async fn connect(&mut self) -> anyhow::Result<()> {
        self.adapter.connect().await?;
        self.connected = true;
        self.connected_flag.store(true, Ordering::Relaxed);
        self.reconnect_due = None;
        self.attach_reflex();
        self.snapshots.invalidate();
        self.last_activity = Instant::now();
        tracing::info!(bot = %self.bot_id, "controller.connected");
        Ok(())
    }

    fn attach_reflex(&mut self) {
        self.detach_reflex();
        self.reflex_cancel = CancellationToken::new();
        self.reflex = Some(spawn_reflex(
            self.bot_id.clone(),
            Arc::clone(&self.adapter),
            self.triggers_tx.clone(),
            Arc::clone(&self.busy),
            self.cfg.reflex.clone(),
            self.cfg.base.position(),
            &self.reflex_cancel,
        ));
    }

    fn detach_reflex(&mut self) {
        if let Some(reflex) = self.reflex.take() {
            reflex.detach();
        }
    }

    /// Runs the controller until cancelled, then shuts down cleanly.
    pub async fn run(mut self, cancel: CancellationToken) {
        if self.connect().await.is_err() {
            self.schedule_reconnect("initial_connect_failed", false);
        }
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.cfg.loop_cfg.orch_tick_ms.max(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.detach_reflex();
        if let Some(task) = self.exec_task.take() {
            task.abort();
        }
        if let Some(task) = self.prefetch_task.take() {
            task.abort();
        }
        if self.holding_skill_slot {
            self.skill_limiter
                .lock()
                .expect("skill limiter poisoned")
                .leave(&self.bot_id);
            self.holding_skill_slot = false;
        }
        self.clear_residuals().await;
        self.adapter.quit().await.ok();
        self.connected = false;
        self.connected_flag.store(false, Ordering::Relaxed);
        tracing::info!(bot = %self.bot_id, "controller.stopped");
    }

    /// One pass of the control loop. Reentrancy-guarded: an overlapping
    /// call observes the guard and returns immediately.
    pub async fn tick(&mut self) {
        if self
            .in_tick
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.tick_inner().await;
        self.queue_depth_flag
            .store(self.queue.len() as u64, Ordering::Relaxed);
        self.in_tick.store(false, Ordering::Release);
    }

    async fn tick_inner(&mut self) {
        self.drain_triggers();
        self.drain_prefetch_results();

        if !self.connected {
            self.try_reconnect().await;
            return;
        }

        // 1. Active subgoal wall-clock timeout.
        if let Some(active) = &self.active {
            let timeout = Duration::from_millis(self.cfg.skills.subgoal_exec_timeout_ms);
            if active.started_at.elapsed() >= timeout {
                tracing::warn!(
                    bot = %self.bot_id,
                    subgoal = %active.subgoal.subgoal.name,
                    "controller.subgoal_timeout"
                );
                self.force_disconnect("subgoal_timeout").await;
                return;
            }
        }

        // 2. Idle-stall probe while executing.
        if self.active.is_some() && self.probe_idle_stall().await {
            self.force_disconnect("subgoal_idle_stall").await;
            return;
        }

        // 3. Executing branch: completions, stuck recovery, prefetch.
        if self.active.is_some() {
            if let Ok(done) = self.exec_rx.try_recv() {
                if done.epoch == self.exec_epoch {
                    self.handle_completion(done.result).await;
                }
                return;
            }
            if self.pending_triggers.contains(&Trigger::Stuck) {
                let active = self.active.as_ref().expect("checked above");
                let elapsed_ok = active.started_at.elapsed() >= STUCK_MIN_ELAPSED;
                let gap_ok = active
                    .last_stuck_handled
                    .map(|at| at.elapsed() >= STUCK_HANDLING_GAP)
                    .unwrap_or(true);
                if elapsed_ok && gap_ok {
                    self.pending_triggers.remove(&Trigger::Stuck);
                    if let Some(active) = self.active.as_mut() {
                        active.last_stuck_handled = Some(Instant::now());
                    }
                    self.force_disconnect("stuck_recovery").await;
                    return;
                }
                self.pending_triggers.remove(&Trigger::Stuck);
            }
            self.maybe_start_prefetch().await;
            return;
        }

        // 4. Non-busy inactivity handling.
        let now = now_ms();
        if self.last_activity.elapsed()
            >= Duration::from_millis(self.cfg.skills.subgoal_idle_stall_ms)
        {
            if self.queue.is_empty() && self.pending_triggers.is_empty() {
                self.enqueue_progression().await;
            } else if !self.queue.is_empty() && self.queue.iter().all(|sg| !sg.ready(now)) {
                // Everything is scheduled for later; pull the earliest in.
                if let Some(earliest) = self
                    .queue
                    .iter()
                    .map(|sg| sg.not_before_ms)
                    .min()
                    .filter(|nb| *nb > now)
                {
                    for sg in self.queue.iter_mut() {
                        if sg.not_before_ms == earliest {
                            sg.not_before_ms = now;
                            break;
                        }
                    }
                }
            }
        }

        // 5. Execute the next ready subgoal.
        if self.queue.iter().any(|sg| sg.ready(now)) {
            self.execute_next(now).await;
            return;
        }

        // 6. Planning on pending triggers.
        let cooled = self
            .planner_cooldown_until
            .map(|until| Instant::now() >= until)
            .unwrap_or(true);
        if !self.pending_triggers.is_empty() && cooled && !self.planner_inflight {
            self.request_plan().await;
            return;
        }

        // 7. Optional always-active refill.
        if self.queue.is_empty() && self.always_active_plan {
            self.enqueue_progression().await;
        }
    }

    fn drain_triggers(&mut self) {
        while let Ok(trigger) = self.triggers_rx.try_recv() {
            if trigger == Trigger::Death {
                tracing::warn!(bot = %self.bot_id, "controller.death_clears_queue");
                self.queue.clear();
                self.speculative = None;
            }
            self.pending_triggers.insert(trigger);
        }
    }

    fn drain_prefetch_results(&mut self) {
        while let Ok(done) = self.prefetch_rx.try_recv() {
            self.record_llm_call(&done.outcome, done.duration_ms);
            let relevant = self
                .active
                .as_ref()
                .map(|a| a.subgoal.id == done.for_subgoal_id)
                .unwrap_or(false);
            if relevant {
                self.speculative = Some(SpeculativePlan {
                    prepared_at: Instant::now(),
                    for_subgoal_id: done.for_subgoal_id,
                    next_goal: done.outcome.response.next_goal.clone(),
                    subgoals: done.outcome.response.subgoals.clone(),
                    planner_status: done.outcome.status,
                });
                tracing::debug!(bot = %self.bot_id, "controller.prefetch_cached");
            }
        }
    }

    async fn probe_idle_stall(&mut self) -> bool {
        let stall_after = Duration::from_millis(self.cfg.skills.subgoal_idle_stall_ms);
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if active.last_probe_at.elapsed() < IDLE_PROBE_PERIOD {
            return false;
        }
        active.last_probe_at = Instant::now();

        let position = self.adapter.state().await.ok().map(|s| s.position);
        let inventory_total = self
            .adapter
            .inventory()
            .await
            .ok()
            .map(|i| i.total_items())
            .unwrap_or(active.last_inventory_total);

        let moved = match (active.last_position, position) {
            (Some(prev), Some(cur)) => prev.distance_to(&cur) >= IDLE_PROGRESS_POSITION_EPSILON,
            _ => false,
        };
        let gathered = inventory_total != active.last_inventory_total;
        if let Some(position) = position {
            active.last_position = Some(position);
        }
        active.last_inventory_total = inventory_total;

        if moved || gathered {
            active.last_progress_at = Instant::now();
            return false;
        }
        if active.last_progress_at.elapsed() >= stall_after {
            tracing::warn!(
                bot = %self.bot_id,
                subgoal = %active.subgoal.subgoal.name,
                "controller.subgoal_idle_stall"
            );
            return true;
        }
        false
    }

    async fn execute_next(&mut self, now: u64) {
        if !self.holding_skill_slot {
            let admitted = self
                .skill_limiter
                .lock()
                .expect("skill limiter poisoned")
                .try_enter(&self.bot_id);
            if !admitted {
                return;
            }
            self.holding_skill_slot = true;
        }

        let Some(index) = self.queue.iter().position(|sg| sg.ready(now)) else {
            return;
        };
        let runtime = self.queue.remove(index).expect("index just found");

        self.clear_residuals().await;

        let (start_items, start_inventory_total) = match self.adapter.inventory().await {
            Ok(view) => {
                let mut items = BTreeMap::new();
                for stack in &view.items {
                    *items.entry(stack.name.clone()).or_insert(0) += stack.count;
                }
                (items, view.total_items())
            }
            Err(_) => (BTreeMap::new(), 0),
        };
        let start_health = self.adapter.state().await.map(|s| s.health).unwrap_or(0.0);

        self.exec_epoch += 1;
        let epoch = self.exec_epoch;
        self.busy.store(true, Ordering::Relaxed);
        self.active = Some(ActiveExecution {
            subgoal: runtime.clone(),
            epoch,
            started_at: Instant::now(),
            started_at_ms: now,
            start_items,
            start_health,
            last_probe_at: Instant::now(),
            last_progress_at: Instant::now(),
            last_position: None,
            last_inventory_total: start_inventory_total,
            last_stuck_handled: None,
        });

        tracing::info!(
            bot = %self.bot_id,
            subgoal = %runtime.subgoal.name,
            id = runtime.id,
            retry = runtime.retry_count,
            "controller.execute"
        );

        let engine = Arc::clone(&self.engine);
        let adapter = Arc::clone(&self.adapter);
        let bot_id = self.bot_id.clone();
        let tx = self.exec_tx.clone();
        let subgoal = runtime.subgoal.clone();
        self.exec_task = Some(tokio::spawn(async move {
            let result = engine.execute(&bot_id, &adapter, &subgoal).await;
            let _ = tx.send(ExecDone { epoch, result });
        }));
    }

    async fn handle_completion(&mut self, result: SkillResult) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.busy.store(false, Ordering::Relaxed);
        self.exec_task = None;
        let duration_ms = active.started_at.elapsed().as_millis() as u64;
        let runtime = active.subgoal.clone();
        let name = runtime.subgoal.name;

        // Deltas for history.
        let end_health = self
            .adapter
            .state()
            .await
            .map(|s| s.health)
            .unwrap_or(active.start_health);
        let inventory_delta = match self.adapter.inventory().await {
            Ok(view) => {
                let mut delta: BTreeMap<String, i64> = BTreeMap::new();
                let mut end_items: BTreeMap<String, u32> = BTreeMap::new();
                for stack in &view.items {
                    *end_items.entry(stack.name.clone()).or_insert(0) += stack.count;
                }
                for (item, count) in &end_items {
                    let before = active.start_items.get(item).copied().unwrap_or(0);
                    let diff = i64::from(*count) - i64::from(before);
                    if diff != 0 {
                        delta.insert(item.clone(), diff);
                    }
                }
                for (item, count) in &active.start_items {
                    if !end_items.contains_key(item) {
                        delta.insert(item.clone(), -i64::from(*count));
                    }
                }
                Some(delta)
            }
            Err(_) => None,
        };

        let entry = HistoryEntry::from_result(
            now_ms(),
            name,
            runtime.subgoal.params.clone(),
            &result,
            inventory_delta,
            end_health - active.start_health,
            duration_ms,
        );
        self.history.push(entry);

        let attempt = AttemptRow {
            bot_id: self.bot_id.clone(),
            subgoal_id: runtime.id,
            subgoal_name: name.as_str().to_string(),
            params_json: serde_json::to_string(&runtime.subgoal.params).unwrap_or_default(),
            result_json: serde_json::to_string(&result).unwrap_or_default(),
            retry_count: runtime.retry_count,
            started_at_ms: active.started_at_ms,
            duration_ms,
        };
        if let Err(err) = self.store.record_attempt(&attempt).await {
            tracing::warn!(bot = %self.bot_id, error = %format!("{err:#}"), "store.attempt_failed");
        }

        self.metrics
            .record_subgoal_duration(name.as_str(), duration_ms, result.is_success());

        match &result {
            SkillResult::Success { details, .. } => {
                tracing::info!(
                    bot = %self.bot_id,
                    subgoal = %name,
                    details = %details,
                    "controller.subgoal_ok"
                );
                self.last_error = None;
                self.streaks.clear();
                *self
                    .progress_counters
                    .entry(name.as_str().to_string())
                    .or_insert(0) += 1;
                if self.queue.is_empty() && !self.consume_speculative(runtime.id) {
                    self.pending_triggers.insert(Trigger::SubgoalCompleted);
                }
                self.reconnect_streak = 0;
            }
            SkillResult::Failure {
                error_code,
                details,
                retryable,
            } => {
                tracing::warn!(
                    bot = %self.bot_id,
                    subgoal = %name,
                    code = %error_code,
                    details = %details,
                    "controller.subgoal_failed"
                );
                self.last_error = Some(format!("{error_code}: {details}"));
                self.metrics.record_subgoal_failure(error_code.as_str());
                self.speculative = None;
                self.handle_failure(runtime, *error_code, *retryable);
            }
        }

        self.clear_residuals().await;
        if self.holding_skill_slot {
            self.skill_limiter
                .lock()
                .expect("skill limiter poisoned")
                .leave(&self.bot_id);
            self.holding_skill_slot = false;
        }
        self.last_activity = Instant::now();
    }

    fn handle_failure(&mut self, runtime: RuntimeSubgoal, code: FailureCode, retryable: bool) {
        let mut retryable = retryable && can_retry_failure(code);

        // Loop guard: identical failures inside the streak window stop
        // retrying even when each individual failure looks transient.
        let key = format!("{}:{}", runtime.subgoal.name, code);
        let now = now_ms();
        let window = self.cfg.skills.subgoal_failure_streak_window_ms;
        let entry = self.streaks.entry(key.clone()).or_insert((0, now));
        if now.saturating_sub(entry.1) > window {
            *entry = (0, now);
        }
        entry.0 += 1;
        if entry.0 >= self.cfg.skills.subgoal_loop_guard_repeats {
            tracing::warn!(bot = %self.bot_id, key = %key, "controller.loop_guard_tripped");
            retryable = false;
        }

        let limit = self.cfg.skills.subgoal_retry_limit + retry_limit_bonus(code);
        if retryable && runtime.retry_count < limit {
            let backoff = self.retry_backoff(runtime.retry_count);
            let id = self.next_subgoal_id;
            self.next_subgoal_id += 1;
            self.queue.push_front(RuntimeSubgoal {
                id,
                subgoal: runtime.subgoal,
                assigned_at_ms: now,
                retry_count: runtime.retry_count + 1,
                not_before_ms: now + backoff,
            });
            return;
        }

        // Dependent subgoals are stale once a prerequisite hard-fails.
        self.queue.clear();
        self.planner_cooldown_until = Some(Instant::now());
        self.pending_triggers.insert(Trigger::SubgoalFailed);
    }

    fn retry_backoff(&self, retry_count: u32) -> u64 {
        let base = self.cfg.skills.subgoal_retry_base_delay_ms * u64::from(retry_count + 1);
        let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
        (base + jitter).min(self.cfg.skills.subgoal_retry_max_delay_ms)
    }

    fn consume_speculative(&mut self, completed_id: u64) -> bool {
        let Some(plan) = self.speculative.take() else {
            return false;
        };
        let max_age = Duration::from_millis(self.cfg.planner.plan_prefetch_max_age_ms);
        if plan.for_subgoal_id != completed_id || plan.prepared_at.elapsed() > max_age {
            return false;
        }
        tracing::info!(
            bot = %self.bot_id,
            goal = %plan.next_goal,
            status = ?plan.planner_status,
            "controller.speculative_consumed"
        );
        self.current_goal = Some(plan.next_goal);
        self.enqueue_subgoals(plan.subgoals);
        self.pending_triggers.clear();
        true
    }

    async fn maybe_start_prefetch(&mut self) {
        if !self.cfg.planner.plan_prefetch_enabled
            || self.prefetch_task.as_ref().is_some_and(|t| !t.is_finished())
            || self.speculative.is_some()
            || !self.queue.is_empty()
            || !self.pending_triggers.is_empty()
        {
            return;
        }
        let Some(active) = &self.active else {
            return;
        };
        if active.started_at.elapsed() < PREFETCH_MIN_ELAPSED {
            return;
        }
        let for_subgoal_id = active.subgoal.id;
        let min_interval = Duration::from_millis(self.cfg.planner.plan_prefetch_min_interval_ms);
        if self
            .last_prefetch_at
            .is_some_and(|at| at.elapsed() < min_interval)
        {
            return;
        }

        // Leave reserve calls for reactive planning.
        let reserve = self.cfg.planner.plan_prefetch_reserve_calls;
        {
            let mut rate = self
                .planner
                .rate_limiter()
                .lock()
                .expect("rate limiter poisoned");
            let now = now_ms();
            let bot_used = rate.calls_in_last_hour(Some(&self.bot_id), now) as u32;
            let global_used = rate.calls_in_last_hour(None, now) as u32;
            if bot_used + reserve >= self.cfg.planner.llm_per_bot_hourly_cap
                || global_used + reserve >= self.cfg.planner.llm_global_hourly_cap
            {
                return;
            }
        }

        let Ok(request) = self.build_plan_request(false).await else {
            return;
        };
        self.last_prefetch_at = Some(Instant::now());
        let planner = Arc::clone(&self.planner);
        let tx = self.prefetch_tx.clone();
        tracing::debug!(bot = %self.bot_id, "controller.prefetch_start");
        self.prefetch_task = Some(tokio::spawn(async move {
            let started = Instant::now();
            if let Ok(outcome) = planner.plan(&request, now_ms()).await {
                let _ = tx.send(PrefetchDone {
                    for_subgoal_id,
                    outcome,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        }));
    }

    async fn build_plan_request(&mut self, force_snapshot: bool) -> anyhow::Result<PlanRequest> {
        let task = TaskContext {
            current_goal: self.current_goal.clone(),
            current_subgoal: self
                .active
                .as_ref()
                .map(|a| a.subgoal.subgoal.name.as_str().to_string()),
            progress_counters: self.progress_counters.clone(),
            last_error: self.last_error.clone(),
        };
        let snapshot = self.snapshots.build(force_snapshot, task).await?;
        Ok(PlanRequest {
            bot_id: self.bot_id.clone(),
            snapshot: snapshot.clone(),
            history: self
                .history
                .recent(self.cfg.planner.llm_history_limit)
                .into_iter()
                .cloned()
                .collect(),
            available_subgoals: SUBGOAL_NAMES.iter().map(|n| n.as_str().to_string()).collect(),
        })
    }

    async fn request_plan(&mut self) {
        self.planner_inflight = true;
        let started = Instant::now();
        let outcome = match self.build_plan_request(true).await {
            Ok(request) => {
                self.persist_snapshot(&request.snapshot).await;
                self.planner.plan(&request, now_ms()).await
            }
            Err(err) => {
                self.planner_inflight = false;
                tracing::warn!(bot = %self.bot_id, error = %format!("{err:#}"), "controller.snapshot_failed");
                self.planner_cooldown_until =
                    Some(Instant::now() + Duration::from_millis(self.cfg.planner.planner_cooldown_ms));
                return;
            }
        };
        self.planner_inflight = false;
        self.planner_cooldown_until =
            Some(Instant::now() + Duration::from_millis(self.cfg.planner.planner_cooldown_ms));

        match outcome {
            Ok(outcome) => {
                self.record_llm_call(&outcome, started.elapsed().as_millis() as u64);
                tracing::info!(
                    bot = %self.bot_id,
                    status = ?outcome.status,
                    goal = %outcome.response.next_goal,
                    subgoals = outcome.response.subgoals.len(),
                    "controller.plan_ready"
                );
                self.pending_triggers.clear();
                self.current_goal = Some(outcome.response.next_goal.clone());
                self.enqueue_subgoals(outcome.response.subgoals);
                self.last_activity = Instant::now();
            }
            Err(err) => {
                // Schema failure on a request we built ourselves: log it as
                // an incident, drop the triggers, and wait out the cooldown.
                tracing::error!(bot = %self.bot_id, error = %err, "controller.plan_schema_error");
                let _ = self
                    .store
                    .record_incident(&IncidentRow {
                        bot_id: self.bot_id.clone(),
                        category: "planner_schema_error".to_string(),
                        details: err.to_string(),
                    })
                    .await;
                self.pending_triggers.clear();
            }
        }
    }

    async fn persist_snapshot(&self, snapshot: &Snapshot) {
        if let Ok(json) = serde_json::to_string(snapshot) {
            if let Err(err) = self.store.record_bot_state(&self.bot_id, &json).await {
                tracing::debug!(bot = %self.bot_id, error = %format!("{err:#}"), "store.bot_state_failed");
            }
        }
    }

    fn record_llm_call(&self, outcome: &PlanOutcome, duration_ms: u64) {
        let status = match outcome.status {
            PlanStatus::Success => "SUCCESS",
            PlanStatus::RateLimited => "RATE_LIMITED",
            PlanStatus::Fallback => "FALLBACK",
        };
        self.metrics.record_planner_outcome(
            status,
            outcome.tokens_in,
            outcome.tokens_out,
            duration_ms,
        );
        let row = LlmCallRow {
            bot_id: self.bot_id.clone(),
            status: status.to_string(),
            tokens_in: outcome.tokens_in,
            tokens_out: outcome.tokens_out,
            duration_ms,
            notes_json: serde_json::to_string(&outcome.notes).unwrap_or_default(),
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            store.record_llm_call(&row).await.ok();
        });
    }

    async fn enqueue_progression(&mut self) {
        let Ok(snapshot) = self.snapshots.build(false, TaskContext::default()).await else {
            return;
        };
        let plan = self.guard.progression_plan(&snapshot, crate::agent::guard::DEFAULT_DESIRED_INCREMENT);
        if plan.subgoals.is_empty() {
            return;
        }
        tracing::info!(bot = %self.bot_id, reason = %plan.reason, "controller.local_progression");
        self.current_goal = Some(plan.reason);
        self.enqueue_subgoals(plan.subgoals);
        self.last_activity = Instant::now();
    }

    async fn clear_residuals(&self) {
        // Best effort: the adapter may be mid-reconnect.
        self.adapter.clear_pathfinding().await.ok();
        self.adapter.stop_collecting().await.ok();
        self.adapter.stop_combat().await.ok();
        self.adapter.clear_control_states().await.ok();
    }

    async fn force_disconnect(&mut self, reason: &str) {
        tracing::warn!(bot = %self.bot_id, reason, "controller.force_disconnect");

        // Requeue whatever was running so the reconnect resumes it.
        if let Some(active) = self.active.take() {
            let runtime = active.subgoal;
            if runtime.retry_count < self.cfg.skills.subgoal_retry_limit {
                let id = self.next_subgoal_id;
                self.next_subgoal_id += 1;
                self.queue.push_front(RuntimeSubgoal {
                    id,
                    subgoal: runtime.subgoal,
                    assigned_at_ms: now_ms(),
                    retry_count: runtime.retry_count + 1,
                    not_before_ms: 0,
                });
            }
        }
        self.busy.store(false, Ordering::Relaxed);
        if let Some(task) = self.exec_task.take() {
            task.abort();
        }
        self.exec_epoch += 1;
        if self.holding_skill_slot {
            self.skill_limiter
                .lock()
                .expect("skill limiter poisoned")
                .leave(&self.bot_id);
            self.holding_skill_slot = false;
        }
        self.speculative = None;
        self.snapshots.invalidate();
        self.detach_reflex();
        self.clear_residuals().await;
        self.adapter.quit().await.ok();

        let _ = self
            .store
            .record_incident(&IncidentRow {
                bot_id: self.bot_id.clone(),
                category: "forced_disconnect".to_string(),
                details: reason.to_string(),
            })
            .await;
        self.metrics.record_reconnect();

        let fast = matches!(reason, "subgoal_timeout" | "subgoal_idle_stall" | "stuck_recovery");
        self.schedule_reconnect(reason, fast);
    }

    fn schedule_reconnect(&mut self, reason: &str, fast: bool) {
        self.connected = false;
        self.connected_flag.store(false, Ordering::Relaxed);
        let delay = if fast {
            FAST_RECOVERY_BASE_DELAY
        } else {
            self.reconnect_streak = self.reconnect_streak.saturating_add(1);
            let jitter = rand::thread_rng().gen_range(0..=self.cfg.fleet.reconnect_jitter_ms);
            let penalty = (u64::from(self.reconnect_streak) * RECONNECT_STREAK_PENALTY_MS)
                .min(RECONNECT_STREAK_PENALTY_CAP_MS);
            Duration::from_millis(self.cfg.fleet.reconnect_base_delay_ms + jitter + penalty)
        };
        tracing::info!(bot = %self.bot_id, reason, delay_ms = delay.as_millis() as u64, "controller.reconnect_scheduled");
        self.reconnect_due = Some(Instant::now() + delay);
    }

    async fn try_reconnect(&mut self) {
        let due = self.reconnect_due.is_some_and(|at| Instant::now() >= at);
        if !due {
            return;
        }
        match self.connect().await {
            Ok(()) => {
                self.pending_triggers.insert(Trigger::Reconnect);
            }
            Err(err) => {
                tracing::warn!(bot = %self.bot_id, error = %format!("{err:#}"), "controller.reconnect_failed");
                let _ = self
                    .store
                    .record_incident(&IncidentRow {
                        bot_id: self.bot_id.clone(),
                        category: "reconnect_failed".to_string(),
                        details: format!("{err:#}"),
                    })
                    .await;
                self.schedule_reconnect("reconnect_failed", false);
            }
        }
    }
}
