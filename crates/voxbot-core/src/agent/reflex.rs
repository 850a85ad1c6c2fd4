//! Reflex monitor: turns adapter events and a ~1 Hz world probe into
//! triggers, plus the two immediate reflexes (control clear on damage,
//! return-to-base path when health is critical) that cannot wait for the
//! next planning round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::adapter::{AdapterEvent, AgentAdapter, Position};
use crate::agent::subgoal::Trigger;
use crate::config::ReflexConfig;

const LOW_HEALTH_THRESHOLD: f64 = 8.0;
const FLEE_REFLEX_MIN_INTERVAL: Duration = Duration::from_secs(12);
const NIGHT_WINDOW: std::ops::RangeInclusive<u32> = 13_000..=23_000;
const FULL_INVENTORY_FREE_SLOTS: u32 = 2;
const STALL_MOVEMENT_EPSILON: f64 = 0.25;

pub struct ReflexHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReflexHandle {
    pub fn detach(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

pub fn spawn_reflex(
    bot_id: String,
    adapter: Arc<dyn AgentAdapter>,
    triggers: mpsc::UnboundedSender<Trigger>,
    busy: Arc<AtomicBool>,
    cfg: ReflexConfig,
    base: Position,
    parent_cancel: &CancellationToken,
) -> ReflexHandle {
    let cancel = parent_cancel.child_token();
    let monitor_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        let mut monitor = Monitor {
            bot_id,
            adapter,
            triggers,
            busy,
            cfg,
            base,
            last_nightfall: None,
            last_flee: None,
            last_position: None,
            stall_ticks: 0,
        };
        monitor.run(monitor_cancel).await;
    });
    ReflexHandle { cancel, task }
}

struct Monitor {
    bot_id: String,
    adapter: Arc<dyn AgentAdapter>,
    triggers: mpsc::UnboundedSender<Trigger>,
    busy: Arc<AtomicBool>,
    cfg: ReflexConfig,
    base: Position,
    last_nightfall: Option<Instant>,
    last_flee: Option<Instant>,
    last_position: Option<Position>,
    stall_ticks: u32,
}

impl Monitor {
    async fn run(&mut self, cancel: CancellationToken) {
        let mut events = self.adapter.subscribe_events();
        let mut probe = tokio::time::interval(Duration::from_millis(
            self.cfg.reflex_probe_interval_ms.max(100),
        ));
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = probe.tick() => self.probe().await,
            }
        }
    }

    fn send(&self, trigger: Trigger) {
        if self.triggers.send(trigger).is_ok() {
            tracing::debug!(bot = %self.bot_id, trigger = %trigger, "reflex.trigger");
        }
    }

    async fn handle_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Hurt { health, source } => {
                self.send(Trigger::Attacked);
                // Immediate reflex: stop whatever movement keys are held.
                self.adapter.clear_control_states().await.ok();
                let flee_ok = self
                    .last_flee
                    .map(|at| at.elapsed() >= FLEE_REFLEX_MIN_INTERVAL)
                    .unwrap_or(true);
                if health <= LOW_HEALTH_THRESHOLD && flee_ok {
                    self.last_flee = Some(Instant::now());
                    tracing::info!(
                        bot = %self.bot_id,
                        health,
                        source = source.as_deref().unwrap_or("unknown"),
                        "reflex.flee_to_base"
                    );
                    let adapter = Arc::clone(&self.adapter);
                    let base = self.base;
                    tokio::spawn(async move {
                        adapter.pathfind_to(base, 3.0).await.ok();
                    });
                }
            }
            AdapterEvent::Death => self.send(Trigger::Death),
            AdapterEvent::Kicked { reason } => {
                tracing::warn!(bot = %self.bot_id, reason = %reason, "reflex.kicked");
                self.send(Trigger::Reconnect);
            }
            AdapterEvent::End { reason } => {
                tracing::warn!(bot = %self.bot_id, reason = %reason, "reflex.connection_end");
                self.send(Trigger::Reconnect);
            }
            AdapterEvent::Spawned => {}
        }
    }

    async fn probe(&mut self) {
        let Ok(state) = self.adapter.state().await else {
            return;
        };

        if NIGHT_WINDOW.contains(&state.time_of_day) {
            let due = self
                .last_nightfall
                .map(|at| at.elapsed() >= Duration::from_millis(self.cfg.reflex_nightfall_dedup_ms))
                .unwrap_or(true);
            if due {
                self.last_nightfall = Some(Instant::now());
                self.send(Trigger::Nightfall);
            }
        }

        if let Ok(inventory) = self.adapter.inventory().await {
            if inventory.empty_slots <= FULL_INVENTORY_FREE_SLOTS {
                self.send(Trigger::InventoryFull);
            }
        }

        // Stall watch: only meaningful while a skill is executing.
        if self.busy.load(Ordering::Relaxed) {
            let moved = self
                .last_position
                .map(|prev| prev.distance_to(&state.position))
                .unwrap_or(f64::MAX);
            self.last_position = Some(state.position);

            let activity = self.adapter.activity().await.unwrap_or_default();
            let stalled =
                moved < STALL_MOVEMENT_EPSILON && activity.pathing && !activity.digging && !activity.placing;
            if stalled {
                self.stall_ticks = self.stall_ticks.saturating_add(1);
            } else {
                self.stall_ticks = 0;
            }
            if self.stall_ticks >= self.cfg.reflex_stall_ticks {
                self.stall_ticks = 0;
                self.send(Trigger::Stuck);
            }
        } else {
            self.last_position = None;
            self.stall_ticks = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::adapter::ActivityFlags;
    use crate::catalog::Catalog;
    use crate::sim::SimAdapter;

    fn fast_cfg() -> ReflexConfig {
        ReflexConfig {
            reflex_nightfall_dedup_ms: 120_000,
            reflex_stall_ticks: 3,
            reflex_probe_interval_ms: 20,
        }
    }

    fn spawn(
        sim: &Arc<SimAdapter>,
        busy: bool,
        cfg: ReflexConfig,
    ) -> (
        mpsc::UnboundedReceiver<Trigger>,
        ReflexHandle,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let busy_flag = Arc::new(AtomicBool::new(busy));
        let cancel = CancellationToken::new();
        let handle = spawn_reflex(
            "alpha".to_string(),
            Arc::clone(sim) as Arc<dyn AgentAdapter>,
            tx,
            Arc::clone(&busy_flag),
            cfg,
            Position::default(),
            &cancel,
        );
        (rx, handle, busy_flag)
    }

    async fn collect_triggers(rx: &mut mpsc::UnboundedReceiver<Trigger>, wait_ms: u64) -> Vec<Trigger> {
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        let mut out = Vec::new();
        while let Ok(t) = rx.try_recv() {
            out.push(t);
        }
        out
    }

    #[tokio::test]
    async fn hurt_event_raises_attacked() {
        let sim = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        let (mut rx, handle, _) = spawn(&sim, false, fast_cfg());
        sim.push_event(AdapterEvent::Hurt {
            health: 15.0,
            source: None,
        });
        let triggers = collect_triggers(&mut rx, 50).await;
        assert!(triggers.contains(&Trigger::Attacked));
        handle.detach();
    }

    #[tokio::test]
    async fn death_and_disconnect_events_map_to_triggers() {
        let sim = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        let (mut rx, handle, _) = spawn(&sim, false, fast_cfg());
        sim.push_event(AdapterEvent::Death);
        sim.push_event(AdapterEvent::Kicked {
            reason: "afk".to_string(),
        });
        let triggers = collect_triggers(&mut rx, 50).await;
        assert!(triggers.contains(&Trigger::Death));
        assert!(triggers.contains(&Trigger::Reconnect));
        handle.detach();
    }

    #[tokio::test]
    async fn nightfall_fires_once_per_window() {
        let sim = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        sim.set_time_of_day(14_000);
        let (mut rx, handle, _) = spawn(&sim, false, fast_cfg());
        let triggers = collect_triggers(&mut rx, 120).await;
        let nightfalls = triggers
            .iter()
            .filter(|t| **t == Trigger::Nightfall)
            .count();
        assert_eq!(nightfalls, 1);
        handle.detach();
    }

    #[tokio::test]
    async fn stall_while_busy_raises_stuck() {
        let sim = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        sim.set_activity(ActivityFlags {
            pathing: true,
            digging: false,
            placing: false,
        });
        let (mut rx, handle, _) = spawn(&sim, true, fast_cfg());
        let triggers = collect_triggers(&mut rx, 200).await;
        assert!(triggers.contains(&Trigger::Stuck), "{triggers:?}");
        handle.detach();
    }

    #[tokio::test]
    async fn no_stuck_when_digging_explains_the_stall() {
        let sim = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        sim.set_activity(ActivityFlags {
            pathing: true,
            digging: true,
            placing: false,
        });
        let (mut rx, handle, _) = spawn(&sim, true, fast_cfg());
        let triggers = collect_triggers(&mut rx, 150).await;
        assert!(!triggers.contains(&Trigger::Stuck));
        handle.detach();
    }
}
