//! Telemetry update scheduler
//!
//! Two independent loops, location and latency, each seeded from its
//! `UpdateConfig`:
//! - `OnTrigger`: nothing scheduled, status `Start`, only manual polls send
//! - `OnStart`: exactly one send, then `Completed`
//! - `OnInterval`: one send per interval, unbounded or `max_updates` times
//!
//! The first send happens immediately and there is no wait after the last
//! one. Pause and stop raise the run's `watch` signal, which interrupts any
//! loop waiting on its interval; resume starts a new run that continues
//! with the remaining count and keeps the interval since the last send.
//! Stop leaves loops that already completed as they are.

use crate::config::{UpdateConfig, UpdatePattern};
use crate::error::ChannelError;
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    Location,
    Latency,
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopKind::Location => f.write_str("location"),
            LoopKind::Latency => f.write_str("latency"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateStatus {
    #[default]
    Ready,
    Start,
    Running,
    Paused,
    Stopped,
    Completed,
}

/// Status of one loop; `remaining: None` is unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdatesState {
    pub status: UpdateStatus,
    pub remaining: Option<u32>,
}

/// Performs one telemetry send for a loop
#[async_trait]
pub trait UpdateSender: Send + Sync {
    async fn send_update(&self, kind: LoopKind) -> Result<(), ChannelError>;
}

#[derive(Default)]
struct LoopSlot {
    config: Option<UpdateConfig>,
    state: UpdatesState,
    task: Option<JoinHandle<()>>,
    // When the next scheduled send is due, once one has been sent
    next_due: Option<Instant>,
}

#[derive(Default)]
struct Loops {
    location: LoopSlot,
    latency: LoopSlot,
    // Cancellation signal of the current run
    run: Option<watch::Sender<bool>>,
}

impl Loops {
    fn slot(&mut self, kind: LoopKind) -> &mut LoopSlot {
        match kind {
            LoopKind::Location => &mut self.location,
            LoopKind::Latency => &mut self.latency,
        }
    }

    fn run_signal(&mut self) -> watch::Receiver<bool> {
        self.run.get_or_insert_with(|| watch::channel(false).0).subscribe()
    }

    fn cancel_run(&mut self) {
        if let Some(run) = self.run.take() {
            let _ = run.send(true);
        }
    }
}

#[derive(Clone)]
pub struct UpdateScheduler {
    sender: Arc<dyn UpdateSender>,
    loops: Shared<Loops>,
}

impl UpdateScheduler {
    pub fn new(sender: Arc<dyn UpdateSender>) -> Self {
        Self { sender, loops: new_state(Loops::default()) }
    }

    pub fn start_location_updates(&self, config: UpdateConfig) {
        self.start(LoopKind::Location, config);
    }

    pub fn start_latency_updates(&self, config: UpdateConfig) {
        self.start(LoopKind::Latency, config);
    }

    fn start(&self, kind: LoopKind, config: UpdateConfig) {
        let mut loops = self.loops.lock();
        let cancel = loops.run_signal();
        let slot = loops.slot(kind);
        if let Some(task) = slot.task.take() {
            task.abort();
        }

        slot.state.remaining = config.seed_count();
        slot.next_due = None;
        if config.pattern == UpdatePattern::OnTrigger {
            slot.state.status = UpdateStatus::Start;
            debug!("{} updates on trigger only", kind);
        } else {
            slot.state.status = UpdateStatus::Running;
            slot.task = Some(self.spawn_loop(kind, config.clone(), cancel));
            info!("{} updates started ({:?}, remaining {:?})", kind, config.pattern, slot.state.remaining);
        }
        slot.config = Some(config);
    }

    fn spawn_loop(&self, kind: LoopKind, config: UpdateConfig, cancel: watch::Receiver<bool>) -> JoinHandle<()> {
        self.spawn_loop_from(kind, config, None, cancel)
    }

    fn spawn_loop_from(
        &self,
        kind: LoopKind,
        config: UpdateConfig,
        first_due: Option<Instant>,
        cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(run_loop(kind, config, first_due, self.sender.clone(), self.loops.clone(), cancel))
    }

    /// Pause every running loop, keeping its remaining count.
    pub fn pause_updates(&self) {
        let mut loops = self.loops.lock();
        loops.cancel_run();
        for kind in [LoopKind::Location, LoopKind::Latency] {
            let slot = loops.slot(kind);
            if slot.state.status == UpdateStatus::Running {
                slot.state.status = UpdateStatus::Paused;
                debug!("{} updates paused (remaining {:?})", kind, slot.state.remaining);
            }
        }
    }

    /// Resume paused loops with what they had left.
    pub fn resume_updates(&self) {
        let mut loops = self.loops.lock();
        let cancel = loops.run_signal();
        for kind in [LoopKind::Location, LoopKind::Latency] {
            let slot = loops.slot(kind);
            if slot.state.status != UpdateStatus::Paused {
                continue;
            }
            let Some(config) = slot.config.clone() else { continue };
            if let Some(task) = slot.task.take() {
                task.abort();
            }
            slot.state.status = UpdateStatus::Running;
            slot.task = Some(self.spawn_loop_from(kind, config, slot.next_due, cancel.clone()));
            debug!("{} updates resumed (remaining {:?})", kind, slot.state.remaining);
        }
    }

    pub fn stop_updates(&self) {
        let mut loops = self.loops.lock();
        loops.cancel_run();
        for kind in [LoopKind::Location, LoopKind::Latency] {
            let slot = loops.slot(kind);
            if !matches!(slot.state.status, UpdateStatus::Ready | UpdateStatus::Completed) {
                slot.state.status = UpdateStatus::Stopped;
            }
        }
        debug!("telemetry updates stopped");
    }

    /// Re-seed every configured loop from its config (after a migration).
    pub fn restart_updates(&self) {
        let configs: Vec<_> = {
            let mut loops = self.loops.lock();
            [LoopKind::Location, LoopKind::Latency]
                .into_iter()
                .filter_map(|kind| loops.slot(kind).config.clone().map(|c| (kind, c)))
                .collect()
        };
        for (kind, config) in configs {
            self.start(kind, config);
        }
    }

    pub fn state(&self, kind: LoopKind) -> UpdatesState {
        self.loops.lock().slot(kind).state
    }

    /// Manual send outside the schedule. Never touches the counter and does
    /// nothing unless the loop is started or running.
    pub async fn poll_now(&self, kind: LoopKind) -> bool {
        let status = self.state(kind).status;
        if !matches!(status, UpdateStatus::Start | UpdateStatus::Running) {
            debug!("manual {} poll ignored in {:?}", kind, status);
            return false;
        }
        match self.sender.send_update(kind).await {
            Ok(()) => true,
            Err(e) => {
                warn!("manual {} update failed: {}", kind, e);
                false
            }
        }
    }
}

async fn run_loop(
    kind: LoopKind,
    config: UpdateConfig,
    first_due: Option<Instant>,
    sender: Arc<dyn UpdateSender>,
    loops: Shared<Loops>,
    mut cancel: watch::Receiver<bool>,
) {
    if let Some(due) = first_due.filter(|due| *due > Instant::now()) {
        tokio::select! {
            _ = tokio::time::sleep_until(due) => {}
            _ = cancel.changed() => return,
        }
    }
    loop {
        if *cancel.borrow() {
            return;
        }
        if loops.lock().slot(kind).state.remaining == Some(0) {
            complete(&loops, kind);
            return;
        }

        if let Err(e) = sender.send_update(kind).await {
            warn!("{} update failed: {}", kind, e);
        }

        let remaining = {
            let mut loops = loops.lock();
            let slot = loops.slot(kind);
            slot.state.remaining = slot.state.remaining.map(|r| r.saturating_sub(1));
            slot.next_due = Some(Instant::now() + config.interval());
            slot.state.remaining
        };
        if remaining == Some(0) {
            complete(&loops, kind);
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.interval()) => {}
            _ = cancel.changed() => return,
        }
    }
}

fn complete(loops: &Shared<Loops>, kind: LoopKind) {
    let mut loops = loops.lock();
    let slot = loops.slot(kind);
    if slot.state.status == UpdateStatus::Running {
        slot.state.status = UpdateStatus::Completed;
        info!("{} updates completed", kind);
    }
}
