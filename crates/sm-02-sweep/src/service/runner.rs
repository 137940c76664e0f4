//! Sweep Service - the engine task
//!
//! One task owns `FabricState` and drives both state machines. It waits on a
//! single `select!` over commands, completions and timers; every wake-up is
//! handled to the end before the next one, so phases never overlap and a
//! sweep never runs concurrently with another.
//!
//! ```text
//! commands ──┐
//! completions├──→ select! ──→ handle ──→ drive ──→ phases ──→ MadTransport
//! timers ────┘                             │
//!                                          └──→ FabricView / SmStatus
//! ```

use std::sync::Arc;
use std::time::Duration;

use fabric_types::{Completion, DiscoveryReport, SmRole};
use sm_01_routing::{engine_for, FabricState, FabricView, RoutingEngine, RoutingSnapshot};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Command, SmHandle};
use crate::config::SmConfig;
use crate::domain::{
    apply_completed, arbitrate, IdleQueue, PhaseEnv, PhaseOutcome, PhaseSet, RetryPolicy,
    RoleEvent, RoleManager, SweepContext, SweepEvent, SweepKind, SweepOutcome, SweepState,
    SweepStateMachine,
};
use crate::error::SweepResult;
use crate::metrics;
use crate::ports::inbound::SmStatus;
use crate::ports::outbound::{CompletionStream, FabricDiscovery, MadTransport, PeerInfo, SmPeers};

/// Queue depth of the command channel.
pub const COMMAND_QUEUE_DEPTH: usize = 64;

/// Why the event loop woke up.
enum Wake {
    Command(Option<Command>),
    Completion(Completion),
    Retry,
    Watchdog,
    LightSweep,
    Poll,
}

#[derive(Debug, Default)]
struct Counters {
    heavy: u64,
    light: u64,
    aborted: u64,
    incomplete: u64,
}

/// The sweep engine.
pub struct SweepService<D, T, P> {
    config: SmConfig,
    discovery: Arc<D>,
    transport: Arc<T>,
    peers: Arc<P>,
    engine: Box<dyn RoutingEngine>,

    fabric: FabricState,
    report: DiscoveryReport,
    ctx: SweepContext,
    machine: SweepStateMachine,
    phases: PhaseSet,
    role: Arc<RoleManager>,
    idle: IdleQueue,

    view: Arc<FabricView>,
    status: watch::Sender<SmStatus>,
    commands: mpsc::Receiver<Command>,
    completions: CompletionStream,

    counters: Counters,
    sweep_started: Option<Instant>,
    retry_at: Option<Instant>,
    last_progress: Instant,
}

impl<D, T, P> SweepService<D, T, P>
where
    D: FabricDiscovery + 'static,
    T: MadTransport + 'static,
    P: SmPeers + 'static,
{
    /// Build the engine and the handle used to talk to it.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, including an engine that cannot honour
    /// the routing options.
    pub fn new(
        config: SmConfig,
        discovery: Arc<D>,
        transport: Arc<T>,
        peers: Arc<P>,
        completions: CompletionStream,
    ) -> SweepResult<(Self, SmHandle)> {
        config.validate()?;
        let engine = engine_for(config.routing_engine, config.routing_options())?;

        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (status, status_rx) = watch::channel(SmStatus::default());
        let view = Arc::new(FabricView::new());
        let role = Arc::new(RoleManager::new(
            config.candidate(),
            config.polling_retry_number,
        ));
        let machine = SweepStateMachine::new(RetryPolicy {
            base: config.heavy_retry_base(),
            max: config.heavy_retry_max(),
        });

        info!(
            guid = %config.guid,
            priority = config.priority,
            engine = engine.name(),
            "subnet manager configured"
        );

        let handle = SmHandle::new(command_tx, Arc::clone(&view), status_rx, Arc::clone(&role));
        let service = Self {
            config,
            discovery,
            transport,
            peers,
            engine,
            fabric: FabricState::new(),
            report: DiscoveryReport::default(),
            ctx: SweepContext::new(),
            machine,
            phases: PhaseSet::new(),
            role,
            idle: IdleQueue::new(),
            view,
            status,
            commands,
            completions,
            counters: Counters::default(),
            sweep_started: None,
            retry_at: None,
            last_progress: Instant::now(),
        };
        Ok((service, handle))
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        let mut light_timer = self.config.sweep_interval().map(periodic);
        let mut poll_timer = periodic(self.config.polling_interval());

        self.request(SweepKind::Heavy);
        self.drive().await;
        self.publish_status();

        loop {
            let retry_at = self.retry_at;
            let watchdog_at = self.watchdog_deadline();

            let wake = tokio::select! {
                biased;
                cmd = self.commands.recv() => Wake::Command(cmd),
                Some(c) = self.completions.recv() => Wake::Completion(c),
                _ = sleep_until(retry_at) => Wake::Retry,
                _ = sleep_until(watchdog_at) => Wake::Watchdog,
                _ = tick(&mut light_timer) => Wake::LightSweep,
                _ = poll_timer.tick() => Wake::Poll,
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => break,
                Wake::Command(Some(cmd)) => self.on_command(cmd),
                Wake::Completion(c) => self.on_completion(c),
                Wake::Retry => {
                    self.retry_at = None;
                    info!("heavy sweep retry due");
                    self.request(SweepKind::Heavy);
                }
                Wake::Watchdog => self.on_timeout(),
                Wake::LightSweep => self.request(SweepKind::Light),
                Wake::Poll => self.poll_master().await,
            }

            self.drive().await;
            self.publish_status();
        }

        self.shutdown();
    }

    // =========================================================================
    // STEPPING
    // =========================================================================

    pub(crate) fn request(&mut self, kind: SweepKind) {
        self.machine.process_event(SweepEvent::Requested(kind));
    }

    /// Run phases until the engine waits on outstanding work or goes idle.
    pub(crate) async fn drive(&mut self) {
        loop {
            match self.machine.state() {
                SweepState::Idle => match self.machine.take_pending() {
                    Some(kind) => self.begin_sweep(kind).await,
                    None => {
                        self.run_idle_work();
                        return;
                    }
                },
                SweepState::Running { kind, phase } => {
                    debug!(kind = ?kind, phase = %phase, "running phase");
                    self.run_phase();
                }
                SweepState::Waiting { .. } => return,
            }
        }
    }

    async fn begin_sweep(&mut self, kind: SweepKind) {
        let role = self.role.role();
        if role == SmRole::Standby || (kind == SweepKind::Light && role != SmRole::Master) {
            debug!(kind = ?kind, role = %role, "sweep skipped");
            return;
        }

        let sweep = self.ctx.begin();
        self.apply(SweepEvent::Begin(kind));
        self.sweep_started = Some(Instant::now());
        if kind == SweepKind::Heavy {
            self.retry_at = None;
        }
        info!(sweep, kind = ?kind, role = %role, "sweep started");

        match self.discovery.discover().await {
            Ok(report) => self.report = report,
            Err(e) => {
                error!(sweep, error = %e, "discovery failed, sweep aborted");
                self.apply(SweepEvent::PhaseFailed);
                return;
            }
        }

        let peers = match self.peers.discover_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "peer query failed, arbitrating alone");
                Vec::new()
            }
        };
        self.arbitrate(&peers).await;

        if self.role.role() != SmRole::Master {
            info!(sweep, role = %self.role.role(), "not master, sweep cancelled");
            self.apply(SweepEvent::Cancelled);
        }
    }

    async fn arbitrate(&mut self, peers: &[PeerInfo]) {
        let local = self.role.local();
        match self.role.role() {
            SmRole::Discovering => {
                let preferred = arbitrate(local, peers);
                self.role
                    .process_event(RoleEvent::DiscoveryCompleted { preferred });
            }
            SmRole::Master => {
                let with_role = |role: SmRole| -> Vec<PeerInfo> {
                    peers.iter().filter(|p| p.role == role).copied().collect()
                };
                if let Some(remote) = arbitrate(local, &with_role(SmRole::Master)) {
                    warn!(remote = %remote.guid, priority = remote.priority, "preferred master found");
                    self.role.process_event(RoleEvent::RemoteMasterDetected(remote));
                } else if let Some(standby) = arbitrate(local, &with_role(SmRole::Standby)) {
                    match self.peers.send_handover(standby.guid).await {
                        Ok(()) => {
                            info!(to = %standby.guid, "mastership handed over");
                            self.role
                                .process_event(RoleEvent::PreferredStandbyDetected(standby));
                        }
                        Err(e) => warn!(to = %standby.guid, error = %e, "handover failed"),
                    }
                }
            }
            SmRole::Standby => {}
        }
    }

    fn run_phase(&mut self) {
        let (kind, phase) = match self.machine.state() {
            SweepState::Running { kind, phase } => (kind, phase),
            _ => return,
        };

        let result = {
            let mut env = PhaseEnv {
                kind,
                fabric: &mut self.fabric,
                ctx: &mut self.ctx,
                transport: self.transport.as_ref(),
                engine: self.engine.as_ref(),
                config: &self.config,
                report: &self.report,
            };
            self.phases.get_mut(phase).run(&mut env)
        };

        match result {
            Ok(PhaseOutcome::Done) => self.phase_boundary(SweepEvent::PhaseDone),
            Ok(PhaseOutcome::DonePending) => {
                debug!(phase = %phase, outstanding = self.ctx.outstanding(), "phase waiting");
                self.apply(SweepEvent::PhasePending);
                self.last_progress = Instant::now();
                if self.ctx.outstanding() == 0 {
                    self.on_drained();
                }
            }
            Err(e) => {
                error!(phase = %phase, error = %e, "phase failed, sweep aborted");
                self.ctx.discard_outstanding();
                self.apply(SweepEvent::PhaseFailed);
            }
        }
    }

    fn on_drained(&mut self) {
        let (kind, phase) = match self.machine.state() {
            SweepState::Waiting { kind, phase } => (kind, phase),
            _ => return,
        };

        let result = {
            let mut env = PhaseEnv {
                kind,
                fabric: &mut self.fabric,
                ctx: &mut self.ctx,
                transport: self.transport.as_ref(),
                engine: self.engine.as_ref(),
                config: &self.config,
                report: &self.report,
            };
            self.phases.get_mut(phase).on_drained(&mut env)
        };

        match result {
            Ok(()) => self.phase_boundary(SweepEvent::Drained),
            Err(e) => {
                error!(phase = %phase, error = %e, "phase completion failed, sweep aborted");
                self.apply(SweepEvent::PhaseFailed);
            }
        }
    }

    /// Barrier between phases: nothing is outstanding here.
    fn phase_boundary(&mut self, event: SweepEvent) {
        if self.ctx.incomplete {
            self.machine.process_event(SweepEvent::MarkIncomplete);
        }
        self.apply(event);
        self.view.publish(RoutingSnapshot::capture(&self.fabric));
        self.run_idle_work();
    }

    fn apply(&mut self, event: SweepEvent) {
        let before = self.machine.state();
        let after = self.machine.process_event(event);
        if !before.is_idle() && after.is_idle() {
            if let SweepState::Running { kind, .. } | SweepState::Waiting { kind, .. } = before {
                self.on_sweep_finished(kind);
            }
        }
    }

    fn on_sweep_finished(&mut self, kind: SweepKind) {
        let elapsed = self
            .sweep_started
            .take()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        let sweep = self.ctx.sweep_id;
        let outcome = self.machine.last_outcome();

        match outcome {
            Some(SweepOutcome::Completed(_)) => info!(
                sweep,
                kind = ?kind,
                issued = self.ctx.issued,
                reprogrammed = self.ctx.any_change,
                rerouted = self.ctx.hop_counts_changed,
                elapsed_ms = elapsed.as_millis() as u64,
                "sweep completed"
            ),
            Some(SweepOutcome::Incomplete(_)) => warn!(
                sweep,
                kind = ?kind,
                failed = self.ctx.failed,
                "sweep incomplete"
            ),
            Some(SweepOutcome::Aborted(_)) => error!(sweep, kind = ?kind, "sweep aborted"),
            Some(SweepOutcome::Cancelled(_)) | None => debug!(sweep, kind = ?kind, "sweep cancelled"),
        }

        match outcome {
            Some(SweepOutcome::Completed(k)) | Some(SweepOutcome::Incomplete(k)) => match k {
                SweepKind::Heavy => self.counters.heavy += 1,
                SweepKind::Light => self.counters.light += 1,
            },
            _ => {}
        }
        match outcome {
            Some(SweepOutcome::Aborted(_)) => self.counters.aborted += 1,
            Some(SweepOutcome::Incomplete(_)) => self.counters.incomplete += 1,
            _ => {}
        }
        if let Some(outcome) = outcome {
            metrics::record_sweep_finished(outcome, elapsed.as_secs_f64());
        }

        if kind == SweepKind::Light
            && self.ctx.topology_changed
            && matches!(outcome, Some(SweepOutcome::Completed(_)))
        {
            info!(sweep, "change detected by light sweep, escalating");
            self.request(SweepKind::Heavy);
        }

        if let Some(delay) = self.machine.retry_delay() {
            info!(
                delay_ms = delay.as_millis() as u64,
                failures = self.machine.consecutive_failures(),
                "heavy sweep retry scheduled"
            );
            self.retry_at = Some(Instant::now() + delay);
        }
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    pub(crate) fn on_completion(&mut self, completion: Completion) {
        let Some(request) = self.ctx.complete(completion.id) else {
            debug!(id = completion.id.0, "completion for unknown transaction ignored");
            return;
        };
        self.last_progress = Instant::now();

        match completion.result {
            Ok(()) => {
                if let Err(e) = apply_completed(&mut self.fabric, &request) {
                    warn!(target_node = %request.target(), error = %e, "completed request no longer applies");
                }
            }
            Err(e) => {
                warn!(target_node = %request.target(), error = %e, "transaction failed");
                self.ctx.record_failure();
            }
        }

        if self.ctx.outstanding() == 0 && matches!(self.machine.state(), SweepState::Waiting { .. })
        {
            self.on_drained();
        }
    }

    fn on_timeout(&mut self) {
        let dropped = self.ctx.discard_outstanding();
        warn!(
            dropped,
            timeout_ms = self.config.transaction_timeout_ms,
            "outstanding transactions timed out"
        );
        for _ in 0..dropped {
            self.ctx.record_failure();
        }
        self.on_drained();
    }

    pub(crate) fn on_command(&mut self, command: Command) {
        match command {
            Command::Sweep(kind) => self.request(kind),
            Command::TopologyChanged => {
                debug!("topology change reported");
                self.request(SweepKind::Heavy);
            }
            Command::HandoverReceived => {
                let (_, after) = self.role.process_event(RoleEvent::HandoverReceived);
                if after == SmRole::Master {
                    self.request(SweepKind::Heavy);
                }
            }
            Command::JoinGroup {
                mlid,
                mgid,
                node,
                port,
                state,
                reply,
            } => {
                let result: SweepResult<bool> = self
                    .fabric
                    .join_group(mlid, mgid, node, port, state)
                    .map_err(Into::into);
                if let Ok(true) = result {
                    debug!(mlid = %mlid, node = %node, port, "group member joined");
                    self.request(SweepKind::Heavy);
                }
                let _ = reply.send(result);
            }
            Command::LeaveGroup {
                mlid,
                node,
                port,
                reply,
            } => {
                let changed = self.fabric.leave_group(mlid, node, port);
                if changed {
                    debug!(mlid = %mlid, node = %node, port, "group member left");
                    self.request(SweepKind::Heavy);
                }
                let _ = reply.send(changed);
            }
            Command::Idle(work) => self.idle.push(work),
            Command::Shutdown => {}
        }
    }

    async fn poll_master(&mut self) {
        if self.role.role() != SmRole::Standby {
            return;
        }
        let Some(master) = self.role.master() else {
            return;
        };

        let event = match self.peers.poll_master(master.guid).await {
            Ok(true) => RoleEvent::PollSucceeded,
            Ok(false) => RoleEvent::PollFailed,
            Err(e) => {
                debug!(master = %master.guid, error = %e, "master poll failed");
                RoleEvent::PollFailed
            }
        };
        let (before, after) = self.role.process_event(event);
        if event == RoleEvent::PollFailed && after == SmRole::Standby {
            warn!(
                master = %master.guid,
                retries = self.role.snapshot().retries(),
                "master did not answer poll"
            );
        }
        if before == SmRole::Standby && after == SmRole::Discovering {
            self.request(SweepKind::Heavy);
        }
    }

    // =========================================================================
    // HOUSEKEEPING
    // =========================================================================

    fn run_idle_work(&mut self) {
        if self.ctx.outstanding() > 0 {
            return;
        }
        let ran = self.idle.run_all();
        if ran > 0 {
            debug!(ran, "idle work done");
        }
    }

    fn watchdog_deadline(&self) -> Option<Instant> {
        match self.machine.state() {
            SweepState::Waiting { .. } if self.ctx.outstanding() > 0 => {
                Some(self.last_progress + self.config.transaction_timeout())
            }
            _ => None,
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(self.status_snapshot());
    }

    pub(crate) fn status_snapshot(&self) -> SmStatus {
        SmStatus {
            role: self.role.role(),
            state: self.machine.state(),
            outstanding: self.ctx.outstanding(),
            heavy_sweeps: self.counters.heavy,
            light_sweeps: self.counters.light,
            aborted_sweeps: self.counters.aborted,
            incomplete_sweeps: self.counters.incomplete,
            last_outcome: self.machine.last_outcome(),
            generation: self.fabric.generation,
        }
    }

    fn shutdown(&mut self) {
        let dropped = self.ctx.discard_outstanding();
        self.view.publish(RoutingSnapshot::capture(&self.fabric));
        self.publish_status();
        info!(dropped, "subnet manager stopped");
    }

    // =========================================================================
    // TEST INTROSPECTION
    // =========================================================================

    #[cfg(test)]
    pub(crate) fn machine(&self) -> &SweepStateMachine {
        &self.machine
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &SweepContext {
        &self.ctx
    }

    #[cfg(test)]
    pub(crate) fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    #[cfg(test)]
    pub(crate) fn role(&self) -> &RoleManager {
        &self.role
    }

    /// Next completion already delivered, without waiting.
    #[cfg(test)]
    pub(crate) fn try_next_completion(&mut self) -> Option<Completion> {
        self.completions.try_recv().ok()
    }
}

fn periodic(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
