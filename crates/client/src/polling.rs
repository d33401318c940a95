//! Progress monitoring by polling the snapshot endpoint.
//!
//! The server never says "finished": a snapshot only reports the current
//! job name, step counts, an optional preview and an ETA. [`PhaseTracker`]
//! turns a sequence of snapshots into phase transitions and decides when
//! a run is over. [`PollingProgressMonitor`] drives the tracker from a
//! fixed-interval tick task.
//!
//! Completion rules, applied on each idle snapshot once a generation has
//! been seen:
//!
//! | last phase                          | idle polls before `completed` |
//! |-------------------------------------|-------------------------------|
//! | vae-decode                          | 1                             |
//! | sampling / postprocessing / decoded | 2                             |
//! | anything else                       | 4                             |
//!
//! A run that never shows activity is dropped silently after 10 idle polls.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canvasgen_core::progress::{Phase, ProgressEvent};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::SdApi;
use crate::messages::ProgressSnapshot;
use crate::monitor::{
    DispatchGate, HandlerRegistry, MonitorCapability, MonitorError, ProgressHandler,
    ProgressMonitor, Subscription,
};

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Interval between snapshot requests.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on the capability probe request.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Idle polls before completing a run whose last phase was sampling or
/// postprocessing, or that ever entered decode.
pub const PHASE_IDLE_POLLS: u32 = 2;

/// Idle polls before completing a run whose phases were never observed.
pub const FALLBACK_IDLE_POLLS: u32 = 4;

/// Idle polls before abandoning a run that never started.
pub const NEVER_STARTED_IDLE_POLLS: u32 = 10;

/// Timing for [`PollingProgressMonitor`].
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Phase tracker
// ---------------------------------------------------------------------------

/// Why a run stopped on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A `completed` event was emitted.
    Completed,
    /// No activity was ever seen; nothing was emitted.
    NeverStarted,
}

/// Result of feeding one snapshot to the tracker.
#[derive(Debug, Default, PartialEq)]
pub struct Tick {
    /// Event to deliver to handlers, if anything changed.
    pub event: Option<ProgressEvent>,
    /// Set when polling should stop.
    pub stop: Option<StopReason>,
}

/// Phase-inference state for one polling run.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    generation_started: bool,
    phase: Option<Phase>,
    decode_seen: bool,
    no_activity_streak: u32,
    last_emitted: Option<(u32, String, Phase)>,
    last_status: String,
    last_total: u32,
    completed_emitted: bool,
    finished: bool,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current inferred phase; `None` while idle.
    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn generation_started(&self) -> bool {
        self.generation_started
    }

    pub fn completed_emitted(&self) -> bool {
        self.completed_emitted
    }

    /// Whether the run is over; later snapshots are ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one snapshot.
    pub fn observe(&mut self, snapshot: &ProgressSnapshot) -> Tick {
        if self.finished {
            return Tick::default();
        }
        if snapshot.is_active() {
            self.observe_active(snapshot)
        } else {
            self.observe_idle()
        }
    }

    /// End the run, returning a synthesized `completed` event unless one
    /// was already emitted.
    pub fn force_complete(&mut self) -> Option<ProgressEvent> {
        self.finished = true;
        if self.completed_emitted {
            None
        } else {
            Some(self.complete())
        }
    }

    /// End the run without emitting anything.
    pub fn stop(&mut self) {
        self.finished = true;
    }

    fn observe_active(&mut self, snapshot: &ProgressSnapshot) -> Tick {
        self.generation_started = true;
        self.no_activity_streak = 0;

        let step = snapshot.step();
        let total = snapshot.total_steps();
        let status = snapshot.state.job.clone();
        let phase = self.classify(&status, step, total);

        self.phase = Some(phase);
        self.decode_seen |= phase == Phase::VaeDecode;
        if total > 0 {
            self.last_total = total;
        }
        self.last_status.clone_from(&status);

        let key = (step, status, phase);
        if self.last_emitted.as_ref() == Some(&key) {
            return Tick::default();
        }
        let (current, status, phase) = key.clone();
        self.last_emitted = Some(key);

        Tick {
            event: Some(ProgressEvent {
                current,
                total,
                phase,
                status,
                preview_image: snapshot.current_image.clone(),
                eta_seconds: snapshot.eta_relative,
                job_index: u32::try_from(snapshot.state.job_no).ok(),
                job_count: u32::try_from(snapshot.state.job_count).ok(),
            }),
            stop: None,
        }
    }

    fn classify(&self, job_name: &str, step: u32, total: u32) -> Phase {
        if let Some(phase) = Phase::from_job_name(job_name) {
            return phase;
        }
        if total > 0 {
            // Sampling has run out of steps; decode is next and reports nothing.
            let sampling_done = step >= total
                && matches!(self.phase, Some(Phase::Sampling | Phase::VaeDecode));
            return if sampling_done {
                Phase::VaeDecode
            } else {
                Phase::Sampling
            };
        }
        self.phase.unwrap_or(Phase::Waiting)
    }

    fn observe_idle(&mut self) -> Tick {
        self.no_activity_streak += 1;

        if !self.generation_started {
            if self.no_activity_streak >= NEVER_STARTED_IDLE_POLLS {
                self.finished = true;
                return Tick {
                    event: None,
                    stop: Some(StopReason::NeverStarted),
                };
            }
            return Tick::default();
        }

        let done = match self.phase {
            Some(Phase::VaeDecode) => true,
            Some(Phase::Sampling | Phase::Postprocessing) => {
                self.no_activity_streak >= PHASE_IDLE_POLLS
            }
            _ if self.decode_seen => self.no_activity_streak >= PHASE_IDLE_POLLS,
            _ => self.no_activity_streak >= FALLBACK_IDLE_POLLS,
        };

        if !done {
            return Tick::default();
        }

        self.finished = true;
        Tick {
            event: Some(self.complete()),
            stop: Some(StopReason::Completed),
        }
    }

    fn complete(&mut self) -> ProgressEvent {
        self.completed_emitted = true;
        self.phase = Some(Phase::Completed);
        ProgressEvent::completed(self.last_status.clone(), self.last_total)
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// State of the current polling run.
struct PollRun {
    cancel: CancellationToken,
    tracker: Arc<Mutex<PhaseTracker>>,
}

/// Progress monitor backed by `GET {base}/progress`.
pub struct PollingProgressMonitor {
    api: Arc<SdApi>,
    config: PollingConfig,
    registry: Arc<HandlerRegistry>,
    gate: Arc<DispatchGate>,
    run: Mutex<Option<PollRun>>,
    connected: AtomicBool,
}

impl PollingProgressMonitor {
    pub fn new(api: Arc<SdApi>, config: PollingConfig) -> Self {
        Self {
            api,
            config,
            registry: HandlerRegistry::new(),
            gate: Arc::new(DispatchGate::new(())),
            run: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Begin a fresh run for `job_id`, replacing any previous run without
    /// completing it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_polling(&self, job_id: Option<&str>) {
        let cancel = CancellationToken::new();
        let tracker = Arc::new(Mutex::new(PhaseTracker::new()));

        let previous = self.run.lock().replace(PollRun {
            cancel: cancel.clone(),
            tracker: Arc::clone(&tracker),
        });
        if let Some(previous) = previous {
            self.end_run(previous, false);
        }
        self.connected.store(true, Ordering::SeqCst);

        let ctx = TickContext {
            api: Arc::clone(&self.api),
            registry: Arc::clone(&self.registry),
            gate: Arc::clone(&self.gate),
            tracker,
            cancel,
        };
        let interval = self.config.interval;
        let job_id = job_id.map(str::to_owned);

        tracing::debug!(job_id = ?job_id, "Progress polling started");
        tokio::spawn(async move {
            poll_loop(ctx, interval, job_id).await;
        });
    }

    /// End the current run.
    ///
    /// With `force_complete`, a `completed` event is dispatched before this
    /// returns unless the run already emitted one. No event from the run is
    /// dispatched after this returns.
    pub fn stop_polling(&self, force_complete: bool) {
        let run = self.run.lock().take();
        if let Some(run) = run {
            self.end_run(run, force_complete);
        }
    }

    /// Whether a run is in progress (started and not yet finished).
    pub fn is_polling(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .is_some_and(|run| !run.tracker.lock().is_finished())
    }

    fn end_run(&self, run: PollRun, force_complete: bool) {
        run.cancel.cancel();
        // The tick task checks the token while holding the gate, so once it
        // is held here no further tick can dispatch.
        let _gate = self.gate.lock();
        let event = {
            let mut tracker = run.tracker.lock();
            if force_complete {
                tracker.force_complete()
            } else {
                tracker.stop();
                None
            }
        };
        if let Some(event) = event {
            tracing::debug!("Progress polling force-completed");
            self.registry.dispatch(&event);
        }
    }
}

#[async_trait]
impl ProgressMonitor for PollingProgressMonitor {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn probe(&self) -> MonitorCapability {
        match self.api.fetch_progress_within(self.config.probe_timeout).await {
            Ok(_) => MonitorCapability::SUPPORTED,
            Err(e) => {
                tracing::debug!(error = %e, "Progress endpoint probe failed");
                MonitorCapability::UNSUPPORTED
            }
        }
    }

    async fn connect(&self) -> Result<(), MonitorError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.stop_polling(false);
        self.registry.clear();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn subscribe(&self, handler: ProgressHandler) -> Subscription {
        self.registry.subscribe(handler)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Everything a tick task needs for one polling run.
struct TickContext {
    api: Arc<SdApi>,
    registry: Arc<HandlerRegistry>,
    gate: Arc<DispatchGate>,
    tracker: Arc<Mutex<PhaseTracker>>,
    cancel: CancellationToken,
}

impl TickContext {
    /// Feed one snapshot to the tracker and dispatch what it produced.
    ///
    /// Breaks with `None` when the run was cancelled, or with the reason
    /// the tracker finished the run.
    fn deliver(&self, snapshot: &ProgressSnapshot) -> ControlFlow<Option<StopReason>> {
        let _gate = self.gate.lock();
        let tick = {
            let mut tracker = self.tracker.lock();
            if self.cancel.is_cancelled() {
                return ControlFlow::Break(None);
            }
            tracker.observe(snapshot)
        };
        if let Some(event) = &tick.event {
            self.registry.dispatch(event);
        }
        match tick.stop {
            Some(reason) => ControlFlow::Break(Some(reason)),
            None => ControlFlow::Continue(()),
        }
    }
}

/// Tick task: fetch a snapshot, feed the tracker, dispatch, repeat.
async fn poll_loop(ctx: TickContext, interval: Duration, job_id: Option<String>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = ctx.api.fetch_progress(job_id.as_deref()) => result,
        };

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!(job_id = ?job_id, error = %e, "Progress poll failed");
                continue;
            }
        };

        match ctx.deliver(&snapshot) {
            ControlFlow::Continue(()) => {}
            ControlFlow::Break(None) => return,
            ControlFlow::Break(Some(reason)) => {
                tracing::debug!(job_id = ?job_id, ?reason, "Progress polling finished");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SnapshotState;

    fn active(job: &str, step: i64, steps: i64) -> ProgressSnapshot {
        ProgressSnapshot {
            state: SnapshotState {
                job: job.to_string(),
                job_count: 1,
                job_no: 0,
                sampling_step: step,
                sampling_steps: steps,
            },
            progress: if steps > 0 { step as f64 / steps as f64 } else { 0.0 },
            current_image: None,
            eta_relative: None,
        }
    }

    fn idle() -> ProgressSnapshot {
        ProgressSnapshot::default()
    }

    /// Feed a trace and collect every emitted event, stopping where the
    /// tracker says to stop.
    fn run_trace(tracker: &mut PhaseTracker, trace: &[ProgressSnapshot]) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        for snapshot in trace {
            let tick = tracker.observe(snapshot);
            events.extend(tick.event);
            if tick.stop.is_some() {
                break;
            }
        }
        events
    }

    fn completed_count(events: &[ProgressEvent]) -> usize {
        events.iter().filter(|e| e.is_completed()).count()
    }

    // -- phase classification -------------------------------------------------

    #[test]
    fn sampling_then_decode_by_step_count() {
        let mut tracker = PhaseTracker::new();
        let events = run_trace(
            &mut tracker,
            &[active("txt2img", 5, 20), active("txt2img", 20, 20)],
        );

        assert_eq!(events[0].phase, Phase::Sampling);
        assert_eq!(events[1].phase, Phase::VaeDecode);
    }

    #[test]
    fn decode_inference_holds_on_repeated_final_step() {
        let mut tracker = PhaseTracker::new();
        run_trace(
            &mut tracker,
            &[active("txt2img", 19, 20), active("txt2img", 20, 20)],
        );
        let tick = tracker.observe(&active("txt2img", 20, 20));
        assert!(tick.event.is_none());
        assert_eq!(tracker.phase(), Some(Phase::VaeDecode));
    }

    #[test]
    fn phase_from_job_name() {
        let mut tracker = PhaseTracker::new();
        let events = run_trace(
            &mut tracker,
            &[
                active("postprocess upscale", 0, 0),
                active("VAE decode", 0, 0),
            ],
        );
        assert_eq!(events[0].phase, Phase::Postprocessing);
        assert_eq!(events[1].phase, Phase::VaeDecode);
    }

    #[test]
    fn unknown_phase_holds_previous() {
        let mut tracker = PhaseTracker::new();
        run_trace(&mut tracker, &[active("txt2img", 3, 20)]);
        let tick = tracker.observe(&active("queued", 0, 0));
        assert_eq!(tick.event.unwrap().phase, Phase::Sampling);
    }

    #[test]
    fn first_unclassified_snapshot_is_waiting() {
        let mut tracker = PhaseTracker::new();
        let tick = tracker.observe(&active("", 0, 0).with_progress(0.1));
        assert_eq!(tick.event.unwrap().phase, Phase::Waiting);
        assert!(tracker.generation_started());
    }

    // -- de-duplication ---------------------------------------------------------

    #[test]
    fn identical_snapshots_emit_once() {
        let mut tracker = PhaseTracker::new();
        let events = run_trace(
            &mut tracker,
            &[
                active("txt2img", 4, 20),
                active("txt2img", 4, 20),
                active("txt2img", 4, 20),
                active("txt2img", 5, 20),
            ],
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn no_two_consecutive_events_are_identical() {
        let mut tracker = PhaseTracker::new();
        let trace: Vec<_> = [1, 1, 2, 2, 2, 3, 20, 20]
            .iter()
            .map(|&step| active("txt2img", step, 20))
            .chain([idle(), idle()])
            .collect();
        let events = run_trace(&mut tracker, &trace);

        for pair in events.windows(2) {
            let a = (&pair[0].current, &pair[0].status, pair[0].phase);
            let b = (&pair[1].current, &pair[1].status, pair[1].phase);
            assert_ne!(a, b);
        }
    }

    // -- completion -------------------------------------------------------------

    #[test]
    fn sampling_decode_then_idle_completes_exactly_once() {
        let mut tracker = PhaseTracker::new();
        let events = run_trace(
            &mut tracker,
            &[
                active("txt2img", 10, 20),
                active("txt2img", 20, 20),
                idle(),
                idle(),
            ],
        );

        assert_eq!(completed_count(&events), 1);
        assert!(events.last().unwrap().is_completed());
        assert_eq!(events.last().unwrap().current, 20);

        assert_eq!(tracker.observe(&idle()), Tick::default());
        assert_eq!(tracker.force_complete(), None);
    }

    #[test]
    fn decode_completes_on_first_idle_poll() {
        let mut tracker = PhaseTracker::new();
        run_trace(&mut tracker, &[active("VAE decode", 0, 0)]);
        let tick = tracker.observe(&idle());
        assert_eq!(tick.stop, Some(StopReason::Completed));
        assert!(tick.event.unwrap().is_completed());
    }

    #[test]
    fn sampling_needs_two_idle_polls() {
        let mut tracker = PhaseTracker::new();
        run_trace(&mut tracker, &[active("txt2img", 7, 20)]);
        assert_eq!(tracker.observe(&idle()), Tick::default());
        assert_eq!(tracker.observe(&idle()).stop, Some(StopReason::Completed));
    }

    #[test]
    fn activity_resets_idle_streak() {
        let mut tracker = PhaseTracker::new();
        run_trace(&mut tracker, &[active("txt2img", 7, 20)]);
        tracker.observe(&idle());
        tracker.observe(&active("txt2img", 8, 20));
        assert_eq!(tracker.observe(&idle()), Tick::default());
    }

    #[test]
    fn unobserved_phases_fall_back_to_four_idle_polls() {
        let mut tracker = PhaseTracker::new();
        run_trace(&mut tracker, &[active("", 0, 0).with_progress(0.5)]);
        for _ in 0..3 {
            assert!(tracker.observe(&idle()).stop.is_none());
        }
        assert_eq!(tracker.observe(&idle()).stop, Some(StopReason::Completed));
    }

    #[test]
    fn never_started_gives_up_silently_after_ten() {
        let mut tracker = PhaseTracker::new();
        for _ in 0..9 {
            assert_eq!(tracker.observe(&idle()), Tick::default());
        }
        let tick = tracker.observe(&idle());
        assert_eq!(tick.stop, Some(StopReason::NeverStarted));
        assert!(tick.event.is_none());
        assert!(!tracker.completed_emitted());
    }

    // -- forced completion ------------------------------------------------------

    #[test]
    fn force_complete_emits_once() {
        let mut tracker = PhaseTracker::new();
        run_trace(&mut tracker, &[active("txt2img", 3, 20)]);

        let event = tracker.force_complete().unwrap();
        assert!(event.is_completed());
        assert_eq!(event.total, 20);
        assert_eq!(tracker.force_complete(), None);
        assert_eq!(tracker.observe(&active("txt2img", 4, 20)), Tick::default());
    }

    #[test]
    fn force_complete_after_give_up_still_emits() {
        let mut tracker = PhaseTracker::new();
        for _ in 0..NEVER_STARTED_IDLE_POLLS {
            tracker.observe(&idle());
        }
        assert!(tracker.force_complete().is_some());
    }

    impl ProgressSnapshot {
        fn with_progress(mut self, progress: f64) -> Self {
            self.progress = progress;
            self
        }
    }
}
