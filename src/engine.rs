// src/engine.rs
//! Background scan worker and the controller that owns it.
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::config::ScanConfig;
use crate::drivers::error::ScanError;
use crate::drivers::plan::{Direction, StepCursor};
use crate::drivers::source::SampleSource;
use crate::session::Session;
use crate::types::{ScanEvent, ScanState, StepSample};

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

const NO_JUMP: i64 = -1;

/// Runs scans on a worker thread. While a scan runs the worker owns the `Session`;
/// it is handed back when the worker exits.
pub struct ScanController {
    session: Option<Session>,
    worker: Option<JoinHandle<Session>>,
    enable: Arc<AtomicBool>,
    halted: Arc<AtomicBool>,
    pending_jump: Arc<AtomicI64>,
    /// Samples in the queue right now.
    queued: Arc<AtomicUsize>,
    sample_tx: SyncSender<StepSample>,
    sample_rx: Receiver<StepSample>,
    event_tx: Sender<ScanEvent>,
    event_rx: Receiver<ScanEvent>,
    scan_id: u64,
}

impl ScanController {
    pub fn new(session: Session) -> Self {
        Self::with_queue_capacity(session, DEFAULT_QUEUE_CAPACITY)
    }

    /// The sample queue is bounded; a full queue stalls the worker until the consumer drains it.
    pub fn with_queue_capacity(session: Session, capacity: usize) -> Self {
        let (sample_tx, sample_rx) = mpsc::sync_channel(capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel();
        Self {
            session: Some(session),
            worker: None,
            enable: Arc::new(AtomicBool::new(false)),
            halted: Arc::new(AtomicBool::new(false)),
            pending_jump: Arc::new(AtomicI64::new(NO_JUMP)),
            queued: Arc::new(AtomicUsize::new(0)),
            sample_tx,
            sample_rx,
            event_tx,
            event_rx,
            scan_id: 0,
        }
    }

    /// Stops any running scan, prepares the session for `scan` and starts a new worker.
    /// Returns the id stamped on every sample of the new scan.
    pub fn configure_and_start(&mut self, scan: ScanConfig) -> Result<u64, ScanError> {
        self.stop();
        let mut session = self.session.take().ok_or(ScanError::WorkerLost)?;
        let notes = match session.prepare_scan(&scan) {
            Ok(notes) => notes,
            Err(e) => {
                self.session = Some(session);
                return Err(e);
            }
        };
        for note in notes {
            self.event_tx.send(ScanEvent::Log(note)).ok();
        }

        self.scan_id += 1;
        self.enable.store(true, Ordering::SeqCst);
        self.halted.store(false, Ordering::SeqCst);
        self.pending_jump.store(NO_JUMP, Ordering::SeqCst);

        let worker = Worker {
            scan_id: self.scan_id,
            enable: Arc::clone(&self.enable),
            halted: Arc::clone(&self.halted),
            pending_jump: Arc::clone(&self.pending_jump),
            queued: Arc::clone(&self.queued),
            samples: self.sample_tx.clone(),
            events: self.event_tx.clone(),
        };
        info!(
            "scan {} started: {} points, {:?}, {:?}",
            self.scan_id,
            scan.plan.points(),
            scan.direction,
            scan.mode
        );
        self.worker = Some(thread::spawn(move || worker.run(session)));
        Ok(self.scan_id)
    }

    /// Clears the enable flag and blocks until the worker has exited.
    pub fn stop(&mut self) {
        self.enable.store(false, Ordering::SeqCst);
        let Some(handle) = self.worker.take() else {
            return;
        };
        match handle.join() {
            Ok(session) => {
                debug!("scan {} worker joined", self.scan_id);
                self.session = Some(session);
            }
            Err(_) => {
                error!("scan {} worker panicked; session lost", self.scan_id);
                self.event_tx
                    .send(ScanEvent::Error(ScanError::WorkerLost.to_string()))
                    .ok();
            }
        }
    }

    pub fn state(&self) -> ScanState {
        match &self.worker {
            _ if self.halted.load(Ordering::SeqCst) => ScanState::Halted,
            Some(handle) if !handle.is_finished() => ScanState::Scanning,
            _ => ScanState::Idle,
        }
    }

    pub fn scan_id(&self) -> u64 {
        self.scan_id
    }

    /// Moves the running scan to `step` (taken modulo the point count) before its next capture.
    pub fn jump_to(&self, step: usize) {
        let step = i64::try_from(step).unwrap_or(i64::MAX);
        self.pending_jump.store(step, Ordering::SeqCst);
    }

    pub fn drain_samples(&self) -> Vec<StepSample> {
        let samples: Vec<_> = self.sample_rx.try_iter().collect();
        self.queued.fetch_sub(samples.len(), Ordering::SeqCst);
        samples
    }

    pub fn drain_events(&self) -> Vec<ScanEvent> {
        self.event_rx.try_iter().collect()
    }

    /// True once the worker is gone and nothing is left in the sample queue.
    /// Polling this is how a consumer waits for "stopped and drained".
    pub fn is_stopped_and_drained(&self) -> bool {
        let worker_done = self.worker.as_ref().map_or(true, |h| h.is_finished());
        worker_done && self.queued.load(Ordering::SeqCst) == 0
    }

    /// The session, when no worker holds it.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }
}

impl SampleSource for ScanController {
    fn next_sample(&mut self) -> Result<Option<StepSample>, ScanError> {
        match self.sample_rx.try_recv() {
            Ok(sample) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(sample))
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shared flags and queue ends moved into the worker thread.
struct Worker {
    scan_id: u64,
    enable: Arc<AtomicBool>,
    halted: Arc<AtomicBool>,
    pending_jump: Arc<AtomicI64>,
    queued: Arc<AtomicUsize>,
    samples: SyncSender<StepSample>,
    events: Sender<ScanEvent>,
}

impl Worker {
    fn run(self, mut session: Session) -> Session {
        let scan = session.scan().clone();
        let mut cursor = StepCursor::new(scan.plan.steps, scan.direction);
        let interval = Duration::from_millis(scan.update_interval_ms);
        let mut last_notify = Instant::now();
        let mut last_step = None;

        while self.enable.load(Ordering::SeqCst) {
            let jump = self.pending_jump.swap(NO_JUMP, Ordering::SeqCst);
            if jump >= 0 && cursor.jump(jump as usize) {
                debug!("scan {} jumped to step {}", self.scan_id, cursor.index());
                session.reset_continuity();
            }

            let step = cursor.index();
            match session.capture_step(self.scan_id, step) {
                Ok(outcome) => {
                    for note in outcome.notes {
                        self.events.send(ScanEvent::Log(note)).ok();
                    }
                    if !self.publish(outcome.sample) {
                        break;
                    }
                    last_step = Some(step);
                }
                Err(e) => {
                    error!("scan {} step {}: {}", self.scan_id, step, e);
                    self.events
                        .send(ScanEvent::Error(format!("step {}: {}", step, e)))
                        .ok();
                }
            }

            let advance = cursor.advance();
            if advance.boundary && scan.halt_at_end {
                self.notify(last_step);
                self.events.send(ScanEvent::Halted { scan_id: self.scan_id }).ok();
                self.halted.store(true, Ordering::SeqCst);
                info!("scan {} halted at end of sweep", self.scan_id);
                break;
            }
            if advance.boundary && scan.direction != Direction::Alternating {
                session.reset_continuity();
            }
            if last_notify.elapsed() >= interval {
                self.notify(last_step);
                last_notify = Instant::now();
            }
        }
        debug!("scan {} worker exiting", self.scan_id);
        session
    }

    /// Queues a sample, waiting while the queue is full. False when the scan was stopped first.
    fn publish(&self, sample: StepSample) -> bool {
        // Counted before sending; the consumer decrements on receipt.
        self.queued.fetch_add(1, Ordering::SeqCst);
        let mut sample = sample;
        loop {
            match self.samples.try_send(sample) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) if self.enable.load(Ordering::SeqCst) => {
                    sample = back;
                    thread::sleep(Duration::from_millis(1));
                }
                Err(_) => {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return false;
                }
            }
        }
    }

    fn notify(&self, last_step: Option<usize>) {
        if let Some(step) = last_step {
            self.events
                .send(ScanEvent::DataReady {
                    scan_id: self.scan_id,
                    step,
                })
                .ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HardwareConfig;
    use crate::drivers::board::{NullBoard, ScriptedBoard};
    use crate::drivers::plan::{Spacing, SweepPlan};

    const MID: u32 = 32768;
    const QUARTER: u32 = 16384;

    fn controller(capacity: usize) -> ScanController {
        let board = ScriptedBoard::new(vec![(MID, QUARTER)]);
        let session = Session::connect(HardwareConfig::default(), Box::new(board)).unwrap();
        ScanController::with_queue_capacity(session, capacity)
    }

    fn scan(start: f64, stop: f64, steps: usize) -> ScanConfig {
        ScanConfig {
            plan: SweepPlan::new(start, stop, steps, Spacing::Linear).unwrap(),
            wait_ms: 0,
            update_interval_ms: 0,
            ..ScanConfig::default()
        }
    }

    fn wait_for(controller: &ScanController, state: ScanState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if controller.state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn collect(controller: &ScanController, count: usize) -> Vec<StepSample> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut out = Vec::new();
        while out.len() < count && Instant::now() < deadline {
            out.extend(controller.drain_samples());
            thread::sleep(Duration::from_millis(1));
        }
        out
    }

    #[test]
    fn halt_at_end_captures_one_traversal() {
        let mut controller = controller(16);
        let mut cfg = scan(10.0, 12.0, 2);
        cfg.halt_at_end = true;
        assert_eq!(controller.configure_and_start(cfg).unwrap(), 1);
        assert!(controller.session().is_none());
        assert!(wait_for(&controller, ScanState::Halted));

        let samples = controller.drain_samples();
        let steps: Vec<_> = samples.iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![0, 1, 2]);
        assert!(samples.iter().all(|s| s.scan_id == 1));

        let events = controller.drain_events();
        assert!(events.contains(&ScanEvent::Halted { scan_id: 1 }));
        assert!(events.contains(&ScanEvent::DataReady { scan_id: 1, step: 2 }));

        controller.stop();
        assert_eq!(controller.state(), ScanState::Halted);
        assert!(controller.session().is_some());
        assert!(controller.is_stopped_and_drained());
    }

    #[test]
    fn jump_moves_the_running_scan() {
        let mut controller = controller(1);
        let mut cfg = scan(10.0, 20.0, 10);
        cfg.halt_at_end = true;
        controller.configure_and_start(cfg).unwrap();
        // 18 wraps onto step 7 of 11
        controller.jump_to(18);

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut samples = Vec::new();
        while !controller.is_stopped_and_drained() && Instant::now() < deadline {
            samples.extend(controller.drain_samples());
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(controller.state(), ScanState::Halted);

        let steps: Vec<_> = samples.iter().map(|s| s.step).collect();
        // the one-slot queue holds back everything past step 1 until the jump lands
        let split = steps.len().checked_sub(4).expect("at least the tail after the jump");
        assert_eq!(&steps[split..], &[7, 8, 9, 10]);
        assert!([0, 1].starts_with(&steps[..split]), "{:?}", steps);
    }

    #[test]
    fn alternating_scan_bounces_and_stops_while_queue_is_full() {
        let mut controller = controller(6);
        let mut cfg = scan(10.0, 12.0, 2);
        cfg.direction = Direction::Alternating;
        controller.configure_and_start(cfg).unwrap();

        let samples = collect(&controller, 6);
        controller.stop();
        let steps: Vec<_> = samples.iter().take(6).map(|s| s.step).collect();
        assert_eq!(steps, vec![0, 1, 2, 1, 0, 1]);
        assert_eq!(controller.state(), ScanState::Idle);
        assert!(controller.session().is_some());
    }

    #[test]
    fn restart_stops_previous_worker_and_bumps_scan_id() {
        let mut controller = controller(4);
        assert_eq!(controller.configure_and_start(scan(10.0, 20.0, 10)).unwrap(), 1);
        assert_eq!(controller.configure_and_start(scan(10.0, 20.0, 10)).unwrap(), 2);

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen_second = false;
        while !seen_second && Instant::now() < deadline {
            seen_second = controller.drain_samples().iter().any(|s| s.scan_id == 2);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(seen_second);
        controller.stop();
        assert_eq!(controller.state(), ScanState::Idle);
    }

    #[test]
    fn synthesis_failure_is_reported_per_step() {
        let mut controller = controller(4);
        let mut cfg = scan(-2000.0, -1990.0, 1);
        cfg.halt_at_end = true;
        controller.configure_and_start(cfg).unwrap();
        assert!(wait_for(&controller, ScanState::Halted));
        controller.stop();

        assert!(controller.drain_samples().is_empty());
        let errors: Vec<_> = controller
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                ScanEvent::Error(msg) => Some(msg),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("step 0"));
    }

    #[test]
    fn invalid_plan_keeps_session() {
        let session = Session::offline(HardwareConfig::default()).unwrap();
        let mut controller = ScanController::new(session);
        let mut cfg = ScanConfig::default();
        cfg.plan.steps = 0;
        assert!(controller.configure_and_start(cfg).is_err());
        assert!(controller.session().is_some());
        assert_eq!(controller.state(), ScanState::Idle);
    }

    #[test]
    fn controller_feeds_a_pipeline() {
        let session = Session::connect(HardwareConfig::default(), Box::new(NullBoard)).unwrap();
        let mut controller = ScanController::new(session);
        let mut cfg = scan(1.0, 5.0, 4);
        cfg.halt_at_end = true;
        let plan = cfg.plan.clone();
        controller.configure_and_start(cfg).unwrap();
        assert!(wait_for(&controller, ScanState::Halted));

        let mut pipeline = crate::drivers::pipeline::TracePipeline::new(controller, plan).unwrap();
        assert_eq!(pipeline.pump_all().unwrap(), 5);
        assert!(pipeline.latest_trace().is_complete());
    }
}
