//! ==============================================================================
//! controller.rs - per-device polling state machine
//! ==============================================================================
//!
//! purpose:
//!     one PollingController per configured device, each on its own tokio task.
//!     controllers share nothing but the bus lock directory, the sink and the
//!     collaborators.
//!
//! lifecycle:
//! ```text
//!     Initializing -> Running <-> PausedForReconfig -> Stopping -> Stopped
//!
//!     - Initializing: `new()` parses the device kind; an unknown kind fails
//!       here and the controller never runs.
//!     - Running: fixed tick (100ms by default). per tick:
//!         1. apply pending reconfiguration requests
//!         2. periodic devices: on deadline, mark the measurement due
//!         3. switch the pre-action relay on and wait out its window
//!         4. acquire a sample, write it to the sink, mark rules eligible
//!         5. evaluate rules whose period elapsed or that are marked eligible
//!         6. clear the eligibility flag
//!     - PausedForReconfig: the loop is between ticks, so nothing is reading
//!       the old table on this task. the new table is swapped in whole and
//!       the requester is acknowledged with the new version.
//!     - Stopping: checked at the top of every tick. releases the device,
//!       stops the edge watcher, reports Stopped.
//!     - a panic inside a tick ends the task; dropping the controller still
//!       publishes Stopped so `ControllerHandle::stop` never hangs on it.
//! ```
//!
//! not awaited on stop:
//! ```text
//!     firings already handed to the dispatcher keep running on their own
//!     tasks. cleanup is best-effort; see DESIGN.md.
//! ```
//!
//! ==============================================================================

use crate::actions::{ActionDispatcher, Collaborators};
use crate::config::DeviceConfig;
use crate::edge::EdgeDetectionHandler;
use crate::engine::{Firing, RuleEvaluator};
use crate::error::{is_exhaustion_io, AcquisitionError, ControllerError, LockError, TickError};
use crate::hal::HardwareProvider;
use crate::lock::LockManager;
use crate::ratelimit::NotificationRateLimiter;
use crate::rules::{ConditionalRule, RelayState, RuleTable, RuleTableHandle};
use crate::sensor::{FailureTracker, MeasurementSource, Sample, SensorDriver, ESCALATE_AFTER};
use crate::sink::{points_for, SampleSink};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const FIRING_CHANNEL: usize = 64;
const RECONFIG_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Initializing,
    Running,
    PausedForReconfig,
    Stopping,
    Stopped,
}

/// shared services every controller is built from
#[derive(Clone)]
pub struct ControllerDeps {
    pub hal: Arc<dyn HardwareProvider>,
    pub locks: Arc<LockManager>,
    pub sink: Arc<dyn SampleSink>,
    pub collaborators: Collaborators,
    pub hourly_max: u32,
    pub tick: Duration,
}

struct ReconfigRequest {
    rules: Vec<ConditionalRule>,
    ack: oneshot::Sender<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Telemetry {
    pub samples: u64,
    pub consecutive_failures: u32,
    pub escalations: u64,
    pub last_sample: Option<Sample>,
}

/// what the status api reports for one controller
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub device_id: String,
    pub name: String,
    pub kind: String,
    pub state: ControllerState,
    pub rules_version: u64,
    pub rules: usize,
    #[serde(flatten)]
    pub telemetry: Telemetry,
}

pub struct PollingController {
    device: DeviceConfig,
    source: MeasurementSource,
    deps: ControllerDeps,
    rules: Arc<RuleTableHandle>,
    evaluator: Arc<RuleEvaluator>,
    tracker: FailureTracker,
    telemetry: Arc<Mutex<Telemetry>>,
    state: watch::Sender<ControllerState>,
    next_measurement: Instant,
    measurement_due: bool,
    rules_eligible: bool,
    pre_relay_until: Option<Instant>,
}

impl PollingController {
    pub fn new(device: DeviceConfig, deps: ControllerDeps) -> Result<Self, ControllerError> {
        let source = MeasurementSource::from_config(&device, deps.hal.clone(), deps.locks.clone())?;
        let input_pin = match source.driver() {
            SensorDriver::Edge { pin, .. } => Some(*pin),
            _ => None,
        };

        let limiter = Arc::new(NotificationRateLimiter::new(deps.hourly_max));
        let dispatcher = Arc::new(ActionDispatcher::new(deps.collaborators.clone(), limiter));
        let (firings, _) = broadcast::channel(FIRING_CHANNEL);
        let evaluator = Arc::new(RuleEvaluator::new(
            &device,
            input_pin,
            deps.sink.clone(),
            deps.hal.clone(),
            dispatcher,
            firings,
        ));
        let rules = Arc::new(RuleTableHandle::new(device.rules.clone()));
        let now = Instant::now();
        evaluator.adopt(&rules.snapshot(), now);
        let (state, _) = watch::channel(ControllerState::Initializing);

        tracing::info!(
            device = %device.id,
            kind = %device.kind,
            period_secs = device.period_secs,
            rules = device.rules.len(),
            "controller initialized"
        );

        Ok(Self {
            device,
            source,
            deps,
            rules,
            evaluator,
            tracker: FailureTracker::default(),
            telemetry: Arc::new(Mutex::new(Telemetry::default())),
            state,
            next_measurement: now,
            measurement_due: false,
            rules_eligible: false,
            pre_relay_until: None,
        })
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    /// start the tick loop (and the edge watcher for edge devices)
    pub fn spawn(self) -> Result<ControllerHandle, ControllerError> {
        let (requests_tx, requests) = mpsc::channel(RECONFIG_QUEUE);
        let (stop_tx, stop) = watch::channel(false);

        let edge = match self.source.driver() {
            SensorDriver::Edge { pin, edge } => {
                let events = self
                    .deps
                    .hal
                    .watch_edges(*pin, edge.edge, Duration::from_millis(edge.bounce_ms))
                    .map_err(|e| ControllerError::EdgeSetup(self.device.id.clone(), format!("{e:#}")))?;
                let handler = EdgeDetectionHandler::new(
                    &self.device.id,
                    edge,
                    self.deps.sink.clone(),
                    self.evaluator.clone(),
                    self.rules.clone(),
                );
                let (edge_stop_tx, edge_stop) = watch::channel(false);
                Some((edge_stop_tx, handler.spawn(events, edge_stop)))
            }
            _ => None,
        };

        let handle = ControllerHandle {
            device_id: self.device.id.clone(),
            name: self.device.display_name().to_string(),
            kind: self.device.kind.clone(),
            requests: requests_tx,
            stop: Arc::new(stop_tx),
            state: self.state.subscribe(),
            rules: self.rules.clone(),
            evaluator: self.evaluator.clone(),
            telemetry: self.telemetry.clone(),
        };
        tokio::spawn(self.run(requests, stop, edge));
        Ok(handle)
    }

    fn set_state(&self, state: ControllerState) {
        tracing::debug!(device = %self.device.id, ?state, "controller state");
        self.state.send_replace(state);
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<ReconfigRequest>,
        mut stop: watch::Receiver<bool>,
        edge: Option<(watch::Sender<bool>, JoinHandle<()>)>,
    ) {
        self.set_state(ControllerState::Running);
        let tick = self.deps.tick;

        loop {
            if *stop.borrow() {
                break;
            }

            // step 1
            while let Ok(request) = requests.try_recv() {
                self.apply_reconfig(request);
            }

            match self.tick(Instant::now()).await {
                Ok(()) => {}
                Err(e @ TickError::ResourceExhausted(_)) => {
                    tracing::error!(device = %self.device.id, "{e}, stopping controller");
                    break;
                }
                Err(TickError::Sink(e)) => {
                    tracing::error!(device = %self.device.id, "failed to store sample, skipping iteration: {e}");
                }
            }
            // step 6
            self.rules_eligible = false;

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_state(ControllerState::Stopping);
        self.source.stop();
        if let Some((edge_stop, task)) = edge {
            let _ = edge_stop.send(true);
            if let Err(e) = task.await {
                tracing::warn!(device = %self.device.id, "edge watcher ended abnormally: {e}");
            }
        }
        self.set_state(ControllerState::Stopped);
        tracing::info!(device = %self.device.id, "controller stopped");
    }

    fn apply_reconfig(&mut self, request: ReconfigRequest) {
        self.set_state(ControllerState::PausedForReconfig);
        let table = self.rules.replace(request.rules);
        self.evaluator.adopt(&table, Instant::now());
        tracing::info!(
            device = %self.device.id,
            version = table.version,
            rules = table.len(),
            "rule table replaced"
        );
        // requester may have given up waiting
        let _ = request.ack.send(table.version);
        self.set_state(ControllerState::Running);
    }

    async fn tick(&mut self, now: Instant) -> Result<(), TickError> {
        let table: Arc<RuleTable> = self.rules.snapshot();

        if self.source.driver().is_edge() {
            // acquisition is interrupt driven; only state rules run on cadence
            self.evaluator.evaluate_due(&table, now, false).await;
            return Ok(());
        }

        // step 2
        if now >= self.next_measurement && !self.measurement_due {
            self.measurement_due = true;
            self.next_measurement = now + self.device.period();

            // step 3
            if let Some((relay_id, duration)) = self.device.pre_relay() {
                let relays = self.deps.collaborators.relays.clone();
                let (relay_id, device_id) = (relay_id.to_string(), self.device.id.clone());
                tokio::spawn(async move {
                    if let Err(e) = relays.on_off(&relay_id, RelayState::On, Some(duration)).await {
                        tracing::warn!(device = %device_id, relay = %relay_id, "pre-action relay failed: {e}");
                    }
                });
                self.pre_relay_until = Some(now + duration);
            }
        }

        // steps 3 and 4
        if self.measurement_due && self.pre_relay_until.map_or(true, |until| now >= until) {
            self.measurement_due = false;
            self.pre_relay_until = None;
            self.rules_eligible = true;
            self.acquire().await?;
        }

        // step 5
        self.evaluator.evaluate_due(&table, now, self.rules_eligible).await;
        Ok(())
    }

    async fn acquire(&mut self) -> Result<(), TickError> {
        match self.source.next().await {
            Ok(sample) => {
                self.tracker.record_success();
                self.evaluator.record_sample(&sample);
                self.update_telemetry(Some(sample.clone()));
                self.deps.sink.write(&points_for(&self.device.id, &sample)).await?;
                Ok(())
            }
            Err(AcquisitionError::Lock(LockError::Io { resource, source })) if is_exhaustion_io(&source) => {
                Err(TickError::ResourceExhausted(format!("lock {resource}: {source}")))
            }
            Err(AcquisitionError::Lock(e)) => {
                tracing::warn!(device = %self.device.id, "bus lock unavailable, acquisition aborted: {e}");
                Ok(())
            }
            Err(e) => {
                if self.tracker.record_failure() {
                    tracing::warn!(
                        device = %self.device.id,
                        consecutive = ESCALATE_AFTER,
                        "acquisition keeps failing: {e}"
                    );
                } else {
                    tracing::debug!(
                        device = %self.device.id,
                        consecutive = self.tracker.consecutive(),
                        "acquisition failed: {e}"
                    );
                }
                self.update_telemetry(None);
                Ok(())
            }
        }
    }

    fn update_telemetry(&self, sample: Option<Sample>) {
        if let Ok(mut t) = self.telemetry.lock() {
            t.consecutive_failures = self.tracker.consecutive();
            t.escalations = self.tracker.escalations();
            if let Some(sample) = sample {
                t.samples += 1;
                t.last_sample = Some(sample);
            }
        }
    }
}

/// publishes Stopped however the loop ends, unwinding included
impl Drop for PollingController {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!(device = %self.device.id, "controller loop panicked, stopping");
            self.source.stop();
        }
        self.state.send_if_modified(|state| {
            let changed = *state != ControllerState::Stopped;
            *state = ControllerState::Stopped;
            changed
        });
    }
}

/// control surface of a spawned controller
#[derive(Clone)]
pub struct ControllerHandle {
    device_id: String,
    name: String,
    kind: String,
    requests: mpsc::Sender<ReconfigRequest>,
    stop: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ControllerState>,
    rules: Arc<RuleTableHandle>,
    evaluator: Arc<RuleEvaluator>,
    telemetry: Arc<Mutex<Telemetry>>,
}

impl ControllerHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn rules(&self) -> Arc<RuleTable> {
        self.rules.snapshot()
    }

    pub fn subscribe_firings(&self) -> broadcast::Receiver<Firing> {
        self.evaluator.subscribe()
    }

    pub fn status(&self) -> ControllerStatus {
        let table = self.rules.snapshot();
        ControllerStatus {
            device_id: self.device_id.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            state: self.state(),
            rules_version: table.version,
            rules: table.len(),
            telemetry: self.telemetry.lock().map(|t| t.clone()).unwrap_or_default(),
        }
    }

    /// swap in a new rule table. resolves with the new version once the
    /// loop has applied it.
    pub async fn reconfigure(&self, rules: Vec<ConditionalRule>) -> Result<u64, ControllerError> {
        let (ack, applied) = oneshot::channel();
        self.requests
            .send(ReconfigRequest { rules, ack })
            .await
            .map_err(|_| ControllerError::NotRunning)?;
        applied.await.map_err(|_| ControllerError::NotRunning)
    }

    /// request a cooperative stop and wait until the loop reports Stopped
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        let mut state = self.state.clone();
        // the loop publishes Stopped before dropping the sender
        let _ = state.wait_for(|s| *s == ControllerState::Stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Recorder;
    use crate::config::LockConfig;
    use crate::hal::MockHal;
    use crate::sink::MemorySink;

    struct Rig {
        hal: Arc<MockHal>,
        sink: Arc<MemorySink>,
        recorder: Arc<Recorder>,
        deps: ControllerDeps,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let hal = Arc::new(MockHal::new());
        let sink = Arc::new(MemorySink::new());
        let recorder = Recorder::new();
        let locks = Arc::new(
            LockManager::new(&LockConfig { dir: dir.path().to_path_buf(), ..LockConfig::default() })
                .unwrap(),
        );
        let deps = ControllerDeps {
            hal: hal.clone(),
            locks,
            sink: sink.clone(),
            collaborators: recorder.collaborators(),
            hourly_max: 2,
            tick: Duration::from_millis(100),
        };
        Rig { hal, sink, recorder, deps, _dir: dir }
    }

    fn dht(extra: &str) -> DeviceConfig {
        toml::from_str(&format!(
            r#"
id = "greenhouse"
kind = "dht22"
location = "4"
period_secs = 10.0
{extra}
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_before_running() {
        let rig = rig();
        let mut device = dht("");
        device.kind = "tricorder".into();
        let err = PollingController::new(device, rig.deps).err().unwrap();
        assert!(matches!(err, ControllerError::UnknownDeviceKind(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions() {
        let rig = rig();
        let controller = PollingController::new(dht(""), rig.deps).unwrap();
        assert_eq!(controller.state(), ControllerState::Initializing);
        let handle = controller.spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(handle.state(), ControllerState::Running);
        handle.stop().await;
        assert_eq!(handle.state(), ControllerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_loop_still_reports_stopped() {
        let rig = rig();
        // bypasses validate(); the first deadline overflows Instant
        let device = DeviceConfig { period_secs: 1.8e19, ..dht("") };
        let handle = PollingController::new(device, rig.deps.clone()).unwrap().spawn().unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.state(), ControllerState::Stopped);
        assert!(rig.sink.history("greenhouse", "temperature").is_empty());
        handle.stop().await;
        assert!(matches!(handle.reconfigure(Vec::new()).await, Err(ControllerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_dropped_controller_is_stopped() {
        let rig = rig();
        let controller = PollingController::new(dht(""), rig.deps).unwrap();
        let mut state = controller.state.subscribe();
        drop(controller);
        assert_eq!(*state.borrow_and_update(), ControllerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_on_period() {
        let rig = rig();
        let handle = PollingController::new(dht(""), rig.deps.clone()).unwrap().spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(25_050)).await;
        handle.stop().await;
        // t = 0, 10, 20
        assert_eq!(rig.sink.history("greenhouse", "temperature").len(), 3);
        assert_eq!(handle.status().telemetry.samples, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_relay_window_delays_acquisition() {
        let rig = rig();
        let device = dht("pre_relay_id = \"power\"\npre_relay_secs = 2.0");
        let handle = PollingController::new(device, rig.deps.clone()).unwrap().spawn().unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(rig.sink.history("greenhouse", "temperature").is_empty());
        assert_eq!(rig.recorder.calls(), vec!["relay power on 2s".to_string()]);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(rig.sink.history("greenhouse", "temperature").len(), 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_acknowledges_new_version() {
        let rig = rig();
        let handle = PollingController::new(dht(""), rig.deps).unwrap().spawn().unwrap();
        assert_eq!(handle.rules().version, 1);
        let rule: ConditionalRule = toml::from_str(
            r#"
id = "hot"
trigger = { type = "threshold", measurement = "temperature", direction = "above", setpoint = 30.0 }
"#,
        )
        .unwrap();
        let version = handle.reconfigure(vec![rule]).await.unwrap();
        assert_eq!(version, 2);
        assert!(handle.rules().get("hot").is_some());
        assert_eq!(handle.state(), ControllerState::Running);

        handle.stop().await;
        assert!(matches!(handle.reconfigure(Vec::new()).await, Err(ControllerError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failures_keep_loop_alive() {
        let rig = rig();
        rig.hal.set_default_dht22(None);
        let handle = PollingController::new(dht(""), rig.deps.clone()).unwrap().spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(25_050)).await;
        let status = handle.status();
        assert_eq!(status.state, ControllerState::Running);
        assert_eq!(status.telemetry.escalations, 1);
        assert_eq!(status.telemetry.consecutive_failures, 0);

        rig.hal.set_default_dht22(Some((21.0, 40.0)));
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(handle.status().telemetry.samples, 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_edge_device_registers_watch_and_releases_it() {
        let rig = rig();
        let device: DeviceConfig = toml::from_str(
            r#"
id = "door"
kind = "edge"
location = "27"
edge = { edge = "rising" }
"#,
        )
        .unwrap();
        let handle = PollingController::new(device, rig.deps.clone()).unwrap().spawn().unwrap();
        assert!(rig.hal.is_watching(27));
        assert!(rig.hal.inject_edge(27, true));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rig.sink.history("door", "edge"), vec![1.0]);

        handle.stop().await;
        assert!(!rig.hal.is_watching(27));
    }
}
