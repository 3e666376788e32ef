//! ==============================================================================
//! actions.rs - rule action dispatcher and its collaborators
//! ==============================================================================
//!
//! purpose:
//!     executes the action list of one firing. actions run in list order so a
//!     command's status and a capture's file can flow into the message and the
//!     email that follow; actuations (relay, controller, indicator) are spawned
//!     and never awaited, so a 30 second relay window does not hold up the rest
//!     of the list. one failing action never stops the ones after it.
//!
//! collaborators (traits, so the daemon and tests can plug in their own):
//!     - RelayControl: GpioRelays drives relay boards through the HAL.
//!     - ControllerControl: RegistryControllers tracks secondary controllers.
//!     - CameraCapture: CommandCamera shells out to a capture utility.
//!     - Mailer: LogMailer records the message; no transport is bundled.
//!     - Indicator: LogIndicator.
//!     - Recorder: records every call, for tests and dry runs.
//!
//! ==============================================================================

use crate::config::{CameraConfig, RelayConfig, SmtpConfig};
use crate::error::ActionError;
use crate::hal::HardwareProvider;
use crate::ratelimit::{Decision, NotificationRateLimiter};
use crate::rules::{Action, RelayState};
use crate::sensor::now_ms;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait RelayControl: Send + Sync {
    async fn on(&self, relay_id: &str) -> Result<(), ActionError> {
        self.on_off(relay_id, RelayState::On, None).await
    }

    /// with a duration, the relay is switched back off once it elapses
    async fn on_off(
        &self,
        relay_id: &str,
        state: RelayState,
        duration: Option<Duration>,
    ) -> Result<(), ActionError>;
}

#[async_trait]
pub trait ControllerControl: Send + Sync {
    async fn is_active(&self, kind: &str, id: &str) -> bool;
    async fn activate(&self, kind: &str, id: &str) -> Result<(), ActionError>;
    async fn deactivate(&self, kind: &str, id: &str) -> Result<(), ActionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Photo,
    Video,
}

#[async_trait]
pub trait CameraCapture: Send + Sync {
    /// returns the path of the written file
    async fn capture(
        &self,
        kind: CaptureKind,
        camera_id: &str,
        duration: Option<Duration>,
    ) -> Result<PathBuf, ActionError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<(CaptureKind, PathBuf)>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), ActionError>;
}

#[async_trait]
pub trait Indicator: Send + Sync {
    async fn flash(&self, indicator_id: &str, count: u32) -> Result<(), ActionError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub relays: Arc<dyn RelayControl>,
    pub controllers: Arc<dyn ControllerControl>,
    pub cameras: Arc<dyn CameraCapture>,
    pub mailer: Arc<dyn Mailer>,
    pub indicators: Arc<dyn Indicator>,
}

impl Collaborators {
    /// adapters backed by the host's own hardware and config
    pub fn from_host(
        hal: Arc<dyn HardwareProvider>,
        relays: &[RelayConfig],
        cameras: &[CameraConfig],
        smtp: &SmtpConfig,
    ) -> Self {
        Self {
            relays: Arc::new(GpioRelays::new(hal, relays)),
            controllers: Arc::new(RegistryControllers::default()),
            cameras: Arc::new(CommandCamera::new(cameras)),
            mailer: Arc::new(LogMailer::new(smtp.clone())),
            indicators: Arc::new(LogIndicator),
        }
    }
}

// ==============================================================================
// default adapters
// ==============================================================================

pub struct GpioRelays {
    hal: Arc<dyn HardwareProvider>,
    relays: HashMap<String, RelayConfig>,
}

impl GpioRelays {
    pub fn new(hal: Arc<dyn HardwareProvider>, relays: &[RelayConfig]) -> Self {
        Self {
            hal,
            relays: relays.iter().map(|r| (r.id.clone(), r.clone())).collect(),
        }
    }

    async fn drive(&self, relay: &RelayConfig, on: bool) -> Result<(), ActionError> {
        let level = on != relay.active_low;
        let (hal, pin) = (self.hal.clone(), relay.gpio_pin);
        tokio::task::spawn_blocking(move || hal.write_gpio(pin, level))
            .await
            .map_err(|e| ActionError::Actuator(format!("task join error: {e}")))?
            .map_err(|e| ActionError::Actuator(format!("relay {}: {e:#}", relay.id)))
    }
}

#[async_trait]
impl RelayControl for GpioRelays {
    async fn on_off(
        &self,
        relay_id: &str,
        state: RelayState,
        duration: Option<Duration>,
    ) -> Result<(), ActionError> {
        let relay = self
            .relays
            .get(relay_id)
            .ok_or_else(|| ActionError::UnknownTarget { kind: "relay", id: relay_id.to_string() })?;
        let on = state == RelayState::On;
        self.drive(relay, on).await?;
        tracing::info!(relay = relay_id, pin = relay.gpio_pin, on, "relay switched");

        if let (true, Some(duration)) = (on, duration) {
            tokio::time::sleep(duration).await;
            self.drive(relay, false).await?;
            tracing::info!(relay = relay_id, "relay window elapsed, switched off");
        }
        Ok(())
    }
}

/// in-process registry of secondary controllers (pid loops etc.)
#[derive(Default)]
pub struct RegistryControllers {
    active: Mutex<HashSet<(String, String)>>,
}

impl RegistryControllers {
    fn key(kind: &str, id: &str) -> (String, String) {
        (kind.to_string(), id.to_string())
    }
}

#[async_trait]
impl ControllerControl for RegistryControllers {
    async fn is_active(&self, kind: &str, id: &str) -> bool {
        self.active.lock().map(|a| a.contains(&Self::key(kind, id))).unwrap_or(false)
    }

    async fn activate(&self, kind: &str, id: &str) -> Result<(), ActionError> {
        self.active
            .lock()
            .map_err(|_| ActionError::Actuator("controller registry poisoned".to_string()))?
            .insert(Self::key(kind, id));
        tracing::info!(kind, id, "secondary controller activated");
        Ok(())
    }

    async fn deactivate(&self, kind: &str, id: &str) -> Result<(), ActionError> {
        self.active
            .lock()
            .map_err(|_| ActionError::Actuator("controller registry poisoned".to_string()))?
            .remove(&Self::key(kind, id));
        tracing::info!(kind, id, "secondary controller deactivated");
        Ok(())
    }
}

pub struct CommandCamera {
    cameras: HashMap<String, CameraConfig>,
}

impl CommandCamera {
    pub fn new(cameras: &[CameraConfig]) -> Self {
        Self { cameras: cameras.iter().map(|c| (c.id.clone(), c.clone())).collect() }
    }
}

#[async_trait]
impl CameraCapture for CommandCamera {
    async fn capture(
        &self,
        kind: CaptureKind,
        camera_id: &str,
        duration: Option<Duration>,
    ) -> Result<PathBuf, ActionError> {
        let camera = self
            .cameras
            .get(camera_id)
            .ok_or_else(|| ActionError::UnknownTarget { kind: "camera", id: camera_id.to_string() })?;
        tokio::fs::create_dir_all(&camera.output_dir)
            .await
            .map_err(|e| ActionError::Camera(format!("{}: {e}", camera.output_dir.display())))?;

        let (template, ext) = match kind {
            CaptureKind::Photo => (&camera.photo_command, "jpg"),
            CaptureKind::Video => (&camera.video_command, "h264"),
        };
        let output = camera.output_dir.join(format!("{camera_id}-{}.{ext}", now_ms()));
        let secs = duration.map(|d| d.as_secs()).unwrap_or(0);
        let command = template
            .replace("{output}", &output.display().to_string())
            .replace("{duration}", &secs.to_string());

        let status = run_shell(&command, COMMAND_TIMEOUT + duration.unwrap_or_default())
            .await
            .map_err(ActionError::Camera)?;
        if !status.success {
            return Err(ActionError::Camera(format!("'{command}' exited with {}", status.code)));
        }
        Ok(output)
    }
}

/// records outbound mail in the log. the smtp settings are kept so a real
/// transport can be dropped in behind the same trait.
pub struct LogMailer {
    smtp: SmtpConfig,
}

impl LogMailer {
    pub fn new(smtp: SmtpConfig) -> Self {
        Self { smtp }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), ActionError> {
        tracing::info!(
            host = %self.smtp.host,
            port = self.smtp.port,
            from = %self.smtp.from,
            to = %message.recipient,
            subject = %message.subject,
            attachment = ?message.attachment.as_ref().map(|(_, p)| p),
            "notification"
        );
        Ok(())
    }
}

pub struct LogIndicator;

#[async_trait]
impl Indicator for LogIndicator {
    async fn flash(&self, indicator_id: &str, count: u32) -> Result<(), ActionError> {
        tracing::info!(indicator = indicator_id, count, "flashing indicator");
        Ok(())
    }
}

/// records every collaborator call as a short line, e.g. `relay fan on 30s`
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<String>>,
    mail: Mutex<Vec<MailMessage>>,
    active: Mutex<HashSet<String>>,
    fail_relays: std::sync::atomic::AtomicBool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            relays: self.clone(),
            controllers: self.clone(),
            cameras: self.clone(),
            mailer: self.clone(),
            indicators: self.clone(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn mail(&self) -> Vec<MailMessage> {
        self.mail.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn set_relays_failing(&self, failing: bool) {
        self.fail_relays.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl RelayControl for Recorder {
    async fn on_off(
        &self,
        relay_id: &str,
        state: RelayState,
        duration: Option<Duration>,
    ) -> Result<(), ActionError> {
        if self.fail_relays.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ActionError::Actuator(format!("relay {relay_id} unreachable")));
        }
        let state = if state == RelayState::On { "on" } else { "off" };
        match duration {
            Some(d) => self.record(format!("relay {relay_id} {state} {}s", d.as_secs())),
            None => self.record(format!("relay {relay_id} {state}")),
        }
        Ok(())
    }
}

#[async_trait]
impl ControllerControl for Recorder {
    async fn is_active(&self, kind: &str, id: &str) -> bool {
        self.active.lock().map(|a| a.contains(&format!("{kind}/{id}"))).unwrap_or(false)
    }

    async fn activate(&self, kind: &str, id: &str) -> Result<(), ActionError> {
        if let Ok(mut active) = self.active.lock() {
            active.insert(format!("{kind}/{id}"));
        }
        self.record(format!("activate {kind} {id}"));
        Ok(())
    }

    async fn deactivate(&self, kind: &str, id: &str) -> Result<(), ActionError> {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&format!("{kind}/{id}"));
        }
        self.record(format!("deactivate {kind} {id}"));
        Ok(())
    }
}

#[async_trait]
impl CameraCapture for Recorder {
    async fn capture(
        &self,
        kind: CaptureKind,
        camera_id: &str,
        _duration: Option<Duration>,
    ) -> Result<PathBuf, ActionError> {
        let label = if kind == CaptureKind::Photo { "photo" } else { "video" };
        self.record(format!("{label} {camera_id}"));
        Ok(PathBuf::from(format!("/tmp/{camera_id}-{label}")))
    }
}

#[async_trait]
impl Mailer for Recorder {
    async fn send(&self, message: &MailMessage) -> Result<(), ActionError> {
        self.record(format!("mail {}", message.recipient));
        if let Ok(mut mail) = self.mail.lock() {
            mail.push(message.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl Indicator for Recorder {
    async fn flash(&self, indicator_id: &str, count: u32) -> Result<(), ActionError> {
        self.record(format!("flash {indicator_id} {count}"));
        Ok(())
    }
}

// ==============================================================================
// dispatcher
// ==============================================================================

/// what the action list may read about the firing
#[derive(Debug, Clone)]
pub struct FiringContext {
    pub device_id: String,
    pub location: String,
    pub rule_id: String,
    pub rule_name: String,
    pub rule_period: Duration,
    /// latest sample values, for ((measurement)) substitution
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub message: String,
    pub emails_sent: u32,
    pub emails_suppressed: u32,
    pub failures: Vec<String>,
}

pub struct ActionDispatcher {
    collaborators: Collaborators,
    limiter: Arc<NotificationRateLimiter>,
}

impl ActionDispatcher {
    pub fn new(collaborators: Collaborators, limiter: Arc<NotificationRateLimiter>) -> Self {
        Self { collaborators, limiter }
    }

    pub fn limiter(&self) -> &Arc<NotificationRateLimiter> {
        &self.limiter
    }

    /// run every action of one firing, appending to `message` as it goes
    pub async fn execute(
        &self,
        ctx: &FiringContext,
        actions: &[Action],
        message: String,
    ) -> DispatchReport {
        let mut report = DispatchReport { message, ..DispatchReport::default() };
        let mut attachment: Option<(CaptureKind, PathBuf)> = None;

        for (index, action) in actions.iter().enumerate() {
            let _ = write!(report.message, " Action {} ({}).", index + 1, action.label());
            if let Err(e) = self.run_one(ctx, action, &mut report, &mut attachment).await {
                tracing::warn!(
                    device = %ctx.device_id,
                    rule = %ctx.rule_id,
                    action = action.label(),
                    "action failed: {e}"
                );
                let _ = write!(report.message, " Failed: {e}.");
                report.failures.push(e.to_string());
            }
        }
        report
    }

    async fn run_one(
        &self,
        ctx: &FiringContext,
        action: &Action,
        report: &mut DispatchReport,
        attachment: &mut Option<(CaptureKind, PathBuf)>,
    ) -> Result<(), ActionError> {
        match action {
            Action::Relay { relay_id, state, duration_secs } => {
                let duration = duration_secs.filter(|s| *s > 0.0).map(Duration::from_secs_f64);
                let on = *state == RelayState::On;
                let _ = write!(report.message, " Turn relay {relay_id} {}", if on { "on" } else { "off" });
                if let (true, Some(d)) = (on, duration) {
                    let _ = write!(report.message, " for {} seconds", d.as_secs_f64());
                }
                report.message.push('.');

                let relays = self.collaborators.relays.clone();
                let (relay_id, state) = (relay_id.clone(), *state);
                let device = ctx.device_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = relays.on_off(&relay_id, state, duration).await {
                        tracing::warn!(device = %device, relay = %relay_id, "relay action failed: {e}");
                    }
                });
            }

            Action::Command { command } => {
                let command = substitute(command, ctx);
                let _ = write!(report.message, " Execute '{command}'");
                let status = run_shell(&command, COMMAND_TIMEOUT).await.map_err(ActionError::Command)?;
                let _ = write!(report.message, " (Status: {}", status.code);
                if !status.output.is_empty() {
                    let _ = write!(report.message, ", output: {}", status.output);
                }
                report.message.push_str(").");
                if !status.success {
                    return Err(ActionError::Command(format!("exited with {}", status.code)));
                }
            }

            Action::Photo { camera_id } => {
                let _ = write!(report.message, " Capturing photo with camera {camera_id}.");
                let path = self
                    .collaborators
                    .cameras
                    .capture(CaptureKind::Photo, camera_id, None)
                    .await?;
                *attachment = Some((CaptureKind::Photo, path));
            }

            Action::Video { camera_id, duration_secs } => {
                let duration = Duration::from_secs_f64(duration_secs.max(0.0));
                let _ = write!(report.message, " Capturing video with camera {camera_id}.");
                let path = self
                    .collaborators
                    .cameras
                    .capture(CaptureKind::Video, camera_id, Some(duration))
                    .await?;
                *attachment = Some((CaptureKind::Video, path));
            }

            Action::ActivateController { kind, controller_id } => {
                let _ = write!(report.message, " Activate {kind} {controller_id}.");
                let controllers = self.collaborators.controllers.clone();
                if controllers.is_active(kind, controller_id).await {
                    report.message.push_str(&format!(" Notice: {kind} is already active!"));
                } else {
                    let (kind, id) = (kind.clone(), controller_id.clone());
                    tokio::spawn(async move {
                        if let Err(e) = controllers.activate(&kind, &id).await {
                            tracing::warn!(kind = %kind, id = %id, "activation failed: {e}");
                        }
                    });
                }
            }

            Action::DeactivateController { kind, controller_id } => {
                let _ = write!(report.message, " Deactivate {kind} {controller_id}.");
                let controllers = self.collaborators.controllers.clone();
                if !controllers.is_active(kind, controller_id).await {
                    report.message.push_str(&format!(" Notice: {kind} is already inactive!"));
                } else {
                    let (kind, id) = (kind.clone(), controller_id.clone());
                    tokio::spawn(async move {
                        if let Err(e) = controllers.deactivate(&kind, &id).await {
                            tracing::warn!(kind = %kind, id = %id, "deactivation failed: {e}");
                        }
                    });
                }
            }

            Action::Email { recipient } => match self.limiter.check(&ctx.rule_id, Instant::now()) {
                Decision::Send => {
                    let _ = write!(report.message, " Notify {recipient}.");
                    match attachment {
                        Some((CaptureKind::Photo, _)) => report.message.push_str(" Photo attached to email."),
                        Some((CaptureKind::Video, _)) => report.message.push_str(" Video attached to email."),
                        None => {}
                    }
                    let mail = MailMessage {
                        recipient: recipient.clone(),
                        subject: format!("[sensor-host] {} ({})", ctx.rule_name, ctx.device_id),
                        body: report.message.clone(),
                        attachment: attachment.clone(),
                    };
                    self.collaborators.mailer.send(&mail).await?;
                    report.emails_sent += 1;
                }
                Decision::Suppress { wait } => {
                    let _ = write!(report.message, " Email suppressed, next allowed in {}s.", wait.as_secs());
                    report.emails_suppressed += 1;
                }
            },

            Action::FlashIndicator { indicator_id, count } => {
                let _ = write!(report.message, " Flashing indicator {indicator_id}.");
                let indicators = self.collaborators.indicators.clone();
                let (id, count) = (indicator_id.clone(), *count);
                tokio::spawn(async move {
                    if let Err(e) = indicators.flash(&id, count).await {
                        tracing::warn!(indicator = %id, "flash failed: {e}");
                    }
                });
            }
        }
        Ok(())
    }
}

/// replace ((measurement)), ((location)) and ((period)) with current values
pub fn substitute(template: &str, ctx: &FiringContext) -> String {
    let mut out = template.to_string();
    for (measurement, value) in &ctx.values {
        out = out.replace(&format!("(({measurement}))"), &value.to_string());
    }
    out.replace("((location))", &ctx.location)
        .replace("((period))", &ctx.rule_period.as_secs_f64().to_string())
}

struct ShellStatus {
    success: bool,
    code: String,
    output: String,
}

async fn run_shell(command: &str, timeout: Duration) -> Result<ShellStatus, String> {
    let output = tokio::time::timeout(
        timeout,
        tokio::process::Command::new("sh").arg("-c").arg(command).output(),
    )
    .await
    .map_err(|_| format!("'{command}' timed out after {timeout:?}"))?
    .map_err(|e| format!("failed to spawn '{command}': {e}"))?;

    let code = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    Ok(ShellStatus {
        success: output.status.success(),
        code,
        output: String::from_utf8_lossy(&output.stdout).trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockHal;

    fn ctx() -> FiringContext {
        FiringContext {
            device_id: "greenhouse".into(),
            location: "4".into(),
            rule_id: "hot".into(),
            rule_name: "too hot".into(),
            rule_period: Duration::from_secs(60),
            values: BTreeMap::from([("temperature".to_string(), 31.5)]),
        }
    }

    fn dispatcher(recorder: &Arc<Recorder>, hourly_max: u32) -> ActionDispatcher {
        ActionDispatcher::new(
            recorder.collaborators(),
            Arc::new(NotificationRateLimiter::new(hourly_max)),
        )
    }

    #[test]
    fn test_substitute_placeholders() {
        let out = substitute("notify ((temperature)) at ((location)) every ((period)) ((humidity))", &ctx());
        assert_eq!(out, "notify 31.5 at 4 every 60 ((humidity))");
    }

    #[tokio::test]
    async fn test_command_output_appended() {
        let recorder = Recorder::new();
        let report = dispatcher(&recorder, 2)
            .execute(&ctx(), &[Action::Command { command: "echo ((temperature))".into() }], "[rule]".into())
            .await;
        assert!(report.message.contains("Execute 'echo 31.5'"));
        assert!(report.message.contains("(Status: 0, output: 31.5)."));
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_actions() {
        let recorder = Recorder::new();
        let actions = vec![
            Action::Command { command: "exit 4".into() },
            Action::Photo { camera_id: "cam0".into() },
            Action::Email { recipient: "me@example.com".into() },
        ];
        let report = dispatcher(&recorder, 2).execute(&ctx(), &actions, "[rule]".into()).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.emails_sent, 1);

        let mail = recorder.mail();
        assert_eq!(mail.len(), 1);
        assert_eq!(
            mail[0].attachment,
            Some((CaptureKind::Photo, PathBuf::from("/tmp/cam0-photo")))
        );
        assert!(mail[0].body.contains("Photo attached to email."));
    }

    #[tokio::test]
    async fn test_email_rate_limited_per_rule() {
        let recorder = Recorder::new();
        let dispatcher = dispatcher(&recorder, 3);
        let actions = vec![Action::Email { recipient: "me@example.com".into() }];
        let mut sent = 0;
        let mut suppressed = 0;
        for _ in 0..4 {
            let report = dispatcher.execute(&ctx(), &actions, String::new()).await;
            sent += report.emails_sent;
            suppressed += report.emails_suppressed;
        }
        assert_eq!((sent, suppressed), (3, 1));
        assert_eq!(recorder.mail().len(), 3);
    }

    #[tokio::test]
    async fn test_redundant_activation_is_noticed() {
        let recorder = Recorder::new();
        recorder.activate("pid", "7").await.unwrap();
        let report = dispatcher(&recorder, 1)
            .execute(
                &ctx(),
                &[Action::ActivateController { kind: "pid".into(), controller_id: "7".into() }],
                String::new(),
            )
            .await;
        assert!(report.message.contains("already active"));
        assert_eq!(recorder.calls(), vec!["activate pid 7".to_string()]);
    }

    #[tokio::test]
    async fn test_relay_spawned_with_duration() {
        let recorder = Recorder::new();
        let actions = vec![Action::Relay {
            relay_id: "fan".into(),
            state: RelayState::On,
            duration_secs: Some(30.0),
        }];
        let report = dispatcher(&recorder, 1).execute(&ctx(), &actions, String::new()).await;
        assert!(report.message.contains("Turn relay fan on for 30 seconds."));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.calls(), vec!["relay fan on 30s".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gpio_relay_timed_window() {
        let hal = Arc::new(MockHal::new());
        let relays = GpioRelays::new(
            hal.clone(),
            &[RelayConfig { id: "fan".into(), gpio_pin: 17, active_low: true }],
        );
        relays.on_off("fan", RelayState::On, Some(Duration::from_secs(5))).await.unwrap();
        // active low: on drives the pin low, off drives it high
        assert_eq!(hal.writes(), vec![(17, false), (17, true)]);
        assert!(matches!(
            relays.on("pump").await,
            Err(ActionError::UnknownTarget { kind: "relay", .. })
        ));
    }

    #[tokio::test]
    async fn test_command_camera_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let camera = CommandCamera::new(&[CameraConfig {
            id: "cam0".into(),
            photo_command: "touch {output}".into(),
            video_command: "touch {output}".into(),
            output_dir: dir.path().to_path_buf(),
        }]);
        let path = camera.capture(CaptureKind::Photo, "cam0", None).await.unwrap();
        assert!(path.exists());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"));
    }
}
