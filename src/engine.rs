//! ==============================================================================
//! engine.rs - rule evaluation
//! ==============================================================================
//!
//! purpose:
//!     one `RuleEvaluator` per controller, shared by the tick loop and the edge
//!     handler. both call in with an immutable `RuleTable` snapshot; the only
//!     state the evaluator mutates is its own per-rule timers.
//!
//! firing:
//!     the trigger message is built here, then the rule's action list is
//!     handed to a spawned task. that task runs the dispatcher, logs the final
//!     message and publishes a `Firing` on the broadcast channel.
//!
//! ==============================================================================

use crate::actions::{ActionDispatcher, FiringContext};
use crate::config::DeviceConfig;
use crate::hal::HardwareProvider;
use crate::rules::{ConditionalRule, EdgeDirection, RuleTable, Trigger};
use crate::sensor::{now_ms, Sample};
use crate::sink::SampleSink;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// latest-value lookups reach back this many device periods
pub const LOOKBACK_PERIODS: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Firing {
    pub rule_id: String,
    pub device_id: String,
    pub message: String,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct RuleTimer {
    next_check: Instant,
    last_fired: Option<Instant>,
}

pub struct RuleEvaluator {
    device_id: String,
    location: String,
    period: Duration,
    input_pin: Option<u8>,
    sink: Arc<dyn SampleSink>,
    hal: Arc<dyn HardwareProvider>,
    dispatcher: Arc<ActionDispatcher>,
    timers: Mutex<HashMap<String, RuleTimer>>,
    last_values: Mutex<BTreeMap<String, f64>>,
    firings: broadcast::Sender<Firing>,
}

impl RuleEvaluator {
    pub fn new(
        device: &DeviceConfig,
        input_pin: Option<u8>,
        sink: Arc<dyn SampleSink>,
        hal: Arc<dyn HardwareProvider>,
        dispatcher: Arc<ActionDispatcher>,
        firings: broadcast::Sender<Firing>,
    ) -> Self {
        Self {
            device_id: device.id.clone(),
            location: device.location.clone(),
            period: device.period(),
            input_pin,
            sink,
            hal,
            dispatcher,
            timers: Mutex::new(HashMap::new()),
            last_values: Mutex::new(BTreeMap::new()),
            firings,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Firing> {
        self.firings.subscribe()
    }

    /// lookup window for threshold rules
    pub fn lookback(&self) -> Duration {
        self.period.mul_f64(LOOKBACK_PERIODS)
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, RuleTimer>> {
        match self.timers.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// start timers for rules seen for the first time and drop timers of
    /// rules that are gone. existing timers (and last fired) are left alone.
    pub fn adopt(&self, table: &RuleTable, now: Instant) {
        let mut timers = self.timers();
        timers.retain(|id, _| table.get(id).is_some());
        self.dispatcher.limiter().retain(|id| table.get(id).is_some());
        for rule in table.active() {
            timers.entry(rule.id.clone()).or_insert(RuleTimer {
                next_check: now + rule.period(),
                last_fired: None,
            });
            self.dispatcher.limiter().register(&rule.id, now);
        }
    }

    pub fn last_fired(&self, rule_id: &str) -> Option<Instant> {
        self.timers().get(rule_id).and_then(|t| t.last_fired)
    }

    pub fn record_sample(&self, sample: &Sample) {
        if let Ok(mut values) = self.last_values.lock() {
            values.extend(sample.values.iter().map(|(k, v)| (k.clone(), *v)));
        }
    }

    /// cadence evaluation from the tick loop. a rule is checked when the
    /// measurement just became due or its own period has elapsed.
    /// returns the ids of rules that fired.
    pub async fn evaluate_due(
        &self,
        table: &RuleTable,
        now: Instant,
        measurement_due: bool,
    ) -> Vec<String> {
        let mut fired = Vec::new();
        if table.is_empty() {
            return fired;
        }
        for rule in table.active() {
            if matches!(rule.trigger, Trigger::Edge { .. }) {
                continue;
            }
            let eligible = {
                let mut timers = self.timers();
                let timer = timers.entry(rule.id.clone()).or_insert(RuleTimer {
                    next_check: now + rule.period(),
                    last_fired: None,
                });
                if measurement_due || now >= timer.next_check {
                    timer.next_check = now + rule.period();
                    true
                } else {
                    false
                }
            };
            if !eligible {
                continue;
            }
            if let Some(message) = self.check(rule).await {
                self.fire(rule, message, now);
                fired.push(rule.id.clone());
            }
        }
        fired
    }

    /// edge path: only edge rules matching `direction`, no cadence
    pub fn evaluate_edge(&self, table: &RuleTable, direction: EdgeDirection, now: Instant) -> Vec<String> {
        let mut fired = Vec::new();
        for rule in table.active().filter(|r| r.trigger.matches_edge(direction)) {
            let label = match direction {
                EdgeDirection::Rising => "Rising",
                EdgeDirection::Falling => "Falling",
            };
            let message = format!("{} {label} Edge Detected.", header(rule));
            self.fire(rule, message, now);
            fired.push(rule.id.clone());
        }
        fired
    }

    /// trigger message when the rule's predicate holds
    async fn check(&self, rule: &ConditionalRule) -> Option<String> {
        match &rule.trigger {
            Trigger::Threshold { measurement, direction, setpoint } => {
                let latest = match self
                    .sink
                    .read_latest(&self.device_id, measurement, self.lookback())
                    .await
                {
                    Ok(latest) => latest,
                    Err(e) => {
                        tracing::warn!(device = %self.device_id, rule = %rule.id, "latest value lookup failed: {e}");
                        return None;
                    }
                };
                let Some(value) = latest else {
                    tracing::debug!(device = %self.device_id, rule = %rule.id, measurement = %measurement, "no recent measurement");
                    return None;
                };
                direction.satisfied(value, *setpoint).then(|| {
                    format!(
                        "{} {measurement}: {value} ({} {setpoint} set value).",
                        header(rule),
                        direction.symbol()
                    )
                })
            }
            Trigger::State { level } => {
                let Some(pin) = self.input_pin else {
                    tracing::debug!(device = %self.device_id, rule = %rule.id, "state rule on a device without an input pin");
                    return None;
                };
                let hal = self.hal.clone();
                let current = match tokio::task::spawn_blocking(move || hal.read_gpio(pin)).await {
                    Ok(Ok(level)) => level,
                    Ok(Err(e)) => {
                        tracing::warn!(device = %self.device_id, pin, "gpio read failed: {e:#}");
                        return None;
                    }
                    Err(e) => {
                        tracing::warn!(device = %self.device_id, pin, "gpio read task failed: {e}");
                        return None;
                    }
                };
                level.matches(current).then(|| {
                    let label = if current { "High" } else { "Low" };
                    format!("{} {label} GPIO State Detected.", header(rule))
                })
            }
            Trigger::Edge { .. } => None,
        }
    }

    fn fire(&self, rule: &ConditionalRule, message: String, now: Instant) {
        {
            let mut timers = self.timers();
            let timer = timers.entry(rule.id.clone()).or_insert(RuleTimer {
                next_check: now + rule.period(),
                last_fired: None,
            });
            timer.last_fired = Some(timer.last_fired.map_or(now, |t| t.max(now)));
        }

        let ctx = FiringContext {
            device_id: self.device_id.clone(),
            location: self.location.clone(),
            rule_id: rule.id.clone(),
            rule_name: rule.display_name().to_string(),
            rule_period: rule.period(),
            values: self.last_values.lock().map(|v| v.clone()).unwrap_or_default(),
        };
        let actions = rule.actions.clone();
        let dispatcher = self.dispatcher.clone();
        let firings = self.firings.clone();
        tokio::spawn(async move {
            let report = dispatcher.execute(&ctx, &actions, message).await;
            tracing::info!(device = %ctx.device_id, rule = %ctx.rule_id, "{}", report.message);
            // no subscribers is fine
            let _ = firings.send(Firing {
                rule_id: ctx.rule_id,
                device_id: ctx.device_id,
                message: report.message,
                at_ms: now_ms(),
            });
        });
    }
}

fn header(rule: &ConditionalRule) -> String {
    format!("[Rule: {} ({})]", rule.display_name(), rule.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Recorder;
    use crate::config::EdgePolicy;
    use crate::hal::MockHal;
    use crate::ratelimit::NotificationRateLimiter;
    use crate::rules::{Action, Direction, GpioLevel};
    use crate::sink::{points_for, MemorySink};

    fn device() -> DeviceConfig {
        toml::from_str(
            r#"
id = "greenhouse"
kind = "dht22"
location = "4"
period_secs = 60.0
"#,
        )
        .unwrap()
    }

    fn rule(id: &str, trigger: Trigger) -> ConditionalRule {
        ConditionalRule {
            id: id.into(),
            name: String::new(),
            activated: true,
            trigger,
            period_secs: 60.0,
            actions: vec![Action::Email { recipient: "me@example.com".into() }],
        }
    }

    fn above(setpoint: f64) -> Trigger {
        Trigger::Threshold { measurement: "temperature".into(), direction: Direction::Above, setpoint }
    }

    struct Fixture {
        sink: Arc<MemorySink>,
        hal: Arc<MockHal>,
        recorder: Arc<Recorder>,
        evaluator: RuleEvaluator,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(MemorySink::new());
        let hal = Arc::new(MockHal::new());
        let recorder = Recorder::new();
        let dispatcher = Arc::new(ActionDispatcher::new(
            recorder.collaborators(),
            Arc::new(NotificationRateLimiter::new(10)),
        ));
        let (tx, _) = broadcast::channel(16);
        let evaluator =
            RuleEvaluator::new(&device(), Some(4), sink.clone(), hal.clone(), dispatcher, tx);
        Fixture { sink, hal, recorder, evaluator }
    }

    async fn store(sink: &MemorySink, value: f64) {
        sink.write(&points_for("greenhouse", &Sample::single("temperature", value)))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_at_setpoint_does_not_fire() {
        let f = fixture();
        let table = RuleTable::new(1, vec![rule("hot", above(30.0))]);
        f.evaluator.adopt(&table, Instant::now());

        store(&f.sink, 30.0).await;
        assert!(f.evaluator.evaluate_due(&table, Instant::now(), true).await.is_empty());

        store(&f.sink, 30.5).await;
        let fired = f.evaluator.evaluate_due(&table, Instant::now(), true).await;
        assert_eq!(fired, vec!["hot".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_is_a_real_reading() {
        let f = fixture();
        let below = Trigger::Threshold {
            measurement: "temperature".into(),
            direction: Direction::Below,
            setpoint: 1.0,
        };
        let table = RuleTable::new(1, vec![rule("freeze", below)]);
        store(&f.sink, 0.0).await;
        assert_eq!(f.evaluator.evaluate_due(&table, Instant::now(), true).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_measurement_is_skipped() {
        let f = fixture();
        let table = RuleTable::new(1, vec![rule("hot", above(30.0))]);
        assert!(f.evaluator.evaluate_due(&table, Instant::now(), true).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_gates_evaluation() {
        let f = fixture();
        let table = RuleTable::new(1, vec![rule("hot", above(30.0))]);
        let start = Instant::now();
        f.evaluator.adopt(&table, start);
        store(&f.sink, 35.0).await;

        // not due yet and no fresh measurement
        assert!(f.evaluator.evaluate_due(&table, start + Duration::from_secs(10), false).await.is_empty());
        // own period elapsed
        assert_eq!(f.evaluator.evaluate_due(&table, start + Duration::from_secs(60), false).await.len(), 1);
        assert!(f.evaluator.evaluate_due(&table, start + Duration::from_secs(61), false).await.is_empty());
        assert_eq!(f.evaluator.last_fired("hot"), Some(start + Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_survive_adopt() {
        let f = fixture();
        let start = Instant::now();
        let table = RuleTable::new(1, vec![rule("hot", above(30.0))]);
        f.evaluator.adopt(&table, start);
        store(&f.sink, 35.0).await;
        f.evaluator.evaluate_due(&table, start, true).await;
        let fired_at = f.evaluator.last_fired("hot");
        assert!(fired_at.is_some());

        let next = RuleTable::new(2, vec![rule("hot", above(20.0)), rule("cold", above(50.0))]);
        f.evaluator.adopt(&next, start + Duration::from_secs(5));
        assert_eq!(f.evaluator.last_fired("hot"), fired_at);
        assert_eq!(f.evaluator.last_fired("cold"), None);

        f.evaluator.adopt(&RuleTable::new(3, vec![]), start + Duration::from_secs(6));
        assert_eq!(f.evaluator.last_fired("hot"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopt_drops_rate_limit_windows_of_removed_rules() {
        let f = fixture();
        let start = Instant::now();
        let limiter = f.evaluator.dispatcher.limiter();
        f.evaluator.adopt(&RuleTable::new(1, vec![rule("hot", above(30.0)), rule("cold", above(50.0))]), start);
        limiter.check("hot", start);
        limiter.check("cold", start);

        f.evaluator.adopt(&RuleTable::new(2, vec![rule("cold", above(40.0))]), start + Duration::from_secs(1));
        assert_eq!(limiter.sent_in_window("hot"), 0);
        assert_eq!(limiter.sent_in_window("cold"), 1);
    }

    #[tokio::test]
    async fn test_edge_rules_match_direction() {
        let f = fixture();
        let table = RuleTable::new(
            1,
            vec![
                rule("open", Trigger::Edge { edge: EdgePolicy::Rising }),
                rule("any", Trigger::Edge { edge: EdgePolicy::Both }),
                rule("hot", above(30.0)),
            ],
        );
        let mut rx = f.evaluator.subscribe();
        let mut fired = f.evaluator.evaluate_edge(&table, EdgeDirection::Falling, Instant::now());
        fired.sort();
        assert_eq!(fired, vec!["any".to_string()]);

        let firing = rx.recv().await.unwrap();
        assert_eq!(firing.rule_id, "any");
        assert!(firing.message.starts_with("[Rule: any (any)] Falling Edge Detected."));
        assert!(firing.message.contains("Notify me@example.com."));
        assert_eq!(f.recorder.mail().len(), 1);
    }

    #[tokio::test]
    async fn test_state_rule_reads_pin() {
        let f = fixture();
        let table = RuleTable::new(1, vec![rule("closed", Trigger::State { level: GpioLevel::Low })]);
        f.hal.set_level(4, true);
        assert!(f.evaluator.evaluate_due(&table, Instant::now(), true).await.is_empty());
        f.hal.set_level(4, false);
        assert_eq!(f.evaluator.evaluate_due(&table, Instant::now(), true).await.len(), 1);
    }

    #[tokio::test]
    async fn test_firing_message_and_substitution() {
        let f = fixture();
        let mut hot = rule("hot", above(30.0));
        hot.name = "too hot".into();
        hot.actions = vec![Action::Command { command: "echo ((temperature))".into() }];
        let table = RuleTable::new(1, vec![hot]);
        let sample = Sample::single("temperature", 31.0);
        f.evaluator.record_sample(&sample);
        f.sink.write(&points_for("greenhouse", &sample)).await.unwrap();

        let mut rx = f.evaluator.subscribe();
        f.evaluator.evaluate_due(&table, Instant::now(), true).await;
        let firing = rx.recv().await.unwrap();
        assert!(firing
            .message
            .starts_with("[Rule: too hot (hot)] temperature: 31 (> 30 set value)."));
        assert!(firing.message.contains("output: 31"));
    }
}
