//! interrupt path for edge devices.
//!
//! the hal delivers one `bool` (pin level after the transition) per event.
//! the handler drops events inside the reset period, classifies the rest,
//! stores them as the `edge` measurement (+1 rising, -1 falling) and runs the
//! matching edge rules against the current rule table snapshot. it runs in
//! its own task, independent of the tick loop.

use crate::config::{EdgeConfig, EdgePolicy};
use crate::engine::RuleEvaluator;
use crate::hal::EdgeReceiver;
use crate::rules::{EdgeDirection, RuleTableHandle};
use crate::sensor::Sample;
use crate::sink::{points_for, SampleSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// rising when the policy says so, or on `both` when the pin is now high
pub fn classify(policy: EdgePolicy, level: bool) -> EdgeDirection {
    match policy {
        EdgePolicy::Rising => EdgeDirection::Rising,
        EdgePolicy::Both if level => EdgeDirection::Rising,
        _ => EdgeDirection::Falling,
    }
}

pub struct EdgeDetectionHandler {
    device_id: String,
    policy: EdgePolicy,
    reset_period: Duration,
    next_allowed: Option<Instant>,
    sink: Arc<dyn SampleSink>,
    evaluator: Arc<RuleEvaluator>,
    rules: Arc<RuleTableHandle>,
}

impl EdgeDetectionHandler {
    pub fn new(
        device_id: &str,
        edge: &EdgeConfig,
        sink: Arc<dyn SampleSink>,
        evaluator: Arc<RuleEvaluator>,
        rules: Arc<RuleTableHandle>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            policy: edge.edge,
            reset_period: edge.reset_period(),
            next_allowed: None,
            sink,
            evaluator,
            rules,
        }
    }

    /// handle one transition. returns the direction when it was accepted.
    pub async fn on_transition(&mut self, level: bool, now: Instant) -> Option<EdgeDirection> {
        if let Some(next) = self.next_allowed {
            if now < next {
                tracing::trace!(device = %self.device_id, "edge inside reset period, ignored");
                return None;
            }
        }
        self.next_allowed = Some(now + self.reset_period);

        let direction = classify(self.policy, level);
        let sample = Sample::single("edge", direction.value());
        self.evaluator.record_sample(&sample);
        if let Err(e) = self.sink.write(&points_for(&self.device_id, &sample)).await {
            tracing::error!(device = %self.device_id, "failed to store edge event: {e}");
        }

        let table = self.rules.snapshot();
        let fired = self.evaluator.evaluate_edge(&table, direction, now);
        tracing::debug!(device = %self.device_id, ?direction, fired = fired.len(), "edge detected");
        Some(direction)
    }

    /// consume events until the stream closes or `stop` flips to true
    pub fn spawn(mut self, mut events: EdgeReceiver, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Some(level) => {
                            self.on_transition(level, Instant::now()).await;
                        }
                        None => break,
                    },
                }
            }
            tracing::debug!(device = %self.device_id, "edge watcher stopped");
        })
    }
}
