//! conditional rules and the versioned table that holds them.
//!
//! the table is immutable once built. readers (the tick loop and the edge
//! handler) take an `Arc` snapshot; reconfiguration builds a whole new table
//! and swaps the pointer, so a reader sees either the old table or the new
//! one, never a mix. per-rule runtime state (timers, last fired, email
//! window) lives in the evaluator, not here.

use crate::config::EdgePolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    /// strict comparison: a value exactly at the setpoint never satisfies
    pub fn satisfied(self, value: f64, setpoint: f64) -> bool {
        match self {
            Self::Above => value > setpoint,
            Self::Below => value < setpoint,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Above => ">",
            Self::Below => "<",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GpioLevel {
    High,
    Low,
}

impl GpioLevel {
    pub fn matches(self, level: bool) -> bool {
        level == (self == Self::High)
    }
}

/// direction of one accepted transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeDirection {
    Rising,
    Falling,
}

impl EdgeDirection {
    /// stored value for the `edge` measurement
    pub fn value(self) -> f64 {
        match self {
            Self::Rising => 1.0,
            Self::Falling => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// latest stored value of `measurement` compared against `setpoint`
    Threshold {
        measurement: String,
        direction: Direction,
        setpoint: f64,
    },
    /// fired from the edge path only, for matching transitions
    Edge { edge: EdgePolicy },
    /// current level of the device's input pin, checked on the rule cadence
    State { level: GpioLevel },
}

impl Trigger {
    pub fn matches_edge(&self, direction: EdgeDirection) -> bool {
        match self {
            Self::Edge { edge } => match edge {
                EdgePolicy::Both => true,
                EdgePolicy::Rising => direction == EdgeDirection::Rising,
                EdgePolicy::Falling => direction == EdgeDirection::Falling,
            },
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Relay {
        relay_id: String,
        state: RelayState,
        #[serde(default)]
        duration_secs: Option<f64>,
    },
    /// shell command; ((measurement)), ((location)) and ((period)) are substituted
    Command { command: String },
    Photo { camera_id: String },
    Video {
        camera_id: String,
        #[serde(default = "default_video_secs")]
        duration_secs: f64,
    },
    ActivateController {
        #[serde(default = "default_controller_kind")]
        kind: String,
        controller_id: String,
    },
    DeactivateController {
        #[serde(default = "default_controller_kind")]
        kind: String,
        controller_id: String,
    },
    /// attaches the last photo/video captured earlier in the same firing
    Email { recipient: String },
    FlashIndicator {
        indicator_id: String,
        #[serde(default = "default_flash_count")]
        count: u32,
    },
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Relay { .. } => "relay",
            Self::Command { .. } => "command",
            Self::Photo { .. } => "photo",
            Self::Video { .. } => "video",
            Self::ActivateController { .. } => "activate_controller",
            Self::DeactivateController { .. } => "deactivate_controller",
            Self::Email { .. } => "email",
            Self::FlashIndicator { .. } => "flash_indicator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConditionalRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub activated: bool,
    pub trigger: Trigger,
    /// minimum time between cadence evaluations
    #[serde(default = "default_rule_period")]
    pub period_secs: f64,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl ConditionalRule {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_secs.max(0.0))
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

fn default_true() -> bool { true }
fn default_rule_period() -> f64 { 60.0 }
fn default_video_secs() -> f64 { 5.0 }
fn default_controller_kind() -> String { "pid".to_string() }
fn default_flash_count() -> u32 { 1 }

/// an immutable, versioned set of rules keyed by id
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleTable {
    pub version: u64,
    rules: BTreeMap<String, ConditionalRule>,
}

impl RuleTable {
    pub fn new(version: u64, rules: Vec<ConditionalRule>) -> Self {
        let rules = rules.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self { version, rules }
    }

    pub fn get(&self, id: &str) -> Option<&ConditionalRule> {
        self.rules.get(id)
    }

    pub fn active(&self) -> impl Iterator<Item = &ConditionalRule> {
        self.rules.values().filter(|r| r.activated)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// same rules regardless of version
    pub fn same_rules(&self, rules: &[ConditionalRule]) -> bool {
        rules.len() == self.rules.len()
            && rules.iter().all(|r| self.rules.get(&r.id) == Some(r))
    }
}

/// shared pointer to the current table. `replace` is the only mutation.
pub struct RuleTableHandle {
    current: RwLock<Arc<RuleTable>>,
}

impl RuleTableHandle {
    pub fn new(rules: Vec<ConditionalRule>) -> Self {
        Self { current: RwLock::new(Arc::new(RuleTable::new(1, rules))) }
    }

    pub fn snapshot(&self) -> Arc<RuleTable> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// build the successor table and swap it in whole
    pub fn replace(&self, rules: Vec<ConditionalRule>) -> Arc<RuleTable> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = Arc::new(RuleTable::new(guard.version + 1, rules));
        *guard = next.clone();
        next
    }
}
