//! sensor-host: per-device polling controllers for a raspberry pi sensor hub.
//!
//! each configured device gets a `controller::PollingController` that samples
//! it on a fixed cadence (or reacts to gpio edges), stores samples in a
//! `sink::SampleSink`, and fires conditional rules through
//! `actions::ActionDispatcher`. controllers that share an i2c bus coordinate
//! through file-based bus locks in `lock`.

pub mod actions;
pub mod api;
pub mod config;
pub mod controller;
pub mod edge;
pub mod engine;
pub mod error;
pub mod hal;
pub mod lock;
pub mod ratelimit;
pub mod rules;
pub mod sensor;
pub mod sink;
pub mod watch;
