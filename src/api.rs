//! ==============================================================================
//! api.rs - read-only status api
//! ==============================================================================
//!
//! routes:
//!     GET /api/controllers   per-device state, rule table version, last sample
//!     GET /api/firings       most recent firings across all controllers, newest last
//!
//! the firing ring is fed by one collector task per controller, each
//! subscribed to that controller's broadcast channel.
//!
//! ==============================================================================

use crate::controller::{ControllerHandle, ControllerStatus};
use crate::engine::Firing;
use anyhow::Result;
use axum::{extract::State, response::Json, routing::get, Router};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

pub const FIRING_HISTORY: usize = 50;

#[derive(Clone)]
pub struct ApiState {
    controllers: Arc<Vec<ControllerHandle>>,
    firings: Arc<RwLock<VecDeque<Firing>>>,
}

impl ApiState {
    pub fn new(controllers: Vec<ControllerHandle>) -> Self {
        Self {
            controllers: Arc::new(controllers),
            firings: Arc::new(RwLock::new(VecDeque::with_capacity(FIRING_HISTORY))),
        }
    }

    pub async fn record(&self, firing: Firing) {
        let mut ring = self.firings.write().await;
        ring.push_back(firing);
        while ring.len() > FIRING_HISTORY {
            ring.pop_front();
        }
    }

    /// start one collector per controller. they end when the controller's
    /// firing channel closes.
    pub fn spawn_collectors(&self) -> Vec<JoinHandle<()>> {
        self.controllers
            .iter()
            .map(|handle| {
                let mut rx = handle.subscribe_firings();
                let state = self.clone();
                let device = handle.device_id().to_string();
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(firing) => state.record(firing).await,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!(device = %device, missed, "firing feed lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                })
            })
            .collect()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/controllers", get(controllers_handler))
        .route("/api/firings", get(firings_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(bind: &str, state: ApiState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "status api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn controllers_handler(State(state): State<ApiState>) -> Json<Vec<ControllerStatus>> {
    Json(state.controllers.iter().map(|c| c.status()).collect())
}

async fn firings_handler(State(state): State<ApiState>) -> Json<Vec<Firing>> {
    let ring = state.firings.read().await;
    Json(ring.iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firing(n: usize) -> Firing {
        Firing {
            rule_id: format!("r{n}"),
            device_id: "gh".into(),
            message: String::new(),
            at_ms: n as u64,
        }
    }

    #[tokio::test]
    async fn test_firing_ring_is_bounded() {
        let state = ApiState::new(Vec::new());
        for n in 0..(FIRING_HISTORY + 5) {
            state.record(firing(n)).await;
        }
        let Json(firings) = firings_handler(State(state)).await;
        assert_eq!(firings.len(), FIRING_HISTORY);
        assert_eq!(firings[0].rule_id, "r5");
        assert_eq!(firings.last().map(|f| f.at_ms), Some((FIRING_HISTORY + 4) as u64));
    }

    #[tokio::test]
    async fn test_no_controllers() {
        let Json(statuses) = controllers_handler(State(ApiState::new(Vec::new()))).await;
        assert!(statuses.is_empty());
    }
}
