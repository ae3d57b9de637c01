use axum::{
    extract::State as AxumState,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rochambeau_client::matchmaking::{ErrorBody, OpenRequest, GREYLISTED};
use rochambeau_types::Address;
use serde::Serialize;
use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::Simulator;

/// Matchmaking API in front of the local bot.
#[derive(Clone)]
pub struct Api {
    simulator: Simulator,
    greylist: Arc<RwLock<HashSet<Address>>>,
}

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

fn error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl Api {
    pub fn new(simulator: Simulator) -> Self {
        Self {
            simulator,
            greylist: Arc::default(),
        }
    }

    /// Refuse future channels for `address`.
    pub fn greylist(&self, address: Address) {
        match self.greylist.write() {
            Ok(mut greylist) => {
                greylist.insert(address);
            }
            Err(poisoned) => {
                warn!("greylist lock poisoned; recovering");
                poisoned.into_inner().insert(address);
            }
        }
    }

    fn is_greylisted(&self, address: &Address) -> bool {
        match self.greylist.read() {
            Ok(greylist) => greylist.contains(address),
            Err(poisoned) => poisoned.into_inner().contains(address),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/open", post(open))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }
}

async fn healthz() -> impl IntoResponse {
    Json(HealthzResponse { ok: true })
}

async fn open(AxumState(api): AxumState<Api>, Json(request): Json<OpenRequest>) -> Response {
    if api.is_greylisted(&request.address) {
        warn!(address = %request.address, "greylisted account requested a channel");
        return error(StatusCode::FORBIDDEN, GREYLISTED);
    }
    if api.simulator.is_busy_for(&request.address) {
        return error(StatusCode::CONFLICT, "bot busy");
    }
    info!(address = %request.address, host = %request.host, port = request.port, "matched");
    let config = api
        .simulator
        .channel_config_for(&request.address, &request.host, request.port);
    Json(config).into_response()
}
