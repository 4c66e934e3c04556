use crate::checker::PeerProbe;
use crate::engine::EngineStatus;
use crate::server::AppState;
use actix_web::{
    HttpResponse, get,
    web::{Data, Json},
};
use serde_json::json;

#[utoipa::path(
    responses(
        (status = 200, description = "Health check")
    ),
    tags = ["health"]
)]
#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok"
    }))
}

#[utoipa::path(
    responses(
        (status = 200, description = "Home endpoint")
    ),
    tags = ["health"]
)]
#[get("/")]
pub async fn home() -> HttpResponse {
    HttpResponse::Ok().body("Heartbeat checker")
}

#[utoipa::path(
    summary = "Node status",
    description = "Checker kind, peers, fleet and how many entities this node owns and checks",
    responses(
        (status = 200, description = "Current status of this node", body = EngineStatus)
    ),
    tags = ["health"],
    operation_id = "getStatus"
)]
#[get("/status")]
pub async fn status(app_state: Data<AppState>) -> Json<EngineStatus> {
    Json(app_state.engine.status().await)
}

#[utoipa::path(
    summary = "Peer reachability",
    description = "Pings every peer heartbeat records are spread over",
    responses(
        (status = 200, description = "One probe per peer", body = Vec<PeerProbe>)
    ),
    tags = ["health"],
    operation_id = "probePeers"
)]
#[get("/peers")]
pub async fn peers(app_state: Data<AppState>) -> Json<Vec<PeerProbe>> {
    Json(app_state.engine.probe_peers().await)
}
