use actix_web::{
    HttpRequest, HttpResponse, post,
    web::{Data, Json},
};
use log::{error, info};
use utoipa_actix_web::service_config::ServiceConfig;

use crate::{
    collab::internode::messages::{BroadcastBody, InterNodeMessage},
    server::AppState,
};

pub fn configure_routes(config: &mut ServiceConfig) {
    config.service(internal);
}

#[utoipa::path(
    request_body = Vec<InterNodeMessage>,
    responses(
        (status = 200, description = "Messages applied"),
        (status = 401, description = "Unauthorized - invalid or missing password"),
    ),
    tags = ["internal"],
    security(
        ("internal_bearer" = [])
    )
)]
#[post("/internal")]
pub async fn internal(
    req: HttpRequest,
    app_state: Data<AppState>,
    body: Json<BroadcastBody>,
) -> HttpResponse {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if token != Some(app_state.internal_password.as_str()) {
        log::warn!("unauthorized call to internal endpoint");
        return HttpResponse::Unauthorized().body("Invalid or missing internal password");
    }

    let engine = &app_state.engine;
    for msg in body.into_inner() {
        log::debug!("Received message: {msg:?}");

        match msg {
            InterNodeMessage::Registry { event } => engine.apply(event),
            InterNodeMessage::LeaderChanged { event } => {
                if let Err(e) = engine.publish_leader_change(event) {
                    error!("Error publishing leader change: {e:#}");
                }
            }
            InterNodeMessage::AddToCheck { ids } => engine.add_to_check(&ids),
            InterNodeMessage::RemoveFromCheck { ids } => engine.remove_from_check(&ids),
            InterNodeMessage::Suspend => {
                info!("suspend requested through the internal endpoint");
                engine.suspend();
            }
        }
    }

    HttpResponse::Ok().finish()
}
