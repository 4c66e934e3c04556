use crate::checker::QueryResult;
use crate::server::AppState;
use crate::worker::CheckState;
use actix_web::{
    Error, HttpResponse, delete,
    error::{ErrorBadRequest, ErrorInternalServerError, ErrorNotFound},
    get, post,
    web::{Data, Json, Path},
};
use log::error;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_actix_web::{scope, service_config::ServiceConfig};

pub fn configure_routes(config: &mut ServiceConfig) {
    config.service(
        scope::scope("/heartbeats")
            .service(report_heartbeat)
            .service(query_heartbeat)
            .service(check_state)
            .service(delete_heartbeat),
    );
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HeartbeatReport {
    /// Instance or client the heartbeat is for.
    pub id: String,
    /// Address the heartbeat came from.
    pub host: String,
    /// Seconds since the Unix epoch, the receive time when absent.
    #[serde(default)]
    pub timestamp_sec: Option<i64>,
}

#[utoipa::path(
    summary = "Report a heartbeat",
    request_body = HeartbeatReport,
    responses(
        (status = 204, description = "Heartbeat recorded"),
        (status = 400, description = "Missing entity id"),
        (status = 500, description = "The owner of the record could not be reached")
    ),
    tags = ["heartbeats"],
    operation_id = "reportHeartbeat"
)]
#[post("")]
async fn report_heartbeat(
    body: Json<HeartbeatReport>,
    app_state: Data<AppState>,
) -> Result<HttpResponse, Error> {
    let report = body.into_inner();
    if report.id.is_empty() {
        return Err(ErrorBadRequest("id must not be empty"));
    }

    app_state
        .engine
        .report(&report.id, &report.host, report.timestamp_sec)
        .await
        .map_err(|e| {
            error!("Failed to record heartbeat of {}: {e:#}", report.id);
            ErrorInternalServerError(e)
        })?;

    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    summary = "Last heartbeat of an entity",
    description = "Returns the stored heartbeat record; `exists` is false when none is stored",
    responses(
        (status = 200, description = "Lookup done", body = QueryResult),
        (status = 500, description = "The owner of the record could not be reached")
    ),
    tags = ["heartbeats"],
    operation_id = "queryHeartbeat"
)]
#[get("/{id}")]
async fn query_heartbeat(
    id: Path<String>,
    app_state: Data<AppState>,
) -> Result<Json<QueryResult>, Error> {
    let result = app_state
        .engine
        .query(&id)
        .await
        .map_err(ErrorInternalServerError)?;

    Ok(Json(result))
}

#[utoipa::path(
    summary = "Check state of an entity",
    description = "Held verdict of an entity this node checks",
    responses(
        (status = 200, description = "The entity is checked here", body = CheckState),
        (status = 404, description = "This node does not check the entity")
    ),
    tags = ["heartbeats"],
    operation_id = "getCheckState"
)]
#[get("/{id}/check")]
async fn check_state(
    id: Path<String>,
    app_state: Data<AppState>,
) -> Result<Json<CheckState>, Error> {
    app_state
        .engine
        .check_state(&id)
        .await
        .map(Json)
        .ok_or_else(|| ErrorNotFound(format!("{id} is not checked on this node")))
}

#[utoipa::path(
    summary = "Forget the heartbeat of an entity",
    responses(
        (status = 204, description = "Record deleted or never stored"),
        (status = 500, description = "The owner of the record could not be reached")
    ),
    tags = ["heartbeats"],
    operation_id = "deleteHeartbeat"
)]
#[delete("/{id}")]
async fn delete_heartbeat(
    id: Path<String>,
    app_state: Data<AppState>,
) -> Result<HttpResponse, Error> {
    app_state
        .engine
        .delete(&id)
        .await
        .map_err(ErrorInternalServerError)?;

    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::start_server_test;
    use anyhow::Result;

    #[tokio::test]
    async fn test_heartbeat_endpoints() -> Result<()> {
        let (port, _) = start_server_test().await;
        let client = reqwest::Client::new();
        let url = format!("http://localhost:{}/heartbeats", port);

        let response = client
            .post(&url)
            .json(&HeartbeatReport {
                id: "svc-1".to_string(),
                host: "10.1.0.7".to_string(),
                timestamp_sec: Some(1_700_000_000),
            })
            .send()
            .await?;
        assert_eq!(response.status(), 204);

        let result: QueryResult = client
            .get(format!("{url}/svc-1"))
            .send()
            .await?
            .json()
            .await?;
        assert!(result.exists);
        assert_eq!(result.last_heartbeat_sec, 1_700_000_000);
        assert_eq!(result.server.as_deref(), Some("10.1.0.7"));
        assert_eq!(result.count, 1);

        // Nothing is owned without a fleet
        let response = client.get(format!("{url}/svc-1/check")).send().await?;
        assert_eq!(response.status(), 404);

        let response = client.delete(format!("{url}/svc-1")).send().await?;
        assert_eq!(response.status(), 204);

        let result: QueryResult = client
            .get(format!("{url}/svc-1"))
            .send()
            .await?
            .json()
            .await?;
        assert!(!result.exists);

        Ok(())
    }

    #[tokio::test]
    async fn test_report_without_id_is_rejected() -> Result<()> {
        let (port, state) = start_server_test().await;

        let response = reqwest::Client::new()
            .post(format!("http://localhost:{}/heartbeats", port))
            .json(&serde_json::json!({ "id": "", "host": "10.1.0.7" }))
            .send()
            .await?;
        assert_eq!(response.status(), 400);

        // Omitted timestamps default to now
        let response = reqwest::Client::new()
            .post(format!("http://localhost:{}/heartbeats", port))
            .json(&serde_json::json!({ "id": "svc-2", "host": "10.1.0.7" }))
            .send()
            .await?;
        assert_eq!(response.status(), 204);
        assert!(state.engine.query("svc-2").await?.last_heartbeat_sec > 0);

        Ok(())
    }
}
