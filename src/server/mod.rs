mod health;
mod heartbeat;
mod internal;
mod openapi;

use crate::engine::Engine;
use crate::server::health::*;
use actix_cors::Cors;
use actix_web::{App, HttpServer, web::Data};
use openapi::ApiDoc;
use std::{net::TcpListener, sync::Arc};
use utoipa::OpenApi;
use utoipa_actix_web::AppExt;
use utoipa_swagger_ui::SwaggerUi;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub engine: Arc<Engine>,
    /// Bearer token expected on `/internal`.
    pub internal_password: String,
}

pub async fn start_server(state: AppState, listener: TcpListener) -> std::io::Result<()> {
    let data = Data::new(state);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST", "DELETE"])
            .allowed_headers(vec!["Content-Type", "Authorization"])
            .max_age(60 * 60 * 12);

        App::new()
            .wrap(cors)
            .into_utoipa_app()
            .openapi(ApiDoc::openapi())
            .service(home)
            .service(health)
            .service(status)
            .service(peers)
            .configure(heartbeat::configure_routes)
            .configure(internal::configure_routes)
            .app_data(data.clone())
            .openapi_service(|api| {
                SwaggerUi::new("/swagger-ui/{_:.*}").url("/api/openapi.json", api)
            })
            .into_app()
    })
    .listen(listener)?
    .run();

    server.await
}

#[cfg(test)]
pub const TEST_INTERNAL_PASSWORD: &str = "test-internal-password";

/// Serves a started memory engine on a random port.
#[cfg(test)]
pub async fn start_server_test() -> (u16, AppState) {
    use crate::engine::tests::fast_config;
    use crate::worker::status::LogSink;

    let engine =
        Engine::new(fast_config(), None, Arc::new(LogSink)).expect("error creating engine");
    engine.start().await.expect("error starting engine");

    let state = Arc::new(AppStateInner {
        engine: Arc::new(engine),
        internal_password: TEST_INTERNAL_PASSWORD.to_string(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind to random port");
    let port = listener
        .local_addr()
        .expect("failed to get local addr")
        .port();

    let server_state = state.clone();
    tokio::spawn(async move {
        start_server(server_state, listener).await.unwrap();
    });

    (port, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        let (port, _) = start_server_test().await;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://localhost:{}/health", port))
            .send()
            .await
            .unwrap();

        let status_code = response.status();
        assert_eq!(status_code, 200);
    }

    #[tokio::test]
    async fn test_peers_endpoint() {
        let (port, state) = start_server_test().await;

        let probes: Vec<crate::checker::PeerProbe> =
            reqwest::get(format!("http://localhost:{}/peers", port))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();

        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].id, state.engine.local_id());
        assert!(probes[0].local && probes[0].reachable);
    }

    #[tokio::test]
    async fn test_openapi_lists_heartbeat_paths() {
        let (port, _) = start_server_test().await;

        let document: serde_json::Value = reqwest::get(format!(
            "http://localhost:{}/api/openapi.json",
            port
        ))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

        let paths = document["paths"].as_object().unwrap();
        assert!(paths.contains_key("/heartbeats"));
        assert!(paths.contains_key("/heartbeats/{id}"));
        assert!(paths.contains_key("/internal"));
    }
}
