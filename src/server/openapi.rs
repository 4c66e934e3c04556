use utoipa::OpenApi;
use utoipa::openapi::{
    OpenApi as OpenApiSpec,
    security::{Http, HttpAuthScheme, SecurityScheme},
};

#[derive(OpenApi)]
#[openapi(
    tags(
        (name = "health", description = "Health and status endpoints."),
        (name = "heartbeats", description = "Heartbeat intake and lookup."),
        (
            name = "internal",
            description = "Registry and election events pushed by the control plane."
        ),
    ),
    modifiers(&SecurityAddon),
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut OpenApiSpec) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "internal_bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}
