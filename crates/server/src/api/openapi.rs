//! OpenAPI/Utoipa configuration.

use crate::api::health::MISC_TAG;
use crate::oauth2::OAUTH2_TAG;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{
        AuthorizationCode, Flow, HttpAuthScheme, HttpBuilder, OAuth2, Scopes, SecurityScheme,
    },
};

/// Security schemes for OpenAPI documentation.
pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        // Access tokens issued by /oauth2/token, as presented to resource servers
        let bearer = HttpBuilder::new()
            .scheme(HttpAuthScheme::Bearer)
            .bearer_format("JWT")
            .description(Some(
                "EdDSA-signed access token. Verify it against `/oauth2/jwks`.",
            ))
            .build();
        components.add_security_scheme("Authorization", SecurityScheme::Http(bearer));

        // Scopes are per client, so none are listed here
        let oauth2 = OAuth2::new([Flow::AuthorizationCode(AuthorizationCode::new(
            "/oauth2/authorize",
            "/oauth2/token",
            Scopes::new(),
        ))]);
        components.add_security_scheme("OAuth2", SecurityScheme::OAuth2(oauth2));
    }
}

/// OpenAPI documentation configuration.
#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "Authorization Server API",
        version = "0.1.0",
        description = "OAuth2 authorization code and refresh token flows with password and federated login."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = OAUTH2_TAG, description = "OAuth2 authorization server endpoints")
    )
)]
pub struct ApiDoc;
