use axum::{
    Extension, RequestPartsExt,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use axum_keycloak_auth::decode::KeycloakToken;
use owo_colors::OwoColorize;
use reqwest::StatusCode;

/// The authenticated caller's client identifier, extracted from the
/// validated JWT on the public surface. Security policy matches this
/// against a restricted-client allowlist per route.
pub struct ClientId(pub String);

impl<S> FromRequestParts<S> for ClientId
where
    S: Send + Sync,
{
    type Rejection = BadRequest;
    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Extension(token) = parts
            .extract::<Extension<KeycloakToken<String>>>()
            .await
            .map_err(|e| {
                eprintln!(
                    "{}",
                    format!("failed to extract auth token: {:?}", e).red()
                );
                BadRequest
            })?;
        Ok(ClientId(token.subject.clone()))
    }
}

pub struct BadRequest;

impl IntoResponse for BadRequest {
    fn into_response(self) -> Response {
        StatusCode::BAD_REQUEST.into_response()
    }
}
