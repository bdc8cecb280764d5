//! Restricts what restricted clients may call, layered on top of the JWT
//! validation `KeycloakAuthLayer` already performs. A client listed in
//! `restricted_client_ids` may only reach endpoints matching one of the
//! allowed patterns; every other authenticated client is unrestricted.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use orchestrator_common::rbac::ClientId;

use crate::state::AppState;

#[derive(Clone, Default)]
pub struct SecurityPolicy {
    /// Client ids whose access is limited to `allowed_patterns`.
    pub restricted_client_ids: Vec<String>,
    /// Endpoint patterns a restricted client may call: `^…$` matches the
    /// path exactly, anything else is a prefix match.
    pub allowed_patterns: Vec<String>,
}

impl SecurityPolicy {
    pub fn is_restricted(&self, client_id: &str) -> bool {
        self.restricted_client_ids.iter().any(|id| id == client_id)
    }

    pub fn path_allowed(&self, path: &str) -> bool {
        self.allowed_patterns.iter().any(|pattern| {
            match pattern.strip_prefix('^').and_then(|p| p.strip_suffix('$')) {
                Some(exact) => path == exact,
                None => path.starts_with(pattern.as_str()),
            }
        })
    }
}

pub async fn enforce_restricted_client(
    State(state): State<AppState>,
    ClientId(client_id): ClientId,
    req: Request,
    next: Next,
) -> Response {
    if state.security.is_restricted(&client_id) && !state.security.path_allowed(req.uri().path()) {
        return (
            StatusCode::FORBIDDEN,
            "client is not authorized for this endpoint",
        )
            .into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SecurityPolicy {
        SecurityPolicy {
            restricted_client_ids: vec!["ci-bot".to_string()],
            allowed_patterns: vec![
                "^/api/installations$".to_string(),
                "/api/installation/".to_string(),
            ],
        }
    }

    #[test]
    fn exact_patterns_match_the_whole_path() {
        let policy = policy();
        assert!(policy.path_allowed("/api/installations"));
        assert!(!policy.path_allowed("/api/installations/extra"));
    }

    #[test]
    fn bare_patterns_match_by_prefix() {
        let policy = policy();
        assert!(policy.path_allowed("/api/installation/abc123/hibernate"));
        assert!(!policy.path_allowed("/api/clusters"));
    }

    #[test]
    fn unlisted_clients_are_unrestricted() {
        let policy = policy();
        assert!(policy.is_restricted("ci-bot"));
        assert!(!policy.is_restricted("operator-console"));
    }
}
