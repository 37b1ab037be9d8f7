use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use agentbox_common::response;
use agentbox_types::Principal;
use anyhow::{Context, Result, bail};
use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{Request, request::Parts},
    middleware::Next,
    response::Response,
};

/// The opaque auth collaborator: token in, principal out. The persistent
/// user store, JWT validation and password hashing live behind this seam.
#[async_trait::async_trait]
pub trait AuthService: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Principal>;
}

/// Bearer-token auth backed by a JSON file mapping api keys to principals:
///
/// ```json
/// { "key-abc": { "id": "alice", "role": "user", "env_permissions": {} } }
/// ```
pub struct ApiKeyAuth {
    keys: HashMap<String, Principal>,
}

impl ApiKeyAuth {
    pub fn new(keys: HashMap<String, Principal>) -> Self {
        Self { keys }
    }

    pub async fn load(path: &str) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read api key file {path}"))?;
        let keys: HashMap<String, Principal> =
            serde_json::from_str(&contents).context("failed to parse api key file")?;
        Ok(Self::new(keys))
    }
}

#[async_trait::async_trait]
impl AuthService for ApiKeyAuth {
    async fn authenticate(&self, token: &str) -> Result<Principal> {
        match self.keys.get(token) {
            Some(principal) => Ok(principal.clone()),
            None => bail!("unknown api key"),
        }
    }
}

/// Middleware for every protected route: pull the Bearer token, resolve it
/// to a principal, and park the principal in the request extensions.
pub async fn require_bearer(
    State(auth): State<Arc<dyn AuthService>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = match bearer_token(&req) {
        Some(token) => token,
        None => {
            return response::unauthorized(anyhow::anyhow!(
                "missing or malformed Authorization header"
            ));
        }
    };
    let principal = match auth.authenticate(&token).await {
        Ok(principal) => principal,
        Err(e) => return response::unauthorized(e),
    };
    req.extensions_mut().insert(principal);
    next.run(req).await
}

fn bearer_token(req: &Request<Body>) -> Option<String> {
    let header = req.headers().get(axum::http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Extractor for the authenticated principal placed by `require_bearer`.
pub struct CallerPrincipal(pub Principal);

impl<S> FromRequestParts<S> for CallerPrincipal
where
    S: Send + Sync,
{
    type Rejection = Response;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let principal = parts.extensions.get::<Principal>().cloned();
        async move {
            principal.map(CallerPrincipal).ok_or_else(|| {
                response::unauthorized(anyhow::anyhow!("request reached handler unauthenticated"))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbox_types::Role;

    fn auth_with_key(token: &str, id: &str) -> ApiKeyAuth {
        let mut keys = HashMap::new();
        keys.insert(
            token.to_string(),
            Principal {
                id: id.to_string(),
                role: Role::User,
                env_permissions: HashMap::new(),
            },
        );
        ApiKeyAuth::new(keys)
    }

    #[tokio::test]
    async fn known_key_resolves_principal() {
        let auth = auth_with_key("key-abc", "alice");
        let principal = auth.authenticate("key-abc").await.unwrap();
        assert_eq!(principal.id, "alice");
    }

    #[tokio::test]
    async fn unknown_key_is_rejected() {
        let auth = auth_with_key("key-abc", "alice");
        assert!(auth.authenticate("key-xyz").await.is_err());
    }

    #[test]
    fn bearer_header_parsing() {
        let req = Request::builder()
            .header("authorization", "Bearer key-abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&req).as_deref(), Some("key-abc"));

        let req = Request::builder()
            .header("authorization", "Basic dXNlcg==")
            .body(Body::empty())
            .unwrap();
        assert!(bearer_token(&req).is_none());

        let req = Request::builder().body(Body::empty()).unwrap();
        assert!(bearer_token(&req).is_none());
    }
}
