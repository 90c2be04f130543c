use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use messenger_core::types::{Role, UserId};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing;

use crate::server::AppState;

/// Claims carried by a messenger access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id as a decimal string.
    pub sub: String,
    pub role: Role,
    pub exp: usize,
}

/// Identity attached to every authenticated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub role: Role,
}

/// Turns a bearer credential into a user identity.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<AuthenticatedUser, StatusCode>;
}

pub struct JwtValidator {
    secret: String,
}

impl JwtValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        JwtValidator { secret: secret.into() }
    }
}

#[async_trait]
impl CredentialValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<AuthenticatedUser, StatusCode> {
        verify_token(token, &self.secret)
    }
}

fn extract_token(auth_header: Option<&str>) -> Option<String> {
    auth_header?
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Header first, then the `token` query parameter browsers use for
/// WebSocket handshakes.
pub fn token_from_request(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let header = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok());
    extract_token(header).or_else(|| {
        query_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    })
}

/// Generate JWT token for a user
pub fn generate_token(user_id: UserId, role: Role, secret: &str, expires_in_secs: u64) -> Result<String, StatusCode> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .as_secs() as usize;

    let claims = Claims {
        sub: user_id.to_string(),
        role,
        exp: now + expires_in_secs as usize,
    };

    let encoding_key = EncodingKey::from_secret(secret.as_ref());

    encode(&Header::default(), &claims, &encoding_key).map_err(|e| {
        tracing::error!("Failed to generate JWT token: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Verify JWT token and extract the user
pub fn verify_token(token: &str, secret: &str) -> Result<AuthenticatedUser, StatusCode> {
    let decoding_key = DecodingKey::from_secret(secret.as_ref());
    let validation = Validation::default();

    let claims = match decode::<Claims>(token, &decoding_key, &validation) {
        Ok(token_data) => token_data.claims,
        Err(e) => {
            tracing::debug!("JWT verification failed: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let user_id = claims.sub.parse::<UserId>().map_err(|_| {
        tracing::debug!("JWT subject is not a user id: {}", claims.sub);
        StatusCode::UNAUTHORIZED
    })?;

    Ok(AuthenticatedUser {
        user_id,
        role: claims.role,
    })
}

/// Guards the REST routes; `/health` and the WebSocket handshake are let
/// through untouched.
pub async fn auth_middleware(mut req: Request, next: axum::middleware::Next) -> Result<Response, StatusCode> {
    let path = req.uri().path().to_owned();
    if path == "/health" || path.starts_with("/ws") {
        return Ok(next.run(req).await);
    }

    let token = match token_from_request(req.headers(), None) {
        Some(t) => t,
        None => {
            tracing::debug!("Rejected {} without a bearer token", path);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let validator = req
        .extensions()
        .get::<AppState>()
        .map(|state| state.validator.clone())
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    let user = validator.validate(&token).await?;

    req.extensions_mut().insert(user);

    tracing::debug!("Authenticated user: {}", user.user_id);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret";

    #[tokio::test]
    async fn issued_token_validates_to_same_user() {
        let token = generate_token(42, Role::Supervisor, SECRET, 3600).unwrap();
        let user = JwtValidator::new(SECRET).validate(&token).await.unwrap();
        assert_eq!(user, AuthenticatedUser { user_id: 42, role: Role::Supervisor });
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthorized() {
        let token = generate_token(42, Role::Scout, "other", 3600).unwrap();
        let err = JwtValidator::new(SECRET).validate(&token).await.unwrap_err();
        assert_eq!(err, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn header_wins_over_query_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(token_from_request(&headers, Some("from-query")), Some("from-query".to_string()));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(token_from_request(&headers, Some("from-query")), Some("from-header".to_string()));

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(token_from_request(&basic, None), None);
    }
}
