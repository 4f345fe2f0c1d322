//! Static bearer token (+ basic auth) based authentication

use super::{Handler, HttpRequest, HttpResponse, RequestContext};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::StatusCode;
use http_body_util::Full;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Wraps another backend; only requests presenting the expected token get
/// through. The token can arrive as `Bearer <token>` or — for clients that
/// can only do basic auth — as the basic-auth password with username `""`
/// or `"x"`.
pub struct AuthBackend {
    expected_bearer_token: String,
    authorized_backend: Arc<dyn Handler>,
}

impl AuthBackend {
    pub fn new(bearer_token: impl Into<String>, authorized_backend: Arc<dyn Handler>) -> Self {
        Self {
            expected_bearer_token: bearer_token.into(),
            authorized_backend,
        }
    }
}

#[async_trait]
impl Handler for AuthBackend {
    async fn handle(&self, mut req: HttpRequest, ctx: &RequestContext) -> HttpResponse {
        if authorize(&req, &self.expected_bearer_token) {
            // the token is for us, not for the origin
            req.headers_mut().remove(AUTHORIZATION);
            self.authorized_backend.handle(req, ctx).await
        } else {
            http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(
                    WWW_AUTHENTICATE,
                    r#"Basic realm="Use Authorization: Bearer or provide it as password""#,
                )
                .body(Full::new(bytes::Bytes::new()))
                .expect("static response")
        }
    }
}

fn authorize(req: &HttpRequest, expected_bearer_token: &str) -> bool {
    let authorization = match req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(value) if !value.is_empty() => value,
        _ => return false,
    };

    let given_token = extract_token(authorization).unwrap_or_default();

    // timing must not leak how many prefix bytes matched
    given_token
        .as_bytes()
        .ct_eq(expected_bearer_token.as_bytes())
        .into()
}

/// Grab the bearer token, or the token smuggled as a basic-auth password
fn extract_token(authorization: &str) -> Option<String> {
    if let Some(token) = authorization.strip_prefix("Bearer ") {
        return Some(token.to_string());
    }

    let encoded = authorization.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;

    // expecting empty username, or "x" where a username is mandatory
    if !username.is_empty() && username != "x" {
        return None;
    }

    Some(password.to_string())
}
