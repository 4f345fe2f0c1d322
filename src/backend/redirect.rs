//! Redirect backend — sends every request somewhere else

use super::{Handler, HttpRequest, HttpResponse, RequestContext};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::LOCATION;
use http::StatusCode;
use http_body_util::Full;

pub struct RedirectBackend {
    to: String,
}

impl RedirectBackend {
    pub fn new(to: impl Into<String>) -> Self {
        Self { to: to.into() }
    }
}

#[async_trait]
impl Handler for RedirectBackend {
    async fn handle(&self, _req: HttpRequest, _ctx: &RequestContext) -> HttpResponse {
        http::Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, &self.to)
            .body(Full::new(Bytes::new()))
            .expect("static response")
    }
}
