//! Metrics exposition backend — Prometheus text format
//!
//! Usually mounted through the `METRICS_ENDPOINT` synthetic app, where the
//! random-looking path doubles as an auth token in the URL.

use super::{Handler, HttpRequest, HttpResponse, RequestContext};
use crate::server::metrics::EdgeMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::StatusCode;
use http_body_util::Full;
use std::sync::Arc;

pub struct PromMetricsBackend {
    metrics: Arc<EdgeMetrics>,
}

impl PromMetricsBackend {
    pub fn new(metrics: Arc<EdgeMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Handler for PromMetricsBackend {
    async fn handle(&self, _req: HttpRequest, _ctx: &RequestContext) -> HttpResponse {
        http::Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(self.metrics.render_prometheus())))
            .expect("static response")
    }
}
