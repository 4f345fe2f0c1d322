//! Admin UI backend — plain HTML listing of the apps the router knows

use super::{text_response, Handler, HttpRequest, HttpResponse, RequestContext};
use crate::config::ConfigAccessor;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::StatusCode;
use http_body_util::Full;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

pub struct AdminBackend {
    accessor: Arc<dyn ConfigAccessor>,
}

impl AdminBackend {
    pub fn new(accessor: Arc<dyn ConfigAccessor>) -> Self {
        Self { accessor }
    }

    fn render(&self) -> String {
        let descriptions: Vec<String> = self
            .accessor
            .apps()
            .iter()
            .map(|app| app.describe())
            .collect();

        let updated = self
            .accessor
            .last_updated()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        format!(
            "<html>\n<head>\n\t<title>trellis admin</title>\n</head>\n\n<body>\n\n\
             <p>config updated at unix {}</p>\n\n<pre>\n{}\n</pre>\n\n</body>\n</html>\n",
            updated,
            descriptions.join("\n\n")
        )
    }
}

#[async_trait]
impl Handler for AdminBackend {
    async fn handle(&self, req: HttpRequest, _ctx: &RequestContext) -> HttpResponse {
        // only the exact root exists; anything else under the mount is a 404
        if req.uri().path() != "/" {
            return text_response(StatusCode::NOT_FOUND, "404 page not found");
        }

        http::Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Full::new(Bytes::from(self.render())))
            .expect("static response")
    }
}
