//! Read-only HTTP file service
//!
//! Serves a [`DriveSession`] over plain HTTP:
//! - `GET` on a file returns its content, `GET` on a folder a plain-text
//!   listing (one entry per line, folders suffixed with `/`)
//! - `HEAD` returns the same headers without a body
//! - `OPTIONS` advertises the supported methods
//!
//! Once the server context is cancelled, every request is answered with
//! `503 Service Unavailable` without touching the session.

use std::sync::Arc;

use davbridge_core::{
    domain::BackendError,
    ports::{http_date, DriveSession, EntryInfo, FileService, RequestHandler, ResponseBody},
};
use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::{HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED},
    Method, Request, Response, StatusCode,
};
use percent_encoding::percent_decode_str;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const ALLOWED_METHODS: &str = "GET, HEAD, OPTIONS";

/// [`FileService`] exposing a drive session read-only
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileService;

impl FileService for LocalFileService {
    fn bind(
        &self,
        session: Arc<dyn DriveSession>,
        ctx: CancellationToken,
    ) -> Arc<dyn RequestHandler> {
        Arc::new(FileHandler { session, ctx })
    }
}

/// Request handler bound to one session
pub struct FileHandler {
    session: Arc<dyn DriveSession>,
    ctx: CancellationToken,
}

impl FileHandler {
    /// Answers `method` on the raw (percent-encoded) request `path`
    pub async fn respond(&self, method: &Method, path: &str) -> Response<ResponseBody> {
        if self.ctx.is_cancelled() {
            return text(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable");
        }

        let head = match *method {
            Method::GET => false,
            Method::HEAD => true,
            Method::OPTIONS => {
                let mut response = text(StatusCode::OK, "");
                response
                    .headers_mut()
                    .insert(ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
                return response;
            }
            _ => {
                let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
                response
                    .headers_mut()
                    .insert(ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
                return response;
            }
        };

        let Some(path) = percent_decode(path) else {
            return text(StatusCode::BAD_REQUEST, "Invalid path");
        };

        match self.serve(&path, head).await {
            Ok(response) => response,
            Err(e) => error_response(&path, &e),
        }
    }

    async fn serve(&self, path: &str, head: bool) -> Result<Response<ResponseBody>, BackendError> {
        let info = self.session.stat(path).await?;

        let (body, content_type) = if info.is_dir {
            let entries = self.session.list(path).await?;
            (render_listing(&entries).into_bytes(), "text/plain; charset=utf-8")
        } else if head {
            (Vec::new(), "application/octet-stream")
        } else {
            (self.session.read(path).await?, "application/octet-stream")
        };
        let length = if head && !info.is_dir {
            info.size
        } else {
            body.len() as u64
        };

        let mut response = Response::new(Full::new(if head {
            Bytes::new()
        } else {
            Bytes::from(body)
        }));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        if let Some(modified) = info.modified {
            if let Ok(value) = HeaderValue::from_str(&http_date(modified)) {
                headers.insert(LAST_MODIFIED, value);
            }
        }

        debug!(path, is_dir = info.is_dir, length, "Served entry");
        Ok(response)
    }
}

#[async_trait::async_trait]
impl RequestHandler for FileHandler {
    async fn handle(&self, request: Request<Incoming>) -> Response<ResponseBody> {
        self.respond(request.method(), request.uri().path()).await
    }
}

fn render_listing(entries: &[EntryInfo]) -> String {
    entries
        .iter()
        .map(|e| {
            if e.is_dir {
                format!("{}/\n", e.name)
            } else {
                format!("{}\n", e.name)
            }
        })
        .collect()
}

fn error_response(path: &str, e: &BackendError) -> Response<ResponseBody> {
    match e {
        BackendError::NotFound(_) => text(StatusCode::NOT_FOUND, "Not found"),
        BackendError::InvalidPath(_) => text(StatusCode::BAD_REQUEST, "Invalid path"),
        BackendError::Closed => text(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable"),
        _ => {
            error!(path, error = %e, "Request failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Decodes `%XX` escapes; `None` on malformed escapes or invalid UTF-8
fn percent_decode(path: &str) -> Option<String> {
    // percent_decode_str leaves malformed escapes in place
    let well_formed = path.split('%').skip(1).all(|rest| {
        rest.as_bytes()
            .get(..2)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit))
    });
    if !well_formed {
        return None;
    }
    percent_decode_str(path)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}
