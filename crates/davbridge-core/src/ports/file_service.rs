//! File service port (driving/primary port)
//!
//! A file service turns HTTP requests into operations on a [`DriveSession`].
//! The wire protocol spoken by the service is up to the adapter; the server
//! lifecycle only needs a request handler bound to the current session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use tokio_util::sync::CancellationToken;

use super::storage_backend::DriveSession;

/// Response body type used by all handlers
pub type ResponseBody = Full<Bytes>;

/// The Unix epoch as an HTTP date
pub const EPOCH_HTTP_DATE: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// Formats `at` as an HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`)
///
/// Shared by `Last-Modified` and cookie `Expires` values.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Handles requests for a single bound session
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request<Incoming>) -> Response<ResponseBody>;
}

/// Factory binding a file service to a drive session
pub trait FileService: Send + Sync {
    /// Binds the service to `session`
    ///
    /// `ctx` is cancelled when the server stops; handlers should answer
    /// requests that arrive afterwards without touching the session.
    fn bind(&self, session: Arc<dyn DriveSession>, ctx: CancellationToken)
        -> Arc<dyn RequestHandler>;
}
