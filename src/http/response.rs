//! Response head handling.
//!
//! Backend response heads lose their hop-by-hop headers before reaching the
//! client; failures before a head exists become a short plain-text gateway
//! error.

use bytes::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::http::response;
use hyper::{Response, StatusCode};

use crate::http::request::strip_hop_by_hop;
use crate::session::wire::ProxyBody;

/// Rewrite a backend response head for the client connection.
pub fn prepare_for_client(parts: &mut response::Parts) {
    strip_hop_by_hop(&mut parts.headers);
}

/// Plain-text error response generated by the proxy itself.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(ProxyBody::full(Bytes::from(format!("{message}\n"))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
