//! Request head preparation for the backend hop.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers (fixed list plus anything named in `Connection`)
//! - Adapt the request URI to the backend protocol: origin-form for
//!   HTTP/1.1, absolute-form carrying the original authority for HTTP/2
//! - Ensure HTTP/1.1 requests carry a Host header
//!
//! Everything else passes through untouched.

use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::http::{request, Uri, Version};

use crate::load_balancer::Endpoint;
use crate::net::Protocol;

const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove connection-scoped headers. `TE: trailers` survives since HTTP/2
/// backends rely on it.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    if headers
        .get(header::TE)
        .is_some_and(|v| !v.as_bytes().eq_ignore_ascii_case(b"trailers"))
    {
        headers.remove(header::TE);
    }
}

/// Rewrite a client request head for the backend connection.
pub fn prepare_for_backend(
    parts: &mut request::Parts,
    endpoint: &Endpoint,
    protocol: Protocol,
) -> Result<(), hyper::http::Error> {
    strip_hop_by_hop(&mut parts.headers);

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let authority = parts
        .uri
        .authority()
        .map(|a| a.as_str().to_owned())
        .or_else(|| {
            parts
                .headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| endpoint.authority());

    match protocol {
        Protocol::Http1 => {
            if !parts.headers.contains_key(header::HOST) {
                parts
                    .headers
                    .insert(header::HOST, HeaderValue::from_str(&authority)?);
            }
            parts.uri = Uri::builder().path_and_query(path.as_str()).build()?;
            parts.version = Version::HTTP_11;
        }
        Protocol::Http2 => {
            parts.uri = Uri::builder()
                .scheme("http")
                .authority(authority.as_str())
                .path_and_query(path.as_str())
                .build()?;
            parts.version = Version::HTTP_2;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    fn parts(builder: hyper::http::request::Builder) -> request::Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn strips_connection_scoped_headers() {
        let mut p = parts(
            Request::get("/a")
                .header("connection", "keep-alive, x-private")
                .header("keep-alive", "timeout=5")
                .header("x-private", "1")
                .header("te", "gzip")
                .header("x-kept", "yes"),
        );
        strip_hop_by_hop(&mut p.headers);
        assert!(p.headers.get("connection").is_none());
        assert!(p.headers.get("keep-alive").is_none());
        assert!(p.headers.get("x-private").is_none());
        assert!(p.headers.get("te").is_none());
        assert_eq!(p.headers["x-kept"], "yes");

        let mut t = parts(Request::get("/").header("te", "trailers"));
        strip_hop_by_hop(&mut t.headers);
        assert_eq!(t.headers["te"], "trailers");
    }

    #[test]
    fn http1_gets_origin_form_and_host() {
        let endpoint = Endpoint::new("10.0.0.1", 3000);
        let mut p = parts(Request::get("http://example.com/x?y=1"));
        prepare_for_backend(&mut p, &endpoint, Protocol::Http1).unwrap();
        assert_eq!(p.uri, "/x?y=1");
        assert_eq!(p.headers["host"], "example.com");

        let mut bare = parts(Request::get("/"));
        prepare_for_backend(&mut bare, &endpoint, Protocol::Http1).unwrap();
        assert_eq!(bare.headers["host"], "10.0.0.1:3000");
    }

    #[test]
    fn http2_gets_absolute_form() {
        let endpoint = Endpoint::new("10.0.0.1", 3000);
        let mut p = parts(Request::get("/data").header("host", "api.local"));
        prepare_for_backend(&mut p, &endpoint, Protocol::Http2).unwrap();
        assert_eq!(p.uri, "http://api.local/data");
        assert_eq!(p.version, Version::HTTP_2);
    }
}
