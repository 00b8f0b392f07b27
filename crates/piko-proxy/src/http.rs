//! Wire form of proxied HTTP requests and responses.
//!
//! Requests travelling down an upstream RPC stream (and their responses)
//! are buffered and serialized with bincode. Header names are lowercased on
//! conversion and hop-by-hop headers are dropped; each hop recomputes
//! framing headers for its own connection.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Largest request or response body the proxy will buffer.
const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// A buffered HTTP request in transit through the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxiedRequest {
    pub method: String,
    /// Path and query of the request target.
    pub uri: String,
    /// Lowercased header name/value pairs, in order, duplicates preserved.
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

/// A buffered HTTP response in transit through the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxiedResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

/// Connection-scoped headers that must not travel across hops.
fn is_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
            | "content-length"
    )
}

impl ProxiedRequest {
    /// Buffers an inbound request into its wire form.
    pub async fn from_http(req: Request<Body>) -> Result<ProxiedRequest> {
        let (parts, body) = req.into_parts();
        let uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let headers = collect_headers(&parts.headers);
        let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
            .await
            .map_err(|e| ProxyError::Codec(format!("read body: {e}")))?;
        Ok(ProxiedRequest {
            method: parts.method.as_str().to_string(),
            uri,
            headers,
            body: body.to_vec(),
        })
    }

    /// Returns the first value of the named header.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Sets the header, replacing any existing values.
    pub fn set_header(&mut self, name: &str, value: &[u8]) {
        self.headers.retain(|(n, _)| n != name);
        self.headers.push((name.to_string(), value.to_vec()));
    }

    /// Builds a [`HeaderMap`] from the stored headers, skipping any that do
    /// not parse.
    pub fn header_map(&self) -> HeaderMap {
        build_header_map(&self.headers)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProxyError::Codec(e.to_string()))
    }

    pub fn decode(buf: &[u8]) -> Result<ProxiedRequest> {
        bincode::deserialize(buf).map_err(|e| ProxyError::Codec(e.to_string()))
    }
}

impl ProxiedResponse {
    pub fn new(status: u16, body: Vec<u8>) -> ProxiedResponse {
        ProxiedResponse {
            status,
            headers: Vec::new(),
            body,
        }
    }

    /// Buffers a response from the `http` family of types.
    pub fn from_parts(status: u16, headers: &HeaderMap, body: Vec<u8>) -> ProxiedResponse {
        ProxiedResponse {
            status,
            headers: collect_headers(headers),
            body,
        }
    }

    /// Converts into a response to send back to the client.
    pub fn into_http(self) -> Response<Body> {
        let mut resp = Response::new(Body::from(self.body));
        *resp.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let headers = build_header_map(&self.headers);
        *resp.headers_mut() = headers;
        resp
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProxyError::Codec(e.to_string()))
    }

    pub fn decode(buf: &[u8]) -> Result<ProxiedResponse> {
        bincode::deserialize(buf).map_err(|e| ProxyError::Codec(e.to_string()))
    }
}

fn collect_headers(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_header(name.as_str()))
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}

fn build_header_map(headers: &[(String, Vec<u8>)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_bytes(value),
        ) {
            map.append(name, value);
        }
    }
    map
}
