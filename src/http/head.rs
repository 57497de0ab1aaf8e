//! HTTP/1.x message heads and body framing.
//!
//! Head grammar is delegated to `httparse`; this module only converts the
//! parsed head into `http` types and works out where the body ends.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri, Version};

use crate::error::ProxyError;

/// Upper bound on header lines in one head.
const MAX_HEADERS: usize = 100;

/// How the body following a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body.
    Empty,
    /// Exactly this many bytes (`Content-Length`).
    Length(u64),
    /// `Transfer-Encoding: chunked`, terminated by the zero-size chunk and
    /// trailer section.
    Chunked,
    /// Everything until the peer closes the connection.
    UntilClose,
}

/// Parsed inbound request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request-target exactly as the client sent it.
    pub target: String,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// `GET` request head with no headers.
    pub fn get(target: &str) -> Self {
        Self {
            method: Method::GET,
            target: target.to_string(),
            uri: target.parse().unwrap_or_default(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Target is origin-form (`/path`) rather than absolute or authority form.
    pub fn is_relative(&self) -> bool {
        self.target.starts_with('/')
    }

    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }

    /// Client asked to switch protocols (`Connection: upgrade` + `Upgrade`).
    pub fn wants_upgrade(&self) -> bool {
        !self.is_connect()
            && self.headers.contains_key(header::UPGRADE)
            && has_token(&self.headers, header::CONNECTION, "upgrade")
    }

    pub fn expects_continue(&self) -> bool {
        self.headers
            .get(header::EXPECT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    /// Framing of the request body.
    pub fn framing(&self) -> Result<BodyFraming, ProxyError> {
        if let Some(te) = self.headers.get(header::TRANSFER_ENCODING) {
            return if last_coding_is_chunked(te) {
                Ok(BodyFraming::Chunked)
            } else {
                Err(ProxyError::Protocol(
                    "request transfer-encoding without final chunked coding".to_string(),
                ))
            };
        }
        match content_length(&self.headers)? {
            Some(0) | None => Ok(BodyFraming::Empty),
            Some(len) => Ok(BodyFraming::Length(len)),
        }
    }
}

/// Parsed outbound response head.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    pub fn is_informational(&self) -> bool {
        self.status.is_informational()
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    /// Framing of the response body, which depends on the request method.
    pub fn framing(&self, request_method: &Method) -> Result<BodyFraming, ProxyError> {
        let status = self.status;
        if status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || *request_method == Method::HEAD
        {
            return Ok(BodyFraming::Empty);
        }
        if *request_method == Method::CONNECT && status.is_success() {
            return Ok(BodyFraming::UntilClose);
        }
        if let Some(te) = self.headers.get(header::TRANSFER_ENCODING) {
            return Ok(if last_coding_is_chunked(te) {
                BodyFraming::Chunked
            } else {
                BodyFraming::UntilClose
            });
        }
        match content_length(&self.headers)? {
            Some(0) => Ok(BodyFraming::Empty),
            Some(len) => Ok(BodyFraming::Length(len)),
            None => Ok(BodyFraming::UntilClose),
        }
    }
}

/// Parse a request head from the start of `buf`. Returns the head and its
/// length in bytes, or `None` if more bytes are needed.
pub fn parse_request(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProxyError::Protocol(format!("malformed request head: {e}"))),
    };

    let method = req
        .method
        .ok_or_else(|| ProxyError::Protocol("request without method".to_string()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| ProxyError::Protocol(format!("invalid method: {e}")))?;
    let target = req
        .path
        .ok_or_else(|| ProxyError::Protocol("request without target".to_string()))?
        .to_string();
    let uri = target
        .parse::<Uri>()
        .map_err(|e| ProxyError::Protocol(format!("invalid request target '{target}': {e}")))?;

    Ok(Some((
        RequestHead {
            method,
            target,
            uri,
            version: version(req.version),
            headers: header_map(req.headers)?,
        },
        len,
    )))
}

/// Parse a response head from the start of `buf`.
pub fn parse_response(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProxyError::Protocol(format!("malformed response head: {e}"))),
    };

    let code = res
        .code
        .ok_or_else(|| ProxyError::Protocol("response without status".to_string()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|e| ProxyError::Protocol(format!("invalid status {code}: {e}")))?;

    Ok(Some((
        ResponseHead {
            status,
            reason: res.reason.unwrap_or_default().to_string(),
            version: version(res.version),
            headers: header_map(res.headers)?,
        },
        len,
    )))
}

fn version(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| ProxyError::Protocol(format!("invalid header name '{}': {e}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| ProxyError::Protocol(format!("invalid value for '{}': {e}", h.name)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn tokens<'a>(headers: &'a HeaderMap, name: HeaderName) -> impl Iterator<Item = &'a str> {
    headers
        .get_all(name)
        .into_iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
}

fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    tokens(headers, name).any(|t| t.eq_ignore_ascii_case(token))
}

fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if has_token(headers, header::CONNECTION, "close") {
        return false;
    }
    version != Version::HTTP_10 || has_token(headers, header::CONNECTION, "keep-alive")
}

fn last_coding_is_chunked(te: &HeaderValue) -> bool {
    te.to_str()
        .ok()
        .and_then(|v| v.rsplit(',').next())
        .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ProxyError> {
    let mut found: Option<u64> = None;
    for value in tokens(headers, header::CONTENT_LENGTH) {
        let len = value
            .parse::<u64>()
            .map_err(|_| ProxyError::Protocol(format!("invalid content-length '{value}'")))?;
        match found {
            Some(prev) if prev != len => {
                return Err(ProxyError::Protocol(
                    "conflicting content-length values".to_string(),
                ))
            }
            _ => found = Some(len),
        }
    }
    Ok(found)
}
