//! Request and response types exchanged with the origin server

use bytes::Bytes;
use reqwest::{Method, Url};

use super::errors::FetchError;

/// A resource request as seen by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute request URL
    pub url: Url,
}

impl ResourceRequest {
    /// Build a GET request for an absolute URL
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
        }
    }

    /// Parse a method and absolute URL, e.g. from the control socket
    pub fn parse(method: &str, url: &str) -> Result<Self, FetchError> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| FetchError::Request(format!("invalid method '{}': {}", method, e)))?;
        let url = Url::parse(url)
            .map_err(|e| FetchError::Request(format!("invalid url '{}': {}", url, e)))?;
        Ok(Self { method, url })
    }

    /// Request path component
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Whether the request targets the given origin (scheme, host and port)
    pub fn is_same_origin(&self, origin: &Url) -> bool {
        self.url.origin() == origin.origin()
    }
}

/// Response received from the origin server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    /// HTTP status code
    pub status: u16,
    /// Content-Type header, if the origin sent one
    pub content_type: Option<String>,
    /// Response body
    pub body: Bytes,
}

impl OriginResponse {
    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-success response into the matching FetchError
    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.is_success() {
            Ok(self)
        } else {
            let body = String::from_utf8_lossy(&self.body);
            Err(FetchError::from_status(self.status, &body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_method() {
        let req = ResourceRequest::parse("get", "http://localhost:8080/audio/a.mp3").unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.path(), "/audio/a.mp3");
    }

    #[test]
    fn test_same_origin_compares_scheme_host_port() {
        let origin = Url::parse("http://localhost:8080/").unwrap();
        let same = ResourceRequest::get(Url::parse("http://localhost:8080/x").unwrap());
        let other_port = ResourceRequest::get(Url::parse("http://localhost:9090/x").unwrap());
        let other_host = ResourceRequest::get(Url::parse("http://cdn.example.com/x").unwrap());

        assert!(same.is_same_origin(&origin));
        assert!(!other_port.is_same_origin(&origin));
        assert!(!other_host.is_same_origin(&origin));
    }

    #[test]
    fn test_error_for_status() {
        let ok = OriginResponse {
            status: 200,
            content_type: None,
            body: Bytes::from_static(b"ok"),
        };
        assert!(ok.error_for_status().is_ok());

        let missing = OriginResponse {
            status: 404,
            content_type: None,
            body: Bytes::from_static(b"nope"),
        };
        assert!(matches!(missing.error_for_status(), Err(FetchError::NotFound(_))));
    }
}
