//! The request object handed to user handlers.

use std::collections::HashMap;
use std::net::IpAddr;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Version};

use crate::error::Parse;

const MAX_HEADERS: usize = 100;

/// One HTTP request, reconstructed inside the worker from the canonical
/// message the daemon framed.
///
/// Header names arrive already lower-cased; bodies are raw bytes. Query
/// string and cookies are split but not percent-decoded.
#[derive(Debug)]
pub struct Request {
    method: Method,
    version: Version,
    path: String,
    query: String,
    headers: HeaderMap,
    data: Bytes,
    body_start: usize,
}

impl Request {
    /// Parses the framed message. The daemon only ships validated heads, so
    /// failures here mean the frame was corrupted in transit.
    pub(crate) fn parse(frame: Vec<u8>) -> crate::Result<Request> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);

        let head_len = match parsed.parse(&frame) {
            Ok(httparse::Status::Complete(len)) => len,
            _ => return Err(crate::Error::new_parse(Parse::Header)),
        };

        let method = parsed
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| crate::Error::new_parse(Parse::Method))?;
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            _ => return Err(crate::Error::new_parse(Parse::Version)),
        };
        let target = parsed
            .path
            .ok_or_else(|| crate::Error::new_parse(Parse::Uri))?;
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_owned(), q.to_owned()),
            None => (target.to_owned(), String::new()),
        };

        let mut map = HeaderMap::with_capacity(parsed.headers.len());
        for header in parsed.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| crate::Error::new_parse(Parse::Header))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|_| crate::Error::new_parse(Parse::Header))?;
            map.append(name, value);
        }

        Ok(Request {
            method,
            version,
            path,
            query,
            headers: map,
            data: Bytes::from(frame),
            body_start: head_len,
        })
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The HTTP version the request was made with.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string, empty when absent.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// `key=value` pairs of the query string, in order. Keys without `=`
    /// get an empty value.
    pub fn query_pairs(&self) -> Vec<(&str, &str)> {
        if self.query.is_empty() {
            return Vec::new();
        }
        self.query
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| part.split_once('=').unwrap_or((part, "")))
            .collect()
    }

    /// All request headers, names lower-cased.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A single header value as a string, if present and visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Cookies from the `cookie` header. Later duplicates win.
    pub fn cookies(&self) -> HashMap<&str, &str> {
        let mut cookies = HashMap::new();
        if let Some(raw) = self.header("cookie") {
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.insert(name.trim(), value.trim());
                }
            }
        }
        cookies
    }

    /// The peer address, when the daemon was configured to inject it.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.header("x-remote-ip").and_then(|v| v.parse().ok())
    }

    /// The raw request body.
    pub fn body(&self) -> &[u8] {
        &self.data[self.body_start..]
    }

    /// The body as UTF-8, lossily converted.
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.body())
    }
}
