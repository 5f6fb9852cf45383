use crate::http::headers::{FrameHeaders, KnownHeader};

/// HTTP request methods.
///
/// The common methods get their own variant; any other token from the
/// request line is kept verbatim in `Extension`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// TRACE - Message loop-back test
    TRACE,
    /// CONNECT - Tunnel to the target
    CONNECT,
    /// Any other method token
    Extension(String),
}

impl Method {
    /// Parses one of the well-known HTTP methods.
    ///
    /// # Example
    ///
    /// ```
    /// # use h1loop::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "TRACE" => Some(Method::TRACE),
            "CONNECT" => Some(Method::CONNECT),
            _ => None,
        }
    }

    /// Known method or an extension token.
    pub fn from_token(token: &str) -> Self {
        Self::from_str(token).unwrap_or_else(|| Method::Extension(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::TRACE => "TRACE",
            Method::CONNECT => "CONNECT",
            Method::Extension(token) => token,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol versions this engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed request line and headers of the request in flight.
///
/// Reset between requests on a keep-alive connection.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Path component of the target (e.g., "/index.html")
    pub path: String,
    /// Query string including the leading '?', or empty
    pub query: String,
    /// Target exactly as sent
    pub raw_target: String,
    pub version: HttpVersion,
    pub headers: FrameHeaders,
}

impl Default for RequestHead {
    fn default() -> Self {
        Self {
            method: Method::GET,
            path: String::new(),
            query: String::new(),
            raw_target: String::new(),
            version: HttpVersion::Http11,
            headers: FrameHeaders::new(),
        }
    }
}

impl RequestHead {
    /// Retrieves the first value of a header (case-insensitive).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.value(key)
    }

    /// Determines whether the client allows the connection to be reused.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent.
    /// HTTP/1.0 requires an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let tokens = self.connection_tokens();
        match self.version {
            HttpVersion::Http11 => !tokens.iter().any(|t| t.eq_ignore_ascii_case("close")),
            HttpVersion::Http10 => tokens.iter().any(|t| t.eq_ignore_ascii_case("keep-alive")),
        }
    }

    /// Whether the request asked for `100 Continue` before sending its body.
    pub fn expects_continue(&self) -> bool {
        self.version == HttpVersion::Http11
            && self
                .headers
                .get_known(KnownHeader::Expect)
                .map(|v| v.iter().any(|e| e.trim().eq_ignore_ascii_case("100-continue")))
                .unwrap_or(false)
    }

    /// Whether `Connection` lists `upgrade`.
    pub fn is_upgrade(&self) -> bool {
        self.connection_tokens()
            .iter()
            .any(|t| t.eq_ignore_ascii_case("upgrade"))
    }

    /// Tokens of every `Connection` header value.
    pub fn connection_tokens(&self) -> Vec<&str> {
        self.headers
            .get_known(KnownHeader::Connection)
            .map(|values| {
                values
                    .iter()
                    .flat_map(|v| v.split(','))
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Split a request target into path and query (query keeps its '?').
pub fn split_target(target: &str) -> (&str, &str) {
    match target.find('?') {
        Some(i) => (&target[..i], &target[i..]),
        None => (target, ""),
    }
}
