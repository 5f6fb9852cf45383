//! Header collection used for both request and response heads.
//!
//! Headers that drive framing decisions get a fixed slot indexed by
//! `KnownHeader`; every other name goes into an ordered overflow map keyed by
//! the lower-cased name. Lookups are case-insensitive. Known headers are
//! written with their canonical spelling; other names keep the casing of
//! their first occurrence.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("headers are read-only once the response has started")]
    ReadOnly,
    #[error("invalid header name {0:?}")]
    InvalidName(String),
    #[error("invalid characters in value of header {0:?}")]
    InvalidValue(String),
}

macro_rules! known_headers {
    ($($variant:ident => $name:literal,)+) => {
        /// Header names with a dedicated slot.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum KnownHeader {
            $($variant,)+
        }

        impl KnownHeader {
            pub const ALL: &'static [KnownHeader] = &[$(KnownHeader::$variant,)+];

            /// Canonical spelling.
            pub fn name(self) -> &'static str {
                match self {
                    $(KnownHeader::$variant => $name,)+
                }
            }
        }
    };
}

known_headers! {
    CacheControl => "Cache-Control",
    Connection => "Connection",
    Date => "Date",
    KeepAlive => "Keep-Alive",
    TransferEncoding => "Transfer-Encoding",
    Upgrade => "Upgrade",
    ContentLength => "Content-Length",
    ContentType => "Content-Type",
    Accept => "Accept",
    Expect => "Expect",
    Host => "Host",
    UserAgent => "User-Agent",
    Server => "Server",
    SetCookie => "Set-Cookie",
}

const KNOWN_COUNT: usize = KnownHeader::ALL.len();

impl KnownHeader {
    /// Case-insensitive lookup of a header name.
    pub fn lookup(name: &str) -> Option<Self> {
        // Length check first keeps the common miss cheap.
        KnownHeader::ALL
            .iter()
            .copied()
            .find(|h| h.name().len() == name.len() && h.name().eq_ignore_ascii_case(name))
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Whether `b` may appear in a header name (RFC 7230 `tchar`).
pub fn is_token_char(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

/// Whether `b` may appear in a header value. Tabs are allowed, other
/// control characters are not.
pub fn is_value_char(b: u8) -> bool {
    b == b'\t' || (b >= 0x20 && b != 0x7f)
}

#[derive(Debug, Clone)]
struct ExtraEntry {
    name: String,
    values: Vec<String>,
}

/// Request or response header collection.
#[derive(Debug, Clone, Default)]
pub struct FrameHeaders {
    known: [Option<Vec<String>>; KNOWN_COUNT],
    extra: BTreeMap<String, ExtraEntry>,
    read_only: bool,
}

impl FrameHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// All values recorded for `name`.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        match KnownHeader::lookup(name) {
            Some(known) => self.get_known(known),
            None => self
                .extra
                .get(&name.to_ascii_lowercase())
                .map(|e| e.values.as_slice()),
        }
    }

    /// First value recorded for `name`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn get_known(&self, header: KnownHeader) -> Option<&[String]> {
        self.known[header.slot()].as_deref()
    }

    /// All values of a known header joined the way they would be folded on
    /// the wire.
    pub fn joined(&self, header: KnownHeader) -> Option<String> {
        self.get_known(header).map(|values| values.join(", "))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn contains_known(&self, header: KnownHeader) -> bool {
        self.known[header.slot()].is_some()
    }

    /// Add a value, keeping existing ones.
    pub fn append(&mut self, name: &str, value: impl Into<String>) -> Result<(), HeaderError> {
        let value = value.into();
        self.check_writable()?;
        validate(name, &value)?;

        match KnownHeader::lookup(name) {
            Some(known) => self.known[known.slot()].get_or_insert_with(Vec::new).push(value),
            None => self
                .extra
                .entry(name.to_ascii_lowercase())
                .or_insert_with(|| ExtraEntry {
                    name: name.to_string(),
                    values: Vec::new(),
                })
                .values
                .push(value),
        }
        Ok(())
    }

    /// Replace all values of `name` with `value`.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) -> Result<(), HeaderError> {
        self.remove(name)?;
        self.append(name, value)
    }

    pub fn set_known(&mut self, header: KnownHeader, value: impl Into<String>) -> Result<(), HeaderError> {
        self.insert(header.name(), value)
    }

    pub fn remove(&mut self, name: &str) -> Result<Option<Vec<String>>, HeaderError> {
        self.check_writable()?;
        Ok(match KnownHeader::lookup(name) {
            Some(known) => self.known[known.slot()].take(),
            None => self.extra.remove(&name.to_ascii_lowercase()).map(|e| e.values),
        })
    }

    pub fn remove_known(&mut self, header: KnownHeader) -> Result<Option<Vec<String>>, HeaderError> {
        self.check_writable()?;
        Ok(self.known[header.slot()].take())
    }

    /// Every (name, value) pair; known headers first, then the rest by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        let known = KnownHeader::ALL.iter().flat_map(move |h| {
            self.known[h.slot()]
                .iter()
                .flatten()
                .map(move |v| (h.name(), v.as_str()))
        });
        let extra = self
            .extra
            .values()
            .flat_map(|e| e.values.iter().map(move |v| (e.name.as_str(), v.as_str())));
        known.chain(extra)
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.known.iter().filter(|v| v.is_some()).count() + self.extra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reset for the next request on the same connection.
    pub fn clear(&mut self) {
        for slot in self.known.iter_mut() {
            *slot = None;
        }
        self.extra.clear();
        self.read_only = false;
    }

    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_writable(&self) -> Result<(), HeaderError> {
        if self.read_only {
            return Err(HeaderError::ReadOnly);
        }
        Ok(())
    }
}

fn validate(name: &str, value: &str) -> Result<(), HeaderError> {
    if name.is_empty() || !name.bytes().all(is_token_char) {
        return Err(HeaderError::InvalidName(name.to_string()));
    }
    if !value.bytes().all(is_value_char) {
        return Err(HeaderError::InvalidValue(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = FrameHeaders::new();
        headers.append("content-length", "10").unwrap();
        headers.append("X-Trace", "abc").unwrap();

        assert_eq!(headers.value("Content-Length"), Some("10"));
        assert_eq!(headers.get_known(KnownHeader::ContentLength).unwrap(), ["10"]);
        assert_eq!(headers.value("x-trace"), Some("abc"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn repeated_headers_accumulate() {
        let mut headers = FrameHeaders::new();
        headers.append("Transfer-Encoding", "gzip").unwrap();
        headers.append("transfer-encoding", "chunked").unwrap();
        headers.append("X-A", "1").unwrap();
        headers.append("x-a", "2").unwrap();

        assert_eq!(
            headers.joined(KnownHeader::TransferEncoding).as_deref(),
            Some("gzip, chunked")
        );
        assert_eq!(headers.get("X-A").unwrap(), ["1", "2"]);
    }

    #[test]
    fn read_only_rejects_mutation() {
        let mut headers = FrameHeaders::new();
        headers.append("Server", "test").unwrap();
        headers.set_read_only();

        assert_eq!(headers.append("X-Late", "1"), Err(HeaderError::ReadOnly));
        assert_eq!(headers.remove("Server"), Err(HeaderError::ReadOnly));
        assert_eq!(headers.value("Server"), Some("test"));

        headers.clear();
        assert!(!headers.is_read_only());
        assert!(headers.is_empty());
    }

    #[test]
    fn rejects_control_characters() {
        let mut headers = FrameHeaders::new();
        assert!(matches!(
            headers.append("X-Bad", "a\r\nInjected: yes"),
            Err(HeaderError::InvalidValue(_))
        ));
        assert!(matches!(
            headers.append("Bad Name", "v"),
            Err(HeaderError::InvalidName(_))
        ));
        assert!(headers.append("X-Tab", "a\tb").is_ok());
    }

    #[test]
    fn iter_uses_canonical_known_names() {
        let mut headers = FrameHeaders::new();
        headers.append("x-custom", "1").unwrap();
        headers.append("CONTENT-TYPE", "text/plain").unwrap();

        let pairs: Vec<_> = headers.iter().collect();
        assert_eq!(pairs, vec![("Content-Type", "text/plain"), ("x-custom", "1")]);
    }
}
