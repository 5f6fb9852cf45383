use h1loop::http::parser::{HeaderLine, Parse, ParseError, StartLine, take_header, take_start_line};
use h1loop::http::request::{HttpVersion, Method};
use h1loop::http::response::StatusCode;
use h1loop::memory::{BlockChain, MemoryPool};

const MAX_LINE: usize = 8 * 1024;

#[derive(Debug, PartialEq)]
struct ParsedHead {
    start: StartLine,
    headers: Vec<(String, String)>,
    rest: Vec<u8>,
}

/// Feed `request` in `fragment`-sized pieces, retrying from the last
/// completed line after every piece the way the frame does.
fn parse_in_fragments(request: &[u8], fragment: usize) -> Result<ParsedHead, ParseError> {
    let mut chain = BlockChain::new(MemoryPool::new());
    let mut start = None;
    let mut headers = Vec::new();
    let mut fed = 0;

    loop {
        if fed < request.len() {
            let end = (fed + fragment).min(request.len());
            chain.append(&request[fed..end]).unwrap();
            fed = end;
        }

        loop {
            let mut cursor = chain.cursor_at_start();
            if start.is_none() {
                match take_start_line(&mut cursor, MAX_LINE)? {
                    Parse::Complete(line) => {
                        start = Some(line);
                        let to = cursor.position();
                        chain.consume_to(to);
                        continue;
                    }
                    Parse::Incomplete => break,
                }
            }
            match take_header(&mut cursor)? {
                Parse::Complete(HeaderLine::Field { name, value }) => {
                    headers.push((name, value));
                    let to = cursor.position();
                    chain.consume_to(to);
                }
                Parse::Complete(HeaderLine::End) => {
                    let to = cursor.position();
                    chain.consume_to(to);
                    let mut rest = chain.to_vec(chain.start(), chain.end());
                    rest.extend_from_slice(&request[fed..]);
                    return Ok(ParsedHead {
                        start: start.take().unwrap(),
                        headers,
                        rest,
                    });
                }
                Parse::Incomplete => break,
            }
        }

        if fed == request.len() {
            return Err(ParseError::UnexpectedEof);
        }
    }
}

#[test]
fn test_parse_simple_get_request() {
    let parsed = parse_in_fragments(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", usize::MAX).unwrap();

    assert_eq!(parsed.start.method, Method::GET);
    assert_eq!(parsed.start.path, "/");
    assert_eq!(parsed.start.version, HttpVersion::Http11);
    assert_eq!(parsed.headers, vec![("Host".to_string(), "example.com".to_string())]);
    assert!(parsed.rest.is_empty());
}

#[test]
fn test_body_bytes_are_left_unconsumed() {
    let parsed = parse_in_fragments(
        b"POST /api HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        usize::MAX,
    )
    .unwrap();

    assert_eq!(parsed.start.method, Method::POST);
    assert_eq!(parsed.rest, b"hello");
}

#[test]
fn test_byte_by_byte_matches_whole_buffer() {
    let request = b"PUT /upload/file.txt?overwrite=1&x=%20 HTTP/1.0\r\n\
                    Host: example.com\r\n\
                    User-Agent: test-client/1.0\r\n\
                    Accept: */*\r\n\
                    Content-Length: 3\r\n\
                    \r\n\
                    abc";

    let whole = parse_in_fragments(request, usize::MAX).unwrap();
    for fragment in 1..=17 {
        assert_eq!(parse_in_fragments(request, fragment).unwrap(), whole, "fragment {fragment}");
    }
    assert_eq!(whole.start.path, "/upload/file.txt");
    assert_eq!(whole.start.query, "?overwrite=1&x=%20");
    assert_eq!(whole.start.raw_target, "/upload/file.txt?overwrite=1&x=%20");
    assert_eq!(whole.start.version, HttpVersion::Http10);
}

#[test]
fn test_head_spanning_many_blocks() {
    let long_value = "v".repeat(6000);
    let request = format!("GET /big HTTP/1.1\r\nX-Long: {long_value}\r\nX-After: 1\r\n\r\n");

    let whole = parse_in_fragments(request.as_bytes(), usize::MAX).unwrap();
    let split = parse_in_fragments(request.as_bytes(), 1000).unwrap();
    assert_eq!(whole, split);
    assert_eq!(whole.headers[0].1.len(), 6000);
    assert_eq!(whole.headers[1], ("X-After".to_string(), "1".to_string()));
}

#[test]
fn test_header_value_whitespace_is_trimmed() {
    let parsed = parse_in_fragments(b"GET / HTTP/1.1\r\nX-Pad: \t spaced out \t\r\n\r\n", 3).unwrap();
    assert_eq!(parsed.headers[0].1, "spaced out");
}

#[test]
fn test_folded_header_is_unfolded() {
    let parsed = parse_in_fragments(
        b"GET / HTTP/1.1\r\nX-Folded: first\r\n  second\r\n\tthird\r\nHost: a\r\n\r\n",
        1,
    )
    .unwrap();
    assert_eq!(parsed.headers[0], ("X-Folded".to_string(), "first second third".to_string()));
    assert_eq!(parsed.headers[1].0, "Host");
}

#[test]
fn test_extension_method_is_kept() {
    let parsed = parse_in_fragments(b"PURGE /cache HTTP/1.1\r\n\r\n", 2).unwrap();
    assert_eq!(parsed.start.method, Method::Extension("PURGE".to_string()));
    assert_eq!(parsed.start.method.as_str(), "PURGE");
}

#[test]
fn test_incomplete_request_reports_eof() {
    assert_eq!(
        parse_in_fragments(b"GET / HTTP/1.1\r\nHost: exa", 4).unwrap_err(),
        ParseError::UnexpectedEof
    );
}

#[test]
fn test_invalid_request_lines() {
    let cases: [&[u8]; 5] = [
        b"GET /\r\n\r\n",
        b"GET  / HTTP/1.1\r\n\r\n",
        b"GET / HTTP/1.1 extra\r\n\r\n",
        b"GET / HTTP/1.1\n\r\n",
        b"G(T / HTTP/1.1\r\n\r\n",
    ];
    for request in cases {
        let err = parse_in_fragments(request, usize::MAX).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST, "{err:?}");
    }
}

#[test]
fn test_unsupported_version() {
    let err = parse_in_fragments(b"GET / HTTP/2.0\r\n\r\n", 5).unwrap_err();
    assert_eq!(err, ParseError::UnsupportedVersion("HTTP/2.0".to_string()));
    assert_eq!(err.status_code(), StatusCode::HTTP_VERSION_NOT_SUPPORTED);
}

#[test]
fn test_request_line_too_long_before_newline_arrives() {
    let mut request = b"GET /".to_vec();
    request.extend(std::iter::repeat_n(b'a', MAX_LINE + 10));

    // No CRLF yet: the limit is enforced on what is buffered.
    let err = parse_in_fragments(&request, 1024).unwrap_err();
    assert_eq!(err, ParseError::RequestLineTooLong);
    assert_eq!(err.status_code(), StatusCode::URI_TOO_LONG);
}

#[test]
fn test_invalid_header_lines() {
    let cases: [&[u8]; 4] = [
        b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n",
        b"GET / HTTP/1.1\r\n: empty\r\n\r\n",
        b"GET / HTTP/1.1\r\n folded-first: x\r\n\r\n",
        b"GET / HTTP/1.1\r\nNoColon\r\n\r\n",
    ];
    for request in cases {
        assert_eq!(
            parse_in_fragments(request, 3).unwrap_err(),
            ParseError::InvalidHeader,
            "{}",
            String::from_utf8_lossy(request)
        );
    }
}

#[test]
fn test_error_status_codes() {
    assert_eq!(ParseError::HeadersTooLarge.status_code(), StatusCode::HEADER_FIELDS_TOO_LARGE);
    assert_eq!(ParseError::TooManyHeaders.status_code(), StatusCode::HEADER_FIELDS_TOO_LARGE);
    assert_eq!(ParseError::InvalidChunk.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(ParseError::InvalidContentLength.status_code(), StatusCode::BAD_REQUEST);
}
