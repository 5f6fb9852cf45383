use h1loop::http::body::ChunkedDecoder;
use h1loop::http::parser::ParseError;
use h1loop::memory::{BlockChain, MemoryPool};
use h1loop::socket::{ProduceEndType, SocketOutput};

/// Small deterministic generator so fragment sizes vary between runs of
/// the same test without pulling in a randomness crate.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize % bound) + 1
    }
}

async fn encode(pieces: &[Vec<u8>]) -> Vec<u8> {
    let output = SocketOutput::new(MemoryPool::new(), None, None);
    for piece in pieces {
        output.write(piece, true).unwrap();
    }
    output.write_chunked_end().unwrap();
    output.end(ProduceEndType::SocketShutdownSend);

    let mut encoded = Vec::new();
    output.run_flusher(&mut encoded).await;
    encoded
}

/// Decode `encoded` as it would arrive in fragments of random size, with a
/// read buffer of random size.
fn decode_fragmented(encoded: &[u8], rng: &mut Lcg) -> Result<Vec<u8>, ParseError> {
    let mut chain = BlockChain::new(MemoryPool::new());
    let mut decoder = ChunkedDecoder::new();
    let mut decoded = Vec::new();
    let mut fed = 0;

    while !decoder.is_complete() {
        if fed == encoded.len() {
            return Err(ParseError::UnexpectedEof);
        }
        let end = (fed + rng.next(64)).min(encoded.len());
        chain.append(&encoded[fed..end]).unwrap();
        fed = end;

        loop {
            let mut out = vec![0u8; rng.next(32)];
            let mut cursor = chain.cursor_at_start();
            let n = decoder.decode(&mut cursor, &mut out)?;
            let to = cursor.position();
            let consumed = chain.consume_to(to);
            decoded.extend_from_slice(&out[..n]);
            if consumed == 0 || decoder.is_complete() {
                break;
            }
        }
    }
    assert_eq!(fed, encoded.len(), "decoder finished before the terminator");
    Ok(decoded)
}

#[tokio::test]
async fn test_round_trip_with_arbitrary_fragmentation() {
    let mut rng = Lcg(42);
    let pieces: Vec<Vec<u8>> = (0..40)
        .map(|i| {
            let len = rng.next(300);
            (0..len).map(|j| (i * 7 + j) as u8).collect()
        })
        .collect();
    let expected: Vec<u8> = pieces.concat();

    let encoded = encode(&pieces).await;
    assert!(encoded.ends_with(b"0\r\n\r\n"));

    for seed in 0..20 {
        let mut rng = Lcg(seed);
        assert_eq!(decode_fragmented(&encoded, &mut rng).unwrap(), expected, "seed {seed}");
    }
}

#[tokio::test]
async fn test_round_trip_across_pool_blocks() {
    let pieces = vec![vec![b'x'; 10_000], vec![b'y'; 5_000]];
    let encoded = encode(&pieces).await;
    assert!(encoded.starts_with(b"2710\r\n"));

    let mut rng = Lcg(7);
    assert_eq!(decode_fragmented(&encoded, &mut rng).unwrap(), pieces.concat());
}

#[tokio::test]
async fn test_empty_body() {
    let encoded = encode(&[]).await;
    assert_eq!(encoded, b"0\r\n\r\n");

    let mut rng = Lcg(1);
    assert!(decode_fragmented(&encoded, &mut rng).unwrap().is_empty());
}

#[test]
fn test_extensions_and_trailers_are_skipped() {
    let encoded = b"4;name=value\r\nWiki\r\n5 ; a=b\r\npedia\r\n0\r\nExpires: never\r\nX-Sum: 1\r\n\r\n";
    let mut rng = Lcg(3);
    assert_eq!(decode_fragmented(encoded, &mut rng).unwrap(), b"Wikipedia");
}

#[test]
fn test_uppercase_hex_sizes() {
    let mut encoded = b"1A\r\n".to_vec();
    encoded.extend_from_slice(&[b'z'; 26]);
    encoded.extend_from_slice(b"\r\n0\r\n\r\n");
    let mut rng = Lcg(5);
    assert_eq!(decode_fragmented(&encoded, &mut rng).unwrap(), vec![b'z'; 26]);
}

#[test]
fn test_malformed_chunks_are_rejected() {
    let cases: [&[u8]; 4] = [
        b"zz\r\nhello\r\n0\r\n\r\n",
        b"5\r\nhelloXX0\r\n\r\n",
        b"\r\n0\r\n\r\n",
        b"fffffffffffffffffff\r\n",
    ];
    for encoded in cases {
        let mut rng = Lcg(9);
        assert_eq!(
            decode_fragmented(encoded, &mut rng).unwrap_err(),
            ParseError::InvalidChunk,
            "{}",
            String::from_utf8_lossy(encoded)
        );
    }
}

#[test]
fn test_truncated_body_reports_eof() {
    let mut rng = Lcg(11);
    assert_eq!(
        decode_fragmented(b"5\r\nhel", &mut rng).unwrap_err(),
        ParseError::UnexpectedEof
    );
}
