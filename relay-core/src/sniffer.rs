//! Application-protocol sniffing on the decrypted client stream.
//!
//! After the client TLS handshake completes, the proxy still doesn't know
//! which backend to route to: that requires the request's target host,
//! and for HTTP/1 and HTTP/2 that host lives at different layers (a
//! `Host:` header line vs. an HPACK-encoded `:authority` pseudo-header
//! inside a HEADERS frame). Sniffing reads just enough of the stream to
//! recover that host and decide HTTP/1 vs. HTTP/2, while buffering every
//! byte read so it can be replayed to the upstream connection byte-for-byte
//! once a backend is selected — the upstream must see exactly what the
//! client sent, sniffing is an invisible side-channel, not a rewrite.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, Duration};

use crate::error::ClientError;
use crate::registry::Protocol;

const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
/// Sanity bound on any single HTTP/2 frame read during sniffing. This is
/// not spec.md §5's hard cap (see [`MAX_HEADER_BLOCK_TOTAL`]) — it just
/// keeps one oversized frame from allocating an absurd single buffer.
const MAX_FRAME_LEN: usize = 1 << 16;
/// spec.md §5: "Per-connection memory is bounded by the sniffer replay
/// buffer... with a hard cap of 1 MiB." This bounds the *accumulated*
/// header-block across however many CONTINUATION frames arrive before
/// `END_HEADERS`, guarding against a CONTINUATION flood (many frames each
/// individually under [`MAX_FRAME_LEN`] that together grow unbounded).
const MAX_HEADER_BLOCK_TOTAL: usize = 1 << 20;
/// spec.md §4.3 step 4: "Read up to 4 KiB beyond what was already
/// consumed" before failing an HTTP/1 request with no `Host:` line.
const MAX_PREAMBLE: usize = 4096;
/// spec.md §4.3: "a read deadline (≤3 seconds for the first read..."
pub const FIRST_READ_TIMEOUT: Duration = Duration::from_secs(3);
/// spec.md §4.3: "...extended to ≤5 seconds once any data arrives)."
pub const SUBSEQUENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_CONTINUATION: u8 = 0x9;
const FLAG_END_HEADERS: u8 = 0x4;

/// Outcome of sniffing: which protocol family the client is speaking and
/// the authority (host) it asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct SniffResult {
    pub protocol_family: ProtocolFamily,
    pub authority: String,
}

/// The coarse protocol family used for backend selection. `Grpc` is not
/// distinguished here — a backend registered as `Grpc` is still reachable
/// by any HTTP/2 connection (see [`Protocol::http2_set`]); gRPC-specific
/// detection, if ever needed, belongs downstream of selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    Http1,
    Http2,
}

impl ProtocolFamily {
    pub fn as_protocol_set(&self) -> &'static [Protocol] {
        match self {
            ProtocolFamily::Http1 => Protocol::http1_set(),
            ProtocolFamily::Http2 => Protocol::http2_set(),
        }
    }
}

/// Reads from `stream` while mirroring every byte into `replay`, so the
/// caller can later hand `replay`'s contents to the upstream connection
/// before resuming a direct copy from `stream`.
///
/// Each underlying network read carries its own deadline rather than one
/// flat deadline over the whole sniff, the same way `tunnel::run_tunnel`
/// refreshes its idle deadline per read: the first read gets
/// `first_read_timeout`, and every read after any bytes have arrived gets
/// `subsequent_read_timeout`, refreshed each time.
struct TeeReader<'a, S> {
    stream: &'a mut S,
    replay: &'a mut BytesMut,
    first_read_timeout: Duration,
    subsequent_read_timeout: Duration,
    has_read_any: bool,
}

impl<'a, S: AsyncRead + Unpin> TeeReader<'a, S> {
    fn new(
        stream: &'a mut S,
        replay: &'a mut BytesMut,
        first_read_timeout: Duration,
        subsequent_read_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            replay,
            first_read_timeout,
            subsequent_read_timeout,
            has_read_any: false,
        }
    }

    async fn read_exact_tee(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let start = self.replay.len();
        loop {
            let have = self.replay.len() - start;
            if have >= len {
                break;
            }
            let mut chunk = vec![0u8; len - have];
            let deadline = if self.has_read_any {
                self.subsequent_read_timeout
            } else {
                self.first_read_timeout
            };
            let n = timeout(deadline, self.stream.read(&mut chunk))
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "sniff read deadline exceeded")
                })??;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client closed before sniffing completed",
                ));
            }
            self.has_read_any = true;
            self.replay.extend_from_slice(&chunk[..n]);
        }
        buf.copy_from_slice(&self.replay[start..start + len]);
        Ok(buf)
    }
}

/// Sniffs `stream` for its application protocol and target host.
///
/// Every byte consumed from `stream` is appended to `replay`, which the
/// caller must forward to the upstream before resuming a plain copy. Reads
/// are individually deadlined per [`TeeReader`]: `first_read_timeout` for
/// the first byte, `subsequent_read_timeout` (refreshed per read) for
/// every read after that, matching spec.md §4.3's two-stage read deadline
/// rather than one timeout spanning the whole multi-read sniff.
pub async fn sniff<S: AsyncRead + Unpin>(
    stream: &mut S,
    replay: &mut BytesMut,
    first_read_timeout: Duration,
    subsequent_read_timeout: Duration,
) -> Result<SniffResult, ClientError> {
    let mut tee = TeeReader::new(stream, replay, first_read_timeout, subsequent_read_timeout);
    let preface_candidate = tee
        .read_exact_tee(HTTP2_PREFACE.len())
        .await
        .map_err(io_to_client_error)?;

    if preface_candidate == HTTP2_PREFACE {
        let authority = sniff_http2(&mut tee).await?;
        return Ok(SniffResult {
            protocol_family: ProtocolFamily::Http2,
            authority,
        });
    }

    let authority = sniff_http1(&mut tee).await?;
    Ok(SniffResult {
        protocol_family: ProtocolFamily::Http1,
        authority,
    })
}

fn io_to_client_error(e: std::io::Error) -> ClientError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ClientError::ClientClosed,
        std::io::ErrorKind::TimedOut => ClientError::SniffTimeout,
        _ => ClientError::Malformed(e.to_string()),
    }
}

/// Reads HTTP/1 request lines up to the end of headers and pulls the
/// `Host:` value, falling back to an empty host only if headers end
/// without one (callers treat that as [`ClientError::UnknownHost`]).
async fn sniff_http1<S: AsyncRead + Unpin>(tee: &mut TeeReader<'_, S>) -> Result<String, ClientError> {
    let mut buf = Vec::new();
    loop {
        if buf.len() > MAX_PREAMBLE {
            return Err(ClientError::Malformed("HTTP/1 headers exceeded size limit".into()));
        }
        let byte = tee
            .read_exact_tee(1)
            .await
            .map_err(io_to_client_error)?;
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
    }

    extract_host_header(&buf).ok_or_else(|| ClientError::UnknownHost(String::new()))
}

fn extract_host_header(headers: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(headers).ok()?;
    for line in text.lines() {
        if line.len() > 5 && line[..5].eq_ignore_ascii_case("host:") {
            let host = line[5..].trim();
            return Some(strip_port(host).to_string());
        }
    }
    None
}

fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        return authority;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Reads HTTP/2 frames following the preface until a HEADERS block (with
/// its CONTINUATION frames, if any) is complete, decodes it with a real
/// HPACK decoder, and returns `:authority`. SETTINGS frames are decoded
/// only to stay frame-aligned; this proxy never sends a SETTINGS ACK on
/// the client connection during sniffing, since the replay (not this
/// sniffer) is the client's actual HTTP/2 peer.
async fn sniff_http2<S: AsyncRead + Unpin>(tee: &mut TeeReader<'_, S>) -> Result<String, ClientError> {
    let mut header_block = Vec::new();
    let mut saw_headers_frame = false;

    loop {
        let frame_header = tee.read_exact_tee(9).await.map_err(io_to_client_error)?;
        let length = ((frame_header[0] as usize) << 16)
            | ((frame_header[1] as usize) << 8)
            | (frame_header[2] as usize);
        let frame_type = frame_header[3];
        let flags = frame_header[4];

        if length > MAX_FRAME_LEN {
            return Err(ClientError::Malformed(format!("HTTP/2 frame too large: {length}")));
        }

        let payload = tee.read_exact_tee(length).await.map_err(io_to_client_error)?;

        match frame_type {
            FRAME_SETTINGS => {
                // Decoded only for protocol-state correctness; discarded.
            }
            FRAME_HEADERS | FRAME_CONTINUATION => {
                saw_headers_frame = true;
                let fragment = if frame_type == FRAME_HEADERS && payload.len() >= 1 {
                    strip_headers_frame_padding(&payload, frame_header[4])
                } else {
                    payload.as_slice()
                };
                // Bounds the *accumulated* header block across however many
                // CONTINUATION frames precede END_HEADERS — a per-frame
                // check alone lets a flood of just-under-MAX_FRAME_LEN
                // frames grow this buffer without limit.
                if header_block.len() + fragment.len() > MAX_HEADER_BLOCK_TOTAL {
                    return Err(ClientError::Malformed(format!(
                        "HTTP/2 header block exceeded {MAX_HEADER_BLOCK_TOTAL}-byte cap"
                    )));
                }
                header_block.extend_from_slice(fragment);
                if flags & FLAG_END_HEADERS != 0 {
                    break;
                }
            }
            _ => {
                // DATA, RST_STREAM, WINDOW_UPDATE, PING etc. before headers
                // arrive are ignored; they carry no authority information.
            }
        }
    }

    if !saw_headers_frame {
        return Err(ClientError::Malformed("stream ended before HEADERS frame".into()));
    }

    decode_authority(&header_block)
}

const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// Strips the HEADERS frame's optional pad-length byte, stream-dependency
/// and priority-weight fields, and trailing padding, leaving just the
/// header-block fragment.
fn strip_headers_frame_padding(payload: &[u8], flags: u8) -> &[u8] {
    let mut start = 0usize;
    let mut pad_len = 0usize;

    if flags & FLAG_PADDED != 0 && !payload.is_empty() {
        pad_len = payload[0] as usize;
        start += 1;
    }
    if flags & FLAG_PRIORITY != 0 {
        start += 5;
    }

    let end = payload.len().saturating_sub(pad_len).max(start);
    &payload[start.min(payload.len())..end.min(payload.len())]
}

fn decode_authority(header_block: &[u8]) -> Result<String, ClientError> {
    let mut decoder = hpack::Decoder::new();
    let headers = decoder
        .decode(header_block)
        .map_err(|_| ClientError::Malformed("HPACK decode failed".into()))?;

    for (name, value) in headers {
        if name == b":authority" {
            let authority = String::from_utf8(value)
                .map_err(|_| ClientError::Malformed("non-UTF8 :authority".into()))?;
            return Ok(strip_port(&authority).to_string());
        }
    }

    Err(ClientError::UnknownHost(String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(frame_type: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len();
        let mut out = vec![
            ((len >> 16) & 0xff) as u8,
            ((len >> 8) & 0xff) as u8,
            (len & 0xff) as u8,
            frame_type,
            flags,
            0,
            0,
            0,
            0,
        ];
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn sniffs_http1_host_header() {
        let request = b"GET /path HTTP/1.1\r\nHost: api.example.com:8080\r\nAccept: */*\r\n\r\n";
        let mut cursor = Cursor::new(request.to_vec());
        let mut replay = BytesMut::new();
        let result = sniff(&mut cursor, &mut replay, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.protocol_family, ProtocolFamily::Http1);
        assert_eq!(result.authority, "api.example.com");
        assert_eq!(&replay[..], &request[..]);
    }

    #[tokio::test]
    async fn sniffs_http1_host_without_port() {
        let request = b"POST / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut cursor = Cursor::new(request.to_vec());
        let mut replay = BytesMut::new();
        let result = sniff(&mut cursor, &mut replay, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.authority, "example.com");
    }

    #[tokio::test]
    async fn missing_host_header_is_unknown_host() {
        let request = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        let mut cursor = Cursor::new(request.to_vec());
        let mut replay = BytesMut::new();
        let err = sniff(&mut cursor, &mut replay, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownHost(_)));
    }

    #[tokio::test]
    async fn http1_preamble_exceeding_cap_without_host_is_malformed() {
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        // No blank line, no Host:, long enough to blow past MAX_PREAMBLE
        // before headers ever end — exercises spec.md §4.3 step 4's 4 KiB
        // preamble budget rather than the old 64 KiB per-frame constant.
        request.extend(std::iter::repeat(b'A').take(MAX_PREAMBLE + 32));
        let mut cursor = Cursor::new(request);
        let mut replay = BytesMut::new();
        let err = sniff(&mut cursor, &mut replay, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Malformed(_)));
    }

    #[tokio::test]
    async fn sniffs_http2_authority_via_hpack() {
        let mut encoder = hpack::Encoder::new();
        let headers_block = encoder.encode(vec![
            (&b":method"[..], &b"POST"[..]),
            (&b":authority"[..], &b"grpc.example.com"[..]),
            (&b":path"[..], &b"/svc/Method"[..]),
        ]);

        let mut stream_bytes = HTTP2_PREFACE.to_vec();
        stream_bytes.extend(frame(FRAME_SETTINGS, 0, &[]));
        stream_bytes.extend(frame(FRAME_HEADERS, FLAG_END_HEADERS, &headers_block));

        let mut cursor = Cursor::new(stream_bytes.clone());
        let mut replay = BytesMut::new();
        let result = sniff(&mut cursor, &mut replay, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.protocol_family, ProtocolFamily::Http2);
        assert_eq!(result.authority, "grpc.example.com");
        assert_eq!(&replay[..], &stream_bytes[..]);
    }

    #[tokio::test]
    async fn http2_continuation_flood_exceeds_total_header_block_cap() {
        // 17 frames of 64 KiB each (one HEADERS + 16 CONTINUATION), none
        // carrying END_HEADERS, cross the 1 MiB cap well before any client
        // could legitimately still be sending a single header block —
        // this is the CONTINUATION-flood case spec.md §5 bounds.
        let chunk = vec![0u8; MAX_FRAME_LEN];
        let mut stream_bytes = HTTP2_PREFACE.to_vec();
        stream_bytes.extend(frame(FRAME_HEADERS, 0, &chunk));
        for _ in 0..20 {
            stream_bytes.extend(frame(FRAME_CONTINUATION, 0, &chunk));
        }

        let mut cursor = Cursor::new(stream_bytes);
        let mut replay = BytesMut::new();
        let err = sniff(&mut cursor, &mut replay, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Malformed(_)));
    }

    #[tokio::test]
    async fn sniff_times_out_on_silent_client() {
        struct NeverReady;
        impl AsyncRead for NeverReady {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Pending
            }
        }

        let mut stream = NeverReady;
        let mut replay = BytesMut::new();
        let err = sniff(&mut stream, &mut replay, Duration::from_millis(20), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::SniffTimeout));
    }

    /// The first read and every subsequent read carry independent
    /// deadlines: a client that delivers one byte promptly then goes
    /// silent must be governed by `subsequent_read_timeout`, not get the
    /// full run of `first_read_timeout` again or be judged against a
    /// single flat deadline covering the whole sniff.
    #[tokio::test]
    async fn subsequent_read_timeout_is_independent_of_first_read_timeout() {
        struct OneByteThenSilence {
            yielded: bool,
        }
        impl AsyncRead for OneByteThenSilence {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                if !self.yielded {
                    self.yielded = true;
                    buf.put_slice(b"P");
                    std::task::Poll::Ready(Ok(()))
                } else {
                    std::task::Poll::Pending
                }
            }
        }

        let mut stream = OneByteThenSilence { yielded: false };
        let mut replay = BytesMut::new();
        let err = tokio::time::timeout(
            Duration::from_millis(500),
            sniff(&mut stream, &mut replay, Duration::from_secs(5), Duration::from_millis(20)),
        )
        .await
        .expect("subsequent_read_timeout must fire well before first_read_timeout would")
        .unwrap_err();
        assert!(matches!(err, ClientError::SniffTimeout));
    }

    #[test]
    fn strip_port_handles_ipv6_literal() {
        assert_eq!(strip_port("[::1]:443"), "[::1]:443");
    }

    #[test]
    fn strip_port_strips_numeric_port() {
        assert_eq!(strip_port("example.com:443"), "example.com");
    }
}
