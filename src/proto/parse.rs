//! Request head parsing and canonicalization.
//!
//! The daemon parses just enough HTTP to frame a request: the request line,
//! the header block, and the three headers it acts on (`expect`,
//! `connection`, `content-length`). Everything is re-emitted in canonical
//! form for the worker: lower-cased keys, trimmed values, one synthetic
//! `x-remote-ip` line when configured.

use http::{Method, Version};
use tracing::{debug, trace};

use super::{
    ConnectionHeader, ProtoRequest, Refusal, MAX_HEADER_BLOCK, MIN_HEAD_SIZE, PREFIX_SIZE,
};

const MAX_HEADERS: usize = 100;

/// Outcome of one attempt to parse a request head out of buffered bytes.
#[derive(Debug)]
pub(crate) enum HeadParse {
    /// No terminator yet; read more.
    Incomplete,
    /// Refuse the connection with a status line.
    Refuse(Refusal),
    /// A head was parsed; `consumed` bytes of input are spoken for.
    Complete {
        req: ProtoRequest,
        consumed: usize,
    },
}

fn known_method(raw: &str) -> Option<Method> {
    match raw {
        "GET" | "POST" | "HEAD" | "PUT" | "DELETE" | "CONNECT" | "OPTIONS" | "PATCH"
        | "TRACE" => Method::from_bytes(raw.as_bytes()).ok(),
        _ => None,
    }
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn parse_content_length(value: &[u8]) -> Option<usize> {
    if value.is_empty() {
        return None;
    }
    let mut total: usize = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return None;
        }
        total = total
            .checked_mul(10)?
            .checked_add((b - b'0') as usize)?;
    }
    Some(total)
}

fn connection_disposition(value: &[u8]) -> ConnectionHeader {
    if value.eq_ignore_ascii_case(b"keep-alive") {
        ConnectionHeader::KeepAlive
    } else if value.eq_ignore_ascii_case(b"close") {
        ConnectionHeader::Close
    } else {
        let lowered: Vec<u8> = value.to_ascii_lowercase();
        if lowered
            .windows(b"upgrade".len())
            .any(|w| w == b"upgrade")
        {
            ConnectionHeader::Upgrade
        } else {
            ConnectionHeader::Unknown
        }
    }
}

/// Parses one request head from `buf`, producing the canonicalized
/// [`ProtoRequest`]. `remote_ip` is the peer address to inject as
/// `x-remote-ip`, already formatted, or `None` when not configured.
pub(crate) fn parse_head(buf: &[u8], remote_ip: Option<&str>) -> HeadParse {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() >= MAX_HEADER_BLOCK {
                debug!(buffered = buf.len(), "no end of headers in window");
                return HeadParse::Refuse(Refusal::HeadersTooLarge);
            }
            return HeadParse::Incomplete;
        }
        Err(err) => {
            debug!(%err, "refusing unparseable head");
            return HeadParse::Refuse(Refusal::BadRequest);
        }
    };
    trace!(head_len, "parsed request head");

    if head_len >= MAX_HEADER_BLOCK {
        return HeadParse::Refuse(Refusal::HeadersTooLarge);
    }
    if head_len < MIN_HEAD_SIZE {
        return HeadParse::Refuse(Refusal::BadRequest);
    }

    let method = match parsed.method.and_then(known_method) {
        Some(m) => m,
        None => {
            debug!(method = ?parsed.method, "unknown method");
            return HeadParse::Refuse(Refusal::BadRequest);
        }
    };

    let path = match parsed.path {
        // Absolute-form URIs are not accepted; only origin-form.
        Some(p) if p.starts_with('/') => p,
        other => {
            debug!(path = ?other, "rejecting non-origin-form uri");
            return HeadParse::Refuse(Refusal::BadRequest);
        }
    };

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return HeadParse::Refuse(Refusal::BadRequest),
    };

    let mut expect_100 = false;
    let mut content_length = 0usize;
    let mut connection = ConnectionHeader::Unknown;

    // First pass: validate and pick out the recognized headers.
    for header in parsed.headers.iter() {
        if header.name.is_empty() || !header.name.is_ascii() {
            return HeadParse::Refuse(Refusal::BadRequest);
        }
        let value = trim_ows(header.value);
        if value.iter().any(|&b| b >= 0x80) {
            debug!(name = header.name, "non-ascii header value");
            return HeadParse::Refuse(Refusal::BadRequest);
        }

        if header.name.eq_ignore_ascii_case("expect") {
            if value.len() >= 4 && value[..4].eq_ignore_ascii_case(b"100-") {
                expect_100 = true;
            }
        } else if header.name.eq_ignore_ascii_case("connection") {
            connection = connection_disposition(value);
        } else if header.name.eq_ignore_ascii_case("content-length") {
            content_length = match parse_content_length(value) {
                Some(n) => n,
                None => {
                    debug!("invalid content-length");
                    return HeadParse::Refuse(Refusal::BadRequest);
                }
            };
        }
    }

    // Second pass: write the canonical head.
    let mut data = Vec::with_capacity(PREFIX_SIZE + head_len + 64);
    data.extend_from_slice(&[0u8; PREFIX_SIZE]);
    data.extend_from_slice(method.as_str().as_bytes());
    data.push(b' ');
    let uri_start = data.len();
    data.extend_from_slice(path.as_bytes());
    let uri_end = data.len();
    data.push(b' ');
    data.extend_from_slice(match version {
        Version::HTTP_10 => b"HTTP/1.0",
        _ => b"HTTP/1.1",
    });
    data.extend_from_slice(b"\r\n");

    if let Some(ip) = remote_ip {
        data.extend_from_slice(b"x-remote-ip: ");
        data.extend_from_slice(ip.as_bytes());
        data.extend_from_slice(b"\r\n");
    }

    for header in parsed.headers.iter() {
        for &b in header.name.as_bytes() {
            data.push(b.to_ascii_lowercase());
        }
        data.extend_from_slice(b": ");
        data.extend_from_slice(trim_ows(header.value));
        data.extend_from_slice(b"\r\n");
    }
    data.extend_from_slice(b"\r\n");

    let headers_length = data.len();
    HeadParse::Complete {
        req: ProtoRequest {
            valid: false,
            expect_100,
            content_length,
            headers_length,
            method,
            uri: uri_start..uri_end,
            connection,
            version,
            data,
        },
        consumed: head_len,
    }
}

/// One step of request assembly.
#[derive(Debug)]
pub(crate) enum Step {
    /// Nothing actionable; feed more bytes.
    More,
    /// Emit `HTTP/1.x 100 continue` to the client now, before the body.
    Continue100(Version),
    /// A complete, valid request ready for the waiting list.
    Request(ProtoRequest),
    /// Protocol violation; answer and reset.
    Refused(Refusal),
}

/// Incremental request assembly over a connection's byte stream.
///
/// Bytes go in with [`push`](Assembler::push); [`step`](Assembler::step) is
/// called until it returns [`Step::More`] or [`Step::Refused`]. Bytes past
/// the current message stay buffered as the start of a pipelined follow-up.
pub(crate) struct Assembler {
    leftover: Vec<u8>,
    pending: Option<ProtoRequest>,
    continue_pending: bool,
    remote_ip: Option<String>,
    max_request_size: usize,
}

impl Assembler {
    pub(crate) fn new(max_request_size: usize, remote_ip: Option<String>) -> Assembler {
        Assembler {
            leftover: Vec::new(),
            pending: None,
            continue_pending: false,
            remote_ip,
            max_request_size,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.leftover.extend_from_slice(bytes);
    }

    /// True while a head has been parsed and body bytes are outstanding.
    pub(crate) fn reading_body(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn step(&mut self) -> Step {
        loop {
            if let Some(req) = self.pending.as_mut() {
                if self.continue_pending {
                    self.continue_pending = false;
                    return Step::Continue100(req.version);
                }
                if !self.leftover.is_empty() && !req.is_complete() {
                    let take = req.missing().min(self.leftover.len());
                    req.data.extend_from_slice(&self.leftover[..take]);
                    self.leftover.drain(..take);
                }
                if req.is_complete() {
                    let mut req = self.pending.take().expect("pending checked");
                    req.valid = true;
                    return Step::Request(req);
                }
                return Step::More;
            }

            if self.leftover.is_empty() {
                return Step::More;
            }

            match parse_head(&self.leftover, self.remote_ip.as_deref()) {
                HeadParse::Incomplete => return Step::More,
                HeadParse::Refuse(refusal) => return Step::Refused(refusal),
                HeadParse::Complete { mut req, consumed } => {
                    self.leftover.drain(..consumed);
                    if req.total_size() > self.max_request_size {
                        debug!(
                            total = req.total_size(),
                            limit = self.max_request_size,
                            "request over size limit"
                        );
                        return Step::Refused(Refusal::BodyTooLarge);
                    }
                    if req.content_length == 0 {
                        req.valid = true;
                        return Step::Request(req);
                    }
                    self.continue_pending = req.expect_100;
                    self.pending = Some(req);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIG: usize = 10 * 1024 * 1024;

    fn assemble(input: &[u8]) -> Step {
        let mut asm = Assembler::new(BIG, None);
        asm.push(input);
        asm.step()
    }

    fn expect_request(step: Step) -> ProtoRequest {
        match step {
            Step::Request(req) => req,
            other => panic!("expected request, got {:?}", other),
        }
    }

    fn expect_refusal(step: Step) -> Refusal {
        match step {
            Step::Refused(r) => r,
            other => panic!("expected refusal, got {:?}", other),
        }
    }

    #[test]
    fn minimal_get() {
        let req = expect_request(assemble(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n"));
        assert!(req.valid);
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.uri(), "/x");
        assert_eq!(req.version, Version::HTTP_11);
        assert_eq!(req.content_length, 0);
        assert!(req.is_complete());
        assert_eq!(req.data.len(), req.headers_length + req.content_length);
    }

    #[test]
    fn head_is_canonicalized() {
        let req = expect_request(assemble(
            b"GET / HTTP/1.1\r\nHoSt:  example.com \r\nX-Weird-CASE: yes\r\n\r\n",
        ));
        let text = std::str::from_utf8(&req.data[PREFIX_SIZE..]).unwrap();
        assert_eq!(
            text,
            "GET / HTTP/1.1\r\nhost: example.com\r\nx-weird-case: yes\r\n\r\n"
        );
    }

    #[test]
    fn remote_ip_leads_the_header_block() {
        let mut asm = Assembler::new(BIG, Some("10.1.2.3".into()));
        asm.push(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let req = expect_request(asm.step());
        let text = std::str::from_utf8(&req.data[PREFIX_SIZE..]).unwrap();
        assert!(
            text.starts_with("GET / HTTP/1.1\r\nx-remote-ip: 10.1.2.3\r\nhost: h\r\n"),
            "{:?}",
            text
        );
    }

    #[test]
    fn keys_lowercased_values_ascii() {
        let req = expect_request(assemble(b"GET / HTTP/1.1\r\nABC-Def: V\r\n\r\n"));
        let text = std::str::from_utf8(&req.data).unwrap();
        assert!(text.contains("abc-def: V\r\n"));

        assert_eq!(
            expect_refusal(assemble(b"GET / HTTP/1.1\r\nk: v\xc3\xa9\r\n\r\n")),
            Refusal::BadRequest
        );
    }

    #[test]
    fn connection_dispositions() {
        let cases: &[(&[u8], ConnectionHeader)] = &[
            (b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", ConnectionHeader::KeepAlive),
            (b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n", ConnectionHeader::KeepAlive),
            (b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", ConnectionHeader::Close),
            (b"GET / HTTP/1.1\r\nConnection: Upgrade, keep-alive\r\n\r\n", ConnectionHeader::Upgrade),
            (b"GET / HTTP/1.1\r\nConnection: whatever\r\n\r\n", ConnectionHeader::Unknown),
            (b"GET / HTTP/1.1\r\n\r\n", ConnectionHeader::Unknown),
        ];
        for (input, expected) in cases {
            let req = expect_request(assemble(input));
            assert_eq!(req.connection, *expected, "{:?}", std::str::from_utf8(input));
        }
    }

    #[test]
    fn content_length_is_overflow_guarded() {
        assert_eq!(
            expect_refusal(assemble(
                b"POST / HTTP/1.1\r\nContent-Length: 99999999999999999999999999\r\n\r\n"
            )),
            Refusal::BadRequest
        );
        assert_eq!(
            expect_refusal(assemble(b"POST / HTTP/1.1\r\nContent-Length: 1x\r\n\r\n")),
            Refusal::BadRequest
        );
        assert_eq!(
            expect_refusal(assemble(b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n")),
            Refusal::BadRequest
        );
    }

    #[test]
    fn rejects_absolute_form_and_odd_methods() {
        assert_eq!(
            expect_refusal(assemble(b"GET http://h/ HTTP/1.1\r\n\r\n")),
            Refusal::BadRequest
        );
        assert_eq!(
            expect_refusal(assemble(b"BREW /coffee HTTP/1.1\r\nHost: h\r\n\r\n")),
            Refusal::BadRequest
        );
    }

    #[test]
    fn rejects_unknown_version() {
        assert_eq!(
            expect_refusal(assemble(b"GET / HTTP/2.0\r\nHost: h\r\n\r\n")),
            Refusal::BadRequest
        );
    }

    #[test]
    fn partial_head_waits_for_more() {
        let mut asm = Assembler::new(BIG, None);
        asm.push(b"GET / HTTP/1.1\r\n\r");
        assert!(matches!(asm.step(), Step::More));
    }

    #[test]
    fn header_block_window_boundary() {
        // Exactly 16 KiB minus the final CRLF: accepted.
        let mut head = b"GET / HTTP/1.1\r\n".to_vec();
        let pad = MAX_HEADER_BLOCK - 2 - head.len() - b"x-pad: \r\n\r\n".len();
        head.extend_from_slice(b"x-pad: ");
        head.extend(std::iter::repeat(b'a').take(pad));
        head.extend_from_slice(b"\r\n\r\n");
        assert_eq!(head.len(), MAX_HEADER_BLOCK - 2);
        let req = expect_request(assemble(&head));
        assert!(req.valid);

        // Exactly 16 KiB: refused.
        let mut head = b"GET / HTTP/1.1\r\n".to_vec();
        let pad = MAX_HEADER_BLOCK - head.len() - b"x-pad: \r\n\r\n".len();
        head.extend_from_slice(b"x-pad: ");
        head.extend(std::iter::repeat(b'a').take(pad));
        head.extend_from_slice(b"\r\n\r\n");
        assert_eq!(head.len(), MAX_HEADER_BLOCK);
        assert_eq!(expect_refusal(assemble(&head)), Refusal::HeadersTooLarge);
    }

    #[test]
    fn no_terminator_in_window_is_431() {
        // 20 KiB of header bytes with no blank line anywhere.
        let mut input = b"GET / HTTP/1.1\r\n".to_vec();
        while input.len() < 20 * 1024 {
            input.extend_from_slice(b"x-pad: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        assert_eq!(expect_refusal(assemble(&input)), Refusal::HeadersTooLarge);
    }

    #[test]
    fn body_size_boundary() {
        let head = b"POST / HTTP/1.1\r\nhost: h\r\ncontent-length: 5\r\n\r\n";
        let head_no_prefix = {
            let req = expect_request(assemble(b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n"));
            // same canonical head size, content-length digit differs by none
            req.headers_length - PREFIX_SIZE
        };

        // Exactly at the limit: accepted.
        let mut asm = Assembler::new(head_no_prefix + 5, None);
        asm.push(head);
        asm.push(b"hello");
        let req = expect_request(asm.step());
        assert_eq!(&req.data[req.headers_length..], b"hello");

        // One byte over: 413.
        let mut asm = Assembler::new(head_no_prefix + 4, None);
        asm.push(head);
        assert_eq!(expect_refusal(asm.step()), Refusal::BodyTooLarge);
    }

    #[test]
    fn expect_100_surfaces_before_body() {
        let mut asm = Assembler::new(BIG, None);
        asm.push(b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n");
        match asm.step() {
            Step::Continue100(v) => assert_eq!(v, Version::HTTP_11),
            other => panic!("expected continue, got {:?}", other),
        }
        assert!(matches!(asm.step(), Step::More));
        asm.push(b"ok");
        let req = expect_request(asm.step());
        assert!(req.expect_100);
        assert_eq!(&req.data[req.headers_length..], b"ok");
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let input = b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nxyzGET /b HTTP/1.1\r\n\r\n";
        let mut asm = Assembler::new(BIG, None);
        let mut requests = Vec::new();
        for &b in input.iter() {
            asm.push(&[b]);
            loop {
                match asm.step() {
                    Step::Request(req) => requests.push(req),
                    Step::More => break,
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].uri(), "/a");
        assert_eq!(&requests[0].data[requests[0].headers_length..], b"xyz");
        assert_eq!(requests[1].uri(), "/b");
    }

    #[test]
    fn pipelined_pair_in_one_push() {
        let mut asm = Assembler::new(BIG, None);
        asm.push(b"GET /1 HTTP/1.1\r\nHost: h\r\n\r\nGET /2 HTTP/1.1\r\nHost: h\r\n\r\n");
        let first = expect_request(asm.step());
        let second = expect_request(asm.step());
        assert_eq!(first.uri(), "/1");
        assert_eq!(second.uri(), "/2");
        assert!(matches!(asm.step(), Step::More));
    }
}
