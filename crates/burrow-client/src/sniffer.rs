//! HTTP traffic observer for tunneled splices.
//!
//! Each direction of an HTTP splice tees its bytes into a scanner task.
//! Scanners accumulate chunks and parse HTTP/1.x messages with
//! `httparse`; a message is only drained from the buffer once it is
//! complete, so arbitrary chunk boundaries and pipelined messages both
//! work without restore bookkeeping. Completed requests and responses
//! meet in a pairing queue that prints one line per exchange, strictly
//! request before its own response. Parsing trouble never affects the
//! splice. HTTP/2 is not supported.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Local;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::trace;

const MAX_HEADERS: usize = 100;
/// How much of a response body makes it into the log line.
const BODY_PREFIX_LEN: usize = 50;

/// A parsed request, reduced to what the log line needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
}

/// A parsed response, reduced to what the log line needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub status: u16,
    pub body_prefix: String,
}

#[derive(Default)]
struct PairQueue {
    requests: VecDeque<RequestRecord>,
    responses: VecDeque<ResponseRecord>,
}

/// Pairing queue shared by the two scanner tasks of a splice.
#[derive(Default)]
pub struct TrafficLog {
    queue: Mutex<PairQueue>,
    pairs: AtomicUsize,
}

impl TrafficLog {
    /// Queue a request; returns the formatted line when it completes a pair.
    pub fn record_request(&self, record: RequestRecord) -> Option<String> {
        let mut queue = self.queue.lock().expect("traffic log lock poisoned");
        queue.requests.push_back(record);
        self.pop_pair(&mut queue)
    }

    /// Queue a response; returns the formatted line when it completes a pair.
    pub fn record_response(&self, record: ResponseRecord) -> Option<String> {
        let mut queue = self.queue.lock().expect("traffic log lock poisoned");
        queue.responses.push_back(record);
        self.pop_pair(&mut queue)
    }

    /// Number of exchanges logged so far.
    pub fn pairs_logged(&self) -> usize {
        self.pairs.load(Ordering::Relaxed)
    }

    fn pop_pair(&self, queue: &mut PairQueue) -> Option<String> {
        if queue.requests.is_empty() || queue.responses.is_empty() {
            return None;
        }
        let request = queue.requests.pop_front()?;
        let response = queue.responses.pop_front()?;
        self.pairs.fetch_add(1, Ordering::Relaxed);
        Some(format_pair(&request, &response))
    }
}

fn format_pair(request: &RequestRecord, response: &ResponseRecord) -> String {
    let timestamp = Local::now().format("%Y/%m/%d - %H:%M:%S");
    let mut line = format!(
        "{} | {:<7} {:<30} | {:<3}",
        timestamp, request.method, request.path, response.status
    );
    if !response.body_prefix.is_empty() {
        line.push_str(" | ");
        line.push_str(&response.body_prefix);
    }
    line
}

/// Drain a request-direction tap until the splice closes it.
pub async fn observe_requests(mut tap: UnboundedReceiver<Vec<u8>>, log: Arc<TrafficLog>) {
    let mut scanner = RequestScanner::new();
    while let Some(chunk) = tap.recv().await {
        for record in scanner.feed(&chunk) {
            if let Some(line) = log.record_request(record) {
                println!("{line}");
            }
        }
    }
    trace!("request tap closed");
}

/// Drain a response-direction tap until the splice closes it.
pub async fn observe_responses(mut tap: UnboundedReceiver<Vec<u8>>, log: Arc<TrafficLog>) {
    let mut scanner = ResponseScanner::new();
    while let Some(chunk) = tap.recv().await {
        for record in scanner.feed(&chunk) {
            if let Some(line) = log.record_response(record) {
                println!("{line}");
            }
        }
    }
    trace!("response tap closed");
}

enum Scan<T> {
    Complete(T, usize),
    Incomplete,
    Invalid,
}

/// Incremental HTTP/1.x request scanner.
#[derive(Default)]
pub struct RequestScanner {
    buf: Vec<u8>,
}

impl RequestScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every request it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RequestRecord> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            match try_parse_request(&self.buf) {
                Scan::Complete(record, consumed) => {
                    out.push(record);
                    self.buf.drain(..consumed);
                }
                Scan::Incomplete => break,
                Scan::Invalid => {
                    // mid-stream garbage is unrecoverable; stop watching
                    self.buf.clear();
                    break;
                }
            }
        }
        out
    }
}

/// Incremental HTTP/1.x response scanner.
#[derive(Default)]
pub struct ResponseScanner {
    buf: Vec<u8>,
}

impl ResponseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every response it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ResponseRecord> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            match try_parse_response(&self.buf) {
                Scan::Complete(record, consumed) => {
                    out.push(record);
                    self.buf.drain(..consumed);
                }
                Scan::Incomplete => break,
                Scan::Invalid => {
                    self.buf.clear();
                    break;
                }
            }
        }
        out
    }
}

fn try_parse_request(buf: &[u8]) -> Scan<RequestRecord> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let header_len = match request.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Scan::Incomplete,
        Err(_) => return Scan::Invalid,
    };

    let (content_length, chunked) = body_framing(request.headers);
    let Some(body_total) = body_len(&buf[header_len..], content_length, chunked, false) else {
        return Scan::Incomplete;
    };

    let record = RequestRecord {
        method: request.method.unwrap_or("").to_string(),
        path: request.path.unwrap_or("").to_string(),
    };
    Scan::Complete(record, header_len + body_total)
}

fn try_parse_response(buf: &[u8]) -> Scan<ResponseRecord> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let header_len = match response.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Scan::Incomplete,
        Err(_) => return Scan::Invalid,
    };

    let status = response.code.unwrap_or(0);
    // 1xx, 204 and 304 carry no body regardless of headers
    let no_body = matches!(status, 100..=199 | 204 | 304);

    let (content_length, chunked) = body_framing(response.headers);
    let Some(body_total) = body_len(&buf[header_len..], content_length, chunked, no_body) else {
        return Scan::Incomplete;
    };

    let body = &buf[header_len..header_len + body_total];
    let prefix_len = body.len().min(BODY_PREFIX_LEN);
    let record = ResponseRecord {
        status,
        body_prefix: String::from_utf8_lossy(&body[..prefix_len]).into_owned(),
    };
    Scan::Complete(record, header_len + body_total)
}

fn body_framing(headers: &[httparse::Header<'_>]) -> (Option<usize>, bool) {
    let mut content_length = None;
    let mut chunked = false;

    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse().ok());
        }
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = String::from_utf8_lossy(header.value);
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
    }
    (content_length, chunked)
}

/// Bytes of body present after the headers, or `None` while incomplete.
///
/// Messages with neither framing header are treated as header-delimited;
/// connection-delimited bodies would otherwise stall the pairing queue.
fn body_len(
    body: &[u8],
    content_length: Option<usize>,
    chunked: bool,
    no_body: bool,
) -> Option<usize> {
    if no_body {
        return Some(0);
    }
    if chunked {
        return find_chunked_end(body);
    }
    match content_length {
        Some(len) if body.len() >= len => Some(len),
        Some(_) => None,
        None => Some(0),
    }
}

/// Offset just past the final zero-length chunk, if it has arrived.
fn find_chunked_end(body: &[u8]) -> Option<usize> {
    body.windows(5)
        .position(|window| window == b"0\r\n\r\n")
        .map(|pos| pos + 5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_across_chunk_boundaries() {
        let mut scanner = RequestScanner::new();
        assert!(scanner.feed(b"GET /index.h").is_empty());
        assert!(scanner.feed(b"tml HTTP/1.1\r\nHost: demo.exam").is_empty());
        let records = scanner.feed(b"ple.com\r\n\r\n");
        assert_eq!(
            records,
            vec![RequestRecord {
                method: "GET".to_string(),
                path: "/index.html".to_string(),
            }]
        );
    }

    #[test]
    fn request_body_is_accounted_for() {
        let mut scanner = RequestScanner::new();
        let records = scanner.feed(b"POST /api HTTP/1.1\r\nContent-Length: 13\r\n\r\n{\"key\":\"val\"}");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, "POST");
        // the body was drained too: a following request still parses
        let records = scanner.feed(b"GET /next HTTP/1.1\r\n\r\n");
        assert_eq!(records[0].path, "/next");
    }

    #[test]
    fn partial_body_waits_for_the_rest() {
        let mut scanner = RequestScanner::new();
        assert!(scanner
            .feed(b"POST /api HTTP/1.1\r\nContent-Length: 5\r\n\r\nhe")
            .is_empty());
        let records = scanner.feed(b"llo");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn pipelined_requests_parse_from_one_chunk() {
        let mut scanner = RequestScanner::new();
        let records = scanner.feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "/a");
        assert_eq!(records[1].path, "/b");
    }

    #[test]
    fn response_captures_status_and_body_prefix() {
        let mut scanner = ResponseScanner::new();
        let records =
            scanner.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 200);
        assert_eq!(records[0].body_prefix, "hello world");
    }

    #[test]
    fn long_bodies_are_truncated_in_the_record() {
        let mut scanner = ResponseScanner::new();
        let body = "x".repeat(200);
        let message = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let records = scanner.feed(message.as_bytes());
        assert_eq!(records[0].body_prefix.len(), BODY_PREFIX_LEN);
    }

    #[test]
    fn no_content_statuses_complete_without_a_body() {
        let mut scanner = ResponseScanner::new();
        let records = scanner.feed(b"HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 204);
        assert_eq!(records[0].body_prefix, "");
    }

    #[test]
    fn chunked_response_completes_at_the_terminator() {
        let mut scanner = ResponseScanner::new();
        assert!(scanner
            .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n")
            .is_empty());
        let records = scanner.feed(b"0\r\n\r\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 200);
    }

    #[test]
    fn pairs_print_request_before_response_in_order() {
        let log = TrafficLog::default();

        assert!(log
            .record_request(RequestRecord {
                method: "GET".to_string(),
                path: "/first".to_string(),
            })
            .is_none());
        assert!(log
            .record_request(RequestRecord {
                method: "GET".to_string(),
                path: "/second".to_string(),
            })
            .is_none());

        let line = log
            .record_response(ResponseRecord {
                status: 200,
                body_prefix: "one".to_string(),
            })
            .unwrap();
        assert!(line.contains("GET"));
        assert!(line.contains("/first"));
        assert!(line.contains("200"));
        assert!(line.contains("one"));

        let line = log
            .record_response(ResponseRecord {
                status: 404,
                body_prefix: String::new(),
            })
            .unwrap();
        assert!(line.contains("/second"));
        assert!(line.contains("404"));

        assert_eq!(log.pairs_logged(), 2);
    }

    #[test]
    fn a_response_arriving_first_waits_for_its_request() {
        let log = TrafficLog::default();
        assert!(log
            .record_response(ResponseRecord {
                status: 200,
                body_prefix: String::new(),
            })
            .is_none());
        assert!(log
            .record_request(RequestRecord {
                method: "GET".to_string(),
                path: "/".to_string(),
            })
            .is_some());
    }

    #[test]
    fn garbage_stops_the_scanner_without_records() {
        let mut scanner = ResponseScanner::new();
        assert!(scanner.feed(b"\x00\x01\x02 not http at all").is_empty());
    }
}
