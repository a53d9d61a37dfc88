//! First-packet HTTP summaries for the relay log
//!
//! The relay is byte-exact TCP; this module is a passive observer. The pumps
//! hand it the first packet of each direction by reference and forward the
//! same buffer untouched. When the bytes happen to be HTTP, the exchange is
//! rendered as a single log line with method, path, status and latency.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSummary {
    pub status: u16,
    pub reason: String,
}

/// Tracks one public connection's first request/response pair.
#[derive(Debug)]
pub struct HttpExchange {
    started: Instant,
    request: Option<RequestSummary>,
}

impl Default for HttpExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpExchange {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            request: None,
        }
    }

    /// Observe the first public→local packet.
    pub fn observe_request(&mut self, data: &[u8]) {
        if self.request.is_none() {
            self.request = parse_request(data);
        }
    }

    /// Observe the first local→public packet. Returns the rendered log line
    /// together with the status and elapsed time when both directions
    /// parsed as HTTP.
    pub fn observe_response(&mut self, data: &[u8]) -> Option<(String, u16, Duration)> {
        let request = self.request.as_ref()?;
        let response = parse_response(data)?;
        let elapsed = self.started.elapsed();
        let line = render(request, &response, elapsed);
        Some((line, response.status, elapsed))
    }
}

/// Parse the request line of an HTTP/1.x request.
#[must_use]
pub fn parse_request(data: &[u8]) -> Option<RequestSummary> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(data).ok()?;

    Some(RequestSummary {
        method: req.method?.to_string(),
        path: req.path?.to_string(),
    })
}

/// Parse the status line of an HTTP/1.x response.
#[must_use]
pub fn parse_response(data: &[u8]) -> Option<ResponseSummary> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    resp.parse(data).ok()?;

    Some(ResponseSummary {
        status: resp.code?,
        reason: resp.reason.unwrap_or("").to_string(),
    })
}

fn render(request: &RequestSummary, response: &ResponseSummary, elapsed: Duration) -> String {
    let marker = match response.status {
        200..=299 => '✓',
        400..=499 => '⚠',
        500..=599 => '✗',
        _ => '•',
    };

    let path = if request.path.is_empty() {
        "/"
    } else {
        &request.path
    };

    format!(
        "{} {:<6} {:<40} {:3} {:<15} {:4}ms",
        marker,
        request.method,
        path,
        response.status,
        response.reason,
        elapsed.as_millis(),
    )
}
