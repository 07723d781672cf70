//! Line protocol spoken on the query socket.
//!
//! Requests are single `\n`-terminated lines. `status` answers with one JSON
//! line; `info` and unknown commands produce no output.

use tracing::{debug, warn};

use super::buffer::BoundedBuffer;
use crate::tracker::SafetyTracker;

/// A parsed client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Status,
    /// Reserved for informational responses.
    Info,
    Unknown,
}

impl Request {
    /// Parse one request line (without its newline). Matching is exact.
    pub fn parse(line: &[u8]) -> Self {
        match line {
            b"status" => Request::Status,
            b"info" => Request::Info,
            _ => Request::Unknown,
        }
    }
}

/// Handle every complete request in `input`, appending responses to
/// `output` in request order.
///
/// Each request is consumed from `input` even when its response cannot be
/// queued. Returns the number of requests handled.
pub fn handle_messages(
    client: usize,
    input: &mut BoundedBuffer,
    output: &mut BoundedBuffer,
    tracker: &SafetyTracker,
) -> usize {
    let mut handled = 0;

    while let Some(line_len) = input.find_line() {
        let request = Request::parse(&input.as_slice()[..line_len]);

        match respond(request, tracker) {
            Some(response) => {
                debug!("client {} requested {:?}", client, request);
                if let Err(e) = output.try_extend(&response) {
                    warn!("Dropping {:?} response to client {}: {}", request, client, e);
                }
            }
            None => debug!("client {} sent {:?} request, no reply", client, request),
        }

        input.consume(line_len + 1);
        handled += 1;
    }

    handled
}

fn respond(request: Request, tracker: &SafetyTracker) -> Option<Vec<u8>> {
    match request {
        Request::Status => match tracker.status_snapshot().to_json_line() {
            Ok(line) => Some(line),
            Err(e) => {
                warn!("Failed to serialize status: {}", e);
                None
            }
        },
        Request::Info | Request::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackingWindow;

    fn tracker() -> SafetyTracker {
        let mut tracker = SafetyTracker::new(vec![
            TrackingWindow::new("micro", 180, 15, 30).unwrap(),
            TrackingWindow::new("normal", 2700, 0, 600).unwrap(),
        ])
        .unwrap();
        tracker.provide_active_seconds(42);
        tracker
    }

    fn buffers(input: &[u8], capacity: usize) -> (BoundedBuffer, BoundedBuffer) {
        let mut inbuf = BoundedBuffer::with_capacity(capacity);
        inbuf.try_extend(input).unwrap();
        (inbuf, BoundedBuffer::with_capacity(capacity))
    }

    #[test]
    fn test_parse_is_exact() {
        assert_eq!(Request::parse(b"status"), Request::Status);
        assert_eq!(Request::parse(b"info"), Request::Info);
        assert_eq!(Request::parse(b"STATUS"), Request::Unknown);
        assert_eq!(Request::parse(b"status "), Request::Unknown);
        assert_eq!(Request::parse(b""), Request::Unknown);
    }

    #[test]
    fn test_status_then_info_yields_one_line() {
        let tracker = tracker();
        let (mut input, mut output) = buffers(b"status\ninfo\n", 1024);

        assert_eq!(handle_messages(0, &mut input, &mut output, &tracker), 2);
        assert!(input.is_empty());

        let text = std::str::from_utf8(output.as_slice()).unwrap();
        assert_eq!(text.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["periods"].as_array().unwrap().len(), 2);
        assert_eq!(value["periods"][0]["accumulated_seconds"], 42);
        assert_eq!(value["periods"][1]["break_at"], 2700);
    }

    #[test]
    fn test_partial_request_is_kept() {
        let tracker = tracker();
        let (mut input, mut output) = buffers(b"bogus\nsta", 1024);

        assert_eq!(handle_messages(0, &mut input, &mut output, &tracker), 1);
        assert!(output.is_empty());
        assert_eq!(input.as_slice(), b"sta");

        input.try_extend(b"tus\n").unwrap();
        assert_eq!(handle_messages(0, &mut input, &mut output, &tracker), 1);
        assert!(output.as_slice().starts_with(b"{\"periods\":["));
    }

    #[test]
    fn test_responses_in_request_order() {
        let tracker = tracker();
        let (mut input, mut output) = buffers(b"status\nstatus\n", 1024);

        handle_messages(0, &mut input, &mut output, &tracker);
        let text = std::str::from_utf8(output.as_slice()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], lines[1]);
    }

    #[test]
    fn test_response_dropped_when_output_full() {
        let tracker = tracker();
        let single = tracker.status_snapshot().to_json_line().unwrap();

        // Room for exactly one status response
        let mut input = BoundedBuffer::with_capacity(64);
        input.try_extend(b"status\nstatus\n").unwrap();
        let mut output = BoundedBuffer::with_capacity(single.len() + 10);

        assert_eq!(handle_messages(0, &mut input, &mut output, &tracker), 2);
        assert!(input.is_empty());
        assert_eq!(output.as_slice(), single.as_slice());
    }
}
