//! candump trace files.
//!
//! Two line formats are understood:
//!
//! ```text
//! (1436509052.249713) can0 7E8#0641000000000000      (candump -L)
//! (1436509052.249713) can0 18DAF110##1DEADBEEF       (CAN FD)
//!   can0  7E8   [8]  06 41 00 00 00 00 00 00         (candump)
//! ```
//!
//! Blank lines and lines starting with `#` or `//` are skipped. Frame
//! timestamps are rebased to milliseconds since the first timestamped frame.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{CanFrame, VirtualBus, MAX_EXTENDED_ID, MAX_PAYLOAD};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct TraceError {
    pub line: usize,
    pub message: String,
}

fn err(line: usize, message: impl Into<String>) -> TraceError {
    TraceError { line, message: message.into() }
}

/// Parses one line. `Ok(None)` for lines that carry no frame. The returned
/// frame's timestamp is absolute, in microseconds.
fn parse_line(text: &str, line: usize) -> Result<Option<(CanFrame, Option<u64>)>, TraceError> {
    let text = text.trim();
    if text.is_empty() || text.starts_with('#') || text.starts_with("//") {
        return Ok(None);
    }

    let mut fields = text.split_whitespace().peekable();
    let mut timestamp_us = None;
    if let Some(&first) = fields.peek() {
        if let Some(inner) = first.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
            let seconds: f64 = inner.parse().map_err(|_| err(line, format!("invalid timestamp '{}'", inner)))?;
            timestamp_us = Some((seconds * 1_000_000.0).round() as u64);
            fields.next();
        }
    }

    let port = fields.next().ok_or_else(|| err(line, "missing interface name"))?.to_string();
    let body = fields.next().ok_or_else(|| err(line, "missing frame"))?;

    let (id_text, data) = if let Some((id, rest)) = body.split_once("##") {
        // First nibble after `##` is the FD flags field.
        let payload = rest.get(1..).unwrap_or("");
        (id, parse_hex_payload(payload, line)?)
    } else if let Some((id, rest)) = body.split_once('#') {
        if rest.starts_with('R') {
            (id, Vec::new())
        } else {
            (id, parse_hex_payload(rest, line)?)
        }
    } else {
        // `can0  7E8   [8]  06 41 ...`
        let dlc_field = fields.next().ok_or_else(|| err(line, "missing length field"))?;
        let dlc: usize = dlc_field
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| err(line, format!("invalid length field '{}'", dlc_field)))?;
        let data = fields
            .take(dlc)
            .map(|b| u8::from_str_radix(b, 16).map_err(|_| err(line, format!("invalid data byte '{}'", b))))
            .collect::<Result<Vec<u8>, _>>()?;
        if data.len() != dlc {
            return Err(err(line, format!("expected {} data bytes, found {}", dlc, data.len())));
        }
        (body, data)
    };

    let id = u32::from_str_radix(id_text, 16).map_err(|_| err(line, format!("invalid id '{}'", id_text)))?;
    if id > MAX_EXTENDED_ID {
        return Err(err(line, format!("id 0x{:X} out of range", id)));
    }
    if data.len() > MAX_PAYLOAD {
        return Err(err(line, format!("payload of {} bytes is too long", data.len())));
    }

    let mut frame = CanFrame::new(port, id, data);
    frame.extended = id_text.len() > 3 || id > 0x7FF;
    Ok(Some((frame, timestamp_us)))
}

fn parse_hex_payload(text: &str, line: usize) -> Result<Vec<u8>, TraceError> {
    let text: String = text.chars().filter(|c| *c != '.').collect();
    if text.len() % 2 != 0 {
        return Err(err(line, format!("odd number of hex digits in '{}'", text)));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|b| u8::from_str_radix(b, 16).ok())
                .ok_or_else(|| err(line, format!("invalid data in '{}'", text)))
        })
        .collect()
}

/// Parses a whole trace. Timestamps become milliseconds relative to the
/// first timestamped frame; untimestamped frames reuse the previous time.
pub fn parse_trace(text: &str) -> Result<Vec<CanFrame>, TraceError> {
    let mut frames = Vec::new();
    let mut base_us = None;
    let mut last_ms = 0;

    for (i, raw) in text.lines().enumerate() {
        let Some((mut frame, ts)) = parse_line(raw, i + 1)? else {
            continue;
        };
        if let Some(us) = ts {
            let base = *base_us.get_or_insert(us);
            last_ms = us.saturating_sub(base) / 1000;
        }
        frame.timestamp = last_ms;
        frames.push(frame);
    }

    Ok(frames)
}

/// Injects `frames` into `bus`, honoring the gaps between their timestamps.
///
/// Frames are delivered on `port` when given, otherwise on the interface
/// recorded in the trace. Returns the number of frames injected before the
/// trace ended or `cancel` fired.
pub async fn replay(bus: &VirtualBus, frames: &[CanFrame], port: Option<&str>, cancel: &CancellationToken) -> usize {
    let mut previous = 0;
    for (sent, frame) in frames.iter().enumerate() {
        let gap = Duration::from_millis(frame.timestamp.saturating_sub(previous));
        previous = frame.timestamp;
        tokio::select! {
            _ = cancel.cancelled() => return sent,
            _ = tokio::time::sleep(gap) => {}
        }
        let mut frame = frame.clone();
        if let Some(port) = port {
            frame.port = port.to_string();
        }
        // Stamp with the bus clock so scripts see live time.
        frame.timestamp = 0;
        debug!(id = frame.id, port = %frame.port, "replaying frame");
        bus.inject(frame);
    }
    frames.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CanBus;

    #[test]
    fn parses_compact_format() {
        let frames = parse_trace("(1436509052.249713) can0 7E8#0641000C\n").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x7E8);
        assert_eq!(frames[0].data, vec![0x06, 0x41, 0x00, 0x0C]);
        assert!(!frames[0].extended);
        assert_eq!(frames[0].port, "can0");
    }

    #[test]
    fn parses_extended_and_fd() {
        let frames = parse_trace("(0.0) can0 18DAF110#0210\n(0.0) can1 00000123##1DEADBEEF\n").unwrap();
        assert!(frames[0].extended);
        assert_eq!(frames[0].id, 0x18DAF110);
        assert!(frames[1].extended);
        assert_eq!(frames[1].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(frames[1].port, "can1");
    }

    #[test]
    fn parses_candump_columns() {
        let frames = parse_trace("  can0  7DF   [3]  02 01 0C").unwrap();
        assert_eq!(frames[0].id, 0x7DF);
        assert_eq!(frames[0].data, vec![0x02, 0x01, 0x0C]);
    }

    #[test]
    fn timestamps_are_relative_millis() {
        let text = "(100.000000) can0 100#01\n(100.250000) can0 101#02\n(101.000000) can0 102#03\n";
        let frames = parse_trace(text).unwrap();
        let ts: Vec<u64> = frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(ts, vec![0, 250, 1000]);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let frames = parse_trace("# header\n\n// note\n(0.0) can0 1#\n").unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.is_empty());
    }

    #[test]
    fn reports_line_numbers() {
        let e = parse_trace("(0.0) can0 100#01\n(0.1) can0 XYZ#01\n").unwrap_err();
        assert_eq!(e.line, 2);
        let e = parse_trace("(0.0) can0 100#012").unwrap_err();
        assert_eq!(e.line, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_honors_gaps() {
        let bus = VirtualBus::new();
        let mut rx = bus.subscribe("can0");
        let frames = parse_trace("(0.0) can0 100#01\n(0.5) can0 101#02\n").unwrap();
        let start = tokio::time::Instant::now();
        let cancel = CancellationToken::new();

        let injected = replay(&bus, &frames, None, &cancel).await;
        assert_eq!(injected, 2);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(rx.recv().await.unwrap().id, 0x100);
        assert_eq!(rx.recv().await.unwrap().id, 0x101);
    }
}
