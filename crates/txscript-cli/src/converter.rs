use std::io::{self, Read};
use std::path::Path;

use txscript_core::bus::{CanFrame, MAX_STANDARD_ID};
use txscript_core::trace::parse_trace;

use crate::error::CliError;

/// Turns candump traces into TxScript that re-sends the same frames with the
/// same spacing.
pub struct TraceConverter;

impl TraceConverter {
    pub fn convert_file(path: &Path) -> Result<String, CliError> {
        let content = std::fs::read_to_string(path)?;
        Self::convert_str(&content)
    }

    pub fn convert_stdin() -> Result<String, CliError> {
        let mut content = String::new();
        io::stdin().read_to_string(&mut content)?;
        Self::convert_str(&content)
    }

    fn convert_str(content: &str) -> Result<String, CliError> {
        let frames = parse_trace(content)?;

        let mut lines = vec![format!("// Replay of {} frame(s)", frames.len())];
        let mut previous = None;
        let mut port: Option<&str> = None;

        for frame in &frames {
            if let Some(prev) = previous {
                let gap = frame.timestamp.saturating_sub(prev);
                if gap > 0 {
                    lines.push(format!("delay({})", gap));
                }
            }
            previous = Some(frame.timestamp);

            if port != Some(frame.port.as_str()) {
                lines.push(format!("// {}", frame.port));
                port = Some(frame.port.as_str());
            }
            lines.push(Self::frame_to_send(frame));
        }

        Ok(lines.join("\n") + "\n")
    }

    fn frame_to_send(frame: &CanFrame) -> String {
        let mut args = vec![if frame.extended {
            format!("0x{:08X}", frame.id)
        } else {
            format!("0x{:03X}", frame.id)
        }];
        args.extend(frame.data.iter().map(|b| format!("0x{:02X}", b)));
        // Ids above the standard range are promoted automatically.
        if frame.extended && frame.id <= MAX_STANDARD_ID {
            args.push("ext".to_string());
        }
        format!("send({})", args.join(", "))
    }
}
