//! Incremental decoder for `text/event-stream` bodies

use crate::core::error::SyncError;
use crate::core::events::ChannelMessage;
use crate::core::models::ProgressEvent;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Accumulates raw chunks and yields complete frames.
///
/// Frames end with a blank line; multiple `data:` lines are joined with `\n`.
/// Comment lines (`:` prefix, used for keep-alive pings) are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Flush a trailing frame when the stream ends without a blank line
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.process_line(line.trim_end_matches('\r'));
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id and retry are irrelevant without reconnection
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ServerErrorPayload {
    #[serde(default)]
    message: Option<String>,
}

/// Map a frame to a channel message; unknown event names yield `None`
pub fn parse_channel_message(frame: &SseFrame) -> Result<Option<ChannelMessage>, SyncError> {
    let parse_progress = |data: &str| {
        serde_json::from_str::<ProgressEvent>(data).map_err(|e| {
            SyncError::DataParse(format!("Invalid {} payload: {e}", frame.event))
        })
    };

    match frame.event.as_str() {
        "progress" | "message" => Ok(Some(ChannelMessage::Progress(parse_progress(
            &frame.data,
        )?))),
        "complete" => Ok(Some(ChannelMessage::Complete(parse_progress(&frame.data)?))),
        "error" => {
            let message = serde_json::from_str::<ServerErrorPayload>(&frame.data)
                .ok()
                .and_then(|p| p.message)
                .unwrap_or_else(|| frame.data.clone());
            Ok(Some(ChannelMessage::ServerError(message)))
        }
        other => {
            log::debug!("Ignoring unknown stream event '{other}'");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::RunStatus;

    #[test]
    fn test_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();

        let frames = decoder.feed(b"event: progress\r\ndata: {\"posts_fe");
        assert!(frames.is_empty());

        let frames = decoder.feed(b"tched\": 3}\r\n\r\n: ping\r\n\r\nevent: complete\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "progress".to_string(),
                data: "{\"posts_fetched\": 3}".to_string(),
            }]
        );

        let frames = decoder.feed(b"data: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "complete");
    }

    #[test]
    fn test_multiline_data_and_default_event() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: first\ndata:second\nid: 7\n\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "first\nsecond");
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: progress\ndata: {}").is_empty());

        let frame = decoder.finish().expect("Should flush trailing frame");
        assert_eq!(frame.event, "progress");
        assert_eq!(frame.data, "{}");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_parse_backend_frames() {
        let progress = SseFrame {
            event: "progress".to_string(),
            data: r#"{"status":"running","posts_fetched":2,"comments_fetched":40,"comments_analyzed":10,"errors_count":0,"phase":"analyzing"}"#.to_string(),
        };
        match parse_channel_message(&progress).unwrap() {
            Some(ChannelMessage::Progress(event)) => {
                assert_eq!(event.status, Some(RunStatus::Running));
                assert_eq!(event.comments_fetched, 40);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let error = SseFrame {
            event: "error".to_string(),
            data: r#"{"message":"Run not found"}"#.to_string(),
        };
        assert_eq!(
            parse_channel_message(&error).unwrap(),
            Some(ChannelMessage::ServerError("Run not found".to_string()))
        );

        let unknown = SseFrame {
            event: "heartbeat".to_string(),
            data: "{}".to_string(),
        };
        assert_eq!(parse_channel_message(&unknown).unwrap(), None);

        let broken = SseFrame {
            event: "complete".to_string(),
            data: "not json".to_string(),
        };
        assert!(matches!(
            parse_channel_message(&broken),
            Err(SyncError::DataParse(_))
        ));
    }
}
