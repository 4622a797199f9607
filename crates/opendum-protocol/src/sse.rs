use bytes::Bytes;

/// One server-sent event: the optional `event:` name and the joined
/// `data:` payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE decoder. Bytes are appended to an internal buffer and
/// complete frames (terminated by a blank line) are drained out; the
/// trailing partial frame stays buffered until more bytes arrive or
/// `flush` is called at end of stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.feed_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn feed_str(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(end) = find_frame_end(&self.buffer) {
            let raw = self.buffer[..end.frame_len].to_string();
            self.buffer.drain(..end.next_start);
            if let Some(frame) = parse_frame(&raw) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Drain whatever is left once the upstream closes. A frame without a
    /// trailing blank line still counts.
    pub fn flush(&mut self) -> Vec<SseFrame> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return Vec::new();
        }
        parse_frame(&rest).into_iter().collect()
    }
}

struct FrameEnd {
    frame_len: usize,
    next_start: usize,
}

fn find_frame_end(buffer: &str) -> Option<FrameEnd> {
    // Frames are separated by a blank line; tolerate \r\n line endings.
    let lf = buffer.find("\n\n").map(|idx| FrameEnd {
        frame_len: idx,
        next_start: idx + 2,
    });
    let crlf = buffer.find("\r\n\r\n").map(|idx| FrameEnd {
        frame_len: idx,
        next_start: idx + 4,
    });
    match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.frame_len <= b.frame_len {
                Some(a)
            } else {
                Some(b)
            }
        }
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            event = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

/// Serialize one frame back to the wire form.
pub fn encode_frame(event: Option<&str>, data: &str) -> String {
    match event {
        Some(name) => format!("event: {name}\ndata: {data}\n\n"),
        None => format!("data: {data}\n\n"),
    }
}
