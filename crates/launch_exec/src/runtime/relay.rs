//! Output relay: turns raw stdout/stderr chunks into formatted lines

use crate::events::OutputStream;
use crate::runtime::output::OutputSinks;

/// Default line template
pub const DEFAULT_OUTPUT_FORMAT: &str = "[{name}] {line}";

/// Line template with `{line}` and `{name}` keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFormat(String);

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat(DEFAULT_OUTPUT_FORMAT.to_string())
    }
}

impl OutputFormat {
    pub fn new(template: impl Into<String>) -> Self {
        OutputFormat(template.into())
    }

    pub fn render(&self, line: &str, name: &str) -> String {
        // Substitute {name} first so a line containing "{name}" stays verbatim
        self.0.replace("{name}", name).replace("{line}", line)
    }
}

/// How output is accumulated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Hold at most one partial line per stream
    LineAssembling,
    /// Keep the whole stream for later retrieval
    CacheAll,
}

#[derive(Debug, Default)]
struct StreamBuffer {
    text: String,
    /// Cache-all: byte offset of the first line not yet forwarded
    cursor: usize,
    /// Trailing bytes of an incomplete UTF-8 sequence
    pending: Vec<u8>,
    closed: bool,
}

impl StreamBuffer {
    /// Decode a chunk, replacing invalid sequences and carrying an incomplete
    /// trailing sequence over to the next chunk.
    fn decode(&mut self, data: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(data);

        let valid_up_to = match std::str::from_utf8(&bytes) {
            Ok(_) => bytes.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => bytes.len(),
        };
        self.pending = bytes.split_off(valid_up_to);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn take_pending_lossy(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}

/// Per-unit output relay for both standard streams
pub struct OutputRelay {
    mode: RelayMode,
    format: OutputFormat,
    name: String,
    sinks: OutputSinks,
    stdout: StreamBuffer,
    stderr: StreamBuffer,
}

impl OutputRelay {
    pub fn new(mode: RelayMode, format: OutputFormat, name: impl Into<String>, sinks: OutputSinks) -> Self {
        Self {
            mode,
            format,
            name: name.into(),
            sinks,
            stdout: StreamBuffer::default(),
            stderr: StreamBuffer::default(),
        }
    }

    /// Feed one raw chunk read from a stream
    pub fn push(&mut self, stream: OutputStream, data: &[u8]) {
        let (buffer, sink) = match stream {
            OutputStream::Stdout => (&mut self.stdout, &self.sinks.stdout),
            OutputStream::Stderr => (&mut self.stderr, &self.sinks.stderr),
        };
        let text = buffer.decode(data);

        match self.mode {
            RelayMode::LineAssembling if buffer.closed => {
                // Closed by a final flush: forward unbuffered
                sink.write_line(&self.format.render(&text, &self.name));
            }
            RelayMode::LineAssembling => {
                buffer.text.push_str(&text);
                while let Some(pos) = buffer.text.find('\n') {
                    let line: String = buffer.text.drain(..=pos).collect();
                    sink.write_line(&self.format.render(trim_line_end(&line), &self.name));
                }
            }
            RelayMode::CacheAll => {
                buffer.text.push_str(&text);
                while let Some(pos) = buffer.text[buffer.cursor..].find('\n') {
                    let end = buffer.cursor + pos;
                    let line = trim_line_end(&buffer.text[buffer.cursor..=end]);
                    sink.write_line(&self.format.render(line, &self.name));
                    buffer.cursor = end + 1;
                }
            }
        }
    }

    /// Forward any unterminated remainder. In line-assembling mode the
    /// buffers are then closed when `close` is set, cleared otherwise.
    pub fn flush(&mut self, close: bool) {
        let format = &self.format;
        let name = &self.name;
        for (buffer, sink) in [
            (&mut self.stdout, &self.sinks.stdout),
            (&mut self.stderr, &self.sinks.stderr),
        ] {
            let tail = buffer.take_pending_lossy();
            buffer.text.push_str(&tail);

            match self.mode {
                RelayMode::LineAssembling => {
                    if !buffer.text.is_empty() {
                        sink.write_line(&format.render(&buffer.text, name));
                    }
                    buffer.text.clear();
                    if close {
                        buffer.closed = true;
                    }
                }
                RelayMode::CacheAll => {
                    let rest = &buffer.text[buffer.cursor..];
                    if !rest.is_empty() {
                        sink.write_line(&format.render(rest, name));
                    }
                    buffer.cursor = buffer.text.len();
                }
            }
        }
    }

    /// Cached content of a stream (cache-all mode)
    pub fn cached(&self, stream: OutputStream) -> &str {
        match stream {
            OutputStream::Stdout => &self.stdout.text,
            OutputStream::Stderr => &self.stderr.text,
        }
    }

    pub fn is_closed(&self, stream: OutputStream) -> bool {
        match stream {
            OutputStream::Stdout => self.stdout.closed,
            OutputStream::Stderr => self.stderr.closed,
        }
    }
}

fn trim_line_end(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::output::LineSink;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl LineSink for Collect {
        fn write_line(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    impl Collect {
        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    fn relay(mode: RelayMode, format: &str) -> (OutputRelay, Arc<Collect>, Arc<Collect>) {
        let out = Arc::new(Collect::default());
        let err = Arc::new(Collect::default());
        let sinks = OutputSinks {
            stdout: out.clone(),
            stderr: err.clone(),
        };
        (OutputRelay::new(mode, OutputFormat::new(format), "talker", sinks), out, err)
    }

    #[test]
    fn test_render_format() {
        let format = OutputFormat::default();
        assert_eq!(format.render("hello", "talker"), "[talker] hello");
        assert_eq!(format.render("{name}", "talker"), "[talker] {name}");
    }

    #[test]
    fn test_line_assembling_splits_chunks() {
        let (mut relay, out, err) = relay(RelayMode::LineAssembling, "{line}");

        relay.push(OutputStream::Stdout, b"hel");
        assert!(out.lines().is_empty());

        relay.push(OutputStream::Stdout, b"lo\nwor");
        assert_eq!(out.lines(), vec!["hello"]);

        relay.push(OutputStream::Stdout, b"ld\r\nagain\n");
        assert_eq!(out.lines(), vec!["hello", "world", "again"]);
        assert!(err.lines().is_empty());
    }

    #[test]
    fn test_streams_are_independent() {
        let (mut relay, out, err) = relay(RelayMode::LineAssembling, "[{name}] {line}");
        relay.push(OutputStream::Stdout, b"out ");
        relay.push(OutputStream::Stderr, b"err\n");
        relay.push(OutputStream::Stdout, b"done\n");

        assert_eq!(out.lines(), vec!["[talker] out done"]);
        assert_eq!(err.lines(), vec!["[talker] err"]);
    }

    #[test]
    fn test_flush_then_close_bypasses_buffering() {
        let (mut relay, out, _) = relay(RelayMode::LineAssembling, "{line}");
        relay.push(OutputStream::Stdout, b"partial");
        relay.flush(true);
        assert_eq!(out.lines(), vec!["partial"]);
        assert!(relay.is_closed(OutputStream::Stdout));

        relay.push(OutputStream::Stdout, b"late chunk");
        assert_eq!(out.lines(), vec!["partial", "late chunk"]);
    }

    #[test]
    fn test_flush_without_close_clears() {
        let (mut relay, out, _) = relay(RelayMode::LineAssembling, "{line}");
        relay.push(OutputStream::Stdout, b"first run");
        relay.flush(false);
        relay.push(OutputStream::Stdout, b"second run\n");

        assert_eq!(out.lines(), vec!["first run", "second run"]);
        assert!(!relay.is_closed(OutputStream::Stdout));
    }

    #[test]
    fn test_cache_all_keeps_everything() {
        let (mut relay, out, _) = relay(RelayMode::CacheAll, "{line}");
        relay.push(OutputStream::Stdout, b"line1\nli");
        relay.push(OutputStream::Stdout, b"ne2\ntail");
        assert_eq!(out.lines(), vec!["line1", "line2"]);

        relay.flush(true);
        assert_eq!(out.lines(), vec!["line1", "line2", "tail"]);
        assert_eq!(relay.cached(OutputStream::Stdout), "line1\nline2\ntail");
        assert_eq!(relay.cached(OutputStream::Stderr), "");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let (mut relay, out, _) = relay(RelayMode::LineAssembling, "{line}");
        relay.push(OutputStream::Stdout, b"bad \xff byte\n");
        assert_eq!(out.lines(), vec!["bad \u{FFFD} byte"]);
    }

    #[test]
    fn test_split_multibyte_sequence_is_carried_over() {
        let (mut relay, out, _) = relay(RelayMode::LineAssembling, "{line}");
        let snowman = "☃".as_bytes();
        relay.push(OutputStream::Stdout, &snowman[..1]);
        relay.push(OutputStream::Stdout, &snowman[1..]);
        relay.push(OutputStream::Stdout, b"\n");
        assert_eq!(out.lines(), vec!["☃"]);
    }
}
