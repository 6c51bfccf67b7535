//! Streaming log scrubber (component E): rewrites IPv4/IPv6 occurrences
//! to `[scrubbed]` before bytes reach a downstream sink.
//!
//! Buffers partial lines until a `\n` is seen so an address split across
//! two writes is never missed; complete lines are scrubbed and flushed
//! immediately.

use std::io::{self, Write};
use std::sync::OnceLock;

use regex::Regex;

fn address_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?x)",
            r"(?P<v6full>\[?(?:[0-9A-Fa-f]{1,4}:){7}[0-9A-Fa-f]{1,4}\]?(?::\d{1,5})?)",
            r"|(?P<v6compressed>\[?(?:[0-9A-Fa-f]{1,4}:){1,6}(?:%3A|:)+[0-9A-Fa-f]{0,4}(?::[0-9A-Fa-f]{1,4})*\]?(?::\d{1,5})?)",
            r"|(?P<v4>\b(?:\d{1,3}\.){3}\d{1,3}(?::\d{1,5})?\b)",
        ))
        .expect("static scrub regex")
    })
}

/// Replaces every IPv4/IPv6 occurrence (with optional port) in `line`
/// with `[scrubbed]`. Idempotent: scrubbing an already-scrubbed string
/// returns it unchanged.
pub fn scrub_line(line: &str) -> String {
    address_pattern().replace_all(line, "[scrubbed]").into_owned()
}

/// A [`Write`] adapter that scrubs complete lines before forwarding them
/// to `inner`. Partial trailing data (no `\n` yet) stays buffered.
pub struct ScrubbingWriter<W> {
    inner: W,
    buf: Vec<u8>,
    enabled: bool,
}

impl<W: Write> ScrubbingWriter<W> {
    pub fn new(inner: W, enabled: bool) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            enabled,
        }
    }

    fn flush_complete_lines(&mut self) -> io::Result<()> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if self.enabled {
                let text = String::from_utf8_lossy(&line);
                self.inner.write_all(scrub_line(&text).as_bytes())?;
            } else {
                self.inner.write_all(&line)?;
            }
        }
        Ok(())
    }
}

impl<W: Write> Write for ScrubbingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        self.flush_complete_lines()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubs_ipv4_with_and_without_port() {
        assert_eq!(scrub_line("client 203.0.113.5 connected"), "client [scrubbed] connected");
        assert_eq!(scrub_line("from 203.0.113.5:4443"), "from [scrubbed]");
    }

    #[test]
    fn scrubs_ipv6_uncompressed_and_bracketed() {
        let full = "2001:0db8:0000:0000:0000:0000:0000:0001";
        assert_eq!(scrub_line(full), "[scrubbed]");
        assert_eq!(scrub_line(&format!("[{full}]:443")), "[scrubbed]");
    }

    #[test]
    fn scrubbing_is_idempotent() {
        let line = "peer 203.0.113.5 answered";
        let once = scrub_line(line);
        let twice = scrub_line(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn writer_buffers_partial_lines() {
        let mut out = Vec::new();
        let mut writer = ScrubbingWriter::new(&mut out, true);
        writer.write_all(b"addr 203.0.113.5").unwrap();
        assert!(out.is_empty());
        writer.write_all(b" done\n").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "addr [scrubbed] done\n");
    }

    #[test]
    fn disabled_scrubber_passes_through_unmodified() {
        let mut out = Vec::new();
        let mut writer = ScrubbingWriter::new(&mut out, false);
        writer.write_all(b"addr 203.0.113.5\n").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "addr 203.0.113.5\n");
    }
}
