//! Stream framing
//!
//! Turns an arbitrary sequence of byte chunks into complete frames, in
//! arrival order. Three boundary rules are supported:
//!
//! - `Line`: frames end at a terminator byte (`\r` before it is stripped,
//!   empty lines are skipped)
//! - `Xml`: a frame is one balanced root element; bytes outside any root
//!   (prompts, whitespace, prologs) are discarded
//! - `Json`: a frame is one balanced top-level object or array, string
//!   literals and escapes respected
//!
//! Partial data is retained between calls. If the retained partial frame
//! grows past the configured limit it is discarded and an
//! `FramingError::Overflow` is reported in its place.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::FramingError;

/// Default maximum partial frame size
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Frame boundary rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// Frames end at the given terminator byte
    Line(u8),
    /// Balanced XML root elements
    Xml,
    /// Balanced JSON objects/arrays
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Open,
    Close,
    Declaration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Outside any markup (XML) or outside any string (JSON)
    Text,
    /// Inside an XML tag
    Tag {
        kind: TagKind,
        quote: Option<u8>,
        prev: u8,
    },
    /// Skipping until a terminator (comments, CDATA, processing instructions)
    Skip(&'static [u8]),
    /// Inside a JSON string literal
    JsonString { escaped: bool },
}

/// Incremental framer
#[derive(Debug)]
pub struct Framer {
    mode: FrameMode,
    buf: BytesMut,
    max_buffer_size: usize,

    /// Bytes of `buf` already examined
    scanned: usize,
    /// Offset in `buf` where the current frame starts
    start: Option<usize>,
    depth: usize,
    state: ScanState,
}

impl Framer {
    /// Create a framer with the default buffer limit
    pub fn new(mode: FrameMode) -> Self {
        Self::with_max_buffer_size(mode, DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Create a framer with an explicit buffer limit
    pub fn with_max_buffer_size(mode: FrameMode, max_buffer_size: usize) -> Self {
        Self {
            mode,
            buf: BytesMut::with_capacity(4096),
            max_buffer_size,
            scanned: 0,
            start: None,
            depth: 0,
            state: ScanState::Text,
        }
    }

    /// Frame mode
    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Number of buffered bytes not yet emitted
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial frame (used on disconnect)
    pub fn reset(&mut self) {
        self.buf.clear();
        self.reset_scan();
    }

    fn reset_scan(&mut self) {
        self.scanned = 0;
        self.start = None;
        self.depth = 0;
        self.state = ScanState::Text;
    }

    /// Append a chunk and return every frame it completes, in order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Bytes, FramingError>> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            let next = match self.mode {
                FrameMode::Line(terminator) => self.next_line(terminator),
                FrameMode::Xml => self.next_xml(),
                FrameMode::Json => self.next_json(),
            };
            match next {
                Some(frame) => frames.push(Ok(frame)),
                None => break,
            }
        }

        if self.buf.len() > self.max_buffer_size {
            tracing::warn!(
                buffered = self.buf.len(),
                limit = self.max_buffer_size,
                "Partial frame exceeded buffer limit, discarding"
            );
            self.reset();
            frames.push(Err(FramingError::Overflow {
                limit: self.max_buffer_size,
            }));
        }

        frames
    }

    fn next_line(&mut self, terminator: u8) -> Option<Bytes> {
        loop {
            let pos = self.buf[self.scanned..]
                .iter()
                .position(|&b| b == terminator);

            let Some(pos) = pos else {
                self.scanned = self.buf.len();
                return None;
            };

            let mut line = self.buf.split_to(self.scanned + pos + 1);
            self.scanned = 0;
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if !line.is_empty() {
                return Some(line.freeze());
            }
        }
    }

    /// Cut the completed frame `[start, end]` out of the buffer
    fn take_frame(&mut self, end: usize) -> Bytes {
        let start = self.start.unwrap_or(0);
        self.buf.advance(start);
        let frame = self.buf.split_to(end + 1 - start).freeze();
        self.reset_scan();
        frame
    }

    /// Discard scanned bytes that precede any frame
    fn drop_leading_junk(&mut self, upto: usize) {
        if self.start.is_none() && self.state == ScanState::Text && upto > 0 {
            self.buf.advance(upto);
            self.scanned = 0;
        } else {
            self.scanned = upto;
        }
    }

    fn next_xml(&mut self) -> Option<Bytes> {
        let mut i = self.scanned;

        while i < self.buf.len() {
            match self.state {
                ScanState::Text => {
                    if self.buf[i] != b'<' {
                        i += 1;
                        continue;
                    }
                    let rest = &self.buf[i..];
                    if rest.len() < 2 {
                        break;
                    }
                    match rest[1] {
                        b'/' => {
                            self.state = ScanState::Tag {
                                kind: TagKind::Close,
                                quote: None,
                                prev: b'/',
                            };
                            i += 2;
                        }
                        b'?' => {
                            self.state = ScanState::Skip(b"?>");
                            i += 2;
                        }
                        b'!' => {
                            if rest.starts_with(b"<!--") {
                                self.state = ScanState::Skip(b"-->");
                                i += 4;
                            } else if rest.starts_with(b"<![CDATA[") {
                                self.state = ScanState::Skip(b"]]>");
                                i += 9;
                            } else if rest.len() < 9
                                && (b"<!--".starts_with(rest) || b"<![CDATA[".starts_with(rest))
                            {
                                // Not enough data to tell yet
                                break;
                            } else {
                                self.state = ScanState::Tag {
                                    kind: TagKind::Declaration,
                                    quote: None,
                                    prev: b'!',
                                };
                                i += 2;
                            }
                        }
                        _ => {
                            if self.depth == 0 && self.start.is_none() {
                                self.start = Some(i);
                            }
                            self.state = ScanState::Tag {
                                kind: TagKind::Open,
                                quote: None,
                                prev: b'<',
                            };
                            i += 1;
                        }
                    }
                }
                ScanState::Tag { kind, quote, prev } => {
                    let b = self.buf[i];
                    match quote {
                        Some(q) if b == q => {
                            self.state = ScanState::Tag {
                                kind,
                                quote: None,
                                prev: b,
                            };
                        }
                        Some(_) => {}
                        None if b == b'"' || b == b'\'' => {
                            self.state = ScanState::Tag {
                                kind,
                                quote: Some(b),
                                prev: b,
                            };
                        }
                        None if b == b'>' => {
                            self.state = ScanState::Text;
                            match kind {
                                TagKind::Open if prev == b'/' => {
                                    if self.depth == 0 && self.start.is_some() {
                                        return Some(self.take_frame(i));
                                    }
                                }
                                TagKind::Open => self.depth += 1,
                                TagKind::Close => {
                                    if self.depth > 0 {
                                        self.depth -= 1;
                                        if self.depth == 0 && self.start.is_some() {
                                            return Some(self.take_frame(i));
                                        }
                                    }
                                }
                                TagKind::Declaration => {}
                            }
                        }
                        None => {
                            self.state = ScanState::Tag {
                                kind,
                                quote: None,
                                prev: b,
                            };
                        }
                    }
                    i += 1;
                }
                ScanState::Skip(terminator) => {
                    let rest = &self.buf[i..];
                    match rest
                        .windows(terminator.len())
                        .position(|w| w == terminator)
                    {
                        Some(pos) => {
                            i += pos + terminator.len();
                            self.state = ScanState::Text;
                        }
                        None => {
                            // Keep a possible partial terminator for the next chunk
                            i = self.buf.len().saturating_sub(terminator.len() - 1).max(i);
                            break;
                        }
                    }
                }
                ScanState::JsonString { .. } => unreachable!("json state in xml framer"),
            }
        }

        self.drop_leading_junk(i);
        None
    }

    fn next_json(&mut self) -> Option<Bytes> {
        let mut i = self.scanned;

        while i < self.buf.len() {
            let b = self.buf[i];
            match self.state {
                ScanState::JsonString { escaped } => {
                    self.state = if escaped {
                        ScanState::JsonString { escaped: false }
                    } else if b == b'\\' {
                        ScanState::JsonString { escaped: true }
                    } else if b == b'"' {
                        ScanState::Text
                    } else {
                        ScanState::JsonString { escaped: false }
                    };
                }
                _ => match b {
                    b'{' | b'[' => {
                        if self.depth == 0 {
                            self.start = Some(i);
                        }
                        self.depth += 1;
                    }
                    b'}' | b']' if self.depth > 0 => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            return Some(self.take_frame(i));
                        }
                    }
                    b'"' if self.depth > 0 => {
                        self.state = ScanState::JsonString { escaped: false };
                    }
                    _ => {}
                },
            }
            i += 1;
        }

        self.drop_leading_junk(i);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(framer: &mut Framer, chunk: &str) -> Vec<String> {
        framer
            .push(chunk.as_bytes())
            .into_iter()
            .map(|f| String::from_utf8(f.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_line_framing_across_chunks() {
        let mut framer = Framer::new(FrameMode::Line(b'\n'));
        assert!(frames(&mut framer, "OK\r\nsecond pa").len() == 1);
        assert_eq!(frames(&mut framer, "rt\n\n"), vec!["second part"]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_xml_split_document() {
        let mut framer = Framer::new(FrameMode::Xml);
        assert!(frames(&mut framer, "<XmlDoc resultId=\"1\"><Status><Ca").is_empty());
        assert!(frames(&mut framer, "ll item=\"1\"/></Status>").is_empty());
        let out = frames(&mut framer, "</XmlDoc>\r\n<XmlDoc/>");
        assert_eq!(
            out,
            vec![
                "<XmlDoc resultId=\"1\"><Status><Call item=\"1\"/></Status></XmlDoc>",
                "<XmlDoc/>"
            ]
        );
    }

    #[test]
    fn test_xml_skips_prompt_and_prolog() {
        let mut framer = Framer::new(FrameMode::Xml);
        let out = frames(
            &mut framer,
            "OK\r\n<?xml version=\"1.0\"?>\n<!-- a > b --><A x=\"1>2\"><B/></A>",
        );
        assert_eq!(out, vec!["<A x=\"1>2\"><B/></A>"]);
    }

    #[test]
    fn test_xml_cdata_with_markup() {
        let mut framer = Framer::new(FrameMode::Xml);
        let out = frames(&mut framer, "<A><![CDATA[</A>]]></A>");
        assert_eq!(out, vec!["<A><![CDATA[</A>]]></A>"]);
    }

    #[test]
    fn test_xml_comment_split_at_boundary() {
        let mut framer = Framer::new(FrameMode::Xml);
        assert!(frames(&mut framer, "<A><!").is_empty());
        assert!(frames(&mut framer, "-- </A> -").is_empty());
        assert_eq!(frames(&mut framer, "-></A>"), vec!["<A><!-- </A> --></A>"]);
    }

    #[test]
    fn test_json_nested_and_strings() {
        let mut framer = Framer::new(FrameMode::Json);
        let out = frames(
            &mut framer,
            "\n{\"a\": {\"b\": \"}\\\"{\"}, \"c\": [1,2]}\n{\"d\"",
        );
        assert_eq!(out, vec!["{\"a\": {\"b\": \"}\\\"{\"}, \"c\": [1,2]}"]);
        assert_eq!(frames(&mut framer, ":1}"), vec!["{\"d\":1}"]);
    }

    #[test]
    fn test_overflow_discards_buffer() {
        let mut framer = Framer::with_max_buffer_size(FrameMode::Json, 16);
        let out = framer.push(b"{\"never\": \"closes, ever and ever");
        assert_eq!(out, vec![Err(FramingError::Overflow { limit: 16 })]);
        assert_eq!(framer.buffered(), 0);

        // Framer recovers for the next frame
        let out = framer.push(b"{}");
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ok());
    }

    #[test]
    fn test_junk_does_not_accumulate() {
        let mut framer = Framer::with_max_buffer_size(FrameMode::Xml, 8);
        for _ in 0..10 {
            assert!(framer.push(b"** end\r\n").is_empty());
        }
        assert_eq!(framer.buffered(), 0);
    }
}
