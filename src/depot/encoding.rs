//! Output encoding for print-family content.
//!
//! Depot content arrives as transferred bytes (UTF-8 for the unicode file
//! types). Before it lands in a workspace file it passes through a
//! two-stage chain: a charset stage converting to the workspace encoding
//! (UTF-16LE for `utf16` types) and a platform stage inserting BOM markers
//! and translating `LF` to `CRLF` unless the client spec's `LineEnd` is
//! `unix`. Binary and symlink types pass through untouched.

use byteorder::{ByteOrder, LittleEndian};

/// Workspace encoding selected from the server-reported file type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Charset {
    /// Bytes pass through as transferred.
    Passthrough,
    /// UTF-8 with BOM.
    Utf8Bom,
    /// UTF-8 transfer form converted to UTF-16LE with BOM.
    Utf16,
}

/// Streaming encoder for one printed file.
#[derive(Debug)]
pub struct OutputEncoder {
    charset: Charset,
    crlf: bool,
    text: bool,
    started: bool,
    /// Last byte of the previous chunk, for CRLF state across boundaries.
    prev: u8,
    /// Incomplete UTF-8 sequence carried across chunk boundaries.
    carry: Vec<u8>,
}

impl OutputEncoder {
    /// Builds the chain for a server-reported file type (`text`, `binary`,
    /// `unicode`, `utf8`, `utf16`, optionally with `+` modifiers) and the
    /// client spec's `LineEnd` value.
    pub fn new(file_type: &str, line_end: &str) -> Self {
        let base = file_type.split('+').next().unwrap_or("");
        let (charset, text) = match base.to_ascii_lowercase().as_str() {
            "text" | "unicode" => (Charset::Passthrough, true),
            "utf8" => (Charset::Utf8Bom, true),
            "utf16" => (Charset::Utf16, true),
            _ => (Charset::Passthrough, false),
        };
        Self {
            charset,
            crlf: text && !line_end.eq_ignore_ascii_case("unix"),
            text,
            started: false,
            prev: 0,
            carry: Vec::new(),
        }
    }

    /// True when the chain cannot alter the stream.
    pub fn is_passthrough(&self) -> bool {
        !self.text || (self.charset == Charset::Passthrough && !self.crlf)
    }

    /// Encodes one chunk of transferred bytes into workspace bytes.
    pub fn encode(&mut self, data: &[u8]) -> Vec<u8> {
        if self.is_passthrough() {
            return data.to_vec();
        }

        let mut staged: Vec<u8> = Vec::with_capacity(data.len() + data.len() / 8 + 4);
        if self.crlf {
            for &byte in data {
                if byte == b'\n' && self.prev != b'\r' {
                    staged.push(b'\r');
                }
                staged.push(byte);
                self.prev = byte;
            }
        } else {
            staged.extend_from_slice(data);
        }

        let mut out = Vec::with_capacity(staged.len() * 2 + 4);
        match self.charset {
            Charset::Passthrough => out.extend_from_slice(&staged),
            Charset::Utf8Bom => {
                if !self.started {
                    out.extend_from_slice(&[0xEF, 0xBB, 0xBF]);
                }
                out.extend_from_slice(&staged);
            }
            Charset::Utf16 => {
                if !self.started {
                    out.extend_from_slice(&[0xFF, 0xFE]);
                }
                self.carry.extend_from_slice(&staged);
                let valid_up_to = match std::str::from_utf8(&self.carry) {
                    Ok(_) => self.carry.len(),
                    Err(e) => e.valid_up_to(),
                };
                let complete = &self.carry[..valid_up_to];
                let text = std::str::from_utf8(complete).unwrap_or("");
                for unit in text.encode_utf16() {
                    let mut pair = [0u8; 2];
                    LittleEndian::write_u16(&mut pair, unit);
                    out.extend_from_slice(&pair);
                }
                self.carry.drain(..valid_up_to);
            }
        }
        self.started = true;
        out
    }

    /// Flushes any carried partial sequence; call once at end of stream.
    pub fn finish(&mut self) -> Vec<u8> {
        if self.carry.is_empty() {
            return Vec::new();
        }
        // A dangling partial sequence at EOF is emitted as replacement
        // characters rather than dropped.
        let tail = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        let mut out = Vec::new();
        for unit in tail.encode_utf16() {
            let mut pair = [0u8; 2];
            LittleEndian::write_u16(&mut pair, unit);
            out.extend_from_slice(&pair);
        }
        out
    }
}
