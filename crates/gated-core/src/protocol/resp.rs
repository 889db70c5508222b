//! RESP-style text lane: command-line lexing and reply printing.
//!
//! Inbound lines start with `.` followed by a command name and arguments;
//! double quotes group words. Replies carry a one-byte type prefix and end
//! with CRLF: `+` simple string, `-` error, `*` array header.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{GateError, Result};

pub const SIMPLE: u8 = b'+';
pub const ERROR: u8 = b'-';
pub const ARRAY: u8 = b'*';

const CRLF: &[u8] = b"\r\n";

/// Split a command line into words. Double quotes group words and support
/// `\"` and `\\` escapes; an unterminated quote is a protocol error.
pub fn lex(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    loop {
        let Some(c) = chars.next() else { break };
        match c {
            ' ' | '\t' => {
                if in_word {
                    args.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e @ ('"' | '\\')) => word.push(e),
                            Some(e) => {
                                word.push('\\');
                                word.push(e);
                            }
                            None => {
                                return Err(GateError::Protocol("unterminated escape".into()))
                            }
                        },
                        Some(c) => word.push(c),
                        None => return Err(GateError::Protocol("unterminated quote".into())),
                    }
                }
            }
            _ => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        args.push(word);
    }
    Ok(args)
}

/// Reply printer. Accumulates CRLF-terminated lines under a one-byte type
/// prefix; `take` yields the wire bytes.
pub struct Printer {
    buf: BytesMut,
}

impl Printer {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Start with an explicit type byte (overrides the lazy `+`).
    pub fn with_type(typ: u8) -> Self {
        let mut p = Self::new();
        p.buf.put_u8(typ);
        p
    }

    fn lazy_init(&mut self) {
        if self.buf.is_empty() {
            self.buf.put_u8(SIMPLE);
        }
    }

    pub fn print(&mut self, parts: &[&str]) -> &mut Self {
        self.lazy_init();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                self.buf.put_u8(b' ');
            }
            self.buf.put_slice(part.as_bytes());
        }
        self
    }

    pub fn println(&mut self, parts: &[&str]) -> &mut Self {
        self.print(parts);
        self.buf.put_slice(CRLF);
        self
    }

    /// Finish the reply, guaranteeing a trailing CRLF.
    pub fn take(mut self) -> Bytes {
        self.lazy_init();
        if !self.buf.ends_with(CRLF) {
            self.buf.put_slice(CRLF);
        }
        self.buf.freeze()
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot error line: `-<parts joined by spaces>\r\n`.
pub fn error_line(parts: &[&str]) -> Bytes {
    let mut p = Printer::with_type(ERROR);
    p.println(parts);
    p.take()
}

/// Outbound typed message on the text lane: `<typ> <json>\r\n`.
pub fn typed_line(typ: u32, json_body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + json_body.len());
    buf.put_slice(typ.to_string().as_bytes());
    if !json_body.is_empty() {
        buf.put_u8(b' ');
        buf.put_slice(json_body);
    }
    buf.put_slice(CRLF);
    buf.freeze()
}
