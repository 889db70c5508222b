//! Protocol modules (binary frames + RESP-style text lane).
//!
//! This module hosts the dual wire formats of the gateway:
//! - Binary: length-prefixed frames with a fixed `typ` header, bodies encoded
//!   little-endian with length-prefixed strings.
//! - Text: CRLF command lines in, typed `<typ> <json>` lines and RESP-style
//!   replies out.

pub mod arena;
pub mod frame;
pub mod message;
pub mod resp;
pub mod types;
