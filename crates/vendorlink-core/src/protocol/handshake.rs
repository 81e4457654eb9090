//! Init-handshake detection.
//!
//! The peripheral announces itself with a fixed byte literal. Detection is a
//! literal match over the raw inbound bytes, not a run of the general frame
//! decoder, since the announcement does not follow the host frame layout. A
//! read may split the literal, so the scanner carries the tail of the
//! previous chunk.

use std::fmt;

use super::constants::{HANDSHAKE_REQUEST, HANDSHAKE_RESPONSE};

/// A fixed byte sequence exchanged outside the framed protocol.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Literal(&'static [u8]);

/// What the peripheral sends when it is ready.
pub const INIT_REQUEST: Literal = Literal(&HANDSHAKE_REQUEST);

/// What the host answers.
pub const INIT_RESPONSE: Literal = Literal(&HANDSHAKE_RESPONSE);

impl Literal {
    pub fn bytes(&self) -> &'static [u8] {
        self.0
    }

    /// True if `chunk` contains this literal.
    pub fn found_in(&self, chunk: &[u8]) -> bool {
        chunk.len() >= self.0.len() && chunk.windows(self.0.len()).any(|w| w == self.0)
    }
}

impl fmt::Debug for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Literal({})", hex_string(self.0))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_string(self.0))
    }
}

/// Watches the inbound stream of one connection for [`INIT_REQUEST`].
#[derive(Debug, Default, Clone)]
pub struct InitScanner {
    tail: Vec<u8>,
}

impl InitScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk. True once per announcement, including one that
    /// straddles the previous chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        let keep = INIT_REQUEST.bytes().len() - 1;
        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(chunk);

        let found = INIT_REQUEST.found_in(&window);
        let cut = if found {
            window.len()
        } else {
            window.len().saturating_sub(keep)
        };
        self.tail = window.split_off(cut);
        found
    }

    /// Forget carried bytes; a new connection starts clean.
    pub fn reset(&mut self) {
        self.tail.clear();
    }
}

/// Space separated upper-case hex, e.g. `FF 55 02`.
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
