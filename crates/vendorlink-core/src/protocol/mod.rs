//! Protocol module - wire constants, frame codec and handshake literals.

pub mod constants;
pub mod handshake;
pub mod packet;

pub use constants::*;
pub use handshake::{INIT_REQUEST, INIT_RESPONSE, InitScanner, Literal, hex_string};
pub use packet::{Packet, PacketError, checksum, decode, encode};
