//! Byte-level encodings: order-preserving keys, serde payloads, checksummed
//! record framing and the client mutation buffer format.

pub mod bincode;
pub mod frame;
pub mod keycode;
pub mod mutation;
