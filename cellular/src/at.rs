//! AT command transport: byte framing, callback registry, command/response facade and
//! transparent data mode.

pub mod callbacks;
pub mod engine;
#[cfg(feature = "std")]
pub mod fake_modem;
pub mod framer;
pub mod response;
pub mod uart;
