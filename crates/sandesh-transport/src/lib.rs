#![warn(missing_docs)]

//! Sandesh transport subsystem: TCP/TLS collector sessions, the structured
//! record codec boundary, and the length-prefixed message envelope framer.

pub mod codec;
pub mod error;
pub mod framer;
pub mod tcp;
pub mod tls;
