#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod source;
pub mod transport;
