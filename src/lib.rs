// ABOUTME: Library root for the RTU bus arbiter — framing, transactor, and session modules
// ABOUTME: The rtu-broker binary is a thin wrapper that parses Config and calls supervisor::run

pub mod config;
pub mod crc;
pub mod error;
pub mod events;
pub mod frame;
pub mod request;
pub mod serial;
pub mod shine;
pub mod sniff;
pub mod supervisor;
pub mod tcp_session;
pub mod transactor;
