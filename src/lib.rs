#![forbid(unsafe_code)]

// roomcast library - SFU session orchestration behind a WebSocket signaling server

pub mod config;
pub mod media;
pub mod metrics;
pub mod room;
pub mod session;
pub mod signaling;
