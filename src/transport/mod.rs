//! Network transport between the pipeline and the realtime endpoint.

mod websocket;

pub use websocket::{RealtimeTransport, TransportExit};
