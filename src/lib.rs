//! Multi-port instrument bridge.
//!
//! Speaks text-oriented instrumentation protocols (SCPI, Edwards TIC, ERN)
//! over serial or TCP connections and exposes each connected instrument as a
//! set of named controls on an MQTT-style bus. Each port runs its own
//! commander state machine handling reconnects, command serialisation and
//! timeouts; protocol adapters translate between the wire dialects and the
//! shared parameter/control model.

pub mod clock;
pub mod commander;
pub mod config;
pub mod device;
pub mod error;
pub mod framer;
pub mod lf_filter;
pub mod model;
pub mod mqtt;
pub mod observer;
pub mod protocol;
pub mod transport;
