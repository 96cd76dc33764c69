//! Charging-station business layer for the GridLink engine.
//!
//! [`Station`] holds the mutable station state (EVSEs, display messages,
//! installed certificates); [`handlers::register_station_handlers`] exposes
//! it over a node's action dispatch. Everything here speaks typed payloads;
//! the engine below never inspects them.

pub mod handlers;
pub mod station;
pub mod types;

pub use handlers::register_station_handlers;
pub use station::{certificate_hash, Station};
