//! Vehicle-to-grid orchestration for EV charging fleets.
//!
//! [`controller::SessionManager`] runs discharge sessions against the device
//! collaborators, [`pricing`] prices the energy and [`settlement`] pays the
//! vehicle owners.

pub mod clock;
pub mod config;
pub mod context;
pub mod controller;
pub mod domain;
pub mod error;
pub mod events;
pub mod hardware;
pub mod pricing;
pub mod repo;
pub mod settlement;
pub mod telemetry;
pub mod wallet;

pub use error::{V2gError, V2gResult};
