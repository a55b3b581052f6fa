//! Owner compensation: calculation, payout, batch sweep and reporting.

pub mod engine;
pub mod report;

pub use engine::*;
pub use report::*;
