//! Measurement sequences
//!
//! Straight-line procedures with fixed delays, written against the
//! capability traits in [`crate::hardware::capabilities`].

pub mod assignment;
pub mod four_wire;
pub mod hall_pulse;

pub use assignment::{Assignment, Contact, Terminal};
