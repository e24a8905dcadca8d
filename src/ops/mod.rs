//! Ops reports for router administration

pub mod stats;

pub use stats::{LoadReport, RingReport, ServerArc};
