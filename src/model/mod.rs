//! Order data carried between pipeline stages.
//!
//! Orders travel as JSON payloads on the stream and are handed off by value;
//! no stage shares a mutable order with another.

pub mod order;

pub use order::*;
