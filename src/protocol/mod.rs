//! Wire protocol module
//!
//! The frame codec and the stream boundary detector.

pub mod frame;

pub use frame::{scan_boundary, Frame, ENVELOPE_SIZE, FRAME_OVERHEAD};
