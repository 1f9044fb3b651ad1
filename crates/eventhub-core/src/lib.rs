//! Event Hub Core Types
//!
//! Shared event model used by the processor runtime and by in-process
//! receive layers.
//!
//! - **EventData**: a single event as delivered from a partition
//! - **EventPosition**: where a partition receiver starts reading

pub mod event;
pub mod position;

pub use event::EventData;
pub use position::EventPosition;
