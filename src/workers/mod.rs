//! Background side-effect workers
//!
//! Display and persistence run behind bounded queues, each with its own
//! consumer thread, so slow I/O never delays a relocalization response.

pub mod display;
pub mod save_stream;
pub mod sink;
