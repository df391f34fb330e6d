//! Frame-ordering pipeline
//!
//! Per-client sessions feed a bounded reorder window; the dispatcher drains
//! it in timestamp order into the shared relocalization backend.
//!
//! # Architecture
//!
//! - `registry` owns every `ClientSession`, indexed by session id
//! - `camera_mode` locks a session to mono or stereo
//! - `frame_buffer` turns out-of-order arrivals into ordered entries
//! - `dispatcher` drives the lifecycle and the frame path
//! - `backend` is the capability interface of the external engine

pub mod backend;
pub mod camera_mode;
pub mod dispatcher;
pub mod frame_buffer;
pub mod health;
pub mod rate;
pub mod registry;
pub mod session;
pub mod state;
pub mod types;

pub use backend::{LocalPipeline, RelocalizationPipeline};
pub use dispatcher::RelocalizationDispatcher;
pub use frame_buffer::ReorderConfig;
