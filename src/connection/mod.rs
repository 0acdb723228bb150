//! Connection Module
//!
//! The shared connection handle, its address helpers, the pipeline hook run
//! for every new connection and the tasks that move lines on and off the
//! socket.

pub mod address;
#[allow(clippy::module_inception)]
pub mod connection;
pub(crate) mod codec;
pub(crate) mod idle;
pub(crate) mod io;
pub mod pipeline;

pub use address::ConnectionAddressView;
pub use connection::{AttributeKey, CloseListenerId, Connection};
pub use pipeline::{
    ConnectionHandler, DiscardHandler, IdleConfig, IdleState, LineInitializer, Pipeline,
    PipelineInitializer, DEFAULT_MAX_FRAME_LENGTH,
};
