//! The execution core of a worker peer: validate user code, run it in a
//! sandboxed interpreter, reconcile the interpreter's stdout into increments,
//! detect phase completion and report to the coordinator.

pub mod core;
pub mod map;
pub mod propagate;
pub mod reconcile;
pub mod reduce;
pub mod sandbox;
pub mod session;
pub mod signal;
pub mod validator;

pub use crate::core::{event_channel, Event, ProcessingLoop, StdoutSink, Worker};
pub use crate::session::RoomSession;
