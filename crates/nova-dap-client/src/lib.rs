//! Nova's client side of the Debug Adapter Protocol.
//!
//! This crate provides:
//! - Content-Length framing and a request dispatcher over any async byte stream.
//! - [`DebugSession`], the lifecycle state machine for one adapter connection,
//!   with a lazily fetched thread/frame/scope/variable model.
//! - [`BreakpointSynchronizer`], which mirrors a [`BreakpointStore`] into every
//!   live session one source file at a time.
//! - [`ShutdownCoordinator`], for stopping many sessions without tearing
//!   transports down under their readers.

pub mod adapter;
pub mod breakpoints;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod transport;

pub use crate::adapter::{AdapterCommand, AdapterConnection, DebugAdapter, WireAdapter, WireAdapterConfig};
pub use crate::breakpoints::{
    BreakpointAttributes, BreakpointChange, BreakpointId, BreakpointRecord, BreakpointStore,
    BreakpointSynchronizer, InMemoryBreakpointStore,
};
pub use crate::error::{DapError, Result, SessionError};
pub use crate::session::{
    ConfigurationHook, DebugSession, LaunchKind, SessionEvent, SessionId, SessionOptions,
    SessionState, StopKind,
};
pub use crate::shutdown::{ShutdownCoordinator, ShutdownHandle, ShutdownOutcome};
