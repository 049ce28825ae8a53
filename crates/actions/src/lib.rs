//! `actions` crate: the [`ActionDispatcher`] capability the engine calls
//! out through, plus a handler registry and built-in actions.
//!
//! Every third-party adapter, built-in and test double alike, sits behind
//! [`ActionDispatcher`]. The engine never knows which one it is talking to.

pub mod builtin;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use error::ActionError;
pub use registry::ActionRegistry;
pub use traits::{ActionContext, ActionDispatcher, ActionHandler, ActionRequest};
