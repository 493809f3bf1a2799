//! External action invocation.
//!
//! Pipelines depend on [`ActionInvoker`] only. [`ProcessInvoker`] is the
//! production implementation; tests substitute scripted doubles.

pub mod envelope;
pub mod invoker;
pub mod process;

pub use envelope::{Envelope, extract_last_object};
pub use invoker::{Action, ActionError, ActionInvoker, ActionPhase, ActionRequest, ActionTimeouts};
pub use process::{AdapterLayout, ProcessInvoker};
