//! Tool abstractions and the wrapper the engine runs them in.
//!
//! Every capability the model can call is a [`Tool`] implementor, collected
//! into a [`ToolSet`] for dispatch by name. Extensions and callers hand the
//! engine plain tools; the engine resolves them into one set per call and
//! wraps each one.
//!
//! # Submodules
//!
//! - [`core`]: [`Tool`] trait, [`ToolSet`], [`FnTool`], argument parsing and
//!   JSON schema validation.
//! - [`filter`]: [`ToolPolicy`] (allow/block lists) and [`ApprovalConfig`].
//! - [`managed`]: [`ManagedTool`], which validates, gates on approval,
//!   notifies extensions and retries with backoff.
//! - [`resolver`]: [`ToolResolver`], which merges, filters, wraps and caches.

pub mod core;
pub mod filter;
pub mod managed;
pub mod resolver;

pub use core::{
    FnTool, Tool, ToolFuture, ToolOutput, ToolSet, parse_arguments, parse_tool_args,
    validate_tool_arguments,
};
pub use filter::{ApprovalConfig, ApprovalRule, ApprovalSpec, ToolPolicy};
pub use managed::{FailureLog, ManagedTool, ToolFailure, ToolRuntime};
pub use resolver::ToolResolver;
