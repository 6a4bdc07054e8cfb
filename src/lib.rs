//! # toolgate
//!
//! Tool-invocation runtime: lets a caller run a named, pluggable capability
//! synchronously or as a cancellable background job, while protecting the
//! system from abuse and keeping memory bounded.
//!
//! Four components cooperate on every invocation: the admission gateway
//! (payload validation, scope authorization, rate limiting, PII scrubbing
//! for logs), the lazy capability registry (discovery without
//! instantiation, load/unload), the task manager (lifecycle, cooperative
//! cancellation, TTL expiry, 202-Accepted polling protocol), and the
//! metrics sink observing all of the above.

pub mod admission;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod tasks;

pub use admission::{AdmissionGateway, RateLimiter, ScopeAuthorizer};
pub use config::RuntimeConfig;
pub use error::{AdmissionError, CapabilityError, ErrorCode, InvokeError, TaskError};
pub use registry::{Capability, CapabilityDescriptor, CapabilityRegistry, InvocationContext};
pub use runtime::ToolRuntime;
pub use tasks::{TaskManager, TaskPriority, TaskRecord, TaskStatus};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
