//! Capability registry: discovery without instantiation, lazy loading,
//! explicit unload.

pub mod capability;
pub mod registry;

pub use capability::{
    infer_category, CancelFlag, Capability, CapabilityDescriptor, InvocationContext,
};
pub use registry::{CapabilityFactory, CapabilityRegistry, RegistryStats};
