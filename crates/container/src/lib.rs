//! The container engine.
//!
//! [`Container`] is the only public surface of the runtime: it composes the
//! bundle writer, the spec emitter, the layer stack, the supervisor and one
//! of the platform backends into the lifecycle
//! `create → spawn* → destroy`.

pub mod container;
pub mod hcs;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod policy;

pub use crate::container::{
    BackendKind, Container, ContainerState, CreateOptions, CreateOptionsBuilder, ProcessToken,
    ResourceLimits, ResourceLimitsBuilder,
};
pub use policy::{Capabilities, Capability, IntegrityLevel, SecurityPolicy, SecurityPolicyBuilder};
