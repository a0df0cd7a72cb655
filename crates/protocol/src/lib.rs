//! Host/core execution protocol for pluggable CPU-core models.
//!
//! A host supplies a memory and I/O environment; a core model plugs into it
//! and steps instructions against it. This crate carries the protocol
//! surface both sides agree on: the transaction data model, the
//! [`Environment`] capability trait the host implements, the [`CoreModel`]
//! trait a plugin implements, and the factory/registry contract used to
//! instantiate cores with protocol-version negotiation.

/// Memory/port transaction data model and page constants.
pub mod transaction;
pub use transaction::{page_base, HintKind, Response, Transaction, PAGE_SIZE};

/// Host-side capability surface.
pub mod environment;
pub use environment::{DirectPage, Environment};

/// Plugin-side core model contract.
pub mod core;
pub use self::core::{CoreModel, RunState, StopToken};

/// Factories, protocol versioning, and the provider registry.
pub mod factory;
pub use factory::{
    api_version_supported, CoreFactory, FactoryRegistry, RegistryError, API_VERSION,
    COMPAT_API_VERSION, SUPPORTED_API_VERSIONS,
};
