//! # strata-allocator
//!
//! The allocation engine of the strata master: a two-level, weighted-DRF
//! cluster allocator with per-role quota guarantees, reservations, offer
//! filters, and maintenance-driven inverse offers.
//!
//! ## Architecture
//!
//! ```text
//! AllocatorHandle ── messages ──▶ actor task
//!                                   └── HierarchicalAllocator (engine state)
//!                                         ├── DrfSorter (roles)
//!                                         ├── DrfSorter (quota'd roles)
//!                                         └── DrfSorter per role (frameworks)
//! ```
//!
//! The engine itself ([`HierarchicalAllocator`]) is a synchronous state
//! machine: every entry point mutates state and returns. [`spawn`] wraps it
//! in a single-threaded actor that serializes all entry points, drives the
//! periodic allocation timer, and routes filter-expiry callbacks back onto
//! the engine. Embedders that want to drive cycles themselves can use the
//! engine directly and call [`HierarchicalAllocator::run_allocation_cycle`].
//!
//! Offers are delivered through callbacks invoked on the actor task; they
//! must not re-enter the engine (send a message through the handle instead).

pub mod actor;
pub mod agent;
pub mod core;
pub mod error;
pub mod filters;
pub mod framework;
pub mod ids;
pub mod metrics;
pub mod options;
pub mod sorter;

pub use self::actor::{spawn, AllocatorHandle};
pub use self::agent::{
    Agent, AgentCapabilities, AgentInfo, FaultDomain, InverseOfferResponse, InverseOfferStatus,
    UnavailableResources, Unavailability,
};
pub use self::core::{
    HierarchicalAllocator, InverseOfferCallback, InverseOffers, OfferCallback, Offers,
    ResourceConversion, WeightSpec,
};
pub use self::error::{AllocatorError, AllocatorResult};
pub use self::filters::Refusal;
pub use self::framework::{Framework, FrameworkCapabilities, FrameworkSpec};
pub use self::ids::{AgentId, FrameworkId};
pub use self::options::AllocatorOptions;
pub use self::sorter::DrfSorter;

// The resource algebra is part of this crate's public API surface.
pub use strata_resources::{Resource, ResourceQuantities, Resources, Scalar};
