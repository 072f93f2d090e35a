//! # strata-resources
//!
//! The resource algebra underpinning the strata allocator.
//!
//! ## Design Principles
//!
//! - Resources are value types with structural equality; all arithmetic is
//!   exact (fixed-point scalars), so equality is meaningful in tests and
//!   invariant checks
//! - Addition forms a commutative monoid; subtraction is partial
//!   (`checked_sub`) with a saturating variant for hot paths
//! - Reservations, revocability, sharedness, and allocation-role tags are
//!   item metadata: items merge only when their metadata matches exactly
//!
//! No async, no I/O; this crate is embeddable anywhere.

mod quantities;
mod resource;
mod resources;
pub mod roles;

pub use quantities::{ResourceQuantities, Scalar};
pub use resource::{DiskKind, Ranges, Resource, Value};
pub use resources::Resources;

/// Errors arising from resource parsing and arithmetic.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// A textual resource description could not be parsed.
    #[error("invalid resource syntax: {0}")]
    InvalidSyntax(String),

    /// Subtraction would go negative or remove an item that is not present.
    #[error("cannot subtract {subtrahend} from {minuend}")]
    Underflow { minuend: String, subtrahend: String },

    /// A role path failed validation.
    #[error("invalid role '{0}'")]
    InvalidRole(String),
}
