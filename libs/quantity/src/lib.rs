//! # armada-quantity
//!
//! Exact resource quantity types for the armada fleet manager.
//!
//! ## Design Principles
//!
//! - Quantities are typed to prevent mixing dimensions: CPU is integer
//!   millicores, memory is integer bytes
//! - Parsing accepts the orchestrator's quantity grammar (`"500m"`, `"2.5"`,
//!   `"1500Mi"`, `"2G"`) and round-trips through the canonical form
//!   (parse → format → parse preserves the numeric value)
//! - All arithmetic is exact integer arithmetic; scaling by a ratio is
//!   performed in 128-bit intermediates so totals never drift

mod error;
mod types;

pub use error::QuantityError;
pub use types::{Cpu, Memory, Resources};
