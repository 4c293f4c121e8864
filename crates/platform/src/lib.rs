//! # Ironwire Platform
//!
//! Platform abstractions shared by the Ironwire protocol crates.
//!
//! This crate provides:
//! - Unified error types (`IronwireError`, `IronwireResult`)
//! - The kernel IPsec engine interface (`KernelIpsec`) with an in-memory
//!   reference engine (`MemoryKernel`) for tests and kernel-less deployments
//!
//! # Examples
//!
//! ```
//! use ironwire_platform::{IronwireError, IronwireResult};
//!
//! fn example_function() -> IronwireResult<String> {
//!     Ok("Hello, Ironwire!".to_string())
//! }
//!
//! # fn main() -> IronwireResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Ironwire!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod kernel;

pub use error::{IronwireError, IronwireResult};
pub use kernel::{FlowSelector, KernelFeatures, KernelIpsec, MemoryKernel, PolicyEntry, SaEntry};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
