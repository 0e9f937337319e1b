//! # trainjob-id
//!
//! Stable identity types for the trainjob controller.
//!
//! ## Design Principles
//!
//! - Job keys (`namespace/name`) are user-controlled and stable across
//!   delete/recreate
//! - Uids are system-generated and unique per incarnation
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed to prevent mixing different resource types
//!
//! ## ID Format
//!
//! Uids use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `job_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `wu_01HV4Z3MXNKPQR9HSTZ7WCLD4E`

mod error;
mod key;
mod macros;
mod types;

pub use error::IdError;
pub use key::{JobKey, MAX_LABEL_LEN};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
