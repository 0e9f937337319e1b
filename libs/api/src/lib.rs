//! # trainjob-api
//!
//! Resource types for distributed training jobs.
//!
//! ## Design Principles
//!
//! - The spec is read-only to the controller; only status is written
//! - Status is derived from observed worker units plus the job's own history
//! - Terminal phases are sticky
//! - Unset and explicit-zero fields stay distinguishable (`Option<T>`)
//!
//! ## Registration
//!
//! Kinds are registered explicitly at process start:
//!
//! ```
//! let mut scheme = trainjob_api::Scheme::new();
//! trainjob_api::register(&mut scheme).unwrap();
//! ```

mod error;
mod job;
mod scheme;
mod spec;
mod status;
mod unit;

pub use error::ApiError;
pub use job::Job;
pub use scheme::{
    register, set_defaults, Defaulter, GroupVersionKind, JobManifest, ObjectMeta, Scheme, GROUP,
    KIND, LIST_KIND, VERSION,
};
pub use spec::*;
pub use status::*;
pub use unit::*;
