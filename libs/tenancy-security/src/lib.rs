#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Request identity and workspace exemption rules shared by the tenancy crates.
pub mod context;
pub mod exemption;

pub use context::{ACTIVE_WORKSPACE_HEADER, RequestContext, RequestContextBuilder};
pub use exemption::{ExemptionConfig, ExemptionError, ExemptionPolicy};
