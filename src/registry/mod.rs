//! Origin registry access: challenge parsing, the retrying blob client and
//! the [`OriginRegistry`] seam used by the coordinator.

pub mod challenge;
pub mod client;
pub mod origin;

pub use challenge::BearerChallenge;
pub use client::{RetryPolicy, RetryingClient};
pub use origin::{HttpOriginRegistry, ManifestResponse, OriginRegistry, TokenGrant};
