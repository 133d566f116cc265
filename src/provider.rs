//! Upstream identity-provider metadata.
//!
//! `descriptor` exposes the validated [`ProviderDescriptor`]: where discovery lives, which token
//! types the exchange requests, and how long discovery results may be reused. Endpoints must use
//! HTTPS; plain HTTP is only tolerated for loopback hosts so local mock providers work.

pub mod descriptor;

pub use descriptor::*;
