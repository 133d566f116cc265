//! Inbound identity: strongly typed identifiers, redacted secrets, and the upstream bearer token.

pub mod id;
pub mod secret;
pub mod upstream;

pub use id::*;
pub use secret::*;
pub use upstream::*;
