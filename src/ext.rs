//! Public extension contracts for attaching broker credentials to foreign request types.

pub mod request_signer;

pub use request_signer::*;
