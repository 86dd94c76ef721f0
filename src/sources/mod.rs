//! Signal source adapters
//!
//! Physical bus decoding lives outside this crate; adapters here feed
//! already-decodable readings into the signal pipeline through the active
//! decoder dictionary. The stdin adapter covers integration testing and
//! custom-source deployments.

mod stdin;

pub use stdin::run_stdin_source;
