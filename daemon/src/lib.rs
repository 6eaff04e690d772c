//! h2 daemon: thin wrapper around `h2_core::session::Session`. No HTTP, no dashboard — attach
//! happens over the local stream socket h2_core binds.

pub use h2_core::session::Session;
