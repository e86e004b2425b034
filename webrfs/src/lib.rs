//! HTTP(S) front-end for the resolving filesystem.

pub mod http;
pub mod shutdown;

pub use http::{HttpBackend, Scheme, UserAgentFile, build_url};
pub use shutdown::shutdown_signal;
