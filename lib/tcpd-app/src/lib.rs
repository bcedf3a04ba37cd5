//! Process bootstrap primitives.
//!
//! Everything a `tcpd` binary needs to do before handing control to the server: currently, initializing logging.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration, LoggingGuard};
}
