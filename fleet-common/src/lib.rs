//! # Fleet Common
//!
//! Shared logging utilities for the fleet manager daemon and its libraries.
//!
//! ```rust
//! use fleet_common::{init_logging, log_success, log_error};
//!
//! init_logging("info").unwrap();
//! log_success!("registry", "VM registered successfully");
//! ```

pub mod logging;

pub use logging::{
    init_logging,
    init_logging_json,
    log_system_diagnostics,
    Loggable,
    TimedOperation,
};
