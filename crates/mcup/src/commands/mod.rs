//! Command handlers for the mcup CLI.

pub mod config;
pub mod logging;
pub mod run;

pub use config::*;
pub use logging::*;
pub use run::*;
