//! Command-line front end of the application cache.
//!
//! Provides the [`Runtime`] that wires storage, fetcher and service
//! together, plus argument parsing and event printing for the binary.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod error;
pub mod frontend;
pub mod runtime;

pub use cli::{Cli, Command};
pub use error::{CliError, CliResult};
pub use frontend::PrintingFrontend;
pub use runtime::Runtime;
