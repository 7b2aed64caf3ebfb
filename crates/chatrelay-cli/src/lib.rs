pub mod commands;
pub mod error;
pub mod output;

pub use commands::{AskCommand, CheckCommand, RoutesCommand};
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, truncate_string};
