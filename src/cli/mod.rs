pub mod commands;
pub mod output;

pub use commands::{BuildArgs, CliArgs, Commands, InspectBuilderArgs, PullArgs};
pub use output::{ConsoleHandler, OutputFormat, OutputFormatter};
