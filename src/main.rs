mod bootstrap;
mod cli;
mod config;
mod dispatcher;
mod engine;
mod log_sink;
mod poll;
mod thread_pool;

use std::process::ExitCode;

fn main() -> ExitCode {
    // hand over control to the CLI driver immediately
    cli::execute()
}
