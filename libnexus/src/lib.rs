// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::format::FmtSpan;

mod config;
mod config_watcher;
mod connection;
mod consts;
mod daemon;
mod dispatcher;
mod mapper;
mod permission;
mod registry;
mod security;
mod session;
mod storage;
mod table;

/// The command line arguments nexus expects. These can be directly parsed
/// with clap or manually constructed in order to present some other user
/// interface.
///
/// NOTE: You must check `version()` and handle it yourself if it is set.
/// Clap won't do a good job with its automatic version support for a
/// library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Runs the bus daemon in the foreground")]
    Serve {
        #[clap(short, long, action, help = "The address to bind the listener to")]
        bind: Option<String>,

        #[clap(short, long, action, help = "a toml file containing configuration")]
        config_file: Option<String>,

        #[clap(
            short,
            long,
            action,
            long_help = "The file to write logs to

Logs go to stderr by default."
        )]
        log_file: Option<String>,

        #[clap(
            short,
            long,
            action = clap::ArgAction::Count,
            help = "Show more in logs, may be provided multiple times",
        )]
        verbose: u8,
    },
}

impl Args {
    /// Version indicates if the wrapping binary must display the version
    /// then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Runs nexus with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let Commands::Serve { bind, config_file, log_file, verbose } = args.command else {
        return Err(anyhow!("wrapper binary must handle version"));
    };

    let trace_level = if verbose == 0 {
        tracing::Level::INFO
    } else if verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = log_file {
        let file = std::fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    if let Err(err) = daemon::run(config_file, bind) {
        tracing::error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
