// Copyright 2023 Google LLC
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

use std::{env, net::TcpListener};

use anyhow::Context;
use tracing::{info, instrument};

use crate::{config, consts};

mod server;
mod signals;

#[instrument(skip_all)]
pub fn run(config_file: Option<String>, bind_override: Option<String>) -> anyhow::Result<()> {
    if let Ok(daemonize) = env::var(consts::AUTODAEMONIZE_VAR) {
        if daemonize == "true" {
            env::remove_var(consts::AUTODAEMONIZE_VAR); // avoid looping

            let pid_file = env::temp_dir().join("daemonized-nexus.pid");
            info!("daemonizing with pid_file={:?}", pid_file);
            daemonize::Daemonize::new().pid_file(pid_file).start().context("daemonizing")?;
        }
    }

    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    let config_manager = config::Manager::new(config_file)?;
    let server = server::Server::new(config_manager)?;

    let bind_addr = bind_override.unwrap_or_else(|| server.bind_addr());
    let listener = TcpListener::bind(&bind_addr)
        .with_context(|| format!("binding to {}", bind_addr))?;
    info!(bind_addr, "listening");

    signals::Handler::new().spawn()?;

    server::Server::serve(server, listener)?;

    Ok(())
}
