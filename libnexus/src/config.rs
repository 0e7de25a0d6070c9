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

use std::{
    fs,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use anyhow::Context;
use nexus_protocol::identifier::Identifier;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::config_watcher::ConfigWatcher;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Some(mut config_path) = dirs_config_home() {
        config_path.push("nexus");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

fn dirs_config_home() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg));
    }
    std::env::var("HOME").ok().map(|home| PathBuf::from(home).join(".config"))
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The address nexus should bind its listener to. Defaults to
    /// [`crate::consts::DEFAULT_BIND_ADDR`].
    pub bind: Option<String>,

    /// The default `cache_size` new tables are created with before a
    /// client issues `TABLE_SET_CONFIG`. `None` means unbounded, matching
    /// the table engine's own default.
    pub default_table_cache_size: Option<i64>,

    /// Overrides the table/registry deferred-save task's sleep interval, in
    /// seconds. Mostly useful for tests; production deployments should
    /// leave this unset to get the documented 30 second interval.
    pub save_task_interval_secs: Option<u64>,

    /// The directory the reference storage adapter persists table and
    /// registry contents under. Defaults to a temp directory when unset,
    /// which is fine for a single run but won't survive a restart.
    pub storage_dir: Option<String>,

    /// Permission types to declare at startup, in addition to whatever
    /// individual apps register for themselves at runtime.
    #[serde(default)]
    pub permission: Vec<DeclaredPermission>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeclaredPermission {
    pub id: String,
    #[serde(default = "default_permission_level")]
    pub level: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub note: String,
}

fn default_permission_level() -> String {
    "low".to_string()
}

impl DeclaredPermission {
    pub fn identifier(&self) -> anyhow::Result<Identifier> {
        Identifier::from_key(&self.id)
    }
}

/// Holds the live `Config`, reloading it in place whenever the backing file
/// changes so handlers always observe the latest settings without a
/// restart. Mirrors the same watch-and-swap pattern used in other parts of
/// this codebase for hot-reloadable state.
pub struct Manager {
    inner: Arc<RwLock<Config>>,
    // kept alive for its `Drop` impl, which tears down the watcher thread
    _watcher: Option<ConfigWatcher>,
}

impl Manager {
    pub fn new(config_file: Option<String>) -> anyhow::Result<Manager> {
        let config = read_config(&config_file)?;
        let inner = Arc::new(RwLock::new(config));

        let watcher = if let Some(path) = config_file.clone() {
            let watch_inner = Arc::clone(&inner);
            let watch_path = path.clone();
            let mut watcher = ConfigWatcher::new(move || {
                match read_config(&Some(watch_path.clone())) {
                    Ok(fresh) => {
                        info!("reloaded config from {}", watch_path);
                        *watch_inner.write().expect("config lock poisoned") = fresh;
                    }
                    Err(err) => {
                        tracing::error!("failed to reload config: {:?}", err);
                    }
                }
            })?;
            watcher.watch(&path).context("watching config file for changes")?;
            Some(watcher)
        } else {
            None
        };

        Ok(Manager { inner, _watcher: watcher })
    }

    pub fn get(&self) -> Config {
        self.inner.read().expect("config lock poisoned").clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            bind = "127.0.0.1:9999"
            default_table_cache_size = 100
            "#,
            r#"
            [[permission]]
            id = "cc.omuchat:chat.read"
            level = "low"
            name = "Read chat"
            "#,
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    fn declared_permission_parses_identifier() {
        let perm = DeclaredPermission {
            id: "cc.omuchat:chat.read".to_string(),
            level: "low".to_string(),
            name: "Read chat".to_string(),
            note: String::new(),
        };
        let id = perm.identifier().unwrap();
        assert_eq!(id.key(), "cc.omuchat:chat.read");
    }
}
