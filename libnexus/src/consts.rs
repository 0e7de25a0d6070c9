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

use std::time;

/// How long the save task sleeps between `adapter.store()` flushes while a
/// table remains dirty.
pub const SAVE_TASK_INTERVAL: time::Duration = time::Duration::from_secs(30);

/// Read timeout applied while waiting for the connect handshake frame, so a
/// slow or hung client can't pin an accept-loop thread forever.
pub const HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

pub const JOIN_POLL_DURATION: time::Duration = time::Duration::from_millis(100);

/// The default bind address when neither `--bind` nor the config file
/// specify one.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:26423";

// If set to "true", the daemon will autodaemonize after launch.
pub const AUTODAEMONIZE_VAR: &str = "NEXUS__INTERNAL__AUTODAEMONIZE";
