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

//! The security/authenticator (C7): issues and validates session tokens,
//! and tracks whatever permission grants an app has been given outside of
//! its own ownership bypass (dashboard-style grant management is out of
//! scope here, so grants default to empty and a session leans on
//! [`crate::permission::PermissionExtension`]'s ownership shortcut).

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU64, Ordering},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use nexus_protocol::identifier::{App, Identifier};

struct TokenRecord {
    app_key: String,
    grants: Vec<Identifier>,
}

/// Issues opaque tokens to apps on first connect, and returns the same
/// token (and the same grants) on reconnect, so a client can persist its
/// token across restarts and keep its identity.
#[derive(Default)]
pub struct Security {
    // token -> record
    by_token: Mutex<HashMap<String, TokenRecord>>,
    counter: AtomicU64,
}

impl Security {
    pub fn new() -> Security {
        Security { by_token: Mutex::new(HashMap::new()), counter: AtomicU64::new(0) }
    }

    /// Authenticates a freshly connected app, returning its granted
    /// permission set and the token it should be told to remember.
    ///
    /// If `token` was supplied and is on file for this same app, the same
    /// token (and its grants) are returned. Otherwise a fresh token is
    /// minted for the app with an empty grant set.
    pub fn authenticate_app(
        &self,
        app: &App,
        token: Option<&str>,
    ) -> (Vec<Identifier>, String) {
        let app_key = app.id.key();
        let mut by_token = self.by_token.lock().expect("security lock poisoned");

        if let Some(token) = token {
            if let Some(record) = by_token.get(token) {
                if record.app_key == app_key {
                    return (record.grants.clone(), token.to_string());
                }
            }
        }

        let fresh = self.mint_token(&app_key);
        by_token.insert(fresh.clone(), TokenRecord { app_key, grants: Vec::new() });
        (Vec::new(), fresh)
    }

    /// Installs (or replaces) the grant set recorded against whichever
    /// token is currently on file for `app_key`. A no-op if the app hasn't
    /// authenticated yet.
    pub fn set_grants(&self, app_key: &str, grants: Vec<Identifier>) {
        let mut by_token = self.by_token.lock().expect("security lock poisoned");
        for record in by_token.values_mut() {
            if record.app_key == app_key {
                record.grants = grants;
                return;
            }
        }
    }

    fn mint_token(&self, app_key: &str) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();

        let mut hasher = DefaultHasher::new();
        app_key.hash(&mut hasher);
        seq.hash(&mut hasher);
        nanos.hash(&mut hasher);
        format!("{:016x}{:016x}", hasher.finish(), seq)
    }
}
