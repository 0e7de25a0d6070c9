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

//! The permission extension (C8): declares publishable permission types
//! and evaluates `has_permission` for every mutation gated by one.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use nexus_protocol::identifier::Identifier;
use nexus_protocol::permission::PermissionType;

use crate::session::SessionId;

#[derive(Default)]
struct Inner {
    declared: HashMap<String, PermissionType>,
    session_grants: HashMap<SessionId, HashSet<String>>,
}

/// Tracks every permission the server is willing to grant, and which
/// sessions currently hold which grants.
#[derive(Default)]
pub struct PermissionExtension {
    inner: Mutex<Inner>,
}

impl PermissionExtension {
    pub fn new() -> PermissionExtension {
        PermissionExtension::default()
    }

    pub fn declare(&self, permission: PermissionType) {
        let mut inner = self.inner.lock().expect("permission lock poisoned");
        inner.declared.insert(permission.id.key(), permission);
    }

    pub fn declared(&self) -> Vec<PermissionType> {
        let inner = self.inner.lock().expect("permission lock poisoned");
        inner.declared.values().cloned().collect()
    }

    /// Replaces the grant set for `session`. Called once at handshake time
    /// with whatever [`crate::security::Security`] returned for the app.
    pub fn set_grants(&self, session: SessionId, grants: Vec<Identifier>) {
        let mut inner = self.inner.lock().expect("permission lock poisoned");
        inner.session_grants.insert(session, grants.into_iter().map(|g| g.key()).collect());
    }

    pub fn clear_session(&self, session: SessionId) {
        let mut inner = self.inner.lock().expect("permission lock poisoned");
        inner.session_grants.remove(&session);
    }

    /// True iff `session` may exercise `required`, either because the
    /// session's app owns `required` (is an ancestor of it) or because one
    /// of the session's grants equals or is an ancestor of `required`.
    pub fn has_permission(
        &self,
        session: SessionId,
        app_id: &Identifier,
        required: &Identifier,
    ) -> bool {
        if required.is_subpart_of(app_id) {
            return true;
        }

        let inner = self.inner.lock().expect("permission lock poisoned");
        let Some(grants) = inner.session_grants.get(&session) else {
            return false;
        };
        // A grant authorizes `required` if `required` is a subpart of the
        // granted identifier (the grant names an ancestor) -- so walk every
        // grant and test ancestry both ways isn't needed, only this one.
        grants.iter().any(|granted_key| {
            let Ok(granted) = Identifier::from_key(granted_key) else { return false };
            required.is_subpart_of(&granted)
        })
    }

    /// Evaluates an `Option<Identifier>` permission field the way
    /// `RegistryPermissions`/`TablePermissions` store them: `None` means
    /// "no permission declared for this field", which denies by default
    /// (ownership bypass still applies independently via
    /// [`Self::has_permission`]).
    pub fn satisfies(
        &self,
        session: SessionId,
        app_id: &Identifier,
        field: &Option<Identifier>,
    ) -> bool {
        match field {
            Some(required) => self.has_permission(session, app_id, required),
            None => false,
        }
    }
}
