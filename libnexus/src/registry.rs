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

//! The registry extension (C9): a replicated key/value store, one entry
//! per [`Identifier`], with listener fan-out on every update. Holds only
//! state and permission bookkeeping -- actually delivering an update to a
//! listening session is the caller's job, since that requires looking the
//! [`crate::session::SessionId`] up in the server's live session table.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use nexus_protocol::error::BusError;
use nexus_protocol::identifier::Identifier;
use nexus_protocol::permission::RegistryPermissions;

use crate::permission::PermissionExtension;
use crate::session::SessionId;
use crate::storage::StorageAdapter;

/// The single key a registry entry's value is stored under in its adapter --
/// registries have exactly one value each, so there is nothing to key by
/// beyond a fixed sentinel.
const VALUE_KEY: &[u8] = b"value";

struct Entry {
    value: Option<Vec<u8>>,
    permissions: RegistryPermissions,
    listeners: HashSet<SessionId>,
    adapter: Arc<dyn StorageAdapter>,
}

impl Entry {
    fn new(adapter: Arc<dyn StorageAdapter>) -> Entry {
        let value = adapter.get(VALUE_KEY).ok().flatten();
        Entry { value, permissions: RegistryPermissions::default(), listeners: HashSet::new(), adapter }
    }
}

type AdapterFactory = Box<dyn Fn(&Identifier) -> Arc<dyn StorageAdapter> + Send + Sync>;

pub struct RegistryExtension {
    entries: Mutex<HashMap<String, Entry>>,
    adapter_factory: AdapterFactory,
}

impl RegistryExtension {
    pub fn new(adapter_factory: AdapterFactory) -> RegistryExtension {
        RegistryExtension { entries: Mutex::new(HashMap::new()), adapter_factory }
    }

    /// Declares (or re-declares) a registry entry. Only the owning app --
    /// one for whom `id.is_subpart_of(app_id)` holds -- may do this, which
    /// keeps one app from squatting on another's namespace. The entry's
    /// persisted value, if any, is loaded lazily the first time the entry
    /// is created rather than scanned up front: the storage adapter has no
    /// "list every identifier" operation to drive an eager preload.
    pub fn register(
        &self,
        id: &Identifier,
        app_id: &Identifier,
        permissions: RegistryPermissions,
    ) -> Result<(), BusError> {
        if !id.is_subpart_of(app_id) {
            return Err(BusError::PermissionDenied(format!(
                "{} may not register {}, which it does not own",
                app_id, id
            )));
        }
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .entry(id.key())
            .and_modify(|e| e.permissions = permissions.clone())
            .or_insert_with(|| {
                let mut entry = Entry::new((self.adapter_factory)(id));
                entry.permissions = permissions;
                entry
            });
        Ok(())
    }

    /// Subscribes `session` to future updates of `id`, returning the
    /// current value so the caller can send an initial snapshot. Like
    /// `update`, lazily creates a default-permission entry on first touch --
    /// an owner is not required to have called `register` first, only to
    /// pass the ownership-bypass-or-grant check below.
    pub fn listen(
        &self,
        perms: &PermissionExtension,
        session: SessionId,
        app_id: &Identifier,
        id: &Identifier,
    ) -> Result<Option<Vec<u8>>, BusError> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let entry = entries.entry(id.key()).or_insert_with(|| Entry::new((self.adapter_factory)(id)));
        if !Self::allowed(perms, session, app_id, id, &entry.permissions.all, &entry.permissions.read) {
            return Err(BusError::PermissionDenied(format!("read access to {}", id)));
        }
        entry.listeners.insert(session);
        Ok(entry.value.clone())
    }

    /// Writes a new value, returning the set of sessions (besides the
    /// writer itself, who already knows the value) that must be notified.
    pub fn update(
        &self,
        perms: &PermissionExtension,
        session: SessionId,
        app_id: &Identifier,
        id: &Identifier,
        value: Vec<u8>,
    ) -> Result<Vec<SessionId>, BusError> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let entry = entries.entry(id.key()).or_insert_with(|| Entry::new((self.adapter_factory)(id)));
        if !Self::allowed(perms, session, app_id, id, &entry.permissions.all, &entry.permissions.write) {
            return Err(BusError::PermissionDenied(format!("write access to {}", id)));
        }
        entry.adapter.set_all(&[(VALUE_KEY.to_vec(), value.clone())])?;
        entry.adapter.store()?;
        entry.value = Some(value);
        Ok(entry.listeners.iter().copied().filter(|s| *s != session).collect())
    }

    pub fn get(
        &self,
        perms: &PermissionExtension,
        session: SessionId,
        app_id: &Identifier,
        id: &Identifier,
    ) -> Result<Option<Vec<u8>>, BusError> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let entry = entries.entry(id.key()).or_insert_with(|| Entry::new((self.adapter_factory)(id)));
        if !Self::allowed(perms, session, app_id, id, &entry.permissions.all, &entry.permissions.read) {
            return Err(BusError::PermissionDenied(format!("read access to {}", id)));
        }
        Ok(entry.value.clone())
    }

    /// Drops `session` from every entry's listener set. Called once a
    /// session disconnects so stale listener references don't pile up.
    pub fn remove_session(&self, session: SessionId) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        for entry in entries.values_mut() {
            entry.listeners.remove(&session);
        }
    }

    fn allowed(
        perms: &PermissionExtension,
        session: SessionId,
        app_id: &Identifier,
        id: &Identifier,
        all: &Option<Identifier>,
        specific: &Option<Identifier>,
    ) -> bool {
        id.is_subpart_of(app_id)
            || perms.satisfies(session, app_id, all)
            || perms.satisfies(session, app_id, specific)
    }
}
