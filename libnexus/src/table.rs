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

//! The table extension (C10): a per-[`Identifier`] replicated, keyed store
//! with an insertion-ordered LRU cache, proxy-chain interception of
//! additions, and deferred persistence through a [`StorageAdapter`]. This is
//! the largest and most stateful subsystem in the bus -- everything here
//! runs with one [`CachedTable`]'s [`Mutex`] held across the body of
//! whichever handler is mutating it, the same per-entity locking discipline
//! [`crate::registry::RegistryExtension`] uses for its simpler single-value
//! entries.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    thread,
    time::Duration,
};

use nexus_protocol::error::BusError;
use nexus_protocol::identifier::Identifier;
use nexus_protocol::permission::TablePermissions;
use tracing::{error, warn};

use crate::permission::PermissionExtension;
use crate::session::SessionId;
use crate::storage::StorageAdapter;

pub type Item = (Vec<u8>, Vec<u8>);
pub type Items = Vec<Item>;

/// An insertion-ordered `bytes -> bytes` cache bounded by a configurable
/// size, matching the "cache is a prefix of the full ordered key sequence of
/// length <= cache_size" invariant. `None` leaves the cache unbounded; a
/// non-positive size disables caching outright.
struct Cache {
    order: VecDeque<Vec<u8>>,
    values: HashMap<Vec<u8>, Vec<u8>>,
    limit: Option<i64>,
}

impl Cache {
    fn new(limit: Option<i64>) -> Cache {
        Cache { order: VecDeque::new(), values: HashMap::new(), limit }
    }

    fn set_limit(&mut self, limit: Option<i64>) {
        self.limit = limit;
    }

    /// Inserts `items` in order, evicting the oldest entry whenever the
    /// cache exceeds a positive limit. A non-positive limit makes this a
    /// no-op; `None` leaves the cache free to grow without bound.
    fn update(&mut self, items: &[Item]) {
        if matches!(self.limit, Some(n) if n <= 0) {
            return;
        }
        for (k, v) in items {
            if self.values.insert(k.clone(), v.clone()).is_none() {
                self.order.push_back(k.clone());
            }
        }
        if let Some(n) = self.limit {
            let n = n.max(0) as usize;
            while self.order.len() > n {
                if let Some(oldest) = self.order.pop_front() {
                    self.values.remove(&oldest);
                }
            }
        }
    }

    fn remove(&mut self, keys: &[Vec<u8>]) {
        for k in keys {
            self.values.remove(k);
        }
        self.order.retain(|k| self.values.contains_key(k));
    }

    fn clear(&mut self) {
        self.order.clear();
        self.values.clear();
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.values.get(key).cloned()
    }

    fn snapshot(&self) -> Items {
        self.order.iter().filter_map(|k| self.values.get(k).map(|v| (k.clone(), v.clone()))).collect()
    }
}

/// State tracked for an in-flight `item_add` that must traverse the proxy
/// chain before it is persisted.
struct PendingAdd {
    items: Items,
    /// The proxy session that must echo back next; comparing against this
    /// on every response also protects against a session other than the one
    /// actually holding the baton trying to advance the chain.
    expected: SessionId,
}

/// The outcome of beginning (or continuing) an `item_add`: either the items
/// were persisted immediately (empty proxy chain / chain exhausted) or they
/// must be forwarded to the next proxy in line. The caller -- which has
/// access to the live session table, unlike this module -- is responsible
/// for actually writing `packet` to `to`'s connection.
pub enum AddOutcome {
    /// `cache` is the full cache snapshot *after* this add, for the
    /// `on_cache_update` fan-out every cache-mutating operation triggers.
    Persisted { listeners: Vec<SessionId>, items: Items, cache: Items },
    Forward { to: SessionId, proxy_id: u64, items: Items },
}

pub enum ProxyOutcome {
    Persisted { listeners: Vec<SessionId>, items: Items, cache: Items },
    Forward { to: SessionId, proxy_id: u64, items: Items },
}

/// One table's full replicated state.
pub struct CachedTable {
    id: Identifier,
    permissions: TablePermissions,
    cache: Cache,
    listeners: Vec<SessionId>,
    proxy_chain: Vec<SessionId>,
    pending_adds: HashMap<u64, PendingAdd>,
    next_proxy_id: u64,
    adapter: Arc<dyn StorageAdapter>,
    dirty: Arc<AtomicBool>,
    save_task: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
    save_interval: Duration,
}

impl CachedTable {
    fn new(id: Identifier, adapter: Arc<dyn StorageAdapter>, default_cache_size: Option<i64>, save_interval: Duration) -> CachedTable {
        CachedTable {
            id,
            permissions: TablePermissions::default(),
            cache: Cache::new(default_cache_size),
            listeners: Vec::new(),
            proxy_chain: Vec::new(),
            pending_adds: HashMap::new(),
            next_proxy_id: 0,
            adapter,
            dirty: Arc::new(AtomicBool::new(false)),
            save_task: Arc::new(Mutex::new(None)),
            save_interval,
        }
    }

    /// Sets the dirty flag and, if no save task is currently running,
    /// spawns one. The task clears the flag *before* calling
    /// `adapter.store()` so a mutation that lands mid-flush re-dirties the
    /// table and extends the loop rather than being silently dropped; see
    /// the module-level docs on the accepted durability window this admits.
    fn mark_changed(&self) {
        self.dirty.store(true, Ordering::Release);
        let mut task = self.save_task.lock().expect("save task lock poisoned");
        if task.is_some() {
            return;
        }
        let dirty = Arc::clone(&self.dirty);
        let adapter = Arc::clone(&self.adapter);
        let save_task = Arc::clone(&self.save_task);
        let interval = self.save_interval;
        let id = self.id.clone();
        *task = Some(thread::spawn(move || {
            loop {
                if !dirty.swap(false, Ordering::AcqRel) {
                    break;
                }
                if let Err(e) = adapter.store() {
                    error!(table = %id, "deferred save failed: {}", e);
                }
                thread::sleep(interval);
                if !dirty.load(Ordering::Acquire) {
                    break;
                }
            }
            // Clear the slot as our last action so a later mark_changed can
            // spawn a fresh task; we only ever exit once dirty is false, so
            // there is no pending write this drops on the floor.
            *save_task.lock().expect("save task lock poisoned") = None;
        }));
    }
}

/// Returned permission set used by the `allowed` gate below, mirroring
/// [`crate::registry::RegistryExtension`]'s helper.
fn allowed(
    perms: &PermissionExtension,
    session: SessionId,
    app_id: &Identifier,
    id: &Identifier,
    all: &Option<Identifier>,
    specific: &Option<Identifier>,
) -> bool {
    id.is_subpart_of(app_id) || perms.satisfies(session, app_id, all) || perms.satisfies(session, app_id, specific)
}

/// Per-server collection of every live [`CachedTable`], keyed by
/// [`Identifier::key`].
pub struct TableExtension {
    tables: RwLock<HashMap<String, Arc<Mutex<CachedTable>>>>,
    adapter_factory: Box<dyn Fn(&Identifier) -> Arc<dyn StorageAdapter> + Send + Sync>,
    default_cache_size: Option<i64>,
    save_interval: Duration,
}

impl TableExtension {
    pub fn new(
        adapter_factory: Box<dyn Fn(&Identifier) -> Arc<dyn StorageAdapter> + Send + Sync>,
        default_cache_size: Option<i64>,
        save_interval: Duration,
    ) -> TableExtension {
        TableExtension {
            tables: RwLock::new(HashMap::new()),
            adapter_factory,
            default_cache_size,
            save_interval,
        }
    }

    fn entry(&self, id: &Identifier) -> Arc<Mutex<CachedTable>> {
        if let Some(existing) = self.tables.read().expect("table map lock poisoned").get(&id.key()) {
            return Arc::clone(existing);
        }
        let mut tables = self.tables.write().expect("table map lock poisoned");
        Arc::clone(tables.entry(id.key()).or_insert_with(|| {
            let adapter = (self.adapter_factory)(id);
            Arc::new(Mutex::new(CachedTable::new(id.clone(), adapter, self.default_cache_size, self.save_interval)))
        }))
    }

    /// Only the owning app may set a table's permissions, mirroring
    /// [`crate::registry::RegistryExtension::register`].
    pub fn set_permission(&self, app_id: &Identifier, id: &Identifier, permissions: TablePermissions) -> Result<(), BusError> {
        if !id.is_subpart_of(app_id) {
            return Err(BusError::PermissionDenied(format!("{} may not configure {}, which it does not own", app_id, id)));
        }
        let table = self.entry(id);
        let mut table = table.lock().expect("table lock poisoned");
        table.permissions = permissions;
        Ok(())
    }

    /// `cache_size` reductions aren't applied retroactively: the cache is
    /// only trimmed the next time an insertion runs `Cache::update`, per the
    /// "truncates on next insertion" lifecycle note.
    pub fn set_config(&self, app_id: &Identifier, id: &Identifier, cache_size: Option<i64>) -> Result<(), BusError> {
        if !id.is_subpart_of(app_id) {
            return Err(BusError::PermissionDenied(format!("{} may not configure {}, which it does not own", app_id, id)));
        }
        let table = self.entry(id);
        let mut table = table.lock().expect("table lock poisoned");
        table.cache.set_limit(cache_size);
        Ok(())
    }

    pub fn listen(&self, perms: &PermissionExtension, session: SessionId, app_id: &Identifier, id: &Identifier) -> Result<Items, BusError> {
        let table = self.entry(id);
        let mut table = table.lock().expect("table lock poisoned");
        if !allowed(perms, session, app_id, id, &table.permissions.all.clone(), &table.permissions.read.clone()) {
            return Err(BusError::PermissionDenied(format!("read access to {}", id)));
        }
        if !table.listeners.contains(&session) {
            table.listeners.push(session);
        }
        Ok(table.cache.snapshot())
    }

    pub fn proxy_listen(&self, perms: &PermissionExtension, session: SessionId, app_id: &Identifier, id: &Identifier) -> Result<(), BusError> {
        let table = self.entry(id);
        let mut table = table.lock().expect("table lock poisoned");
        if !allowed(perms, session, app_id, id, &table.permissions.all.clone(), &table.permissions.proxy.clone()) {
            return Err(BusError::PermissionDenied(format!("proxy access to {}", id)));
        }
        if !table.proxy_chain.contains(&session) {
            table.proxy_chain.push(session);
        }
        Ok(())
    }

    /// Begins an `item_add`. If the proxy chain is empty the items are
    /// persisted and cached immediately; otherwise the first proxy in the
    /// chain must transform and echo them back through
    /// [`Self::continue_add`].
    pub fn item_add(
        &self,
        perms: &PermissionExtension,
        session: SessionId,
        app_id: &Identifier,
        id: &Identifier,
        items: Items,
    ) -> Result<AddOutcome, BusError> {
        let table = self.entry(id);
        let mut table = table.lock().expect("table lock poisoned");
        if !allowed(perms, session, app_id, id, &table.permissions.all.clone(), &table.permissions.write.clone()) {
            return Err(BusError::PermissionDenied(format!("write access to {}", id)));
        }

        if table.proxy_chain.is_empty() {
            return Self::persist_add(&mut table, items);
        }

        let proxy_id = table.next_proxy_id;
        table.next_proxy_id += 1;
        let first = table.proxy_chain[0];
        table.pending_adds.insert(proxy_id, PendingAdd { items: items.clone(), expected: first });
        Ok(AddOutcome::Forward { to: first, proxy_id, items })
    }

    /// Advances a proxy chain with the transformed items `echoing_session`
    /// sent back. Keys the proxy omitted are dropped silently; it may not
    /// introduce new ones (any key absent from the original pending set is
    /// filtered out).
    pub fn continue_add(&self, id: &Identifier, echoing_session: SessionId, proxy_id: u64, items: Items) -> Result<ProxyOutcome, BusError> {
        let table = self.entry(id);
        let mut table = table.lock().expect("table lock poisoned");

        let pending = table
            .pending_adds
            .get(&proxy_id)
            .ok_or_else(|| BusError::Internal(format!("no pending proxy chain {} for {}", proxy_id, id)))?;
        if pending.expected != echoing_session {
            return Err(BusError::PermissionDenied(format!("session is not the expected proxy for chain {}", proxy_id)));
        }

        let original_keys: std::collections::HashSet<Vec<u8>> = pending.items.iter().map(|(k, _)| k.clone()).collect();
        let items: Items = items.into_iter().filter(|(k, _)| original_keys.contains(k)).collect();

        let position = table.proxy_chain.iter().position(|s| *s == echoing_session);
        let next = position.and_then(|idx| table.proxy_chain.get(idx + 1).copied());

        match next {
            Some(next_session) => {
                table.pending_adds.insert(proxy_id, PendingAdd { items: items.clone(), expected: next_session });
                Ok(ProxyOutcome::Forward { to: next_session, proxy_id, items })
            }
            None => {
                table.pending_adds.remove(&proxy_id);
                match Self::persist_add(&mut table, items)? {
                    AddOutcome::Persisted { listeners, items, cache } => Ok(ProxyOutcome::Persisted { listeners, items, cache }),
                    AddOutcome::Forward { .. } => unreachable!("persist_add never forwards"),
                }
            }
        }
    }

    fn persist_add(table: &mut CachedTable, items: Items) -> Result<AddOutcome, BusError> {
        table.adapter.set_all(&items)?;
        table.cache.update(&items);
        table.mark_changed();
        Ok(AddOutcome::Persisted { listeners: table.listeners.clone(), items, cache: table.cache.snapshot() })
    }

    /// Returns the listener set and the full cache snapshot *after* the
    /// update, for the `on_cache_update` fan-out alongside `on_update`.
    pub fn item_update(&self, perms: &PermissionExtension, session: SessionId, app_id: &Identifier, id: &Identifier, items: Items) -> Result<(Vec<SessionId>, Items), BusError> {
        let table = self.entry(id);
        let mut table = table.lock().expect("table lock poisoned");
        if !allowed(perms, session, app_id, id, &table.permissions.all.clone(), &table.permissions.write.clone()) {
            return Err(BusError::PermissionDenied(format!("write access to {}", id)));
        }
        table.adapter.set_all(&items)?;
        table.cache.update(&items);
        table.mark_changed();
        Ok((table.listeners.clone(), table.cache.snapshot()))
    }

    /// Removes `keys`, returning the listener set, the pre-removal values
    /// (read back from the adapter, so the caller can fire `on_remove` with
    /// the actual removed items), and the cache snapshot after removal.
    pub fn item_remove(&self, perms: &PermissionExtension, session: SessionId, app_id: &Identifier, id: &Identifier, keys: Vec<Vec<u8>>) -> Result<(Vec<SessionId>, Items, Items), BusError> {
        let table = self.entry(id);
        let mut table = table.lock().expect("table lock poisoned");
        if !allowed(perms, session, app_id, id, &table.permissions.all.clone(), &table.permissions.remove.clone()) {
            return Err(BusError::PermissionDenied(format!("remove access to {}", id)));
        }
        let removed = table.adapter.get_all(&keys)?;
        table.adapter.remove_all(&keys)?;
        table.cache.remove(&keys);
        table.mark_changed();
        Ok((table.listeners.clone(), removed, table.cache.snapshot()))
    }

    pub fn clear(&self, perms: &PermissionExtension, session: SessionId, app_id: &Identifier, id: &Identifier) -> Result<(Vec<SessionId>, Items), BusError> {
        let table = self.entry(id);
        let mut table = table.lock().expect("table lock poisoned");
        if !allowed(perms, session, app_id, id, &table.permissions.all.clone(), &table.permissions.remove.clone()) {
            return Err(BusError::PermissionDenied(format!("remove access to {}", id)));
        }
        table.adapter.clear()?;
        table.cache.clear();
        table.mark_changed();
        Ok((table.listeners.clone(), table.cache.snapshot()))
    }

    /// Union of cache hits and adapter-fetched misses; the adapter-fetched
    /// subset is folded back into the cache before returning.
    pub fn get(&self, perms: &PermissionExtension, session: SessionId, app_id: &Identifier, id: &Identifier, keys: &[Vec<u8>]) -> Result<Items, BusError> {
        let table = self.entry(id);
        let mut table = table.lock().expect("table lock poisoned");
        if !allowed(perms, session, app_id, id, &table.permissions.all.clone(), &table.permissions.read.clone()) {
            return Err(BusError::PermissionDenied(format!("read access to {}", id)));
        }

        let mut hits = Vec::new();
        let mut misses = Vec::new();
        for key in keys {
            match table.cache.get(key) {
                Some(v) => hits.push((key.clone(), v)),
                None => misses.push(key.clone()),
            }
        }
        if !misses.is_empty() {
            let fetched = table.adapter.get_all(&misses)?;
            table.cache.update(&fetched);
            hits.extend(fetched);
        }
        Ok(hits)
    }

    pub fn fetch(&self, perms: &PermissionExtension, session: SessionId, app_id: &Identifier, id: &Identifier, before: u32, after: u32, cursor: Option<&[u8]>) -> Result<Items, BusError> {
        let table = self.entry(id);
        let table = table.lock().expect("table lock poisoned");
        if !allowed(perms, session, app_id, id, &table.permissions.all.clone(), &table.permissions.read.clone()) {
            return Err(BusError::PermissionDenied(format!("read access to {}", id)));
        }
        table.adapter.fetch_items(before, after, cursor)
    }

    pub fn fetch_all(&self, perms: &PermissionExtension, session: SessionId, app_id: &Identifier, id: &Identifier) -> Result<Items, BusError> {
        let table = self.entry(id);
        let table = table.lock().expect("table lock poisoned");
        if !allowed(perms, session, app_id, id, &table.permissions.all.clone(), &table.permissions.read.clone()) {
            return Err(BusError::PermissionDenied(format!("read access to {}", id)));
        }
        table.adapter.fetch_all()
    }

    pub fn size(&self, perms: &PermissionExtension, session: SessionId, app_id: &Identifier, id: &Identifier) -> Result<u64, BusError> {
        let table = self.entry(id);
        let table = table.lock().expect("table lock poisoned");
        if !allowed(perms, session, app_id, id, &table.permissions.all.clone(), &table.permissions.read.clone()) {
            return Err(BusError::PermissionDenied(format!("read access to {}", id)));
        }
        table.adapter.size()
    }

    /// Detaches `session` from every table: listeners, the proxy chain, and
    /// any in-flight proxy hand-off it was holding the baton for (which is
    /// abandoned -- not persisted, `on_add` does not fire -- per the
    /// accepted lossy-on-disconnect behavior).
    pub fn remove_session(&self, session: SessionId) {
        let tables = self.tables.read().expect("table map lock poisoned");
        for table in tables.values() {
            let mut table = table.lock().expect("table lock poisoned");
            table.listeners.retain(|s| *s != session);
            table.proxy_chain.retain(|s| *s != session);
            let abandoned: Vec<u64> =
                table.pending_adds.iter().filter(|(_, p)| p.expected == session).map(|(id, _)| *id).collect();
            for proxy_id in abandoned {
                warn!(proxy_id, "abandoning in-flight proxy chain: proxy session disconnected");
                table.pending_adds.remove(&proxy_id);
            }
        }
    }
}
