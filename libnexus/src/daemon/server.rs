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

//! The server shell (C11): owns the listener, the root state every
//! extension is constructed with, and the packet dispatcher's handler
//! wiring. An `Arc<Server>` is cloned into one spawned thread per
//! accepted connection.

use std::{
    collections::HashMap,
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use nexus_protocol::error::BusError;
use nexus_protocol::identifier::Identifier;
use nexus_protocol::packet::*;
use nexus_protocol::permission::{PermissionLevel, PermissionType};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::connection::Recv;
use crate::consts;
use crate::dispatcher::PacketDispatcher;
use crate::mapper::{register_builtin_types, PacketMapper};
use crate::permission::PermissionExtension;
use crate::registry::RegistryExtension;
use crate::security::Security;
use crate::session::{Session, SessionId, SessionIdGenerator};
use crate::storage::{FileBackedAdapter, StorageAdapter};
use crate::table::{AddOutcome, ProxyOutcome, TableExtension};
use crate::config;

/// Every piece of process-wide state a connection handler reaches into,
/// plus the dispatcher built once at startup around `Arc` clones of it.
/// Matches the "root `Server`/`Context` struct" design note: no global
/// mutable state, every component gets what it needs passed in at
/// construction.
pub struct Server {
    config: config::Manager,
    mapper: Arc<PacketMapper>,
    dispatcher: PacketDispatcher,
    security: Arc<Security>,
    permissions: Arc<PermissionExtension>,
    registry: Arc<RegistryExtension>,
    tables: Arc<TableExtension>,
    sessions: Arc<Mutex<HashMap<SessionId, Arc<Session>>>>,
    id_gen: SessionIdGenerator,
}

type SessionMap = Mutex<HashMap<SessionId, Arc<Session>>>;

impl Server {
    #[instrument(skip_all)]
    pub fn new(config: config::Manager) -> anyhow::Result<Arc<Server>> {
        let cfg = config.get();

        let mut mapper = PacketMapper::new();
        register_builtin_types(&mut mapper)?;
        let mapper = Arc::new(mapper);

        let security = Arc::new(Security::new());

        let permissions = Arc::new(PermissionExtension::new());
        for declared in &cfg.permission {
            let id = declared.identifier()?;
            let level = match declared.level.as_str() {
                "medium" => PermissionLevel::Medium,
                "high" => PermissionLevel::High,
                _ => PermissionLevel::Low,
            };
            permissions.declare(PermissionType { id, level, name: declared.name.clone(), note: declared.note.clone() });
        }

        let storage_root = cfg.storage_dir.clone().map(PathBuf::from);

        let registry_root = storage_root.clone();
        let registry = Arc::new(RegistryExtension::new(Box::new(move |id: &Identifier| {
            adapter_for(registry_root.as_deref(), "registry", id)
        })));

        let table_root = storage_root.clone();
        let save_interval =
            cfg.save_task_interval_secs.map(Duration::from_secs).unwrap_or(consts::SAVE_TASK_INTERVAL);
        let tables = Arc::new(TableExtension::new(
            Box::new(move |id: &Identifier| adapter_for(table_root.as_deref(), "table", id)),
            cfg.default_table_cache_size,
            save_interval,
        ));

        let sessions: Arc<SessionMap> = Arc::new(Mutex::new(HashMap::new()));
        let id_gen = SessionIdGenerator::new();

        let dispatcher = build_dispatcher(&mapper, &permissions, &registry, &tables, &sessions);

        Ok(Arc::new(Server { config, mapper, dispatcher, security, permissions, registry, tables, sessions, id_gen }))
    }

    /// The address to bind, from config if set, falling back to
    /// [`consts::DEFAULT_BIND_ADDR`]. Read once at bind time; a later
    /// config hot-reload does not rebind an already-listening socket.
    pub fn bind_addr(&self) -> String {
        self.config.get().bind.unwrap_or_else(|| consts::DEFAULT_BIND_ADDR.to_string())
    }

    /// Runs the accept loop: one OS thread per accepted connection, each
    /// running that session's full lifecycle to completion.
    #[instrument(skip_all)]
    pub fn serve(server: Arc<Server>, listener: TcpListener) -> anyhow::Result<()> {
        let mut conn_counter: u64 = 0;
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    conn_counter += 1;
                    let conn_id = conn_counter;
                    let server = Arc::clone(&server);
                    thread::spawn(move || server.handle_conn(stream, conn_id));
                }
                Err(err) => error!("accepting connection: {:?}", err),
            }
        }
        Ok(())
    }

    /// Runs one connection end to end: handshake, receive loop, cleanup.
    /// Never returns an error -- a failure at any stage is logged and the
    /// thread simply exits without affecting any other connection.
    #[instrument(skip_all, fields(cid = conn_id))]
    fn handle_conn(&self, stream: TcpStream, conn_id: u64) {
        let id = self.id_gen.next();
        let (session, grants) = match Session::handshake(stream, id, &self.mapper, &self.security) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("handshake failed: {}", e);
                return;
            }
        };
        self.permissions.set_grants(session.id, grants);

        let session = Arc::new(session);
        self.sessions.lock().expect("session map lock poisoned").insert(session.id, Arc::clone(&session));
        info!(app = %session.app.id, "session established");

        loop {
            match session.receive() {
                Ok(Recv::Packet(data)) => {
                    if let Err(e) = self.dispatcher.dispatch(&session, data) {
                        if e.is_fatal_to_session() {
                            let reason = e.disconnect_reason().unwrap_or_else(|| e.to_string());
                            session.close(&self.mapper, &reason);
                            break;
                        }
                        warn!("packet handling failed: {}", e);
                    }
                }
                Ok(Recv::Closed) => break,
                Err(e) => {
                    warn!("receive failed: {}", e);
                    break;
                }
            }
        }

        self.registry.remove_session(session.id);
        self.tables.remove_session(session.id);
        self.permissions.clear_session(session.id);
        self.sessions.lock().expect("session map lock poisoned").remove(&session.id);
        info!(app = %session.app.id, "session closed");
    }
}

/// Opens (or falls back to an in-memory) storage adapter for one
/// identifier. `root` is `None` when no `storage_dir` is configured, in
/// which case persistence is deliberately in-memory-only for the life of
/// the process.
fn adapter_for(root: Option<&Path>, kind: &str, id: &Identifier) -> Arc<dyn StorageAdapter> {
    let Some(root) = root else { return Arc::new(FileBackedAdapter::in_memory()) };
    let file_name = format!("{}-{}.json", kind, sanitize_for_filename(&id.key()));
    match FileBackedAdapter::new(Some(root.join(file_name))) {
        Ok(adapter) => Arc::new(adapter),
        Err(e) => {
            error!(%id, "opening storage adapter, falling back to in-memory: {}", e);
            Arc::new(FileBackedAdapter::in_memory())
        }
    }
}

fn sanitize_for_filename(key: &str) -> String {
    key.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect()
}

fn send_to<T: Serialize + 'static>(sessions: &SessionMap, mapper: &PacketMapper, target: SessionId, type_name: &str, value: &T) {
    let target_session = sessions.lock().expect("session map lock poisoned").get(&target).cloned();
    let Some(target_session) = target_session else { return };
    if let Err(e) = target_session.send_value(mapper, type_name, value) {
        warn!(type_name, "failed to deliver packet to session: {}", e);
    }
}

fn fan_out<T: Serialize + 'static>(sessions: &SessionMap, mapper: &PacketMapper, targets: &[SessionId], type_name: &str, value: &T) {
    for target in targets {
        send_to(sessions, mapper, *target, type_name, value);
    }
}

/// Wires every built-in packet type to its handler. Built once at startup
/// around `Arc` clones of the extensions; never mutated again, so
/// [`PacketDispatcher::dispatch`] needs no locking to look a handler up.
fn build_dispatcher(
    mapper: &Arc<PacketMapper>,
    permissions: &Arc<PermissionExtension>,
    registry: &Arc<RegistryExtension>,
    tables: &Arc<TableExtension>,
    sessions: &Arc<SessionMap>,
) -> PacketDispatcher {
    let mut dispatcher = PacketDispatcher::new();

    macro_rules! handler {
        ($type_name:expr, |$mapper:ident, $permissions:ident, $registry:ident, $tables:ident, $sessions:ident, $session:ident, $data:ident| $body:block) => {{
            let $mapper = Arc::clone(mapper);
            let $permissions = Arc::clone(permissions);
            let $registry = Arc::clone(registry);
            let $tables = Arc::clone(tables);
            let $sessions = Arc::clone(sessions);
            dispatcher.add_handler(
                $type_name,
                Box::new(move |$session: &Session, $data: nexus_protocol::PacketData| -> Result<(), BusError> { $body }),
            );
        }};
    }

    handler!("table.set_permission", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&permissions, &registry, &sessions);
        let pkt: TableSetPermissionPacket = mapper.deserialize(&data)?;
        tables.set_permission(&session.app.id, &pkt.id, pkt.permissions)
    });

    handler!("table.set_config", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&permissions, &registry, &sessions);
        let pkt: TableSetConfigPacket = mapper.deserialize(&data)?;
        tables.set_config(&session.app.id, &pkt.id, pkt.cache_size)
    });

    handler!("table.listen", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&registry, &sessions);
        let pkt: TableListenPacket = mapper.deserialize(&data)?;
        let cache = tables.listen(&permissions, session.id, &session.app.id, &pkt.id)?;
        session.send_value(&mapper, "table.cache_update", &TableItemsPacket { id: pkt.id, items: cache })
    });

    handler!("table.proxy_listen", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&registry, &sessions);
        let pkt: TableProxyListenPacket = mapper.deserialize(&data)?;
        tables.proxy_listen(&permissions, session.id, &session.app.id, &pkt.id)
    });

    handler!("table.proxy", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&permissions, &registry);
        let pkt: TableProxyPacket = mapper.deserialize(&data)?;
        match tables.continue_add(&pkt.id, session.id, pkt.key, pkt.items)? {
            ProxyOutcome::Forward { to, proxy_id, items } => {
                send_to(&sessions, &mapper, to, "table.proxy", &TableProxyPacket { id: pkt.id, key: proxy_id, items });
            }
            ProxyOutcome::Persisted { listeners, items, cache } => {
                fan_out(&sessions, &mapper, &listeners, "table.item_add", &TableItemsPacket { id: pkt.id.clone(), items });
                fan_out(&sessions, &mapper, &listeners, "table.cache_update", &TableItemsPacket { id: pkt.id, items: cache });
            }
        }
        Ok(())
    });

    handler!("table.item_add", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = &registry;
        let pkt: TableItemsPacket = mapper.deserialize(&data)?;
        match tables.item_add(&permissions, session.id, &session.app.id, &pkt.id, pkt.items)? {
            AddOutcome::Persisted { listeners, items, cache } => {
                fan_out(&sessions, &mapper, &listeners, "table.item_add", &TableItemsPacket { id: pkt.id.clone(), items });
                fan_out(&sessions, &mapper, &listeners, "table.cache_update", &TableItemsPacket { id: pkt.id, items: cache });
            }
            AddOutcome::Forward { to, proxy_id, items } => {
                send_to(&sessions, &mapper, to, "table.proxy", &TableProxyPacket { id: pkt.id, key: proxy_id, items });
            }
        }
        Ok(())
    });

    handler!("table.item_update", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = &registry;
        let pkt: TableItemsPacket = mapper.deserialize(&data)?;
        let (listeners, cache) = tables.item_update(&permissions, session.id, &session.app.id, &pkt.id, pkt.items.clone())?;
        fan_out(&sessions, &mapper, &listeners, "table.item_update", &TableItemsPacket { id: pkt.id.clone(), items: pkt.items });
        fan_out(&sessions, &mapper, &listeners, "table.cache_update", &TableItemsPacket { id: pkt.id, items: cache });
        Ok(())
    });

    handler!("table.item_remove", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = &registry;
        let pkt: TableItemRemovePacket = mapper.deserialize(&data)?;
        let (listeners, _removed, cache) =
            tables.item_remove(&permissions, session.id, &session.app.id, &pkt.id, pkt.keys.clone())?;
        fan_out(&sessions, &mapper, &listeners, "table.item_remove", &TableItemRemovePacket { id: pkt.id.clone(), keys: pkt.keys });
        fan_out(&sessions, &mapper, &listeners, "table.cache_update", &TableItemsPacket { id: pkt.id, items: cache });
        Ok(())
    });

    handler!("table.clear", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = &registry;
        let pkt: TableClearPacket = mapper.deserialize(&data)?;
        let (listeners, cache) = tables.clear(&permissions, session.id, &session.app.id, &pkt.id)?;
        fan_out(&sessions, &mapper, &listeners, "table.clear", &TableClearPacket { id: pkt.id.clone() });
        fan_out(&sessions, &mapper, &listeners, "table.cache_update", &TableItemsPacket { id: pkt.id, items: cache });
        Ok(())
    });

    handler!("table.item_get.request", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&registry, &sessions);
        let pkt: TableItemGetRequest = mapper.deserialize(&data)?;
        let items = tables.get(&permissions, session.id, &session.app.id, &pkt.id, &pkt.keys)?;
        session.send_value(&mapper, "table.item_get.response", &TableItemGetResponse { items })
    });

    handler!("table.fetch.request", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&registry, &sessions);
        let pkt: TableFetchRequest = mapper.deserialize(&data)?;
        let items =
            tables.fetch(&permissions, session.id, &session.app.id, &pkt.id, pkt.before, pkt.after, pkt.cursor.as_deref())?;
        session.send_value(&mapper, "table.fetch.response", &TableFetchResponse { items })
    });

    handler!("table.fetch_all.request", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&registry, &sessions);
        let pkt: TableFetchAllRequest = mapper.deserialize(&data)?;
        let items = tables.fetch_all(&permissions, session.id, &session.app.id, &pkt.id)?;
        session.send_value(&mapper, "table.fetch_all.response", &TableFetchAllResponse { items })
    });

    handler!("table.size.request", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&registry, &sessions);
        let pkt: TableSizeRequest = mapper.deserialize(&data)?;
        let size = tables.size(&permissions, session.id, &session.app.id, &pkt.id)?;
        session.send_value(&mapper, "table.size.response", &TableSizeResponse { size })
    });

    handler!("registry.register", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&permissions, &tables, &sessions);
        let pkt: RegistryRegisterPacket = mapper.deserialize(&data)?;
        registry.register(&pkt.id, &session.app.id, pkt.permissions)
    });

    handler!("registry.listen", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&tables, &sessions);
        let pkt: RegistryListenPacket = mapper.deserialize(&data)?;
        let value = registry.listen(&permissions, session.id, &session.app.id, &pkt.id)?;
        session.send_value(&mapper, "registry.get.response", &RegistryGetResponse { value })
    });

    handler!("registry.update", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = &tables;
        let pkt: RegistryUpdatePacket = mapper.deserialize(&data)?;
        let listeners = registry.update(&permissions, session.id, &session.app.id, &pkt.id, pkt.value.clone())?;
        fan_out(&sessions, &mapper, &listeners, "registry.update", &RegistryUpdatePacket { id: pkt.id, value: pkt.value });
        Ok(())
    });

    handler!("registry.get.request", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&tables, &sessions);
        let pkt: RegistryGetRequest = mapper.deserialize(&data)?;
        let value = registry.get(&permissions, session.id, &session.app.id, &pkt.id)?;
        session.send_value(&mapper, "registry.get.response", &RegistryGetResponse { value })
    });

    handler!("permission.list.request", |mapper, permissions, registry, tables, sessions, session, data| {
        let _ = (&registry, &tables, &sessions, &data);
        let declared = permissions.declared();
        session.send_value(&mapper, "permission.list.response", &PermissionListResponse { permissions: declared })
    });

    dispatcher
}
