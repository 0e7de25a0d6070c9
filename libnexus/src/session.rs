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

//! The session (C5): one authenticated client connection, from the
//! `connect`/`token`/`ready` handshake through to whichever registry and
//! table identifiers it has subscribed to.

use std::{
    collections::HashSet,
    net::TcpStream,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use nexus_protocol::error::BusError;
use nexus_protocol::identifier::{App, Identifier};
use nexus_protocol::packet::{ConnectPacket, DisconnectPacket, TYPE_CONNECT, TYPE_DISCONNECT, TYPE_READY, TYPE_TOKEN};
use tracing::{info, instrument};

use crate::connection::{Recv, SessionConnection};
use crate::mapper::PacketMapper;
use crate::security::Security;

/// A process-unique handle for a live session, used to key permission
/// grants and listener fan-out without holding a reference to the session
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

#[derive(Default)]
pub struct SessionIdGenerator(AtomicU64);

impl SessionIdGenerator {
    pub fn new() -> SessionIdGenerator {
        SessionIdGenerator::default()
    }

    pub fn next(&self) -> SessionId {
        SessionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct Session {
    pub id: SessionId,
    pub app: App,
    pub token: String,
    connection: SessionConnection,
    subscriptions: Mutex<HashSet<String>>,
}

impl Session {
    /// Runs the handshake sequence: reads the client's `connect` packet,
    /// authenticates it, and replies with `token` followed by `ready`.
    /// Any failure here is fatal to the connection -- there is no partially
    /// handshaken session.
    #[instrument(skip_all)]
    pub fn handshake(
        stream: TcpStream,
        id: SessionId,
        mapper: &PacketMapper,
        security: &Security,
    ) -> Result<(Session, Vec<Identifier>), BusError> {
        let connection = SessionConnection::new(stream)
            .map_err(|e| BusError::HandshakeFailed(format!("wrapping stream: {}", e)))?;

        let data = match connection.receive()? {
            Recv::Packet(data) => data,
            Recv::Closed => return Err(BusError::HandshakeFailed("peer closed before connecting".into())),
        };
        if data.type_name != TYPE_CONNECT {
            return Err(BusError::HandshakeFailed(format!(
                "expected {} as the first packet, got {}",
                TYPE_CONNECT, data.type_name
            )));
        }
        let connect: ConnectPacket = mapper
            .deserialize(&data)
            .map_err(|e| BusError::HandshakeFailed(format!("decoding connect packet: {}", e)))?;

        let (grants, token) = security.authenticate_app(&connect.app, connect.token.as_deref());

        let token_pkt = mapper
            .serialize(TYPE_TOKEN, &token)
            .map_err(|e| BusError::HandshakeFailed(format!("encoding token reply: {}", e)))?;
        connection.send(&token_pkt)?;

        let ready_pkt = mapper
            .serialize(TYPE_READY, &serde_json::Value::Null)
            .map_err(|e| BusError::HandshakeFailed(format!("encoding ready reply: {}", e)))?;
        connection.send(&ready_pkt)?;

        info!(app = %connect.app.id, "session handshake complete");

        let session = Session {
            id,
            app: connect.app,
            token,
            connection,
            subscriptions: Mutex::new(HashSet::new()),
        };
        Ok((session, grants))
    }

    pub fn receive(&self) -> Result<Recv, BusError> {
        self.connection.receive()
    }

    pub fn send(&self, data: &nexus_protocol::PacketData) -> Result<(), BusError> {
        self.connection.send(data)
    }

    pub fn send_value<T: serde::Serialize>(
        &self,
        mapper: &PacketMapper,
        type_name: &str,
        value: &T,
    ) -> Result<(), BusError> {
        let data = mapper.serialize(type_name, value)?;
        self.connection.send(&data)
    }

    pub fn close(&self, mapper: &PacketMapper, reason: &str) {
        if !self.connection.is_closed() {
            if let Ok(data) = mapper.serialize(TYPE_DISCONNECT, &DisconnectPacket { reason: reason.to_string() }) {
                let _ = self.connection.send(&data);
            }
        }
        self.connection.close();
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn subscribe(&self, id: &Identifier) {
        self.subscriptions.lock().expect("session lock poisoned").insert(id.key());
    }

    pub fn unsubscribe(&self, id: &Identifier) {
        self.subscriptions.lock().expect("session lock poisoned").remove(&id.key());
    }

    pub fn is_subscribed(&self, id: &Identifier) -> bool {
        self.subscriptions.lock().expect("session lock poisoned").contains(&id.key())
    }

    /// Builds a `Session` around an already-connected socket without running
    /// the handshake, for tests that only need a session handle to pass
    /// into extension/dispatcher calls.
    #[cfg(test)]
    pub(crate) fn for_test(id: SessionId, app: App, connection: SessionConnection) -> Session {
        Session { id, app, token: "test-token".to_string(), connection, subscriptions: Mutex::new(HashSet::new()) }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapper::register_builtin_types;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn handshake_round_trip() {
        let mut mapper = PacketMapper::new();
        register_builtin_types(&mut mapper).unwrap();
        let security = Security::new();

        let (client, server) = pair();
        let client_conn = SessionConnection::new(client).unwrap();

        let connect = ConnectPacket {
            app: App::new(Identifier::new("x", "svc"), "0.1"),
            token: None,
        };
        let data = mapper.serialize(TYPE_CONNECT, &connect).unwrap();

        let handle = thread::spawn(move || {
            client_conn.send(&data).unwrap();
            match client_conn.receive().unwrap() {
                Recv::Packet(p) => assert_eq!(p.type_name, TYPE_TOKEN),
                Recv::Closed => panic!("expected token packet"),
            }
            match client_conn.receive().unwrap() {
                Recv::Packet(p) => assert_eq!(p.type_name, TYPE_READY),
                Recv::Closed => panic!("expected ready packet"),
            }
        });

        let (session, grants) = Session::handshake(server, SessionId(0), &mapper, &security).unwrap();
        assert_eq!(session.app.id, Identifier::new("x", "svc"));
        assert!(grants.is_empty());
        handle.join().unwrap();
    }

    #[test]
    fn subscriptions_track_membership() {
        // subscription bookkeeping needs no live connection, so exercise it
        // through a session built from a throwaway socket pair.
        let (client, server) = pair();
        drop(client);
        let connection = SessionConnection::new(server).unwrap();
        let session = Session {
            id: SessionId(0),
            app: App::new(Identifier::new("x", "svc"), "0.1"),
            token: "t".to_string(),
            connection,
            subscriptions: Mutex::new(HashSet::new()),
        };
        let id = Identifier::new("x", "svc").join("feed");
        assert!(!session.is_subscribed(&id));
        session.subscribe(&id);
        assert!(session.is_subscribed(&id));
        session.unsubscribe(&id);
        assert!(!session.is_subscribed(&id));
    }
}
