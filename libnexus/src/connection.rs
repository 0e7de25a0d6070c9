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

//! The session connection (C4): one framed duplex stream. Thin on purpose —
//! all it knows about is reading and writing whole [`PacketData`] frames
//! and tracking whether the socket has been shut down on our side.

use std::{
    io,
    net::TcpStream,
    sync::Mutex,
};

use nexus_protocol::error::BusError;
use nexus_protocol::PacketData;
use tracing::instrument;

/// Sentinel returned by [`SessionConnection::receive`] when the peer closed
/// the socket cleanly rather than sending a malformed frame.
pub enum Recv {
    Packet(PacketData),
    Closed,
}

pub struct SessionConnection {
    read_half: Mutex<TcpStream>,
    write_half: Mutex<TcpStream>,
    closed: Mutex<bool>,
}

impl SessionConnection {
    pub fn new(stream: TcpStream) -> anyhow::Result<SessionConnection> {
        let write_half = stream.try_clone()?;
        Ok(SessionConnection {
            read_half: Mutex::new(stream),
            write_half: Mutex::new(write_half),
            closed: Mutex::new(false),
        })
    }

    /// Blocks until one full frame arrives, the peer closes, or the frame
    /// is malformed.
    #[instrument(skip_all)]
    pub fn receive(&self) -> Result<Recv, BusError> {
        let mut stream = self.read_half.lock().expect("connection lock poisoned");
        match PacketData::read_from(&mut *stream) {
            Ok(Some(data)) => Ok(Recv::Packet(data)),
            Ok(None) => Ok(Recv::Closed),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(Recv::Closed),
            Err(e) => Err(BusError::Protocol(format!("reading frame: {}", e))),
        }
    }

    /// Serializes and writes one frame. Fails with [`BusError::Closed`] if
    /// `close` was already called on this connection.
    #[instrument(skip_all, fields(type_name = %data.type_name))]
    pub fn send(&self, data: &PacketData) -> Result<(), BusError> {
        if *self.closed.lock().expect("connection lock poisoned") {
            return Err(BusError::Closed);
        }
        let mut stream = self.write_half.lock().expect("connection lock poisoned");
        data.write_to(&mut *stream).map_err(|e| BusError::Protocol(format!("writing frame: {}", e)))
    }

    /// Idempotent: calling this more than once, or from more than one
    /// thread, is fine.
    pub fn close(&self) {
        let mut closed = self.closed.lock().expect("connection lock poisoned");
        if *closed {
            return;
        }
        *closed = true;
        if let Ok(stream) = self.read_half.lock() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().expect("connection lock poisoned")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn send_then_receive() {
        let (client, server) = pair();
        let client_conn = SessionConnection::new(client).unwrap();
        let server_conn = SessionConnection::new(server).unwrap();

        let pkt = PacketData::new("connect", b"hello".to_vec());
        client_conn.send(&pkt).unwrap();

        match server_conn.receive().unwrap() {
            Recv::Packet(got) => assert_eq!(got, pkt),
            Recv::Closed => panic!("expected a packet"),
        }
    }

    #[test]
    fn close_then_send_fails() {
        let (client, _server) = pair();
        let conn = SessionConnection::new(client).unwrap();
        conn.close();
        let err = conn.send(&PacketData::new("connect", vec![])).unwrap_err();
        assert!(matches!(err, BusError::Closed));
    }

    #[test]
    fn peer_close_yields_closed_sentinel() {
        let (client, server) = pair();
        drop(client);
        let server_conn = SessionConnection::new(server).unwrap();
        match server_conn.receive().unwrap() {
            Recv::Closed => {}
            Recv::Packet(_) => panic!("expected Closed"),
        }
    }
}
