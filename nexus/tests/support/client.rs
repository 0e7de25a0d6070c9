use std::net::TcpStream;

use anyhow::{anyhow, Context};
use nexus_protocol::{packet, App, Identifier, PacketData};
use serde::{de::DeserializeOwned, Serialize};

/// A minimal, synchronous client for the bus wire protocol, used to drive
/// handshake and extension packets directly in tests without depending on
/// any particular client SDK.
pub struct Client {
    conn: TcpStream,
    pub token: String,
}

impl Client {
    /// Connects, performs the `connect`/`token`/`ready` handshake, and
    /// returns a client ready to send extension packets. Passing `token`
    /// re-authenticates as an already-known app.
    pub fn connect(addr: &str, app_id: Identifier, version: &str, token: Option<String>) -> anyhow::Result<Client> {
        let conn = TcpStream::connect(addr).context("connecting to bus")?;
        let mut client = Client { conn, token: String::new() };

        client.send_json(packet::TYPE_CONNECT, &packet::ConnectPacket { app: App::new(app_id, version), token })?;

        let token_pkt = client.recv()?;
        if token_pkt.type_name != packet::TYPE_TOKEN {
            return Err(anyhow!("expected token packet, got {}", token_pkt.type_name));
        }
        client.token = serde_json::from_slice(&token_pkt.data).context("decoding token")?;

        let ready_pkt = client.recv()?;
        if ready_pkt.type_name != packet::TYPE_READY {
            return Err(anyhow!("expected ready packet, got {}", ready_pkt.type_name));
        }

        Ok(client)
    }

    pub fn send_json<T: Serialize>(&mut self, type_name: &str, payload: &T) -> anyhow::Result<()> {
        let data = serde_json::to_vec(payload).context("encoding payload")?;
        PacketData::new(type_name, data).write_to(&mut self.conn).context("writing frame")
    }

    pub fn recv(&mut self) -> anyhow::Result<PacketData> {
        PacketData::read_from(&mut self.conn)
            .context("reading frame")?
            .ok_or_else(|| anyhow!("connection closed before a frame arrived"))
    }

    pub fn recv_json<T: DeserializeOwned>(&mut self, expect_type: &str) -> anyhow::Result<T> {
        let pkt = self.recv()?;
        if pkt.type_name != expect_type {
            return Err(anyhow!("expected {}, got {}", expect_type, pkt.type_name));
        }
        serde_json::from_slice(&pkt.data).context("decoding payload")
    }

    /// True once the peer has closed the connection (used after a fatal
    /// error is expected to tear the session down).
    pub fn is_closed(&mut self) -> bool {
        matches!(PacketData::read_from(&mut self.conn), Ok(None) | Err(_))
    }
}
