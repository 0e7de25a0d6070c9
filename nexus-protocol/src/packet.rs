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

//! Payload schemas for every packet type the core server understands:
//! the four handshake control packets (empty namespace) plus the
//! `table` and `registry` extension packets.
//!
//! Every payload here round-trips through JSON. Byte-valued keys/values
//! (table items, registry values) are carried as plain `Vec<u8>` — serde_json
//! encodes those as JSON arrays of small integers, which is wasteful but
//! keeps the payload schemas uniform and avoids inventing a second wire
//! encoding just for table data.

use serde_derive::{Deserialize, Serialize};

use crate::identifier::{App, Identifier};
use crate::permission::{RegistryPermissions, TablePermissions};

/// A single ordered key/value pair, as carried in table add/update/fetch
/// payloads. A `Vec` of these (rather than a map) preserves insertion order
/// on the wire without requiring string-keyed JSON maps for what the core
/// spec treats as raw byte keys.
pub type ItemList = Vec<(Vec<u8>, Vec<u8>)>;

// ---- built-in, empty-namespace packets -------------------------------

pub const TYPE_CONNECT: &str = "connect";
pub const TYPE_TOKEN: &str = "token";
pub const TYPE_READY: &str = "ready";
pub const TYPE_DISCONNECT: &str = "disconnect";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPacket {
    pub app: App,
    #[serde(default)]
    pub token: Option<String>,
}

/// `token` and `ready` are bare JSON values (a string, and `null`
/// respectively) rather than wrapper structs, so callers encode/decode them
/// directly with `serde_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectPacket {
    pub reason: String,
}

// ---- table extension packets (namespace "table") ---------------------

pub const TABLE_NAMESPACE: &str = "table";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSetPermissionPacket {
    pub id: Identifier,
    pub permissions: TablePermissions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSetConfigPacket {
    pub id: Identifier,
    /// `None` leaves caching unbounded; `Some(n)` with `n <= 0` disables
    /// caching entirely; `Some(n)` with `n > 0` bounds the cache to `n`
    /// entries.
    #[serde(default)]
    pub cache_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableListenPacket {
    pub id: Identifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableProxyListenPacket {
    pub id: Identifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableProxyPacket {
    pub id: Identifier,
    /// Monotonically increasing per-table chain identifier, echoed back
    /// unchanged by the proxy that handled it.
    pub key: u64,
    pub items: ItemList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableItemsPacket {
    pub id: Identifier,
    pub items: ItemList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableItemRemovePacket {
    pub id: Identifier,
    pub keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableClearPacket {
    pub id: Identifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableItemGetRequest {
    pub id: Identifier,
    pub keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableItemGetResponse {
    pub items: ItemList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFetchRequest {
    pub id: Identifier,
    #[serde(default)]
    pub before: u32,
    #[serde(default)]
    pub after: u32,
    #[serde(default)]
    pub cursor: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFetchResponse {
    pub items: ItemList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFetchAllRequest {
    pub id: Identifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFetchAllResponse {
    pub items: ItemList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSizeRequest {
    pub id: Identifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSizeResponse {
    pub size: u64,
}

// ---- registry extension packets (namespace "registry") ---------------

pub const REGISTRY_NAMESPACE: &str = "registry";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryRegisterPacket {
    pub id: Identifier,
    pub permissions: RegistryPermissions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryListenPacket {
    pub id: Identifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryUpdatePacket {
    pub id: Identifier,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryGetRequest {
    pub id: Identifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryGetResponse {
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

// ---- permission catalog (namespace "permission") ----------------------

pub const PERMISSION_NAMESPACE: &str = "permission";

/// Asks the server for every [`crate::permission::PermissionType`] it has
/// declared, so a client can render a consent UI before requesting grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionListRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionListResponse {
    pub permissions: Vec<crate::permission::PermissionType>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identifier::Identifier;

    #[test]
    fn connect_packet_round_trips_through_json() {
        let pkt = ConnectPacket {
            app: App::new(Identifier::new("cc.omuchat", "chat"), "0.1.0"),
            token: Some("tok".to_string()),
        };
        let bytes = serde_json::to_vec(&pkt).unwrap();
        let back: ConnectPacket = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.app.id, pkt.app.id);
        assert_eq!(back.token, pkt.token);
    }

    #[test]
    fn table_items_packet_preserves_order() {
        let pkt = TableItemsPacket {
            id: Identifier::new("x", "svc").join("data"),
            items: vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())],
        };
        let bytes = serde_json::to_vec(&pkt).unwrap();
        let back: TableItemsPacket = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.items, pkt.items);
    }
}
