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

//! The packet mapper (C3): a registry from `type_name` to a pair of
//! serialize/deserialize function pointers, stored behind an opaque tag so
//! the dispatcher can recover a concrete payload type at each handler's
//! boundary without any runtime reflection.

use std::collections::HashMap;

use nexus_protocol::error::BusError;
use nexus_protocol::PacketData;
use serde::de::DeserializeOwned;
use serde::Serialize;

type SerializeFn = Box<dyn Fn(&dyn std::any::Any) -> anyhow::Result<Vec<u8>> + Send + Sync>;
type DeserializeFn = Box<dyn Fn(&[u8]) -> anyhow::Result<Box<dyn std::any::Any + Send>> + Send + Sync>;

struct RegisteredType {
    serialize: SerializeFn,
    deserialize: DeserializeFn,
}

/// Maps packet type names to their registered (serializer, deserializer)
/// pair. Populated once at startup; lookups afterward never mutate it, so
/// reads need no locking beyond whatever the caller wraps it in.
#[derive(Default)]
pub struct PacketMapper {
    types: HashMap<String, RegisteredType>,
}

impl PacketMapper {
    pub fn new() -> PacketMapper {
        PacketMapper { types: HashMap::new() }
    }

    /// Registers a payload type under `type_name`. Fails with
    /// [`BusError::DuplicateType`] if the name is already registered.
    pub fn register<T>(&mut self, type_name: &str) -> Result<(), BusError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        if self.types.contains_key(type_name) {
            return Err(BusError::DuplicateType(type_name.to_string()));
        }
        self.types.insert(
            type_name.to_string(),
            RegisteredType {
                serialize: Box::new(|any| {
                    let value = any.downcast_ref::<T>().expect("type tag mismatch on serialize");
                    Ok(serde_json::to_vec(value)?)
                }),
                deserialize: Box::new(|bytes| {
                    let value: T = serde_json::from_slice(bytes)?;
                    Ok(Box::new(value))
                }),
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Serializes `value` (which must be the type registered under
    /// `type_name`) into a wire frame.
    pub fn serialize<T>(&self, type_name: &str, value: &T) -> Result<PacketData, BusError>
    where
        T: 'static,
    {
        let registered = self
            .types
            .get(type_name)
            .ok_or_else(|| BusError::UnknownType(type_name.to_string()))?;
        let bytes = (registered.serialize)(value)
            .map_err(|e| BusError::Internal(format!("serializing {}: {}", type_name, e)))?;
        Ok(PacketData::new(type_name, bytes))
    }

    /// Deserializes a wire frame into the concrete type registered under
    /// its type name. The caller downcasts the returned box.
    pub fn deserialize_any(
        &self,
        data: &PacketData,
    ) -> Result<Box<dyn std::any::Any + Send>, BusError> {
        let registered = self
            .types
            .get(data.type_name.as_str())
            .ok_or_else(|| BusError::UnknownType(data.type_name.clone()))?;
        (registered.deserialize)(&data.data)
            .map_err(|e| BusError::Protocol(format!("decoding {}: {}", data.type_name, e)))
    }

    /// Convenience wrapper around [`Self::deserialize_any`] that downcasts
    /// to `T` for the caller.
    pub fn deserialize<T>(&self, data: &PacketData) -> Result<T, BusError>
    where
        T: Send + 'static,
    {
        let any = self.deserialize_any(data)?;
        any.downcast::<T>()
            .map(|b| *b)
            .map_err(|_| BusError::Internal(format!("type tag mismatch for {}", data.type_name)))
    }
}

/// Registers every packet type the core server itself understands: the
/// handshake control packets plus the table and registry extension
/// packets. Application-defined packet types (arbitrary pub/sub payloads)
/// are registered separately by callers as they're first seen.
pub fn register_builtin_types(mapper: &mut PacketMapper) -> Result<(), BusError> {
    use nexus_protocol::packet::*;

    mapper.register::<ConnectPacket>(TYPE_CONNECT)?;
    mapper.register::<String>(TYPE_TOKEN)?;
    mapper.register::<serde_json::Value>(TYPE_READY)?;
    mapper.register::<DisconnectPacket>(TYPE_DISCONNECT)?;

    mapper.register::<TableSetPermissionPacket>("table.set_permission")?;
    mapper.register::<TableSetConfigPacket>("table.set_config")?;
    mapper.register::<TableListenPacket>("table.listen")?;
    mapper.register::<TableProxyListenPacket>("table.proxy_listen")?;
    mapper.register::<TableProxyPacket>("table.proxy")?;
    mapper.register::<TableItemsPacket>("table.item_add")?;
    mapper.register::<TableItemsPacket>("table.item_update")?;
    mapper.register::<TableItemRemovePacket>("table.item_remove")?;
    mapper.register::<TableClearPacket>("table.clear")?;
    mapper.register::<TableItemsPacket>("table.cache_update")?;
    mapper.register::<TableItemGetRequest>("table.item_get.request")?;
    mapper.register::<TableItemGetResponse>("table.item_get.response")?;
    mapper.register::<TableFetchRequest>("table.fetch.request")?;
    mapper.register::<TableFetchResponse>("table.fetch.response")?;
    mapper.register::<TableFetchAllRequest>("table.fetch_all.request")?;
    mapper.register::<TableFetchAllResponse>("table.fetch_all.response")?;
    mapper.register::<TableSizeRequest>("table.size.request")?;
    mapper.register::<TableSizeResponse>("table.size.response")?;

    mapper.register::<RegistryRegisterPacket>("registry.register")?;
    mapper.register::<RegistryListenPacket>("registry.listen")?;
    mapper.register::<RegistryUpdatePacket>("registry.update")?;
    mapper.register::<RegistryGetRequest>("registry.get.request")?;
    mapper.register::<RegistryGetResponse>("registry.get.response")?;

    mapper.register::<PermissionListRequest>("permission.list.request")?;
    mapper.register::<PermissionListResponse>("permission.list.response")?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use nexus_protocol::packet::ConnectPacket;
    use nexus_protocol::{App, Identifier};

    #[test]
    fn register_and_round_trip() {
        let mut mapper = PacketMapper::new();
        mapper.register::<ConnectPacket>("connect").unwrap();

        let pkt = ConnectPacket {
            app: App::new(Identifier::new("x", "svc"), "0.1"),
            token: None,
        };
        let data = mapper.serialize("connect", &pkt).unwrap();
        let back: ConnectPacket = mapper.deserialize(&data).unwrap();
        assert_eq!(back.app.id, pkt.app.id);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut mapper = PacketMapper::new();
        mapper.register::<ConnectPacket>("connect").unwrap();
        let err = mapper.register::<ConnectPacket>("connect").unwrap_err();
        assert!(matches!(err, BusError::DuplicateType(_)));
    }

    #[test]
    fn unknown_type_fails() {
        let mapper = PacketMapper::new();
        let data = PacketData::new("nope", vec![]);
        let err = mapper.deserialize_any(&data).unwrap_err();
        assert!(matches!(err, BusError::UnknownType(_)));
    }
}
