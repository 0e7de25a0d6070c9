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

//! `nexus-protocol` defines the wire-level types shared between a nexus
//! bus server and any client that wants to talk to it: the framed message
//! envelope, the hierarchical identifier model, permission descriptors, and
//! the payload schemas for every built-in and extension packet.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod codec;
pub mod error;
pub mod identifier;
pub mod packet;
pub mod permission;

pub use codec::{ByteReader, ByteWriter, PacketData, ShortRead};
pub use error::BusError;
pub use identifier::{App, Identifier};
pub use permission::{PermissionLevel, PermissionType, RegistryPermissions, TablePermissions};
