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

use serde_derive::{Deserialize, Serialize};

use crate::identifier::Identifier;

/// The severity a declared permission is advertised with, purely for display
/// in a client's consent UI. Carries no enforcement weight on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Low,
    Medium,
    High,
}

/// Metadata for one permission identifier the server is willing to grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionType {
    pub id: Identifier,
    pub level: PermissionLevel,
    pub name: String,
    pub note: String,
}

/// The permission fields that gate a [`crate::registry`]-style single-value
/// store. `all` subsumes both `read` and `write`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryPermissions {
    pub all: Option<Identifier>,
    pub read: Option<Identifier>,
    pub write: Option<Identifier>,
}

/// The permission fields that gate a keyed table. `all` subsumes every
/// other field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TablePermissions {
    pub all: Option<Identifier>,
    pub read: Option<Identifier>,
    pub write: Option<Identifier>,
    pub remove: Option<Identifier>,
    pub proxy: Option<Identifier>,
}

/// One already-granted permission, as stored in a session's grant set.
pub type Grant = Identifier;
