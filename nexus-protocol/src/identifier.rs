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

use std::fmt;

use anyhow::{anyhow, Context};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A hierarchical, namespace-qualified address.
///
/// An `Identifier` is a namespace (normally a reverse-DNS style string such
/// as `cc.omuchat`) plus a non-empty ordered sequence of path segments. Two
/// identifiers are equal iff their namespace and segments match exactly.
/// Identifiers are cheap, immutable values: clone freely, there's no
/// ownership to track.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    namespace: String,
    path: Vec<String>,
}

impl Identifier {
    /// Builds an identifier from a namespace and its first path segment.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Identifier {
        Identifier { namespace: namespace.into(), path: vec![name.into()] }
    }

    /// Parses the canonical `namespace:seg1/seg2/...` form.
    ///
    /// This is also the form used as a hash map key, so it doubles as
    /// `from_key`.
    pub fn from_key(key: &str) -> anyhow::Result<Identifier> {
        let (namespace, path) =
            key.split_once(':').ok_or_else(|| anyhow!("identifier {:?} is missing a namespace", key))?;
        if namespace.is_empty() {
            return Err(anyhow!("identifier {:?} has an empty namespace", key));
        }
        let path: Vec<String> = path.split('/').map(String::from).collect();
        if path.is_empty() || path.iter().any(|seg| seg.is_empty()) {
            return Err(anyhow!("identifier {:?} has an empty path segment", key));
        }
        Ok(Identifier { namespace: namespace.to_string(), path })
    }

    /// Returns a new identifier with `segment` appended to the path.
    pub fn join(&self, segment: impl Into<String>) -> Identifier {
        let mut path = self.path.clone();
        path.push(segment.into());
        Identifier { namespace: self.namespace.clone(), path }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The last path segment, which usually doubles as a human name.
    pub fn name(&self) -> &str {
        self.path.last().expect("path is always non-empty")
    }

    /// Canonical string form, also used as the hash/map key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.namespace, self.path.join("/"))
    }

    /// True iff `self` and `parent` share a namespace and `self`'s path is
    /// `parent`'s path, or an extension of it.
    ///
    /// Reflexive (`id.is_subpart_of(&id)` holds), transitive, and
    /// antisymmetric modulo equality: if `a.is_subpart_of(b)` and
    /// `b.is_subpart_of(a)` then `a == b`.
    pub fn is_subpart_of(&self, parent: &Identifier) -> bool {
        self.namespace == parent.namespace
            && self.path.len() >= parent.path.len()
            && self.path[..parent.path.len()] == parent.path[..]
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Identifier, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Identifier::from_key(&s).map_err(de::Error::custom)
    }
}

/// A client's declared identity: an `Identifier` plus a free-form version
/// string. Transmitted once, in the `connect` packet, and immutable for the
/// lifetime of the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub id: Identifier,
    pub version: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl App {
    pub fn new(id: Identifier, version: impl Into<String>) -> App {
        App { id, version: version.into(), metadata: None }
    }
}

/// Helper used by config/test code that wants to build an `Identifier` from a
/// `namespace:seg1/seg2` string and get a friendly error on malformed input.
pub fn parse_identifier(s: &str) -> anyhow::Result<Identifier> {
    Identifier::from_key(s).with_context(|| format!("parsing identifier {:?}", s))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let id = Identifier::new("cc.omuchat", "chat").join("messages");
        assert_eq!(Identifier::from_key(&id.key()).unwrap(), id);
    }

    #[test]
    fn subpart_reflexive() {
        let id = Identifier::new("x", "svc");
        assert!(id.is_subpart_of(&id));
    }

    #[test]
    fn subpart_extension() {
        let parent = Identifier::new("x", "svc");
        let child = parent.join("data");
        assert!(child.is_subpart_of(&parent));
        assert!(!parent.is_subpart_of(&child));
    }

    #[test]
    fn subpart_requires_matching_namespace() {
        let a = Identifier::new("x", "svc");
        let b = Identifier::new("y", "svc");
        assert!(!a.is_subpart_of(&b));
    }

    #[test]
    fn display_matches_key() {
        let id = Identifier::new("cc.omuchat", "chat");
        assert_eq!(id.to_string(), id.key());
        assert_eq!(id.to_string(), "cc.omuchat:chat");
    }

    #[test]
    fn from_key_rejects_missing_namespace() {
        assert!(Identifier::from_key("no-namespace-here").is_err());
    }
}
