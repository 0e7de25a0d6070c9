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

//! The error taxonomy every session-facing component reports through.
//!
//! These are plain enums with hand written `Display`/`Error` impls rather
//! than `thiserror`, matching how the rest of this codebase threads precise,
//! user-facing error kinds through `anyhow::Result` at the handler
//! boundary: a `BusError` is the thing a caller pattern matches on to decide
//! disposition (close the session? just log it?), while `anyhow::Error`
//! carries the incidental context.

use std::fmt;

/// The taxonomy of errors a session, dispatcher, or extension can surface.
/// See the module doc for why this isn't `thiserror`.
#[derive(Debug)]
pub enum BusError {
    /// Malformed frame, unknown type, or a handshake violation.
    Protocol(String),
    /// The handshake's `connect` packet carried a bad token or unknown app.
    HandshakeFailed(String),
    /// The session lacked a required permission for the operation.
    PermissionDenied(String),
    /// A packet type name collided with one already registered.
    DuplicateType(String),
    /// A packet arrived whose type name has no registered schema.
    UnknownType(String),
    /// The storage adapter backing a table or registry failed.
    Storage(String),
    /// A send or receive was attempted on an already-closed session.
    Closed,
    /// An unexpected failure inside a handler; the session may still be
    /// alive.
    Internal(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            BusError::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
            BusError::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            BusError::DuplicateType(name) => write!(f, "duplicate packet type: {}", name),
            BusError::UnknownType(name) => write!(f, "unknown packet type: {}", name),
            BusError::Storage(msg) => write!(f, "storage error: {}", msg),
            BusError::Closed => write!(f, "session is closed"),
            BusError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for BusError {}

impl BusError {
    /// Whether this error kind means the session must be disconnected per
    /// the error disposition table, as opposed to merely logged.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            BusError::Protocol(_) | BusError::HandshakeFailed(_) | BusError::PermissionDenied(_)
        )
    }

    /// The `disconnect{reason}` text to send before closing, if any.
    pub fn disconnect_reason(&self) -> Option<String> {
        match self {
            BusError::Protocol(msg) => Some(format!("protocol error: {}", msg)),
            BusError::HandshakeFailed(msg) => Some(format!("handshake failed: {}", msg)),
            BusError::PermissionDenied(msg) => Some(msg.clone()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BusError {
    fn from(e: std::io::Error) -> Self {
        BusError::Protocol(e.to_string())
    }
}

impl From<crate::codec::ShortRead> for BusError {
    fn from(_: crate::codec::ShortRead) -> Self {
        BusError::Protocol("short read while decoding packet payload".to_string())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Protocol(format!("json decode failure: {}", e))
    }
}
