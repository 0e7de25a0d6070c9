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

//! The packet dispatcher (C6): a process-wide registry of `type_name -> `
//! ordered handler list, built once at startup and never mutated again, so
//! lookups from many connection threads need no locking.

use std::collections::HashMap;

use nexus_protocol::error::BusError;
use nexus_protocol::PacketData;
use tracing::{instrument, warn};

use crate::session::Session;

pub type Handler = Box<dyn Fn(&Session, PacketData) -> Result<(), BusError> + Send + Sync>;

/// Routes one decoded frame to every handler registered for its type, in
/// registration order. Types with no registered handler fall through to
/// [`Self::default_handler`], if one is set -- this is where generic
/// application-defined packet pub/sub lives: a session publishes a packet
/// under some type name, and the default handler fans it out to whichever
/// other sessions have subscribed to that same name.
#[derive(Default)]
pub struct PacketDispatcher {
    handlers: HashMap<String, Vec<Handler>>,
    default_handler: Option<Handler>,
}

impl PacketDispatcher {
    pub fn new() -> PacketDispatcher {
        PacketDispatcher::default()
    }

    pub fn add_handler(&mut self, type_name: &str, handler: Handler) {
        self.handlers.entry(type_name.to_string()).or_default().push(handler);
    }

    pub fn set_default_handler(&mut self, handler: Handler) {
        self.default_handler = Some(handler);
    }

    /// Invokes every handler registered for `data.type_name`. A handler's
    /// failure is logged and does not stop later handlers from running,
    /// except that the first [`BusError::PermissionDenied`] encountered is
    /// remembered and returned once every handler has run, so the caller
    /// can disconnect the offending session.
    #[instrument(skip_all, fields(type_name = %data.type_name, app = %session.app.id))]
    pub fn dispatch(&self, session: &Session, data: PacketData) -> Result<(), BusError> {
        let Some(handlers) = self.handlers.get(data.type_name.as_str()) else {
            return match &self.default_handler {
                Some(handler) => handler(session, data),
                None => Err(BusError::UnknownType(data.type_name.clone())),
            };
        };

        let mut first_denied = None;
        for handler in handlers {
            if let Err(e) = handler(session, data.clone()) {
                match e {
                    BusError::PermissionDenied(_) if first_denied.is_none() => first_denied = Some(e),
                    other => warn!(type_name = %data.type_name, "packet handler failed: {}", other),
                }
            }
        }
        match first_denied {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::SessionConnection;
    use crate::session::SessionId;
    use nexus_protocol::identifier::{App, Identifier};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn session() -> Session {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        drop(client);
        Session::for_test(SessionId(0), App::new(Identifier::new("x", "svc"), "0.1"), SessionConnection::new(server).unwrap())
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let mut dispatcher = PacketDispatcher::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        dispatcher.add_handler("t", Box::new(move |_, _| { o1.lock().unwrap().push(1); Ok(()) }));
        let o2 = Arc::clone(&order);
        dispatcher.add_handler("t", Box::new(move |_, _| { o2.lock().unwrap().push(2); Ok(()) }));

        let session = session();
        dispatcher.dispatch(&session, PacketData::new("t", vec![])).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn a_failing_handler_does_not_block_the_next_one() {
        let mut dispatcher = PacketDispatcher::new();
        let ran = Arc::new(AtomicUsize::new(0));
        dispatcher.add_handler("t", Box::new(|_, _| Err(BusError::Internal("boom".into()))));
        let ran2 = Arc::clone(&ran);
        dispatcher.add_handler("t", Box::new(move |_, _| { ran2.fetch_add(1, Ordering::SeqCst); Ok(()) }));

        let session = session();
        dispatcher.dispatch(&session, PacketData::new("t", vec![])).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn permission_denied_is_surfaced_after_every_handler_runs() {
        let mut dispatcher = PacketDispatcher::new();
        let ran = Arc::new(AtomicUsize::new(0));
        dispatcher.add_handler("t", Box::new(|_, _| Err(BusError::PermissionDenied("nope".into()))));
        let ran2 = Arc::clone(&ran);
        dispatcher.add_handler("t", Box::new(move |_, _| { ran2.fetch_add(1, Ordering::SeqCst); Ok(()) }));

        let session = session();
        let err = dispatcher.dispatch(&session, PacketData::new("t", vec![])).unwrap_err();
        assert!(matches!(err, BusError::PermissionDenied(_)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_type_with_no_default_handler_fails() {
        let dispatcher = PacketDispatcher::new();
        let session = session();
        let err = dispatcher.dispatch(&session, PacketData::new("nope", vec![])).unwrap_err();
        assert!(matches!(err, BusError::UnknownType(_)));
    }

    #[test]
    fn unregistered_type_falls_through_to_default_handler() {
        let mut dispatcher = PacketDispatcher::new();
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = Arc::clone(&hit);
        dispatcher.set_default_handler(Box::new(move |_, _| { hit2.fetch_add(1, Ordering::SeqCst); Ok(()) }));

        let session = session();
        dispatcher.dispatch(&session, PacketData::new("cc.omuchat:chat/message", vec![])).unwrap();
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}
