//! The connection pool (spec.md §5 "Two pools — message pool and
//! connection pool — are process-wide"). `MessagePool` lives in
//! `message.rs` next to the type it allocates; this one tracks
//! `Connection` lifetimes the same way.
//!
//! Real connection establishment/teardown is out of scope (spec.md
//! §1); this only gives the response core a place to register a
//! connection's id for the duration of its life, so that, e.g., tests
//! can assert every connection opened was eventually closed.

use std::cell::RefCell;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::connection::{Connection, Protocol, Role};

pub struct ConnectionPool {
    next_id: u64,
    live: HashSet<u64>,
}

impl ConnectionPool {
    pub fn new() -> ConnectionPool {
        ConnectionPool {
            next_id: 1,
            live: HashSet::new(),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn acquire(
        &mut self,
        role: Role,
        protocol: Protocol,
        peer_addr: SocketAddr,
    ) -> Rc<RefCell<Connection>> {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id);
        Rc::new(RefCell::new(Connection::new(id, role, protocol, peer_addr)))
    }

    pub fn release(&mut self, conn: &Rc<RefCell<Connection>>) {
        self.live.remove(&conn.borrow().id);
    }
}

impl Default for ConnectionPool {
    fn default() -> ConnectionPool {
        ConnectionPool::new()
    }
}
