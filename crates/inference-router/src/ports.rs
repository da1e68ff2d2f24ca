//! Port allocation for backend servers
//!
//! Ports are handed out from a fixed base range. A port counts as free when
//! nothing in this process holds it and a bind on the loopback interface
//! succeeds. Allocated ports stay reserved until released on unload, which
//! covers the window between allocation and the engine actually binding.

use std::collections::HashSet;
use std::net::TcpListener;

use parking_lot::Mutex;

use crate::constants::hosts;

/// Hands out loopback ports to backend servers
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    range: u16,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(base: u16, range: u16) -> Self {
        Self {
            base,
            range,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve the first free port at or above the base
    pub fn allocate(&self) -> Option<u16> {
        let mut reserved = self.reserved.lock();
        for offset in 0..self.range {
            let Some(port) = self.base.checked_add(offset) else {
                break;
            };
            if port == 0 || reserved.contains(&port) {
                continue;
            }
            if is_port_free(port) {
                reserved.insert(port);
                log::debug!("Allocated port {}", port);
                return Some(port);
            }
        }
        None
    }

    /// Return a port to the pool
    pub fn release(&self, port: u16) {
        if self.reserved.lock().remove(&port) {
            log::debug!("Released port {}", port);
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }
}

/// Check whether a loopback bind on `port` succeeds right now
fn is_port_free(port: u16) -> bool {
    TcpListener::bind((hosts::LOCAL, port)).is_ok()
}
