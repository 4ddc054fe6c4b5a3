use std::collections::BTreeSet;
use std::net::TcpListener;

use tracing::debug;

use crate::errors::ProgenyError;

/// Returns true when something outside the registry already listens on `port`.
pub type BoundCheck = fn(u16) -> bool;

/// Check by trying to bind the loopback interface.
pub fn is_port_bound(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_err()
}

/// Bounded pool of ports handed to spun sessions.
///
/// The in-use set mirrors the registry's live rows rather than being tracked
/// independently. Callers resync it before allocating, so a port claimed or
/// freed through another handle on the registry is seen here too.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    in_use: BTreeSet<u16>,
    bound_check: Option<BoundCheck>,
}

impl PortAllocator {
    /// Build an allocator over the inclusive range `min..=max`.
    pub fn new(min: u16, max: u16) -> Result<Self, ProgenyError> {
        if min == 0 || min > max {
            return Err(ProgenyError::InvalidPortRange { min, max });
        }
        Ok(Self {
            min,
            max,
            in_use: BTreeSet::new(),
            bound_check: None,
        })
    }

    /// Build an allocator whose in-use set is exactly `live_ports`.
    /// Ports outside the range are ignored.
    pub fn from_live_ports(
        min: u16,
        max: u16,
        live_ports: impl IntoIterator<Item = u16>,
    ) -> Result<Self, ProgenyError> {
        let mut allocator = Self::new(min, max)?;
        for port in live_ports {
            allocator.mark_in_use(port);
        }
        Ok(allocator)
    }

    /// Also skip ports that `check` reports as bound by another process.
    pub fn with_bound_check(mut self, check: BoundCheck) -> Self {
        self.bound_check = Some(check);
        self
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Hand out the lowest free port.
    pub fn allocate(&mut self) -> Result<u16, ProgenyError> {
        for port in self.min..=self.max {
            if self.in_use.contains(&port) {
                continue;
            }
            if let Some(check) = self.bound_check
                && check(port)
            {
                debug!(port, "Skipping port bound by a foreign process");
                continue;
            }
            self.in_use.insert(port);
            return Ok(port);
        }
        Err(ProgenyError::NoFreePort {
            min: self.min,
            max: self.max,
        })
    }

    /// Mark a port free. Releasing a free port is a no-op.
    pub fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }

    pub fn mark_in_use(&mut self, port: u16) {
        if self.contains(port) {
            self.in_use.insert(port);
        }
    }

    /// Replace the in-use set with `ports`. Ports outside the range are ignored.
    pub fn sync_in_use(&mut self, ports: impl IntoIterator<Item = u16>) {
        self.in_use.clear();
        for port in ports {
            self.mark_in_use(port);
        }
    }

    pub fn available(&self) -> usize {
        usize::from(self.max - self.min) + 1 - self.in_use.len()
    }
}
