//! Allocation of disjoint port ranges to server instances.

use std::{
    fmt,
    net::{Ipv4Addr, TcpListener},
    num::NonZeroU16,
};

use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};

use crate::error::ServerError;

/// How many ports past the preferred base we are willing to scan.
pub const DEFAULT_SEARCH_WINDOW: u16 = 10_000;

/// A contiguous block of ports reserved for one server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    base: u16,
    count: u16,
}

impl PortRange {
    pub fn new(base: u16, count: NonZeroU16) -> Self {
        Self {
            base,
            count: count.get(),
        }
    }

    /// The primary port of the instance, i.e. the one clients connect to.
    pub fn first(&self) -> u16 {
        self.base
    }

    /// The `i`th port of the range, if the range is that large.
    pub fn nth(&self, i: u16) -> Option<u16> {
        (i < self.count).then(|| self.base + i)
    }

    pub fn len(&self) -> u16 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Inclusive last port of the range.
    pub fn last(&self) -> u16 {
        self.base + (self.count - 1)
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.base..=self.last()).contains(&port)
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.base <= other.last() && other.base <= self.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.base..=self.last()
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.last())
    }
}

/// Whether candidate ports are additionally checked against the host's network namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCheck {
    /// Skip ports that a loopback listener cannot bind, e.g. ports held by foreign processes.
    Bind,
    /// Only consider ranges held by this allocator.
    Bookkeeping,
}

impl PortCheck {
    fn is_free(&self, port: u16) -> bool {
        match self {
            PortCheck::Bind => TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok(),
            PortCheck::Bookkeeping => true,
        }
    }
}

/// Hands out disjoint [port ranges][PortRange].
///
/// All allocations and frees go through a single lock, so concurrent owners can never be handed
/// overlapping ranges.
pub struct PortAllocator {
    held: Mutex<Vec<(String, PortRange)>>,
    window: u16,
    check: PortCheck,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_WINDOW, PortCheck::Bind)
    }
}

impl PortAllocator {
    pub fn new(window: u16, check: PortCheck) -> Self {
        Self {
            held: Default::default(),
            window,
            check,
        }
    }

    /// Reserves `count` consecutive ports for `name`, scanning upward from `preferred_base`.
    pub fn allocate(
        &self,
        name: &str,
        preferred_base: u16,
        count: NonZeroU16,
    ) -> Result<PortRange, ServerError> {
        let mut held = self.held.lock();

        let exhausted = || ServerError::PortExhaustion {
            name: name.to_owned(),
            base: preferred_base,
            count: count.get(),
            window: self.window,
        };

        let highest_base = u16::MAX - (count.get() - 1);
        let scan_end = preferred_base
            .saturating_add(self.window.saturating_sub(count.get()))
            .min(highest_base);
        if preferred_base > scan_end {
            return Err(exhausted());
        }

        let mut base = preferred_base;
        'scan: while base <= scan_end {
            let candidate = PortRange::new(base, count);

            if let Some((_, taken)) = held.iter().find(|(_, r)| r.overlaps(&candidate)) {
                match taken.last().checked_add(1) {
                    Some(next) => {
                        base = next;
                        continue 'scan;
                    }
                    None => break 'scan,
                }
            }

            for port in candidate.iter() {
                if !self.check.is_free(port) {
                    tracing::debug!(port, name, "port in use outside of the fleet");
                    match port.checked_add(1) {
                        Some(next) => {
                            base = next;
                            continue 'scan;
                        }
                        None => break 'scan,
                    }
                }
            }

            held.push((name.to_owned(), candidate));
            tracing::debug!(name, range=%candidate, "allocated ports");
            return Ok(candidate);
        }

        Err(exhausted())
    }

    /// Returns a range to the pool.
    pub fn free(&self, range: PortRange) {
        let mut held = self.held.lock();
        match held.iter().position(|(_, r)| *r == range) {
            Some(index) => {
                let (name, _) = held.swap_remove(index);
                tracing::debug!(name, %range, "freed ports");
            }
            None => {
                tracing::warn!(%range, "attempted to free a port range that is not held");
            }
        }
    }

    /// Frees every held range, returning how many were held.
    pub fn free_all(&self) -> usize {
        let mut held = self.held.lock();
        let freed = held.len();
        held.clear();
        freed
    }

    pub fn held(&self) -> Vec<(String, PortRange)> {
        self.held.lock().clone()
    }
}
