//! Port Allocator: hands out SSH-range and app-range host ports, tracking in-memory
//! reservations plus an actual-availability probe.

use std::{
    collections::BTreeSet,
    net::{SocketAddr, TcpListener},
    sync::Mutex,
};

use rand::Rng;
use thiserror::Error;

const SSH_RANGE: std::ops::RangeInclusive<u16> = 10000..=10099;
const DEFAULT_APP_RANGE: std::ops::RangeInclusive<u16> = 15001..=15300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortAllocationError {
    #[error("no available ports in range")]
    Exhausted,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid port list entry {0:?}: {1}")]
pub struct PortListParseError(String, String);

/// Parses the `PORTS` config value: a comma-separated list of single ports and/or
/// `a-b` ranges, e.g. `15001-15300,16000,16005-16010`.
pub fn parse_port_list(raw: &str) -> Result<Vec<u16>, PortListParseError> {
    let mut ports = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('-') {
            Some((start, end)) => {
                let start: u16 = start
                    .trim()
                    .parse()
                    .map_err(|_| PortListParseError(entry.to_string(), "not a valid range start".into()))?;
                let end: u16 = end
                    .trim()
                    .parse()
                    .map_err(|_| PortListParseError(entry.to_string(), "not a valid range end".into()))?;
                if start > end {
                    return Err(PortListParseError(entry.to_string(), "range start is after end".into()));
                }
                ports.extend(start..=end);
            }
            None => {
                let port: u16 =
                    entry.parse().map_err(|_| PortListParseError(entry.to_string(), "not a valid port".into()))?;
                ports.push(port);
            }
        }
    }
    if ports.is_empty() {
        return Err(PortListParseError(raw.to_string(), "port list is empty".into()));
    }
    Ok(ports)
}

fn is_listenable(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).is_ok()
}

pub struct PortAllocator {
    ssh_ports: Vec<u16>,
    app_ports: Vec<u16>,
    reserved: Mutex<BTreeSet<u16>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_APP_RANGE.collect())
    }
}

impl PortAllocator {
    /// `app_ports` is the pool `allocate_app_ports` draws from, normally parsed from the
    /// `PORTS` config value via `parse_port_list`. The SSH range is fixed.
    pub fn new(app_ports: Vec<u16>) -> Self {
        Self { ssh_ports: SSH_RANGE.collect(), app_ports, reserved: Mutex::new(BTreeSet::new()) }
    }

    fn allocate_from_pool(&self, pool: &[u16]) -> Result<u16, PortAllocationError> {
        let mut reserved = self.reserved.lock().expect("port allocator mutex poisoned");
        let span = pool.len() as u32;
        let offset = rand::thread_rng().gen_range(0..span);
        for i in 0..span {
            let candidate = pool[((offset + i) % span) as usize];
            if !reserved.contains(&candidate) && is_listenable(candidate) {
                reserved.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(PortAllocationError::Exhausted)
    }

    /// Allocates a single port from the SSH range.
    pub fn allocate_ssh_port(&self) -> Result<u16, PortAllocationError> {
        self.allocate_from_pool(&self.ssh_ports)
    }

    /// Allocates `n` ports from the configured app pool atomically: releases all
    /// partial reservations if it runs out partway through.
    pub fn allocate_app_ports(&self, n: usize) -> Result<Vec<u16>, PortAllocationError> {
        let mut allocated = Vec::with_capacity(n);
        for _ in 0..n {
            match self.allocate_from_pool(&self.app_ports) {
                Ok(port) => allocated.push(port),
                Err(e) => {
                    self.release(&allocated);
                    return Err(e);
                }
            }
        }
        Ok(allocated)
    }

    /// Releases previously-allocated ports. This only clears the in-memory
    /// reservation; no socket was ever held open, so there's nothing to unbind.
    pub fn release(&self, ports: &[u16]) {
        let mut reserved = self.reserved.lock().expect("port allocator mutex poisoned");
        for port in ports {
            reserved.remove(port);
        }
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().expect("port allocator mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ports_are_within_ssh_range() {
        let allocator = PortAllocator::default();
        let port = allocator.allocate_ssh_port().unwrap();
        assert!(SSH_RANGE.contains(&port));
    }

    #[test]
    fn allocated_ports_are_within_app_range() {
        let allocator = PortAllocator::default();
        let ports = allocator.allocate_app_ports(3).unwrap();
        assert_eq!(ports.len(), 3);
        for port in &ports {
            assert!(DEFAULT_APP_RANGE.contains(port));
        }
    }

    #[test]
    fn no_duplicate_ports_across_allocations() {
        let allocator = PortAllocator::default();
        let ports = allocator.allocate_app_ports(10).unwrap();
        let unique: BTreeSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), ports.len());
    }

    #[test]
    fn release_frees_reservation_for_reuse() {
        let allocator = PortAllocator::default();
        let port = allocator.allocate_ssh_port().unwrap();
        assert_eq!(allocator.reserved_count(), 1);
        allocator.release(&[port]);
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[test]
    fn create_then_release_round_trips_to_empty_reservation_set() {
        let allocator = PortAllocator::default();
        let ssh = allocator.allocate_ssh_port().unwrap();
        let app = allocator.allocate_app_ports(2).unwrap();
        allocator.release(&[ssh]);
        allocator.release(&app);
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[test]
    fn parses_a_single_range() {
        assert_eq!(parse_port_list("15001-15300").unwrap().len(), 300);
    }

    #[test]
    fn parses_mixed_singles_and_ranges() {
        let ports = parse_port_list("16000,16005-16007,16010").unwrap();
        assert_eq!(ports, vec![16000, 16005, 16006, 16007, 16010]);
    }

    #[test]
    fn rejects_an_inverted_range() {
        assert!(parse_port_list("15300-15001").is_err());
    }

    #[test]
    fn rejects_an_empty_list() {
        assert!(parse_port_list("").is_err());
    }

    #[test]
    fn configured_app_pool_is_used_instead_of_the_default_range() {
        let allocator = PortAllocator::new(vec![20000, 20001]);
        let ports = allocator.allocate_app_ports(2).unwrap();
        assert_eq!(BTreeSet::from_iter(ports), BTreeSet::from([20000, 20001]));
        assert!(allocator.allocate_app_ports(1).is_err());
    }
}
