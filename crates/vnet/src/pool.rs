//! IPv4 and MAC address allocation for links.
//!
//! Each network is tracked by its masked base address. A cursor per network
//! remembers the last issued address; every call advances it by one and
//! skips anything already issued or claimed from a declared link.
//!
//! ```text
//!   seed 10.0.0.0/30
//!   next_cidr() -> 10.0.0.1/30
//!   next_cidr() -> 10.0.0.2/30
//!   next_cidr() -> 10.0.0.3/30
//!   next_cidr() -> AddressExhausted
//! ```
//!
//! MAC addresses keep the OUI of a real interface, with the locally
//! administered bit set, and draw the remaining three bytes from the OS
//! random source. Issued MACs are remembered so a pool never hands out the
//! same one twice.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ipnetwork::Ipv4Network;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{NetError, Result};

/// Network used when the caller does not seed the pool (`10.250.0.0/16`).
const DEFAULT_BASE: Ipv4Addr = Ipv4Addr::new(10, 250, 0, 0);
const DEFAULT_PREFIX: u8 = 16;

/// Seed used when no interface exposes a hardware address.
const ZERO_MAC: &str = "00:00:00:00:00:00";

/// Attempts at drawing an unused MAC before giving up.
const MAC_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Cursor {
    network: Ipv4Network,
    last: Ipv4Addr,
}

#[derive(Debug, Default)]
struct PoolState {
    cursors: HashMap<String, Cursor>,
    issued: HashSet<Ipv4Addr>,
    macs: HashSet<[u8; 6]>,
}

/// Allocator for link addresses, shared by everything that builds links.
#[derive(Debug)]
pub struct AddressPool {
    default: Ipv4Network,
    preset: bool,
    mac_seed: String,
    state: Mutex<PoolState>,
}

impl Default for AddressPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressPool {
    /// Pool over `10.250.0.0/16`, seeded with the host's hardware address.
    pub fn new() -> Self {
        Self {
            default: default_network(),
            preset: false,
            mac_seed: hardware_seed(),
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Pool whose default network is `cidr`.
    pub fn with_network(cidr: &str) -> Result<Self> {
        let network = parse_network(cidr)?;
        Ok(Self {
            default: network,
            preset: true,
            mac_seed: hardware_seed(),
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Replace the hardware address used as the MAC prefix.
    pub fn with_mac_seed(mut self, seed: &str) -> Result<Self> {
        parse_mac(seed)?;
        self.mac_seed = seed.to_string();
        Ok(self)
    }

    /// Whether the default network was supplied by the caller.
    pub fn preset(&self) -> bool {
        self.preset
    }

    pub fn mac_seed(&self) -> &str {
        &self.mac_seed
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next free address in `network` (or the default network), as `a.b.c.d/len`.
    pub fn next_cidr(&self, network: Option<&str>) -> Result<String> {
        let network = match network {
            Some(cidr) => parse_network(cidr)?,
            None => self.default,
        };
        let ip = self.allocate(network)?;
        Ok(format!("{ip}/{}", network.prefix()))
    }

    /// Same allocation as [`AddressPool::next_cidr`], returning the bare address.
    pub fn next_addr(&self, network: Option<&str>) -> Result<Ipv4Addr> {
        let network = match network {
            Some(cidr) => parse_network(cidr)?,
            None => self.default,
        };
        self.allocate(network)
    }

    fn allocate(&self, network: Ipv4Network) -> Result<Ipv4Addr> {
        let base = network.network();
        let prefix = network.prefix();
        let mut state = self.lock();
        let PoolState {
            cursors, issued, ..
        } = &mut *state;

        let cursor = match cursors.entry(base.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let network = Ipv4Network::new(base, prefix)
                    .map_err(|e| NetError::InvalidAddress(format!("{base}/{prefix}: {e}")))?;
                e.insert(Cursor {
                    network,
                    last: base,
                })
            }
        };

        loop {
            let next = u32::from(cursor.last)
                .checked_add(1)
                .map(Ipv4Addr::from)
                .filter(|ip| cursor.network.contains(*ip))
                .ok_or_else(|| NetError::AddressExhausted(cursor.network.to_string()))?;
            cursor.last = next;
            if issued.insert(next) {
                return Ok(next);
            }
        }
    }

    /// Mark the address of a declared link as used.
    ///
    /// Returns `false` when `cidr` does not parse (unaddressed links are valid).
    pub fn claim(&self, cidr: &str) -> bool {
        match Ipv4Network::from_str(cidr) {
            Ok(network) => {
                self.lock().issued.insert(network.ip());
                true
            }
            Err(_) => false,
        }
    }

    /// Mark the MAC of a declared link as used so it is never drawn again.
    ///
    /// Returns `true` only when `mac` parses and was not reserved yet.
    pub fn claim_mac(&self, mac: &str) -> bool {
        match parse_mac(mac) {
            Ok(bytes) => self.lock().macs.insert(bytes),
            Err(_) => false,
        }
    }

    /// New MAC derived from `seed`'s OUI with random trailing bytes.
    pub fn next_mac(&self, seed: &str) -> Result<String> {
        let hw = parse_mac(seed)?;
        let mut state = self.lock();
        for _ in 0..MAC_ATTEMPTS {
            let mut random = [0u8; 3];
            OsRng.fill_bytes(&mut random);
            let [r0, r1, r2] = random;
            let [h0, h1, h2, ..] = hw;
            let mac = [(h0 | 0x02) & !0x01, h1, h2, r0, r1, r2];
            if state.macs.insert(mac) {
                return Ok(format_mac(&mac));
            }
        }
        Err(NetError::AddressExhausted(format!(
            "no unused MAC for prefix {seed}"
        )))
    }
}

fn default_network() -> Ipv4Network {
    Ipv4Network::new(DEFAULT_BASE, DEFAULT_PREFIX).unwrap_or_else(|_| Ipv4Network::from(DEFAULT_BASE))
}

fn parse_network(cidr: &str) -> Result<Ipv4Network> {
    Ipv4Network::from_str(cidr).map_err(|e| NetError::InvalidAddress(format!("{cidr}: {e}")))
}

fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let invalid = || NetError::InvalidAddress(format!("malformed MAC: {mac}"));
    let mut bytes = [0u8; 6];
    let mut parts = mac.split(':');
    for byte in &mut bytes {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(bytes)
}

fn format_mac(mac: &[u8; 6]) -> String {
    let [a, b, c, d, e, f] = mac;
    format!("{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{f:02x}")
}

/// First non-zero hardware address under `/sys/class/net`, or all zeros.
pub fn hardware_seed() -> String {
    hardware_seed_from(Path::new("/sys/class/net")).unwrap_or_else(|| ZERO_MAC.to_string())
}

fn hardware_seed_from(dir: &Path) -> Option<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    names.sort();
    names.into_iter().find_map(|iface| {
        let address = std::fs::read_to_string(iface.join("address")).ok()?;
        let address = address.trim();
        (parse_mac(address).is_ok() && address != ZERO_MAC).then(|| address.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash30_yields_three_addresses_then_exhausts() {
        let pool = AddressPool::with_network("10.0.0.0/30").unwrap();
        assert!(pool.preset());
        assert_eq!(pool.next_cidr(None).unwrap(), "10.0.0.1/30");
        assert_eq!(pool.next_cidr(None).unwrap(), "10.0.0.2/30");
        assert_eq!(pool.next_cidr(None).unwrap(), "10.0.0.3/30");

        let err = pool.next_cidr(None).unwrap_err();
        assert!(
            matches!(err, NetError::AddressExhausted(_)),
            "expected AddressExhausted, got: {err}"
        );
        // Still exhausted; never falls back to an issued address.
        assert!(pool.next_cidr(None).is_err());
    }

    #[test]
    fn sequential_addresses_are_distinct() {
        let pool = AddressPool::with_network("10.1.0.0/24").unwrap();
        let mut seen = HashSet::new();
        for _ in 0..255 {
            let cidr = pool.next_cidr(None).unwrap();
            assert!(seen.insert(cidr.clone()), "duplicate: {cidr}");
        }
        assert!(pool.next_cidr(None).is_err());
    }

    #[test]
    fn explicit_network_is_keyed_by_masked_base() {
        let pool = AddressPool::new();
        assert!(!pool.preset());
        // Host bits in the argument do not change the network key.
        assert_eq!(pool.next_cidr(Some("10.200.22.31/16")).unwrap(), "10.200.0.1/16");
        assert_eq!(pool.next_cidr(Some("10.200.0.0/16")).unwrap(), "10.200.0.2/16");
    }

    #[test]
    fn default_network_used_without_seed() {
        let pool = AddressPool::new();
        assert_eq!(pool.next_cidr(None).unwrap(), "10.250.0.1/16");
        assert_eq!(pool.next_addr(None).unwrap(), Ipv4Addr::new(10, 250, 0, 2));
    }

    #[test]
    fn claimed_addresses_are_skipped() {
        let pool = AddressPool::with_network("10.0.0.0/29").unwrap();
        assert!(pool.claim("10.0.0.1/29"));
        assert!(pool.claim("10.0.0.2/29"));
        assert!(!pool.claim("noip"));
        assert_eq!(pool.next_cidr(None).unwrap(), "10.0.0.3/29");
    }

    #[test]
    fn claimed_macs_are_reserved() {
        let pool = AddressPool::new();
        assert!(pool.claim_mac("02:16:3e:00:00:01"));
        assert!(!pool.claim_mac("02:16:3e:00:00:01"));
        assert!(!pool.claim_mac("not-a-mac"));
        assert!(pool.lock().macs.contains(&[0x02, 0x16, 0x3e, 0x00, 0x00, 0x01]));

        let drawn = pool.next_mac("00:16:3e:aa:bb:cc").unwrap();
        assert!(!pool.claim_mac(&drawn));
    }

    #[test]
    fn malformed_network_is_invalid_address() {
        let err = AddressPool::with_network("10.0.0/99").unwrap_err();
        assert!(matches!(err, NetError::InvalidAddress(_)), "got: {err}");

        let pool = AddressPool::new();
        let err = pool.next_cidr(Some("not-a-cidr")).unwrap_err();
        assert!(matches!(err, NetError::InvalidAddress(_)), "got: {err}");
    }

    #[test]
    fn mac_keeps_oui_and_sets_local_bit() {
        let pool = AddressPool::new();
        let mac = pool.next_mac("00:16:3e:aa:bb:cc").unwrap();
        assert!(mac.starts_with("02:16:3e:"), "mac was: {mac}");
        assert_eq!(mac.len(), 17);
        let first = u8::from_str_radix(&mac[..2], 16).unwrap();
        assert_eq!(first & 0x02, 0x02);
        assert_eq!(first & 0x01, 0x00);
    }

    #[test]
    fn macs_are_not_repeated() {
        let pool = AddressPool::new();
        let mut seen = HashSet::new();
        for _ in 0..512 {
            let mac = pool.next_mac("52:54:00:00:00:00").unwrap();
            assert!(seen.insert(mac.clone()), "duplicate mac: {mac}");
        }
    }

    #[test]
    fn malformed_mac_seed_is_invalid_address() {
        let pool = AddressPool::new();
        for seed in ["", "00:11:22", "00:11:22:33:44:55:66", "zz:11:22:33:44:55"] {
            let err = pool.next_mac(seed).unwrap_err();
            assert!(matches!(err, NetError::InvalidAddress(_)), "seed {seed:?}: {err}");
        }
    }

    #[test]
    fn hardware_seed_reads_first_nonzero_interface() {
        let dir = tempfile::tempdir().unwrap();
        for (iface, address) in [
            ("a-lo", "00:00:00:00:00:00"),
            ("b-eth", "52:54:00:12:34:56"),
            ("c-eth", "52:54:00:ff:ff:ff"),
        ] {
            let path = dir.path().join(iface);
            std::fs::create_dir(&path).unwrap();
            std::fs::write(path.join("address"), format!("{address}\n")).unwrap();
        }
        assert_eq!(
            hardware_seed_from(dir.path()).as_deref(),
            Some("52:54:00:12:34:56")
        );
    }

    #[test]
    fn hardware_seed_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(hardware_seed_from(&dir.path().join("missing")), None);
    }

    #[test]
    fn with_mac_seed_validates() {
        assert!(AddressPool::new().with_mac_seed("bogus").is_err());
        let pool = AddressPool::new().with_mac_seed("52:54:00:01:02:03").unwrap();
        assert_eq!(pool.mac_seed(), "52:54:00:01:02:03");
    }
}
