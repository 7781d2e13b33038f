//! Address range parsing and lazy enumeration.
//!
//! Three forms are accepted:
//! - CIDR: `192.168.1.0/24` (host addresses only)
//! - per-octet bounds: `172.29.0-255.1-254`
//! - explicit span: `10.0.0.5-10.0.0.20`, or a single address
//!
//! Every form maps an index in `0..len()` to an address, so enumeration never
//! materializes the range and always yields the same sequence.
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{bail, Result};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::Ipv4Net;

use crate::error::ConfigError;
use crate::types::Address;

/// Largest range accepted (a /8).
pub const MAX_ADDRESSES: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressRange {
    Cidr(Ipv4Net),
    /// Inclusive `(lo, hi)` bounds per octet, most significant first.
    Octets([(u8, u8); 4]),
    Span { start: Ipv4Addr, end: Ipv4Addr },
}

impl AddressRange {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(ConfigError::range(input, "empty specification"));
        }

        let range = if let Some((addr, prefix)) = s.split_once('/') {
            let addr: Ipv4Addr = addr
                .parse()
                .map_err(|e| ConfigError::range(input, format!("bad address: {e}")))?;
            if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ConfigError::range(input, format!("bad prefix length: `{prefix}`")));
            }
            let prefix: u8 = prefix
                .parse()
                .map_err(|e| ConfigError::range(input, format!("bad prefix length: {e}")))?;
            let net = Ipv4Net::new(addr, prefix)
                .map_err(|e| ConfigError::range(input, e.to_string()))?;
            Self::Cidr(net.trunc())
        } else if let Some((a, b)) = parse_span(s) {
            if u32::from(a) > u32::from(b) {
                return Err(ConfigError::range(input, format!("start {a} is after end {b}")));
            }
            Self::Span { start: a, end: b }
        } else {
            Self::Octets(parse_octet_bounds(input, s)?)
        };

        let len = range.len();
        if len > MAX_ADDRESSES {
            return Err(ConfigError::RangeTooLarge {
                input: input.to_string(),
                len,
                max: MAX_ADDRESSES,
            });
        }
        Ok(range)
    }

    /// Number of addresses the range yields.
    pub fn len(&self) -> u64 {
        match self {
            Self::Cidr(net) => {
                let total = 1u64 << (32 - u32::from(net.prefix_len()));
                if net.prefix_len() >= 31 {
                    total
                } else {
                    total - 2
                }
            }
            Self::Octets(bounds) => bounds
                .iter()
                .map(|&(lo, hi)| u64::from(hi - lo) + 1)
                .product(),
            Self::Span { start, end } => u64::from(u32::from(*end) - u32::from(*start)) + 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address at position `index` in enumeration order.
    pub fn get(&self, index: u64) -> Option<Address> {
        if index >= self.len() {
            return None;
        }
        let addr = match self {
            Self::Cidr(net) => {
                let skip = u64::from(net.prefix_len() < 31);
                let n = u64::from(u32::from(net.network())) + skip + index;
                Ipv4Addr::from(n as u32)
            }
            Self::Octets(bounds) => {
                let mut rem = index;
                let mut octets = [0u8; 4];
                for (slot, &(lo, hi)) in octets.iter_mut().zip(bounds.iter()).rev() {
                    let width = u64::from(hi - lo) + 1;
                    *slot = lo + (rem % width) as u8;
                    rem /= width;
                }
                Ipv4Addr::from(octets)
            }
            Self::Span { start, .. } => Ipv4Addr::from(u32::from(*start) + index as u32),
        };
        Some(addr)
    }

    /// Lazy iterator over the range. Each call starts from the beginning.
    pub fn iter(&self) -> AddressIter {
        AddressIter {
            range: *self,
            next: 0,
            len: self.len(),
        }
    }

    /// The /24 around the first local non-loopback IPv4 interface.
    pub fn local_default() -> Result<Self> {
        match detect_local_cidrs()?.into_iter().next() {
            Some(net) => Ok(Self::Cidr(net)),
            None => bail!("no local IPv4 network detected"),
        }
    }
}

impl FromStr for AddressRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cidr(net) => write!(f, "{net}"),
            Self::Octets(bounds) => {
                let fields: Vec<String> = bounds
                    .iter()
                    .map(|&(lo, hi)| {
                        if lo == hi {
                            lo.to_string()
                        } else {
                            format!("{lo}-{hi}")
                        }
                    })
                    .collect();
                write!(f, "{}", fields.join("."))
            }
            Self::Span { start, end } if start == end => write!(f, "{start}"),
            Self::Span { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

impl<'a> IntoIterator for &'a AddressRange {
    type Item = Address;
    type IntoIter = AddressIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct AddressIter {
    range: AddressRange,
    next: u64,
    len: u64,
}

impl Iterator for AddressIter {
    type Item = Address;

    fn next(&mut self) -> Option<Self::Item> {
        let addr = self.range.get(self.next)?;
        self.next += 1;
        Some(addr)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.len - self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for AddressIter {}

/// `a.b.c.d-e.f.g.h` or a bare `a.b.c.d`.
fn parse_span(s: &str) -> Option<(Ipv4Addr, Ipv4Addr)> {
    if let Ok(single) = s.parse::<Ipv4Addr>() {
        return Some((single, single));
    }
    let (a, b) = s.split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

fn parse_octet_bounds(input: &str, s: &str) -> Result<[(u8, u8); 4], ConfigError> {
    let fields: Vec<&str> = s.split('.').collect();
    if fields.len() != 4 {
        return Err(ConfigError::range(
            input,
            format!("expected 4 octet fields, found {}", fields.len()),
        ));
    }

    let mut bounds = [(0u8, 0u8); 4];
    for (slot, field) in bounds.iter_mut().zip(fields) {
        let field = field.trim();
        let (lo, hi) = match field.split_once('-') {
            Some((a, b)) => (parse_octet(input, a)?, parse_octet(input, b)?),
            None => {
                let v = parse_octet(input, field)?;
                (v, v)
            }
        };
        if lo > hi {
            return Err(ConfigError::range(
                input,
                format!("octet range {lo}-{hi} has start > end"),
            ));
        }
        *slot = (lo, hi);
    }
    Ok(bounds)
}

fn parse_octet(input: &str, s: &str) -> Result<u8, ConfigError> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ConfigError::range(input, format!("not an octet: `{s}`")));
    }
    s.parse::<u8>()
        .map_err(|_| ConfigError::range(input, format!("octet out of range: `{s}`")))
}

/// Detect local non-loopback IPv4 addresses and widen each to its /24.
///
/// Duplicates are removed and the result is sorted.
pub fn detect_local_cidrs() -> Result<Vec<Ipv4Net>> {
    let mut set = BTreeSet::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            set.insert(ipv4_to_default_cidr(v4.ip));
        }
    }
    Ok(set.into_iter().collect())
}

pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    Ipv4Net::new(Ipv4Addr::new(o[0], o[1], o[2], 0), 24).expect("/24 is always valid")
}
