//! Core types for the LAN emulation ARP cache.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LecError;

/// IEEE 802 MAC address.
///
/// # Examples
///
/// ```
/// use sonic_lecd::MacAddress;
///
/// let mac: MacAddress = "02:00:00:00:10:01".parse().unwrap();
/// assert_eq!(mac, "02-00-00-00-10-01".parse::<MacAddress>().unwrap());
/// assert!(mac.is_unicast());
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The broadcast MAC address, always served by the BUS.
    pub const BROADCAST: MacAddress = MacAddress([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);

    /// The zero MAC address, placeholder for entries whose MAC is not yet learned.
    pub const ZERO: MacAddress = MacAddress([0, 0, 0, 0, 0, 0]);

    /// Creates a new MAC address from raw bytes.
    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    /// Returns the raw bytes of the MAC address.
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Returns true if the group bit is set (multicast or broadcast).
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Returns true if this is a unicast address.
    pub const fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    /// Returns true if this is the broadcast address.
    pub const fn is_broadcast(&self) -> bool {
        self.0[0] == 0xff && self.0[1] == 0xff && self.0[2] == 0xff
            && self.0[3] == 0xff && self.0[4] == 0xff && self.0[5] == 0xff
    }

    /// Returns true if this is the zero address.
    pub const fn is_zero(&self) -> bool {
        self.0[0] == 0 && self.0[1] == 0 && self.0[2] == 0
            && self.0[3] == 0 && self.0[4] == 0 && self.0[5] == 0
    }

    /// Parse from a colon or hyphen separated string.
    pub fn parse(s: &str) -> Option<Self> {
        let separator = if s.contains(':') { ':' } else { '-' };
        let parts: Vec<&str> = s.split(separator).collect();
        if parts.len() != 6 {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

impl From<MacAddress> for [u8; 6] {
    fn from(mac: MacAddress) -> [u8; 6] {
        mac.0
    }
}

impl FromStr for MacAddress {
    type Err = LecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| LecError::invalid_address("MAC", s))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Length of an ATM end system address (NSAP format).
pub const ATM_ESA_LEN: usize = 20;

/// 20-byte ATM end system address.
///
/// Ordering is the numeric (big-endian byte-wise) comparison used by the
/// simultaneous-setup tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AtmAddress(pub [u8; ATM_ESA_LEN]);

impl AtmAddress {
    pub const ZERO: Self = Self([0; ATM_ESA_LEN]);

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO.0
    }

    /// Parse from 40 hex digits, dots allowed as separators.
    pub fn parse(s: &str) -> Option<Self> {
        let digits: Vec<u8> = s.bytes().filter(|b| *b != b'.').collect();
        if digits.len() != ATM_ESA_LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; ATM_ESA_LEN];
        for (i, pair) in digits.chunks(2).enumerate() {
            let hex = std::str::from_utf8(pair).ok()?;
            bytes[i] = u8::from_str_radix(hex, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl Default for AtmAddress {
    fn default() -> Self {
        Self::ZERO
    }
}

impl FromStr for AtmAddress {
    type Err = LecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| LecError::invalid_address("ATM", s))
    }
}

impl fmt::Display for AtmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Virtual circuit identifier (VPI/VCI pair) on the ATM substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitId {
    pub vpi: u16,
    pub vci: u16,
}

impl CircuitId {
    pub const fn new(vpi: u16, vci: u16) -> Self {
        Self { vpi, vci }
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.vpi, self.vci)
    }
}

/// Resolution state of a cache entry.
///
/// Declaration order is the protocol order; an entry only moves forward
/// (see [`EntryStatus::can_advance_to`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Freshly created, nothing sent yet
    Unknown,
    /// LE_ARP request outstanding
    ArpPending,
    /// ATM address known, data direct circuit being set up
    VcPending,
    /// Circuit ready, waiting for flooded frames to drain
    FlushPending,
    /// Frames go out on the data direct circuit
    ForwardDirect,
}

impl EntryStatus {
    /// Returns true if `next` is a legal successor of `self`.
    ///
    /// `Unknown -> ForwardDirect` covers circuits opened by the peer whose
    /// MAC address is learned after the fact.
    pub fn can_advance_to(self, next: EntryStatus) -> bool {
        use EntryStatus::*;
        matches!(
            (self, next),
            (Unknown, ArpPending)
                | (Unknown, VcPending)
                | (Unknown, ForwardDirect)
                | (ArpPending, ArpPending)
                | (ArpPending, VcPending)
                | (VcPending, FlushPending)
                | (VcPending, ForwardDirect)
                | (FlushPending, ForwardDirect)
        )
    }

    /// A data direct circuit is attached (flush pending or forwarding).
    #[inline]
    pub fn has_circuit(self) -> bool {
        matches!(self, EntryStatus::FlushPending | EntryStatus::ForwardDirect)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Unknown => "unknown",
            EntryStatus::ArpPending => "arp-pending",
            EntryStatus::VcPending => "vc-pending",
            EntryStatus::FlushPending => "flush-pending",
            EntryStatus::ForwardDirect => "forward-direct",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFlags {
    /// Never aged out, survives circuit close
    pub permanent: bool,
    /// Binding learned from a remote (proxied) client
    pub remote: bool,
}

/// LAN emulation protocol version negotiated with the LES.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneVersion {
    #[default]
    V1,
    V2,
}

impl LaneVersion {
    pub fn as_u32(self) -> u32 {
        match self {
            LaneVersion::V1 => 1,
            LaneVersion::V2 => 2,
        }
    }

    /// Version 0 is what an unconfigured LES reports; it behaves as LANEv1.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 | 1 => Some(LaneVersion::V1),
            2 => Some(LaneVersion::V2),
            _ => None,
        }
    }
}

/// Length of the LE data frame header (LECID) preceding the 802.3 header.
pub const LEC_HEADER_LEN: usize = 2;
const ETH_HEADER_LEN: usize = 14;

/// LAN emulation data frame: 2-byte LECID followed by an 802.3 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Wrap raw bytes; header fields are validated lazily by the accessors.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Build a frame from its header fields and payload.
    pub fn build(
        lec_id: u16,
        dst: MacAddress,
        src: MacAddress,
        ethertype: u16,
        payload: &[u8],
    ) -> Self {
        let mut bytes = Vec::with_capacity(LEC_HEADER_LEN + ETH_HEADER_LEN + payload.len());
        bytes.extend_from_slice(&lec_id.to_be_bytes());
        bytes.extend_from_slice(&dst.0);
        bytes.extend_from_slice(&src.0);
        bytes.extend_from_slice(&ethertype.to_be_bytes());
        bytes.extend_from_slice(payload);
        Self { bytes }
    }

    pub fn lec_id(&self) -> Option<u16> {
        let b = self.bytes.get(..LEC_HEADER_LEN)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn destination(&self) -> Option<MacAddress> {
        self.mac_at(LEC_HEADER_LEN)
    }

    pub fn source(&self) -> Option<MacAddress> {
        self.mac_at(LEC_HEADER_LEN + 6)
    }

    fn mac_at(&self, offset: usize) -> Option<MacAddress> {
        let b = self.bytes.get(offset..offset + 6)?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(b);
        Some(MacAddress::new(mac))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
