//! Control message wire format.
//!
//! Every record is a fixed 56-byte block followed by an optional capability
//! blob:
//!
//! ```text
//!  0        4        8                                      56
//!  +--------+--------+--------------------------------------+--------....
//!  |  tag   | bloblen|           payload (48 bytes)         |  blob
//!  +--------+--------+--------------------------------------+--------....
//! ```
//!
//! All integers are big-endian. Most kinds use the address payload
//! (`mac[6] atm[20] flag:u32 targetless:u32 no_source:u32`), the
//! configuration record has its own layout.

use crate::config::ConfigMessage;
use crate::error::{LecError, Result};
use crate::types::{ATM_ESA_LEN, AtmAddress, LaneVersion, MacAddress};
use byteorder::{BigEndian, ByteOrder};

pub const HEADER_LEN: usize = 8;
pub const PAYLOAD_LEN: usize = 48;
/// Size of the fixed part of every record
pub const MESSAGE_LEN: usize = HEADER_LEN + PAYLOAD_LEN;
/// Upper bound on capability blobs accepted from the wire
pub const MAX_TLV_LEN: usize = 4096;

const OFF_MAC: usize = 0;
const OFF_ATM: usize = 6;
const OFF_FLAG: usize = OFF_ATM + ATM_ESA_LEN;
const OFF_TARGETLESS: usize = OFF_FLAG + 4;
const OFF_NO_SOURCE: usize = OFF_TARGETLESS + 4;

const FLAG_REMOTE: u32 = 0x1;
const FLAG_PERMANENT: u32 = 0x2;

mod tag {
    pub const SET_MAC_ADDR: u32 = 0;
    pub const DEL_MAC_ADDR: u32 = 1;
    pub const SVC_SETUP: u32 = 2;
    pub const ADDR_DELETE: u32 = 3;
    pub const TOPOLOGY_CHANGE: u32 = 4;
    pub const FLUSH_COMPLETE: u32 = 5;
    pub const ARP_UPDATE: u32 = 6;
    pub const NARP_REQ: u32 = 7;
    pub const CONFIG: u32 = 8;
    pub const FLUSH_TRAN_ID: u32 = 9;
    pub const SET_LECID: u32 = 10;
    pub const ARP_XMT: u32 = 11;
    pub const RDESC_ARP_XMT: u32 = 12;
    pub const ASSOCIATE_REQ: u32 = 13;
    pub const SHOULD_BRIDGE: u32 = 14;
    pub const FLUSH_XMT: u32 = 15;
    pub const ASSOCIATE_IND: u32 = 16;
}

/// LE_ARP response (or unsolicited update) from the LE service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpUpdate {
    pub mac: MacAddress,
    pub atm: AtmAddress,
    /// Binding belongs to a client behind a proxy
    pub remote: bool,
    /// LANE2 targetless LE_ARP: no request of ours triggered it
    pub targetless: bool,
    /// Operator-configured binding
    pub permanent: bool,
    /// Capability blob of the target
    pub tlvs: Vec<u8>,
}

impl ArpUpdate {
    pub fn new(mac: MacAddress, atm: AtmAddress) -> Self {
        Self {
            mac,
            atm,
            remote: false,
            targetless: false,
            permanent: false,
            tlvs: Vec::new(),
        }
    }
}

/// Messages exchanged with the LE service daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LecMessage {
    SetMacAddress(MacAddress),
    DeleteMacAddress(MacAddress),
    /// Ask the LE service to open a data direct circuit
    SvcSetup { mac: MacAddress, atm: AtmAddress },
    AddressDelete { atm: AtmAddress, permanent: bool },
    TopologyChange(bool),
    FlushComplete { tran_id: u32 },
    ArpUpdate(ArpUpdate),
    /// LANE2 negative LE_ARP
    NarpRequest { update: ArpUpdate, no_source: bool },
    Config(ConfigMessage),
    FlushTransactionId { atm: AtmAddress, tran_id: u32 },
    SetLecId(u16),
    /// LE_ARP request; `None` target is a targetless request
    ArpRequest {
        target: Option<MacAddress>,
        tlvs: Vec<u8>,
    },
    /// LE_ARP request for a route descriptor
    RouteDescriptorArpRequest { target: MacAddress },
    AssociateRequest { tlvs: Vec<u8> },
    ShouldBridge { mac: MacAddress },
    FlushRequest { atm: AtmAddress },
    AssociateIndication { mac: MacAddress, tlvs: Vec<u8> },
}

impl LecMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            LecMessage::SetMacAddress(_) => "set_mac_addr",
            LecMessage::DeleteMacAddress(_) => "del_mac_addr",
            LecMessage::SvcSetup { .. } => "svc_setup",
            LecMessage::AddressDelete { .. } => "addr_delete",
            LecMessage::TopologyChange(_) => "topology_change",
            LecMessage::FlushComplete { .. } => "flush_complete",
            LecMessage::ArpUpdate(_) => "arp_update",
            LecMessage::NarpRequest { .. } => "narp_req",
            LecMessage::Config(_) => "config",
            LecMessage::FlushTransactionId { .. } => "flush_tran_id",
            LecMessage::SetLecId(_) => "set_lecid",
            LecMessage::ArpRequest { .. } => "arp_xmt",
            LecMessage::RouteDescriptorArpRequest { .. } => "rdesc_arp_xmt",
            LecMessage::AssociateRequest { .. } => "associate_req",
            LecMessage::ShouldBridge { .. } => "should_bridge",
            LecMessage::FlushRequest { .. } => "flush_xmt",
            LecMessage::AssociateIndication { .. } => "associate_ind",
        }
    }

    fn tag(&self) -> u32 {
        match self {
            LecMessage::SetMacAddress(_) => tag::SET_MAC_ADDR,
            LecMessage::DeleteMacAddress(_) => tag::DEL_MAC_ADDR,
            LecMessage::SvcSetup { .. } => tag::SVC_SETUP,
            LecMessage::AddressDelete { .. } => tag::ADDR_DELETE,
            LecMessage::TopologyChange(_) => tag::TOPOLOGY_CHANGE,
            LecMessage::FlushComplete { .. } => tag::FLUSH_COMPLETE,
            LecMessage::ArpUpdate(_) => tag::ARP_UPDATE,
            LecMessage::NarpRequest { .. } => tag::NARP_REQ,
            LecMessage::Config(_) => tag::CONFIG,
            LecMessage::FlushTransactionId { .. } => tag::FLUSH_TRAN_ID,
            LecMessage::SetLecId(_) => tag::SET_LECID,
            LecMessage::ArpRequest { .. } => tag::ARP_XMT,
            LecMessage::RouteDescriptorArpRequest { .. } => tag::RDESC_ARP_XMT,
            LecMessage::AssociateRequest { .. } => tag::ASSOCIATE_REQ,
            LecMessage::ShouldBridge { .. } => tag::SHOULD_BRIDGE,
            LecMessage::FlushRequest { .. } => tag::FLUSH_XMT,
            LecMessage::AssociateIndication { .. } => tag::ASSOCIATE_IND,
        }
    }

    fn tlvs(&self) -> &[u8] {
        match self {
            LecMessage::ArpUpdate(update) => &update.tlvs,
            LecMessage::NarpRequest { update, .. } => &update.tlvs,
            LecMessage::ArpRequest { tlvs, .. }
            | LecMessage::AssociateRequest { tlvs }
            | LecMessage::AssociateIndication { tlvs, .. } => tlvs,
            _ => &[],
        }
    }
}

/// Address payload shared by most message kinds.
#[derive(Default)]
struct AddrPayload {
    mac: MacAddress,
    atm: AtmAddress,
    flag: u32,
    targetless: u32,
    no_source: u32,
}

impl AddrPayload {
    fn write(&self, out: &mut [u8; PAYLOAD_LEN]) {
        out[OFF_MAC..OFF_MAC + 6].copy_from_slice(self.mac.as_bytes());
        out[OFF_ATM..OFF_ATM + ATM_ESA_LEN].copy_from_slice(&self.atm.0);
        BigEndian::write_u32(&mut out[OFF_FLAG..], self.flag);
        BigEndian::write_u32(&mut out[OFF_TARGETLESS..], self.targetless);
        BigEndian::write_u32(&mut out[OFF_NO_SOURCE..], self.no_source);
    }

    fn read(p: &[u8]) -> Self {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&p[OFF_MAC..OFF_MAC + 6]);
        let mut atm = [0u8; ATM_ESA_LEN];
        atm.copy_from_slice(&p[OFF_ATM..OFF_ATM + ATM_ESA_LEN]);
        Self {
            mac: MacAddress::new(mac),
            atm: AtmAddress(atm),
            flag: BigEndian::read_u32(&p[OFF_FLAG..]),
            targetless: BigEndian::read_u32(&p[OFF_TARGETLESS..]),
            no_source: BigEndian::read_u32(&p[OFF_NO_SOURCE..]),
        }
    }
}

fn update_payload(update: &ArpUpdate, no_source: bool) -> AddrPayload {
    let mut flag = 0;
    if update.remote {
        flag |= FLAG_REMOTE;
    }
    if update.permanent {
        flag |= FLAG_PERMANENT;
    }
    AddrPayload {
        mac: update.mac,
        atm: update.atm,
        flag,
        targetless: update.targetless.into(),
        no_source: no_source.into(),
    }
}

fn update_from(p: &AddrPayload, tlvs: Vec<u8>) -> ArpUpdate {
    ArpUpdate {
        mac: p.mac,
        atm: p.atm,
        remote: p.flag & FLAG_REMOTE != 0,
        targetless: p.targetless != 0,
        permanent: p.flag & FLAG_PERMANENT != 0,
        tlvs,
    }
}

fn write_config(msg: &ConfigMessage, out: &mut [u8; PAYLOAD_LEN]) {
    BigEndian::write_u32(&mut out[0..], msg.maximum_unknown_frame_count);
    BigEndian::write_u32(&mut out[4..], msg.max_unknown_frame_time);
    BigEndian::write_u16(&mut out[8..], msg.max_retry_count);
    BigEndian::write_u32(&mut out[12..], msg.aging_time);
    BigEndian::write_u32(&mut out[16..], msg.forward_delay_time);
    BigEndian::write_u32(&mut out[20..], msg.arp_response_time);
    BigEndian::write_u32(&mut out[24..], msg.flush_timeout);
    BigEndian::write_u32(&mut out[28..], msg.path_switching_delay);
    BigEndian::write_u32(&mut out[32..], msg.lane_version.as_u32());
    BigEndian::write_u32(&mut out[36..], msg.mtu);
    BigEndian::write_u32(&mut out[40..], msg.is_proxy.into());
}

fn read_config(p: &[u8]) -> Result<ConfigMessage> {
    let version = BigEndian::read_u32(&p[32..]);
    let lane_version = LaneVersion::from_u32(version)
        .ok_or_else(|| LecError::Codec(format!("unsupported LANE version {}", version)))?;
    Ok(ConfigMessage {
        maximum_unknown_frame_count: BigEndian::read_u32(&p[0..]),
        max_unknown_frame_time: BigEndian::read_u32(&p[4..]),
        max_retry_count: BigEndian::read_u16(&p[8..]),
        aging_time: BigEndian::read_u32(&p[12..]),
        forward_delay_time: BigEndian::read_u32(&p[16..]),
        arp_response_time: BigEndian::read_u32(&p[20..]),
        flush_timeout: BigEndian::read_u32(&p[24..]),
        path_switching_delay: BigEndian::read_u32(&p[28..]),
        lane_version,
        mtu: BigEndian::read_u32(&p[36..]),
        is_proxy: BigEndian::read_u32(&p[40..]) != 0,
    })
}

/// Serialize one message.
pub fn encode(msg: &LecMessage) -> Result<Vec<u8>> {
    let tlvs = msg.tlvs();
    if tlvs.len() > MAX_TLV_LEN {
        return Err(LecError::Codec(format!(
            "capability blob of {} bytes exceeds {}",
            tlvs.len(),
            MAX_TLV_LEN
        )));
    }

    let mut payload = [0u8; PAYLOAD_LEN];
    match msg {
        LecMessage::Config(config) => write_config(config, &mut payload),
        LecMessage::SetLecId(id) => BigEndian::write_u32(&mut payload[OFF_FLAG..], (*id).into()),
        LecMessage::TopologyChange(on) => {
            BigEndian::write_u32(&mut payload[OFF_FLAG..], (*on).into())
        }
        LecMessage::FlushComplete { tran_id } => {
            BigEndian::write_u32(&mut payload[OFF_FLAG..], *tran_id)
        }
        other => addr_payload(other).write(&mut payload),
    }

    let mut out = Vec::with_capacity(MESSAGE_LEN + tlvs.len());
    let mut header = [0u8; HEADER_LEN];
    BigEndian::write_u32(&mut header[0..], msg.tag());
    // bounded by MAX_TLV_LEN above
    BigEndian::write_u32(&mut header[4..], tlvs.len() as u32);
    out.extend_from_slice(&header);
    out.extend_from_slice(&payload);
    out.extend_from_slice(tlvs);
    Ok(out)
}

fn addr_payload(msg: &LecMessage) -> AddrPayload {
    match msg {
        LecMessage::SetMacAddress(mac)
        | LecMessage::DeleteMacAddress(mac)
        | LecMessage::RouteDescriptorArpRequest { target: mac }
        | LecMessage::ShouldBridge { mac }
        | LecMessage::AssociateIndication { mac, .. } => AddrPayload {
            mac: *mac,
            ..Default::default()
        },
        LecMessage::SvcSetup { mac, atm } => AddrPayload {
            mac: *mac,
            atm: *atm,
            ..Default::default()
        },
        LecMessage::AddressDelete { atm, permanent } => AddrPayload {
            atm: *atm,
            flag: (*permanent).into(),
            ..Default::default()
        },
        LecMessage::FlushTransactionId { atm, tran_id } => AddrPayload {
            atm: *atm,
            flag: *tran_id,
            ..Default::default()
        },
        LecMessage::FlushRequest { atm } => AddrPayload {
            atm: *atm,
            ..Default::default()
        },
        LecMessage::ArpUpdate(update) => update_payload(update, false),
        LecMessage::NarpRequest { update, no_source } => update_payload(update, *no_source),
        LecMessage::ArpRequest { target, .. } => AddrPayload {
            mac: target.unwrap_or(MacAddress::ZERO),
            targetless: target.is_none().into(),
            ..Default::default()
        },
        LecMessage::AssociateRequest { .. }
        | LecMessage::Config(_)
        | LecMessage::SetLecId(_)
        | LecMessage::TopologyChange(_)
        | LecMessage::FlushComplete { .. } => AddrPayload::default(),
    }
}

/// Decode one message from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete record,
/// otherwise the message and the number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<Option<(LecMessage, usize)>> {
    if buf.len() < MESSAGE_LEN {
        return Ok(None);
    }
    let tag = BigEndian::read_u32(&buf[0..]);
    let tlv_len = BigEndian::read_u32(&buf[4..]) as usize;
    if tlv_len > MAX_TLV_LEN {
        return Err(LecError::Codec(format!(
            "capability blob of {} bytes exceeds {}",
            tlv_len, MAX_TLV_LEN
        )));
    }
    let total = MESSAGE_LEN + tlv_len;
    if buf.len() < total {
        return Ok(None);
    }

    let p = &buf[HEADER_LEN..MESSAGE_LEN];
    let tlvs = buf[MESSAGE_LEN..total].to_vec();
    let addr = AddrPayload::read(p);

    let takes_tlvs = matches!(
        tag,
        tag::ARP_UPDATE | tag::NARP_REQ | tag::ARP_XMT | tag::ASSOCIATE_REQ | tag::ASSOCIATE_IND
    );
    if !takes_tlvs && !tlvs.is_empty() {
        return Err(LecError::Codec(format!(
            "message tag {} does not carry a capability blob",
            tag
        )));
    }

    let msg = match tag {
        tag::SET_MAC_ADDR => LecMessage::SetMacAddress(addr.mac),
        tag::DEL_MAC_ADDR => LecMessage::DeleteMacAddress(addr.mac),
        tag::SVC_SETUP => LecMessage::SvcSetup {
            mac: addr.mac,
            atm: addr.atm,
        },
        tag::ADDR_DELETE => LecMessage::AddressDelete {
            atm: addr.atm,
            permanent: addr.flag != 0,
        },
        tag::TOPOLOGY_CHANGE => LecMessage::TopologyChange(addr.flag != 0),
        tag::FLUSH_COMPLETE => LecMessage::FlushComplete { tran_id: addr.flag },
        tag::ARP_UPDATE => LecMessage::ArpUpdate(update_from(&addr, tlvs)),
        tag::NARP_REQ => LecMessage::NarpRequest {
            no_source: addr.no_source != 0,
            update: update_from(&addr, tlvs),
        },
        tag::CONFIG => LecMessage::Config(read_config(p)?),
        tag::FLUSH_TRAN_ID => LecMessage::FlushTransactionId {
            atm: addr.atm,
            tran_id: addr.flag,
        },
        tag::SET_LECID => {
            let id = u16::try_from(addr.flag)
                .map_err(|_| LecError::Codec(format!("LECID {} out of range", addr.flag)))?;
            LecMessage::SetLecId(id)
        }
        tag::ARP_XMT => LecMessage::ArpRequest {
            target: (addr.targetless == 0).then_some(addr.mac),
            tlvs,
        },
        tag::RDESC_ARP_XMT => LecMessage::RouteDescriptorArpRequest { target: addr.mac },
        tag::ASSOCIATE_REQ => LecMessage::AssociateRequest { tlvs },
        tag::SHOULD_BRIDGE => LecMessage::ShouldBridge { mac: addr.mac },
        tag::FLUSH_XMT => LecMessage::FlushRequest { atm: addr.atm },
        tag::ASSOCIATE_IND => LecMessage::AssociateIndication {
            mac: addr.mac,
            tlvs,
        },
        other => return Err(LecError::Codec(format!("unknown message tag {}", other))),
    };
    Ok(Some((msg, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LecConfig;
    use pretty_assertions::assert_eq;

    fn atm(last: u8) -> AtmAddress {
        let mut a = [0u8; ATM_ESA_LEN];
        a[0] = 0x47;
        a[ATM_ESA_LEN - 1] = last;
        AtmAddress(a)
    }

    #[test]
    fn test_arp_update_layout() {
        let mut update = ArpUpdate::new(MacAddress([2, 0, 0, 0, 0, 9]), atm(9));
        update.remote = true;
        update.tlvs = vec![0xde, 0xad];

        let bytes = encode(&LecMessage::ArpUpdate(update.clone())).unwrap();
        assert_eq!(bytes.len(), MESSAGE_LEN + 2);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 6]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]);
        assert_eq!(&bytes[8..14], &[2, 0, 0, 0, 0, 9]);
        assert_eq!(&bytes[MESSAGE_LEN..], &[0xde, 0xad]);

        let (decoded, used) = decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, LecMessage::ArpUpdate(update));
    }

    #[test]
    fn test_config_message() {
        let mut config = ConfigMessage::from(&LecConfig::default());
        config.lane_version = LaneVersion::V2;
        config.max_retry_count = 3;

        let bytes = encode(&LecMessage::Config(config)).unwrap();
        assert_eq!(bytes.len(), MESSAGE_LEN);
        let (decoded, _) = decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, LecMessage::Config(config));
    }

    #[test]
    fn test_targetless_arp_request() {
        let msg = LecMessage::ArpRequest {
            target: None,
            tlvs: Vec::new(),
        };
        let bytes = encode(&msg).unwrap();
        let (decoded, _) = decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_partial_buffer_needs_more() {
        let msg = LecMessage::AssociateRequest {
            tlvs: vec![1, 2, 3, 4],
        };
        let bytes = encode(&msg).unwrap();
        assert!(decode(&bytes[..MESSAGE_LEN - 1]).unwrap().is_none());
        assert!(decode(&bytes[..MESSAGE_LEN + 2]).unwrap().is_none());
        assert!(decode(&bytes).unwrap().is_some());
    }

    #[test]
    fn test_stream_of_messages() {
        let mut stream = encode(&LecMessage::SetLecId(7)).unwrap();
        stream.extend(encode(&LecMessage::FlushComplete { tran_id: 42 }).unwrap());

        let (first, used) = decode(&stream).unwrap().unwrap();
        assert_eq!(first, LecMessage::SetLecId(7));
        let (second, _) = decode(&stream[used..]).unwrap().unwrap();
        assert_eq!(second, LecMessage::FlushComplete { tran_id: 42 });
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut bytes = encode(&LecMessage::TopologyChange(true)).unwrap();
        bytes[3] = 99;
        assert!(decode(&bytes).is_err());

        let mut bytes = encode(&LecMessage::TopologyChange(true)).unwrap();
        bytes[7] = 1;
        bytes.push(0);
        assert!(decode(&bytes).is_err());

        let mut config = encode(&LecMessage::Config(ConfigMessage::from(&LecConfig::default())))
            .unwrap();
        config[HEADER_LEN + 35] = 7;
        assert!(decode(&config).is_err());

        let oversized = LecMessage::AssociateRequest {
            tlvs: vec![0; MAX_TLV_LEN + 1],
        };
        assert!(encode(&oversized).is_err());
    }
}
