//! Decoding of `RTM_*` link, address and route messages into updates.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::attr::{AttrIter, get};
use super::message::{NlMsgHdr, NlMsgType};
use crate::update::{
    AddrUpdate, DeviceType, LinkUpdate, OperState, Route, RouteUpdate, TopologyUpdate, UpdateKind,
};
use crate::{Error, Result};

/// `ifi_change` value the kernel uses when it announces a whole link.
pub const IFI_CHANGE_FULL: u32 = 0xFFFF_FFFF;

/// Main routing table id.
pub const RT_TABLE_MAIN: u8 = 254;

const RTM_F_CLONED: u32 = 0x200;

/// Link attributes.
pub mod ifla {
    pub const IFNAME: u16 = 3;
    pub const LINK: u16 = 5;
    pub const MASTER: u16 = 10;
    pub const OPERSTATE: u16 = 16;
    pub const LINKINFO: u16 = 18;
    pub const LINK_NETNSID: u16 = 37;

    /// Nested inside `LINKINFO`.
    pub const INFO_KIND: u16 = 1;
}

/// Address attributes.
pub mod ifa {
    pub const ADDRESS: u16 = 1;
    pub const LOCAL: u16 = 2;
}

/// Route attributes.
pub mod rta {
    pub const DST: u16 = 1;
    pub const SRC: u16 = 2;
    pub const GATEWAY: u16 = 5;
    pub const PREFSRC: u16 = 7;
    pub const TABLE: u16 = 15;
}

/// Interface info message (struct ifinfomsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfInfoMsg {
    pub ifi_family: u8,
    pub ifi_pad: u8,
    pub ifi_type: u16,
    pub ifi_index: i32,
    pub ifi_flags: u32,
    pub ifi_change: u32,
}

/// Interface address message (struct ifaddrmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfAddrMsg {
    pub ifa_family: u8,
    pub ifa_prefixlen: u8,
    pub ifa_flags: u8,
    pub ifa_scope: u8,
    pub ifa_index: u32,
}

/// Route message (struct rtmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RtMsg {
    pub rtm_family: u8,
    pub rtm_dst_len: u8,
    pub rtm_src_len: u8,
    pub rtm_tos: u8,
    pub rtm_table: u8,
    pub rtm_protocol: u8,
    pub rtm_scope: u8,
    pub rtm_type: u8,
    pub rtm_flags: u32,
}

fn header<T: FromBytes + KnownLayout + Immutable>(payload: &[u8]) -> Result<(&T, &[u8])> {
    T::ref_from_prefix(payload).map_err(|_| Error::Truncated {
        expected: std::mem::size_of::<T>(),
        actual: payload.len(),
    })
}

fn update_kind(msg_type: u16, new: u16, del: u16) -> Result<UpdateKind> {
    match msg_type {
        t if t == new => Ok(UpdateKind::New),
        t if t == del => Ok(UpdateKind::Delete),
        other => Err(Error::InvalidMessage(format!("unexpected message type {other}"))),
    }
}

/// Decode an `RTM_NEWLINK`/`RTM_DELLINK` payload.
///
/// A message is a full update when the kernel flags every field as changed.
/// Bridge-family deletes are port releases and are never full, whatever
/// their change mask says.
pub fn parse_link(msg_type: u16, payload: &[u8]) -> Result<LinkUpdate> {
    let kind = update_kind(msg_type, NlMsgType::RTM_NEWLINK, NlMsgType::RTM_DELLINK)?;
    let (ifi, attrs) = header::<IfInfoMsg>(payload)?;
    let index = ifi.ifi_index as u32;

    let bridge_release = kind == UpdateKind::Delete && ifi.ifi_family == libc::AF_BRIDGE as u8;
    let mut update = LinkUpdate {
        kind,
        index,
        master: None,
        name: String::new(),
        device_type: DeviceType::Other,
        flags: ifi.ifi_flags,
        oper_state: OperState::default(),
        full: ifi.ifi_change == IFI_CHANGE_FULL && !bridge_release,
        peer_index: None,
        peer_netnsid: None,
    };

    for (attr_type, data) in AttrIter::new(attrs) {
        match attr_type {
            ifla::IFNAME => update.name = get::string(data)?.to_string(),
            ifla::MASTER => update.master = Some(get::u32_ne(data)?).filter(|&m| m != 0),
            ifla::OPERSTATE => update.oper_state = OperState::from_kernel(get::u8(data)?),
            ifla::LINK => {
                let link = get::u32_ne(data)?;
                if link != 0 && link != index {
                    update.peer_index = Some(link);
                }
            }
            ifla::LINK_NETNSID => update.peer_netnsid = Some(get::i32_ne(data)?),
            ifla::LINKINFO => {
                for (info_type, info) in AttrIter::new(data) {
                    if info_type == ifla::INFO_KIND {
                        update.device_type = DeviceType::from(get::string(info)?);
                    }
                }
            }
            _ => {}
        }
    }

    // Lower links of vlans and macvlans are not peers.
    if update.device_type != DeviceType::Veth {
        update.peer_index = None;
        update.peer_netnsid = None;
    }

    Ok(update)
}

/// Decode an `RTM_NEWADDR`/`RTM_DELADDR` payload.
pub fn parse_address(msg_type: u16, payload: &[u8]) -> Result<AddrUpdate> {
    let kind = update_kind(msg_type, NlMsgType::RTM_NEWADDR, NlMsgType::RTM_DELADDR)?;
    let (hdr, attrs) = header::<IfAddrMsg>(payload)?;

    let mut address = None;
    let mut local = None;
    for (attr_type, data) in AttrIter::new(attrs) {
        match attr_type {
            ifa::ADDRESS => address = Some(ip_addr(hdr.ifa_family, data)?),
            ifa::LOCAL => local = Some(ip_addr(hdr.ifa_family, data)?),
            _ => {}
        }
    }

    // On point-to-point links IFA_ADDRESS is the remote end.
    let ip = local
        .or(address)
        .ok_or_else(|| Error::InvalidMessage(format!("address on {} has no IP", hdr.ifa_index)))?;
    let net = IpNet::new(ip, hdr.ifa_prefixlen)
        .map_err(|e| Error::InvalidMessage(format!("bad prefix length: {e}")))?;

    Ok(AddrUpdate::new(kind, hdr.ifa_index, net))
}

/// Decode an `RTM_NEWROUTE`/`RTM_DELROUTE` payload.
///
/// Returns `None` for routes outside the main table and for cloned cache
/// entries.
pub fn parse_route(msg_type: u16, payload: &[u8]) -> Result<Option<RouteUpdate>> {
    let kind = update_kind(msg_type, NlMsgType::RTM_NEWROUTE, NlMsgType::RTM_DELROUTE)?;
    let (rtm, attrs) = header::<RtMsg>(payload)?;
    if rtm.rtm_flags & RTM_F_CLONED != 0 {
        return Ok(None);
    }

    let mut table = u32::from(rtm.rtm_table);
    let mut route = Route {
        source: None,
        destination: None,
        gateway: None,
    };
    let mut src = None;
    for (attr_type, data) in AttrIter::new(attrs) {
        match attr_type {
            rta::TABLE => table = get::u32_ne(data)?,
            rta::DST => {
                let ip = ip_addr(rtm.rtm_family, data)?;
                route.destination = Some(
                    IpNet::new(ip, rtm.rtm_dst_len)
                        .map_err(|e| Error::InvalidMessage(format!("bad prefix length: {e}")))?,
                );
            }
            rta::GATEWAY => route.gateway = Some(ip_addr(rtm.rtm_family, data)?),
            rta::PREFSRC => route.source = Some(ip_addr(rtm.rtm_family, data)?),
            rta::SRC => src = Some(ip_addr(rtm.rtm_family, data)?),
            _ => {}
        }
    }
    if table != u32::from(RT_TABLE_MAIN) {
        return Ok(None);
    }
    route.source = route.source.or(src);

    Ok(Some(RouteUpdate { kind, route }))
}

/// Decode any message the topology feed subscribes to.
///
/// Control messages and unrelated types yield `Ok(None)`.
pub fn parse_message(header: &NlMsgHdr, payload: &[u8]) -> Result<Option<TopologyUpdate>> {
    match header.nlmsg_type {
        NlMsgType::RTM_NEWLINK | NlMsgType::RTM_DELLINK => {
            parse_link(header.nlmsg_type, payload).map(|u| Some(u.into()))
        }
        NlMsgType::RTM_NEWADDR | NlMsgType::RTM_DELADDR => {
            parse_address(header.nlmsg_type, payload).map(|u| Some(u.into()))
        }
        NlMsgType::RTM_NEWROUTE | NlMsgType::RTM_DELROUTE => {
            parse_route(header.nlmsg_type, payload).map(|u| u.map(Into::into))
        }
        _ => Ok(None),
    }
}

fn ip_addr(family: u8, data: &[u8]) -> Result<IpAddr> {
    match (i32::from(family), data.len()) {
        (libc::AF_INET, 4) => {
            let octets: [u8; 4] = [data[0], data[1], data[2], data[3]];
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        (libc::AF_INET6, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(data);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        (family, len) => Err(Error::InvalidAttribute(format!(
            "{len}-byte address for family {family}"
        ))),
    }
}
