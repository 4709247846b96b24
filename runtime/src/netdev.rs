//! Virtual network device management: veth pairs bridged on the host,
//! macvlan slaves, software bridges and physical devices moved into a
//! zone's network namespace, plus address and route manipulation.

use std::mem::zeroed;
use std::net::IpAddr;
use std::os::fd::AsRawFd;

use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::err;
use crate::error::NetError;
use crate::netlink::{send_message, NetlinkMessage, NetlinkResponse};

// rtnetlink attribute ids this module needs; uapi values, stable since 3.x
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;
const IFLA_LINK: u16 = 5;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_AF_SPEC: u16 = 26;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;
const IFLA_MACVLAN_MODE: u16 = 1;
const IFLA_BRIDGE_FLAGS: u16 = 0;
const BRIDGE_FLAGS_MASTER: u16 = 1;
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;
const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;
const SIOCBRADDIF: libc::c_ulong = 0x89a2;

// `struct rtmsg` from linux/rtnetlink.h; not exposed by the libc crate.
#[repr(C)]
#[derive(Clone, Copy)]
struct rtmsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetDevKind {
    Veth,
    MacVlan,
    Bridge,
    Phys,
    Move,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MacVlanMode {
    Private,
    Vepa,
    Bridge,
    Passthru,
}

impl MacVlanMode {
    pub fn to_raw(self) -> u32 {
        match self {
            MacVlanMode::Private => 1,
            MacVlanMode::Vepa => 2,
            MacVlanMode::Bridge => 4,
            MacVlanMode::Passthru => 8,
        }
    }
}

/// One address on an interface.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct InetAddr {
    pub ip: IpAddr,
    pub prefix: u8,
    pub scope: u8,
    pub flags: u32,
}

impl InetAddr {
    pub fn new(ip: IpAddr, prefix: u8) -> Self {
        InetAddr {
            ip,
            prefix,
            scope: 0,
            flags: 0,
        }
    }

    fn family(&self) -> u8 {
        match self.ip {
            IpAddr::V4(_) => libc::AF_INET as u8,
            IpAddr::V6(_) => libc::AF_INET6 as u8,
        }
    }
}

/// A route; `destination` of None is the default route.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Route {
    pub destination: Option<(IpAddr, u8)>,
    pub gateway: Option<IpAddr>,
}

pub type Attrs = Vec<(String, String)>;

fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

fn validate_name(name: &str) -> Result<(), NetError> {
    if name.len() <= 1 || name.len() >= libc::IFNAMSIZ {
        return Err(NetError::Config(format!("bad device name: {:?}", name)));
    }
    Ok(())
}

/// Strict CIDR: `ip/prefix`, both parts mandatory.
pub fn parse_cidr(text: &str) -> Result<(IpAddr, u8), NetError> {
    let (ip, prefix) = text
        .split_once('/')
        .ok_or_else(|| NetError::Config(format!("not CIDR notation: {:?}", text)))?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| NetError::Config(format!("bad address: {:?}", text)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| NetError::Config(format!("bad prefix length: {:?}", text)))?;
    let max = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return Err(NetError::Config(format!("prefix too long: {:?}", text)));
    }
    Ok((ip, prefix))
}

fn clean_ifinfo() -> libc::ifinfomsg {
    let mut info: libc::ifinfomsg = unsafe { zeroed() };
    info.ifi_family = libc::AF_UNSPEC as u8;
    info.ifi_change = 0xFFFF_FFFF;
    info
}

/// Link lookup by name inside the given namespace.
fn link_info(name: &str, ns_pid: i32) -> Result<(libc::ifinfomsg, NetlinkResponse), NetError> {
    let mut msg = NetlinkMessage::new(libc::RTM_GETLINK, 0);
    msg.put(&clean_ifinfo()).put_attr_str(IFLA_IFNAME, name);
    let mut response = send_message(&mut msg, ns_pid)?;
    if !response.has_message() {
        return Err(NetError::NotFound(name.to_string()));
    }
    let info: libc::ifinfomsg = response.fetch()?;
    Ok((info, response))
}

pub fn interface_index(name: &str, ns_pid: i32) -> Result<u32, NetError> {
    Ok(link_info(name, ns_pid)?.0.ifi_index as u32)
}

/// First free `vethN` name on the host side.
fn unique_veth_name() -> Result<String, NetError> {
    let existing = list(0)?;
    let mut i = 0;
    loop {
        i += 1;
        let candidate = format!("veth{}", i);
        if !existing.contains(&candidate) {
            return Ok(candidate);
        }
    }
}

fn create_veth_pair(host_dev: &str, ns_dev: &str) -> Result<(), NetError> {
    validate_name(host_dev)?;
    validate_name(ns_dev)?;

    let mut msg = NetlinkMessage::new(
        libc::RTM_NEWLINK,
        (libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16,
    );
    msg.put(&clean_ifinfo())
        .begin_nested(IFLA_LINKINFO)
        .put_attr_str(IFLA_INFO_KIND, "veth")
        .begin_nested(IFLA_INFO_DATA)
        .begin_nested(VETH_INFO_PEER)
        .put(&clean_ifinfo())
        .put_attr_str(IFLA_IFNAME, ns_dev)
        .end_nested()
        .end_nested()
        .end_nested()
        .put_attr_str(IFLA_IFNAME, host_dev);
    send_message(&mut msg, 0)?;
    Ok(())
}

/// ioctl SIOCBRADDIF: enslave `dev` to `bridge` on the host.
fn attach_to_bridge(bridge: &str, dev: &str) -> Result<(), NetError> {
    validate_name(bridge)?;
    validate_name(dev)?;

    let index = nix::net::if_::if_nametoindex(dev).map_err(NetError::Os)?;
    let sock = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;

    let mut req: libc::ifreq = unsafe { zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(bridge.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    req.ifr_ifru.ifru_ifindex = index as libc::c_int;
    err(|| unsafe { libc::ioctl(sock.as_raw_fd(), SIOCBRADDIF, &req) })?;
    Ok(())
}

fn set_flags(name: &str, mask: u32, flags: u32) -> Result<(), NetError> {
    let index = interface_index(name, 0)?;
    let mut info: libc::ifinfomsg = unsafe { zeroed() };
    info.ifi_family = libc::AF_UNSPEC as u8;
    info.ifi_index = index as i32;
    info.ifi_flags = flags;
    // ifi_change selects which flag bits apply
    info.ifi_change = mask;
    let mut msg = NetlinkMessage::new(libc::RTM_NEWLINK, 0);
    msg.put(&info);
    send_message(&mut msg, 0)?;
    Ok(())
}

fn up(name: &str) -> Result<(), NetError> {
    set_flags(name, libc::IFF_UP as u32, libc::IFF_UP as u32)
}

fn move_to_ns(name: &str, ns_pid: i32) -> Result<(), NetError> {
    let index = interface_index(name, 0)?;
    let mut info: libc::ifinfomsg = unsafe { zeroed() };
    info.ifi_family = libc::AF_UNSPEC as u8;
    info.ifi_index = index as i32;
    let mut msg = NetlinkMessage::new(libc::RTM_NEWLINK, 0);
    msg.put(&info).put_attr_u32(IFLA_NET_NS_PID, ns_pid as u32);
    send_message(&mut msg, 0)?;
    Ok(())
}

/// Creates a veth pair, enslaves the host end to `bridge`, brings it up and
/// moves the zone end into `ns_pid`'s netns. Returns the generated host-side
/// name. Any failure destroys the pair again, leaving the host device list
/// unchanged.
pub fn create_veth(ns_pid: i32, ns_dev: &str, bridge: &str) -> Result<String, NetError> {
    let host_veth = unique_veth_name()?;
    trace!(
        "creating veth: bridge {} port {} zone dev {}",
        bridge,
        host_veth,
        ns_dev
    );
    create_veth_pair(&host_veth, ns_dev)?;

    let cleanup = scopeguard::guard((), |_| {
        if let Err(e) = destroy(&host_veth, 0) {
            error!("cleaning up veth {} failed: {}", host_veth, e);
        }
    });
    attach_to_bridge(bridge, &host_veth)?;
    up(&host_veth)?;
    move_to_ns(ns_dev, ns_pid)?;
    scopeguard::ScopeGuard::into_inner(cleanup);
    Ok(host_veth)
}

/// Creates a macvlan slave of `master` and moves it into the zone's netns.
pub fn create_macvlan(
    ns_pid: i32,
    ns_dev: &str,
    master: &str,
    mode: MacVlanMode,
) -> Result<(), NetError> {
    validate_name(master)?;
    validate_name(ns_dev)?;

    let index = interface_index(master, 0)?;
    let mut msg = NetlinkMessage::new(
        libc::RTM_NEWLINK,
        (libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16,
    );
    msg.put(&clean_ifinfo())
        .begin_nested(IFLA_LINKINFO)
        .put_attr_str(IFLA_INFO_KIND, "macvlan")
        .begin_nested(IFLA_INFO_DATA)
        .put_attr_u32(IFLA_MACVLAN_MODE, mode.to_raw())
        .end_nested()
        .end_nested()
        .put_attr_u32(IFLA_LINK, index)
        .put_attr_str(IFLA_IFNAME, ns_dev);
    send_message(&mut msg, 0)?;

    let cleanup = scopeguard::guard((), |_| {
        if let Err(e) = destroy(ns_dev, 0) {
            error!("cleaning up macvlan {} failed: {}", ns_dev, e);
        }
    });
    up(ns_dev)?;
    move_to_ns(ns_dev, ns_pid)?;
    scopeguard::ScopeGuard::into_inner(cleanup);
    Ok(())
}

pub fn create_bridge(name: &str) -> Result<(), NetError> {
    validate_name(name)?;
    let mut msg = NetlinkMessage::new(
        libc::RTM_NEWLINK,
        (libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16,
    );
    msg.put(&clean_ifinfo())
        .begin_nested(IFLA_LINKINFO)
        .put_attr_str(IFLA_INFO_KIND, "bridge")
        .begin_nested(IFLA_INFO_DATA)
        .begin_nested(IFLA_AF_SPEC)
        .put_attr_u16(IFLA_BRIDGE_FLAGS, BRIDGE_FLAGS_MASTER)
        .end_nested()
        .end_nested()
        .end_nested()
        .put_attr_str(IFLA_IFNAME, name);
    send_message(&mut msg, 0)?;
    Ok(())
}

/// Moves an existing (typically physical) host device into the zone.
pub fn move_phys(ns_pid: i32, name: &str) -> Result<(), NetError> {
    trace!("moving phys dev {} to pid {}", name, ns_pid);
    move_to_ns(name, ns_pid)
}

pub fn destroy(name: &str, ns_pid: i32) -> Result<(), NetError> {
    trace!("destroying netdev {}", name);
    validate_name(name)?;
    let mut msg = NetlinkMessage::new(libc::RTM_DELLINK, 0);
    msg.put(&clean_ifinfo()).put_attr_str(IFLA_IFNAME, name);
    send_message(&mut msg, ns_pid)?;
    Ok(())
}

/// Interface names in the given namespace.
pub fn list(ns_pid: i32) -> Result<Vec<String>, NetError> {
    let mut info: libc::ifinfomsg = unsafe { zeroed() };
    info.ifi_family = libc::AF_PACKET as u8;
    let mut msg = NetlinkMessage::new(
        libc::RTM_GETLINK,
        (libc::NLM_F_DUMP | libc::NLM_F_ROOT) as u16,
    );
    msg.put(&info);
    let mut response = send_message(&mut msg, ns_pid)?;

    let mut names = Vec::new();
    while response.has_message() {
        response.skip::<libc::ifinfomsg>()?;
        while response.has_attribute() {
            if response.attribute_type()? == IFLA_IFNAME {
                names.push(response.fetch_attr_string(IFLA_IFNAME)?);
            } else {
                response.skip_attribute()?;
            }
        }
        response.next_message();
    }
    Ok(names)
}

fn add_address(index: u32, ns_pid: i32, addr: &InetAddr) -> Result<(), NetError> {
    let mut ifa: libc::ifaddrmsg = unsafe { zeroed() };
    ifa.ifa_family = addr.family();
    ifa.ifa_prefixlen = addr.prefix;
    ifa.ifa_flags = addr.flags as u8;
    ifa.ifa_scope = addr.scope;
    ifa.ifa_index = index;

    let mut msg = NetlinkMessage::new(libc::RTM_NEWADDR, libc::NLM_F_CREATE as u16);
    msg.put(&ifa);
    let bytes = ip_bytes(&addr.ip);
    if addr.ip.is_ipv6() {
        msg.put_attr(IFA_ADDRESS, &bytes);
        msg.put_attr(IFA_LOCAL, &bytes);
    } else {
        msg.put_attr(IFA_LOCAL, &bytes);
    }
    send_message(&mut msg, ns_pid)?;
    Ok(())
}

pub fn add_ip(name: &str, ns_pid: i32, addr: &InetAddr) -> Result<(), NetError> {
    let index = interface_index(name, ns_pid)?;
    add_address(index, ns_pid, addr)
}

/// `cidr` must be `ip/prefix`.
pub fn del_ip(name: &str, ns_pid: i32, cidr: &str) -> Result<(), NetError> {
    let index = interface_index(name, ns_pid)?;
    let (ip, prefix) = parse_cidr(cidr)?;

    let mut ifa: libc::ifaddrmsg = unsafe { zeroed() };
    ifa.ifa_family = match ip {
        IpAddr::V4(_) => libc::AF_INET as u8,
        IpAddr::V6(_) => libc::AF_INET6 as u8,
    };
    ifa.ifa_prefixlen = prefix;
    ifa.ifa_index = index;

    let mut msg = NetlinkMessage::new(libc::RTM_DELADDR, 0);
    msg.put(&ifa);
    let bytes = ip_bytes(&ip);
    if ip.is_ipv6() {
        msg.put_attr(IFA_ADDRESS, &bytes);
        msg.put_attr(IFA_LOCAL, &bytes);
    } else {
        msg.put_attr(IFA_LOCAL, &bytes);
    }
    send_message(&mut msg, ns_pid)?;
    Ok(())
}

fn dump_addresses(ns_pid: i32, family: u8, index: u32) -> Result<Vec<Attrs>, NetError> {
    let mut ifa: libc::ifaddrmsg = unsafe { zeroed() };
    ifa.ifa_family = family;
    let mut msg = NetlinkMessage::new(libc::RTM_GETADDR, libc::NLM_F_DUMP as u16);
    msg.put(&ifa);
    let mut response = send_message(&mut msg, ns_pid)?;

    let mut addresses = Vec::new();
    while response.has_message() {
        let addrmsg: libc::ifaddrmsg = response.fetch()?;
        if addrmsg.ifa_index == index {
            let mut attrs: Attrs = vec![
                ("prefixlen".to_string(), addrmsg.ifa_prefixlen.to_string()),
                ("flags".to_string(), addrmsg.ifa_flags.to_string()),
                ("scope".to_string(), addrmsg.ifa_scope.to_string()),
                ("family".to_string(), addrmsg.ifa_family.to_string()),
            ];
            while response.has_attribute() {
                if response.attribute_type()? == IFA_ADDRESS {
                    let bytes = response.fetch_attr_bytes(IFA_ADDRESS)?;
                    let ip = bytes_to_ip(&bytes)?;
                    attrs.push(("ip".to_string(), ip.to_string()));
                } else {
                    response.skip_attribute()?;
                }
            }
            addresses.push(attrs);
        }
        response.next_message();
    }
    Ok(addresses)
}

fn bytes_to_ip(bytes: &[u8]) -> Result<IpAddr, NetError> {
    match bytes.len() {
        4 => {
            let mut v4 = [0u8; 4];
            v4.copy_from_slice(bytes);
            Ok(IpAddr::from(v4))
        }
        16 => {
            let mut v6 = [0u8; 16];
            v6.copy_from_slice(bytes);
            Ok(IpAddr::from(v6))
        }
        n => Err(NetError::Parse(format!("bad address length {}", n))),
    }
}

/// Addresses on `name` in the given namespace, flattened per family.
pub fn list_ip(name: &str, ns_pid: i32) -> Result<Vec<InetAddr>, NetError> {
    let index = interface_index(name, ns_pid)?;
    let mut out = Vec::new();
    for family in [libc::AF_INET as u8, libc::AF_INET6 as u8] {
        for attrs in dump_addresses(ns_pid, family, index)? {
            let mut ip = None;
            let mut prefix = 0u8;
            let mut scope = 0u8;
            let mut flags = 0u32;
            for (key, value) in &attrs {
                match key.as_str() {
                    "ip" => ip = value.parse().ok(),
                    "prefixlen" => prefix = value.parse().unwrap_or(0),
                    "scope" => scope = value.parse().unwrap_or(0),
                    "flags" => flags = value.parse().unwrap_or(0),
                    _ => {}
                }
            }
            if let Some(ip) = ip {
                out.push(InetAddr {
                    ip,
                    prefix,
                    scope,
                    flags,
                });
            }
        }
    }
    Ok(out)
}

fn route_message(msg_type: u16, flags: u16, route: &Route, oif: u32) -> NetlinkMessage {
    let family = match (route.destination, route.gateway) {
        (Some((IpAddr::V6(_), _)), _) | (None, Some(IpAddr::V6(_))) => libc::AF_INET6,
        _ => libc::AF_INET,
    };
    let mut rtm: rtmsg = unsafe { zeroed() };
    rtm.rtm_family = family as u8;
    rtm.rtm_table = RT_TABLE_MAIN;
    rtm.rtm_protocol = RTPROT_BOOT;
    rtm.rtm_scope = RT_SCOPE_UNIVERSE;
    rtm.rtm_type = RTN_UNICAST;
    if let Some((_, prefix)) = route.destination {
        rtm.rtm_dst_len = prefix;
    }

    let mut msg = NetlinkMessage::new(msg_type, flags);
    msg.put(&rtm);
    if let Some((dst, _)) = route.destination {
        msg.put_attr(RTA_DST, &ip_bytes(&dst));
    }
    if let Some(gw) = route.gateway {
        msg.put_attr(RTA_GATEWAY, &ip_bytes(&gw));
    }
    msg.put_attr_u32(RTA_OIF, oif);
    msg
}

pub fn add_route(name: &str, ns_pid: i32, route: &Route) -> Result<(), NetError> {
    let index = interface_index(name, ns_pid)?;
    let mut msg = route_message(
        libc::RTM_NEWROUTE,
        (libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16,
        route,
        index,
    );
    send_message(&mut msg, ns_pid)?;
    Ok(())
}

pub fn del_route(name: &str, ns_pid: i32, route: &Route) -> Result<(), NetError> {
    let index = interface_index(name, ns_pid)?;
    let mut msg = route_message(libc::RTM_DELROUTE, 0, route, index);
    send_message(&mut msg, ns_pid)?;
    Ok(())
}

const SUPPORTED_ATTRS: &[&str] = &["flags", "change", "type", "mtu", "link", "ipv4", "ipv6"];

/// `ipv4`/`ipv6` values use `ip:X,prefixlen:N[,scope:S][,flags:F]` and may
/// repeat; unknown attribute keys are refused.
pub fn set_attrs(name: &str, ns_pid: i32, attrs: &Attrs) -> Result<(), NetError> {
    validate_name(name)?;
    for (key, _) in attrs {
        if !SUPPORTED_ATTRS.contains(&key.as_str()) {
            return Err(NetError::Config(format!("unsupported attribute: {}", key)));
        }
    }

    let mut info: libc::ifinfomsg = unsafe { zeroed() };
    info.ifi_family = libc::AF_UNSPEC as u8;
    info.ifi_index = interface_index(name, ns_pid)? as i32;
    info.ifi_change = 0xFFFF_FFFF;
    for (key, value) in attrs {
        let parse = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| NetError::Config(format!("bad {} value: {:?}", key, v)))
        };
        match key.as_str() {
            "flags" => info.ifi_flags = parse(value)?,
            "change" => info.ifi_change = parse(value)?,
            "type" => info.ifi_type = parse(value)? as u16,
            _ => {}
        }
    }

    let mut msg = NetlinkMessage::new(libc::RTM_NEWLINK, libc::NLM_F_CREATE as u16);
    msg.put(&info);
    for (key, value) in attrs {
        match key.as_str() {
            "mtu" => {
                let mtu = value
                    .parse::<u32>()
                    .map_err(|_| NetError::Config(format!("bad mtu: {:?}", value)))?;
                msg.put_attr_u32(IFLA_MTU, mtu);
            }
            "link" => {
                let link = value
                    .parse::<u32>()
                    .map_err(|_| NetError::Config(format!("bad link: {:?}", value)))?;
                msg.put_attr_u32(IFLA_LINK, link);
            }
            _ => {}
        }
    }
    send_message(&mut msg, ns_pid)?;

    for (key, value) in attrs {
        match key.as_str() {
            "ipv4" | "ipv6" => {
                let addr = parse_address_attr(value)?;
                add_address(info.ifi_index as u32, ns_pid, &addr)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_address_attr(value: &str) -> Result<InetAddr, NetError> {
    let mut ip = None;
    let mut prefix = None;
    let mut scope = 0u8;
    let mut flags = 0u32;
    for part in value.split(',') {
        let (key, val) = part
            .split_once(':')
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .ok_or_else(|| NetError::Config(format!("ill formed address attribute: {}", part)))?;
        match key {
            // split_once keeps the ':'s inside a v6 address intact
            "ip" => {
                ip = Some(
                    val.parse::<IpAddr>()
                        .map_err(|_| NetError::Config(format!("bad address: {:?}", val)))?,
                );
            }
            "prefixlen" => {
                prefix = Some(
                    val.parse::<u8>()
                        .map_err(|_| NetError::Config(format!("bad prefixlen: {:?}", val)))?,
                );
            }
            "scope" => {
                scope = val
                    .parse::<u8>()
                    .map_err(|_| NetError::Config(format!("bad scope: {:?}", val)))?;
            }
            "flags" => {
                flags = val
                    .parse::<u32>()
                    .map_err(|_| NetError::Config(format!("bad flags: {:?}", val)))?;
            }
            other => {
                return Err(NetError::Config(format!(
                    "unknown address attribute: {}",
                    other
                )))
            }
        }
    }
    let ip = ip.ok_or_else(|| NetError::Config("address attribute without ip".to_string()))?;
    let prefix =
        prefix.ok_or_else(|| NetError::Config("address attribute without prefixlen".to_string()))?;
    Ok(InetAddr {
        ip,
        prefix,
        scope,
        flags,
    })
}

/// mtu, link, flags, type, plus the interface's addresses joined per family.
pub fn get_attrs(name: &str, ns_pid: i32) -> Result<Attrs, NetError> {
    validate_name(name)?;
    let (info, mut response) = link_info(name, ns_pid)?;

    let mut attrs: Attrs = Vec::new();
    while response.has_attribute() {
        match response.attribute_type()? {
            IFLA_MTU => {
                attrs.push(("mtu".to_string(), response.fetch_attr_u32(IFLA_MTU)?.to_string()));
            }
            IFLA_LINK => {
                attrs.push((
                    "link".to_string(),
                    response.fetch_attr_u32(IFLA_LINK)?.to_string(),
                ));
            }
            _ => response.skip_attribute()?,
        }
    }
    attrs.push(("flags".to_string(), info.ifi_flags.to_string()));
    attrs.push(("type".to_string(), info.ifi_type.to_string()));

    let join = |attrs: &Attrs| {
        attrs
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    };
    for addr in dump_addresses(ns_pid, libc::AF_INET as u8, info.ifi_index as u32)? {
        attrs.push(("ipv4".to_string(), join(&addr)));
    }
    for addr in dump_addresses(ns_pid, libc::AF_INET6 as u8, info.ifi_index as u32)? {
        attrs.push(("ipv6".to_string(), join(&addr)));
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_parse_is_strict() {
        assert!(parse_cidr("10.0.0.1").is_err());
        assert!(parse_cidr("10.0.0.1/").is_err());
        assert!(parse_cidr("10.0.0.1/33").is_err());
        assert!(parse_cidr("not-an-ip/24").is_err());
        assert_eq!(
            parse_cidr("10.0.0.1/24").unwrap(),
            ("10.0.0.1".parse().unwrap(), 24)
        );
        assert_eq!(
            parse_cidr("fd00::1/64").unwrap(),
            ("fd00::1".parse().unwrap(), 64)
        );
    }

    #[test]
    fn device_names_validate_length() {
        assert!(validate_name("x").is_err());
        assert!(validate_name("waaaaaaaaytoolongname").is_err());
        assert!(validate_name("eth0").is_ok());
    }

    #[test]
    fn address_attr_grammar() {
        let addr = parse_address_attr("ip:10.0.0.2,prefixlen:24").unwrap();
        assert_eq!(addr.ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(addr.prefix, 24);
        assert_eq!(addr.scope, 0);

        let addr = parse_address_attr("ip:fd00::2,prefixlen:64,scope:0,flags:128").unwrap();
        assert_eq!(addr.ip, "fd00::2".parse::<IpAddr>().unwrap());
        assert_eq!(addr.flags, 128);

        assert!(parse_address_attr("prefixlen:24").is_err());
        assert!(parse_address_attr("ip:10.0.0.2").is_err());
        assert!(parse_address_attr("bogus").is_err());
        assert!(parse_address_attr("ip:10.0.0.2,color:blue").is_err());
    }

    #[test]
    fn unknown_set_attr_is_refused() {
        let attrs = vec![("speed".to_string(), "fast".to_string())];
        assert!(matches!(
            set_attrs("eth0", 0, &attrs),
            Err(NetError::Config(_))
        ));
    }

    // needs root and a scratch netns
    #[test]
    #[ignore]
    fn veth_create_destroy_leaves_host_unchanged() {
        let before = list(0).unwrap();
        create_bridge("brtest0").unwrap();
        let host = create_veth(std::process::id() as i32, "veth-zone0", "brtest0").unwrap();
        assert!(list(0).unwrap().contains(&host));
        assert!(list(0).unwrap().contains(&"veth-zone0".to_string()));

        let addr = InetAddr::new("10.99.0.1".parse().unwrap(), 24);
        add_ip("veth-zone0", 0, &addr).unwrap();
        assert!(list_ip("veth-zone0", 0).unwrap().iter().any(|a| a.ip == addr.ip));
        del_ip("veth-zone0", 0, "10.99.0.1/24").unwrap();
        assert!(!list_ip("veth-zone0", 0).unwrap().iter().any(|a| a.ip == addr.ip));

        destroy(&host, 0).unwrap();
        destroy("brtest0", 0).unwrap();
        let after = list(0).unwrap();
        assert_eq!(before, after);
    }
}
