//! RTNETLINK plumbing: an aligned message builder with nested attributes, a
//! bounds-checked response reader, and a sender that can open its socket
//! inside another process's network namespace.

use std::mem::{size_of, zeroed};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use nix::sys::socket::{
    bind, recv, send, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, trace};

use crate::error::NetError;
use crate::namespace::{self, Namespace};
use crate::process::{self, Channel};

const NLMSG_HDRLEN: usize = size_of::<libc::nlmsghdr>();
const RTA_HDRLEN: usize = size_of::<libc::rtattr>();

static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);

pub(crate) const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn raw_bytes<T>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
}

/// Outgoing request under construction. NLM_F_REQUEST and NLM_F_ACK are
/// always set; sequence numbers increase monotonically per process.
pub struct NetlinkMessage {
    buf: Vec<u8>,
    nested: Vec<usize>,
}

impl NetlinkMessage {
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let mut hdr: libc::nlmsghdr = unsafe { zeroed() };
        hdr.nlmsg_type = msg_type;
        hdr.nlmsg_flags = flags | libc::NLM_F_REQUEST as u16 | libc::NLM_F_ACK as u16;
        hdr.nlmsg_seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);

        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(raw_bytes(&hdr));
        NetlinkMessage {
            buf,
            nested: Vec::new(),
        }
    }

    pub fn seq(&self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[8..12]);
        u32::from_ne_bytes(bytes)
    }

    fn pad(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    /// Appends a fixed-size kernel struct (ifinfomsg, ifaddrmsg, rtmsg, ...).
    pub fn put<T: Copy>(&mut self, payload: &T) -> &mut Self {
        self.buf.extend_from_slice(raw_bytes(payload));
        self.pad();
        self
    }

    pub fn put_attr(&mut self, rta_type: u16, data: &[u8]) -> &mut Self {
        let mut rta: libc::rtattr = unsafe { zeroed() };
        rta.rta_len = (RTA_HDRLEN + data.len()) as libc::c_ushort;
        rta.rta_type = rta_type;
        self.buf.extend_from_slice(raw_bytes(&rta));
        self.buf.extend_from_slice(data);
        self.pad();
        self
    }

    pub fn put_attr_str(&mut self, rta_type: u16, value: &str) -> &mut Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.put_attr(rta_type, &bytes)
    }

    pub fn put_attr_u32(&mut self, rta_type: u16, value: u32) -> &mut Self {
        self.put_attr(rta_type, &value.to_ne_bytes())
    }

    pub fn put_attr_u16(&mut self, rta_type: u16, value: u16) -> &mut Self {
        self.put_attr(rta_type, &value.to_ne_bytes())
    }

    pub fn put_attr_struct<T: Copy>(&mut self, rta_type: u16, value: &T) -> &mut Self {
        self.put_attr(rta_type, raw_bytes(value))
    }

    pub fn begin_nested(&mut self, rta_type: u16) -> &mut Self {
        self.nested.push(self.buf.len());
        self.put_attr(rta_type, &[])
    }

    /// Backfills the nested attribute's length.
    pub fn end_nested(&mut self) -> &mut Self {
        debug_assert!(!self.nested.is_empty(), "end_nested without begin_nested");
        if let Some(start) = self.nested.pop() {
            let len = (self.buf.len() - start) as u16;
            self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        }
        self
    }

    pub(crate) fn finish(&mut self) -> &[u8] {
        debug_assert!(self.nested.is_empty(), "unclosed nested attribute");
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        &self.buf
    }
}

/// Reader over the data messages of one exchange. ACK/NACK/DONE frames are
/// consumed by [`send_message`]; only payload messages land here.
pub struct NetlinkResponse {
    buf: Vec<u8>,
    msg_start: usize,
    cursor: usize,
    // (payload end, position after the whole attribute) per open nesting
    nested: Vec<(usize, usize)>,
}

impl NetlinkResponse {
    fn new(buf: Vec<u8>) -> Self {
        NetlinkResponse {
            buf,
            msg_start: 0,
            cursor: NLMSG_HDRLEN,
            nested: Vec::new(),
        }
    }

    fn message_len(&self) -> usize {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.msg_start..self.msg_start + 4]);
        u32::from_ne_bytes(bytes) as usize
    }

    fn message_end(&self) -> usize {
        self.msg_start + self.message_len()
    }

    fn read_limit(&self) -> usize {
        self.nested
            .last()
            .map(|(end, _)| *end)
            .unwrap_or_else(|| self.message_end())
    }

    pub fn has_message(&self) -> bool {
        self.msg_start + NLMSG_HDRLEN <= self.buf.len()
            && self.message_end() <= self.buf.len()
            && self.message_len() >= NLMSG_HDRLEN
    }

    pub fn message_type(&self) -> Result<u16, NetError> {
        if !self.has_message() {
            return Err(NetError::Parse("no message".to_string()));
        }
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.buf[self.msg_start + 4..self.msg_start + 6]);
        Ok(u16::from_ne_bytes(bytes))
    }

    pub fn next_message(&mut self) -> &mut Self {
        if self.has_message() {
            self.msg_start += align4(self.message_len());
            self.cursor = self.msg_start + NLMSG_HDRLEN;
            self.nested.clear();
        }
        self
    }

    /// Reads the fixed-size header that follows the message header.
    pub fn fetch<T: Copy>(&mut self) -> Result<T, NetError> {
        let end = self.cursor + size_of::<T>();
        if end > self.read_limit() {
            return Err(NetError::Parse("read past message end".to_string()));
        }
        let value =
            unsafe { std::ptr::read_unaligned(self.buf[self.cursor..].as_ptr() as *const T) };
        self.cursor = align4(end);
        Ok(value)
    }

    pub fn skip<T>(&mut self) -> Result<(), NetError> {
        let end = self.cursor + size_of::<T>();
        if end > self.read_limit() {
            return Err(NetError::Parse("skip past message end".to_string()));
        }
        self.cursor = align4(end);
        Ok(())
    }

    fn peek_attr(&self) -> Result<(u16, u16), NetError> {
        let limit = self.read_limit();
        if self.cursor + RTA_HDRLEN > limit {
            return Err(NetError::Parse("no attribute".to_string()));
        }
        let mut len = [0u8; 2];
        let mut typ = [0u8; 2];
        len.copy_from_slice(&self.buf[self.cursor..self.cursor + 2]);
        typ.copy_from_slice(&self.buf[self.cursor + 2..self.cursor + 4]);
        let rta_len = u16::from_ne_bytes(len);
        if (rta_len as usize) < RTA_HDRLEN || self.cursor + rta_len as usize > limit {
            return Err(NetError::Parse("truncated attribute".to_string()));
        }
        Ok((rta_len, u16::from_ne_bytes(typ)))
    }

    pub fn has_attribute(&self) -> bool {
        self.peek_attr().is_ok()
    }

    pub fn attribute_type(&self) -> Result<u16, NetError> {
        Ok(self.peek_attr()?.1)
    }

    pub fn skip_attribute(&mut self) -> Result<(), NetError> {
        let (rta_len, _) = self.peek_attr()?;
        self.cursor += align4(rta_len as usize);
        Ok(())
    }

    pub fn fetch_attr_bytes(&mut self, rta_type: u16) -> Result<Vec<u8>, NetError> {
        let (rta_len, actual) = self.peek_attr()?;
        if actual != rta_type {
            return Err(NetError::Parse(format!(
                "expected attribute {}, found {}",
                rta_type, actual
            )));
        }
        let data = self.buf[self.cursor + RTA_HDRLEN..self.cursor + rta_len as usize].to_vec();
        self.cursor += align4(rta_len as usize);
        Ok(data)
    }

    pub fn fetch_attr_string(&mut self, rta_type: u16) -> Result<String, NetError> {
        let mut bytes = self.fetch_attr_bytes(rta_type)?;
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        String::from_utf8(bytes).map_err(|_| NetError::Parse("non-utf8 attribute".to_string()))
    }

    pub fn fetch_attr_u32(&mut self, rta_type: u16) -> Result<u32, NetError> {
        let bytes = self.fetch_attr_bytes(rta_type)?;
        if bytes.len() != 4 {
            return Err(NetError::Parse("bad u32 attribute length".to_string()));
        }
        let mut value = [0u8; 4];
        value.copy_from_slice(&bytes);
        Ok(u32::from_ne_bytes(value))
    }

    pub fn open_nested(&mut self, rta_type: u16) -> Result<(), NetError> {
        let (rta_len, actual) = self.peek_attr()?;
        if actual != rta_type {
            return Err(NetError::Parse(format!(
                "expected nested attribute {}, found {}",
                rta_type, actual
            )));
        }
        let payload_end = self.cursor + rta_len as usize;
        let after = self.cursor + align4(rta_len as usize);
        self.nested.push((payload_end, after));
        self.cursor += RTA_HDRLEN;
        Ok(())
    }

    pub fn close_nested(&mut self) -> Result<(), NetError> {
        match self.nested.pop() {
            Some((_, after)) => {
                self.cursor = after;
                Ok(())
            }
            None => Err(NetError::Parse("close_nested without open".to_string())),
        }
    }
}

fn open_route_socket() -> Result<OwnedFd, Errno> {
    let fd = socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::NetlinkRoute,
    )?;
    bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0))?;
    Ok(fd)
}

/// Opens the netlink socket inside `netns_pid`'s network namespace: a forked
/// helper joins the netns, opens and binds the socket, and passes it back
/// over a socketpair.
fn open_route_socket_in_ns(netns_pid: i32) -> Result<OwnedFd, NetError> {
    let (parent_ch, child_ch) =
        Channel::pair().map_err(|e| NetError::Config(format!("helper channel: {}", e)))?;

    // SAFE: the child only calls async-signal-safe-adjacent setup then exits
    match unsafe { fork() }? {
        ForkResult::Child => {
            drop(parent_ch);
            let ok = namespace::setns_of_pid(Pid::from_raw(netns_pid), &[Namespace::Net])
                .is_ok()
                && open_route_socket()
                    .ok()
                    .and_then(|fd| child_ch.send_fd(fd.as_raw_fd()).ok())
                    .is_some();
            unsafe { libc::_exit(if ok { 0 } else { 1 }) }
        }
        ForkResult::Parent { child } => {
            drop(child_ch);
            let fd = parent_ch.recv_fd();
            let status = process::wait_for_exit(child);
            match fd {
                Ok(fd) => Ok(fd),
                Err(_) => Err(NetError::Config(format!(
                    "could not open netlink socket in netns of pid {} (helper exit: {:?})",
                    netns_pid, status
                ))),
            }
        }
    }
}

/// Sends one request and collects its data messages. `netns_pid` 0 or our
/// own pid means the host namespace.
pub fn send_message(msg: &mut NetlinkMessage, netns_pid: i32) -> Result<NetlinkResponse, NetError> {
    let fd = if netns_pid == 0 || netns_pid == std::process::id() as i32 {
        open_route_socket()?
    } else {
        open_route_socket_in_ns(netns_pid)?
    };

    let seq = msg.seq();
    let bytes = msg.finish();
    trace!(len = bytes.len(), seq, "netlink send");
    send(fd.as_raw_fd(), bytes, MsgFlags::empty())?;

    let mut collected: Vec<u8> = Vec::new();
    let mut done = false;
    while !done {
        let mut buf = vec![0u8; 8192];
        let received = loop {
            match recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(n) => break n,
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        };
        if received == 0 {
            return Err(NetError::Parse("netlink socket closed".to_string()));
        }

        let mut offset = 0usize;
        while offset + NLMSG_HDRLEN <= received {
            let hdr: libc::nlmsghdr =
                unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr() as *const _) };
            let len = hdr.nlmsg_len as usize;
            if len < NLMSG_HDRLEN || offset + len > received {
                return Err(NetError::Parse("truncated netlink message".to_string()));
            }

            match hdr.nlmsg_type as libc::c_int {
                libc::NLMSG_ERROR => {
                    if hdr.nlmsg_seq != seq {
                        return Err(NetError::Parse("mismatched sequence number".to_string()));
                    }
                    if len < NLMSG_HDRLEN + size_of::<libc::nlmsgerr>() {
                        return Err(NetError::Parse("short nlmsgerr".to_string()));
                    }
                    let errmsg: libc::nlmsgerr = unsafe {
                        std::ptr::read_unaligned(buf[offset + NLMSG_HDRLEN..].as_ptr() as *const _)
                    };
                    if errmsg.error != 0 {
                        let errno = Errno::from_raw(-errmsg.error);
                        debug!("netlink NACK: {}", errno);
                        return Err(NetError::Netlink(errno));
                    }
                    done = true;
                }
                libc::NLMSG_DONE => done = true,
                libc::NLMSG_OVERRUN => return Err(NetError::DataLost),
                libc::NLMSG_NOOP => {}
                _ => {
                    collected.extend_from_slice(&buf[offset..offset + len]);
                    while collected.len() % 4 != 0 {
                        collected.push(0);
                    }
                    if hdr.nlmsg_flags & libc::NLM_F_MULTI as u16 == 0 {
                        // single-part answer; the trailing ACK may still be
                        // in this very buffer and is consumed below
                        done = true;
                    }
                }
            }
            offset += align4(len);
        }
    }

    Ok(NetlinkResponse::new(collected))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IFLA_IFNAME: u16 = 3;
    const IFLA_MTU: u16 = 4;
    const IFLA_LINKINFO: u16 = 18;
    const IFLA_INFO_KIND: u16 = 1;

    fn build_sample() -> Vec<u8> {
        let mut info: libc::ifinfomsg = unsafe { zeroed() };
        info.ifi_family = libc::AF_UNSPEC as u8;
        info.ifi_index = 4;
        info.ifi_change = 0xFFFF_FFFF;

        let mut msg = NetlinkMessage::new(libc::RTM_NEWLINK, 0);
        msg.put(&info)
            .begin_nested(IFLA_LINKINFO)
            .put_attr_str(IFLA_INFO_KIND, "veth")
            .end_nested()
            .put_attr_str(IFLA_IFNAME, "veth01")
            .put_attr_u32(IFLA_MTU, 1500);
        msg.finish().to_vec()
    }

    #[test]
    fn header_carries_request_and_ack() {
        let buf = build_sample();
        let hdr: libc::nlmsghdr = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const _) };
        assert_eq!(hdr.nlmsg_len as usize, buf.len());
        assert_eq!(hdr.nlmsg_type, libc::RTM_NEWLINK);
        assert_ne!(hdr.nlmsg_flags & libc::NLM_F_REQUEST as u16, 0);
        assert_ne!(hdr.nlmsg_flags & libc::NLM_F_ACK as u16, 0);
    }

    #[test]
    fn sequence_numbers_increase() {
        let a = NetlinkMessage::new(libc::RTM_GETLINK, 0).seq();
        let b = NetlinkMessage::new(libc::RTM_GETLINK, 0).seq();
        assert!(b > a);
    }

    #[test]
    fn nested_length_is_backfilled_and_readable() {
        let buf = build_sample();
        let mut response = NetlinkResponse::new(buf);
        assert!(response.has_message());

        let info: libc::ifinfomsg = response.fetch().unwrap();
        assert_eq!(info.ifi_index, 4);

        response.open_nested(IFLA_LINKINFO).unwrap();
        assert_eq!(response.fetch_attr_string(IFLA_INFO_KIND).unwrap(), "veth");
        assert!(!response.has_attribute());
        response.close_nested().unwrap();

        assert_eq!(response.attribute_type().unwrap(), IFLA_IFNAME);
        assert_eq!(response.fetch_attr_string(IFLA_IFNAME).unwrap(), "veth01");
        assert_eq!(response.fetch_attr_u32(IFLA_MTU).unwrap(), 1500);
        assert!(!response.has_attribute());

        response.next_message();
        assert!(!response.has_message());
    }

    #[test]
    fn attribute_scan_with_skip() {
        let buf = build_sample();
        let mut response = NetlinkResponse::new(buf);
        response.skip::<libc::ifinfomsg>().unwrap();

        let mut name = None;
        while response.has_attribute() {
            if response.attribute_type().unwrap() == IFLA_IFNAME {
                name = Some(response.fetch_attr_string(IFLA_IFNAME).unwrap());
            } else {
                response.skip_attribute().unwrap();
            }
        }
        assert_eq!(name.as_deref(), Some("veth01"));
    }

    #[test]
    fn reading_past_the_end_is_an_error() {
        let buf = build_sample();
        let mut response = NetlinkResponse::new(buf);
        response.skip::<libc::ifinfomsg>().unwrap();
        while response.has_attribute() {
            response.skip_attribute().unwrap();
        }
        assert!(response.fetch::<libc::ifinfomsg>().is_err());
        assert!(response.skip_attribute().is_err());
    }

    #[test]
    fn align4_rounds_up() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(5), 8);
    }
}
