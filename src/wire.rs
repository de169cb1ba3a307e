//! Wire formats: Ethernet/IPv4/UDP headers and the application request/reply header.
//!
//! Layouts mirror the kernel/wire interface exactly, the same way `xdp.rs` mirrors the
//! kernel's `XDP_*` ABI: `repr(C)`, fixed widths, no derived `Default` guesswork about
//! padding. All multi-byte fields are network byte order; accessors convert explicitly.

use core::mem::size_of;

pub const ETHER_ADDR_LEN: usize = 6;
pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const IPPROTO_UDP: u8 = 17;

/// A 6-byte MAC address.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MacAddr(pub [u8; ETHER_ADDR_LEN]);

/// Ethernet header, network byte order.
///
/// The layout of this struct is part of the wire interface.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ether_type: u16,
}

impl EthernetHeader {
    pub const LEN: usize = size_of::<Self>();

    pub fn ether_type(&self) -> u16 {
        u16::from_be(self.ether_type)
    }
}

/// IPv4 header, network byte order, no options (IHL always 5).
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub packet_id: u16,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub next_proto: u8,
    pub hdr_checksum: u16,
    pub src_addr: u32,
    pub dst_addr: u32,
}

impl Ipv4Header {
    pub const LEN: usize = size_of::<Self>();
    pub const VERSION_IHL_NO_OPTIONS: u8 = 0x45;

    pub fn dst_addr(&self) -> u32 {
        u32::from_be(self.dst_addr)
    }

    pub fn next_proto(&self) -> u8 {
        self.next_proto
    }
}

/// UDP header, network byte order.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub const LEN: usize = size_of::<Self>();
}

/// The application request/reply header, immediately following the UDP header.
///
/// Network byte order. `req_size` is overloaded to carry the numeric key for
/// point-get requests, an unusual choice preserved as-is rather than redesigned;
/// [`AppHeader::key`] names the overload at every call site instead of leaving it
/// implicit.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AppHeader {
    pub id: u32,
    pub req_type: u32,
    pub req_size: u32,
    pub run_ns: u32,
}

impl AppHeader {
    pub const LEN: usize = size_of::<Self>();

    /// The numeric key for a point-get request, decoded from the overloaded `req_size`
    /// field.
    pub fn key(&self) -> u32 {
        u32::from_be(self.req_size)
    }

    pub fn req_type(&self) -> u32 {
        u32::from_be(self.req_type)
    }
}

/// Job kinds understood by the request-execution backend.
///
/// Only [`JobKind::PointGet`] is implemented; any other value — including
/// `RangeScan`, which is recognized but unimplemented — is an unknown-request-kind
/// fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobKind {
    PointGet,
    RangeScan,
}

impl JobKind {
    pub const POINT_GET: u32 = 0xA;
    pub const RANGE_SCAN: u32 = 0xB;

    pub fn from_wire(req_type: u32) -> Option<Self> {
        match req_type {
            Self::POINT_GET => Some(Self::PointGet),
            Self::RANGE_SCAN => Some(Self::RangeScan),
            _ => None,
        }
    }
}

pub const APP_HDR_OFFSET: usize = EthernetHeader::LEN + Ipv4Header::LEN + UdpHeader::LEN;
pub const REPLY_LEN: usize = APP_HDR_OFFSET + AppHeader::LEN;

/// Validate the Ethernet/IPv4/UDP headers of a received frame against this host's
/// identity: destination MAC matches, EtherType=IPv4, destination IP matches,
/// next-protocol=UDP.
pub fn headers_valid(eth: &EthernetHeader, ip: &Ipv4Header, my_mac: &MacAddr, my_ip: u32) -> bool {
    eth.dst == *my_mac
        && eth.ether_type() == ETHER_TYPE_IPV4
        && ip.dst_addr() == my_ip
        && ip.next_proto() == IPPROTO_UDP
}

/// Build the reply headers in place over `out`: swap source/destination addresses
/// and ports, echo the app-level fields, zero `run_ns`.
///
/// `out` must be at least [`REPLY_LEN`] bytes. Setting `l2_len`/`l3_len` is the
/// caller's responsibility via [`crate::pool::PacketBuf`] metadata — this function
/// only writes header bytes, it does not touch pool-level offload flags, so every
/// call site sets them per-packet rather than relying on pool-init-time values
/// (a TX path that resets buffer metadata after pool init would otherwise desync
/// checksums from the header bytes actually on the wire).
pub fn build_reply(
    out: &mut [u8],
    req_eth: &EthernetHeader,
    req_ip: &Ipv4Header,
    req_udp: &UdpHeader,
    req_app: &AppHeader,
    my_mac: MacAddr,
    my_ip: u32,
    server_port: u16,
) {
    debug_assert!(out.len() >= REPLY_LEN);

    let eth = EthernetHeader {
        dst: req_eth.src,
        src: my_mac,
        ether_type: ETHER_TYPE_IPV4.to_be(),
    };

    let ip = Ipv4Header {
        version_ihl: Ipv4Header::VERSION_IHL_NO_OPTIONS,
        tos: 0,
        total_length: ((Ipv4Header::LEN + UdpHeader::LEN + AppHeader::LEN) as u16).to_be(),
        packet_id: req_ip.packet_id,
        fragment_offset: req_ip.fragment_offset,
        ttl: 64,
        next_proto: IPPROTO_UDP,
        // Checksum is offloaded; left as the request's stale value to mirror the
        // original, which relies entirely on NIC offload and never recomputes it here.
        hdr_checksum: req_ip.hdr_checksum,
        src_addr: my_ip.to_be(),
        dst_addr: req_ip.src_addr,
    };

    let udp = UdpHeader {
        src_port: server_port.to_be(),
        dst_port: req_udp.src_port,
        length: ((UdpHeader::LEN + AppHeader::LEN) as u16).to_be(),
        checksum: 0,
    };

    let app = AppHeader {
        id: req_app.id,
        req_type: req_app.req_type,
        req_size: req_app.req_size,
        run_ns: 0,
    };

    write_at(out, 0, &eth);
    write_at(out, EthernetHeader::LEN, &ip);
    write_at(out, EthernetHeader::LEN + Ipv4Header::LEN, &udp);
    write_at(out, APP_HDR_OFFSET, &app);
}

fn write_at<T: Copy>(out: &mut [u8], offset: usize, value: &T) {
    let len = size_of::<T>();
    let bytes =
        unsafe { core::slice::from_raw_parts(value as *const T as *const u8, len) };
    out[offset..offset + len].copy_from_slice(bytes);
}

/// Read a header of type `T` out of `buf` at `offset`. `buf` must be large enough and
/// the bytes at that offset must be a valid `T` (true for every header here: plain
/// data, no padding, every bit pattern valid).
///
/// # Safety
/// `buf[offset..offset + size_of::<T>()]` must be initialized and `T` must have no
/// invalid bit patterns — both hold for the `repr(C)` headers in this module.
pub unsafe fn read_at<T: Copy>(buf: &[u8], offset: usize) -> T {
    debug_assert!(buf.len() >= offset + size_of::<T>());
    core::ptr::read_unaligned(buf.as_ptr().add(offset) as *const T)
}
