//! XDP filter for the OpenSPA UDP port.
//!
//! Datagrams to the configured port must look like an OpenSPA request and
//! carry one of the two ADK proofs userspace keeps in `xdp_config_map`;
//! everything else addressed to the port is dropped before it reaches the
//! socket. Other traffic passes untouched.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{Array, PerCpuArray},
    programs::XdpContext,
};
use core::mem::size_of;

const CONFIG_SERVER_PORT: u32 = 0;
const CONFIG_ADK_PROOF_FIRST: u32 = 1;
const CONFIG_ADK_PROOF_LAST: u32 = 2;

const STAT_NOT_OPENSPA: u32 = 0;
const STAT_ADK_PROOF_INVALID: u32 = 1;
const STAT_ADK_PROOF_VALID: u32 = 2;

const XDP_ACTION_MAX: u32 = 5;

const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
const ETH_P_8021Q: u16 = 0x8100;
const ETH_P_8021AD: u16 = 0x88A8;
const IPPROTO_UDP: u8 = 17;
const VLAN_MAX_DEPTH: usize = 2;

const OPENSPA_VERSION: u8 = 1;
/// Smallest body that can follow the header of a real request.
const OPENSPA_BODY_MIN: usize = 42;

#[map(name = "xdp_config_map")]
static CONFIG: Array<u32> = Array::with_max_entries(CONFIG_ADK_PROOF_LAST + 1, 0);

#[map(name = "xdp_stats_map")]
static STATS: PerCpuArray<StatsDatarec> = PerCpuArray::with_max_entries(XDP_ACTION_MAX, 0);

#[map(name = "xdp_openspa_stats_map")]
static OPENSPA_STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(3, 0);

#[repr(C)]
#[derive(Clone, Copy)]
struct StatsDatarec {
    rx_packets: u64,
    rx_bytes: u64,
}

#[repr(C)]
struct EthHdr {
    h_dest: [u8; 6],
    h_source: [u8; 6],
    h_proto: u16,
}

#[repr(C)]
struct VlanHdr {
    tci: u16,
    encapsulated_proto: u16,
}

#[repr(C)]
struct IpHdr {
    version_ihl: u8,
    tos: u8,
    tot_len: u16,
    id: u16,
    frag_off: u16,
    ttl: u8,
    protocol: u8,
    check: u16,
    saddr: u32,
    daddr: u32,
}

#[repr(C)]
struct Ipv6Hdr {
    version_tc_flow: u32,
    payload_len: u16,
    nexthdr: u8,
    hop_limit: u8,
    saddr: [u8; 16],
    daddr: [u8; 16],
}

#[repr(C)]
struct UdpHdr {
    source: u16,
    dest: u16,
    len: u16,
    check: u16,
}

#[repr(C)]
struct OspaHdr {
    control: u8,
    transaction_id: u8,
    cipher_suite: u8,
    reserved: u8,
    adk_proof: u32,
}

#[xdp]
pub fn xdp_openspa_adk(ctx: XdpContext) -> u32 {
    let action = match try_filter(&ctx) {
        Ok(action) => action,
        Err(()) => xdp_action::XDP_ABORTED,
    };
    record_action(&ctx, action)
}

fn try_filter(ctx: &XdpContext) -> Result<u32, ()> {
    let eth: *const EthHdr = ptr_at(ctx, 0)?;
    let mut proto = u16::from_be(unsafe { (*eth).h_proto });
    let mut offset = size_of::<EthHdr>();

    for _ in 0..VLAN_MAX_DEPTH {
        if proto != ETH_P_8021Q && proto != ETH_P_8021AD {
            break;
        }
        let vlan: *const VlanHdr = ptr_at(ctx, offset)?;
        proto = u16::from_be(unsafe { (*vlan).encapsulated_proto });
        offset += size_of::<VlanHdr>();
    }

    let l4_proto = match proto {
        ETH_P_IP => {
            let ip: *const IpHdr = ptr_at(ctx, offset)?;
            let ihl = (unsafe { (*ip).version_ihl } & 0x0f) as usize * 4;
            if ihl < size_of::<IpHdr>() {
                return Err(());
            }
            offset += ihl;
            unsafe { (*ip).protocol }
        }
        ETH_P_IPV6 => {
            let ip: *const Ipv6Hdr = ptr_at(ctx, offset)?;
            offset += size_of::<Ipv6Hdr>();
            unsafe { (*ip).nexthdr }
        }
        _ => return Ok(xdp_action::XDP_PASS),
    };
    if l4_proto != IPPROTO_UDP {
        return Ok(xdp_action::XDP_PASS);
    }

    let udp: *const UdpHdr = ptr_at(ctx, offset)?;
    offset += size_of::<UdpHdr>();

    let server_port = server_port();
    if server_port == 0 || u16::from_be(unsafe { (*udp).dest }) != server_port {
        return Ok(xdp_action::XDP_PASS);
    }

    let hdr: *const OspaHdr = match ptr_at(ctx, offset) {
        Ok(hdr) => hdr,
        Err(()) => {
            record_openspa(STAT_NOT_OPENSPA);
            return Ok(xdp_action::XDP_DROP);
        }
    };
    offset += size_of::<OspaHdr>();

    let version = (unsafe { (*hdr).control } & 0x70) >> 4;
    if version != OPENSPA_VERSION || ctx.data() + offset + OPENSPA_BODY_MIN > ctx.data_end() {
        record_openspa(STAT_NOT_OPENSPA);
        return Ok(xdp_action::XDP_DROP);
    }

    let proof = u32::from_be(unsafe { (*hdr).adk_proof });
    if proof_valid(proof) {
        record_openspa(STAT_ADK_PROOF_VALID);
        Ok(xdp_action::XDP_PASS)
    } else {
        record_openspa(STAT_ADK_PROOF_INVALID);
        Ok(xdp_action::XDP_DROP)
    }
}

fn server_port() -> u16 {
    match CONFIG.get(CONFIG_SERVER_PORT) {
        Some(port) => *port as u16,
        None => 0,
    }
}

// A zero proof never matches; userspace writes zero before the first sync.
fn proof_valid(proof: u32) -> bool {
    if proof == 0 {
        return false;
    }
    let mut idx = CONFIG_ADK_PROOF_FIRST;
    while idx <= CONFIG_ADK_PROOF_LAST {
        match CONFIG.get(idx) {
            Some(expected) if *expected == proof => return true,
            Some(_) => {}
            None => return false,
        }
        idx += 1;
    }
    false
}

fn record_openspa(id: u32) {
    if let Some(counter) = OPENSPA_STATS.get_ptr_mut(id) {
        unsafe { *counter += 1 };
    }
}

fn record_action(ctx: &XdpContext, action: u32) -> u32 {
    if action >= XDP_ACTION_MAX {
        return xdp_action::XDP_ABORTED;
    }
    match STATS.get_ptr_mut(action) {
        Some(rec) => {
            unsafe {
                (*rec).rx_packets += 1;
                (*rec).rx_bytes += (ctx.data_end() - ctx.data()) as u64;
            }
            action
        }
        None => xdp_action::XDP_ABORTED,
    }
}

#[inline(always)]
fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    if start + offset + size_of::<T>() > end {
        return Err(());
    }
    Ok((start + offset) as *const T)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 4] = *b"GPL\0";
