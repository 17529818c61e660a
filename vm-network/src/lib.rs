//! Network identity allocation for microVMs.
//!
//! Every VM owns one /30 subnet inside `172.16.0.0/16`. The subnet is
//! derived purely from the VM's numeric id, so two VMs with distinct ids
//! never collide and no allocation table has to be kept:
//!
//! ```text
//! offset(id, k) = 4 * id + k        k = 1 for the host TAP, 2 for the guest
//! ip            = 172.16.(offset / 256).(offset % 256)
//! ```
//!
//! The guest MAC address embeds the two low octets of the guest IP.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// First two octets of the private range handed out to VMs.
pub const BASE_OCTETS: [u8; 2] = [172, 16];

/// Prefix length of each per-VM subnet.
pub const SUBNET_PREFIX_LEN: u8 = 30;

/// Netmask matching [`SUBNET_PREFIX_LEN`].
pub const SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 252);

/// Largest id whose /30 subnet still fits in the /16 without wrapping.
pub const MAX_VM_ID: u64 = (u16::MAX as u64 - 3) / 4;

/// MAC returned for addresses outside the VM range.
pub const FALLBACK_MAC: &str = "06:00:AC:10:00:00";

const MAC_PREFIX: &str = "06:00:AC:10";
const TAP_HOST_OFFSET: u64 = 1;
const GUEST_OFFSET: u64 = 2;

/// Host-side and guest-side addresses of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPair {
    pub tap_ip: Ipv4Addr,
    pub vm_ip: Ipv4Addr,
    pub mac: String,
}

/// Full network identity persisted on a VM record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub tap_device: String,
    pub tap_ip: Ipv4Addr,
    pub vm_ip: Ipv4Addr,
    pub mac: String,
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} -> {} ({})",
            self.tap_device, self.tap_ip, SUBNET_PREFIX_LEN, self.vm_ip, self.mac
        )
    }
}

/// Whether `vm_id` gets a subnet of its own without wrapping around the range.
pub fn fits(vm_id: u64) -> bool {
    vm_id <= MAX_VM_ID
}

/// Compute the TAP/VM address pair for a VM id.
///
/// Total over all inputs: ids past [`MAX_VM_ID`] wrap modulo the /16.
/// Callers that need uniqueness must check [`fits`] first.
pub fn addresses(vm_id: u64) -> AddressPair {
    let tap_ip = ip_at(vm_id, TAP_HOST_OFFSET);
    let vm_ip = ip_at(vm_id, GUEST_OFFSET);
    let mac = mac_for_ip(&vm_ip.to_string());

    AddressPair { tap_ip, vm_ip, mac }
}

/// Compute the complete network identity, including the TAP device name.
pub fn identity(vm_id: u64) -> NetworkIdentity {
    let AddressPair { tap_ip, vm_ip, mac } = addresses(vm_id);

    NetworkIdentity {
        tap_device: tap_device_name(vm_id),
        tap_ip,
        vm_ip,
        mac,
    }
}

pub fn tap_device_name(vm_id: u64) -> String {
    format!("tap{}", vm_id)
}

/// Derive a guest MAC address from an IP in the VM range.
///
/// Malformed input or an address outside `172.16.0.0/16` yields
/// [`FALLBACK_MAC`].
pub fn mac_for_ip(ip: &str) -> String {
    match ip.trim().parse::<Ipv4Addr>() {
        Ok(addr) => {
            let [a, b, c, d] = addr.octets();
            if [a, b] == BASE_OCTETS {
                format!("{}:{:02x}:{:02x}", MAC_PREFIX, c, d)
            } else {
                FALLBACK_MAC.to_string()
            }
        }
        Err(_) => FALLBACK_MAC.to_string(),
    }
}

fn ip_at(vm_id: u64, k: u64) -> Ipv4Addr {
    let offset = vm_id.wrapping_mul(4).wrapping_add(k) % 65_536;
    Ipv4Addr::new(
        BASE_OCTETS[0],
        BASE_OCTETS[1],
        (offset / 256) as u8,
        (offset % 256) as u8,
    )
}
