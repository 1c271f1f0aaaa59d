//! Normalization helpers for device identifiers.
//!
//! MAC addresses are normalized to lowercase colon-separated form
//! (`00:11:22:33:44:55`), IPv4 addresses to dotted-quad form and UUIDs to
//! lowercase hyphenated form. Normalization is idempotent.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{ProvdError, Result};

fn mac_addr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[\da-fA-F]{1,2}([:-]?)(?:[\da-fA-F]{1,2}\1){4}[\da-fA-F]{1,2}$")
            .unwrap()
    })
}

fn normed_mac_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:[\da-f]{2}:){5}[\da-f]{2}$").unwrap())
}

fn normed_uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[\da-f]{8}-[\da-f]{4}-[\da-f]{4}-[\da-f]{4}-[\da-f]{12}$").unwrap()
    })
}

/// Parse a human-readable MAC address into its 6 octets.
///
/// Accepted forms include `00:1a:2b:3c:4d:5e`, `00-1A-2B-3C-4D-5E`,
/// `001a2b3c4d5e` and single-digit octets like `00:A:2B:C:d:5e`.
fn to_mac(mac: &str) -> Result<[u8; 6]> {
    let caps = mac_addr_re()
        .captures(mac)
        .ok_or_else(|| ProvdError::InvalidDocument(format!("invalid MAC string: {mac}")))?;

    let sep = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let mut octets = [0u8; 6];
    if sep.is_empty() {
        // no separator - length must be exactly 12 in this case
        if mac.len() != 12 {
            return Err(ProvdError::InvalidDocument(format!(
                "invalid MAC string: {mac}"
            )));
        }
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&mac[i * 2..i * 2 + 2], 16)
                .map_err(|_| ProvdError::InvalidDocument(format!("invalid MAC string: {mac}")))?;
        }
    } else {
        for (i, token) in mac.split(sep).enumerate() {
            octets[i] = u8::from_str_radix(token, 16)
                .map_err(|_| ProvdError::InvalidDocument(format!("invalid MAC string: {mac}")))?;
        }
    }
    Ok(octets)
}

/// Return the lowercase colon-separated representation of a MAC address.
///
/// ```
/// # use provd_core::util::norm_mac;
/// assert_eq!(norm_mac("0011223344AA").unwrap(), "00:11:22:33:44:aa");
/// assert_eq!(norm_mac("00-11-22-33-44-AA").unwrap(), "00:11:22:33:44:aa");
/// ```
pub fn norm_mac(mac: &str) -> Result<String> {
    let octets = to_mac(mac)?;
    Ok(octets
        .iter()
        .map(|o| format!("{o:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

/// True if the MAC address string is already in normalized form.
pub fn is_normed_mac(mac: &str) -> bool {
    normed_mac_re().is_match(mac)
}

/// Return a freely formatted representation of a MAC address string.
pub fn format_mac(mac: &str, separator: &str, uppercase: bool) -> Result<String> {
    let octets = to_mac(mac)?;
    let fmt = |o: &u8| {
        if uppercase {
            format!("{o:02X}")
        } else {
            format!("{o:02x}")
        }
    };
    Ok(octets.iter().map(fmt).collect::<Vec<_>>().join(separator))
}

/// Return the dotted-quad representation of an IPv4 address string.
pub fn norm_ip(ip: &str) -> Result<String> {
    let addr: std::net::Ipv4Addr = ip
        .parse()
        .map_err(|_| ProvdError::InvalidDocument(format!("invalid IPv4 address: {ip}")))?;
    Ok(addr.to_string())
}

/// True if the IP address string is a valid dotted quad.
pub fn is_normed_ip(ip: &str) -> bool {
    let digits: Vec<&str> = ip.split('.').collect();
    if digits.len() != 4 {
        return false;
    }
    digits.iter().all(|d| {
        // reject forms the parser would accept but we do not, e.g. "01"
        !d.is_empty() && d.parse::<u8>().is_ok() && (*d == "0" || !d.starts_with('0'))
    })
}

/// Return the lowercase hyphenated representation of a UUID string.
pub fn norm_uuid(uuid: &str) -> Result<String> {
    let lower = uuid.to_lowercase();
    if is_normed_uuid(&lower) {
        return Ok(lower);
    }
    Err(ProvdError::InvalidDocument(format!("invalid uuid: {uuid}")))
}

/// True if the UUID string is in normalized format.
pub fn is_normed_uuid(uuid: &str) -> bool {
    normed_uuid_re().is_match(uuid)
}
