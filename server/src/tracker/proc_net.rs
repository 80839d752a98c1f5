//! Parsers for the kernel's `/proc/net/tcp` and `/proc/net/tcp6` tables.
//!
//! Each address is printed as hex of one (IPv4) or four (IPv6) 32-bit words
//! in host byte order, so on little-endian machines the bytes of every word
//! are reversed relative to network order.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// `st` column value for an established connection
const TCP_ESTABLISHED: &str = "01";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint {0:?} is not ADDR:PORT")]
    MissingPort(String),

    #[error("address {0:?} has {1} hex digits, expected 8 or 32")]
    BadAddressLength(String, usize),

    #[error("invalid hex in {0:?}")]
    BadHex(String),
}

/// One established TCP socket as listed in the kernel table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local:    SocketAddr,
    pub remote:   SocketAddr,
    pub tx_queue: u64,
    pub rx_queue: u64,
    pub inode:    u64,
}

/// Decodes an 8-digit IPv4 endpoint such as `0100007F:0050`
pub fn parse_ipv4_endpoint(field: &str) -> Result<SocketAddr, EndpointError> {
    let (addr, port) = split_endpoint(field)?;
    if addr.len() != 8 {
        return Err(EndpointError::BadAddressLength(addr.to_string(), addr.len()));
    }
    let mut bytes = [0u8; 4];
    hex::decode_to_slice(addr, &mut bytes).map_err(|_| EndpointError::BadHex(field.to_string()))?;
    host_words_to_network(&mut bytes);

    Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(bytes)), port))
}

/// Decodes a 32-digit IPv6 endpoint such as
/// `00000000000000000000000001000000:0050`
pub fn parse_ipv6_endpoint(field: &str) -> Result<SocketAddr, EndpointError> {
    let (addr, port) = split_endpoint(field)?;
    if addr.len() != 32 {
        return Err(EndpointError::BadAddressLength(addr.to_string(), addr.len()));
    }
    let mut bytes = [0u8; 16];
    hex::decode_to_slice(addr, &mut bytes).map_err(|_| EndpointError::BadHex(field.to_string()))?;
    host_words_to_network(&mut bytes);

    Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(bytes)), port))
}

/// Picks the IPv4 or IPv6 decoder from the address width
pub fn parse_endpoint(field: &str) -> Result<SocketAddr, EndpointError> {
    let (addr, _) = split_endpoint(field)?;
    match addr.len() {
        8 => parse_ipv4_endpoint(field),
        32 => parse_ipv6_endpoint(field),
        n => Err(EndpointError::BadAddressLength(addr.to_string(), n)),
    }
}

fn split_endpoint(field: &str) -> Result<(&str, u16), EndpointError> {
    let (addr, port) = field
        .split_once(':')
        .ok_or_else(|| EndpointError::MissingPort(field.to_string()))?;
    let port =
        u16::from_str_radix(port, 16).map_err(|_| EndpointError::BadHex(field.to_string()))?;
    Ok((addr, port))
}

/// Reverses each 4-byte word on little-endian hosts
fn host_words_to_network(bytes: &mut [u8]) {
    if cfg!(target_endian = "little") {
        for word in bytes.chunks_exact_mut(4) {
            word.reverse();
        }
    }
}

/// Parses one data row, returning `None` for rows that are not established
/// connections or that fail to parse.
///
/// Row layout: `sl local rem st tx_queue:rx_queue tr:when retrnsmt uid timeout inode ...`
pub fn parse_line(line: &str) -> Option<SocketEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    if fields[3] != TCP_ESTABLISHED {
        return None;
    }

    let local = match parse_endpoint(fields[1]) {
        Ok(addr) => addr,
        Err(e) => {
            tracing::trace!("Skipping row with bad local endpoint: {}", e);
            return None;
        }
    };
    let remote = match parse_endpoint(fields[2]) {
        Ok(addr) => addr,
        Err(e) => {
            tracing::trace!("Skipping row with bad remote endpoint: {}", e);
            return None;
        }
    };

    let (tx, rx) = fields[4].split_once(':')?;
    let tx_queue = u64::from_str_radix(tx, 16).ok()?;
    let rx_queue = u64::from_str_radix(rx, 16).ok()?;
    let inode = fields[9].parse::<u64>().ok()?;

    Some(SocketEntry {
        local,
        remote,
        tx_queue,
        rx_queue,
        inode,
    })
}

/// Parses a whole table, skipping the header row
pub fn parse_table(contents: &str) -> Vec<SocketEntry> {
    contents.lines().skip(1).filter_map(parse_line).collect()
}
