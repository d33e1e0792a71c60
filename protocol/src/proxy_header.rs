use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};

use common::err::proxy_error::ProxyError;
use common::err::PResult;

const PROXY_TEXT_SIG: &[u8] = b"PROXY";
const PROXY_BIN_SIG: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
const TEXT_HDR_MAX_LEN: usize = 107;

/// Address bytes per family in a binary header: addr + addr + port + port.
const BIN_LEN_INET4: u16 = 12;
const BIN_LEN_INET6: u16 = 36;
const BIN_LEN_UNIX: u16 = 216;
const UNIX_PATH_LEN: usize = 108;

/// Sanity cap; no real binary header comes close.
const BIN_HDR_MAX_TOTAL: usize = 10000;

/// The forwarded peer of a proxied connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    Unix(String),
}

/// Result of parsing a complete text or binary header.
///
/// `peer == None` with `is_proxy == false` covers the headers that carry no
/// forwarded address: text `UNKNOWN` and the binary LOCAL command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInfo {
    pub is_proxy: bool,
    pub peer: Option<PeerAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreParse {
    /// More bytes are needed before the header type or length is known.
    Incomplete,
    /// A complete text header of the given length is in the buffer.
    Text(usize),
    /// A binary header of the given total length; the buffer may still be
    /// short of it.
    Binary(usize),
}

/// Sniff the start of a fresh connection. Fails closed: anything that is
/// neither header form is an error, the connection should be dropped.
pub fn pre_parse_header(data: &[u8]) -> PResult<PreParse> {
    if data.len() < PROXY_TEXT_SIG.len() {
        let sig_bytes = data.len().min(PROXY_BIN_SIG.len());
        if data == &PROXY_TEXT_SIG[..data.len()] || data == &PROXY_BIN_SIG[..sig_bytes] {
            return Ok(PreParse::Incomplete);
        }
        return Err(ProxyError::ProxyHeaderErr(
            "data does not start with a proxy-protocol signature".to_string(),
        ));
    }

    if &data[..PROXY_TEXT_SIG.len()] == PROXY_TEXT_SIG {
        // Text header ends at the first '\n', max 107 bytes in total.
        return match data.iter().position(|b| *b == b'\n') {
            Some(pos) if pos + 1 <= TEXT_HDR_MAX_LEN => Ok(PreParse::Text(pos + 1)),
            Some(_) => Err(ProxyError::ProxyHeaderErr(
                "text header exceeds the 107-byte limit".to_string(),
            )),
            None if data.len() < TEXT_HDR_MAX_LEN => Ok(PreParse::Incomplete),
            None => Err(ProxyError::ProxyHeaderErr(
                "unterminated text header".to_string(),
            )),
        };
    }

    let sig_bytes = data.len().min(PROXY_BIN_SIG.len());
    if data[..sig_bytes] != PROXY_BIN_SIG[..sig_bytes] {
        return Err(ProxyError::ProxyHeaderErr(
            "data does not start with a proxy-protocol signature".to_string(),
        ));
    }

    // Binary: 12-byte signature, version/command, family, 2-byte BE length.
    let len_offset = PROXY_BIN_SIG.len() + 2;
    if data.len() < len_offset + 2 {
        return Ok(PreParse::Incomplete);
    }

    let remaining = BigEndian::read_u16(&data[len_offset..len_offset + 2]) as usize;
    let total = PROXY_BIN_SIG.len() + 2 + 2 + remaining;
    if total >= BIN_HDR_MAX_TOTAL {
        return Err(ProxyError::ProxyHeaderErr(format!(
            "binary header declares unreasonable length {}",
            total
        )));
    }

    Ok(PreParse::Binary(total))
}

/// Generate a v1 text header. When the address families of the two ends
/// differ, the client address doubles as the server address; the receiving
/// end only validates that field, it does not use it.
pub fn gen_text_header(client_addr: SocketAddr, server_addr: SocketAddr) -> PResult<String> {
    let family = match client_addr {
        SocketAddr::V4(_) => "TCP4",
        SocketAddr::V6(_) => "TCP6",
    };

    let same_families = matches!(
        (client_addr, server_addr),
        (SocketAddr::V4(_), SocketAddr::V4(_)) | (SocketAddr::V6(_), SocketAddr::V6(_))
    );

    let (eff_server_ip, eff_server_port) = if same_families {
        (server_addr.ip(), server_addr.port())
    } else {
        (client_addr.ip(), client_addr.port())
    };

    let header = format!(
        "PROXY {} {} {} {} {}\r\n",
        family,
        client_addr.ip(),
        eff_server_ip,
        client_addr.port(),
        eff_server_port
    );

    if header.len() > TEXT_HDR_MAX_LEN {
        return Err(ProxyError::ProxyHeaderErr(format!(
            "generated text header is {} bytes",
            header.len()
        )));
    }

    Ok(header)
}

/// Parse a complete v1 text header as delimited by [`pre_parse_header`].
pub fn parse_text_header(header: &[u8]) -> PResult<HeaderInfo> {
    let text = std::str::from_utf8(header)
        .map_err(|_| ProxyError::ProxyHeaderErr("text header is not UTF-8".to_string()))?;

    let mut tokens = text.split_ascii_whitespace();
    if tokens.next() != Some("PROXY") {
        return Err(ProxyError::ProxyHeaderErr(
            "missing PROXY signature".to_string(),
        ));
    }

    let family = tokens.next().ok_or_else(|| {
        ProxyError::ProxyHeaderErr("text header ends after the signature".to_string())
    })?;

    // Anything after UNKNOWN is ignored.
    if family == "UNKNOWN" {
        return Ok(HeaderInfo {
            is_proxy: false,
            peer: None,
        });
    }

    let mut next_field = |what: &str| {
        tokens
            .next()
            .ok_or_else(|| ProxyError::ProxyHeaderErr(format!("text header is missing {}", what)))
    };

    let client_address = next_field("the client address")?;
    let server_address = next_field("the server address")?;
    let client_port: u16 = next_field("the client port")?
        .parse()
        .map_err(|_| ProxyError::ProxyHeaderErr("invalid client port".to_string()))?;
    let _server_port: u16 = next_field("the server port")?
        .parse()
        .map_err(|_| ProxyError::ProxyHeaderErr("invalid server port".to_string()))?;

    let client_ip: IpAddr = client_address
        .parse()
        .map_err(|_| ProxyError::ProxyHeaderErr("invalid client address".to_string()))?;
    let server_ip: IpAddr = server_address
        .parse()
        .map_err(|_| ProxyError::ProxyHeaderErr("invalid server address".to_string()))?;

    let families_ok = match family {
        "TCP4" => client_ip.is_ipv4() && server_ip.is_ipv4(),
        "TCP6" => client_ip.is_ipv6() && server_ip.is_ipv6(),
        _ => false,
    };
    if !families_ok {
        return Err(ProxyError::ProxyHeaderErr(format!(
            "addresses do not match the declared family {}",
            family
        )));
    }

    Ok(HeaderInfo {
        is_proxy: true,
        peer: Some(PeerAddr::Inet(SocketAddr::new(client_ip, client_port))),
    })
}

/// Generate a v2 binary header.
pub fn gen_binary_header(client: &PeerAddr, server: &PeerAddr) -> Vec<u8> {
    let mut header = Vec::with_capacity(PROXY_BIN_SIG.len() + 4 + BIN_LEN_UNIX as usize);
    header.extend_from_slice(&PROXY_BIN_SIG);
    header.push(0x21); // version 2, command PROXY

    match client {
        PeerAddr::Inet(SocketAddr::V4(client4)) => {
            header.push(0x11);
            push_be_u16(&mut header, BIN_LEN_INET4);
            header.extend_from_slice(&client4.ip().octets());
            match server {
                PeerAddr::Inet(SocketAddr::V4(server4)) => {
                    header.extend_from_slice(&server4.ip().octets());
                    push_be_u16(&mut header, client4.port());
                    push_be_u16(&mut header, server4.port());
                }
                _ => {
                    header.extend_from_slice(&[0u8; 4]);
                    push_be_u16(&mut header, client4.port());
                    push_be_u16(&mut header, 0);
                }
            }
        }
        PeerAddr::Inet(SocketAddr::V6(client6)) => {
            header.push(0x21);
            push_be_u16(&mut header, BIN_LEN_INET6);
            header.extend_from_slice(&client6.ip().octets());
            match server {
                PeerAddr::Inet(SocketAddr::V6(server6)) => {
                    header.extend_from_slice(&server6.ip().octets());
                    push_be_u16(&mut header, client6.port());
                    push_be_u16(&mut header, server6.port());
                }
                _ => {
                    header.extend_from_slice(&[0u8; 16]);
                    push_be_u16(&mut header, client6.port());
                    push_be_u16(&mut header, 0);
                }
            }
        }
        PeerAddr::Unix(path) => {
            header.push(0x31);
            push_be_u16(&mut header, BIN_LEN_UNIX);
            push_unix_path(&mut header, path);
            match server {
                PeerAddr::Unix(server_path) => push_unix_path(&mut header, server_path),
                _ => header.extend(std::iter::repeat(0u8).take(UNIX_PATH_LEN)),
            }
        }
    }

    header
}

/// Parse a complete v2 binary header as delimited by [`pre_parse_header`].
pub fn parse_binary_header(header: &[u8]) -> PResult<HeaderInfo> {
    let sig_len = PROXY_BIN_SIG.len();
    if header.len() < sig_len + 4 || header[..sig_len] != PROXY_BIN_SIG {
        return Err(ProxyError::ProxyHeaderErr(
            "missing binary signature".to_string(),
        ));
    }

    let version = (header[sig_len] & 0xF0) >> 4;
    if version != 2 {
        return Err(ProxyError::ProxyHeaderErr(format!(
            "unsupported proxy-protocol version {}",
            version
        )));
    }

    let command = header[sig_len] & 0x0F;
    if command == 0 {
        // LOCAL: connection made by the proxy itself, no forwarded peer.
        return Ok(HeaderInfo {
            is_proxy: false,
            peer: None,
        });
    }
    if command != 1 {
        return Err(ProxyError::ProxyHeaderErr(format!(
            "unsupported command {:#x}",
            command
        )));
    }

    let family = header[sig_len + 1];
    let remaining = BigEndian::read_u16(&header[sig_len + 2..sig_len + 4]) as usize;
    let addr = &header[sig_len + 4..];
    if addr.len() < remaining {
        return Err(ProxyError::ProxyHeaderErr(
            "binary header is shorter than its declared length".to_string(),
        ));
    }

    let peer = match family {
        0x11 => {
            if remaining < BIN_LEN_INET4 as usize {
                return Err(ProxyError::ProxyHeaderErr(
                    "truncated IPv4 address block".to_string(),
                ));
            }
            let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            let port = BigEndian::read_u16(&addr[8..10]);
            PeerAddr::Inet(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x21 => {
            if remaining < BIN_LEN_INET6 as usize {
                return Err(ProxyError::ProxyHeaderErr(
                    "truncated IPv6 address block".to_string(),
                ));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr[0..16]);
            let port = BigEndian::read_u16(&addr[32..34]);
            PeerAddr::Inet(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        0x31 => {
            if remaining < BIN_LEN_UNIX as usize {
                return Err(ProxyError::ProxyHeaderErr(
                    "truncated unix address block".to_string(),
                ));
            }
            let path_bytes = &addr[..UNIX_PATH_LEN];
            let end = path_bytes.iter().position(|b| *b == 0).unwrap_or(UNIX_PATH_LEN);
            let path = String::from_utf8_lossy(&path_bytes[..end]).into_owned();
            PeerAddr::Unix(path)
        }
        other => {
            return Err(ProxyError::ProxyHeaderErr(format!(
                "unsupported address family {:#x}",
                other
            )));
        }
    };

    Ok(HeaderInfo {
        is_proxy: true,
        peer: Some(peer),
    })
}

fn push_be_u16(out: &mut Vec<u8>, value: u16) {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn push_unix_path(out: &mut Vec<u8>, path: &str) {
    let bytes = path.as_bytes();
    let used = bytes.len().min(UNIX_PATH_LEN);
    out.extend_from_slice(&bytes[..used]);
    out.extend(std::iter::repeat(0u8).take(UNIX_PATH_LEN - used));
}

//
// Allowed-network matching
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetFamily {
    V4,
    V6,
    Unix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    family: SubnetFamily,
    addr: [u8; 16],
    bits: u32,
}

impl Subnet {
    fn any(family: SubnetFamily) -> Self {
        Subnet {
            family,
            addr: [0u8; 16],
            bits: 0,
        }
    }
}

/// Parse a `proxy_protocol_networks` configuration value: a comma or space
/// separated list of addresses with optional mask bits, `localhost` for
/// unix sockets, or `*` for everything.
pub fn parse_networks_from_string(networks: &str) -> PResult<Vec<Subnet>> {
    if networks.is_empty() {
        return Ok(Vec::new());
    }
    if networks == "*" {
        return Ok(vec![
            Subnet::any(SubnetFamily::V4),
            Subnet::any(SubnetFamily::V6),
            Subnet::any(SubnetFamily::Unix),
        ]);
    }

    let mut subnets = Vec::new();
    for token in networks.split([',', ' ']).filter(|t| !t.is_empty()) {
        let subnet = parse_subnet(token)
            .ok_or_else(|| ProxyError::ProxyHeaderErr(format!("parse error near '{}'", token)))?;
        subnets.push(subnet);
    }
    Ok(subnets)
}

/// Whether a connecting peer is allowed to send a proxy header. An empty
/// subnet list allows nobody.
pub fn is_proxy_protocol_allowed(addr: &PeerAddr, allowed_subnets: &[Subnet]) -> bool {
    allowed_subnets
        .iter()
        .any(|subnet| addr_matches_subnet(addr, subnet))
}

fn parse_subnet(token: &str) -> Option<Subnet> {
    if token == "localhost" {
        return Some(Subnet::any(SubnetFamily::Unix));
    }

    let (addr_str, mask_str) = match token.split_once('/') {
        Some((addr, mask)) => (addr, Some(mask)),
        None => (token, None),
    };

    let (family, addr, max_bits) = if addr_str.contains(':') {
        let ip: Ipv6Addr = addr_str.parse().ok()?;
        let mut addr = [0u8; 16];
        addr.copy_from_slice(&ip.octets());
        (SubnetFamily::V6, addr, 128)
    } else if addr_str.contains('.') {
        let ip: Ipv4Addr = addr_str.parse().ok()?;
        let mut addr = [0u8; 16];
        addr[..4].copy_from_slice(&ip.octets());
        (SubnetFamily::V4, addr, 32)
    } else {
        return None;
    };

    let bits = match mask_str {
        None => max_bits,
        Some(mask) => {
            let bits: u32 = mask.parse().ok()?;
            if bits > max_bits {
                return None;
            }
            bits
        }
    };

    normalize_subnet(Subnet { family, addr, bits })
}

/// IPv4-mapped and IPv4-compatible IPv6, excluding `::` and `::1` which
/// only look compatible.
fn v6_to_v4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if ip == Ipv6Addr::LOCALHOST || ip == Ipv6Addr::UNSPECIFIED {
        None
    } else {
        ip.to_ipv4()
    }
}

/// IPv4-mapped and IPv4-compatible IPv6 subnets degrade to plain IPv4 so
/// that they match clients that connected over IPv4.
fn normalize_subnet(mut subnet: Subnet) -> Option<Subnet> {
    if subnet.family == SubnetFamily::V6 {
        let ip = Ipv6Addr::from(subnet.addr);
        if let Some(ip4) = v6_to_v4(ip) {
            if subnet.bits < 96 {
                return None;
            }
            subnet.family = SubnetFamily::V4;
            let mut addr = [0u8; 16];
            addr[..4].copy_from_slice(&ip4.octets());
            subnet.addr = addr;
            subnet.bits -= 96;
        }
    }
    Some(subnet)
}

fn addr_matches_subnet(addr: &PeerAddr, subnet: &Subnet) -> bool {
    match addr {
        PeerAddr::Unix(_) => subnet.family == SubnetFamily::Unix,
        PeerAddr::Inet(sockaddr) => {
            // Normalize the peer the same way subnets are normalized.
            let ip = match sockaddr.ip() {
                IpAddr::V6(ip6) => match v6_to_v4(ip6) {
                    Some(ip4) => IpAddr::V4(ip4),
                    None => IpAddr::V6(ip6),
                },
                ip4 => ip4,
            };

            match (ip, subnet.family) {
                (IpAddr::V4(ip), SubnetFamily::V4) => {
                    compare_bits(&ip.octets(), &subnet.addr[..4], subnet.bits)
                }
                (IpAddr::V6(ip), SubnetFamily::V6) => {
                    compare_bits(&ip.octets(), &subnet.addr, subnet.bits)
                }
                _ => false,
            }
        }
    }
}

/// Prefix comparison; the length is in bits, not bytes.
fn compare_bits(lhs: &[u8], rhs: &[u8], n_bits: u32) -> bool {
    let n_bytes = (n_bits / 8) as usize;
    if lhs[..n_bytes] != rhs[..n_bytes] {
        return false;
    }

    let bits_remaining = n_bits % 8;
    if bits_remaining > 0 {
        let shift = 8 - bits_remaining;
        if (lhs[n_bytes] >> shift) != (rhs[n_bytes] >> shift) {
            return false;
        }
    }
    true
}
