//! Admin info protocol: request/response exchange and response parsers.
//!
//! Administrative requests (identity probe, peer list, partition ownership,
//! rack ids) are one request/response exchange over a pooled connection. The
//! request frame carries newline-separated command names; the response frame
//! carries `name\tvalue` lines, one per requested name.

use crate::cluster::host::Host;
use crate::error::{Error, Result};
use crate::net::connection::Connection;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use std::time::Duration;

/// Issue an info request for `names` and collect the response map.
pub async fn request(
    conn: &mut Connection,
    names: &[&str],
    timeout: Duration,
) -> Result<HashMap<String, String>> {
    let mut payload = String::new();
    for name in names {
        payload.push_str(name);
        payload.push('\n');
    }

    conn.write_frame(payload.as_bytes(), timeout).await?;
    let frame = conn.read_frame(timeout).await?;

    let text = std::str::from_utf8(&frame)
        .map_err(|_| Error::Parse("info response is not valid UTF-8".into()))?;

    let mut values = HashMap::with_capacity(names.len());
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        match line.split_once('\t') {
            Some((name, value)) => {
                values.insert(name.to_string(), value.to_string());
            }
            None => {
                return Err(Error::Parse(format!(
                    "malformed info response line '{line}'"
                )));
            }
        }
    }
    Ok(values)
}

/// Issue an info request for a single name.
pub async fn request_single(
    conn: &mut Connection,
    name: &str,
    timeout: Duration,
) -> Result<String> {
    let mut values = request(conn, &[name], timeout).await?;
    values
        .remove(name)
        .ok_or_else(|| Error::Parse(format!("info response missing '{name}'")))
}

/// One peer entry from a `peers` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// The peer's stable node name.
    pub name: String,
    /// TLS name shared by the peer's hosts, if any.
    pub tls_name: Option<String>,
    /// Addresses the peer is reachable under.
    pub hosts: Vec<Host>,
}

/// Parsed `peers` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerList {
    /// Peers-list generation reported by the node.
    pub generation: i64,
    /// Port to assume for peer hosts that omit one.
    pub default_port: u16,
    /// Reported neighbors.
    pub peers: Vec<Peer>,
}

/// Parse a `peers` value:
/// `<generation>,<defaultPort>,[[<name>,<tlsName>,[<host:port>,...]],...]`.
pub fn parse_peers(value: &str) -> Result<PeerList> {
    let (generation, rest) = value
        .split_once(',')
        .ok_or_else(|| Error::Parse(format!("peers response missing generation: '{value}'")))?;
    let (port, list) = rest
        .split_once(',')
        .ok_or_else(|| Error::Parse(format!("peers response missing default port: '{value}'")))?;

    let generation = generation
        .parse::<i64>()
        .map_err(|_| Error::Parse(format!("invalid peers generation '{generation}'")))?;
    let default_port = if port.is_empty() {
        3000
    } else {
        port.parse::<u16>()
            .map_err(|_| Error::Parse(format!("invalid peers default port '{port}'")))?
    };

    let list = list.trim();
    if !list.starts_with('[') || !list.ends_with(']') {
        return Err(Error::Parse(format!("peers list not bracketed: '{list}'")));
    }
    let inner = &list[1..list.len() - 1];

    let mut peers = Vec::new();
    for entry in split_bracketed(inner) {
        peers.push(parse_peer_entry(&entry, default_port)?);
    }

    Ok(PeerList {
        generation,
        default_port,
        peers,
    })
}

/// Split `[a,..],[b,..],..` into its top-level bracketed entries.
fn split_bracketed(s: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut start = None;

    for (i, ch) in s.char_indices() {
        match ch {
            '[' => {
                if depth == 0 {
                    start = Some(i + 1);
                }
                depth += 1;
            }
            ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(begin) = start.take() {
                        entries.push(s[begin..i].to_string());
                    }
                }
            }
            _ => {}
        }
    }
    entries
}

/// Parse one `<name>,<tlsName>,[<host:port>,...]` peer entry.
fn parse_peer_entry(entry: &str, default_port: u16) -> Result<Peer> {
    let (name, rest) = entry
        .split_once(',')
        .ok_or_else(|| Error::Parse(format!("peer entry missing name: '{entry}'")))?;
    let (tls_name, hosts_part) = rest
        .split_once(',')
        .ok_or_else(|| Error::Parse(format!("peer entry missing tls name: '{entry}'")))?;

    if name.is_empty() {
        return Err(Error::Parse(format!("peer entry has empty name: '{entry}'")));
    }

    let hosts_part = hosts_part.trim();
    if !hosts_part.starts_with('[') || !hosts_part.ends_with(']') {
        return Err(Error::Parse(format!(
            "peer hosts not bracketed: '{hosts_part}'"
        )));
    }

    let tls_name = if tls_name.is_empty() {
        None
    } else {
        Some(tls_name.to_string())
    };

    let mut hosts = Vec::new();
    for raw in hosts_part[1..hosts_part.len() - 1].split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let mut host = Host::parse(raw, default_port)?;
        host.tls_name = tls_name.clone();
        hosts.push(host);
    }

    if hosts.is_empty() {
        return Err(Error::Parse(format!("peer '{name}' reported no hosts")));
    }

    Ok(Peer {
        name: name.to_string(),
        tls_name,
        hosts,
    })
}

/// Per-namespace ownership bitmaps from a `replicas` response, one bitmap
/// per replica index.
pub type NamespaceBitmaps = Vec<(String, Vec<Vec<u8>>)>;

/// Parse a `replicas` value:
/// `<ns>:<replicaCount>,<b64>,<b64>...;...` or the legacy single-replica
/// form `<ns>:<b64>;...`. Bit *i* set means this node owns partition *i* at
/// that replica index.
pub fn parse_replicas(value: &str) -> Result<NamespaceBitmaps> {
    let mut namespaces = Vec::new();

    for section in value.split(';') {
        let section = section.trim();
        if section.is_empty() {
            continue;
        }

        let (namespace, body) = section
            .split_once(':')
            .ok_or_else(|| Error::Parse(format!("replicas section missing namespace: '{section}'")))?;

        let segments: Vec<&str> = body.split(',').collect();
        let bitmaps = match segments[0].parse::<usize>() {
            Ok(count) if segments.len() == count + 1 => segments[1..]
                .iter()
                .map(|b64| decode_bitmap(namespace, b64))
                .collect::<Result<Vec<_>>>()?,
            // Legacy single-replica form: the whole body is one bitmap.
            _ if segments.len() == 1 => vec![decode_bitmap(namespace, segments[0])?],
            Ok(count) => {
                return Err(Error::Parse(format!(
                    "replicas section for '{namespace}' declares {count} bitmaps, found {}",
                    segments.len() - 1
                )));
            }
            Err(_) => {
                return Err(Error::Parse(format!(
                    "malformed replicas section for '{namespace}'"
                )));
            }
        };

        namespaces.push((namespace.to_string(), bitmaps));
    }

    Ok(namespaces)
}

fn decode_bitmap(namespace: &str, b64: &str) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| Error::Parse(format!("bad ownership bitmap for '{namespace}': {e}")))?;
    if bytes.len() < crate::types::PARTITIONS / 8 {
        return Err(Error::Parse(format!(
            "ownership bitmap for '{namespace}' is {} bytes, expected at least {}",
            bytes.len(),
            crate::types::PARTITIONS / 8
        )));
    }
    Ok(bytes)
}

/// Test a partition bit in an ownership bitmap (MSB-first within each byte).
pub fn bit_set(bitmap: &[u8], partition_id: usize) -> bool {
    bitmap[partition_id >> 3] & (0x80 >> (partition_id & 7)) != 0
}

/// Parse a `racks` value: `<ns>:<rackId>;...`. Malformed sections are
/// skipped; a node with unparsable rack info just loses rack preference.
pub fn parse_racks(value: &str) -> Vec<(String, u32)> {
    let mut racks = Vec::new();
    for section in value.split(';') {
        let section = section.trim();
        if section.is_empty() {
            continue;
        }
        if let Some((ns, rack)) = section.split_once(':') {
            if let Ok(rack) = rack.parse::<u32>() {
                racks.push((ns.to_string(), rack));
            }
        }
    }
    racks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PARTITIONS;

    fn encode_bitmap(partitions: &[usize]) -> String {
        let mut bytes = vec![0u8; PARTITIONS / 8];
        for &p in partitions {
            bytes[p >> 3] |= 0x80 >> (p & 7);
        }
        BASE64.encode(bytes)
    }

    #[test]
    fn test_parse_peers_basic() {
        let value = "12,3000,[[BB9040011AB4202,,[172.16.0.4:3000,10.0.0.4]],[CC9040011AB4202,tls.internal,[172.16.0.5]]]";
        let list = parse_peers(value).unwrap();

        assert_eq!(list.generation, 12);
        assert_eq!(list.default_port, 3000);
        assert_eq!(list.peers.len(), 2);

        let first = &list.peers[0];
        assert_eq!(first.name, "BB9040011AB4202");
        assert!(first.tls_name.is_none());
        assert_eq!(first.hosts.len(), 2);
        assert_eq!(first.hosts[1].port, 3000, "default port applies");

        let second = &list.peers[1];
        assert_eq!(second.tls_name.as_deref(), Some("tls.internal"));
        assert_eq!(second.hosts[0].tls_name.as_deref(), Some("tls.internal"));
    }

    #[test]
    fn test_parse_peers_empty_list() {
        let list = parse_peers("3,3000,[]").unwrap();
        assert_eq!(list.generation, 3);
        assert!(list.peers.is_empty());
    }

    #[test]
    fn test_parse_peers_rejects_malformed() {
        assert!(parse_peers("not-a-gen,3000,[]").is_err());
        assert!(parse_peers("1").is_err());
        assert!(parse_peers("1,3000,[[,,[h:1]]]").is_err());
    }

    #[test]
    fn test_parse_replicas_multi() {
        let value = format!(
            "test:2,{},{};bar:1,{}",
            encode_bitmap(&[0, 5, 4095]),
            encode_bitmap(&[7]),
            encode_bitmap(&[100])
        );
        let parsed = parse_replicas(&value).unwrap();

        assert_eq!(parsed.len(), 2);
        let (ns, bitmaps) = &parsed[0];
        assert_eq!(ns, "test");
        assert_eq!(bitmaps.len(), 2);
        assert!(bit_set(&bitmaps[0], 0));
        assert!(bit_set(&bitmaps[0], 5));
        assert!(bit_set(&bitmaps[0], 4095));
        assert!(!bit_set(&bitmaps[0], 6));
        assert!(bit_set(&bitmaps[1], 7));

        let (ns, bitmaps) = &parsed[1];
        assert_eq!(ns, "bar");
        assert_eq!(bitmaps.len(), 1);
        assert!(bit_set(&bitmaps[0], 100));
    }

    #[test]
    fn test_parse_replicas_legacy_single() {
        let value = format!("test:{}", encode_bitmap(&[42]));
        let parsed = parse_replicas(&value).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].1.len(), 1);
        assert!(bit_set(&parsed[0].1[0], 42));
    }

    #[test]
    fn test_parse_replicas_rejects_short_bitmap() {
        let short = BASE64.encode(vec![0u8; 16]);
        assert!(parse_replicas(&format!("test:{short}")).is_err());
    }

    #[test]
    fn test_parse_replicas_rejects_count_mismatch() {
        let bitmap = encode_bitmap(&[1]);
        assert!(parse_replicas(&format!("test:3,{bitmap}")).is_err());
    }

    #[test]
    fn test_parse_racks() {
        let racks = parse_racks("test:2;bar:7;junk;also:bad");
        assert_eq!(racks, vec![("test".into(), 2), ("bar".into(), 7)]);
    }
}
