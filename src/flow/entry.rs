use std::net::Ipv4Addr;

/// Maximum value of the 6-bit per-flow packet counter.
pub const PACKET_COUNT_MAX: u8 = 63;

/// Unidirectional 5-tuple identifying a flow.
///
/// Keys are compared for exact equality; the byte layout produced by
/// [`FlowKey::hash_bytes`] is the fixed input to the table's hash function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl Default for FlowKey {
    fn default() -> Self {
        Self {
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            protocol: 0,
            src_port: 0,
            dst_port: 0,
        }
    }
}

impl FlowKey {
    /// Byte layout hashed by the table: source IP, destination IP, source
    /// port, destination port, protocol — all in network byte order.
    pub fn hash_bytes(&self) -> [u8; 13] {
        let mut bytes = [0u8; 13];
        bytes[0..4].copy_from_slice(&self.src_ip.octets());
        bytes[4..8].copy_from_slice(&self.dst_ip.octets());
        bytes[8..10].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[10..12].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[12] = self.protocol;
        bytes
    }
}

/// Slot state tag.
///
/// `Empty` terminates a probe sequence on lookup-miss; `Deleted` is a
/// tombstone that keeps probe chains intact and is reusable by inserts.
/// A slot never returns to `Empty` once it has left it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Occupancy {
    #[default]
    Empty,
    /// Live, not yet serialized by the update writer.
    Unsent,
    /// Live, already serialized.
    Sent,
    Deleted,
}

impl Occupancy {
    /// Whether the slot currently holds a live flow (sent or unsent).
    pub fn is_live(self) -> bool {
        matches!(self, Occupancy::Unsent | Occupancy::Sent)
    }
}

/// One slot of the flow table.
///
/// `last_update_offset` holds `last_update_seconds - base_timestamp_seconds`
/// and is kept within [`MIN_OFFSET`, `MAX_OFFSET`] by the insert gate and by
/// rebasing. `packet_count` saturates at [`PACKET_COUNT_MAX`] and only moves
/// while the slot is `Unsent`.
///
/// [`MIN_OFFSET`]: super::table::MIN_OFFSET
/// [`MAX_OFFSET`]: super::table::MAX_OFFSET
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowEntry {
    pub key: FlowKey,
    pub occupancy: Occupancy,
    pub last_update_offset: i32,
    pub packet_count: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_bytes_layout() {
        let key = FlowKey {
            src_ip: Ipv4Addr::new(1, 2, 3, 4),
            dst_ip: Ipv4Addr::new(5, 6, 7, 8),
            protocol: 6,
            src_port: 0x1234,
            dst_port: 0xabcd,
        };

        let bytes = key.hash_bytes();
        assert_eq!(&bytes[0..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[4..8], &[5, 6, 7, 8]);
        assert_eq!(&bytes[8..10], &[0x12, 0x34]);
        assert_eq!(&bytes[10..12], &[0xab, 0xcd]);
        assert_eq!(bytes[12], 6);
    }

    #[test]
    fn test_key_equality_is_exact() {
        let a = FlowKey {
            src_ip: Ipv4Addr::new(1, 1, 1, 1),
            dst_ip: Ipv4Addr::new(2, 2, 2, 2),
            protocol: 17,
            src_port: 53,
            dst_port: 53,
        };
        let mut b = a;
        assert_eq!(a, b);

        b.protocol = 6;
        assert_ne!(a, b);
    }

    #[test]
    fn test_occupancy_liveness() {
        assert!(!Occupancy::Empty.is_live());
        assert!(Occupancy::Unsent.is_live());
        assert!(Occupancy::Sent.is_live());
        assert!(!Occupancy::Deleted.is_live());
    }

    #[test]
    fn test_default_entry_is_empty() {
        let entry = FlowEntry::default();
        assert_eq!(entry.occupancy, Occupancy::Empty);
        assert_eq!(entry.packet_count, 0);
        assert_eq!(entry.last_update_offset, 0);
    }
}
