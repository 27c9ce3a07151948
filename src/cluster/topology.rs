//! Cluster topology data structures and the `CLUSTER NODES` parser.

use std::fmt;

use crate::{Error, Result};

use super::slot::SLOT_COUNT;

/// Unique identifier for a node in the cluster.
///
/// Node IDs are 40-character hex strings assigned by the server; they are
/// treated as opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new NodeId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the node ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A role or state flag reported for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NodeFlag {
    /// Serves slots.
    Master,
    /// Replicates a master.
    Slave,
    /// The node that answered the topology query.
    Myself,
    /// Possibly failing.
    PFail,
    /// Confirmed failed.
    Fail,
    /// Still in handshake.
    Handshake,
    /// Address unknown.
    NoAddr,
}

impl NodeFlag {
    const ALL: [NodeFlag; 7] = [
        NodeFlag::Master,
        NodeFlag::Slave,
        NodeFlag::Myself,
        NodeFlag::PFail,
        NodeFlag::Fail,
        NodeFlag::Handshake,
        NodeFlag::NoAddr,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    fn parse(flag: &str) -> Option<Self> {
        match flag {
            "master" => Some(NodeFlag::Master),
            "slave" | "replica" => Some(NodeFlag::Slave),
            "myself" => Some(NodeFlag::Myself),
            "fail?" | "pfail" => Some(NodeFlag::PFail),
            "fail" => Some(NodeFlag::Fail),
            "handshake" => Some(NodeFlag::Handshake),
            "noaddr" => Some(NodeFlag::NoAddr),
            _ => None,
        }
    }
}

/// Set of [`NodeFlag`]s.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct NodeFlags(u8);

impl NodeFlags {
    /// An empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Parses node flags from a comma-separated string.
    ///
    /// Unknown flags and `noflags` are ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use slotmux::cluster::{NodeFlag, NodeFlags};
    ///
    /// let flags = NodeFlags::parse("myself,master");
    /// assert!(flags.contains(NodeFlag::Master));
    /// assert!(flags.contains(NodeFlag::Myself));
    /// assert!(!flags.contains(NodeFlag::Slave));
    /// ```
    pub fn parse(flags: &str) -> Self {
        flags
            .split(',')
            .filter_map(|flag| NodeFlag::parse(flag.trim()))
            .collect()
    }

    /// Returns true if `flag` is set.
    pub fn contains(&self, flag: NodeFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Sets `flag`.
    pub fn insert(&mut self, flag: NodeFlag) {
        self.0 |= flag.bit();
    }

    /// Clears `flag`.
    pub fn remove(&mut self, flag: NodeFlag) {
        self.0 &= !flag.bit();
    }

    /// Clears every flag.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns true if no flag is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterates over the set flags.
    pub fn iter(&self) -> impl Iterator<Item = NodeFlag> + '_ {
        NodeFlag::ALL.into_iter().filter(|f| self.contains(*f))
    }
}

impl FromIterator<NodeFlag> for NodeFlags {
    fn from_iter<I: IntoIterator<Item = NodeFlag>>(iter: I) -> Self {
        let mut flags = NodeFlags::empty();
        for flag in iter {
            flags.insert(flag);
        }
        flags
    }
}

impl fmt::Debug for NodeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// An inclusive range of hash slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    /// First slot (inclusive).
    pub start: u16,
    /// Last slot (inclusive).
    pub end: u16,
}

impl SlotRange {
    /// Creates a range. `start` must not exceed `end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Returns true if `slot` lies within the range.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Number of slots in the range.
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Always false; a range holds at least one slot.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The range with `slot` taken out, as zero, one or two ranges.
    pub(crate) fn without(self, slot: u16) -> impl Iterator<Item = SlotRange> {
        let (left, right) = if !self.contains(slot) {
            (Some(self), None)
        } else {
            (
                (slot > self.start).then(|| SlotRange::new(self.start, slot - 1)),
                (slot < self.end).then(|| SlotRange::new(slot + 1, self.end)),
            )
        };
        left.into_iter().chain(right)
    }
}

/// One node as described by the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    /// Opaque node identity.
    pub id: NodeId,
    /// Host or IP the node is reachable at.
    pub host: String,
    /// Client port.
    pub port: u16,
    /// Role and state flags.
    pub flags: NodeFlags,
    /// Master node id, for replicas.
    pub master_id: Option<NodeId>,
    /// Configuration epoch.
    pub config_epoch: u64,
    /// Whether the cluster bus link to the node is up.
    pub connected: bool,
    /// Owned slot ranges.
    pub slots: Vec<SlotRange>,
}

impl ClusterNode {
    /// Creates a node with no flags and no slots.
    pub fn new(id: impl Into<NodeId>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            flags: NodeFlags::empty(),
            master_id: None,
            config_epoch: 0,
            connected: true,
            slots: Vec::new(),
        }
    }

    /// Adds a flag.
    pub fn with_flag(mut self, flag: NodeFlag) -> Self {
        self.flags.insert(flag);
        self
    }

    /// Adds an owned slot range.
    pub fn with_slots(mut self, start: u16, end: u16) -> Self {
        self.slots.push(SlotRange::new(start, end));
        self
    }

    /// `host:port` of the node.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true if the node listens on `host:port`.
    pub fn has_address(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }

    /// Returns true if `flag` is set.
    pub fn is(&self, flag: NodeFlag) -> bool {
        self.flags.contains(flag)
    }

    /// Returns true if the node owns `slot`.
    pub fn has_slot(&self, slot: u16) -> bool {
        self.slots.iter().any(|range| range.contains(slot))
    }

    /// Total number of owned slots.
    pub fn slot_count(&self) -> usize {
        self.slots.iter().map(SlotRange::len).sum()
    }
}

/// Parses a `CLUSTER NODES` reply.
///
/// Each line reads
/// `<id> <ip:port@cport[,hostname]> <flags> <master> <ping> <pong> <epoch> <link> <slot>...`.
/// Slot entries are either single slots or `start-end` ranges; bracketed
/// migration markers are skipped.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if a line is truncated or a field does not
/// parse.
///
/// # Examples
///
/// ```
/// use slotmux::cluster::parse_cluster_nodes;
///
/// let nodes = parse_cluster_nodes(
///     "07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected\n\
///      e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460\n",
/// )
/// .unwrap();
/// assert_eq!(nodes.len(), 2);
/// assert_eq!(nodes[1].slots[0].end, 5460);
/// ```
pub fn parse_cluster_nodes(text: &str) -> Result<Vec<ClusterNode>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_node_line)
        .collect()
}

fn parse_node_line(line: &str) -> Result<ClusterNode> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return Err(malformed(line, "expected at least 8 fields"));
    }

    let (host, port) = parse_node_address(fields[1]).ok_or_else(|| malformed(line, "bad address"))?;
    let master_id = match fields[3] {
        "-" => None,
        id => Some(NodeId::new(id)),
    };
    let config_epoch = fields[6]
        .parse()
        .map_err(|_| malformed(line, "bad config epoch"))?;

    let mut slots = Vec::new();
    for entry in &fields[8..] {
        if entry.starts_with('[') {
            continue;
        }
        slots.push(parse_slot_range(entry).ok_or_else(|| malformed(line, "bad slot range"))?);
    }

    Ok(ClusterNode {
        id: NodeId::new(fields[0]),
        host,
        port,
        flags: NodeFlags::parse(fields[2]),
        master_id,
        config_epoch,
        connected: fields[7] == "connected",
        slots,
    })
}

/// Splits `ip:port@cport[,hostname]` into host and port.
fn parse_node_address(field: &str) -> Option<(String, u16)> {
    let addr = field.split([',', '@']).next()?;
    let (host, port) = addr.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

fn parse_slot_range(entry: &str) -> Option<SlotRange> {
    let (start, end) = match entry.split_once('-') {
        Some((start, end)) => (start.parse().ok()?, end.parse().ok()?),
        None => {
            let slot = entry.parse().ok()?;
            (slot, slot)
        }
    };
    (start <= end && end < SLOT_COUNT).then(|| SlotRange::new(start, end))
}

fn malformed(line: &str, reason: &str) -> Error {
    Error::Protocol {
        message: format!("malformed CLUSTER NODES line ({}): {}", reason, line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODES: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383 [1024->-e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca]
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001,node1.example myself,master - 0 0 1 connected 0-5460
";

    #[test]
    fn test_node_id_creation() {
        let id = NodeId::new("abc123");
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(id.to_string(), "abc123");
        let from: NodeId = "abc123".into();
        assert_eq!(id, from);
    }

    #[test]
    fn test_node_flags_parse() {
        let flags = NodeFlags::parse("myself,master");
        assert!(flags.contains(NodeFlag::Master));
        assert!(flags.contains(NodeFlag::Myself));
        assert!(!flags.contains(NodeFlag::Slave));

        let flags = NodeFlags::parse("slave,fail?");
        assert!(flags.contains(NodeFlag::Slave));
        assert!(flags.contains(NodeFlag::PFail));

        assert!(NodeFlags::parse("noflags").is_empty());
    }

    #[test]
    fn test_node_flags_edit() {
        let mut flags = NodeFlags::parse("master,myself");
        flags.remove(NodeFlag::Myself);
        assert!(!flags.contains(NodeFlag::Myself));
        flags.clear();
        assert!(flags.is_empty());
        flags.insert(NodeFlag::Slave);
        assert_eq!(flags.iter().collect::<Vec<_>>(), vec![NodeFlag::Slave]);
    }

    #[test]
    fn test_slot_range_without() {
        let range = SlotRange::new(10, 20);
        assert_eq!(
            range.without(15).collect::<Vec<_>>(),
            vec![SlotRange::new(10, 14), SlotRange::new(16, 20)]
        );
        assert_eq!(
            range.without(10).collect::<Vec<_>>(),
            vec![SlotRange::new(11, 20)]
        );
        assert_eq!(range.without(99).collect::<Vec<_>>(), vec![range]);
        assert_eq!(SlotRange::new(5, 5).without(5).count(), 0);
    }

    #[test]
    fn test_parse_cluster_nodes() {
        let nodes = parse_cluster_nodes(NODES).unwrap();
        assert_eq!(nodes.len(), 4);

        let replica = &nodes[0];
        assert!(replica.is(NodeFlag::Slave));
        assert_eq!(
            replica.master_id,
            Some(NodeId::new("e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca"))
        );
        assert!(replica.slots.is_empty());
        assert_eq!(replica.config_epoch, 4);

        let migrating = &nodes[2];
        assert_eq!(migrating.slots, vec![SlotRange::new(10923, 16383)]);

        let myself = &nodes[3];
        assert_eq!(myself.host, "127.0.0.1");
        assert_eq!(myself.port, 30001);
        assert!(myself.is(NodeFlag::Myself));
        assert!(myself.has_slot(0));
        assert!(!myself.has_slot(5461));
        assert_eq!(myself.slot_count(), 5461);
    }

    #[test]
    fn test_parse_single_slots() {
        let nodes = parse_cluster_nodes("abc 10.0.0.1:7000 master - 0 0 1 connected 1 3-4\n").unwrap();
        assert_eq!(
            nodes[0].slots,
            vec![SlotRange::new(1, 1), SlotRange::new(3, 4)]
        );
        assert_eq!(nodes[0].address(), "10.0.0.1:7000");
    }

    #[test]
    fn test_parse_rejects_truncated_line() {
        assert!(matches!(
            parse_cluster_nodes("abc 10.0.0.1:7000 master"),
            Err(Error::Protocol { .. })
        ));
        assert!(parse_cluster_nodes("abc 10.0.0.1:7000 master - 0 0 1 connected 9-2").is_err());
    }

    #[test]
    fn test_has_address() {
        let node = ClusterNode::new("n1", "LocalHost", 7000);
        assert!(node.has_address("localhost", 7000));
        assert!(!node.has_address("localhost", 7001));
    }
}
