//! Cluster topology: hosts, nodes, the partition directory and the tend task.

pub mod host;
pub mod node;
pub mod partitions;
pub mod tender;
pub mod topology;

pub use host::Host;
pub use node::Node;
pub use partitions::PartitionTable;
pub use tender::{TendHandle, Tender};
pub use topology::Topology;
