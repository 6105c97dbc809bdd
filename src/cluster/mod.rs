pub mod election;
pub mod identity;
pub mod link;
pub mod membership;

pub use election::{run_election, ElectionOutcome, ElectionRound};
pub use identity::{election_order, LocalNode, NodeIdentity};
pub use link::PeerLink;
pub use membership::{ClusterMembership, Peer};
