use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};

use crate::cluster::identity::{pick_winner, NodeIdentity};
use crate::cluster::link::PeerLink;
use crate::error::GovernorError;
use crate::rpc::messages::{GovernorRequest, Reply};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// A peer already reported itself leader; the round stopped early.
    ExistingLeader(String),
    /// This node sorted first.
    Elected,
    /// Another node sorted first and is expected to announce itself.
    Follower { winner: String },
    /// Every candidate had priority 0.
    NoCandidate,
    /// An `elected` announcement arrived while identities were being gathered.
    Superseded,
}

/// Result of one election round: the outcome plus every identity gathered,
/// keyed by the address of the link it came from.
#[derive(Debug)]
pub struct ElectionRound {
    pub outcome: ElectionOutcome,
    pub identified: Vec<(String, NodeIdentity)>,
}

/// Run one election round from the point of view of `me`.
///
/// `links` should hold the currently connected peers. `elected_epoch` is
/// bumped by the caller whenever an `elected` message is received, so a
/// round that overlapped one is discarded instead of acted on.
pub async fn run_election(
    me: NodeIdentity,
    links: &[Arc<dyn PeerLink>],
    elected_epoch: &AtomicU64,
) -> ElectionRound {
    let epoch = elected_epoch.load(Ordering::SeqCst);
    let mut identified = Vec::with_capacity(links.len());

    let mut pending: FuturesUnordered<_> = links
        .iter()
        .map(|link| {
            let request = GovernorRequest::Identify(me.clone());
            let link = link.clone();
            async move {
                let result = link.call(request).await.and_then(Reply::into_result);
                (link.addr().to_string(), result)
            }
        })
        .collect();

    while let Some((addr, result)) = pending.next().await {
        let identity = match result {
            Ok(Reply::Identity(identity)) if !identity.node_name.is_empty() => identity,
            Ok(Reply::Identity(_)) => {
                let err = GovernorError::IdentityMismatch(format!("{addr} sent no node name"));
                tracing::warn!(peer = %addr, error = %err, "Ignoring peer for this election");
                continue;
            }
            Ok(other) => {
                tracing::warn!(peer = %addr, reply = other.kind(), "Ignoring peer for this election");
                continue;
            }
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "Failed to identify peer");
                continue;
            }
        };
        tracing::debug!(peer = %addr, node = %identity.node_name, "Identified peer");

        // A sitting leader re-running the election lets the order decide
        // instead of deferring to another self-declared leader.
        if identity.is_master && !me.is_master {
            let leader = identity.node_name.clone();
            identified.push((addr, identity));
            // Dropping `pending` abandons the identify calls still in flight.
            return ElectionRound {
                outcome: ElectionOutcome::ExistingLeader(leader),
                identified,
            };
        }
        identified.push((addr, identity));
    }

    if elected_epoch.load(Ordering::SeqCst) != epoch {
        return ElectionRound {
            outcome: ElectionOutcome::Superseded,
            identified,
        };
    }

    let mut candidates: Vec<NodeIdentity> = identified.iter().map(|(_, i)| i.clone()).collect();
    candidates.push(me.clone());

    let outcome = match pick_winner(&candidates) {
        None => ElectionOutcome::NoCandidate,
        Some(winner) if winner.node_name == me.node_name => ElectionOutcome::Elected,
        Some(winner) => ElectionOutcome::Follower {
            winner: winner.node_name.clone(),
        },
    };

    ElectionRound {
        outcome,
        identified,
    }
}
