//! The peers one acquisition talks to.

use std::{
    cmp::Reverse,
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
};

use itertools::Itertools;

use crate::{
    message::Request,
    service_traits::{Overlay, Peer, PeerId},
};

/// A growing set of peers used by a single acquisition.
///
/// Peers are only ever added, so retries move on to new peers.
pub trait PeerSet: Send + Sync {
    /// Adds up to `limit` connected peers that aren't in the set yet.
    ///
    /// Candidates are ranked by [`Peer::score`], passing `has_item(peer)`.
    /// `on_peer_added` is called once per added peer, after the set has been
    /// updated.
    fn add_peers(
        &self,
        limit: usize,
        has_item: &dyn Fn(&dyn Peer) -> bool,
        on_peer_added: &mut dyn FnMut(&Arc<dyn Peer>),
    );

    /// Sends `request` to `peer`, or to every added peer that is still connected.
    fn send_request(&self, request: Request, peer: Option<&Arc<dyn Peer>>);

    /// The number of peers added so far.
    fn added_peer_count(&self) -> usize;
}

/// Creates a fresh [`PeerSet`] for each acquisition.
pub trait PeerSetBuilder: Send + Sync {
    /// Returns an empty peer set.
    fn build(&self) -> Box<dyn PeerSet>;
}

/// A [`PeerSet`] drawing from the node's [`Overlay`].
pub struct OverlayPeerSet {
    overlay: Arc<dyn Overlay>,
    added: Mutex<HashSet<PeerId>>,
}

impl fmt::Debug for OverlayPeerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayPeerSet")
            .field("added", &self.added_peer_count())
            .finish()
    }
}

impl OverlayPeerSet {
    /// Creates an empty peer set.
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        Self {
            overlay,
            added: Mutex::new(HashSet::new()),
        }
    }

    fn added(&self) -> std::sync::MutexGuard<'_, HashSet<PeerId>> {
        self.added
            .lock()
            .expect("peer set mutex should be unpoisoned")
    }
}

impl PeerSet for OverlayPeerSet {
    fn add_peers(
        &self,
        limit: usize,
        has_item: &dyn Fn(&dyn Peer) -> bool,
        on_peer_added: &mut dyn FnMut(&Arc<dyn Peer>),
    ) {
        let ranked = self
            .overlay
            .peers()
            .into_iter()
            .map(|peer| (peer.score(has_item(peer.as_ref())), peer))
            .sorted_by_key(|(score, _)| Reverse(*score));

        let new_peers: Vec<Arc<dyn Peer>> = {
            let mut added = self.added();
            ranked
                .filter(|(_, peer)| added.insert(peer.id()))
                .map(|(_, peer)| peer)
                .take(limit)
                .collect()
        };

        tracing::trace!(
            new = new_peers.len(),
            total = self.added_peer_count(),
            "added peers to replay peer set",
        );

        for peer in &new_peers {
            on_peer_added(peer);
        }
    }

    fn send_request(&self, request: Request, peer: Option<&Arc<dyn Peer>>) {
        if let Some(peer) = peer {
            peer.send(request);
            return;
        }

        let ids: Vec<PeerId> = self.added().iter().copied().collect();
        for peer in ids.into_iter().filter_map(|id| self.overlay.find_peer(id)) {
            peer.send(request.clone());
        }
    }

    fn added_peer_count(&self) -> usize {
        self.added().len()
    }
}

/// Tracks an acquisition's peers that don't support ledger replay.
///
/// Once enough of them have been contacted, the acquisition falls back to
/// acquiring whole ledgers through [`InboundLedgers`](crate::service_traits::InboundLedgers).
#[derive(Clone, Debug, Default)]
pub(crate) struct Fallback {
    no_feature_peer_count: u32,
    active: bool,
}

impl Fallback {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Adds up to `limit` peers and sends `request` to the ones that support replay.
    ///
    /// Peers that have the requested ledger are preferred.
    /// Returns `true` if this call activated the fallback.
    pub fn invite_peers(
        &mut self,
        peer_set: &dyn PeerSet,
        limit: usize,
        request: Request,
        seq: u32,
        max_no_feature_peer_count: u32,
    ) -> bool {
        let hash = request.ledger_hash();
        let mut replay_peers = Vec::new();
        let mut no_feature_peers = 0;

        peer_set.add_peers(
            limit,
            &|peer| peer.supports_ledger_replay() && peer.has_ledger(hash, seq),
            &mut |peer| {
                if peer.supports_ledger_replay() {
                    replay_peers.push(peer.clone());
                } else {
                    no_feature_peers += 1;
                }
            },
        );

        for peer in &replay_peers {
            peer_set.send_request(request.clone(), Some(peer));
        }

        self.no_feature_peer_count += no_feature_peers;
        if !self.active && self.no_feature_peer_count >= max_no_feature_peer_count {
            tracing::debug!(
                ?hash,
                no_feature_peers = self.no_feature_peer_count,
                "peers don't support ledger replay, falling back to whole ledger acquisition",
            );
            metrics::counter!("ledger_replay.sub_task.fallback", 1);
            self.active = true;
            return true;
        }

        false
    }
}

/// Builds [`OverlayPeerSet`]s.
#[derive(Clone)]
pub struct OverlayPeerSetBuilder {
    overlay: Arc<dyn Overlay>,
}

impl OverlayPeerSetBuilder {
    /// Creates a builder for peer sets drawing from `overlay`.
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        Self { overlay }
    }
}

impl PeerSetBuilder for OverlayPeerSetBuilder {
    fn build(&self) -> Box<dyn PeerSet> {
        Box::new(OverlayPeerSet::new(self.overlay.clone()))
    }
}
