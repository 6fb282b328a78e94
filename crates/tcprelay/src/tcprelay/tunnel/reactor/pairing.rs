use std::collections::HashMap;

/// Connection id; equal to the `mio::Token` the socket is registered under.
pub type ConnId = usize;

/// Symmetric 1:1 association between connections.
///
/// `peer(a) == Some(b)` holds exactly when `peer(b) == Some(a)`.
#[derive(Debug, Default)]
pub struct PairingTable {
    peers: HashMap<ConnId, ConnId>,
}

impl PairingTable {
    /// Pairs `a` with `b`, dropping any previous pairing of either side.
    pub fn pair(&mut self, a: ConnId, b: ConnId) {
        debug_assert_ne!(a, b, "a connection cannot pair with itself");
        self.unpair(a);
        self.unpair(b);
        self.peers.insert(a, b);
        self.peers.insert(b, a);
    }

    pub fn peer(&self, id: ConnId) -> Option<ConnId> {
        self.peers.get(&id).copied()
    }

    /// Removes both directions and returns the former peer.
    pub fn unpair(&mut self, id: ConnId) -> Option<ConnId> {
        let peer = self.peers.remove(&id)?;
        if self.peers.get(&peer) == Some(&id) {
            self.peers.remove(&peer);
        }
        Some(peer)
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.peers.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
