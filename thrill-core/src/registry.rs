//! Peer registry: the engine's table of known peers, in discovery order.

use std::collections::HashMap;

use crate::identity::PeerId;

/// Distance in meters below which two devices may interact. Strict: exactly 3.0 is out of range.
pub const PROXIMITY_THRESHOLD_M: f32 = 3.0;

/// Link state of a peer as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub connection_state: ConnectionState,
    pub last_distance_m: Option<f32>,
    /// Unit vector toward the peer, when the ranging backend can tell.
    pub last_direction: Option<[f32; 3]>,
}

impl PeerRecord {
    fn new(peer_id: PeerId, connection_state: ConnectionState) -> Self {
        Self {
            peer_id,
            connection_state,
            last_distance_m: None,
            last_direction: None,
        }
    }

    pub fn can_interact(&self) -> bool {
        matches!(self.last_distance_m, Some(d) if d < PROXIMITY_THRESHOLD_M)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

/// Result of an upsert, for deciding which event to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
}

/// Ordered by first insertion. Lookups go through a hash index into the record vector.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    records: Vec<PeerRecord>,
    index: HashMap<PeerId, usize>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.index.get(peer_id).map(|&i| &self.records[i])
    }

    fn get_or_insert(&mut self, peer_id: &PeerId, state: ConnectionState) -> (&mut PeerRecord, Upsert) {
        let (i, upsert) = match self.index.get(peer_id).copied() {
            Some(i) => (i, Upsert::Updated),
            None => {
                let i = self.records.len();
                self.records.push(PeerRecord::new(peer_id.clone(), state));
                self.index.insert(peer_id.clone(), i);
                (i, Upsert::Created)
            }
        };
        (&mut self.records[i], upsert)
    }

    pub fn upsert_connection(&mut self, peer_id: &PeerId, state: ConnectionState) -> Upsert {
        let (record, upsert) = self.get_or_insert(peer_id, state);
        record.connection_state = state;
        if state == ConnectionState::Disconnected {
            record.last_distance_m = None;
            record.last_direction = None;
        }
        upsert
    }

    /// Record a ranging sample. A peer we have never seen is inserted as `Connected`,
    /// since ranging implies a token exchange over a live link.
    pub fn upsert_ranging(
        &mut self,
        peer_id: &PeerId,
        distance_m: Option<f32>,
        direction: Option<[f32; 3]>,
    ) -> Upsert {
        let (record, upsert) = self.get_or_insert(peer_id, ConnectionState::Connected);
        // Keep the last known distance if this sample only carries a direction.
        if distance_m.is_some() {
            record.last_distance_m = distance_m;
        }
        record.last_direction = direction;
        upsert
    }

    /// Drop the measurement for a peer that ranging lost sight of. Returns false if unknown.
    pub fn clear_ranging(&mut self, peer_id: &PeerId) -> bool {
        match self.index.get(peer_id) {
            Some(&i) => {
                let record = &mut self.records[i];
                record.last_distance_m = None;
                record.last_direction = None;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerRecord> {
        let i = self.index.remove(peer_id)?;
        let record = self.records.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(record)
    }

    /// Remove everything. Returns the removed ids in registry order.
    pub fn clear(&mut self) -> Vec<PeerId> {
        self.index.clear();
        self.records.drain(..).map(|r| r.peer_id).collect()
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.records.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_connected()).count()
    }

    /// Peers with a current distance measurement.
    pub fn measured_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.last_distance_m.is_some())
            .count()
    }
}
