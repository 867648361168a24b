//! Remote participant roster

/// Roster entry for one remote participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipantInfo {
    /// Signaling routing key
    pub peer_id: String,
    /// Stable identity used to spot reconnects
    pub user_id: Option<String>,
    /// Display name
    pub name: Option<String>,
}

impl RemoteParticipantInfo {
    /// Whether `other` looks like the same person under a different session
    ///
    /// Matches on `user_id`; falls back to the display name only when neither
    /// entry carries a `user_id`.
    pub fn is_stale_session_of(&self, other: &RemoteParticipantInfo) -> bool {
        if self.peer_id == other.peer_id {
            return false;
        }

        match (&self.user_id, &other.user_id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => matches!((&self.name, &other.name), (Some(a), Some(b)) if a == b),
            _ => false,
        }
    }
}

/// Ordered set of remote participants, keyed by peer id
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: Vec<RemoteParticipantInfo>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an entry. Returns true if the peer is new.
    pub fn upsert(&mut self, info: RemoteParticipantInfo) -> bool {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.peer_id == info.peer_id) {
            if info.user_id.is_some() {
                existing.user_id = info.user_id;
            }
            if info.name.is_some() {
                existing.name = info.name;
            }
            return false;
        }

        self.entries.push(info);
        true
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<RemoteParticipantInfo> {
        let index = self.entries.iter().position(|e| e.peer_id == peer_id)?;
        Some(self.entries.remove(index))
    }

    pub fn get(&self, peer_id: &str) -> Option<&RemoteParticipantInfo> {
        self.entries.iter().find(|e| e.peer_id == peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.get(peer_id).is_some()
    }

    /// Peer ids of earlier sessions belonging to the same participant as `info`
    pub fn stale_sessions_of(&self, info: &RemoteParticipantInfo) -> Vec<String> {
        self.entries
            .iter()
            .filter(|existing| existing.is_stale_session_of(info))
            .map(|existing| existing.peer_id.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteParticipantInfo> {
        self.entries.iter()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.peer_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
