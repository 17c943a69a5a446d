//! Entity ownership and the acceptance rule for inbound updates
//!
//! Every shared entity has exactly one owner: the peer whose spawn created
//! it. Ownership is fixed for the entity's lifetime and is never transferred.
//! When the owner goes away its entities are deleted instead.

use crate::error::SyncError;
use shared::{EntityId, PeerId};
use std::collections::HashMap;

/// How an inbound `move` or `action` for a known entity should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Sent by the owner; may overwrite local state
    Authoritative,
    /// Sent by someone else; a hint for transient effects only
    Advisory,
    /// No owner is recorded for the entity
    Unknown,
}

/// Outcome of recording an inbound spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// First time this entity is seen; ownership recorded
    Created,
    /// The owner re-announced an entity we already track
    Refreshed,
    /// The entity already belongs to someone else
    Conflict { owner: PeerId },
}

#[derive(Debug)]
pub struct AuthorityModel {
    local: PeerId,
    owners: HashMap<EntityId, PeerId>,
}

impl AuthorityModel {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            owners: HashMap::new(),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Registers an entity created by this peer
    pub fn claim_local(&mut self, entity: &str) -> Result<(), SyncError> {
        if self.owners.contains_key(entity) {
            return Err(SyncError::DuplicateEntity(entity.to_string()));
        }
        self.owners.insert(entity.to_string(), self.local.clone());
        Ok(())
    }

    pub fn record_spawn(&mut self, entity: &str, sender: &PeerId) -> SpawnOutcome {
        match self.owners.get(entity) {
            Some(owner) if owner == sender => SpawnOutcome::Refreshed,
            Some(owner) => SpawnOutcome::Conflict {
                owner: owner.clone(),
            },
            None => {
                self.owners.insert(entity.to_string(), sender.clone());
                SpawnOutcome::Created
            }
        }
    }

    pub fn classify(&self, entity: &str, sender: &PeerId) -> Verdict {
        match self.owners.get(entity) {
            Some(owner) if owner == sender => Verdict::Authoritative,
            Some(_) => Verdict::Advisory,
            None => Verdict::Unknown,
        }
    }

    pub fn owner_of(&self, entity: &str) -> Option<&PeerId> {
        self.owners.get(entity)
    }

    pub fn is_local(&self, entity: &str) -> bool {
        self.owners.get(entity) == Some(&self.local)
    }

    /// Forgets one entity, returning its former owner
    pub fn release(&mut self, entity: &str) -> Option<PeerId> {
        self.owners.remove(entity)
    }

    pub fn owned_by(&self, peer: &PeerId) -> Vec<EntityId> {
        let mut owned: Vec<EntityId> = self
            .owners
            .iter()
            .filter(|(_, owner)| *owner == peer)
            .map(|(id, _)| id.clone())
            .collect();
        owned.sort();
        owned
    }

    /// Drops every entity owned by `peer` and returns their ids
    pub fn remove_peer(&mut self, peer: &PeerId) -> Vec<EntityId> {
        let owned = self.owned_by(peer);
        for id in &owned {
            self.owners.remove(id);
        }
        owned
    }

    /// Drops every entity not owned locally and returns their ids
    pub fn remove_remote(&mut self) -> Vec<EntityId> {
        let mut remote: Vec<EntityId> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner != self.local)
            .map(|(id, _)| id.clone())
            .collect();
        remote.sort();
        for id in &remote {
            self.owners.remove(id);
        }
        remote
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn clear(&mut self) {
        self.owners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> AuthorityModel {
        AuthorityModel::new(PeerId::new("host"))
    }

    #[test]
    fn test_claim_local_rejects_duplicates() {
        let mut authority = model();
        authority.claim_local("mouse_1").unwrap();
        assert!(authority.is_local("mouse_1"));
        assert!(matches!(
            authority.claim_local("mouse_1"),
            Err(SyncError::DuplicateEntity(id)) if id == "mouse_1"
        ));
    }

    #[test]
    fn test_spawn_owner_is_fixed() {
        let mut authority = model();
        let m1 = PeerId::new("m1");
        let m2 = PeerId::new("m2");

        assert_eq!(authority.record_spawn("dog_3", &m1), SpawnOutcome::Created);
        assert_eq!(authority.record_spawn("dog_3", &m1), SpawnOutcome::Refreshed);
        assert_eq!(
            authority.record_spawn("dog_3", &m2),
            SpawnOutcome::Conflict { owner: m1.clone() }
        );
        assert_eq!(authority.owner_of("dog_3"), Some(&m1));
    }

    #[test]
    fn test_classify() {
        let mut authority = model();
        let m1 = PeerId::new("m1");
        authority.record_spawn("dog_3", &m1);

        assert_eq!(authority.classify("dog_3", &m1), Verdict::Authoritative);
        assert_eq!(
            authority.classify("dog_3", &PeerId::new("m2")),
            Verdict::Advisory
        );
        assert_eq!(authority.classify("cat_9", &m1), Verdict::Unknown);
    }

    #[test]
    fn test_remove_peer_only_touches_its_entities() {
        let mut authority = model();
        let m1 = PeerId::new("m1");
        authority.claim_local("mouse_1").unwrap();
        authority.record_spawn("dog_3", &m1);
        authority.record_spawn("dog_4", &m1);
        authority.record_spawn("cat_1", &PeerId::new("m2"));

        assert_eq!(authority.remove_peer(&m1), vec!["dog_3", "dog_4"]);
        assert_eq!(authority.len(), 2);
        assert!(authority.owner_of("dog_3").is_none());
    }

    #[test]
    fn test_remove_remote_keeps_local() {
        let mut authority = model();
        authority.claim_local("mouse_1").unwrap();
        authority.record_spawn("dog_3", &PeerId::new("m1"));

        assert_eq!(authority.remove_remote(), vec!["dog_3"]);
        assert!(authority.is_local("mouse_1"));
        assert_eq!(authority.len(), 1);
    }
}
