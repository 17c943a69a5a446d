//! Local shadow copy of every shared entity
//!
//! The world holds the latest authoritative value of each entity this peer
//! knows about, whether it owns it or not. Rendering reads smoothed positions
//! from the interpolator instead; this store is what resync replies and game
//! logic queries are answered from.

use shared::{EntityId, Fields, MovePayload, PeerId, SpawnPayload};
use std::collections::HashMap;

/// Spawn field marking an entity driven by a player's input
pub const PLAYER_FLAG: &str = "is_player";
/// Entity type of pickup items
pub const ITEM_TYPE: &str = "ITEM";

/// Rate and smoothing class of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityClass {
    /// An input-driven player entity
    Avatar,
    /// Ambient AI-driven entity owned by the host
    Npc,
    /// Mostly static pickups
    Prop,
}

impl EntityClass {
    pub fn from_spawn(spawn: &SpawnPayload) -> Self {
        if spawn.flag(PLAYER_FLAG) {
            EntityClass::Avatar
        } else if spawn.entity_type == ITEM_TYPE {
            EntityClass::Prop
        } else {
            EntityClass::Npc
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub entity_type: String,
    pub class: EntityClass,
    pub owner: PeerId,
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub vx: f32,
    pub vy: f32,
    /// Type-specific spawn fields, replayed on resync
    pub fields: Fields,
}

impl EntityRecord {
    pub fn from_spawn(spawn: &SpawnPayload, owner: PeerId) -> Self {
        Self {
            id: spawn.entity_id.clone(),
            entity_type: spawn.entity_type.clone(),
            class: EntityClass::from_spawn(spawn),
            owner,
            x: spawn.x,
            y: spawn.y,
            angle: 0.0,
            vx: 0.0,
            vy: 0.0,
            fields: spawn.fields.clone(),
        }
    }

    pub fn apply_move(&mut self, update: &MovePayload) {
        self.x = update.x;
        self.y = update.y;
        self.angle = update.angle;
        self.vx = update.vx;
        self.vy = update.vy;
    }

    /// Spawn payload describing the entity as it is now
    pub fn to_spawn(&self) -> SpawnPayload {
        SpawnPayload {
            entity_id: self.id.clone(),
            entity_type: self.entity_type.clone(),
            x: self.x,
            y: self.y,
            fields: self.fields.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct World {
    entities: HashMap<EntityId, EntityRecord>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record for `record.id`
    pub fn insert(&mut self, record: EntityRecord) {
        self.entities.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<&EntityRecord> {
        self.entities.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut EntityRecord> {
        self.entities.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<EntityRecord> {
        self.entities.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Records sorted by id, so replies are sent in a stable order
    pub fn records(&self) -> Vec<&EntityRecord> {
        let mut records: Vec<&EntityRecord> = self.entities.values().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::FieldValue;

    #[test]
    fn test_entity_class_from_spawn() {
        let avatar = SpawnPayload::new("cat_1", "CAT", 0.0, 0.0)
            .with_field(PLAYER_FLAG, FieldValue::Bool(true));
        let npc = SpawnPayload::new("mouse_1", "MOUSE", 0.0, 0.0);
        let item = SpawnPayload::new("item_1", ITEM_TYPE, 0.0, 0.0);

        assert_eq!(EntityClass::from_spawn(&avatar), EntityClass::Avatar);
        assert_eq!(EntityClass::from_spawn(&npc), EntityClass::Npc);
        assert_eq!(EntityClass::from_spawn(&item), EntityClass::Prop);
    }

    #[test]
    fn test_apply_move_and_resync_payload() {
        let spawn = SpawnPayload::new("dog_3", "DOG", 10.0, 20.0)
            .with_field("color", FieldValue::Text("brown".to_string()));
        let mut record = EntityRecord::from_spawn(&spawn, PeerId::new("m1"));

        let mut update = MovePayload::new("dog_3", 15.0, 25.0);
        update.vx = 1.0;
        record.apply_move(&update);

        let replay = record.to_spawn();
        assert_eq!(replay.x, 15.0);
        assert_eq!(replay.y, 25.0);
        assert_eq!(replay.fields, spawn.fields);
        assert_eq!(record.vx, 1.0);
    }

    #[test]
    fn test_records_are_sorted() {
        let mut world = World::new();
        for id in ["c", "a", "b"] {
            let spawn = SpawnPayload::new(id, "MOUSE", 0.0, 0.0);
            world.insert(EntityRecord::from_spawn(&spawn, PeerId::new("host")));
        }
        let ids: Vec<&str> = world.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(world.len(), 3);

        world.remove("a");
        assert!(!world.contains("a"));
    }
}
