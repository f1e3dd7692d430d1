//! Replica Placement Map
//!
//! `row_id → {primary, secondary}` for one table, persisted to the table
//! directory as `replica.bin` (a JSON map; the broadcast placement messages
//! are the authoritative record, this file is the local mirror of it).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::cluster::node::{NodeId, Placement};
use crate::errors::SerengetiResult;

pub const REPLICA_FILE: &str = "replica.bin";

pub struct ReplicaMap {
    path: PathBuf,
    entries: RwLock<HashMap<Uuid, Placement>>,
}

impl ReplicaMap {
    /// Opens the map, loading `replica.bin` when present.
    pub fn open(table_dir: &Path) -> SerengetiResult<ReplicaMap> {
        let path = table_dir.join(REPLICA_FILE);
        let entries = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            HashMap::new()
        };
        Ok(ReplicaMap {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn set(&self, row_id: Uuid, placement: Placement) {
        self.entries.write().insert(row_id, placement);
    }

    pub fn get(&self, row_id: Uuid) -> Option<Placement> {
        self.entries.read().get(&row_id).copied()
    }

    pub fn remove(&self, row_id: Uuid) -> Option<Placement> {
        self.entries.write().remove(&row_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Rows whose placement names the given node.
    pub fn rows_held_by(&self, node: NodeId) -> Vec<(Uuid, Placement)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, placement)| placement.holds(node))
            .map(|(id, placement)| (*id, *placement))
            .collect()
    }

    pub fn all(&self) -> Vec<(Uuid, Placement)> {
        self.entries
            .read()
            .iter()
            .map(|(id, placement)| (*id, *placement))
            .collect()
    }

    /// Writes `replica.bin` atomically (tmp + rename).
    pub fn save_to_disk(&self) -> SerengetiResult<()> {
        let serialized = {
            let entries = self.entries.read();
            serde_json::to_string(&*entries)?
        };
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let row = Uuid::new_v4();
        let placement = Placement {
            primary: Uuid::new_v4(),
            secondary: Uuid::new_v4(),
        };

        {
            let map = ReplicaMap::open(dir.path()).unwrap();
            map.set(row, placement);
            map.save_to_disk().unwrap();
        }
        let reloaded = ReplicaMap::open(dir.path()).unwrap();
        assert_eq!(reloaded.get(row), Some(placement));
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn rows_held_by_filters_on_both_roles() {
        let dir = tempfile::tempdir().unwrap();
        let map = ReplicaMap::open(dir.path()).unwrap();
        let target = Uuid::new_v4();
        let other = Uuid::new_v4();

        let as_primary = Uuid::new_v4();
        let as_secondary = Uuid::new_v4();
        let unrelated = Uuid::new_v4();
        map.set(as_primary, Placement { primary: target, secondary: other });
        map.set(as_secondary, Placement { primary: other, secondary: target });
        map.set(unrelated, Placement { primary: other, secondary: other });

        let held: Vec<Uuid> = map.rows_held_by(target).into_iter().map(|(id, _)| id).collect();
        assert_eq!(held.len(), 2);
        assert!(held.contains(&as_primary));
        assert!(held.contains(&as_secondary));
    }
}
