//! World Substrate
//!
//! Interfaces the host world exposes to the quest core, plus `SimWorld`, an
//! in-memory world used by the reference server and by tests.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::encounter::BlockPos;
use crate::error::WorldError;

/// Opaque handle to a spawned world resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceHandle(pub u64);

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Death notification delivered by the host event layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDeath {
    pub handle: ResourceHandle,
    pub tags: Vec<String>,
}

/// Spawning and tracking of world resources
pub trait WorldResources {
    fn spawn(&mut self, kind: &str, at: BlockPos, dimension: &str) -> Result<ResourceHandle, WorldError>;
    fn despawn(&mut self, handle: ResourceHandle) -> Result<(), WorldError>;
    fn tag(&mut self, handle: ResourceHandle, label: &str) -> Result<(), WorldError>;
    fn list_by_tag(&self, label: &str) -> Vec<ResourceHandle>;
    fn is_alive(&self, handle: ResourceHandle) -> bool;
    /// Labels attached to a live resource; empty if it does not exist
    fn tags(&self, handle: ResourceHandle) -> Vec<String>;
}

/// Terrain and occupancy checks for candidate points
pub trait WorldConstraints {
    /// Returns the adjusted point if a spawn at `candidate` is allowed
    fn validate_spawn_point(&self, candidate: BlockPos, dimension: &str) -> Option<BlockPos>;
}

/// Everything the encounter engine needs from the world
pub trait WorldHost: WorldResources + WorldConstraints {}

impl<T: WorldResources + WorldConstraints + ?Sized> WorldHost for T {}

// ============================================================================
// SimWorld
// ============================================================================

#[derive(Debug, Clone)]
pub struct SimResource {
    pub kind: String,
    pub pos: BlockPos,
    pub dimension: String,
    pub tags: Vec<String>,
}

/// In-memory world. Columns can be blocked to reject spawn points, and
/// spawn/despawn failures can be injected.
#[derive(Debug, Default)]
pub struct SimWorld {
    resources: HashMap<ResourceHandle, SimResource>,
    next_handle: u64,
    /// Blocked (x, z) columns, e.g. water or protected areas
    blocked: HashSet<(i32, i32)>,
    /// When set, valid points are snapped to this height
    surface_y: Option<i32>,
    failing_spawns: u32,
    failing_despawns: u32,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_surface(surface_y: i32) -> Self {
        Self {
            surface_y: Some(surface_y),
            ..Self::default()
        }
    }

    pub fn block_column(&mut self, x: i32, z: i32) {
        self.blocked.insert((x, z));
    }

    /// Make the next `n` spawn calls fail
    pub fn fail_next_spawns(&mut self, n: u32) {
        self.failing_spawns = n;
    }

    /// Make the next `n` despawn calls fail
    pub fn fail_next_despawns(&mut self, n: u32) {
        self.failing_despawns = n;
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&SimResource> {
        self.resources.get(&handle)
    }

    pub fn alive_count(&self) -> usize {
        self.resources.len()
    }

    pub fn count_tagged(&self, label: &str) -> usize {
        self.resources
            .values()
            .filter(|r| r.tags.iter().any(|t| t == label))
            .count()
    }

    /// Kill a resource, returning the death notification the host would emit
    pub fn kill(&mut self, handle: ResourceHandle) -> Option<ResourceDeath> {
        self.resources
            .remove(&handle)
            .map(|resource| ResourceDeath { handle, tags: resource.tags })
    }

    /// Remove a resource without a death event, as chunk unloads do
    pub fn unload(&mut self, handle: ResourceHandle) -> bool {
        self.resources.remove(&handle).is_some()
    }
}

impl WorldResources for SimWorld {
    fn spawn(&mut self, kind: &str, at: BlockPos, dimension: &str) -> Result<ResourceHandle, WorldError> {
        if self.failing_spawns > 0 {
            self.failing_spawns -= 1;
            return Err(WorldError::SpawnFailed {
                kind: kind.to_string(),
                dimension: dimension.to_string(),
                reason: "chunk not loaded".to_string(),
            });
        }

        self.next_handle += 1;
        let handle = ResourceHandle(self.next_handle);
        self.resources.insert(
            handle,
            SimResource {
                kind: kind.to_string(),
                pos: at,
                dimension: dimension.to_string(),
                tags: Vec::new(),
            },
        );
        debug!("Spawned {} {} at {} in {}", kind, handle, at, dimension);
        Ok(handle)
    }

    fn despawn(&mut self, handle: ResourceHandle) -> Result<(), WorldError> {
        if self.failing_despawns > 0 {
            self.failing_despawns -= 1;
            return Err(WorldError::Rejected(format!("despawn of {} refused", handle)));
        }
        self.resources
            .remove(&handle)
            .map(|_| ())
            .ok_or(WorldError::UnknownResource(handle))
    }

    fn tag(&mut self, handle: ResourceHandle, label: &str) -> Result<(), WorldError> {
        let resource = self
            .resources
            .get_mut(&handle)
            .ok_or(WorldError::UnknownResource(handle))?;
        if !resource.tags.iter().any(|t| t == label) {
            resource.tags.push(label.to_string());
        }
        Ok(())
    }

    fn list_by_tag(&self, label: &str) -> Vec<ResourceHandle> {
        let mut handles: Vec<ResourceHandle> = self
            .resources
            .iter()
            .filter(|(_, r)| r.tags.iter().any(|t| t == label))
            .map(|(h, _)| *h)
            .collect();
        handles.sort();
        handles
    }

    fn is_alive(&self, handle: ResourceHandle) -> bool {
        self.resources.contains_key(&handle)
    }

    fn tags(&self, handle: ResourceHandle) -> Vec<String> {
        self.resources
            .get(&handle)
            .map(|r| r.tags.clone())
            .unwrap_or_default()
    }
}

impl WorldConstraints for SimWorld {
    fn validate_spawn_point(&self, candidate: BlockPos, _dimension: &str) -> Option<BlockPos> {
        if self.blocked.contains(&(candidate.x, candidate.z)) {
            return None;
        }
        Some(match self.surface_y {
            Some(y) => BlockPos::new(candidate.x, y, candidate.z),
            None => candidate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_tag_and_list() {
        let mut world = SimWorld::new();
        let a = world.spawn("zombie", BlockPos::new(0, 64, 0), "overworld").unwrap();
        let b = world.spawn("zombie", BlockPos::new(1, 64, 0), "overworld").unwrap();
        world.tag(a, "quest:q1").unwrap();
        world.tag(a, "quest:q1").unwrap();

        assert_eq!(world.list_by_tag("quest:q1"), vec![a]);
        assert_eq!(world.tags(a), vec!["quest:q1".to_string()]);
        assert!(world.tags(b).is_empty());
    }

    #[test]
    fn test_kill_returns_tags() {
        let mut world = SimWorld::new();
        let handle = world.spawn("pillager", BlockPos::new(0, 64, 0), "overworld").unwrap();
        world.tag(handle, "quest_encounter").unwrap();

        let death = world.kill(handle).unwrap();
        assert_eq!(death.tags, vec!["quest_encounter".to_string()]);
        assert!(!world.is_alive(handle));
        assert!(world.kill(handle).is_none());
    }

    #[test]
    fn test_injected_failures() {
        let mut world = SimWorld::new();
        world.fail_next_spawns(1);
        assert!(world.spawn("zombie", BlockPos::new(0, 0, 0), "overworld").is_err());
        let handle = world.spawn("zombie", BlockPos::new(0, 0, 0), "overworld").unwrap();

        world.fail_next_despawns(1);
        assert!(world.despawn(handle).is_err());
        assert!(world.despawn(handle).is_ok());
        assert_eq!(world.despawn(handle), Err(WorldError::UnknownResource(handle)));
    }

    #[test]
    fn test_blocked_column_rejects_spawn_point() {
        let mut world = SimWorld::with_surface(70);
        world.block_column(5, 5);
        assert_eq!(world.validate_spawn_point(BlockPos::new(5, 64, 5), "overworld"), None);
        assert_eq!(
            world.validate_spawn_point(BlockPos::new(6, 64, 5), "overworld"),
            Some(BlockPos::new(6, 70, 5))
        );
    }
}
