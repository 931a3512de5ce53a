//! Registry of trust cells.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use lifeline_coherence::CoherenceEstimator;
use serde::Serialize;

use crate::group::canonicalize;
use crate::{Capacity, GroupError, GroupHeartbeat, GroupId, Result, TrustGroup};

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A peer found in more than one active cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyViolation {
    pub peer_id: String,
    pub groups: Vec<GroupId>,
}

impl std::fmt::Display for TopologyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.groups.iter().map(GroupId::short).collect();
        write!(
            f,
            "peer {} belongs to {} active cells: {}",
            self.peer_id,
            self.groups.len(),
            ids.join(", ")
        )
    }
}

/// Advisory result of [`GroupRegistry::validate_topology`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologyReport {
    pub violations: Vec<TopologyViolation>,
}

impl TopologyReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Owns every registered cell.
///
/// Mutation only happens through `&mut self` methods; readers get clones.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: BTreeMap<GroupId, TrustGroup>,
    /// Last heartbeat time per (cell, sender), unix millis.
    last_heartbeat: HashMap<(GroupId, String), u64>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new cell.
    ///
    /// Members are validated and sorted before hashing, so every ordering
    /// of the same four ids maps to one cell. A second registration of that
    /// set fails with [`GroupError::Duplicate`].
    pub fn register<S: AsRef<str>>(&mut self, members: &[S]) -> Result<TrustGroup> {
        let members = canonicalize(members)?;
        let id = GroupId::from_sorted(&members);

        if self.groups.contains_key(&id) {
            return Err(GroupError::Duplicate(id));
        }

        let group = TrustGroup {
            id: id.clone(),
            members,
            created_at: unix_millis(),
            active: true,
        };
        self.groups.insert(id, group.clone());
        Ok(group)
    }

    pub fn get(&self, id: &GroupId) -> Option<&TrustGroup> {
        self.groups.get(id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Toggle a cell's `active` flag. Membership never changes.
    pub fn set_active(&mut self, id: &GroupId, active: bool) -> Result<()> {
        let group = self
            .groups
            .get_mut(id)
            .ok_or_else(|| GroupError::UnknownGroup(id.clone()))?;
        group.active = active;
        Ok(())
    }

    /// Every cell, active or not, ordered by id.
    pub fn groups(&self) -> Vec<TrustGroup> {
        self.groups.values().cloned().collect()
    }

    pub fn active_groups(&self) -> Vec<TrustGroup> {
        self.groups.values().filter(|g| g.active).cloned().collect()
    }

    /// Cells that list `peer_id` as a member.
    pub fn groups_for(&self, peer_id: &str) -> Vec<TrustGroup> {
        self.groups
            .values()
            .filter(|g| g.contains(peer_id))
            .cloned()
            .collect()
    }

    pub fn is_member_of_any(&self, peer_id: &str) -> bool {
        self.groups.values().any(|g| g.contains(peer_id))
    }

    /// Build the heartbeat `sender_id` sends to cell `group_id`.
    ///
    /// Coherence comes from `estimator`; the panic and silent flags are
    /// derived from it.
    pub fn heartbeat_for(
        &mut self,
        sender_id: &str,
        group_id: &GroupId,
        estimator: &CoherenceEstimator,
        capacity: Capacity,
    ) -> Result<GroupHeartbeat> {
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| GroupError::UnknownGroup(group_id.clone()))?;

        if !group.contains(sender_id) {
            return Err(GroupError::NotMember {
                peer_id: sender_id.to_string(),
                group_id: group_id.clone(),
            });
        }

        let now = unix_millis();
        let key = (group_id.clone(), sender_id.to_string());
        let delta = self
            .last_heartbeat
            .insert(key, now)
            .map(|prev| now.saturating_sub(prev))
            .unwrap_or(0);

        Ok(GroupHeartbeat::new(
            sender_id,
            group_id.clone(),
            estimator.score(),
            capacity,
            delta,
        ))
    }

    /// Report peers that belong to more than one active cell.
    ///
    /// Advisory only: overlapping cells stay registered.
    pub fn validate_topology(&self) -> TopologyReport {
        let mut memberships: BTreeMap<&str, Vec<GroupId>> = BTreeMap::new();
        for group in self.groups.values().filter(|g| g.active) {
            for member in &group.members {
                memberships
                    .entry(member.as_str())
                    .or_default()
                    .push(group.id.clone());
            }
        }

        let violations = memberships
            .into_iter()
            .filter(|(_, groups)| groups.len() > 1)
            .map(|(peer_id, groups)| TopologyViolation {
                peer_id: peer_id.to_string(),
                groups,
            })
            .collect();

        TopologyReport { violations }
    }
}
