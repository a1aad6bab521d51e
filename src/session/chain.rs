//! In-memory session chain and generational retirement.
//!
//! The chain is rebuilt from the flat record store as an arena: nodes live in
//! a vector and refer to each other by index. Only live records take part in
//! the up-link tree; destroyed records stay in the arena as tombstones so a
//! stale reference can be followed to the session that absorbed it.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, info};

use crate::session::bat::{fuse, replay, BlockSet, Delta};
use crate::session::record::SessionRecord;
use crate::types::{BlockRange, LineageError, Result, SessionId};

struct ChainNode {
    record: SessionRecord,
    up: Option<usize>,
    children: Vec<usize>,
    generation: u32,
}

/// Arena of all session records with up-link indices.
pub struct SessionChain {
    nodes: Vec<ChainNode>,
    index: HashMap<SessionId, usize>,
}

/// One planned fusion of a retired session into its only live child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Retirement {
    /// Child after absorbing the parent; persist this first.
    pub child: SessionRecord,
    /// Parent turned into a tombstone.
    pub parent: SessionRecord,
    /// Blocks to hand back to the block store.
    pub released: BlockSet,
}

/// Flat view of a chain node for reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChainEntry {
    /// Session number.
    pub number: u64,
    /// Generation, `0` for destroyed sessions.
    pub generation: u32,
    /// Session it was created from.
    pub parent: Option<u64>,
    /// Session it is attached to.
    pub up_link: Option<u64>,
    /// Still part of the chain.
    pub live: bool,
    /// Never retired.
    pub permanent: bool,
    /// Session that absorbed it.
    pub destroyed_by: Option<u64>,
    /// Optional title.
    pub title: Option<String>,
    /// Creator identity.
    pub creator: String,
    /// Creation time, unix seconds.
    pub created: u64,
    /// Size of the plus table.
    pub plus_blocks: usize,
    /// Size of the minus table.
    pub minus_blocks: usize,
}

/// Work done at writer start-up to undo a crash.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Repair {
    /// Records newer than the superblock; their commit never happened.
    pub discard: Vec<SessionId>,
    /// Parents whose fusion was interrupted, already rewritten as tombstones.
    pub tombstones: Vec<SessionRecord>,
}

impl Repair {
    /// Returns `true` when nothing needs fixing.
    pub fn is_empty(&self) -> bool {
        self.discard.is_empty() && self.tombstones.is_empty()
    }
}

/// Decides how to repair `records` against the committed session number.
pub fn plan_repair(records: &[SessionRecord], committed: SessionId) -> Repair {
    let mut repair = Repair::default();
    let kept: Vec<&SessionRecord> = records
        .iter()
        .filter(|r| {
            if r.number > committed {
                repair.discard.push(r.number);
                false
            } else {
                true
            }
        })
        .collect();
    for rec in &kept {
        let Some(absorbed) = rec.absorbed else {
            continue;
        };
        if rec.destroyed {
            continue;
        }
        if let Some(parent) = kept.iter().find(|p| p.number == absorbed && p.is_live()) {
            repair.tombstones.push(tombstone(parent, rec.number));
        }
    }
    repair
}

fn tombstone(record: &SessionRecord, by: SessionId) -> SessionRecord {
    let mut dead = record.clone();
    dead.destroyed = true;
    dead.destroyed_by = Some(by);
    dead.bat_plus = BlockSet::new();
    dead.bat_minus = BlockSet::new();
    dead
}

impl SessionChain {
    /// Builds the arena; records may arrive in any order.
    pub fn build(mut records: Vec<SessionRecord>) -> Self {
        records.sort_by_key(|r| r.number);
        let mut chain = SessionChain {
            nodes: Vec::with_capacity(records.len()),
            index: HashMap::with_capacity(records.len()),
        };
        for record in records {
            chain.index.insert(record.number, chain.nodes.len());
            chain.nodes.push(ChainNode {
                record,
                up: None,
                children: Vec::new(),
                generation: 0,
            });
        }
        chain.link();
        chain
    }

    fn link(&mut self) {
        for node in &mut self.nodes {
            node.up = None;
            node.children.clear();
            node.generation = 0;
        }
        // Up-links always point to older sessions, so ascending order sees
        // every parent before its children.
        for i in 0..self.nodes.len() {
            if !self.nodes[i].record.is_live() {
                continue;
            }
            let up = self.nodes[i]
                .record
                .up_link
                .and_then(|id| self.index.get(&id).copied())
                .filter(|&j| j < i && self.nodes[j].record.is_live());
            self.nodes[i].up = up;
            self.nodes[i].generation = match up {
                Some(j) => {
                    self.nodes[j].children.push(i);
                    self.nodes[j].generation + 1
                }
                None => 1,
            };
        }
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` for an empty chain.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Record of `id`.
    pub fn get(&self, id: SessionId) -> Option<&SessionRecord> {
        self.index.get(&id).map(|&i| &self.nodes[i].record)
    }

    /// Generation of a live session.
    pub fn generation(&self, id: SessionId) -> Option<u32> {
        let &i = self.index.get(&id)?;
        let node = &self.nodes[i];
        node.record.is_live().then_some(node.generation)
    }

    /// Live children of `id`.
    pub fn live_children(&self, id: SessionId) -> Vec<SessionId> {
        self.index
            .get(&id)
            .map(|&i| {
                self.nodes[i]
                    .children
                    .iter()
                    .map(|&c| self.nodes[c].record.number)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live sessions from the root down to `id`.
    pub fn path_from_root(&self, id: SessionId) -> Vec<SessionId> {
        let mut path = Vec::new();
        let mut cursor = self
            .index
            .get(&id)
            .copied()
            .filter(|&i| self.nodes[i].record.is_live());
        while let Some(i) = cursor {
            path.push(self.nodes[i].record.number);
            cursor = self.nodes[i].up;
        }
        path.reverse();
        path
    }

    /// Follows `destroyed_by` links until a live session is reached.
    pub fn resolve(&self, id: SessionId) -> Option<SessionId> {
        let mut current = id;
        for _ in 0..=self.nodes.len() {
            let record = self.get(current)?;
            if record.is_live() {
                return Some(current);
            }
            current = record.destroyed_by?;
        }
        None
    }

    /// Protected sessions plus every live ancestor reachable from them.
    pub fn protected_closure(&self, protected: &BTreeSet<SessionId>) -> BTreeSet<SessionId> {
        let mut closure = BTreeSet::new();
        for &id in protected {
            match self.resolve(id) {
                Some(live) => closure.extend(self.path_from_root(live)),
                None => debug!(session = id.0, "retire.protected.unknown"),
            }
        }
        closure
    }

    /// Blocks visible from `id`, replayed from its root.
    pub fn visible_blocks(&self, id: SessionId) -> BlockSet {
        let deltas: Vec<Delta> = self
            .path_from_root(id)
            .into_iter()
            .filter_map(|s| self.get(s).map(SessionRecord::delta))
            .collect();
        replay(deltas.iter())
    }

    /// Every block some live session still references or reserves.
    pub fn in_use(&self) -> BlockSet {
        let mut used = BlockSet::new();
        for node in self.nodes.iter().filter(|n| n.record.is_live()) {
            used.extend_from(&node.record.bat_plus);
            used.extend_from(&node.record.bat_minus);
        }
        used
    }

    /// [`SessionChain::in_use`] as block runs.
    pub fn in_use_ranges(&self) -> Vec<BlockRange> {
        self.in_use().to_ranges()
    }

    /// Finds the next fusion for the chain ending at `tip`.
    ///
    /// Candidates are ancestors of `tip` at least `keep_alive` generations
    /// above it, visited oldest first, so a steady chain keeps `keep_alive`
    /// live ancestors and the tip sits at generation `keep_alive + 1`. A candidate qualifies when it is not
    /// permanent, not in `protected` (already closed over ancestors) and has
    /// exactly one live child.
    pub fn next_retirement(
        &self,
        tip: SessionId,
        keep_alive: u32,
        protected: &BTreeSet<SessionId>,
    ) -> Result<Option<Retirement>> {
        let Some(tip_generation) = self.generation(tip) else {
            return Ok(None);
        };
        if tip_generation <= keep_alive {
            return Ok(None);
        }
        let limit = tip_generation - keep_alive;
        for id in self.path_from_root(tip) {
            let parent = &self.nodes[self.index[&id]];
            if parent.generation > limit {
                break;
            }
            if parent.record.permanent || protected.contains(&id) {
                continue;
            }
            let [c] = parent.children[..] else {
                continue;
            };
            let child = &self.nodes[c];
            let fused = fuse(
                &parent.record.delta(),
                &child.record.delta(),
                parent.up.is_none(),
            )
            .map_err(|err| match err {
                LineageError::FusionInvariant(msg) => LineageError::FusionInvariant(format!(
                    "fusing session {} into {}: {msg}",
                    id, child.record.number
                )),
                other => other,
            })?;
            let mut new_child = child.record.clone();
            new_child.bat_plus = fused.child.plus;
            new_child.bat_minus = fused.child.minus;
            new_child.up_link = parent.up.map(|u| self.nodes[u].record.number);
            new_child.absorbed = Some(id);
            return Ok(Some(Retirement {
                parent: tombstone(&parent.record, new_child.number),
                child: new_child,
                released: fused.released,
            }));
        }
        Ok(None)
    }

    /// Applies a fusion to the arena.
    pub fn apply(&mut self, retirement: &Retirement) -> Result<()> {
        for record in [&retirement.child, &retirement.parent] {
            let &i = self
                .index
                .get(&record.number)
                .ok_or(LineageError::NotFound)?;
            self.nodes[i].record = record.clone();
        }
        self.link();
        Ok(())
    }

    /// Plans every fusion for `tip`, applying each to the arena as it goes.
    pub fn plan_retirement(
        &mut self,
        tip: SessionId,
        keep_alive: u32,
        protected: &BTreeSet<SessionId>,
    ) -> Result<Vec<Retirement>> {
        let closure = self.protected_closure(protected);
        let mut plan = Vec::new();
        while let Some(step) = self.next_retirement(tip, keep_alive, &closure)? {
            info!(
                parent = step.parent.number.0,
                child = step.child.number.0,
                released = step.released.len(),
                "retire.fuse.planned"
            );
            self.apply(&step)?;
            plan.push(step);
        }
        Ok(plan)
    }

    /// Report rows, oldest first.
    pub fn entries(&self) -> Vec<ChainEntry> {
        self.nodes
            .iter()
            .map(|n| ChainEntry {
                number: n.record.number.0,
                generation: n.generation,
                parent: n.record.parent.map(|s| s.0),
                up_link: n.record.up_link.map(|s| s.0),
                live: n.record.is_live(),
                permanent: n.record.permanent,
                destroyed_by: n.record.destroyed_by.map(|s| s.0),
                title: n.record.title.clone(),
                creator: n.record.creator.clone(),
                created: n.record.created,
                plus_blocks: n.record.bat_plus.len(),
                minus_blocks: n.record.bat_minus.len(),
            })
            .collect()
    }
}
