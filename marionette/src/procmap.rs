//! Partition of a world communicator into named, contiguous process groups.
//!
//! Every rank belongs to exactly one group. Groups are laid out in the order
//! they are listed, so a group's leader is the first world rank of its range.
//! Communicators bridging two groups are built on first request and cached.

pub mod groups;

#[cfg(test)]
mod groups_test;

pub use groups::GroupSpec;

use crate::comm::{noncollective, CommError, Communicator, Rank, Tag};
use std::{cell::RefCell, collections::BTreeMap, ops::RangeInclusive, rc::Rc};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// tag for bridges requested without one
pub const DEFAULT_INTERCOMM_TAG: Tag = 0;
/// tag used while building job worlds out of scheduler ranks
pub const NONCOLLECTIVE_TAG: Tag = 77;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcMapError {
    #[error("Groups request {requested} processes but the world has {available}")]
    SizeMismatch { requested: i32, available: i32 },
    #[error("Groups request {requested} processes but only {available} are available")]
    OverSubscribed { requested: i32, available: i32 },
    #[error("Invalid group entry {0:?}")]
    InvalidEntry(String),
    #[error("Group {0} is listed twice")]
    DuplicateGroup(String),
    #[error("Unknown group {0}")]
    UnknownGroup(String),
    #[error("Group {0} cannot bridge to itself")]
    SelfIntercomm(String),
    #[error("No intercommunicator to {0} has been created yet")]
    NoIntracomm(String),
    #[error("Split left this rank without a group")]
    Unassigned,
    #[error(transparent)]
    Comm(#[from] CommError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    /// world rank of the first member
    pub leader: Rank,
    pub size: i32,
}

impl GroupInfo {
    fn contains(&self, rank: Rank) -> bool {
        rank >= self.leader && rank < self.leader + self.size
    }
}

struct Bridge<C> {
    inter: Rc<C>,
    intra: Rc<C>,
}

pub struct ProcessMap<C> {
    cache: RefCell<BTreeMap<String, Bridge<C>>>,
    local: C,
    world: C,
    color: usize,
    groups: Vec<GroupInfo>,
}

impl<C: Communicator> ProcessMap<C> {
    /// Collective over `world`.
    #[instrument(skip_all, fields(groups = %spec))]
    pub fn new(world: C, spec: GroupSpec) -> Result<Self, ProcMapError> {
        if spec.total() != world.size() {
            return Err(ProcMapError::SizeMismatch {
                requested: spec.total(),
                available: world.size(),
            });
        }

        let mut groups = Vec::with_capacity(spec.len());
        let mut leader = 0;
        for (name, size) in spec.iter() {
            if size <= 0 {
                return Err(ProcMapError::InvalidEntry(format!("{name}={size}")));
            }
            if groups.iter().any(|group: &GroupInfo| group.name == name) {
                return Err(ProcMapError::DuplicateGroup(name.to_string()));
            }
            groups.push(GroupInfo {
                name: name.to_string(),
                leader,
                size,
            });
            leader += size;
        }

        let rank = world.rank();
        let color = groups
            .iter()
            .position(|group| group.contains(rank))
            .ok_or(ProcMapError::Unassigned)?;

        let local = world
            .split(Some(color as i32), rank)?
            .ok_or(ProcMapError::Unassigned)?;

        debug!(rank, group = groups[color].name, "Joined group");

        Ok(Self {
            cache: RefCell::new(BTreeMap::new()),
            local,
            world,
            color,
            groups,
        })
    }

    /// Map over the parent ranks `range`, called only by those ranks: the
    /// job world is assembled without involving the rest of `parent`.
    #[instrument(skip(parent, spec), fields(groups = %spec))]
    pub fn child(parent: &C, range: RangeInclusive<Rank>, spec: GroupSpec) -> Result<Self, ProcMapError> {
        let members: Vec<Rank> = range.collect();
        let world = noncollective::create_from_ranks(parent, &members, NONCOLLECTIVE_TAG)?;

        Self::new(world, spec)
    }

    pub fn local(&self) -> &C {
        &self.local
    }

    pub fn world(&self) -> &C {
        &self.world
    }

    pub fn world_rank(&self) -> Rank {
        self.world.rank()
    }

    pub fn local_rank(&self) -> Rank {
        self.local.rank()
    }

    pub fn color(&self) -> usize {
        self.color
    }

    /// name of the group this rank belongs to
    pub fn group(&self) -> &str {
        &self.groups[self.color].name
    }

    pub fn groups(&self) -> &[GroupInfo] {
        &self.groups
    }

    fn find(&self, name: &str) -> Result<&GroupInfo, ProcMapError> {
        self.groups
            .iter()
            .find(|group| group.name == name)
            .ok_or_else(|| ProcMapError::UnknownGroup(name.to_string()))
    }

    pub fn leader(&self, name: &str) -> Result<Rank, ProcMapError> {
        self.find(name).map(|group| group.leader)
    }

    pub fn size(&self, name: &str) -> Result<i32, ProcMapError> {
        self.find(name).map(|group| group.size)
    }

    /// whether world rank `rank` leads some group
    pub fn is_leader(&self, rank: Rank) -> bool {
        self.groups.iter().any(|group| group.leader == rank)
    }

    pub fn intercomm(&self, to: &str) -> Result<Rc<C>, ProcMapError> {
        self.intercomm_with_tag(to, DEFAULT_INTERCOMM_TAG)
    }

    /// Bridge to group `to`, collective over both groups on first use.
    ///
    /// Later calls return the cached communicator and the tag is ignored.
    pub fn intercomm_with_tag(&self, to: &str, tag: Tag) -> Result<Rc<C>, ProcMapError> {
        if let Some(bridge) = self.cache.borrow().get(to) {
            return Ok(bridge.inter.clone());
        }

        let target = self.find(to)?;
        if target.name == self.group() {
            return Err(ProcMapError::SelfIntercomm(to.to_string()));
        }

        let inter = self.local.intercomm_create(0, &self.world, target.leader, tag)?;
        let own_leader = self.groups[self.color].leader;
        let intra = inter.merge(own_leader < target.leader)?;

        info!(from = self.group(), to, tag, "Created intercommunicator");

        let inter = Rc::new(inter);
        self.cache.borrow_mut().insert(
            to.to_string(),
            Bridge {
                inter: inter.clone(),
                intra: Rc::new(intra),
            },
        );

        Ok(inter)
    }

    /// merged counterpart of a bridge created by [`ProcessMap::intercomm`]
    pub fn intracomm(&self, to: &str) -> Result<Rc<C>, ProcMapError> {
        self.cache
            .borrow()
            .get(to)
            .map(|bridge| bridge.intra.clone())
            .ok_or_else(|| ProcMapError::NoIntracomm(to.to_string()))
    }
}
