//! Space Kinds
//!
//! Every in-use region carries exactly one space kind. The write barrier
//! only ever asks three questions of it: is it young, is it shared, and is
//! it part of the shared sweepable space.

/// Space a region belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpaceKind {
    /// Local nursery, bump allocated by its owning mutator
    Young = 1,
    /// Local old generation
    Old = 2,
    /// Shared heap, movable objects
    SharedOld = 3,
    /// Shared heap, objects that never move
    SharedNonMovable = 4,
    /// Local huge objects, one object per region span
    Huge = 5,
}

/// Encoded value of a free descriptor
pub(crate) const SPACE_FREE: u8 = 0;

impl SpaceKind {
    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(SpaceKind::Young),
            2 => Some(SpaceKind::Old),
            3 => Some(SpaceKind::SharedOld),
            4 => Some(SpaceKind::SharedNonMovable),
            5 => Some(SpaceKind::Huge),
            _ => None,
        }
    }

    #[inline]
    pub fn is_young(self) -> bool {
        self == SpaceKind::Young
    }

    /// Part of the shared heap
    #[inline]
    pub fn is_shared(self) -> bool {
        matches!(self, SpaceKind::SharedOld | SpaceKind::SharedNonMovable)
    }

    /// Part of the shared sweepable space, the target set of LocalToShared
    #[inline]
    pub fn is_shared_sweepable(self) -> bool {
        matches!(self, SpaceKind::SharedOld | SpaceKind::SharedNonMovable)
    }

    /// Regions of this kind may own an OldToNew remembered set
    #[inline]
    pub fn may_own_old_to_new(self) -> bool {
        matches!(self, SpaceKind::Old | SpaceKind::Huge)
    }

    /// Regions of this kind may own a LocalToShared remembered set
    #[inline]
    pub fn may_own_local_to_shared(self) -> bool {
        !self.is_shared()
    }
}

impl std::fmt::Display for SpaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpaceKind::Young => "young",
            SpaceKind::Old => "old",
            SpaceKind::SharedOld => "shared-old",
            SpaceKind::SharedNonMovable => "shared-non-movable",
            SpaceKind::Huge => "huge",
        };
        f.write_str(name)
    }
}

/// Generation requested by an allocation site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Inline bump allocation in the thread's young region
    Young,
    /// Local old generation, runtime allocator
    Old,
    /// Shared heap, runtime allocator
    SharedOld,
    /// Shared heap non-movable space, runtime allocator
    SharedNonMovable,
}

impl Generation {
    pub fn space_kind(self) -> SpaceKind {
        match self {
            Generation::Young => SpaceKind::Young,
            Generation::Old => SpaceKind::Old,
            Generation::SharedOld => SpaceKind::SharedOld,
            Generation::SharedNonMovable => SpaceKind::SharedNonMovable,
        }
    }

    pub fn is_shared(self) -> bool {
        self.space_kind().is_shared()
    }
}
