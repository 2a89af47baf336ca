//! Program identities for neighborhood attention
//!
//! The set of compute programs is closed: one QK-RPB, one AV and one
//! permute/reshape program for each spatial rank. Each is addressed on the
//! device by a (source identifier, entry point) pair.

use std::fmt;

/// Number of spatial axes of an attention problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpatialRank {
    One,
    Two,
    Three,
}

impl SpatialRank {
    pub fn axes(self) -> usize {
        match self {
            SpatialRank::One => 1,
            SpatialRank::Two => 2,
            SpatialRank::Three => 3,
        }
    }

    /// Source identifier holding this rank's programs
    pub fn source_id(self) -> &'static str {
        match self {
            SpatialRank::One => "natten1d",
            SpatialRank::Two => "natten2d",
            SpatialRank::Three => "natten3d",
        }
    }
}

impl fmt::Display for SpatialRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d", self.axes())
    }
}

/// Pipeline stage a program implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Logits: query-key dot products plus relative-position bias
    QkRpb,
    /// Softmax over window slots and weighted value aggregation
    Av,
    /// Head-major context to `[B, spatial..., H*D]`
    PermuteReshape,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::QkRpb, Stage::Av, Stage::PermuteReshape];
}

/// One program of the closed set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId {
    pub rank: SpatialRank,
    pub stage: Stage,
}

impl ProgramId {
    pub const ALL: [ProgramId; 9] = [
        ProgramId::new(SpatialRank::One, Stage::QkRpb),
        ProgramId::new(SpatialRank::One, Stage::Av),
        ProgramId::new(SpatialRank::One, Stage::PermuteReshape),
        ProgramId::new(SpatialRank::Two, Stage::QkRpb),
        ProgramId::new(SpatialRank::Two, Stage::Av),
        ProgramId::new(SpatialRank::Two, Stage::PermuteReshape),
        ProgramId::new(SpatialRank::Three, Stage::QkRpb),
        ProgramId::new(SpatialRank::Three, Stage::Av),
        ProgramId::new(SpatialRank::Three, Stage::PermuteReshape),
    ];

    pub const fn new(rank: SpatialRank, stage: Stage) -> Self {
        ProgramId { rank, stage }
    }

    pub fn source_id(&self) -> &'static str {
        self.rank.source_id()
    }

    pub fn entry_point(&self) -> &'static str {
        match (self.rank, self.stage) {
            (SpatialRank::One, Stage::QkRpb) => "na1d_qkrpb",
            (SpatialRank::One, Stage::Av) => "na1d_av",
            (SpatialRank::One, Stage::PermuteReshape) => "permute_reshape_1d",
            (SpatialRank::Two, Stage::QkRpb) => "na2d_qkrpb",
            (SpatialRank::Two, Stage::Av) => "na2d_av",
            (SpatialRank::Two, Stage::PermuteReshape) => "permute_reshape_2d",
            (SpatialRank::Three, Stage::QkRpb) => "na3d_qkrpb",
            (SpatialRank::Three, Stage::Av) => "na3d_av",
            (SpatialRank::Three, Stage::PermuteReshape) => "permute_reshape_3d",
        }
    }

    /// Reverse lookup from a device address
    pub fn find(source_id: &str, entry_point: &str) -> Option<ProgramId> {
        ProgramId::ALL
            .iter()
            .copied()
            .find(|p| p.source_id() == source_id && p.entry_point() == entry_point)
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.source_id(), self.entry_point())
    }
}
