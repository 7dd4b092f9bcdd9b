use serde::{Deserialize, Serialize};

use crate::{V4, VD3};

/// What a particle is. Fixed and Moving particles form the boundary block,
/// Floating and Fluid particles form the fluid block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticleKind {
    Fixed,
    Moving,
    Floating,
    Fluid,
}

impl ParticleKind {
    pub fn is_boundary(self) -> bool {
        matches!(self, ParticleKind::Fixed | ParticleKind::Moving)
    }

    fn bits(self) -> u16 {
        match self {
            ParticleKind::Fixed => 0x0000,
            ParticleKind::Moving => 0x0800,
            ParticleKind::Floating => 0x1000,
            ParticleKind::Fluid => 0x1800,
        }
    }
}

/// Transient state of a particle on top of its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Special {
    Normal,
    /// Halo copy created by the periodic replicator.
    Periodic,
    /// Retired halo copy, dropped by the next partition.
    Ignore,
    /// Moved further than the per-step movement limit.
    OutMove,
    /// Left the domain or has a non-finite position.
    OutPos,
    /// Density outside the allowed range.
    OutRhop,
}

impl Special {
    fn bits(self) -> u16 {
        match self {
            Special::Normal => 0x0000,
            Special::Periodic => 0x2000,
            Special::Ignore => 0x4000,
            Special::OutMove => 0x6000,
            Special::OutPos => 0x8000,
            Special::OutRhop => 0xa000,
        }
    }

    pub fn is_out(self) -> bool {
        matches!(self, Special::OutMove | Special::OutPos | Special::OutRhop)
    }
}

/// Packed per-particle code: special state (3 bits), kind (2 bits), mk value (11 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Code(u16);

impl Code {
    const SPECIAL_MASK: u16 = 0xe000;
    const KIND_MASK: u16 = 0x1800;
    const VALUE_MASK: u16 = 0x07ff;

    pub const MAX_MK_VALUE: u16 = Self::VALUE_MASK;

    pub fn new(kind: ParticleKind, mk_value: u16) -> Code {
        Code(kind.bits() | (mk_value & Self::VALUE_MASK))
    }

    pub fn kind(self) -> ParticleKind {
        match self.0 & Self::KIND_MASK {
            0x0000 => ParticleKind::Fixed,
            0x0800 => ParticleKind::Moving,
            0x1000 => ParticleKind::Floating,
            _ => ParticleKind::Fluid,
        }
    }

    pub fn special(self) -> Special {
        match self.0 & Self::SPECIAL_MASK {
            0x0000 => Special::Normal,
            0x2000 => Special::Periodic,
            0x4000 => Special::Ignore,
            0x6000 => Special::OutMove,
            0x8000 => Special::OutPos,
            // 0xc000 and 0xe000 are never produced by this type
            _ => Special::OutRhop,
        }
    }

    pub fn mk_value(self) -> u16 {
        self.0 & Self::VALUE_MASK
    }

    #[must_use]
    pub fn with_special(self, special: Special) -> Code {
        Code((self.0 & !Self::SPECIAL_MASK) | special.bits())
    }

    pub fn is_normal(self) -> bool {
        self.special() == Special::Normal
    }

    pub fn is_periodic(self) -> bool {
        self.special() == Special::Periodic
    }

    pub fn is_ignored(self) -> bool {
        self.special() == Special::Ignore
    }

    pub fn is_out(self) -> bool {
        self.special().is_out()
    }

    /// Normal or periodic: takes part in interactions.
    pub fn is_valid(self) -> bool {
        matches!(self.special(), Special::Normal | Special::Periodic)
    }

    pub fn is_boundary(self) -> bool {
        self.kind().is_boundary()
    }

    pub fn is_floating(self) -> bool {
        self.kind() == ParticleKind::Floating
    }

    pub fn is_fluid(self) -> bool {
        self.kind() == ParticleKind::Fluid
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

/// Snapshot of a particle removed from the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExcludedParticle {
    pub id: u32,
    pub kind: ParticleKind,
    pub reason: Special,
    pub pos: VD3,
    pub velrhop: V4,
}

impl std::fmt::Display for ExcludedParticle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self.reason {
            Special::OutPos => "position",
            Special::OutMove => "movement",
            Special::OutRhop => "density",
            _ => "unknown",
        };
        write!(
            f,
            "id:{} {:?} out by {} pos:({:.6},{:.6},{:.6}) vel:({:.6},{:.6},{:.6}) rhop:{:.3}",
            self.id,
            self.kind,
            reason,
            self.pos.x,
            self.pos.y,
            self.pos.z,
            self.velrhop.x,
            self.velrhop.y,
            self.velrhop.z,
            self.velrhop.w
        )
    }
}
