pub mod error;
pub mod export;
pub mod frame;
pub mod header;
pub mod material;
pub mod mdl;
pub mod ps2;
pub mod psp;
pub mod strip;

use binrw::binrw;
use glam::Vec3;
use serde_derive::Serialize;
use strum::{Display, EnumString};

// Fixed-point unit for PS2 vertex positions (raw * scale * GLOBAL_SCALE + translation)
pub const GLOBAL_SCALE: f32 = 100.0 * 0.000_000_305_182_03;
// Frame records
pub const FRAME_RECORD_SIZE: usize = 0xC0;
// Sector size the encoder pads files to
pub const SECTOR_SIZE: usize = 0x800;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    Ps2,
    Psp,
}

/// Title family and platform, decided by the top-level record magic.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Display)]
pub enum ImportVariant {
    /// Liberty City Stories, PS2
    LcsPs2,
    /// Vice City Stories, PS2
    VcsPs2,
    /// Either title, PSP
    Psp,
}

impl ImportVariant {
    pub fn platform(self) -> Platform {
        match self {
            ImportVariant::LcsPs2 | ImportVariant::VcsPs2 => Platform::Ps2,
            ImportVariant::Psp => Platform::Psp,
        }
    }

    /// Offset of the name pointer inside a frame record.
    pub fn frame_name_offset(self) -> usize {
        match self {
            ImportVariant::LcsPs2 => 0xA4,
            ImportVariant::VcsPs2 | ImportVariant::Psp => 0xA8,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ModelKind {
    /// Skinned actor with a frame hierarchy
    Actor,
    /// Static prop
    Prop,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RecordKind {
    Clump,
    Atomic,
}

/// Every top-level record magic observed in retail files.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TopLevelMagic {
    /// Shared by LCS PS2 and PSP clumps
    Clump,
    VcsClump,
    LcsAtomic,
    LcsAtomicAlt,
    VcsAtomic,
    VcsAtomicAlt,
    PspAtomic,
    PspAtomicAlt,
}

impl TopLevelMagic {
    pub const ALL: [TopLevelMagic; 8] = [
        TopLevelMagic::Clump,
        TopLevelMagic::VcsClump,
        TopLevelMagic::LcsAtomic,
        TopLevelMagic::LcsAtomicAlt,
        TopLevelMagic::VcsAtomic,
        TopLevelMagic::VcsAtomicAlt,
        TopLevelMagic::PspAtomic,
        TopLevelMagic::PspAtomicAlt,
    ];

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_u32() == value)
    }

    pub fn as_u32(self) -> u32 {
        match self {
            TopLevelMagic::Clump => 0x0000_0002,
            TopLevelMagic::VcsClump => 0x0000_AA02,
            TopLevelMagic::LcsAtomic => 0x0105_0001,
            TopLevelMagic::LcsAtomicAlt => 0x0100_0001,
            TopLevelMagic::VcsAtomic => 0x0004_AA01,
            TopLevelMagic::VcsAtomicAlt => 0x0300_AA00,
            TopLevelMagic::PspAtomic => 0x0004_1601,
            TopLevelMagic::PspAtomicAlt => 0x01F4_0400,
        }
    }

    pub fn kind(self) -> RecordKind {
        match self {
            TopLevelMagic::Clump | TopLevelMagic::VcsClump => RecordKind::Clump,
            _ => RecordKind::Atomic,
        }
    }

    /// Variant implied by the magic alone; `None` for the shared clump value.
    pub fn variant(self) -> Option<ImportVariant> {
        match self {
            TopLevelMagic::Clump => None,
            TopLevelMagic::VcsClump | TopLevelMagic::VcsAtomic | TopLevelMagic::VcsAtomicAlt => {
                Some(ImportVariant::VcsPs2)
            }
            TopLevelMagic::LcsAtomic | TopLevelMagic::LcsAtomicAlt => Some(ImportVariant::LcsPs2),
            TopLevelMagic::PspAtomic | TopLevelMagic::PspAtomicAlt => Some(ImportVariant::Psp),
        }
    }
}

/// Per-axis fixed-point scale and translation of a PS2 geometry block.
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct ScalePos {
    #[br(map = |raw: [f32; 3]| Vec3::from_array(raw))]
    #[bw(map = |v: &Vec3| v.to_array())]
    pub scale: Vec3,
    #[br(map = |raw: [f32; 3]| Vec3::from_array(raw))]
    #[bw(map = |v: &Vec3| v.to_array())]
    pub translation: Vec3,
}

impl Default for ScalePos {
    fn default() -> Self { Self { scale: Vec3::ONE, translation: Vec3::ZERO } }
}

impl ScalePos {
    /// Fits the full i16 range around the bounding box of `points`.
    pub fn fit<I>(points: I) -> Self
    where I: IntoIterator<Item = Vec3> {
        let mut iter = points.into_iter();
        let Some(first) = iter.next() else { return Self::default() };
        let (min, max) = iter.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        let half = (max - min) * 0.5;
        let scale = Vec3::select(
            half.cmpgt(Vec3::ZERO),
            half / (i16::MAX as f32 * GLOBAL_SCALE),
            Vec3::ONE,
        );
        Self { scale, translation: (min + max) * 0.5 }
    }

    /// Size of one quantization step per axis.
    pub fn step(&self) -> Vec3 { self.scale * GLOBAL_SCALE }

    pub fn dequantize(&self, raw: [i16; 3]) -> Vec3 {
        Vec3::new(raw[0] as f32, raw[1] as f32, raw[2] as f32) * self.step() + self.translation
    }

    pub fn quantize(&self, p: Vec3) -> [i16; 3] {
        let step = self.step();
        let rel = p - self.translation;
        let mut out = [0i16; 3];
        for axis in 0..3 {
            if step[axis] != 0.0 {
                let q = (rel[axis] / step[axis]).round();
                out[axis] = q.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
        }
        out
    }
}

/// Expands a 5/5/5/1 color into 8-bit RGBA.
pub fn unpack_5551(value: u16) -> [u8; 4] {
    let expand = |c: u16| ((c & 0x1F) as u32 * 255 / 31) as u8;
    let alpha = if value & 0x8000 != 0 { 0xFF } else { 0 };
    [expand(value), expand(value >> 5), expand(value >> 10), alpha]
}

pub fn pack_5551(rgba: [u8; 4]) -> u16 {
    let reduce = |c: u8| ((c as f32 * 31.0 / 255.0).round() as u16) & 0x1F;
    let alpha = if rgba[3] >= 0x80 { 0x8000 } else { 0 };
    reduce(rgba[0]) | (reduce(rgba[1]) << 5) | (reduce(rgba[2]) << 10) | alpha
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_table_is_disjoint() {
        for magic in TopLevelMagic::ALL {
            assert_eq!(TopLevelMagic::from_u32(magic.as_u32()), Some(magic));
        }
        assert_eq!(TopLevelMagic::from_u32(0x1234), None);
        assert_eq!(TopLevelMagic::Clump.variant(), None);
        assert_eq!(TopLevelMagic::PspAtomicAlt.variant(), Some(ImportVariant::Psp));
    }

    #[test]
    fn colors_survive_repacking() {
        for raw in [0x0000u16, 0x7FFF, 0x8001, 0xFC1F, 0x5294] {
            assert_eq!(pack_5551(unpack_5551(raw)), raw);
        }
    }

    #[test]
    fn quantization_error_within_half_step() {
        let points = [Vec3::new(-3.0, 0.5, 10.0), Vec3::new(7.25, 0.5, -2.0)];
        let sp = ScalePos::fit(points);
        assert_eq!(sp.scale.y, 1.0);
        for p in points {
            let back = sp.dequantize(sp.quantize(p));
            let err = (back - p).abs();
            let tol = sp.step() * 0.5 + Vec3::splat(1e-4);
            assert!(err.cmple(tol).all(), "{p} -> {back}");
        }
    }
}
