use std::collections::HashSet;

use binrw::binrw;
use glam::{Mat4, Vec3};
use indexmap::IndexMap;
use serde_derive::Serialize;

use crate::{
    format::{error::DecodeError, ImportVariant},
    util::cursor::ByteCursor,
};

pub const K_DEFAULT_BONE_NAME: &str = "Bone";

/// One matrix row: three floats and a padding word.
#[binrw]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct MatrixRow {
    #[br(map = |raw: [f32; 3]| Vec3::from_array(raw))]
    #[bw(map = |v: &Vec3| v.to_array())]
    pub v: Vec3,
    pub pad: u32,
}

/// Fixed part of a frame record. The name pointer sits past it at a
/// variant-dependent offset.
#[binrw]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameRecord {
    pub header: [u32; 4],
    pub local: [MatrixRow; 4],
    pub world: [MatrixRow; 4],
    pub child: u32,
    pub sibling: u32,
}

impl FrameRecord {
    pub fn identity(child: u32, sibling: u32) -> Self {
        let rows = rows_from_matrix(Mat4::IDENTITY);
        Self { header: [0; 4], local: rows, world: rows, child, sibling }
    }
}

/// Rotation basis rows followed by the translation row.
pub fn matrix_from_rows(rows: &[MatrixRow; 4]) -> Mat4 {
    Mat4::from_cols(
        rows[0].v.extend(0.0),
        rows[1].v.extend(0.0),
        rows[2].v.extend(0.0),
        rows[3].v.extend(1.0),
    )
}

pub fn rows_from_matrix(m: Mat4) -> [MatrixRow; 4] {
    [m.x_axis, m.y_axis, m.z_axis, m.w_axis].map(|c| MatrixRow { v: c.truncate(), pad: 0 })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BoneFrame {
    pub offset: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub local: Mat4,
    pub world: Mat4,
    /// World matrix as stored in the file.
    pub stored_world: Mat4,
    pub child: u32,
    pub sibling: u32,
}

/// Walks the first-child/next-sibling tree rooted at `root`, pre-order.
///
/// Offsets already visited are skipped, so cyclic links terminate.
pub fn walk(
    data: &[u8],
    root: u32,
    variant: ImportVariant,
) -> Result<IndexMap<u32, BoneFrame>, DecodeError> {
    let cursor = ByteCursor::new(data);
    let mut frames = IndexMap::new();
    let mut visited = HashSet::new();
    // (frame, parent, parent world)
    let mut stack = vec![(root, None, Mat4::IDENTITY)];
    while let Some((offset, parent, parent_world)) = stack.pop() {
        if offset == 0 {
            continue;
        }
        if !visited.insert(offset) {
            log::debug!("Frame 0x{offset:X} already visited, skipping");
            continue;
        }
        let mut record_cursor = cursor.at(offset)?;
        let record: FrameRecord = record_cursor.read_record()?;
        let name_ptr = cursor.u32_at(offset as usize + variant.frame_name_offset())?;
        let name = cursor.cstr_at(name_ptr)?.unwrap_or_else(|| K_DEFAULT_BONE_NAME.to_string());

        let local = matrix_from_rows(&record.local);
        let world = parent_world * local;
        log::debug!(
            "Frame 0x{offset:X} '{name}': child 0x{:X}, sibling 0x{:X}",
            record.child,
            record.sibling
        );

        // Sibling is pushed first so the child subtree is emitted before it.
        stack.push((record.sibling, parent, parent_world));
        stack.push((record.child, Some(offset), world));
        frames.insert(offset, BoneFrame {
            offset,
            parent,
            name,
            local,
            world,
            stored_world: matrix_from_rows(&record.world),
            child: record.child,
            sibling: record.sibling,
        });
    }
    Ok(frames)
}
