use binrw::binrw;
use glam::{Vec2, Vec3};
use half::f16;
use serde_derive::Serialize;

use crate::{
    format::{
        error::{DecodeError, DecodeWarning, WarningKind, WarningSink},
        header::RawHeader,
        material::GeometryHeader,
        mdl::{DecodeOptions, PartErrorPolicy},
        strip::{SkinBinding, TriangleStrip},
        unpack_5551, ScalePos,
    },
    util::cursor::ByteCursor,
};

// DMA tag opening a strip batch; the low bits carry the quadword count
pub const K_STRIP_TAG: u32 = 0x6000_0000;
// VIF unpack headers share the tag's top three bits, so tags match on the whole top byte
pub const K_STRIP_TAG_MASK: u32 = 0xFF00_0000;
// Split section marker
pub const K_SPLIT_TAG: u32 = 0x6C01_8000;
pub const K_SPLIT_TECH: u32 = 0x4040_4020;
// Microprogram call closing a batch
pub const K_MSCAL: u32 = 0x1400_0006;

// VIF unpack commands
pub const K_CMD_POSITION: u8 = 0x79;
pub const K_CMD_UV8: u8 = 0x76;
pub const K_CMD_UV16: u8 = 0x75;
pub const K_CMD_COLOR: u8 = 0x6F;
pub const K_CMD_NORMAL: u8 = 0x6A;
pub const K_CMD_SKIN: u8 = 0x6C;
// Second byte of every attribute unpack header
pub const K_VIF_UNSIGNED: u8 = 0x80;

// DMA tag quadword preceding every batch
pub const K_TAG_QUAD: usize = 16;
// Marker-to-marker step (11 words) while looking for the next tag
pub const K_NON_TAG_STRIDE: usize = 44;
pub const K_PART_TABLE_OFFSET: usize = 0x60;
pub const K_PART_ENTRY_SIZE: usize = 48;
pub const K_SPLIT_HEADER_SIZE: usize = 24;
pub const K_WINDOW_MASK: u16 = 0x7FFF;
pub const K_CULLING_DISABLED: u16 = 0x8000;

/// DMA tag of a strip batch. The first one also terminates the part table.
#[inline]
pub fn is_strip_tag(word: u32) -> bool { word & K_STRIP_TAG_MASK == K_STRIP_TAG }

/// Color, normal or skin unpack header following the UV block.
#[inline]
pub fn is_attribute_header(word: u32) -> bool {
    let [_, unsigned, _, cmd] = word.to_le_bytes();
    unsigned == K_VIF_UNSIGNED && matches!(cmd, K_CMD_COLOR | K_CMD_NORMAL | K_CMD_SKIN)
}

/// PS2 block fields following the material header.
#[binrw]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ps2GeometryHeader {
    pub unknown: [u32; 13],
    pub scale_pos: ScalePos,
}

/// One entry of an explicit part table.
#[binrw]
#[derive(Clone, Debug, PartialEq)]
pub struct PartEntry {
    pub head: u32,
    pub unknown: [u32; 5],
    #[br(map = |raw: [u16; 2]| raw.map(f16::from_bits))]
    #[bw(map = |v: &[f16; 2]| v.map(|h| h.to_bits()))]
    pub uv_scale: [f16; 2],
    pub offset: u32,
    /// Strip byte window in the low 15 bits, culling flag in the top bit.
    pub strip_window: u16,
    pub material: u16,
    pub tail: [u32; 3],
}

impl Default for PartEntry {
    fn default() -> Self {
        Self {
            head: 0,
            unknown: [0; 5],
            uv_scale: [f16::ONE; 2],
            offset: 0,
            strip_window: 0,
            material: 0,
            tail: [0; 3],
        }
    }
}

#[binrw]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SplitHeader {
    pub tag: u32,
    pub reserved0: u32,
    pub count: u8,
    pub pad: [u8; 3],
    pub count2: u8,
    pub pad2: u8,
    pub flags: u16,
    pub tech: u32,
    pub reserved: u32,
}

/// Heuristic thresholds for locating geometry in retail files.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScanLimits {
    /// Largest part offset accepted in a part table.
    pub offset_ceiling: u32,
    /// How far past an offset table the first DMA tag may sit.
    pub sentinel_window: usize,
    /// How far past the block header to look for a DMA tag when no table exists.
    pub derived_scan_window: usize,
    /// How far past its expected position a UV header may be found.
    pub uv_scan_window: usize,
    pub max_parts: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            offset_ceiling: 0x40_0000,
            sentinel_window: 0x800,
            derived_scan_window: 0x100,
            uv_scan_window: 0x200,
            max_parts: 0x100,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PartTableKind {
    /// 48-byte entries with offset, material and strip window
    Explicit,
    /// One offset per material
    Offsets,
    /// No table; one DMA packet per material
    Derived,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct PartSlot {
    /// Relative to the first DMA tag.
    pub offset: u32,
    pub material: u16,
    /// Strip byte budget for the material, zero when unbounded.
    pub window: u16,
    pub culling_disabled: bool,
    pub uv_scale: Vec2,
}

impl PartSlot {
    fn plain(offset: u32, material: u16) -> Self {
        Self { offset, material, window: 0, culling_disabled: false, uv_scale: Vec2::ONE }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PartTable {
    pub kind: PartTableKind,
    /// Absolute offset of the first DMA tag.
    pub geometry_start: usize,
    pub slots: Vec<PartSlot>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GeometryPart {
    pub index: usize,
    pub offset: usize,
    pub end: usize,
    pub material: u16,
    pub uv_scale: Vec2,
    pub culling_disabled: bool,
    pub strips: Vec<TriangleStrip>,
    pub warnings: Vec<DecodeWarning>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Ps2Geometry {
    pub offset: u32,
    pub scale_pos: ScalePos,
    pub table: PartTableKind,
    pub geometry_start: usize,
    pub parts: Vec<GeometryPart>,
    pub warnings: Vec<DecodeWarning>,
}

/// Decodes the PS2 geometry block at `geometry`.
pub fn decode(
    data: &[u8],
    geometry: u32,
    header: &RawHeader,
    options: &DecodeOptions,
) -> Result<Ps2Geometry, DecodeError> {
    let cursor = ByteCursor::new(data);
    let mut c = cursor.at(geometry)?;
    let materials: GeometryHeader = c.read_record()?;
    let block: Ps2GeometryHeader = c.read_record()?;
    let scale_pos = block.scale_pos;
    log::debug!(
        "PS2 geometry 0x{geometry:X}: scale {}, translation {}",
        scale_pos.scale,
        scale_pos.translation
    );

    let table = read_part_table(&cursor, c.position(), materials.material_count, &options.limits)?;
    let geometry_end = geometry_end(header, table.geometry_start, data.len());
    log::debug!(
        "{:?} part table: {} parts, geometry 0x{:X}..0x{geometry_end:X}",
        table.kind,
        table.slots.len(),
        table.geometry_start
    );

    let mut block_sink = WarningSink::new(options.escalate_warnings);
    let mut parts = Vec::with_capacity(table.slots.len());
    for index in 0..table.slots.len() {
        match decode_part(&cursor, &table, index, geometry_end, &scale_pos, options) {
            Ok(part) => parts.push(part),
            Err(e @ DecodeError::Escalated(_)) => return Err(e),
            Err(e) => match options.on_part_error {
                PartErrorPolicy::Abort => return Err(e),
                PartErrorPolicy::SkipRemainingParts => {
                    block_sink.warn(e.offset(), WarningKind::PartsSkipped {
                        first_part: index,
                        error: e.to_string(),
                    })?;
                    break;
                }
            },
        }
    }

    Ok(Ps2Geometry {
        offset: geometry,
        scale_pos,
        table: table.kind,
        geometry_start: table.geometry_start,
        parts,
        warnings: block_sink.into_inner(),
    })
}

/// The last part runs up to the relocation tables when they follow the geometry.
fn geometry_end(header: &RawHeader, geometry_start: usize, len: usize) -> usize {
    [header.local_table, header.global_table]
        .into_iter()
        .map(|o| o as usize)
        .filter(|&o| o > geometry_start && o <= len)
        .min()
        .unwrap_or(len)
}

/// Picks the part table shape: explicit entries, then a bare offset table,
/// then a table derived from the DMA tags themselves.
pub fn read_part_table(
    cursor: &ByteCursor,
    table_start: usize,
    material_count: u32,
    limits: &ScanLimits,
) -> Result<PartTable, DecodeError> {
    if let Some(table) = explicit_table(cursor, table_start, material_count, limits) {
        return Ok(table);
    }
    if let Some(table) = offset_table(cursor, table_start, material_count, limits) {
        return Ok(table);
    }
    derived_table(cursor, table_start, material_count, limits)
}

fn explicit_table(
    cursor: &ByteCursor,
    table_start: usize,
    material_count: u32,
    limits: &ScanLimits,
) -> Option<PartTable> {
    let mut pos = table_start;
    let mut slots: Vec<PartSlot> = Vec::new();
    loop {
        let head = cursor.u32_at(pos).ok()?;
        if is_strip_tag(head) {
            break;
        }
        if slots.len() >= limits.max_parts {
            return None;
        }
        let mut c = *cursor;
        c.seek(pos).ok()?;
        let entry: PartEntry = c.read_record().ok()?;
        let previous = slots.last().map(|s| s.offset);
        let plausible = match previous {
            None => entry.offset == 0,
            Some(prev) => entry.offset >= prev,
        } && entry.offset < limits.offset_ceiling
            && (material_count == 0 || (entry.material as u32) < material_count);
        if !plausible {
            return None;
        }
        let scale = |h: f16| if h.to_f32() == 0.0 { 1.0 } else { h.to_f32() };
        slots.push(PartSlot {
            offset: entry.offset,
            material: entry.material,
            window: entry.strip_window & K_WINDOW_MASK,
            culling_disabled: entry.strip_window & K_CULLING_DISABLED != 0,
            uv_scale: Vec2::new(scale(entry.uv_scale[0]), scale(entry.uv_scale[1])),
        });
        pos += K_PART_ENTRY_SIZE;
    }
    if slots.is_empty() {
        return None;
    }
    Some(PartTable { kind: PartTableKind::Explicit, geometry_start: pos, slots })
}

fn offset_table(
    cursor: &ByteCursor,
    table_start: usize,
    material_count: u32,
    limits: &ScanLimits,
) -> Option<PartTable> {
    let count = material_count as usize;
    if count == 0 || count.saturating_mul(4) > limits.sentinel_window {
        return None;
    }
    let offsets = (0..count)
        .map(|i| cursor.u32_at(table_start + i * 4).ok())
        .collect::<Option<Vec<u32>>>()?;
    let monotonic = offsets[0] == 0 && offsets.windows(2).all(|w| w[0] <= w[1]);
    let sane = offsets.iter().all(|&o| o < limits.offset_ceiling);
    if !monotonic || !sane {
        return None;
    }
    let geometry_start = (table_start + count * 4..table_start + limits.sentinel_window)
        .step_by(4)
        .find(|&pos| cursor.u32_at(pos).map_or(false, is_strip_tag))?;
    let slots =
        offsets.iter().enumerate().map(|(i, &o)| PartSlot::plain(o, i as u16)).collect();
    Some(PartTable { kind: PartTableKind::Offsets, geometry_start, slots })
}

fn derived_table(
    cursor: &ByteCursor,
    table_start: usize,
    material_count: u32,
    limits: &ScanLimits,
) -> Result<PartTable, DecodeError> {
    let found = (table_start..table_start + limits.derived_scan_window)
        .step_by(4)
        .find(|&pos| cursor.u32_at(pos).map_or(false, is_strip_tag));
    let Some(geometry_start) = found else {
        return Err(DecodeError::MarkerMismatch {
            offset: table_start,
            found: cursor.u32_at(table_start).unwrap_or(0),
            expected: "DMA tag after geometry header",
        });
    };
    let mut slots = Vec::new();
    let mut pos = geometry_start;
    for material in 0..material_count.max(1).min(limits.max_parts as u32) {
        let Ok(tag) = cursor.u32_at(pos) else { break };
        if !is_strip_tag(tag) {
            break;
        }
        slots.push(PartSlot::plain((pos - geometry_start) as u32, material as u16));
        pos += (tag & 0xFFFF) as usize * 16 + K_TAG_QUAD;
    }
    Ok(PartTable { kind: PartTableKind::Derived, geometry_start, slots })
}

fn decode_part(
    cursor: &ByteCursor,
    table: &PartTable,
    index: usize,
    geometry_end: usize,
    scale_pos: &ScalePos,
    options: &DecodeOptions,
) -> Result<GeometryPart, DecodeError> {
    let slot = &table.slots[index];
    let start = table.geometry_start + slot.offset as usize;
    let end = table
        .slots
        .get(index + 1)
        .map_or(geometry_end, |next| table.geometry_start + next.offset as usize)
        .min(cursor.len());
    if start > cursor.len() {
        return Err(DecodeError::PointerOutOfRange {
            offset: table.geometry_start,
            pointer: start as u64,
            len: cursor.len(),
        });
    }
    log::debug!("Part {index}: 0x{start:X}..0x{end:X}, material {}", slot.material);

    let mut sink = WarningSink::new(options.escalate_warnings);
    let batch = BatchDecoder { cursor, scale_pos, uv_scale: slot.uv_scale, limits: &options.limits };
    let mut strips = batch.decode_range(start, end, &mut sink)?;
    assign_materials(&table.slots, index, &mut strips, &mut sink)?;

    Ok(GeometryPart {
        index,
        offset: start,
        end,
        material: slot.material,
        uv_scale: slot.uv_scale,
        culling_disabled: slot.culling_disabled,
        strips: strips.into_iter().map(|(strip, _)| strip).collect(),
        warnings: sink.into_inner(),
    })
}

/// Greedy material assignment: each strip consumes its byte length from the
/// current material's window; an exhausted window moves on to the next entry.
pub fn assign_materials(
    slots: &[PartSlot],
    first: usize,
    strips: &mut [(TriangleStrip, usize)],
    sink: &mut WarningSink,
) -> Result<(), DecodeError> {
    let mut slot = first;
    let mut consumed = 0usize;
    let mut exhausted = false;
    for (strip, len) in strips.iter_mut() {
        loop {
            let window = slots[slot].window as usize;
            if window == 0 || consumed < window {
                break;
            }
            if slot + 1 < slots.len() {
                slot += 1;
                consumed = 0;
            } else {
                if !exhausted {
                    sink.warn(0, WarningKind::MaterialWindowExhausted {
                        material: slots[slot].material,
                    })?;
                }
                exhausted = true;
                break;
            }
        }
        strip.material = slots[slot].material;
        consumed += *len;
    }
    Ok(())
}

/// Decodes strip batches inside one part's byte range.
pub(crate) struct BatchDecoder<'a, 'b> {
    pub cursor: &'b ByteCursor<'a>,
    pub scale_pos: &'b ScalePos,
    pub uv_scale: Vec2,
    pub limits: &'b ScanLimits,
}

impl BatchDecoder<'_, '_> {
    /// Returns each strip with the number of bytes it spans.
    pub fn decode_range(
        &self,
        start: usize,
        end: usize,
        sink: &mut WarningSink,
    ) -> Result<Vec<(TriangleStrip, usize)>, DecodeError> {
        let mut strips = Vec::new();
        let mut pos = start;
        while pos + 4 <= end {
            let marker = self.cursor.u32_at(pos)?;
            if marker == K_SPLIT_TAG {
                self.read_split_header(pos, sink)?;
                pos += K_SPLIT_HEADER_SIZE;
                continue;
            }
            if !is_strip_tag(marker) {
                pos += K_NON_TAG_STRIDE;
                continue;
            }
            let (strip, next) = self.decode_batch(pos, end, sink)?;
            log::debug!("Strip at 0x{pos:X}: {} vertices", strip.len());
            strips.push((strip, next - pos));
            pos = next;
        }
        if strips.is_empty() && end > start {
            sink.warn(start, WarningKind::EmptyPart)?;
        }
        Ok(strips)
    }

    fn read_split_header(&self, pos: usize, sink: &mut WarningSink) -> Result<(), DecodeError> {
        let mut c = *self.cursor;
        c.seek(pos)?;
        let split: SplitHeader = c.read_record()?;
        let flags_count = split.flags & K_WINDOW_MASK;
        log::debug!(
            "Split section at 0x{pos:X}: counts {}/{}, flags 0x{:04X}, tech 0x{:08X}",
            split.count,
            split.count2,
            split.flags,
            split.tech
        );
        if split.count != split.count2 || flags_count != split.count as u16 {
            sink.warn(pos, WarningKind::SplitCountMismatch {
                first: split.count,
                second: split.count2,
                flags: split.flags,
            })?;
        }
        Ok(())
    }

    /// Decodes the batch whose DMA tag is at `tag`; returns it with the
    /// position of the next marker.
    fn decode_batch(
        &self,
        tag: usize,
        end: usize,
        sink: &mut WarningSink,
    ) -> Result<(TriangleStrip, usize), DecodeError> {
        let mut c = *self.cursor;
        c.seek(tag + K_TAG_QUAD)?;
        let header_pos = c.position();
        let [count_byte, flags, _num, cmd] = c.read_u32()?.to_le_bytes();
        if cmd != K_CMD_POSITION {
            return Err(DecodeError::MarkerMismatch {
                offset: header_pos,
                found: self.cursor.u32_at(header_pos)?,
                expected: "position unpack header",
            });
        }
        let count = (flags & 0x7F) as usize;
        if count_byte != flags & 0x7F {
            sink.warn(header_pos, WarningKind::VertexCountMismatch {
                header: count_byte,
                flags: flags & 0x7F,
            })?;
        }

        let mut strip = TriangleStrip { culling_disabled: flags & 0x80 != 0, ..Default::default() };
        strip.positions.reserve(count);
        for _ in 0..count {
            let raw = [c.read_i16()?, c.read_i16()?, c.read_i16()?];
            strip.positions.push(self.scale_pos.dequantize(raw));
        }
        if count % 2 == 1 {
            c.skip(2)?;
        }
        c.align(4)?;

        self.read_uvs(&mut c, end, count, &mut strip, sink)?;

        let mut saw_skin = false;
        while c.position() + 4 <= end {
            let word = c.peek_u32()?;
            if word == K_MSCAL {
                c.skip(4)?;
                // the batch is padded to whole quadwords from its tag
                let padded = tag + (c.position() - tag).next_multiple_of(16);
                c.seek(padded.min(end))?;
                break;
            }
            // A one-entry skin header reads as the split tag, so attributes are tested first.
            if !is_attribute_header(word) {
                if word == K_SPLIT_TAG || is_strip_tag(word) {
                    break;
                }
                c.skip(4)?;
                continue;
            }
            c.skip(4)?;
            let [_, _, n, cmd] = word.to_le_bytes();
            match cmd {
                K_CMD_COLOR => {
                    for _ in 0..n {
                        strip.colors.push(unpack_5551(c.read_u16()?));
                    }
                    c.align(4)?;
                }
                K_CMD_NORMAL => {
                    for _ in 0..n {
                        let v = [c.read_i8()?, c.read_i8()?, c.read_i8()?];
                        strip.normals.push(Vec3::new(v[0] as f32, v[1] as f32, v[2] as f32) / 128.0);
                    }
                    c.align(4)?;
                }
                K_CMD_SKIN => {
                    saw_skin = true;
                    for _ in 0..n {
                        let mut binding = SkinBinding::default();
                        for i in 0..4 {
                            binding.bones[i] = c.read_u16()? / 4;
                            let _ = c.read_u8()?;
                            binding.weights[i] = c.read_u8()? as f32 / 128.0;
                        }
                        strip.skin.push(binding);
                    }
                }
                _ => {}
            }
        }

        if saw_skin && strip.skin.len() != count {
            sink.warn(tag, WarningKind::SkinCountMismatch {
                vertices: count,
                entries: strip.skin.len(),
            })?;
            strip.skin.resize(count, SkinBinding::default());
        }
        fit_attribute(&mut strip.normals, count, "normal", tag, sink)?;
        fit_attribute(&mut strip.colors, count, "color", tag, sink)?;
        Ok((strip, c.position()))
    }

    fn read_uvs(
        &self,
        c: &mut ByteCursor,
        end: usize,
        vertices: usize,
        strip: &mut TriangleStrip,
        sink: &mut WarningSink,
    ) -> Result<(), DecodeError> {
        let expected = c.position();
        let is_uv_header = |word: u32| {
            let [_, unsigned, _, cmd] = word.to_le_bytes();
            unsigned == K_VIF_UNSIGNED && (cmd == K_CMD_UV8 || cmd == K_CMD_UV16)
        };
        let first = self.cursor.u32_at(expected)?;
        let found = if is_uv_header(first) {
            expected
        } else {
            let limit = end.min(expected + self.limits.uv_scan_window);
            let Some(pos) = (expected + 4..limit)
                .step_by(4)
                .find(|&pos| pos + 4 <= limit && self.cursor.u32_at(pos).map_or(false, is_uv_header))
            else {
                return Err(DecodeError::MarkerMismatch {
                    offset: expected,
                    found: first,
                    expected: "UV unpack header",
                });
            };
            sink.warn(expected, WarningKind::UvMarkerDisplaced { distance: pos - expected })?;
            pos
        };

        c.seek(found)?;
        let [_, _, n, cmd] = c.read_u32()?.to_le_bytes();
        let n = if n == 0 || n > 0x80 { vertices } else { n as usize };
        for _ in 0..n {
            let uv = if cmd == K_CMD_UV8 {
                Vec2::new(c.read_u8()? as f32, c.read_u8()? as f32) / 127.5
            } else {
                Vec2::new(c.read_u16()? as f32, c.read_u16()? as f32) / 65535.0
            };
            strip.uvs.push(uv * self.uv_scale);
        }
        c.align(4)?;
        if strip.uvs.len() != vertices {
            sink.warn(found, WarningKind::AttributeCountMismatch {
                attribute: "uv",
                vertices,
                entries: strip.uvs.len(),
            })?;
            strip.uvs.resize(vertices, Vec2::ZERO);
        }
        Ok(())
    }
}

fn fit_attribute<T: Clone + Default>(
    values: &mut Vec<T>,
    vertices: usize,
    attribute: &'static str,
    offset: usize,
    sink: &mut WarningSink,
) -> Result<(), DecodeError> {
    if values.is_empty() || values.len() == vertices {
        return Ok(());
    }
    sink.warn(offset, WarningKind::AttributeCountMismatch {
        attribute,
        vertices,
        entries: values.len(),
    })?;
    values.resize(vertices, T::default());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        format::export::{write_strip_packet, PacketOptions},
        util::cursor::ByteWriter,
    };

    fn quad() -> TriangleStrip {
        TriangleStrip {
            positions: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(0.0, 0.5, 0.0),
                Vec3::new(0.5, 0.0, 0.0),
                Vec3::new(0.5, 0.5, 0.0),
            ],
            uvs: vec![Vec2::ZERO, Vec2::Y, Vec2::X, Vec2::ONE],
            ..Default::default()
        }
    }

    fn decode_all(
        data: &[u8],
        limits: &ScanLimits,
    ) -> Result<(Vec<(TriangleStrip, usize)>, Vec<DecodeWarning>), DecodeError> {
        let cursor = ByteCursor::new(data);
        let scale_pos = ScalePos::default();
        let batch = BatchDecoder { cursor: &cursor, scale_pos: &scale_pos, uv_scale: Vec2::ONE, limits };
        let mut sink = WarningSink::new(false);
        let strips = batch.decode_range(0, data.len(), &mut sink)?;
        Ok((strips, sink.into_inner()))
    }

    /// Hand-assembled batch: tag quad, position block, `gap` zero bytes, UV8 block, `extra`.
    fn raw_batch(w: &mut ByteWriter, positions: &[[i16; 3]], count_byte: u8, gap: usize, extra: &[u8]) {
        let start = w.position();
        let qwc_at = w.reserve_u32();
        w.put_bytes(&[0; 12]);
        let n = positions.len() as u8;
        w.put_bytes(&[count_byte, n, n, K_CMD_POSITION]);
        for p in positions {
            p.iter().for_each(|&v| w.put_i16(v));
        }
        w.align(4);
        w.put_bytes(&vec![0; gap]);
        w.put_bytes(&[0, K_VIF_UNSIGNED, n, K_CMD_UV8]);
        for i in 0..n {
            w.put_bytes(&[i * 10, 255 - i]);
        }
        w.align(4);
        w.put_bytes(extra);
        w.put_u32(K_MSCAL);
        w.align(16);
        let qwc = (w.position() - start - K_TAG_QUAD) / 16;
        w.patch_u32(qwc_at, K_STRIP_TAG | qwc as u32);
    }

    #[test]
    fn split_sections_are_skipped_and_checked() {
        let mut w = ByteWriter::new();
        let options = PacketOptions::default();
        for (count, count2) in [(4u8, 4u8), (4, 5)] {
            w.write_record(&SplitHeader {
                tag: K_SPLIT_TAG,
                count,
                count2,
                flags: count as u16,
                tech: K_SPLIT_TECH,
                ..Default::default()
            })
            .unwrap();
            write_strip_packet(&mut w, &quad(), &ScalePos::default(), Vec2::ONE, &options).unwrap();
        }
        let data = w.into_inner();
        let (strips, warnings) = decode_all(&data, &ScanLimits::default()).unwrap();
        assert_eq!(strips.len(), 2);
        assert!(strips.iter().all(|(s, _)| s.len() == 4 && s.triangles().len() == 2));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].offset, strips[0].1 + K_SPLIT_HEADER_SIZE);
        assert!(matches!(warnings[0].kind, WarningKind::SplitCountMismatch { first: 4, second: 5, .. }));
    }

    #[test]
    fn split_header_record_matches_skip() {
        let mut w = ByteWriter::new();
        w.write_record(&SplitHeader::default()).unwrap();
        assert_eq!(w.position(), K_SPLIT_HEADER_SIZE);
    }

    #[test]
    fn attribute_blocks_do_not_end_the_batch() {
        let mut colored = quad();
        colored.colors = vec![[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255], [255, 255, 255, 0]];
        let mut lit = quad();
        lit.normals = vec![Vec3::Z; 4];
        let mut skinned = quad();
        skinned.skin = vec![SkinBinding { bones: [2, 5, 0, 0], weights: [0.5, 0.5, 0.0, 0.0] }; 4];
        let mut all = colored.clone();
        all.normals = lit.normals.clone();
        all.skin = skinned.skin.clone();

        let mut w = ByteWriter::new();
        let options = PacketOptions::default();
        for strip in [&colored, &lit, &skinned, &all] {
            write_strip_packet(&mut w, strip, &ScalePos::default(), Vec2::ONE, &options).unwrap();
        }
        let data = w.into_inner();
        let (strips, warnings) = decode_all(&data, &ScanLimits::default()).unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(strips.len(), 4);
        assert_eq!(strips.iter().map(|(_, len)| len).sum::<usize>(), data.len());

        assert_eq!(strips[0].0.colors, colored.colors);
        assert!(strips[0].0.normals.is_empty() && strips[0].0.skin.is_empty());
        assert_eq!(strips[1].0.normals, vec![Vec3::new(0.0, 0.0, 127.0 / 128.0); 4]);
        assert_eq!(strips[2].0.skin, skinned.skin);
        let last = &strips[3].0;
        assert_eq!((last.colors.len(), last.normals.len(), last.skin.len()), (4, 4, 4));
        assert_eq!(last.skin[3].bones, [2, 5, 0, 0]);
    }

    #[test]
    fn non_tag_words_are_skipped_in_eleven_word_steps() {
        let mut w = ByteWriter::new();
        w.put_bytes(&[0xAB; 2 * K_NON_TAG_STRIDE]);
        let packet_at = w.position();
        write_strip_packet(&mut w, &quad(), &ScalePos::default(), Vec2::ONE, &PacketOptions::default())
            .unwrap();
        let packet_len = w.position() - packet_at;
        let data = w.into_inner();
        let (strips, warnings) = decode_all(&data, &ScanLimits::default()).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(strips.len(), 1);
        assert_eq!(strips[0].0.len(), 4);
        assert_eq!(strips[0].1, packet_len);
    }

    #[test]
    fn displaced_uv_header_is_found_by_scan() {
        let mut w = ByteWriter::new();
        raw_batch(&mut w, &[[0, 0, 0], [1, 0, 0], [0, 1, 0]], 3, 8, &[]);
        let data = w.into_inner();
        let (strips, warnings) = decode_all(&data, &ScanLimits::default()).unwrap();
        let strip = &strips[0].0;
        assert_eq!(strip.uvs.len(), 3);
        assert_eq!(strip.uvs[1], Vec2::new(10.0, 254.0) / 127.5);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::UvMarkerDisplaced { distance: 8 });

        let tight = ScanLimits { uv_scan_window: 8, ..Default::default() };
        let err = decode_all(&data, &tight).unwrap_err();
        assert!(matches!(err, DecodeError::MarkerMismatch { expected: "UV unpack header", .. }));
    }

    #[test]
    fn short_skin_block_is_padded() {
        let mut skin = vec![0, K_VIF_UNSIGNED, 1, K_CMD_SKIN];
        for (bone, weight) in [(3u16, 128u8), (1, 0), (0, 0), (0, 0)] {
            skin.extend_from_slice(&(bone * 4).to_le_bytes());
            skin.extend_from_slice(&[0, weight]);
        }
        let mut w = ByteWriter::new();
        raw_batch(&mut w, &[[0, 0, 0], [1, 0, 0], [0, 1, 0]], 3, 0, &skin);
        let data = w.into_inner();
        let (strips, warnings) = decode_all(&data, &ScanLimits::default()).unwrap();
        let strip = &strips[0].0;
        assert_eq!(strip.skin.len(), strip.len());
        assert_eq!(strip.skin[0].bones, [3, 1, 0, 0]);
        assert_eq!(strip.skin[0].weights, [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(strip.skin[1], SkinBinding { bones: [0; 4], weights: [0.0; 4] });
        assert_eq!(strip.skin[2], SkinBinding::default());
        assert_eq!(warnings[0].kind, WarningKind::SkinCountMismatch { vertices: 3, entries: 1 });
    }

    #[test]
    fn count_byte_mismatch_warns_and_trusts_flags() {
        let mut w = ByteWriter::new();
        raw_batch(&mut w, &[[0, 0, 0], [1, 0, 0], [0, 1, 0], [1, 1, 0]], 9, 0, &[]);
        let data = w.into_inner();
        let (strips, warnings) = decode_all(&data, &ScanLimits::default()).unwrap();
        assert_eq!(strips[0].0.len(), 4);
        assert_eq!(warnings[0].kind, WarningKind::VertexCountMismatch { header: 9, flags: 4 });
    }

    #[test]
    fn bad_position_header_is_fatal() {
        let mut w = ByteWriter::new();
        raw_batch(&mut w, &[[0, 0, 0], [1, 0, 0], [0, 1, 0]], 3, 0, &[]);
        let mut data = w.into_inner();
        data[K_TAG_QUAD + 3] = 0x68;
        let err = decode_all(&data, &ScanLimits::default()).unwrap_err();
        assert!(matches!(err, DecodeError::MarkerMismatch { offset: 16, .. }));
    }

    #[test]
    fn range_without_markers_is_an_empty_part() {
        let data = vec![0u8; 0x60];
        let (strips, warnings) = decode_all(&data, &ScanLimits::default()).unwrap();
        assert!(strips.is_empty());
        assert_eq!(warnings[0].kind, WarningKind::EmptyPart);
    }

    #[test]
    fn windows_hand_strips_to_following_materials() {
        let slots = [
            PartSlot { window: 100, ..PartSlot::plain(0, 4) },
            PartSlot { window: 50, ..PartSlot::plain(300, 7) },
        ];
        let mut strips: Vec<_> = [60, 60, 50, 10].map(|len| (TriangleStrip::default(), len)).into();
        let mut sink = WarningSink::new(false);
        assign_materials(&slots, 0, &mut strips, &mut sink).unwrap();
        let materials: Vec<u16> = strips.iter().map(|(s, _)| s.material).collect();
        assert_eq!(materials, vec![4, 4, 7, 7]);
        assert_eq!(sink.into_inner()[0].kind, WarningKind::MaterialWindowExhausted { material: 7 });
    }

    #[test]
    fn offset_table_needs_monotonic_offsets() {
        let mut w = ByteWriter::new();
        for word in [0u32, 0x40, 0x20, 0] {
            w.put_u32(word);
        }
        w.put_u32(K_STRIP_TAG | 1);
        w.put_bytes(&[0; 28]);
        let data = w.into_inner();
        let cursor = ByteCursor::new(&data);
        let limits = ScanLimits::default();
        assert!(offset_table(&cursor, 0, 3, &limits).is_none());
        let table = offset_table(&cursor, 0, 2, &limits).unwrap();
        assert_eq!(table.geometry_start, 0x10);
        assert_eq!(table.slots[1].offset, 0x40);
        let derived = read_part_table(&cursor, 0, 0, &limits).unwrap();
        assert_eq!(derived.kind, PartTableKind::Derived);
        assert_eq!(derived.slots.len(), 1);
    }
}
