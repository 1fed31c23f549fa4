use glam::Vec2;
use half::f16;
use serde_derive::Serialize;
use strum::{Display, EnumString};

use crate::{
    format::{
        error::EncodeError,
        frame::FrameRecord,
        header::{AtomicRecord, ClumpRecord, RawHeader, K_ATOMIC_LINK_OFFSET, K_ATOMIC_PAD, K_MAGIC_LDM},
        material::{GeometryHeader, MaterialRecord, SpecularRecord},
        mdl::{DecodedModel, Geometry},
        pack_5551,
        ps2::{
            PartEntry, Ps2GeometryHeader, ScanLimits, K_CMD_COLOR, K_CMD_NORMAL, K_CMD_POSITION,
            K_CMD_SKIN, K_CMD_UV16, K_CULLING_DISABLED, K_MSCAL, K_STRIP_TAG, K_TAG_QUAD,
            K_VIF_UNSIGNED, K_WINDOW_MASK,
        },
        strip::{split_strip, stitch_strips, TriangleStrip, K_MAX_BATCH_VERTICES},
        ModelKind, ScalePos, TopLevelMagic, FRAME_RECORD_SIZE, SECTOR_SIZE,
    },
    util::cursor::ByteWriter,
};

pub const K_ALLOCATED_MEMORY: u32 = 0x10000;
// Largest vertex count a position header can hold
pub const K_MAX_PACKET_VERTICES: usize = 0x7F;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExportMaterial {
    pub texture: String,
    pub rgba: u32,
    pub specular: Option<f32>,
}

/// In-memory scene handed to [`encode`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExportModel {
    pub kind: ModelKind,
    pub model_info_id: i16,
    /// Fixed-point frame for positions; fitted to the whole model when unset.
    pub scale_pos: Option<ScalePos>,
    pub materials: Vec<ExportMaterial>,
    pub strips: Vec<TriangleStrip>,
}

impl ExportModel {
    pub fn new(kind: ModelKind) -> Self {
        Self { kind, model_info_id: -1, scale_pos: None, materials: Vec::new(), strips: Vec::new() }
    }

    /// Rebuilds an export model from a decode result. PS2 batches are
    /// stitched back into logical strips.
    pub fn from_decoded(model: &DecodedModel) -> Self {
        let materials = model
            .materials
            .iter()
            .map(|m| ExportMaterial { texture: m.texture.clone(), rgba: m.rgba, specular: m.specular })
            .collect();
        let (scale_pos, strips) = match &model.geometry {
            Geometry::Ps2(geometry) => {
                let batches: Vec<TriangleStrip> =
                    geometry.parts.iter().flat_map(|p| p.strips.iter().cloned()).collect();
                (Some(geometry.scale_pos), stitch_strips(&batches))
            }
            Geometry::Psp(geometry) => {
                (None, geometry.meshes.iter().map(|m| m.strip.clone()).collect())
            }
        };
        Self {
            kind: model.kind,
            model_info_id: model.graph.atomic.model_info_id,
            scale_pos,
            materials,
            strips,
        }
    }
}

/// Shape of the part table the encoder emits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PartTableLayout {
    /// 48-byte entries; one part per run of same-material strips
    #[default]
    Explicit,
    /// One offset per material, strips grouped by material
    Offsets,
    /// No table; material `i` is the `i`-th packet
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExportOptions {
    pub table: PartTableLayout,
    pub normals: bool,
    pub max_batch_vertices: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self { table: PartTableLayout::Explicit, normals: true, max_batch_vertices: K_MAX_BATCH_VERTICES }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketOptions {
    pub normals: bool,
}

impl Default for PacketOptions {
    fn default() -> Self { Self { normals: true } }
}

struct EncodedPart {
    material: u16,
    batches: Vec<TriangleStrip>,
}

/// Builds a complete MDL image, padded to the sector size.
pub fn encode(model: &ExportModel, options: &ExportOptions) -> Result<Vec<u8>, EncodeError> {
    validate(model)?;
    let scale_pos = model.scale_pos.unwrap_or_else(|| {
        ScalePos::fit(model.strips.iter().flat_map(|s| s.positions.iter().copied()))
    });
    let parts = plan_parts(model, options)?;
    let actor = model.kind == ModelKind::Actor;

    let mut w = ByteWriter::new();
    w.put_bytes(&K_MAGIC_LDM);
    w.write_record(&RawHeader::default())?;
    let top = w.position() as u32 + 4;
    w.put_ptr(top);

    let clump_at = top as usize;
    let atomic_at = if actor { clump_at + 0x10 } else { clump_at };
    let frames_at = (atomic_at + 0x30).next_multiple_of(16);
    if actor {
        w.write_record(&ClumpRecord {
            magic: TopLevelMagic::VcsClump.as_u32(),
            frame: frames_at as u32,
            first_atomic_link: atomic_at as u32 + K_ATOMIC_LINK_OFFSET,
            last_atomic_link: atomic_at as u32 + K_ATOMIC_LINK_OFFSET,
        })?;
        [4, 8, 0xC].into_iter().for_each(|f| w.mark_pointer(clump_at + f));
    }
    w.write_record(&AtomicRecord {
        magic: TopLevelMagic::VcsAtomic.as_u32(),
        frame: frames_at as u32,
        pad: K_ATOMIC_PAD,
        clump: if actor { clump_at as u32 } else { 0 },
        model_info_id: model.model_info_id,
        ..Default::default()
    })?;
    w.mark_pointer(atomic_at + 4);
    w.mark_pointer(atomic_at + 0x14);
    if actor {
        w.mark_pointer(atomic_at + 0x1C);
    }
    w.align(16);

    // Identity root, plus one child for actors.
    let frame_count = if actor { 2 } else { 1 };
    for i in 0..frame_count {
        let at = w.position();
        let child = if i + 1 < frame_count { (at + FRAME_RECORD_SIZE) as u32 } else { 0 };
        w.write_record(&FrameRecord::identity(child, 0))?;
        if child != 0 {
            w.mark_pointer(at + 0x90);
        }
        w.put_bytes(&vec![0; at + FRAME_RECORD_SIZE - w.position()]);
    }

    let texture_fields = write_materials(&mut w, model)?;
    w.align(16);

    let geometry_at = w.position();
    w.patch_u32(atomic_at + 0x14, geometry_at as u32);
    w.write_record(&GeometryHeader {
        unknown: [0; 3],
        material_list: texture_fields.list as u32,
        material_count: model.materials.len() as u32,
    })?;
    w.mark_pointer(geometry_at + 12);
    w.write_record(&Ps2GeometryHeader { unknown: [0; 13], scale_pos })?;

    write_geometry(&mut w, &parts, &scale_pos, options)?;

    // Relocation table: entry count, then every pointer field.
    for (i, material) in model.materials.iter().enumerate() {
        if !material.texture.is_empty() {
            w.mark_pointer(texture_fields.records + i * 16);
        }
    }
    let mut pointers = w.pointer_fields().to_vec();
    pointers.sort_unstable();
    let relocations_at = w.position();
    w.put_u32(pointers.len() as u32);
    pointers.iter().for_each(|&p| w.put_u32(p));

    let strings_at = w.position();
    for (i, material) in model.materials.iter().enumerate() {
        if material.texture.is_empty() {
            continue;
        }
        let at = w.position();
        w.put_bytes(material.texture.as_bytes());
        w.put_u8(0);
        w.patch_u32(texture_fields.records + i * 16, at as u32);
    }
    w.align(SECTOR_SIZE);

    let (local_table, global_table) = if actor {
        (relocations_at as u32, relocations_at as u32 + 4)
    } else {
        (strings_at as u32, relocations_at as u32)
    };
    let header = RawHeader {
        shrink: 0,
        file_len: w.position() as u32,
        local_table,
        global_table,
        num_entries: pointers.len() as u32,
        ptr_before_textures: strings_at as u32,
        allocated_memory: K_ALLOCATED_MEMORY,
        ..Default::default()
    };
    w.patch_record(K_MAGIC_LDM.len(), &header)?;
    log::debug!(
        "Encoded {} model: {} parts, {} relocations, 0x{:X} bytes",
        model.kind,
        parts.len(),
        pointers.len(),
        header.file_len
    );
    Ok(w.into_inner())
}

fn validate(model: &ExportModel) -> Result<(), EncodeError> {
    if model.materials.is_empty() {
        return Err(EncodeError::NoMaterials);
    }
    if model.strips.is_empty() {
        return Err(EncodeError::NoGeometry);
    }
    for (index, strip) in model.strips.iter().enumerate() {
        let vertices = strip.len();
        if vertices < 3 {
            return Err(EncodeError::StripTooShort { strip: index, len: vertices });
        }
        if strip.material as usize >= model.materials.len() {
            return Err(EncodeError::MaterialOutOfRange {
                strip: index,
                material: strip.material,
                count: model.materials.len(),
            });
        }
        let attributes = [
            ("uv", strip.uvs.len()),
            ("normal", strip.normals.len()),
            ("color", strip.colors.len()),
            ("skin", strip.skin.len()),
        ];
        for (attribute, len) in attributes {
            if len != 0 && len != vertices {
                return Err(EncodeError::AttributeMismatch { strip: index, attribute, len, vertices });
            }
        }
    }
    Ok(())
}

fn plan_parts(model: &ExportModel, options: &ExportOptions) -> Result<Vec<EncodedPart>, EncodeError> {
    let split = |s: &TriangleStrip| split_strip(s, options.max_batch_vertices);
    let parts = match options.table {
        PartTableLayout::Explicit => material_runs(&model.strips, split),
        PartTableLayout::Offsets => (0..model.materials.len() as u16)
            .map(|material| EncodedPart {
                material,
                batches: model.strips.iter().filter(|s| s.material == material).flat_map(split).collect(),
            })
            .collect(),
        PartTableLayout::None => {
            let parts = material_runs(&model.strips, split);
            if parts.len() != model.materials.len() {
                return Err(EncodeError::UnrepresentableLayout {
                    reason: format!(
                        "{} material runs for {} materials",
                        parts.len(),
                        model.materials.len()
                    ),
                });
            }
            for (i, part) in parts.iter().enumerate() {
                if part.material as usize != i {
                    return Err(EncodeError::UnrepresentableLayout {
                        reason: format!("run {i} uses material {}", part.material),
                    });
                }
                if i + 1 < parts.len() && part.batches.len() != 1 {
                    return Err(EncodeError::UnrepresentableLayout {
                        reason: format!("material {i} needs {} packets", part.batches.len()),
                    });
                }
            }
            parts
        }
    };
    let max_parts = ScanLimits::default().max_parts;
    if parts.len() > max_parts {
        return Err(EncodeError::UnrepresentableLayout {
            reason: format!("{} parts exceed the limit of {max_parts}", parts.len()),
        });
    }
    Ok(parts)
}

fn material_runs<F>(strips: &[TriangleStrip], split: F) -> Vec<EncodedPart>
where F: Fn(&TriangleStrip) -> Vec<TriangleStrip> {
    let mut parts: Vec<EncodedPart> = Vec::new();
    for strip in strips {
        match parts.last_mut() {
            Some(part) if part.material == strip.material => part.batches.extend(split(strip)),
            _ => parts.push(EncodedPart { material: strip.material, batches: split(strip) }),
        }
    }
    parts
}

struct MaterialFields {
    /// First 16-byte material record.
    records: usize,
    /// The pointer list referenced by the geometry header.
    list: usize,
}

fn write_materials(w: &mut ByteWriter, model: &ExportModel) -> Result<MaterialFields, EncodeError> {
    let records = w.position();
    let mut specular_at = records + model.materials.len() * 16;
    for (i, material) in model.materials.iter().enumerate() {
        let specular = match material.specular {
            Some(_) => {
                let at = specular_at;
                specular_at += 12;
                w.mark_pointer(records + i * 16 + 12);
                at as u32
            }
            None => 0,
        };
        w.write_record(&MaterialRecord { texture: 0, rgba: material.rgba, reserved: 0, specular })?;
    }
    for specular in model.materials.iter().filter_map(|m| m.specular) {
        w.write_record(&SpecularRecord { reserved: [0; 2], specular })?;
    }
    let list = w.position();
    for i in 0..model.materials.len() {
        w.put_ptr((records + i * 16) as u32);
    }
    Ok(MaterialFields { records, list })
}

fn write_geometry(
    w: &mut ByteWriter,
    parts: &[EncodedPart],
    scale_pos: &ScalePos,
    options: &ExportOptions,
) -> Result<(), EncodeError> {
    let packet_options = PacketOptions { normals: options.normals };
    let explicit = options.table == PartTableLayout::Explicit;

    let mut packets = Vec::with_capacity(parts.len());
    for part in parts {
        let uv_scale = if explicit { part_uv_scale(&part.batches) } else { [f16::ONE; 2] };
        let scale = Vec2::new(uv_scale[0].to_f32(), uv_scale[1].to_f32());
        let mut pw = ByteWriter::new();
        for batch in &part.batches {
            write_strip_packet(&mut pw, batch, scale_pos, scale, &packet_options)?;
        }
        packets.push((uv_scale, pw.into_inner()));
    }

    let mut offset = 0u32;
    match options.table {
        PartTableLayout::Explicit => {
            for (part, (uv_scale, bytes)) in parts.iter().zip(&packets) {
                let window = if bytes.len() > K_WINDOW_MASK as usize { 0 } else { bytes.len() as u16 };
                let culling = !part.batches.is_empty() && part.batches.iter().all(|b| b.culling_disabled);
                w.write_record(&PartEntry {
                    uv_scale: *uv_scale,
                    offset,
                    strip_window: window | if culling { K_CULLING_DISABLED } else { 0 },
                    material: part.material,
                    ..Default::default()
                })?;
                offset += bytes.len() as u32;
            }
        }
        PartTableLayout::Offsets => {
            for (_, bytes) in &packets {
                w.put_u32(offset);
                offset += bytes.len() as u32;
            }
            w.align(16);
        }
        PartTableLayout::None => {}
    }
    for (_, bytes) in &packets {
        w.put_bytes(bytes);
    }
    Ok(())
}

/// Smallest half-float UV scale per axis that brings every coordinate into `0..=1`.
fn part_uv_scale(batches: &[TriangleStrip]) -> [f16; 2] {
    let max = batches
        .iter()
        .flat_map(|b| b.uvs.iter())
        .fold(Vec2::ZERO, |acc, uv| acc.max(uv.abs()));
    max.to_array().map(|m| {
        if m <= 1.0 {
            return f16::ONE;
        }
        let h = f16::from_f32(m);
        if h.to_f32() < m {
            f16::from_bits(h.to_bits() + 1)
        } else {
            h
        }
    })
}

/// Writes one DMA-tagged batch. The strip must fit a single position header.
pub(crate) fn write_strip_packet(
    w: &mut ByteWriter,
    strip: &TriangleStrip,
    scale_pos: &ScalePos,
    uv_scale: Vec2,
    options: &PacketOptions,
) -> Result<(), EncodeError> {
    let count = strip.len();
    if count > K_MAX_PACKET_VERTICES {
        return Err(EncodeError::UnrepresentableLayout {
            reason: format!("batch of {count} vertices exceeds {K_MAX_PACKET_VERTICES}"),
        });
    }
    let n = count as u8;
    let start = w.position();
    let tag_at = w.reserve_u32();
    w.put_bytes(&[0; K_TAG_QUAD - 4]);

    let flags = n | if strip.culling_disabled { 0x80 } else { 0 };
    w.put_bytes(&[n, flags, n, K_CMD_POSITION]);
    for &p in &strip.positions {
        scale_pos.quantize(p).into_iter().for_each(|v| w.put_i16(v));
    }
    if count % 2 == 1 {
        w.put_u16(0);
    }
    w.align(4);

    w.put_bytes(&[0, K_VIF_UNSIGNED, n, K_CMD_UV16]);
    for i in 0..count {
        let uv = strip.uvs.get(i).copied().unwrap_or(Vec2::ZERO) / uv_scale;
        let uv = (uv.clamp(Vec2::ZERO, Vec2::ONE) * 65535.0).round();
        w.put_u16(uv.x as u16);
        w.put_u16(uv.y as u16);
    }

    if !strip.colors.is_empty() {
        w.put_bytes(&[0, K_VIF_UNSIGNED, n, K_CMD_COLOR]);
        strip.colors.iter().for_each(|&c| w.put_u16(pack_5551(c)));
        w.align(4);
    }
    if options.normals && !strip.normals.is_empty() {
        w.put_bytes(&[0, K_VIF_UNSIGNED, n, K_CMD_NORMAL]);
        for normal in &strip.normals {
            for v in normal.to_array() {
                w.put_i8((v * 128.0).round().clamp(-128.0, 127.0) as i8);
            }
        }
        w.align(4);
    }
    if !strip.skin.is_empty() {
        w.put_bytes(&[0, K_VIF_UNSIGNED, n, K_CMD_SKIN]);
        for binding in &strip.skin {
            for (bone, weight) in binding.bones.iter().zip(binding.weights) {
                w.put_u16((*bone).min(0x3FFF) * 4);
                w.put_u8(0);
                w.put_u8((weight * 128.0).round().clamp(0.0, 255.0) as u8);
            }
        }
    }

    w.put_u32(K_MSCAL);
    while (w.position() - start) % 16 != 0 {
        w.put_u8(0);
    }
    let qwc = (w.position() - start - K_TAG_QUAD) / 16;
    w.patch_u32(tag_at, K_STRIP_TAG | qwc as u32);
    Ok(())
}
