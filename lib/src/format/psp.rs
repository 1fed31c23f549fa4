use binrw::binrw;
use glam::{Vec2, Vec3};
use serde_derive::Serialize;

use crate::{
    format::{error::DecodeError, material::GeometryHeader, strip::{SkinBinding, TriangleStrip}, unpack_5551},
    util::cursor::ByteCursor,
};

// Opaque words between the material header and the PSP header
pub const K_PSP_HEADER_SKIP: usize = 12;
// The vertex buffer pointer is stored relative to this bias
pub const K_VERTEX_OFFSET_BIAS: u32 = 0xA8;
pub const K_PALETTE_SIZE: usize = 8;

#[binrw]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PspGeometryHeader {
    pub size: u32,
    pub flags: u32,
    pub num_meshes: u32,
    pub unknown: u32,
    pub bound: [f32; 4],
    #[br(map = |raw: [f32; 3]| Vec3::from_array(raw))]
    #[bw(map = |v: &Vec3| v.to_array())]
    pub scale: Vec3,
    pub num_verts: i32,
    #[br(map = |raw: [f32; 3]| Vec3::from_array(raw))]
    #[bw(map = |v: &Vec3| v.to_array())]
    pub translation: Vec3,
    pub unknown2: i32,
    pub vertex_offset: u32,
    pub unknown3: f32,
}

#[binrw]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PspMeshHeader {
    pub offset: u32,
    pub num_triangles: u16,
    pub material: u16,
    pub unknown: f32,
    #[br(map = |raw: [f32; 2]| Vec2::from_array(raw))]
    #[bw(map = |v: &Vec2| v.to_array())]
    pub uv_scale: Vec2,
    pub unknown2: [f32; 4],
    pub unknown3: f32,
    pub bone_palette: [u8; K_PALETTE_SIZE],
}

/// Every vertex flag word the games ship with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum VertexFormat {
    NormalPos16,
    UvNormalPos16,
    UvColorPos16,
    ColorPos16,
    UvNormalPos8,
    SkinnedUvNormalPos16,
}

impl VertexFormat {
    pub fn from_flags(flags: u32) -> Option<Self> {
        match flags {
            0x120 => Some(VertexFormat::NormalPos16),
            0x121 => Some(VertexFormat::UvNormalPos16),
            0x115 => Some(VertexFormat::UvColorPos16),
            0x114 => Some(VertexFormat::ColorPos16),
            0xA1 => Some(VertexFormat::UvNormalPos8),
            0x1C321 => Some(VertexFormat::SkinnedUvNormalPos16),
            _ => None,
        }
    }

    pub fn flags(self) -> u32 {
        match self {
            VertexFormat::NormalPos16 => 0x120,
            VertexFormat::UvNormalPos16 => 0x121,
            VertexFormat::UvColorPos16 => 0x115,
            VertexFormat::ColorPos16 => 0x114,
            VertexFormat::UvNormalPos8 => 0xA1,
            VertexFormat::SkinnedUvNormalPos16 => 0x1C321,
        }
    }

    pub fn layout(self) -> VertexLayout { VertexLayout::from_flags(self.flags()) }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PositionFormat {
    S8,
    S16,
}

/// Byte offsets of each vertex field, derived from the flag bit-fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VertexLayout {
    pub weight_count: usize,
    pub weights: Option<usize>,
    pub uv: Option<usize>,
    pub color: Option<usize>,
    pub normal: Option<usize>,
    pub position_format: PositionFormat,
    pub position: usize,
    pub stride: usize,
}

impl VertexLayout {
    fn from_flags(flags: u32) -> Self {
        let uv_fmt = flags & 3;
        let color_fmt = (flags >> 2) & 7;
        let normal_fmt = (flags >> 5) & 3;
        let position_fmt = (flags >> 7) & 3;
        let weight_fmt = (flags >> 9) & 3;
        let weight_count = ((flags >> 14) & 7) as usize + 1;

        let mut at = 0usize;
        let mut max_align = 1usize;
        let mut field = |present: bool, size: usize, align: usize| {
            if !present {
                return None;
            }
            at = at.next_multiple_of(align);
            max_align = max_align.max(align);
            let start = at;
            at += size;
            Some(start)
        };
        let weights = field(weight_fmt != 0, weight_count, 1);
        let uv = field(uv_fmt != 0, 2, 1);
        let color = field(color_fmt != 0, 2, 2);
        let normal = field(normal_fmt != 0, 3, 1);
        let position_format = if position_fmt == 1 { PositionFormat::S8 } else { PositionFormat::S16 };
        let position = match position_format {
            PositionFormat::S8 => field(true, 3, 1),
            PositionFormat::S16 => field(true, 6, 2),
        }
        .unwrap_or(0);
        let stride = at.next_multiple_of(max_align);
        Self {
            weight_count: if weights.is_some() { weight_count } else { 0 },
            weights,
            uv,
            color,
            normal,
            position_format,
            position,
            stride,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PspMesh {
    pub index: usize,
    pub offset: usize,
    pub material: u16,
    pub uv_scale: Vec2,
    pub bone_palette: [u8; K_PALETTE_SIZE],
    pub strip: TriangleStrip,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PspGeometry {
    pub offset: u32,
    pub format: VertexFormat,
    pub layout: VertexLayout,
    pub scale: Vec3,
    pub translation: Vec3,
    pub bound: [f32; 4],
    pub vertex_count: i32,
    pub vertex_buffer: usize,
    pub meshes: Vec<PspMesh>,
}

/// Decodes the PSP geometry block at `geometry`. Any short read is fatal.
pub fn decode(data: &[u8], geometry: u32) -> Result<PspGeometry, DecodeError> {
    let cursor = ByteCursor::new(data);
    let mut c = cursor.at(geometry)?;
    let _: GeometryHeader = c.read_record()?;
    c.skip(K_PSP_HEADER_SKIP as isize)?;
    let header_pos = c.position();
    let header: PspGeometryHeader = c.read_record()?;
    let Some(format) = VertexFormat::from_flags(header.flags) else {
        return Err(DecodeError::UnknownVertexFormat { offset: header_pos + 4, flags: header.flags });
    };
    let layout = format.layout();
    log::debug!(
        "PSP geometry 0x{geometry:X}: {format:?} (stride {}), {} meshes, {} vertices",
        layout.stride,
        header.num_meshes,
        header.num_verts
    );

    let mut mesh_headers = Vec::with_capacity(header.num_meshes.min(0x100) as usize);
    for _ in 0..header.num_meshes {
        mesh_headers.push(c.read_record::<PspMeshHeader>()?);
    }

    let Some(vertex_buffer) =
        (geometry as u64 + header.vertex_offset as u64).checked_sub(K_VERTEX_OFFSET_BIAS as u64)
    else {
        return Err(DecodeError::PointerOutOfRange {
            offset: header_pos + 0x40,
            pointer: header.vertex_offset as u64,
            len: data.len(),
        });
    };
    let vertex_buffer = vertex_buffer as usize;

    let reader = VertexReader { cursor: &cursor, layout, scale: header.scale, translation: header.translation };
    let mut meshes = Vec::with_capacity(mesh_headers.len());
    for (index, mesh) in mesh_headers.into_iter().enumerate() {
        let offset = vertex_buffer + mesh.offset as usize;
        let count = mesh.num_triangles as usize + 2;
        log::debug!(
            "Mesh {index}: 0x{offset:X}, {count} vertices, material {}, palette {:?}",
            mesh.material,
            mesh.bone_palette
        );
        let mut strip = TriangleStrip { material: mesh.material, ..Default::default() };
        for i in 0..count {
            reader.read_vertex(offset + i * layout.stride, &mesh, &mut strip)?;
        }
        meshes.push(PspMesh {
            index,
            offset,
            material: mesh.material,
            uv_scale: mesh.uv_scale,
            bone_palette: mesh.bone_palette,
            strip,
        });
    }

    Ok(PspGeometry {
        offset: geometry,
        format,
        layout,
        scale: header.scale,
        translation: header.translation,
        bound: header.bound,
        vertex_count: header.num_verts,
        vertex_buffer,
        meshes,
    })
}

struct VertexReader<'a, 'b> {
    cursor: &'b ByteCursor<'a>,
    layout: VertexLayout,
    scale: Vec3,
    translation: Vec3,
}

impl VertexReader<'_, '_> {
    fn field(&self, base: usize, at: usize) -> Result<ByteCursor, DecodeError> {
        let mut c = *self.cursor;
        c.seek(base + at)?;
        Ok(c)
    }

    fn read_vertex(
        &self,
        base: usize,
        mesh: &PspMeshHeader,
        strip: &mut TriangleStrip,
    ) -> Result<(), DecodeError> {
        // Reject short vertices before decoding any field.
        self.field(base, 0)?.bytes(self.layout.stride)?;

        if let Some(at) = self.layout.weights {
            let raw = self.field(base, at)?.bytes(self.layout.weight_count)?;
            let mut binding = SkinBinding::default();
            for (j, &w) in raw.iter().take(4).enumerate() {
                binding.weights[j] = w as f32 / 128.0;
                binding.bones[j] = mesh.bone_palette[j] as u16;
            }
            let sum: f32 = binding.weights.iter().sum();
            if sum > 0.0 {
                binding.weights.iter_mut().for_each(|w| *w /= sum);
            }
            strip.skin.push(binding);
        }
        if let Some(at) = self.layout.uv {
            let mut c = self.field(base, at)?;
            let uv = Vec2::new(c.read_u8()? as f32, c.read_u8()? as f32) / 128.0;
            strip.uvs.push(uv * mesh.uv_scale);
        }
        if let Some(at) = self.layout.color {
            strip.colors.push(unpack_5551(self.field(base, at)?.read_u16()?));
        }
        if let Some(at) = self.layout.normal {
            let mut c = self.field(base, at)?;
            let n = [c.read_i8()?, c.read_i8()?, c.read_i8()?];
            strip.normals.push(Vec3::new(n[0] as f32, n[1] as f32, n[2] as f32) / 128.0);
        }
        let mut c = self.field(base, self.layout.position)?;
        let raw = match self.layout.position_format {
            PositionFormat::S8 => {
                Vec3::new(c.read_i8()? as f32, c.read_i8()? as f32, c.read_i8()? as f32) / 128.0
            }
            PositionFormat::S16 => {
                Vec3::new(c.read_i16()? as f32, c.read_i16()? as f32, c.read_i16()? as f32)
                    / 32768.0
            }
        };
        strip.positions.push(raw * self.scale + self.translation);
        Ok(())
    }
}
