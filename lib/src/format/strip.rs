use glam::{Vec2, Vec3};
use serde_derive::Serialize;

// Most vertices a single hardware batch may carry
pub const K_MAX_BATCH_VERTICES: usize = 70;
// Vertices repeated at the start of a continuation batch
pub const K_STITCH_OVERLAP: usize = 2;

/// Four bone indices and their weights.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct SkinBinding {
    pub bones: [u16; 4],
    pub weights: [f32; 4],
}

/// An ordered triangle strip. Optional attributes are either empty or hold
/// exactly one entry per position.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TriangleStrip {
    /// Material index, assigned once the whole part has been decoded.
    pub material: u16,
    pub culling_disabled: bool,
    pub positions: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub normals: Vec<Vec3>,
    pub colors: Vec<[u8; 4]>,
    pub skin: Vec<SkinBinding>,
}

impl TriangleStrip {
    #[inline]
    pub fn len(&self) -> usize { self.positions.len() }

    #[inline]
    pub fn is_empty(&self) -> bool { self.positions.is_empty() }

    /// Triangles as vertex indices into this strip, `len - 2` of them.
    pub fn triangles(&self) -> Vec<[u32; 3]> {
        strip_triangles(self.len()).map(|t| t.map(|i| i as u32)).collect()
    }

    /// Copies the vertices at `indices` into a new strip with the same tags.
    fn select(&self, indices: &[usize]) -> Self {
        fn pick<T: Copy>(src: &[T], indices: &[usize]) -> Vec<T> {
            if src.is_empty() {
                return Vec::new();
            }
            indices.iter().map(|&i| src[i]).collect()
        }
        Self {
            material: self.material,
            culling_disabled: self.culling_disabled,
            positions: pick(&self.positions, indices),
            uvs: pick(&self.uvs, indices),
            normals: pick(&self.normals, indices),
            colors: pick(&self.colors, indices),
            skin: pick(&self.skin, indices),
        }
    }

    fn append_from(&mut self, other: &TriangleStrip, skip: usize) {
        self.positions.extend_from_slice(&other.positions[skip..]);
        if !other.uvs.is_empty() {
            self.uvs.extend_from_slice(&other.uvs[skip..]);
        }
        if !other.normals.is_empty() {
            self.normals.extend_from_slice(&other.normals[skip..]);
        }
        if !other.colors.is_empty() {
            self.colors.extend_from_slice(&other.colors[skip..]);
        }
        if !other.skin.is_empty() {
            self.skin.extend_from_slice(&other.skin[skip..]);
        }
    }

    fn same_vertex(&self, i: usize, other: &TriangleStrip, j: usize) -> bool {
        self.positions[i] == other.positions[j]
            && self.uvs.get(i).copied() == other.uvs.get(j).copied()
    }
}

/// Triangle `i` of a strip, for `i` in `2..len`, alternating winding.
pub fn strip_triangles(len: usize) -> impl Iterator<Item = [usize; 3]> {
    (2..len.max(2)).map(|i| if i % 2 == 0 { [i - 2, i - 1, i] } else { [i - 1, i - 2, i] })
}

/// Splits a strip into batches of at most `max_vertices`.
///
/// Each continuation batch starts with the last two vertices already emitted.
/// When that bridge starts on an odd index the first bridge vertex is doubled so
/// every batch keeps the winding of the original strip.
pub fn split_strip(strip: &TriangleStrip, max_vertices: usize) -> Vec<TriangleStrip> {
    let max_vertices = max_vertices.clamp(4, K_MAX_BATCH_VERTICES);
    let n = strip.len();
    if n <= max_vertices {
        return vec![strip.clone()];
    }
    let mut batches = Vec::new();
    let mut cursor = max_vertices;
    batches.push(strip.select(&(0..cursor).collect::<Vec<_>>()));
    while cursor < n {
        let bridge = cursor - K_STITCH_OVERLAP;
        let mut indices = Vec::with_capacity(max_vertices);
        if bridge % 2 == 1 {
            indices.push(bridge);
        }
        indices.extend(bridge..cursor);
        let take = (max_vertices - indices.len()).min(n - cursor);
        indices.extend(cursor..cursor + take);
        batches.push(strip.select(&indices));
        cursor += take;
    }
    batches
}

/// Joins consecutive batches that continue one another back into logical strips.
pub fn stitch_strips(batches: &[TriangleStrip]) -> Vec<TriangleStrip> {
    let mut out: Vec<TriangleStrip> = Vec::new();
    for batch in batches {
        let skip = out.last().and_then(|prev| continuation_skip(prev, batch));
        match (out.last_mut(), skip) {
            (Some(prev), Some(skip)) => prev.append_from(batch, skip),
            _ => out.push(batch.clone()),
        }
    }
    out
}

fn continuation_skip(prev: &TriangleStrip, next: &TriangleStrip) -> Option<usize> {
    if prev.material != next.material || prev.len() < 2 {
        return None;
    }
    let (a, b) = (prev.len() - 2, prev.len() - 1);
    // An odd length means the bridge vertex was doubled.
    if prev.len() % 2 == 1
        && next.len() > 3
        && next.same_vertex(0, prev, a)
        && next.same_vertex(1, prev, a)
        && next.same_vertex(2, prev, b)
    {
        return Some(3);
    }
    if prev.len() % 2 == 0
        && next.len() > 2
        && next.same_vertex(0, prev, a)
        && next.same_vertex(1, prev, b)
    {
        return Some(2);
    }
    None
}
