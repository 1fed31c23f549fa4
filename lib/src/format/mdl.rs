use indexmap::IndexMap;
use serde_derive::Serialize;
use strum::{Display, EnumString};

pub use crate::format::ps2::ScanLimits;
use crate::{
    format::{
        error::{DecodeError, DecodeWarning},
        frame::{self, BoneFrame},
        header::{self, PointerGraph},
        material::{self, GeometryHeader, MaterialDescriptor},
        ps2::{self, Ps2Geometry},
        psp::{self, PspGeometry},
        strip::TriangleStrip,
        ImportVariant, ModelKind, Platform,
    },
    util::cursor::ByteCursor,
};

/// When to walk the frame tree.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FrameWalk {
    /// Actors only
    #[default]
    Auto,
    Always,
    Never,
}

/// What to do when one PS2 part fails to decode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PartErrorPolicy {
    #[default]
    Abort,
    /// Keep the parts decoded so far and record a model-level warning.
    SkipRemainingParts,
}

#[derive(Clone, Debug, Default)]
pub struct DecodeOptions {
    /// Settles the clump magic shared by LCS PS2 and PSP files.
    pub platform: Option<Platform>,
    pub frames: FrameWalk,
    pub on_part_error: PartErrorPolicy,
    /// Turn the first recorded warning into a fatal error.
    pub escalate_warnings: bool,
    pub limits: ScanLimits,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Geometry {
    Ps2(Ps2Geometry),
    Psp(PspGeometry),
}

#[derive(Clone, Debug, Serialize)]
pub struct DecodedModel {
    pub graph: PointerGraph,
    pub variant: ImportVariant,
    pub kind: ModelKind,
    pub frames: IndexMap<u32, BoneFrame>,
    pub materials: Vec<MaterialDescriptor>,
    pub geometry: Geometry,
}

impl DecodedModel {
    /// Every decoded strip in file order.
    pub fn strips(&self) -> Vec<&TriangleStrip> {
        match &self.geometry {
            Geometry::Ps2(g) => g.parts.iter().flat_map(|p| p.strips.iter()).collect(),
            Geometry::Psp(g) => g.meshes.iter().map(|m| &m.strip).collect(),
        }
    }

    /// Model-level warnings followed by each part's.
    pub fn warnings(&self) -> Vec<&DecodeWarning> {
        match &self.geometry {
            Geometry::Ps2(g) => {
                g.warnings.iter().chain(g.parts.iter().flat_map(|p| p.warnings.iter())).collect()
            }
            Geometry::Psp(_) => Vec::new(),
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.strips().iter().map(|s| s.len().saturating_sub(2)).sum()
    }
}

/// Decodes a complete MDL image.
pub fn decode(data: &[u8], options: &DecodeOptions) -> Result<DecodedModel, DecodeError> {
    let graph = header::parse(data, options.platform)?;

    let walk_frames = match options.frames {
        FrameWalk::Auto => graph.kind == ModelKind::Actor,
        FrameWalk::Always => true,
        FrameWalk::Never => false,
    };
    // The atomic's own frame is the root; the clump's is only a fallback.
    let root = match (graph.atomic.frame, &graph.clump) {
        (0, Some(clump)) => clump.frame,
        (frame, _) => frame,
    };
    let frames = if walk_frames && root != 0 {
        frame::walk(data, root, graph.variant)?
    } else {
        IndexMap::new()
    };

    let geometry_ptr = graph.atomic.geometry;
    let geometry_header: GeometryHeader = ByteCursor::new(data).at(geometry_ptr)?.read_record()?;
    let materials =
        material::read(data, geometry_header.material_list, geometry_header.material_count)?;

    let geometry = match graph.variant.platform() {
        Platform::Ps2 => Geometry::Ps2(ps2::decode(data, geometry_ptr, &graph.header, options)?),
        Platform::Psp => Geometry::Psp(psp::decode(data, geometry_ptr)?),
    };

    Ok(DecodedModel {
        variant: graph.variant,
        kind: graph.kind,
        graph,
        frames,
        materials,
        geometry,
    })
}
