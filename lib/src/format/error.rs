use serde_derive::Serialize;
use thiserror::Error;

/// Fatal conditions while decoding an MDL image. Every variant carries the
/// absolute byte offset where decoding stopped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected end of data: need {need} bytes at offset 0x{offset:X}, have {have}")]
    UnexpectedEof { offset: usize, need: usize, have: usize },
    #[error("pointer 0x{pointer:X} read at offset 0x{offset:X} is outside the file (length 0x{len:X})")]
    PointerOutOfRange { offset: usize, pointer: u64, len: usize },
    #[error("bad file magic {found:02X?} at offset 0x0")]
    BadMagic { found: [u8; 4] },
    #[error("unrecognized top-level record magic 0x{magic:08X} at offset 0x{offset:X}")]
    UnknownTopLevel { offset: usize, magic: u32 },
    #[error("unknown PSP vertex format 0x{flags:X} at offset 0x{offset:X}")]
    UnknownVertexFormat { offset: usize, flags: u32 },
    #[error("expected {expected} at offset 0x{offset:X}, found 0x{found:08X}")]
    MarkerMismatch { offset: usize, found: u32, expected: &'static str },
    #[error("unterminated string at offset 0x{offset:X}")]
    UnterminatedString { offset: usize },
    #[error("failed to read {record} at offset 0x{offset:X}: {message}")]
    Record { offset: usize, record: &'static str, message: String },
    #[error("escalated warning: {0}")]
    Escalated(DecodeWarning),
}

impl DecodeError {
    /// Absolute byte offset the error refers to.
    pub fn offset(&self) -> usize {
        match self {
            DecodeError::UnexpectedEof { offset, .. }
            | DecodeError::PointerOutOfRange { offset, .. }
            | DecodeError::UnknownTopLevel { offset, .. }
            | DecodeError::UnknownVertexFormat { offset, .. }
            | DecodeError::MarkerMismatch { offset, .. }
            | DecodeError::UnterminatedString { offset }
            | DecodeError::Record { offset, .. } => *offset,
            DecodeError::BadMagic { .. } => 0,
            DecodeError::Escalated(warning) => warning.offset,
        }
    }
}

/// A locally recovered inconsistency. Attached to the part it affects.
#[derive(Clone, Debug, PartialEq, Serialize, Error)]
#[error("{kind} (offset 0x{offset:X})")]
pub struct DecodeWarning {
    pub offset: usize,
    pub kind: WarningKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Error)]
pub enum WarningKind {
    #[error("strip has {vertices} vertices but {entries} skin entries; padded with empty bindings")]
    SkinCountMismatch { vertices: usize, entries: usize },
    #[error("strip has {vertices} vertices but {entries} {attribute} entries")]
    AttributeCountMismatch { attribute: &'static str, vertices: usize, entries: usize },
    #[error("UV header found by forward scan 0x{distance:X} bytes past its expected position")]
    UvMarkerDisplaced { distance: usize },
    #[error("position header count byte {header} disagrees with flags count {flags}")]
    VertexCountMismatch { header: u8, flags: u8 },
    #[error("split section counts disagree: {first} / {second} / {flags}")]
    SplitCountMismatch { first: u8, second: u8, flags: u16 },
    #[error("no strip marker found in part")]
    EmptyPart,
    #[error("strips overflow the last material window (material {material})")]
    MaterialWindowExhausted { material: u16 },
    #[error("parts from {first_part} on were skipped: {error}")]
    PartsSkipped { first_part: usize, error: String },
}

/// Collects warnings for one decode scope, or turns the first one into an
/// error when escalation is requested.
#[derive(Debug, Default)]
pub(crate) struct WarningSink {
    escalate: bool,
    warnings: Vec<DecodeWarning>,
}

impl WarningSink {
    pub fn new(escalate: bool) -> Self { Self { escalate, warnings: Vec::new() } }

    pub fn warn(&mut self, offset: usize, kind: WarningKind) -> Result<(), DecodeError> {
        let warning = DecodeWarning { offset, kind };
        if self.escalate {
            return Err(DecodeError::Escalated(warning));
        }
        log::warn!("{warning}");
        self.warnings.push(warning);
        Ok(())
    }

    pub fn into_inner(self) -> Vec<DecodeWarning> { self.warnings }
}

/// Invalid input handed to the encoder.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("model has no materials")]
    NoMaterials,
    #[error("model has no strips")]
    NoGeometry,
    #[error("strip {strip} references material {material}, but only {count} exist")]
    MaterialOutOfRange { strip: usize, material: u16, count: usize },
    #[error("strip {strip} has {len} vertices; at least 3 are required")]
    StripTooShort { strip: usize, len: usize },
    #[error("strip {strip} has {len} {attribute} entries for {vertices} vertices")]
    AttributeMismatch { strip: usize, attribute: &'static str, len: usize, vertices: usize },
    #[error("geometry cannot be described by this part table layout: {reason}")]
    UnrepresentableLayout { reason: String },
    #[error("failed to write {record}: {message}")]
    Record { record: &'static str, message: String },
}
