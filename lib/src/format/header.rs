use binrw::binrw;
use serde_derive::Serialize;

use crate::{
    format::{
        error::DecodeError, ImportVariant, ModelKind, Platform, RecordKind, TopLevelMagic,
    },
    util::cursor::ByteCursor,
};

// File magic
pub const K_MAGIC_LDM: [u8; 4] = *b"ldm\0";
// Offset of the word that is either the top-level pointer or a reserved word
pub const K_TOP_LEVEL_SLOT: usize = 0x20;
// Distance from an atomic record to its clump link field
pub const K_ATOMIC_LINK_OFFSET: u32 = 0x1C;
// Filler stored in every atomic record
pub const K_ATOMIC_PAD: u32 = 0xAAAA_AAAA;

/// The fixed header words following the magic.
#[binrw]
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RawHeader {
    pub shrink: u32,
    pub file_len: u32,
    pub local_table: u32,
    pub global_table: u32,
    pub num_entries: u32,
    pub ptr_before_textures: u32,
    pub allocated_memory: u32,
    /// Render-flags word preceding the top-level pointer, when present.
    #[brw(ignore)]
    pub reserved: Option<u32>,
    #[brw(ignore)]
    pub top_level: u32,
}

impl RawHeader {
    /// Actor files keep their global relocation table right after the local one.
    pub fn is_actor(&self) -> bool { self.global_table == self.local_table.wrapping_add(4) }

    pub fn kind(&self) -> ModelKind {
        if self.is_actor() {
            ModelKind::Actor
        } else {
            ModelKind::Prop
        }
    }
}

#[binrw]
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClumpRecord {
    pub magic: u32,
    pub frame: u32,
    pub first_atomic_link: u32,
    pub last_atomic_link: u32,
}

#[binrw]
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AtomicRecord {
    pub magic: u32,
    pub frame: u32,
    pub frame_link: [u32; 2],
    pub pad: u32,
    pub geometry: u32,
    pub reserved: u32,
    pub clump: u32,
    pub link: u32,
    pub render_callback: u32,
    pub model_info_id: i16,
    pub visibility: u16,
    pub hierarchy: u32,
}

/// Result of following the header into the top-level record.
#[derive(Clone, Debug, Serialize)]
pub struct PointerGraph {
    pub header: RawHeader,
    pub record_kind: RecordKind,
    pub clump: Option<ClumpRecord>,
    pub atomic_offset: u32,
    pub atomic: AtomicRecord,
    pub variant: ImportVariant,
    pub kind: ModelKind,
}

/// Parses the header and resolves the top-level clump or atomic record.
///
/// `platform` only matters for the clump magic shared by LCS PS2 and PSP;
/// everywhere else the record magic decides.
pub fn parse(data: &[u8], platform: Option<Platform>) -> Result<PointerGraph, DecodeError> {
    let mut cursor = ByteCursor::new(data);
    let magic = cursor.bytes(4)?;
    if magic != K_MAGIC_LDM {
        let mut found = [0u8; 4];
        found.copy_from_slice(magic);
        return Err(DecodeError::BadMagic { found });
    }
    let mut header: RawHeader = cursor.read_record()?;

    let slot = cursor.read_u32()?;
    if points_at_top_level(&cursor, &header, slot) {
        header.top_level = slot;
    } else {
        header.reserved = Some(slot);
        header.top_level = cursor.read_u32()?;
    }
    let slot_offset = cursor.position() - 4;
    log::debug!(
        "MDL header: len 0x{:X}, local 0x{:X}, global 0x{:X}, entries {}, top-level 0x{:X}",
        header.file_len,
        header.local_table,
        header.global_table,
        header.num_entries,
        header.top_level
    );
    if header.top_level >= header.file_len {
        return Err(DecodeError::PointerOutOfRange {
            offset: slot_offset,
            pointer: header.top_level as u64,
            len: header.file_len as usize,
        });
    }

    let mut top = cursor.at(header.top_level)?;
    let top_magic = top.peek_u32()?;
    let Some(top_kind) = TopLevelMagic::from_u32(top_magic) else {
        return Err(DecodeError::UnknownTopLevel {
            offset: header.top_level as usize,
            magic: top_magic,
        });
    };

    let (clump, atomic_offset) = match top_kind.kind() {
        RecordKind::Clump => {
            let clump: ClumpRecord = top.read_record()?;
            let Some(atomic_offset) = clump.first_atomic_link.checked_sub(K_ATOMIC_LINK_OFFSET)
            else {
                return Err(DecodeError::PointerOutOfRange {
                    offset: header.top_level as usize + 8,
                    pointer: clump.first_atomic_link as u64,
                    len: data.len(),
                });
            };
            log::debug!("Clump at 0x{:X}, atomic at 0x{atomic_offset:X}", header.top_level);
            (Some(clump), atomic_offset)
        }
        RecordKind::Atomic => (None, header.top_level),
    };

    let mut atomic_cursor = top.at(atomic_offset)?;
    let atomic: AtomicRecord = atomic_cursor.read_record()?;
    let atomic_magic = match TopLevelMagic::from_u32(atomic.magic) {
        Some(m) if m.kind() == RecordKind::Atomic => m,
        _ => {
            return Err(DecodeError::UnknownTopLevel {
                offset: atomic_offset as usize,
                magic: atomic.magic,
            })
        }
    };
    let variant = resolve_variant(top_kind, atomic_magic, platform);
    let kind = header.kind();
    log::debug!(
        "Atomic 0x{atomic_offset:X}: {variant} {kind}, frame 0x{:X}, geometry 0x{:X}, model info {}",
        atomic.frame,
        atomic.geometry,
        atomic.model_info_id
    );

    Ok(PointerGraph {
        header,
        record_kind: top_kind.kind(),
        clump,
        atomic_offset,
        atomic,
        variant,
        kind,
    })
}

fn points_at_top_level(cursor: &ByteCursor, header: &RawHeader, value: u32) -> bool {
    if value == 0 || value >= header.file_len {
        return false;
    }
    cursor
        .u32_at(value as usize)
        .ok()
        .and_then(TopLevelMagic::from_u32)
        .is_some()
}

fn resolve_variant(
    top: TopLevelMagic,
    atomic: TopLevelMagic,
    platform: Option<Platform>,
) -> ImportVariant {
    // The atomic magic is authoritative; the hint only settles the shared clump value.
    let from_atomic = atomic.variant().unwrap_or(ImportVariant::LcsPs2);
    if top == TopLevelMagic::Clump && platform == Some(Platform::Psp) {
        return ImportVariant::Psp;
    }
    from_atomic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::cursor::ByteWriter;

    fn header_words(w: &mut ByteWriter, file_len: u32, local: u32, global: u32) {
        w.put_bytes(&K_MAGIC_LDM);
        for word in [0, file_len, local, global, 0, 0, 0x10000] {
            w.put_u32(word);
        }
    }

    fn atomic(w: &mut ByteWriter, magic: u32) {
        w.write_record(&AtomicRecord {
            magic,
            pad: K_ATOMIC_PAD,
            model_info_id: -3,
            ..Default::default()
        })
        .unwrap();
    }

    #[test]
    fn top_level_pointer_in_reserved_slot() {
        let mut w = ByteWriter::new();
        header_words(&mut w, 0x60, 0x50, 0x54);
        w.put_u32(0x24);
        atomic(&mut w, TopLevelMagic::VcsAtomic.as_u32());
        w.align(0x60);
        let graph = parse(&w.into_inner(), None).unwrap();
        assert_eq!(graph.header.top_level, 0x24);
        assert_eq!(graph.header.reserved, None);
        assert_eq!(graph.variant, ImportVariant::VcsPs2);
        assert_eq!(graph.kind, ModelKind::Actor);
        assert_eq!(graph.atomic.model_info_id, -3);
    }

    #[test]
    fn render_flags_word_before_top_level() {
        let mut w = ByteWriter::new();
        header_words(&mut w, 0x80, 0x70, 0x10);
        w.put_u32(0x40);
        w.put_u32(0x30);
        w.align(0x30);
        atomic(&mut w, TopLevelMagic::LcsAtomicAlt.as_u32());
        w.align(0x80);
        let graph = parse(&w.into_inner(), None).unwrap();
        assert_eq!(graph.header.reserved, Some(0x40));
        assert_eq!(graph.atomic_offset, 0x30);
        assert_eq!(graph.variant, ImportVariant::LcsPs2);
        assert_eq!(graph.kind, ModelKind::Prop);
    }

    #[test]
    fn shared_clump_magic_follows_platform_hint() {
        let mut w = ByteWriter::new();
        header_words(&mut w, 0x80, 0x70, 0x74);
        w.put_u32(0x24);
        w.write_record(&ClumpRecord {
            magic: TopLevelMagic::Clump.as_u32(),
            frame: 0,
            first_atomic_link: 0x34 + K_ATOMIC_LINK_OFFSET,
            last_atomic_link: 0x34 + K_ATOMIC_LINK_OFFSET,
        })
        .unwrap();
        atomic(&mut w, TopLevelMagic::LcsAtomic.as_u32());
        w.align(0x80);
        let data = w.into_inner();
        assert_eq!(parse(&data, None).unwrap().variant, ImportVariant::LcsPs2);
        let psp = parse(&data, Some(Platform::Psp)).unwrap();
        assert_eq!(psp.variant, ImportVariant::Psp);
        assert_eq!(psp.record_kind, RecordKind::Clump);
        assert_eq!(psp.atomic_offset, 0x34);
    }

    #[test]
    fn top_level_beyond_declared_length_is_fatal() {
        let mut w = ByteWriter::new();
        header_words(&mut w, 0x28, 0, 0);
        w.put_u32(0);
        w.put_u32(0x1000);
        let err = parse(&w.into_inner(), None).unwrap_err();
        assert!(matches!(err, DecodeError::PointerOutOfRange { pointer: 0x1000, .. }), "{err}");
        assert_eq!(err.offset(), 0x24);
    }

    #[test]
    fn unknown_top_level_magic_is_fatal() {
        let mut w = ByteWriter::new();
        header_words(&mut w, 0x40, 0, 0);
        w.put_u32(0);
        w.put_u32(0x28);
        w.put_u32(0xDEAD_BEEF);
        w.align(0x40);
        let err = parse(&w.into_inner(), None).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownTopLevel { offset: 0x28, magic: 0xDEAD_BEEF }));
    }

    #[test]
    fn wrong_file_magic() {
        let err = parse(b"mdl\0\0\0\0\0", None).unwrap_err();
        assert!(matches!(err, DecodeError::BadMagic { found } if &found == b"mdl\0"));
    }
}
