use binrw::binrw;
use serde_derive::Serialize;

use crate::{format::error::DecodeError, util::cursor::ByteCursor};

/// Leading words of every geometry block, PS2 and PSP alike.
#[binrw]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeometryHeader {
    pub unknown: [u32; 3],
    pub material_list: u32,
    pub material_count: u32,
}

#[binrw]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaterialRecord {
    pub texture: u32,
    pub rgba: u32,
    pub reserved: u32,
    pub specular: u32,
}

#[binrw]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpecularRecord {
    pub reserved: [u32; 2],
    pub specular: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MaterialDescriptor {
    /// Location of the material record.
    pub offset: u32,
    pub texture: String,
    pub rgba: u32,
    pub specular: Option<f32>,
}

impl MaterialDescriptor {
    pub fn specular_or_default(&self) -> f32 { self.specular.unwrap_or(0.0) }
}

/// Resolves `count` indirect material entries starting at `list`.
pub fn read(data: &[u8], list: u32, count: u32) -> Result<Vec<MaterialDescriptor>, DecodeError> {
    let cursor = ByteCursor::new(data);
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut entries = cursor.at(list)?;
    let need = count as usize * 4;
    if need > entries.remaining() {
        return Err(DecodeError::UnexpectedEof {
            offset: list as usize,
            need,
            have: entries.remaining(),
        });
    }

    let mut materials = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = entries.read_u32()?;
        let mut record_cursor = entries.at(offset)?;
        let record: MaterialRecord = record_cursor.read_record()?;
        let texture = cursor.cstr_at(record.texture)?.unwrap_or_default();
        let specular = match record.specular {
            0 => None,
            ptr => {
                let mut spec_cursor = record_cursor.at(ptr)?;
                Some(spec_cursor.read_record::<SpecularRecord>()?.specular)
            }
        };
        log::debug!(
            "Material 0x{offset:X}: texture '{texture}', rgba 0x{:08X}, specular {specular:?}",
            record.rgba
        );
        materials.push(MaterialDescriptor { offset, texture, rgba: record.rgba, specular });
    }
    Ok(materials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::cursor::ByteWriter;

    #[test]
    fn resolves_names_and_optional_specular() {
        let mut w = ByteWriter::new();
        // list at 0, records at 0x8 and 0x18, specular at 0x28, names at 0x34
        w.put_u32(0x08);
        w.put_u32(0x18);
        for (tex, rgba, spec) in [(0x34, 0xFF80_4020, 0x28), (0, 0xFFFF_FFFF, 0)] {
            w.write_record(&MaterialRecord { texture: tex, rgba, reserved: 0, specular: spec })
                .unwrap();
        }
        w.write_record(&SpecularRecord { reserved: [0; 2], specular: 0.5 }).unwrap();
        w.put_bytes(b"wall01\0");
        let data = w.into_inner();

        let mats = read(&data, 0, 2).unwrap();
        assert_eq!(mats.len(), 2);
        assert_eq!(mats[0].texture, "wall01");
        assert_eq!(mats[0].specular, Some(0.5));
        assert_eq!(mats[1].texture, "");
        assert_eq!(mats[1].specular_or_default(), 0.0);
        assert_eq!(mats[1].offset, 0x18);
    }

    #[test]
    fn count_past_end_is_fatal() {
        let data = [0u8; 16];
        let err = read(&data, 8, 10).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEof { offset: 8, need: 40, have: 8 }));
    }
}
