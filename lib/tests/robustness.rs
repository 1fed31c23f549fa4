use glam::{Vec2, Vec3};
use leedslib::{
    format::{
        error::{DecodeError, WarningKind},
        export::{encode, ExportMaterial, ExportModel, ExportOptions},
        frame::K_DEFAULT_BONE_NAME,
        header::{AtomicRecord, ClumpRecord, RawHeader, K_ATOMIC_LINK_OFFSET, K_ATOMIC_PAD, K_MAGIC_LDM},
        material::{GeometryHeader, MaterialRecord},
        mdl::{decode, DecodeOptions, FrameWalk, Geometry, PartErrorPolicy},
        psp::{PspGeometryHeader, PspMeshHeader, VertexFormat, K_PSP_HEADER_SKIP, K_VERTEX_OFFSET_BIAS},
        ImportVariant, ModelKind, Platform, TopLevelMagic,
    },
    util::cursor::ByteWriter,
};

fn two_part_model() -> Vec<u8> {
    let strip = |material: u16, x: f32| leedslib::format::strip::TriangleStrip {
        material,
        positions: vec![Vec3::new(x, 0.0, 0.0), Vec3::new(x, 1.0, 0.0), Vec3::new(x + 1.0, 0.0, 0.0)],
        uvs: vec![Vec2::ZERO, Vec2::Y, Vec2::X],
        ..Default::default()
    };
    let model = ExportModel {
        materials: vec![ExportMaterial::default(), ExportMaterial::default()],
        strips: vec![strip(0, 0.0), strip(1, 4.0)],
        ..ExportModel::new(ModelKind::Prop)
    };
    encode(&model, &ExportOptions::default()).unwrap()
}

fn part_offsets(data: &[u8]) -> Vec<usize> {
    match decode(data, &DecodeOptions::default()).unwrap().geometry {
        Geometry::Ps2(g) => g.parts.iter().map(|p| p.offset).collect(),
        Geometry::Psp(_) => unreachable!(),
    }
}

#[test]
fn truncated_images_never_panic() {
    let data = two_part_model();
    let options = DecodeOptions { frames: FrameWalk::Always, ..Default::default() };
    for len in (0..data.len()).step_by(3) {
        let _ = decode(&data[..len], &options);
    }
    assert!(decode(&data[..0x40], &options).is_err());
}

#[test]
fn corrupted_bytes_never_panic() {
    let data = two_part_model();
    let skip = DecodeOptions { on_part_error: PartErrorPolicy::SkipRemainingParts, ..Default::default() };
    for at in (0..0x300.min(data.len())).step_by(5) {
        for value in [0x00, 0x7F, 0xFF] {
            let mut bad = data.clone();
            bad[at] = value;
            let _ = decode(&bad, &DecodeOptions::default());
            let _ = decode(&bad, &skip);
        }
    }
}

#[test]
fn failing_part_aborts_or_is_skipped() {
    let mut data = two_part_model();
    let offsets = part_offsets(&data);
    // break the position unpack command of the second part
    data[offsets[1] + 16 + 3] = 0x00;

    let err = decode(&data, &DecodeOptions::default()).unwrap_err();
    assert!(matches!(err, DecodeError::MarkerMismatch { .. }), "{err}");
    assert_eq!(err.offset(), offsets[1] + 16);

    let options = DecodeOptions { on_part_error: PartErrorPolicy::SkipRemainingParts, ..Default::default() };
    let model = decode(&data, &options).unwrap();
    let Geometry::Ps2(geometry) = &model.geometry else { panic!("expected PS2 geometry") };
    assert_eq!(geometry.parts.len(), 1);
    assert_eq!(geometry.warnings.len(), 1);
    assert!(matches!(&geometry.warnings[0].kind, WarningKind::PartsSkipped { first_part: 1, .. }));
    assert_eq!(model.triangle_count(), 1);
}

#[test]
fn warnings_can_be_escalated() {
    let mut data = two_part_model();
    let offsets = part_offsets(&data);
    // count byte disagrees with the flags byte
    data[offsets[0] + 16] = 9;

    let model = decode(&data, &DecodeOptions::default()).unwrap();
    let warnings = model.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].kind, WarningKind::VertexCountMismatch { header: 9, flags: 3 });
    assert_eq!(warnings[0].offset, offsets[0] + 16);

    let strict = DecodeOptions { escalate_warnings: true, ..Default::default() };
    let err = decode(&data, &strict).unwrap_err();
    assert!(matches!(err, DecodeError::Escalated(ref w) if w.offset == offsets[0] + 16));

    // escalation is never swallowed by the skip policy
    let both = DecodeOptions { on_part_error: PartErrorPolicy::SkipRemainingParts, ..strict };
    assert!(matches!(decode(&data, &both), Err(DecodeError::Escalated(_))));
}

/// Hand-assembled PSP prop with one mesh of three 0x114 vertices, optionally
/// behind the clump magic shared with LCS.
fn psp_image(clump: bool) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_bytes(&K_MAGIC_LDM);
    w.write_record(&RawHeader { file_len: 0x140, ..Default::default() }).unwrap();
    w.put_u32(0x24);
    let atomic_at = if clump { 0x34 } else { 0x24 };
    if clump {
        w.write_record(&ClumpRecord {
            magic: TopLevelMagic::Clump.as_u32(),
            frame: 0,
            first_atomic_link: atomic_at + K_ATOMIC_LINK_OFFSET,
            last_atomic_link: atomic_at + K_ATOMIC_LINK_OFFSET,
        })
        .unwrap();
    }
    let magic = if clump { TopLevelMagic::LcsAtomic } else { TopLevelMagic::PspAtomic };
    w.write_record(&AtomicRecord { magic: magic.as_u32(), pad: K_ATOMIC_PAD, geometry: 0x70, ..Default::default() })
        .unwrap();
    w.align(0x70);

    // geometry 0x70: material header, skip, PSP header 0x90, mesh 0xD8, vertices 0x108
    w.write_record(&GeometryHeader { unknown: [0; 3], material_list: 0x130, material_count: 1 }).unwrap();
    w.put_bytes(&[0; K_PSP_HEADER_SKIP]);
    w.write_record(&PspGeometryHeader {
        flags: VertexFormat::ColorPos16.flags(),
        num_meshes: 1,
        scale: Vec3::splat(2.0),
        num_verts: 3,
        vertex_offset: 0x108 - 0x70 + K_VERTEX_OFFSET_BIAS,
        ..Default::default()
    })
    .unwrap();
    w.write_record(&PspMeshHeader { num_triangles: 1, material: 0, uv_scale: Vec2::ONE, ..Default::default() })
        .unwrap();
    assert_eq!(w.position(), 0x108);
    for (x, color) in [(0i16, 0x801Fu16), (0x4000, 0x83E0), (-0x4000, 0xFC00)] {
        w.put_u16(color);
        w.put_i16(x);
        w.put_i16(0);
        w.put_i16(0x2000);
    }
    // material record 0x120, list 0x130, name 0x134
    w.write_record(&MaterialRecord { texture: 0x134, rgba: 0xFFFF_FFFF, reserved: 0, specular: 0 }).unwrap();
    w.put_u32(0x120);
    w.put_bytes(b"psp\0");
    w.align(0x140);
    w.into_inner()
}

#[test]
fn psp_model_decodes_through_the_pointer_graph() {
    let data = psp_image(false);
    let model = decode(&data, &DecodeOptions::default()).unwrap();
    assert_eq!(model.variant, ImportVariant::Psp);
    assert_eq!(model.materials[0].texture, "psp");
    let Geometry::Psp(geometry) = &model.geometry else { panic!("expected PSP geometry") };
    assert_eq!(geometry.format, VertexFormat::ColorPos16);
    let strip = &geometry.meshes[0].strip;
    assert_eq!(strip.triangles(), vec![[0, 1, 2]]);
    assert_eq!(strip.positions[1], Vec3::new(1.0, 0.0, 0.5));
    assert_eq!(strip.colors[0], [255, 0, 0, 255]);
    assert_eq!(strip.colors[2], [0, 0, 255, 255]);
}

#[test]
fn shared_clump_magic_needs_the_platform_hint() {
    let data = psp_image(true);
    // the atomic magic says LCS PS2, so the PSP block only decodes with the hint
    let hinted = DecodeOptions { platform: Some(Platform::Psp), ..Default::default() };
    let model = decode(&data, &hinted).unwrap();
    assert_eq!(model.variant, ImportVariant::Psp);
    assert_eq!(model.strips()[0].len(), 3);
}

#[test]
fn frame_walk_starts_at_the_atomic_frame() {
    let strip = leedslib::format::strip::TriangleStrip {
        positions: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
        ..Default::default()
    };
    let model = ExportModel {
        materials: vec![ExportMaterial::default()],
        strips: vec![strip],
        ..ExportModel::new(ModelKind::Actor)
    };
    let mut data = encode(&model, &ExportOptions::default()).unwrap();
    // clear the clump's frame pointer; the atomic still links the tree
    data[0x28..0x2C].fill(0);
    let decoded = decode(&data, &DecodeOptions::default()).unwrap();
    assert_eq!(decoded.kind, ModelKind::Actor);
    assert_eq!(decoded.graph.clump.as_ref().map(|c| c.frame), Some(0));
    assert_eq!(decoded.frames.len(), 2);
    assert!(decoded.frames.values().all(|f| f.name == K_DEFAULT_BONE_NAME));
    assert_eq!(decoded.frames.get_index(0).unwrap().0, &decoded.graph.atomic.frame);
}
