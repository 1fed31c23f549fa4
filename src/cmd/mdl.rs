use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use argh::FromArgs;
use leedslib::{
    format::{
        export::{self, ExportModel, ExportOptions, PartTableLayout},
        mdl::{DecodeOptions, DecodedModel, FrameWalk, Geometry, PartErrorPolicy},
        strip::K_MAX_BATCH_VERTICES,
        Platform,
    },
    util::file::read_model,
};

#[derive(FromArgs, PartialEq, Debug)]
/// process Leeds MDL files
#[argh(subcommand, name = "mdl")]
pub struct Args {
    #[argh(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommand {
    Info(InfoArgs),
    Dump(DumpArgs),
    Rebuild(RebuildArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// prints a summary of an MDL file
#[argh(subcommand, name = "info")]
pub struct InfoArgs {
    #[argh(positional)]
    /// input MDL
    input: PathBuf,
    #[argh(option, short = 'p')]
    /// platform hint for the shared clump magic (ps2, psp)
    platform: Option<Platform>,
    #[argh(option, default = "FrameWalk::Auto")]
    /// frame walk policy (auto, always, never)
    frames: FrameWalk,
    #[argh(switch)]
    /// keep already decoded parts when a part fails
    skip_bad_parts: bool,
    #[argh(switch)]
    /// treat decode warnings as errors
    strict: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// writes the decoded model as JSON
#[argh(subcommand, name = "dump")]
pub struct DumpArgs {
    #[argh(positional)]
    /// input MDL
    input: PathBuf,
    #[argh(option, short = 'o')]
    /// output JSON (default: input with .json extension)
    output: Option<PathBuf>,
    #[argh(option, short = 'p')]
    /// platform hint for the shared clump magic (ps2, psp)
    platform: Option<Platform>,
    #[argh(option, default = "FrameWalk::Auto")]
    /// frame walk policy (auto, always, never)
    frames: FrameWalk,
    #[argh(switch)]
    /// keep already decoded parts when a part fails
    skip_bad_parts: bool,
    #[argh(switch)]
    /// treat decode warnings as errors
    strict: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// decodes an MDL file and encodes it again as a PS2 model
#[argh(subcommand, name = "rebuild")]
pub struct RebuildArgs {
    #[argh(positional)]
    /// input MDL
    input: PathBuf,
    #[argh(positional)]
    /// output MDL
    output: PathBuf,
    #[argh(option, short = 'p')]
    /// platform hint for the shared clump magic (ps2, psp)
    platform: Option<Platform>,
    #[argh(option, default = "PartTableLayout::Explicit")]
    /// part table layout (explicit, offsets, none)
    table: PartTableLayout,
    #[argh(switch)]
    /// omit normal sub-records
    no_normals: bool,
    #[argh(option, default = "K_MAX_BATCH_VERTICES")]
    /// maximum vertices per strip batch
    max_batch: usize,
    #[argh(switch)]
    /// keep already decoded parts when a part fails
    skip_bad_parts: bool,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Info(c_args) => info(c_args),
        SubCommand::Dump(c_args) => dump(c_args),
        SubCommand::Rebuild(c_args) => rebuild(c_args),
    }
}

fn decode_options(
    platform: Option<Platform>,
    frames: FrameWalk,
    skip_bad_parts: bool,
    strict: bool,
) -> DecodeOptions {
    DecodeOptions {
        platform,
        frames,
        on_part_error: if skip_bad_parts {
            PartErrorPolicy::SkipRemainingParts
        } else {
            PartErrorPolicy::Abort
        },
        escalate_warnings: strict,
        ..Default::default()
    }
}

fn info(args: InfoArgs) -> Result<()> {
    let options = decode_options(args.platform, args.frames, args.skip_bad_parts, args.strict);
    let model = read_model(&args.input, &options)?;
    log_summary(&model);
    Ok(())
}

fn log_summary(model: &DecodedModel) {
    let header = &model.graph.header;
    log::info!("Model info:");
    log::info!("  Variant: {}", model.variant);
    log::info!("  Kind: {}", model.kind);
    log::info!("  File length: 0x{:X}", header.file_len);
    log::info!("  Relocations: {}", header.num_entries);
    log::info!("  Model info id: {}", model.graph.atomic.model_info_id);
    log::info!("  Frames: {}", model.frames.len());
    for frame in model.frames.values() {
        log::info!("    0x{:X} {} (parent {:X?})", frame.offset, frame.name, frame.parent);
    }
    log::info!("  Materials: {}", model.materials.len());
    for (i, material) in model.materials.iter().enumerate() {
        log::info!(
            "    {i}: '{}' rgba 0x{:08X} specular {}",
            material.texture,
            material.rgba,
            material.specular_or_default()
        );
    }
    match &model.geometry {
        Geometry::Ps2(geometry) => {
            log::info!("  PS2 geometry, {:?} part table:", geometry.table);
            for part in &geometry.parts {
                let triangles: usize = part.strips.iter().map(|s| s.triangles().len()).sum();
                log::info!(
                    "    Part {}: material {}, {} strips, {triangles} triangles",
                    part.index,
                    part.material,
                    part.strips.len()
                );
            }
        }
        Geometry::Psp(geometry) => {
            log::info!("  PSP geometry, {:?} vertices:", geometry.format);
            for mesh in &geometry.meshes {
                log::info!(
                    "    Mesh {}: material {}, {} vertices",
                    mesh.index,
                    mesh.material,
                    mesh.strip.len()
                );
            }
        }
    }
    log::info!("  Triangles: {}", model.triangle_count());
    for warning in model.warnings() {
        log::info!("  Warning: {warning}");
    }
}

fn dump(args: DumpArgs) -> Result<()> {
    let options = decode_options(args.platform, args.frames, args.skip_bad_parts, args.strict);
    let model = read_model(&args.input, &options)?;
    let path = args.output.unwrap_or_else(|| args.input.with_extension("json"));
    let mut file = BufWriter::new(
        File::create(&path)
            .with_context(|| format!("Failed to create output file '{}'", path.display()))?,
    );
    log::info!("Writing {}", path.display());
    serde_json::to_writer_pretty(&mut file, &model)?;
    file.flush()?;
    Ok(())
}

fn rebuild(args: RebuildArgs) -> Result<()> {
    let options = decode_options(args.platform, FrameWalk::Never, args.skip_bad_parts, false);
    let model = read_model(&args.input, &options)?;
    if let Geometry::Psp(_) = model.geometry {
        log::info!("PSP input: positions will be requantized for PS2");
    }
    let export = ExportModel::from_decoded(&model);
    let export_options = ExportOptions {
        table: args.table,
        normals: !args.no_normals,
        max_batch_vertices: args.max_batch,
    };
    let data = export::encode(&export, &export_options)
        .with_context(|| format!("Failed to encode '{}'", args.input.display()))?;
    let mut file = BufWriter::new(
        File::create(&args.output)
            .with_context(|| format!("Failed to create output file '{}'", args.output.display()))?,
    );
    log::info!("Writing {} (0x{:X} bytes)", args.output.display(), data.len());
    file.write_all(&data)?;
    file.flush()?;
    Ok(())
}
