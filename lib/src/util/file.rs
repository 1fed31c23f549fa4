use std::{fs::File, path::Path};

use anyhow::{Context, Result};
use memmap2::{Mmap, MmapOptions};

use crate::format::mdl::{self, DecodeOptions, DecodedModel};

/// Opens a memory mapped file.
pub fn map_file<P: AsRef<Path>>(path: P) -> Result<Mmap> {
    let file = File::open(&path)
        .with_context(|| format!("Failed to open file '{}'", path.as_ref().display()))?;
    let map = unsafe { MmapOptions::new().map(&file) }
        .with_context(|| format!("Failed to mmap file: '{}'", path.as_ref().display()))?;
    Ok(map)
}

/// Maps and decodes an MDL file.
pub fn read_model<P: AsRef<Path>>(path: P, options: &DecodeOptions) -> Result<DecodedModel> {
    let data = map_file(&path)?;
    mdl::decode(&data, options)
        .with_context(|| format!("Failed to decode MDL '{}'", path.as_ref().display()))
}
