//! Asset adapters: the seams where minification and image conversion
//! plug in.
//!
//! The core only needs two capabilities from the outside world — "make
//! this css/js smaller" and "turn these image bytes into those image
//! bytes" — so both are traits with conservative built-in
//! implementations. Swapping in a real transcoder touches nothing else.

use crate::markup::ImageSettings;
use anyhow::{Context as _, Result};
use std::fs;
use std::path::Path;

/// Source bytes + settings to output bytes.
pub trait ImagePipeline: Send + Sync {
    fn process(&self, source: &[u8], settings: &ImageSettings) -> Result<Vec<u8>>;
}

/// Copies bytes through untouched; the conversion request is honoured in
/// name (output path and extension) but not in pixels.
pub struct PassthroughImages;

impl ImagePipeline for PassthroughImages {
    fn process(&self, source: &[u8], _settings: &ImageSettings) -> Result<Vec<u8>> {
        Ok(source.to_vec())
    }
}

/// CSS/JS text to smaller CSS/JS text.
pub trait Minifier: Send + Sync {
    fn minify(&self, input: &str) -> String;
}

/// Whitespace-only minification: drops blank lines and trailing spaces,
/// which is always safe and usually most of the win for hand-written
/// files.
pub struct LineFolding;

impl Minifier for LineFolding {
    fn minify(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        for line in input.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Copy a file to its output location, minifying on the way through.
pub fn copy_minified(minifier: &dyn Minifier, source: &Path, output: &Path) -> Result<()> {
    let text = fs::read_to_string(source)
        .with_context(|| format!("failed to read {}", source.display()))?;
    write_output(output, minifier.minify(&text).as_bytes())
}

pub fn copy_file(source: &Path, output: &Path) -> Result<()> {
    ensure_parent(output)?;
    fs::copy(source, output)
        .with_context(|| format!("failed to copy {}", source.display()))?;
    Ok(())
}

/// Run an image through the pipeline and write the result.
pub fn convert_image(
    pipeline: &dyn ImagePipeline,
    source: &Path,
    output: &Path,
    settings: &ImageSettings,
) -> Result<()> {
    let bytes =
        fs::read(source).with_context(|| format!("failed to read {}", source.display()))?;
    let converted = pipeline.process(&bytes, settings)?;
    write_output(output, &converted)
}

pub fn write_output(output: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(output)?;
    fs::write(output, bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}
