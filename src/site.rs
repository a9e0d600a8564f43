//! Shared build context: configuration, the file tree, support-file
//! indexes and the mutable per-build state.
//!
//! `Context` is immutable once loaded (the dev server rebuilds it behind a
//! write lock when sources change); `BuildState` collects everything a
//! render pass mutates — diagnostics, caches and the generated-output
//! queues — so request handlers can each own one.

use crate::config::{self, Config};
use crate::errors::Diagnostics;
use crate::finder::FinderCache;
use crate::hash::{PLATE_HASH, new_hash};
use crate::markup::{Ast, ImageSettings, parse_document};
use crate::scope::{Frame, harvest};
use crate::text::make_element_id;
use crate::tree::{FileTree, NodeId};
use anyhow::{Context as _, Result};
use rustc_hash::FxHashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A parsed support document (template, partial or plate).
#[derive(Debug)]
pub struct Document {
    pub name: String,
    pub ast: Vec<Ast>,
    pub scope: Frame,
}

/// A parsed page plus its harvested top-level scope.
#[derive(Debug, Clone)]
pub struct Page {
    pub node: NodeId,
    pub file: Arc<str>,
    pub ast: Arc<Vec<Ast>>,
    pub scope: Arc<Frame>,
    /// Active tag during a taginator pass.
    pub tag: Option<String>,
}

/// A queued taginator output page.
#[derive(Debug, Clone)]
pub struct GenPage {
    pub node: NodeId,
    pub tag: String,
    /// Site-rooted URL of the generated page.
    pub url: String,
    /// Output path relative to the output directory.
    pub output_rel: String,
}

/// A queued image conversion.
#[derive(Debug, Clone)]
pub struct GenImage {
    pub node: NodeId,
    pub settings: ImageSettings,
    /// Output path relative to the output directory.
    pub output_rel: String,
}

/// Opt-in call site for `$ name args` lines; the core never runs user
/// code itself.
pub trait ScriptEngine: Send + Sync {
    fn run(&self, name: &str, args: &str) -> Option<String>;
}

pub struct Context {
    pub config: Config,
    pub rewrites: Vec<(regex::Regex, String)>,
    pub project_root: PathBuf,
    pub output_dir: PathBuf,
    pub server_mode: bool,
    pub build_drafts: bool,
    pub skip_images: bool,
    pub only_used: bool,
    pub tree: FileTree,
    pub templates: FxHashMap<u32, Arc<Document>>,
    pub partials: FxHashMap<u32, Arc<Document>>,
    /// Declarations from `config/spindle.x`, the bottom scope frame.
    pub globals: Frame,
    pub scripts: Option<Box<dyn ScriptEngine>>,
}

impl Context {
    /// Load the tree and all support documents. Parse problems in support
    /// files land in `errors` like any other diagnostic.
    pub fn load(
        project_root: &Path,
        config: Config,
        output_dir: Option<&str>,
        errors: &mut Diagnostics,
    ) -> Result<Self> {
        let rewrites = config.compile_rewrites()?;
        let tree = FileTree::load(project_root, &config)?;

        let templates = load_support_directory(project_root, config::TEMPLATE_DIR, errors);
        let partials = load_support_directory(project_root, config::PARTIAL_DIR, errors);
        let globals = load_globals(project_root, errors);

        let output_dir = project_root.join(output_dir.unwrap_or(&config.output));

        Ok(Self {
            config,
            rewrites,
            project_root: project_root.to_owned(),
            output_dir,
            server_mode: false,
            build_drafts: false,
            skip_images: false,
            only_used: false,
            tree,
            templates,
            partials,
            globals,
            scripts: None,
        })
    }

    /// Re-read the file tree in place; the dev server calls this under
    /// its write barrier.
    pub fn reload_tree(&mut self) -> Result<()> {
        self.tree = FileTree::load(&self.project_root, &self.config)?;
        Ok(())
    }

    pub fn reload_support(&mut self, errors: &mut Diagnostics) {
        self.templates = load_support_directory(&self.project_root, config::TEMPLATE_DIR, errors);
        self.partials = load_support_directory(&self.project_root, config::PARTIAL_DIR, errors);
        self.globals = load_globals(&self.project_root, errors);
    }

    /// Parse a markup node into a page.
    pub fn load_page(&self, node: NodeId, errors: &mut Diagnostics) -> Option<Page> {
        let path = self.tree.real_path(node);
        let source = fs::read_to_string(&path).ok()?;
        let file: Arc<str> = Arc::from(self.tree.node(node).path.as_str());

        let ast = parse_document(&source, &file, false, errors);
        let scope = harvest(&ast);

        Some(Page {
            node,
            file,
            ast: Arc::new(ast),
            scope: Arc::new(scope),
            tag: None,
        })
    }

    // ------------------------------------------------------------------
    // output-path and URL policy
    // ------------------------------------------------------------------

    /// Output path for a node, relative to the output directory: the
    /// source-relative path with the extension swapped.
    pub fn output_rel(&self, node: NodeId) -> String {
        let rel = self.tree.source_relative(node);
        match self.tree.node(node).file_type.output_extension() {
            Some(ext) => match rel.rfind('.') {
                Some(dot) => format!("{}.{}", &rel[..dot], ext),
                None => format!("{rel}.{ext}"),
            },
            None => rel.to_owned(),
        }
    }

    pub fn output_path(&self, node: NodeId) -> PathBuf {
        self.output_dir.join(self.output_rel(node))
    }

    /// Pretty site-rooted URL for a page node: extension dropped,
    /// trailing `index` collapsed to its directory.
    pub fn page_url(&self, node: NodeId) -> String {
        let rel = self.tree.source_relative(node);

        if !self.tree.node(node).file_type.is_page_like() {
            return format!("/{rel}");
        }

        let stem = match rel.rfind('.') {
            Some(dot) => &rel[..dot],
            None => rel,
        };

        // only a whole `index` segment collapses to its directory
        let collapsed = if stem == "index" {
            ""
        } else {
            stem.strip_suffix("/index").unwrap_or(stem)
        };

        format!("/{collapsed}")
    }

    /// Insert the tag segments ahead of the trailing file name:
    /// `index.html` + `rust` → `tag/rust/index.html`.
    pub fn tag_output_rel(&self, node: NodeId, tag: &str) -> String {
        let base = self.output_rel(node);
        let slug = make_element_id(tag);

        match base.rfind('/') {
            Some(split) => format!(
                "{}/{}/{}/{}",
                &base[..split],
                self.config.tag_path,
                slug,
                &base[split + 1..]
            ),
            None => format!("{}/{}/{}", self.config.tag_path, slug, base),
        }
    }

    pub fn tag_url(&self, node: NodeId, tag: &str) -> String {
        let base = self.page_url(node);
        let slug = make_element_id(tag);
        let dir = base.trim_end_matches('/');
        format!("{}/{}/{}", dir, self.config.tag_path, slug)
    }
}

/// Everything one build (or one dev-server render) mutates.
#[derive(Default)]
pub struct BuildState {
    pub errors: Diagnostics,
    pub finder_cache: FinderCache,
    pub plates: FxHashMap<u32, PlateSlot>,
    /// Queued taginator pages, keyed by URL.
    pub gen_pages: FxHashMap<String, GenPage>,
    /// Queued image conversions, keyed by a fingerprint of node and
    /// settings.
    pub gen_images: FxHashMap<u32, GenImage>,
}

impl BuildState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Plate resolution states; `InProgress` is the cycle tripwire.
#[derive(Debug, Clone)]
pub enum PlateSlot {
    InProgress,
    Ready(Arc<Frame>),
    Missing,
}

/// Resolve a plate chain by name hash, merging ancestors. A plate that
/// references itself (directly or through a chain) resolves to `Missing`
/// with a failure recorded by the caller.
pub fn resolve_plate(
    ctx: &Context,
    state: &mut BuildState,
    name: &str,
) -> PlateSlot {
    let hash = new_hash(name);

    if let Some(slot) = state.plates.get(&hash) {
        return slot.clone();
    }

    state.plates.insert(hash, PlateSlot::InProgress);

    let path = ctx
        .project_root
        .join(config::PLATE_DIR)
        .join(format!("{name}.{}", config::EXTENSION));

    let Ok(source) = fs::read_to_string(&path) else {
        state.plates.insert(hash, PlateSlot::Missing);
        return PlateSlot::Missing;
    };

    let file: Arc<str> = Arc::from(format!("{}/{name}.{}", config::PLATE_DIR, config::EXTENSION));
    let ast = parse_document(&source, &file, true, &mut state.errors);
    let mut frame = harvest(&ast);

    // a plate may chain to a parent plate; re-entry hits InProgress
    if let Some(parent) = frame_text_value(&frame, PLATE_HASH) {
        match resolve_plate(ctx, state, &parent) {
            PlateSlot::Ready(parent_frame) => {
                for (&h, slot) in parent_frame.iter() {
                    frame.entry(h).or_insert_with(|| slot.clone());
                }
            }
            PlateSlot::InProgress => {
                state.errors.push(
                    crate::errors::Severity::Failure,
                    format!("plate {name:?} is part of a reference cycle"),
                );
            }
            PlateSlot::Missing => {
                state.errors.push(
                    crate::errors::Severity::Failure,
                    format!("plate {parent:?} (referenced by {name:?}) does not exist"),
                );
            }
        }
    }

    let slot = PlateSlot::Ready(Arc::new(frame));
    state.plates.insert(hash, slot.clone());
    slot
}

/// Literal text of a frame entry, for plate-chain names.
fn frame_text_value(frame: &Frame, hash: u32) -> Option<String> {
    let slot = frame.get(&hash)?;
    let mut out = String::new();
    for node in slot.value.iter() {
        match node {
            Ast::Text { text, .. } | Ast::Raw { text, .. } => out.push_str(text),
            _ => {}
        }
    }
    let out = out.trim().to_owned();
    (!out.is_empty()).then_some(out)
}

fn load_support_directory(
    project_root: &Path,
    dir: &str,
    errors: &mut Diagnostics,
) -> FxHashMap<u32, Arc<Document>> {
    let mut map = FxHashMap::default();
    let full = project_root.join(dir);

    let Ok(entries) = fs::read_dir(&full) else {
        return map;
    };

    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        if path.extension().and_then(|e| e.to_str()) != Some(config::EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(source) = fs::read_to_string(&path) else {
            continue;
        };

        let file: Arc<str> = Arc::from(format!("{dir}/{stem}.{}", config::EXTENSION));
        let ast = parse_document(&source, &file, true, errors);
        let scope = harvest(&ast);

        map.insert(
            new_hash(stem),
            Arc::new(Document {
                name: stem.to_owned(),
                ast,
                scope,
            }),
        );
    }

    map
}

fn load_globals(project_root: &Path, errors: &mut Diagnostics) -> Frame {
    let path = project_root.join(config::GLOBAL_DECLS);
    let Ok(source) = fs::read_to_string(&path) else {
        return Frame::default();
    };

    let file: Arc<str> = Arc::from(config::GLOBAL_DECLS);
    let ast = parse_document(&source, &file, true, errors);
    harvest(&ast)
}

/// Fingerprint for the generated-image queue.
pub fn image_key(path: &str, settings: &ImageSettings) -> u32 {
    let tail = format!(
        "{}|{}x{}q{}c{}",
        path,
        settings.max_size,
        settings.height,
        settings.quality,
        settings.codec.map(|c| c.extension()).unwrap_or("keep"),
    );
    new_hash(&tail)
}

/// Output path for a generated image: stem, settings fingerprint, target
/// extension.
pub fn gen_image_rel(source_rel: &str, settings: &ImageSettings) -> String {
    let (stem, ext) = match source_rel.rfind('.') {
        Some(dot) => (&source_rel[..dot], &source_rel[dot + 1..]),
        None => (source_rel, ""),
    };
    let ext = settings.codec.map(|c| c.extension()).unwrap_or(ext);
    let key = image_key(source_rel, settings);
    format!("{stem}_{key:08x}.{ext}")
}
