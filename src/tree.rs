//! Recursive snapshot of the source directory.
//!
//! Nodes live in an arena indexed by `NodeId` so parents and children can
//! reference each other freely; the `is_used`/`is_built` flags are atomics
//! because the dev server reads the tree from concurrent request handlers.

use crate::config::{Config, EXTENSION};
use crate::hash::new_hash;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Directory,
    Markup,
    Markdown,
    Html,
    Css,
    Scss,
    Javascript,
    ImageJpg,
    ImagePng,
    ImageTif,
    ImageWebp,
    Static,
}

impl FileType {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        match ext.as_str() {
            EXTENSION => FileType::Markup,
            "md" => FileType::Markdown,
            "html" => FileType::Html,
            "css" => FileType::Css,
            "scss" => FileType::Scss,
            "js" => FileType::Javascript,
            "jpg" | "jpeg" => FileType::ImageJpg,
            "png" => FileType::ImagePng,
            "tif" | "tiff" => FileType::ImageTif,
            "webp" => FileType::ImageWebp,
            _ => FileType::Static,
        }
    }

    /// Extension the built artefact carries.
    pub fn output_extension(self) -> Option<&'static str> {
        let ext = match self {
            FileType::Markup | FileType::Markdown | FileType::Html => "html",
            FileType::Css | FileType::Scss => "css",
            FileType::Javascript => "js",
            FileType::ImageJpg => "jpg",
            FileType::ImagePng => "png",
            FileType::ImageTif => "tif",
            FileType::ImageWebp => "webp",
            FileType::Directory | FileType::Static => return None,
        };
        Some(ext)
    }

    /// Page-like files hash and match with their extension stripped.
    pub fn is_page_like(self) -> bool {
        matches!(self, FileType::Markup | FileType::Markdown | FileType::Html)
    }

    pub fn is_image(self) -> bool {
        matches!(
            self,
            FileType::ImageJpg | FileType::ImagePng | FileType::ImageTif | FileType::ImageWebp
        )
    }
}

pub type NodeId = usize;

#[derive(Debug)]
pub struct FileNode {
    pub file_type: FileType,
    /// Hash of the base name, extension stripped for page-like files.
    pub hash_name: u32,
    /// Project-relative path with forward slashes: `source/posts/hello.x`.
    pub path: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub is_draft: bool,
    is_used: AtomicBool,
    is_built: AtomicBool,
}

impl FileNode {
    pub fn is_used(&self) -> bool {
        self.is_used.load(Ordering::Relaxed)
    }

    pub fn mark_used(&self) {
        self.is_used.store(true, Ordering::Relaxed);
    }

    pub fn is_built(&self) -> bool {
        self.is_built.load(Ordering::Relaxed)
    }

    pub fn mark_built(&self) {
        self.is_built.store(true, Ordering::Relaxed);
    }

    pub fn base_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Path with the extension stripped for page-like files; what the
    /// finder matches against.
    pub fn match_path(&self) -> &str {
        if self.file_type.is_page_like() {
            match self.path.rfind('.') {
                Some(dot) => &self.path[..dot],
                None => &self.path,
            }
        } else {
            &self.path
        }
    }
}

#[derive(Debug)]
pub struct FileTree {
    nodes: Vec<FileNode>,
    pub root: NodeId,
    /// Directory the relative paths hang off.
    pub project_root: PathBuf,
}

impl FileTree {
    /// Snapshot `<project_root>/source`.
    pub fn load(project_root: &Path, config: &Config) -> Result<Self> {
        let mut tree = Self {
            nodes: Vec::with_capacity(64),
            root: 0,
            project_root: project_root.to_owned(),
        };

        tree.nodes.push(FileNode {
            file_type: FileType::Directory,
            hash_name: new_hash(crate::config::SOURCE_DIR),
            path: crate::config::SOURCE_DIR.to_owned(),
            parent: None,
            children: Vec::new(),
            is_draft: false,
            is_used: AtomicBool::new(true),
            is_built: AtomicBool::new(false),
        });

        let source = project_root.join(crate::config::SOURCE_DIR);
        tree.walk(&source, 0, config)
            .with_context(|| format!("failed to read {}", source.display()))?;

        Ok(tree)
    }

    fn walk(&mut self, dir: &Path, parent: NodeId, config: &Config) -> Result<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        entries.sort();

        for path in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            let parent_draft = self.nodes[parent].is_draft;
            let is_draft = parent_draft || name.starts_with(&config.draft_marker);
            let rel = format!("{}/{}", self.nodes[parent].path, name);

            if path.is_dir() {
                let id = self.push_node(FileType::Directory, rel, parent, is_draft);
                self.walk(&path, id, config)?;
            } else {
                let file_type = FileType::from_path(&path);
                self.push_node(file_type, rel, parent, is_draft);
            }
        }

        Ok(())
    }

    fn push_node(
        &mut self,
        file_type: FileType,
        path: String,
        parent: NodeId,
        is_draft: bool,
    ) -> NodeId {
        let id = self.nodes.len();

        let base = path.rsplit('/').next().unwrap_or(&path);
        let hashed = if file_type.is_page_like() {
            match base.rfind('.') {
                Some(dot) => &base[..dot],
                None => base,
            }
        } else {
            base
        };

        self.nodes.push(FileNode {
            file_type,
            hash_name: new_hash(hashed),
            path,
            parent: Some(parent),
            children: Vec::new(),
            is_draft,
            is_used: AtomicBool::new(false),
            is_built: AtomicBool::new(false),
        });
        self.nodes[parent].children.push(id);

        id
    }

    pub fn node(&self, id: NodeId) -> &FileNode {
        &self.nodes[id]
    }

    /// Every node id, root first, in stable walk order.
    pub fn ids(&self) -> std::ops::Range<NodeId> {
        0..self.nodes.len()
    }

    /// Absolute path on disk for a node.
    pub fn real_path(&self, id: NodeId) -> PathBuf {
        self.project_root.join(&self.nodes[id].path)
    }

    /// Path relative to the source root: `source/posts/hello.x` →
    /// `posts/hello.x`.
    pub fn source_relative(&self, id: NodeId) -> &str {
        self.nodes[id]
            .path
            .strip_prefix("source/")
            .unwrap_or(&self.nodes[id].path)
    }
}
