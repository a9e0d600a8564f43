//! The declaration scope stack used during rendering.
//!
//! Each frame maps name-hashes to declaration values. Lookup walks from
//! the innermost frame outward; a blank frame is pushed around every block
//! body so its declarations vanish on exit. Merging support-file frames
//! preserves existing entries, which is how templates and plates supply
//! defaults without overriding a page's own choices.

use crate::markup::Ast;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// One binding: the declaration's value expression.
#[derive(Debug, Clone)]
pub struct Slot {
    pub value: Arc<Vec<Ast>>,
    pub is_soft: bool,
}

impl Slot {
    pub fn new(value: Arc<Vec<Ast>>) -> Self {
        Self {
            value,
            is_soft: false,
        }
    }

    /// A binding holding one pre-rendered literal.
    pub fn text(pos: crate::errors::Position, text: impl Into<String>) -> Self {
        Self::new(Arc::new(vec![Ast::raw(pos, text)]))
    }
}

pub type Frame = FxHashMap<u32, Slot>;

#[derive(Debug, Default)]
pub struct ScopeStack {
    frames: Vec<Frame>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::default()],
        }
    }

    pub fn push_blank(&mut self) {
        self.frames.push(Frame::default());
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) {
        debug_assert!(self.frames.len() > 1, "popped the config frame");
        self.frames.pop();
    }

    /// Bind in the innermost frame.
    pub fn declare(&mut self, hash: u32, slot: Slot) {
        self.frames
            .last_mut()
            .expect("scope stack never empty")
            .insert(hash, slot);
    }

    /// First hit from the innermost frame outward.
    pub fn lookup(&self, hash: u32) -> Option<&Slot> {
        self.frames.iter().rev().find_map(|f| f.get(&hash))
    }

    /// Remove a name from the innermost frame that holds it.
    pub fn unset(&mut self, hash: u32) {
        for frame in self.frames.iter_mut().rev() {
            if frame.remove(&hash).is_some() {
                return;
            }
        }
    }

    /// Merge a support frame into the innermost frame without
    /// overriding anything already bound there or in an outer frame the
    /// caller controls. The inner scope wins.
    pub fn merge_soft(&mut self, frame: &Frame) {
        let top = self.frames.last_mut().expect("scope stack never empty");
        for (&hash, slot) in frame {
            top.entry(hash).or_insert_with(|| slot.clone());
        }
    }
}

/// Collect a document's top-level declarations into a frame. Later
/// declarations of the same name win, matching render order.
pub fn harvest(nodes: &[Ast]) -> Frame {
    let mut frame = Frame::default();

    for node in nodes {
        if let Ast::Decl(d) | Ast::DeclToken(d) | Ast::DeclBlock(d) = node {
            frame.insert(
                d.field,
                Slot {
                    value: d.value.clone(),
                    is_soft: d.is_soft,
                },
            );
        }
    }

    frame
}

/// The template a document selects, if any: the last top-level reference
/// wins because a later one replaces the selection.
pub fn selected_template(nodes: &[Ast]) -> Option<u32> {
    nodes.iter().rev().find_map(|node| match node {
        Ast::Template { hash, .. } => Some(*hash),
        _ => None,
    })
}
