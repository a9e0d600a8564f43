//! Syntax tree produced by the parser.
//!
//! One tagged enum; every variant carries the position it was derived
//! from so diagnostics can point back into the source. Declaration values
//! sit behind an `Arc` because scope frames alias them freely during
//! rendering.

use crate::config::ImageCodec;
use crate::errors::Position;
use std::sync::Arc;

/// Variable modifiers, `%name:modifier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modifier {
    #[default]
    None,
    Slug,
    UniqueSlug,
    Upper,
    Lower,
    Title,
    Raw,
}

impl Modifier {
    pub fn from_name(input: &str) -> Option<Self> {
        let m = match input.to_ascii_lowercase().as_str() {
            "slug" | "s" => Modifier::Slug,
            "unique_slug" | "uslug" | "us" => Modifier::UniqueSlug,
            "upper" | "u" => Modifier::Upper,
            "lower" | "l" => Modifier::Lower,
            "title" | "t" => Modifier::Title,
            "raw" | "r" => Modifier::Raw,
            _ => return None,
        };
        Some(m)
    }
}

/// URL form a locator expression emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathType {
    #[default]
    Rooted,
    Absolute,
    Relative,
}

impl PathType {
    pub fn from_name(input: &str) -> Option<Self> {
        let p = match input.to_ascii_lowercase().as_str() {
            "abs" | "absolute" => PathType::Absolute,
            "rel" | "relative" => PathType::Relative,
            "root" | "rooted" => PathType::Rooted,
            _ => return None,
        };
        Some(p)
    }
}

/// Exec expression sub-kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    Locator,
    Date,
}

impl ExecKind {
    pub fn from_keyword(input: &str) -> Option<Self> {
        let k = match input.to_ascii_lowercase().as_str() {
            "find" | "link" => ExecKind::Locator,
            "date" => ExecKind::Date,
            // aliases kept from earlier language versions
            "page" | "image" | "static" => ExecKind::Locator,
            _ => return None,
        };
        Some(k)
    }
}

/// Settings tail on an image locator: `%{find pic.jpg 600 x400 80 webp}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageSettings {
    pub max_size: u32,
    pub height: u32,
    pub quality: u8,
    pub codec: Option<ImageCodec>,
}

impl ImageSettings {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Inline formatting styles, by asterisk-run length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Italic,
    Bold,
    BoldItalic,
}

impl Format {
    pub fn from_run(len: usize) -> Option<Self> {
        match len {
            1 => Some(Format::Italic),
            2 => Some(Format::Bold),
            3 => Some(Format::BoldItalic),
            _ => None,
        }
    }

    /// The literal glyphs this marker was read from.
    pub fn glyphs(self) -> &'static str {
        match self {
            Format::Italic => "*",
            Format::Bold => "**",
            Format::BoldItalic => "***",
        }
    }

    /// Tags used when no declaration overrides the style.
    pub fn fallback(self) -> (&'static str, &'static str) {
        match self {
            Format::Italic => ("<i>", "</i>"),
            Format::Bold => ("<b>", "</b>"),
            Format::BoldItalic => ("<b><i>", "</i></b>"),
        }
    }
}

/// A binding of a name (or glyph run, or block name) to a value
/// expression.
#[derive(Debug, Clone)]
pub struct Decl {
    pub pos: Position,
    pub field: u32,
    /// First segment of a dotted name, 0 when the name is plain.
    pub taxonomy: u32,
    /// Remaining segments of a dotted name.
    pub subname: u32,
    /// `name : =` evaluates the value at declaration time.
    pub immediate: bool,
    /// Declared in a support file; yields to page declarations on merge.
    pub is_soft: bool,
    pub value: Arc<Vec<Ast>>,
}

#[derive(Debug, Clone)]
pub struct Var {
    pub pos: Position,
    pub field: u32,
    pub taxonomy: u32,
    pub subname: u32,
    /// Original spelling, kept for diagnostics.
    pub name: String,
    pub modifier: Modifier,
}

#[derive(Debug, Clone)]
pub struct Exec {
    pub pos: Position,
    pub kind: ExecKind,
    pub path_type: PathType,
    /// Named date format for `%{date:name …}`.
    pub format: Option<String>,
    pub settings: Option<ImageSettings>,
    pub target: Vec<Ast>,
}

#[derive(Debug, Clone)]
pub struct IfNode {
    pub pos: Position,
    /// Shared with the matching `else`, which inverts it at render time.
    pub conditions: Arc<Vec<Ast>>,
    pub body: Vec<Ast>,
    pub is_else: bool,
}

#[derive(Debug, Clone)]
pub struct ForNode {
    pub pos: Position,
    pub source: Ast,
    pub body: Vec<Ast>,
}

#[derive(Debug, Clone)]
pub struct ImportNode {
    pub pos: Position,
    pub hash: u32,
    pub name: String,
    pub target: Vec<Ast>,
}

#[derive(Debug, Clone)]
pub enum Ast {
    /// Literal text, HTML-escaped on output.
    Text { pos: Position, text: String },
    /// Pre-escaped literal text, copied through untouched.
    Raw { pos: Position, text: String },
    /// An explicit blank line.
    Blank { pos: Position },
    /// A run of spaces surviving outside a paragraph.
    Whitespace { pos: Position },
    /// One source line of inline content. `raw` lines (leading `<`) skip
    /// the default wrapper and HTML escaping of their literal text.
    Paragraph {
        pos: Position,
        raw: bool,
        children: Vec<Ast>,
    },
    /// Applied user token: `## Alpha`.
    Token {
        pos: Position,
        hash: u32,
        glyphs: String,
        children: Vec<Ast>,
    },
    /// Block invocation `name { … }`; hash 0 is an anonymous block.
    Block {
        pos: Position,
        hash: u32,
        children: Vec<Ast>,
    },
    Decl(Box<Decl>),
    DeclToken(Box<Decl>),
    DeclBlock(Box<Decl>),
    Var(Box<Var>),
    VarAnon { pos: Position, modifier: Modifier },
    VarEnum {
        pos: Position,
        n: u32,
        modifier: Modifier,
    },
    Exec(Box<Exec>),
    If(Box<IfNode>),
    For(Box<ForNode>),
    Template {
        pos: Position,
        hash: u32,
        name: String,
    },
    Partial {
        pos: Position,
        hash: u32,
        name: String,
    },
    Unset {
        pos: Position,
        hash: u32,
        name: String,
    },
    Import(Box<ImportNode>),
    Script {
        pos: Position,
        hash: u32,
        name: String,
        children: Vec<Ast>,
    },
    OpNot { pos: Position },
    OpAnd { pos: Position },
    OpOr { pos: Position },
    FormatBegin { pos: Position, style: Format },
    FormatEnd { pos: Position, style: Format },
}

impl Ast {
    pub fn pos(&self) -> &Position {
        match self {
            Ast::Text { pos, .. }
            | Ast::Raw { pos, .. }
            | Ast::Blank { pos }
            | Ast::Whitespace { pos }
            | Ast::Paragraph { pos, .. }
            | Ast::Token { pos, .. }
            | Ast::Block { pos, .. }
            | Ast::VarAnon { pos, .. }
            | Ast::VarEnum { pos, .. }
            | Ast::Template { pos, .. }
            | Ast::Partial { pos, .. }
            | Ast::Unset { pos, .. }
            | Ast::Script { pos, .. }
            | Ast::OpNot { pos }
            | Ast::OpAnd { pos }
            | Ast::OpOr { pos }
            | Ast::FormatBegin { pos, .. }
            | Ast::FormatEnd { pos, .. } => pos,
            Ast::Decl(d) | Ast::DeclToken(d) | Ast::DeclBlock(d) => &d.pos,
            Ast::Var(v) => &v.pos,
            Ast::Exec(e) => &e.pos,
            Ast::If(i) => &i.pos,
            Ast::For(f) => &f.pos,
            Ast::Import(i) => &i.pos,
        }
    }

    pub fn is_declaration(&self) -> bool {
        matches!(self, Ast::Decl(_) | Ast::DeclToken(_) | Ast::DeclBlock(_))
    }

    pub fn text(pos: Position, text: impl Into<String>) -> Self {
        Ast::Text {
            pos,
            text: text.into(),
        }
    }

    pub fn raw(pos: Position, text: impl Into<String>) -> Self {
        Ast::Raw {
            pos,
            text: text.into(),
        }
    }
}
