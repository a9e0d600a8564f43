//! The markup language pipeline: lexer → token stream → parser → AST.
//!
//! The language is punctuation-driven; the only reserved words are `if`,
//! `else`, `for`, `raw` and `html`. Everything else — tokens, blocks,
//! variables — is user-defined through declarations, which is why the
//! parser never interprets names beyond hashing them.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{Ast, Decl, Exec, ExecKind, Format, ImageSettings, Modifier, PathType, Var};
pub use lexer::{Token, TokenKind, lex};
pub use parser::parse_stream;

use crate::errors::Diagnostics;
use std::sync::Arc;

/// Lex and parse one document. `is_support` marks config-side files
/// (templates, partials, plates, global declarations), which soften their
/// declarations and may not start a taginator.
pub fn parse_document(
    source: &str,
    file: &Arc<str>,
    is_support: bool,
    errors: &mut Diagnostics,
) -> Vec<Ast> {
    let stream = lex(source, file);
    parse_stream(&stream, is_support, errors)
}
