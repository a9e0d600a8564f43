//! Token stream to AST.
//!
//! The parser is a hand-written recursive descent over the token stream
//! with backtracking: any construct that stops looking like itself rewinds
//! to a checkpoint and falls through to plain paragraph text, usually with
//! a warning. Fatal ambiguities (an `else` with no `if`, a bad import)
//! record a failure and set the sticky `unwind` flag, which short-circuits
//! the rest of the enclosing block while still returning a partial tree.

use super::ast::*;
use super::lexer::{Token, TokenKind};
use crate::errors::{Diagnostics, Severity};
use crate::hash::{TAGINATOR_HASH, new_hash};
use std::sync::Arc;

pub struct Parser<'a, 'e> {
    index: usize,
    unwind: bool,
    stream: &'a [Token<'a>],
    errors: &'e mut Diagnostics,
}

/// Parse a whole token stream. `is_support` marks config-side documents.
pub fn parse_stream(
    stream: &[Token<'_>],
    is_support: bool,
    errors: &mut Diagnostics,
) -> Vec<Ast> {
    let mut parser = Parser {
        index: 0,
        unwind: false,
        stream,
        errors,
    };
    parser.parse_block(0, is_support)
}

impl<'a> Parser<'a, '_> {
    // ------------------------------------------------------------------
    // stream movement
    // ------------------------------------------------------------------

    fn next(&mut self) -> Option<&'a Token<'a>> {
        let t = self.stream.get(self.index);
        if t.is_some() {
            self.index += 1;
        }
        t
    }

    fn peek(&self) -> Option<&'a Token<'a>> {
        self.stream.get(self.index)
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().map_or(TokenKind::Eof, |t| t.kind)
    }

    fn prev(&self) -> Option<&'a Token<'a>> {
        if self.index < 2 {
            return None;
        }
        self.stream.get(self.index - 2)
    }

    fn step_back(&mut self) {
        self.index -= 1;
    }

    /// Skip whitespace tokens; reports whether any were skipped.
    fn eat_whitespace(&mut self) -> bool {
        let mut did_any = false;
        while self.peek_kind() == TokenKind::Whitespace {
            self.index += 1;
            did_any = true;
        }
        did_any
    }

    /// The next non-whitespace token, without consuming anything.
    fn peek_past_whitespace(&self) -> Option<&'a Token<'a>> {
        self.stream[self.index..]
            .iter()
            .find(|t| t.kind != TokenKind::Whitespace)
    }

    // ------------------------------------------------------------------
    // blocks
    // ------------------------------------------------------------------

    fn parse_block(&mut self, max_items: usize, is_support: bool) -> Vec<Ast> {
        let mut array = Vec::with_capacity(16);

        loop {
            if self.unwind {
                break;
            }
            if max_items > 0 && array.len() >= max_items {
                break;
            }

            let Some(token) = self.next() else { break };
            if token.kind.is(&[TokenKind::Eof, TokenKind::BraceClose]) {
                break;
            }

            if token.kind == TokenKind::Newline {
                if self.prev().is_some_and(|p| p.kind == TokenKind::Newline) {
                    array.push(Ast::Blank {
                        pos: token.pos.clone(),
                    });
                }
                continue;
            }

            // leading glyph run followed by spacing applies a user token
            if token.kind.starts_user_token() {
                let mark = self.index;
                let word = self.merge_glyph_run(token);

                if self
                    .peek()
                    .is_some_and(|p| p.kind.is(&[TokenKind::Whitespace, TokenKind::Newline]))
                {
                    self.eat_whitespace();
                    let children = self.parse_paragraph(is_support, &[]);
                    array.push(Ast::Token {
                        pos: token.pos.clone(),
                        hash: new_hash(&word),
                        glyphs: word,
                        children,
                    });
                    continue;
                }

                self.index = mark;
            }

            match token.kind {
                TokenKind::Whitespace => continue,

                TokenKind::ForwardSlash => {
                    // a comment sigil has to be spaced
                    if self.peek_kind() != TokenKind::Whitespace {
                        array.push(self.parse_paragraph_node(token, is_support));
                        continue;
                    }
                    self.eat_comment();
                }

                TokenKind::Dollar => {
                    self.eat_whitespace();

                    let name = match self.next() {
                        Some(t) if t.kind.is(&[TokenKind::Word, TokenKind::Ident]) => t,
                        _ => {
                            self.errors.push_pos(
                                Severity::ParserFailure,
                                token.pos.clone(),
                                "malformed script call (or unescaped $ at start of line)",
                            );
                            continue;
                        }
                    };

                    self.eat_whitespace();
                    let children = self.parse_paragraph(is_support, &[]);

                    array.push(Ast::Script {
                        pos: token.pos.clone(),
                        hash: new_hash(name.text),
                        name: name.text.to_owned(),
                        children,
                    });
                }

                TokenKind::Tilde => {
                    self.eat_whitespace();

                    let name = match self.peek() {
                        Some(t) if t.kind.is(&[TokenKind::Word, TokenKind::Ident]) => {
                            self.next();
                            t
                        }
                        _ => {
                            self.errors.push_pos(
                                Severity::ParserFailure,
                                token.pos.clone(),
                                "import requires a name",
                            );
                            self.unwind = true;
                            break;
                        }
                    };

                    self.eat_whitespace();
                    let target = self.parse_paragraph(is_support, &[]);

                    if target.is_empty() {
                        self.errors.push_pos(
                            Severity::ParserFailure,
                            token.pos.clone(),
                            format!("import {:?} requires a path expression", name.text),
                        );
                        self.unwind = true;
                        break;
                    }

                    array.push(Ast::Import(Box::new(ImportNode {
                        pos: token.pos.clone(),
                        hash: new_hash(name.text),
                        name: name.text.to_owned(),
                        target,
                    })));
                }

                TokenKind::Asterisk | TokenKind::Ampersand | TokenKind::AngleClose => {
                    let mark = self.index - 1;
                    self.eat_whitespace();

                    let name = match self.peek() {
                        Some(t) if t.kind.is(&[TokenKind::Word, TokenKind::Ident]) => {
                            self.next();
                            t
                        }
                        _ => {
                            self.errors.push_pos(
                                Severity::ParserWarning,
                                token.pos.clone(),
                                format!("ambiguous token {:?} should be escaped", token.text),
                            );
                            self.index = mark;
                            let token = self.next().unwrap();
                            array.push(self.parse_paragraph_node(token, is_support));
                            continue;
                        }
                    };

                    self.eat_whitespace();

                    if !self.peek_kind().is(&[TokenKind::Newline, TokenKind::Eof]) {
                        self.errors.push_pos(
                            Severity::ParserWarning,
                            token.pos.clone(),
                            format!("ambiguous token {:?} should be escaped", token.text),
                        );
                        self.index = mark;
                        let token = self.next().unwrap();
                        array.push(self.parse_paragraph_node(token, is_support));
                        continue;
                    }

                    let pos = token.pos.clone();
                    let hash = new_hash(name.text);
                    let name = name.text.to_owned();

                    array.push(match token.kind {
                        TokenKind::Asterisk => Ast::Unset { pos, hash, name },
                        TokenKind::Ampersand => Ast::Template { pos, hash, name },
                        _ => Ast::Partial { pos, hash, name },
                    });
                }

                TokenKind::Word | TokenKind::Ident => {
                    if let Some(node) = self.parse_word_led(token, &mut array, is_support) {
                        array.push(node);
                    }
                    if self.unwind {
                        break;
                    }
                }

                TokenKind::BraceOpen
                    if self
                        .peek()
                        .is_some_and(|p| p.kind.is(&[TokenKind::Whitespace, TokenKind::Newline])) =>
                {
                    // a whole-line brace opens an anonymous block
                    let children = self.parse_block(0, is_support);
                    array.push(Ast::Block {
                        pos: token.pos.clone(),
                        hash: 0,
                        children,
                    });
                }

                TokenKind::BraceOpen | TokenKind::BracketOpen => {
                    if let Some(node) = self.parse_template_decl(token, is_support) {
                        array.push(node);
                    } else if self.unwind {
                        break;
                    } else {
                        let token = self.next().unwrap();
                        array.push(self.parse_paragraph_node(token, is_support));
                    }
                }

                _ => {
                    self.step_back();
                    let token = self.next().unwrap();
                    array.push(self.parse_paragraph_node(token, is_support));
                }
            }
        }

        array
    }

    /// Rewind one token and read the rest of the line as a paragraph.
    fn parse_paragraph_node(&mut self, token: &'a Token<'a>, is_support: bool) -> Ast {
        self.step_back();
        let children = self.parse_paragraph(is_support, &[]);
        Ast::Paragraph {
            pos: token.pos.clone(),
            raw: token.kind == TokenKind::AngleOpen,
            children,
        }
    }

    /// Merge a run of identical glyph tokens starting at `token` into one
    /// string. NonWord tokens already arrive as complete runs.
    fn merge_glyph_run(&mut self, token: &'a Token<'a>) -> String {
        if token.kind == TokenKind::NonWord {
            return token.text.to_owned();
        }

        let mut word = String::from(token.text);
        while self.peek().is_some_and(|p| p.kind == token.kind) {
            word.push_str(token.text);
            self.index += 1;
        }
        word
    }

    // ------------------------------------------------------------------
    // word-led items: control flow, declarations, block invocations
    // ------------------------------------------------------------------

    fn parse_word_led(
        &mut self,
        token: &'a Token<'a>,
        array: &mut Vec<Ast>,
        is_support: bool,
    ) -> Option<Ast> {
        let mark = self.index - 1;

        match token.text {
            "if" => {
                let conditions = self.parse_if();
                if conditions.is_empty() && !self.unwind {
                    self.index = mark;
                    let token = self.next().unwrap();
                    return Some(self.parse_paragraph_node(token, is_support));
                }

                self.eat_whitespace();
                let body = self.parse_block(1, is_support);

                return Some(Ast::If(Box::new(IfNode {
                    pos: token.pos.clone(),
                    conditions: Arc::new(conditions),
                    body,
                    is_else: false,
                })));
            }

            "else" => {
                let conditions = match array.last() {
                    Some(Ast::If(previous)) if !previous.is_else => previous.conditions.clone(),
                    _ => {
                        self.errors.push_pos(
                            Severity::ParserFailure,
                            token.pos.clone(),
                            "'else' must follow if-statement",
                        );
                        self.unwind = true;
                        return None;
                    }
                };

                self.eat_whitespace();
                let body = self.parse_block(1, is_support);

                return Some(Ast::If(Box::new(IfNode {
                    pos: token.pos.clone(),
                    conditions,
                    body,
                    is_else: true,
                })));
            }

            "for" => {
                self.eat_whitespace();
                let head = self.parse_paragraph(is_support, &[TokenKind::Whitespace]);

                let source = match head.into_iter().next() {
                    Some(
                        node @ (Ast::Var(_) | Ast::VarAnon { .. } | Ast::VarEnum { .. }),
                    ) => node,
                    Some(node @ Ast::Exec(_)) => node,
                    _ => {
                        self.index = mark;
                        let token = self.next().unwrap();
                        return Some(self.parse_paragraph_node(token, is_support));
                    }
                };

                self.eat_whitespace();
                let body = self.parse_block(1, is_support);

                return Some(Ast::For(Box::new(ForNode {
                    pos: token.pos.clone(),
                    source,
                    body,
                })));
            }

            _ => {}
        }

        // not a keyword: either a block invocation, a declaration, or a
        // plain line of text
        self.step_back();
        let (field, taxonomy, subname, name) = self.parse_variable_ident();

        // `name raw { … }` / `name html { … }` invoke with a raw body
        if let Some(peeked) = self.peek_past_whitespace()
            && peeked.kind == TokenKind::Word
            && (peeked.text == "raw" || peeked.text == "html")
        {
            let attempt = self.index;
            self.eat_whitespace();
            self.next(); // the raw/html word

            if self.peek_past_whitespace().map(|t| t.kind) == Some(TokenKind::BraceOpen) {
                let intact_html = peeked.text == "html";
                self.eat_whitespace();
                self.next(); // the brace

                let raw = self.parse_raw_block(intact_html, token.pos.clone());
                return Some(Ast::Block {
                    pos: token.pos.clone(),
                    hash: field,
                    children: vec![raw],
                });
            }

            self.index = attempt;
        }

        // `name { … }` block invocation
        if self.peek_past_whitespace().map(|t| t.kind) == Some(TokenKind::BraceOpen) {
            self.eat_whitespace();
            self.next(); // the brace

            let children = self.parse_block(0, is_support);
            return Some(Ast::Block {
                pos: token.pos.clone(),
                hash: field,
                children,
            });
        }

        // `name =` / `name : =` declaration
        let mut immediate = false;
        if self.peek_past_whitespace().map(|t| t.kind) == Some(TokenKind::Colon) {
            let attempt = self.index;
            self.eat_whitespace();
            self.next(); // the colon

            if self.peek_past_whitespace().map(|t| t.kind) == Some(TokenKind::Equals) {
                immediate = true;
            } else {
                self.index = attempt;
            }
        }

        if self.peek_past_whitespace().map(|t| t.kind) == Some(TokenKind::Equals) {
            if is_support && field == TAGINATOR_HASH {
                self.errors.push_pos(
                    Severity::ParserFailure,
                    token.pos.clone(),
                    "cannot initiate a taginator in a config file",
                );
                self.unwind = true;
                return None;
            }

            self.eat_whitespace();
            self.next(); // the equals
            self.eat_whitespace();

            let value = self.parse_decl_value(is_support);

            return Some(Ast::Decl(Box::new(Decl {
                pos: token.pos.clone(),
                field,
                taxonomy,
                subname,
                immediate,
                is_soft: is_support,
                value: Arc::new(value),
            })));
        }

        // just a line of text that happens to start with a word
        let _ = name;
        self.index = mark;
        let token = self.next().unwrap();
        Some(self.parse_paragraph_node(token, is_support))
    }

    /// Right-hand side of any declaration: a named block reference, a
    /// brace block, or a single paragraph.
    fn parse_decl_value(&mut self, is_support: bool) -> Vec<Ast> {
        if let Some(word) = self.peek()
            && word.kind.is(&[TokenKind::Word, TokenKind::Ident])
        {
            let attempt = self.index;
            self.next();

            if self.peek_past_whitespace().map(|t| t.kind) == Some(TokenKind::BraceOpen) {
                self.eat_whitespace();
                self.next(); // the brace

                let children = self.parse_block(0, is_support);
                return vec![Ast::Block {
                    pos: word.pos.clone(),
                    hash: new_hash(word.text),
                    children,
                }];
            }

            self.index = attempt;
            return self.parse_paragraph(is_support, &[]);
        }

        if self.peek_kind() == TokenKind::BraceOpen {
            let brace = self.next().unwrap();
            let children = self.parse_block(0, is_support);
            return vec![Ast::Block {
                pos: brace.pos.clone(),
                hash: 0,
                children,
            }];
        }

        self.parse_paragraph(is_support, &[])
    }

    /// Token (`[##] =`, `{-} =`) and block (`[name] =`) template
    /// declarations. Returns None when the shape does not pan out; the
    /// caller rewinds to paragraph text.
    fn parse_template_decl(&mut self, open: &'a Token<'a>, is_support: bool) -> Option<Ast> {
        let mark = self.index - 1;
        let is_brace = open.kind == TokenKind::BraceOpen;

        let inner = self.next()?;
        let mut invalid_inner = None;

        let (mut field, taxonomy, subname, is_token) = if inner.kind.is_glyph() {
            let word = self.merge_glyph_run(inner);
            (new_hash(&word), 0, 0, true)
        } else if !is_brace && inner.kind.is(&[TokenKind::Word, TokenKind::Ident]) {
            self.step_back();
            let (field, taxonomy, subname, _) = self.parse_variable_ident();
            (field, taxonomy, subname, false)
        } else {
            invalid_inner = Some(inner.text);
            (0, 0, 0, is_brace)
        };

        // brace-form hashes offset by one so `[x]` and `{x}` never collide
        if is_brace {
            field += 1;
        }

        match self.next() {
            Some(t) if t.kind.is(&[TokenKind::BracketClose, TokenKind::BraceClose]) => {}
            _ => {
                self.index = mark;
                return None;
            }
        }

        self.eat_whitespace();
        match self.next() {
            Some(t) if t.kind == TokenKind::Equals => {}
            _ => {
                self.index = mark;
                return None;
            }
        }

        // the user definitely meant a declaration now, so a bad name is
        // fatal rather than a rewind
        if let Some(text) = invalid_inner {
            let message = if is_brace {
                format!("bad type in {{declaration}}: {text:?} cannot be used as a token character")
            } else {
                format!("bad type in [declaration]: {text:?} cannot be used as a block template name")
            };
            self.errors
                .push_pos(Severity::ParserFailure, open.pos.clone(), message);
            self.unwind = true;
            return None;
        }

        self.eat_whitespace();

        // declaration bodies always parse in support mode: that is where
        // %% and %N become meaningful
        let value = self.parse_decl_value(true);

        let decl = Box::new(Decl {
            pos: open.pos.clone(),
            field,
            taxonomy,
            subname,
            immediate: false,
            is_soft: is_support,
            value: Arc::new(value),
        });

        Some(if is_token {
            Ast::DeclToken(decl)
        } else {
            Ast::DeclBlock(decl)
        })
    }

    // ------------------------------------------------------------------
    // paragraphs
    // ------------------------------------------------------------------

    fn parse_paragraph(&mut self, is_support: bool, exit_upon: &[TokenKind]) -> Vec<Ast> {
        if self.unwind {
            return Vec::new();
        }

        let mut array: Vec<Ast> = Vec::with_capacity(8);
        let mut buffer = String::with_capacity(256);
        let mut buffer_pos = None;
        // open inline-format markers, by array index
        let mut open_formats: [Option<usize>; 3] = [None; 3];

        macro_rules! flush {
            () => {
                if !buffer.is_empty() {
                    let pos = buffer_pos.take().unwrap();
                    array.push(Ast::text(pos, std::mem::take(&mut buffer)));
                }
            };
        }

        loop {
            let Some(token) = self.peek() else { break };

            if token.kind.is(&[TokenKind::Newline, TokenKind::Eof]) {
                self.next();
                break;
            }
            // a closing brace always ends the paragraph so inline block
            // bodies terminate; a literal one is written as \}
            if token.kind == TokenKind::BraceClose || exit_upon.contains(&token.kind) {
                break;
            }

            self.next();

            if buffer.is_empty() {
                buffer_pos = Some(token.pos.clone());
            }

            match token.kind {
                TokenKind::Whitespace => buffer.push(' '),

                TokenKind::Escape => match self.peek() {
                    Some(next) if !next.kind.is(&[TokenKind::Newline, TokenKind::Eof]) => {
                        if buffer.is_empty() {
                            buffer_pos = Some(next.pos.clone());
                        }
                        buffer.push_str(next.text);
                        self.next();
                    }
                    _ => {}
                },

                TokenKind::Percent => {
                    if self.peek_kind() == TokenKind::BraceOpen {
                        self.next();
                        let exec = self.parse_exec(token, is_support);
                        if self.unwind {
                            return array;
                        }
                        flush!();
                        array.push(exec);
                        continue;
                    }

                    match self.parse_variable(token, is_support) {
                        Some(var) => {
                            flush!();
                            array.push(var);
                        }
                        None => buffer.push('%'),
                    }
                }

                TokenKind::Asterisk => {
                    let run = self.merge_glyph_run(token);

                    match Format::from_run(run.len()) {
                        Some(style) => {
                            let slot = style as usize;
                            flush!();
                            match open_formats[slot].take() {
                                Some(_) => array.push(Ast::FormatEnd {
                                    pos: token.pos.clone(),
                                    style,
                                }),
                                None => {
                                    open_formats[slot] = Some(array.len());
                                    array.push(Ast::FormatBegin {
                                        pos: token.pos.clone(),
                                        style,
                                    });
                                }
                            }
                        }
                        None => buffer.push_str(&run),
                    }
                }

                _ => buffer.push_str(token.text),
            }
        }

        flush!();

        // unmatched openers decay back to their literal glyphs
        for slot in open_formats.into_iter().flatten() {
            if let Ast::FormatBegin { pos, style } = &array[slot] {
                array[slot] = Ast::text(pos.clone(), style.glyphs());
            }
        }

        array
    }

    // ------------------------------------------------------------------
    // variables
    // ------------------------------------------------------------------

    /// Consume a (possibly dotted) name; returns (field, taxonomy,
    /// subname, spelling).
    fn parse_variable_ident(&mut self) -> (u32, u32, u32, String) {
        let Some(token) = self.next() else {
            return (0, 0, 0, String::new());
        };

        let name = token.text;
        match name.split_once('.') {
            Some((head, tail)) => (
                new_hash(name),
                new_hash(head),
                new_hash(tail),
                name.to_owned(),
            ),
            None => (new_hash(name), 0, 0, name.to_owned()),
        }
    }

    fn parse_variable(&mut self, percent: &'a Token<'a>, is_support: bool) -> Option<Ast> {
        let peeked = self.peek()?;

        let mut node = match peeked.kind {
            TokenKind::Word | TokenKind::Ident => {
                let (field, taxonomy, subname, name) = self.parse_variable_ident();
                Ast::Var(Box::new(Var {
                    pos: percent.pos.clone(),
                    field,
                    taxonomy,
                    subname,
                    name,
                    modifier: Modifier::None,
                }))
            }
            TokenKind::Number if is_support => {
                self.next();
                let n: u32 = peeked.text.parse().unwrap_or(u32::MAX);
                Ast::VarEnum {
                    pos: percent.pos.clone(),
                    n,
                    modifier: Modifier::None,
                }
            }
            TokenKind::Percent if is_support => {
                self.next();
                Ast::VarAnon {
                    pos: percent.pos.clone(),
                    modifier: Modifier::None,
                }
            }
            _ => return None,
        };

        // optional `:modifier`
        if self.peek_kind() == TokenKind::Colon {
            let attempt = self.index;
            self.next();

            match self.peek() {
                Some(word) if word.kind.is(&[TokenKind::Word, TokenKind::Ident]) => {
                    self.next();
                    match Modifier::from_name(word.text) {
                        Some(modifier) => match &mut node {
                            Ast::Var(v) => v.modifier = modifier,
                            Ast::VarAnon { modifier: m, .. }
                            | Ast::VarEnum { modifier: m, .. } => *m = modifier,
                            _ => unreachable!(),
                        },
                        None => {
                            self.errors.push_pos(
                                Severity::ParserFailure,
                                word.pos.clone(),
                                format!("unknown variable modifier {:?}", word.text),
                            );
                        }
                    }
                }
                _ => self.index = attempt,
            }
        }

        Some(node)
    }

    // ------------------------------------------------------------------
    // if conditions
    // ------------------------------------------------------------------

    fn parse_if(&mut self) -> Vec<Ast> {
        let mut array = Vec::with_capacity(4);

        loop {
            self.eat_whitespace();
            let Some(token) = self.next() else { break };

            match token.kind {
                TokenKind::Bang => array.push(Ast::OpNot {
                    pos: token.pos.clone(),
                }),
                TokenKind::Plus => array.push(Ast::OpAnd {
                    pos: token.pos.clone(),
                }),
                TokenKind::Pipe => array.push(Ast::OpOr {
                    pos: token.pos.clone(),
                }),
                TokenKind::Percent => match self.parse_variable(token, false) {
                    Some(var @ Ast::Var(_)) => array.push(var),
                    Some(_) | None => {
                        self.errors.push_pos(
                            Severity::ParserFailure,
                            token.pos.clone(),
                            "malformed if-statement",
                        );
                        self.unwind = true;
                        return array;
                    }
                },
                _ => {
                    self.step_back();
                    break;
                }
            }
        }

        array
    }

    // ------------------------------------------------------------------
    // exec expressions
    // ------------------------------------------------------------------

    fn parse_exec(&mut self, percent: &'a Token<'a>, is_support: bool) -> Ast {
        let mut kind = ExecKind::Locator;
        let mut path_type = PathType::default();
        let mut format = None;

        if let Some(word) = self.peek()
            && word.kind == TokenKind::Word
            && let Some(parsed) = ExecKind::from_keyword(word.text)
        {
            self.next();
            kind = parsed;

            if self.peek_kind() == TokenKind::Colon {
                self.next();
                if let Some(qualifier) = self.next() {
                    match kind {
                        ExecKind::Locator => {
                            if let Some(p) = PathType::from_name(qualifier.text) {
                                path_type = p;
                            }
                        }
                        ExecKind::Date => format = Some(qualifier.text.to_owned()),
                    }
                }
            }
        }

        self.eat_whitespace();

        let target = match kind {
            ExecKind::Locator => {
                self.parse_paragraph(is_support, &[TokenKind::Whitespace, TokenKind::BraceClose])
            }
            ExecKind::Date => self.parse_paragraph(is_support, &[TokenKind::BraceClose]),
        };

        self.eat_whitespace();

        let settings = if self.peek_kind() == TokenKind::BraceClose {
            self.next();
            None
        } else {
            let settings = self.parse_image_settings();
            if self.peek_kind() == TokenKind::BraceClose {
                self.next();
            }
            settings
        };

        Ast::Exec(Box::new(Exec {
            pos: percent.pos.clone(),
            kind,
            path_type,
            format,
            settings,
            target,
        }))
    }

    fn parse_image_settings(&mut self) -> Option<ImageSettings> {
        let mut settings = ImageSettings::default();
        let mut got_anything = false;

        loop {
            self.eat_whitespace();
            let Some(token) = self.next() else { break };

            match token.kind {
                TokenKind::Number => {
                    let n: u32 = token.text.parse().unwrap_or(u32::MAX);

                    // a number reads as the size bound when a word follows,
                    // otherwise as quality
                    if self.peek_past_whitespace().map(|t| t.kind) == Some(TokenKind::Word) {
                        settings.max_size = n;
                    } else {
                        settings.quality = n.min(100) as u8;
                    }
                    got_anything = true;
                }

                TokenKind::Word => {
                    let field = token.text;

                    if let Some(rest) = field.strip_prefix('x')
                        && !rest.is_empty()
                        && rest.bytes().all(|b| b.is_ascii_digit())
                    {
                        settings.height = rest.parse().unwrap_or(u32::MAX);
                        got_anything = true;
                        continue;
                    }

                    match field {
                        "png" => settings.codec = Some(crate::config::ImageCodec::Png),
                        "webp" => settings.codec = Some(crate::config::ImageCodec::Webp),
                        "jpeg" | "jpg" => settings.codec = Some(crate::config::ImageCodec::Jpg),
                        _ => {
                            self.errors.push_pos(
                                Severity::ParserFailure,
                                token.pos.clone(),
                                format!("image format {field:?} is unsupported"),
                            );
                            self.unwind = true;
                            break;
                        }
                    }
                    got_anything = true;
                }

                _ => {
                    self.step_back();
                    break;
                }
            }
        }

        got_anything.then_some(settings)
    }

    // ------------------------------------------------------------------
    // comments and raw blocks
    // ------------------------------------------------------------------

    /// Skip to the end of a `/ comment`, following any block it opens.
    fn eat_comment(&mut self) {
        self.eat_whitespace();

        let mut depth = 0i32;
        let mut is_escaped = false;
        let mut passed_newline = false;

        while let Some(token) = self.stream.get(self.index) {
            if token.kind == TokenKind::Escape {
                is_escaped = true;
                self.index += 1;
                continue;
            }

            match token.kind {
                TokenKind::Newline => passed_newline = true,
                TokenKind::BraceOpen if !is_escaped => depth += 1,
                TokenKind::BraceClose => {
                    if !is_escaped {
                        depth -= 1;
                    }
                    passed_newline = false;
                }
                TokenKind::Eof => return,
                _ => {}
            }

            if passed_newline && depth <= 0 {
                return;
            }

            is_escaped = false;
            self.index += 1;
        }
    }

    /// Consume a brace-balanced raw block. `intact_html` keeps angle
    /// brackets and ampersands untouched.
    fn parse_raw_block(&mut self, intact_html: bool, pos: crate::errors::Position) -> Ast {
        let mut buffer = String::with_capacity(512);
        let mut balance = 1i32;
        let mut is_escaped = false;

        while let Some(token) = self.stream.get(self.index) {
            self.index += 1;

            if token.kind == TokenKind::Escape {
                is_escaped = true;
                continue;
            }

            if !intact_html {
                match token.kind {
                    TokenKind::AngleOpen => {
                        buffer.push_str("&lt;");
                        is_escaped = false;
                        continue;
                    }
                    TokenKind::AngleClose => {
                        buffer.push_str("&gt;");
                        is_escaped = false;
                        continue;
                    }
                    TokenKind::Ampersand => {
                        // an ampersand opening an entity (&amp;) stays
                        let next_is_word = self
                            .stream
                            .get(self.index)
                            .is_some_and(|t| t.kind == TokenKind::Word);
                        if !next_is_word {
                            buffer.push_str("&amp;");
                            is_escaped = false;
                            continue;
                        }
                    }
                    _ => {}
                }
            }

            match token.kind {
                TokenKind::BraceOpen if !is_escaped => balance += 1,
                TokenKind::BraceClose if !is_escaped => {
                    balance -= 1;
                    if balance <= 0 {
                        break;
                    }
                }
                TokenKind::Eof => break,
                _ => {}
            }

            buffer.push_str(token.text);
            is_escaped = false;
        }

        Ast::raw(pos, crate::text::reindent_text(&buffer))
    }
}
