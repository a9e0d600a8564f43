//! AST evaluation: walks a page (through its template) within the scope
//! stack and produces the output text.
//!
//! The renderer owns everything transient about one page render: the
//! scope stack, iteration frames for `for` bodies, import bindings, the
//! unique-slug registry and the tag set a taginator page discovers. All
//! cross-page state (finder cache, generated-output queues, diagnostics)
//! lives in the shared `BuildState`.

use crate::date::Date;
use crate::errors::{Position, Severity};
use crate::finder::{find_directory, find_file};
use crate::hash::*;
use crate::markup::{Ast, Exec, ExecKind, ImageSettings, Modifier, PathType, Var};
use crate::scope::{Frame, ScopeStack, Slot, selected_template};
use crate::site::{
    BuildState, Context, GenImage, GenPage, Page, PlateSlot, gen_image_rel, image_key,
    resolve_plate,
};
use crate::text::{join_url, make_element_id, make_title};
use crate::tree::{FileType, NodeId};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

const SPINDLE_URL: u32 = new_hash("spindle.url");
const SPINDLE_URL_PRETTY: u32 = new_hash("spindle.url_pretty");
const SPINDLE_IS_SERVER: u32 = new_hash("spindle.is_server");
const SPINDLE_RELOAD_SCRIPT: u32 = new_hash("spindle.reload_script");
const TAGINATOR_TAG: u32 = new_hash("taginator.tag");
const TAGINATOR_URL: u32 = new_hash("taginator.url");

/// Render-recursion ceiling; a declaration referring to itself trips this
/// instead of blowing the stack.
const MAX_DEPTH: u32 = 64;

/// Per-iteration context for `for` bodies over pages.
struct IterationFrame {
    scope: Arc<Frame>,
    slug: String,
    url: String,
    date: String,
}

pub struct Renderer<'a> {
    ctx: &'a Context,
    state: &'a mut BuildState,
    page: &'a Page,
    scope: ScopeStack,
    iterations: Vec<IterationFrame>,
    imports: FxHashMap<u32, Arc<Frame>>,
    slugs: FxHashMap<String, usize>,
    /// Grouping field when the page declares a taginator.
    tag_field: Option<u32>,
    discovered: BTreeSet<String>,
    depth: u32,
    depth_reported: bool,
}

/// Render one page to its final text, regex rewrites applied. Taginator
/// pages additionally queue their generated outputs on `state`.
pub fn render_page(ctx: &Context, state: &mut BuildState, page: &Page) -> String {
    let mut renderer = Renderer {
        ctx,
        state,
        page,
        scope: ScopeStack::new(),
        iterations: Vec::new(),
        imports: FxHashMap::default(),
        slugs: FxHashMap::default(),
        tag_field: None,
        discovered: BTreeSet::new(),
        depth: 0,
        depth_reported: false,
    };

    let out = renderer.run();
    crate::config::apply_rewrites(&ctx.rewrites, out)
}

impl<'a> Renderer<'a> {
    fn run(&mut self) -> String {
        self.scope.push_frame(self.ctx.globals.clone());
        self.push_reserved_frame();
        self.push_support_frame();
        self.scope.push_frame(frame_from_arc(&self.page.scope));

        // taginator setup: the declaration names the grouping field
        if let Some(slot) = self.page.scope.get(&TAGINATOR_HASH) {
            let field = literal_text(&slot.value);
            if field.is_empty() {
                self.state.errors.push(
                    Severity::RenderFailure,
                    "taginator declaration names no field",
                );
            } else {
                self.tag_field = Some(new_hash(&field));
            }
        }

        if let Some(tag) = self.page.tag.clone() {
            let pos = self.synthetic_pos();
            self.scope
                .declare(IT_HASH, Slot::text(pos.clone(), tag.as_str()));
            self.scope
                .declare(TAGINATOR_TAG, Slot::text(pos.clone(), tag.as_str()));
            self.scope.declare(
                TAGINATOR_URL,
                Slot::text(pos, self.ctx.tag_url(self.page.node, &tag)),
            );
        }

        let mut out = String::with_capacity(4096);

        match selected_template(&self.page.ast) {
            Some(hash) => match self.ctx.templates.get(&hash) {
                Some(template) => {
                    let template = template.clone();
                    // the page body splices in wherever the template
                    // reads %%
                    self.scope.push_blank();
                    self.scope
                        .declare(BASE_HASH, Slot::new(self.page.ast.clone()));
                    self.render_nodes(&template.ast, &mut out, false);
                    self.scope.pop();
                }
                None => {
                    let pos = self
                        .page
                        .ast
                        .iter()
                        .find(|n| matches!(n, Ast::Template { .. }))
                        .map(|n| n.pos().clone())
                        .unwrap_or_else(|| self.synthetic_pos());
                    self.state.errors.push_pos(
                        Severity::RenderFailure,
                        pos,
                        "template does not exist",
                    );
                }
            },
            None => {
                let ast = self.page.ast.clone();
                self.render_nodes(&ast, &mut out, false);
            }
        }

        // queue one generated page per discovered tag
        if self.page.tag.is_none() && self.tag_field.is_some() {
            for tag in std::mem::take(&mut self.discovered) {
                let url = self.ctx.tag_url(self.page.node, &tag);
                let output_rel = self.ctx.tag_output_rel(self.page.node, &tag);
                self.state.gen_pages.entry(url.clone()).or_insert(GenPage {
                    node: self.page.node,
                    tag,
                    url,
                    output_rel,
                });
            }
        }

        out
    }

    fn push_reserved_frame(&mut self) {
        let pos = self.synthetic_pos();
        let url = self.ctx.page_url(self.page.node);

        self.scope.push_blank();
        self.scope
            .declare(SPINDLE_URL_PRETTY, Slot::text(pos.clone(), url.as_str()));
        self.scope.declare(
            SPINDLE_URL,
            Slot::text(pos.clone(), join_url(&self.ctx.config.domain, &url)),
        );

        if self.ctx.server_mode {
            self.scope
                .declare(SPINDLE_IS_SERVER, Slot::text(pos.clone(), "1"));
            self.scope.declare(
                SPINDLE_RELOAD_SCRIPT,
                Slot::text(pos, crate::serve::RELOAD_SCRIPT),
            );
        }
    }

    /// Plate declarations under template declarations, one frame.
    fn push_support_frame(&mut self) {
        let mut frame = Frame::default();

        if let Some(slot) = self.page.scope.get(&PLATE_HASH) {
            let name = literal_text(&slot.value);
            match resolve_plate(self.ctx, self.state, &name) {
                PlateSlot::Ready(plate) => {
                    for (&h, slot) in plate.iter() {
                        frame.insert(h, slot.clone());
                    }
                }
                PlateSlot::Missing => {
                    self.state.errors.push(
                        Severity::RenderFailure,
                        format!("plate {name:?} does not exist"),
                    );
                }
                PlateSlot::InProgress => {}
            }
        }

        if let Some(hash) = selected_template(&self.page.ast)
            && let Some(template) = self.ctx.templates.get(&hash)
        {
            for (&h, slot) in template.scope.iter() {
                frame.insert(h, slot.clone());
            }
        }

        self.scope.push_frame(frame);
    }

    fn synthetic_pos(&self) -> Position {
        Position::new(self.page.file.clone(), 0, 0, 0)
    }

    // ------------------------------------------------------------------
    // node walking
    // ------------------------------------------------------------------

    fn render_nodes(&mut self, nodes: &[Ast], out: &mut String, raw: bool) {
        if self.depth >= MAX_DEPTH {
            if !self.depth_reported {
                self.depth_reported = true;
                self.state.errors.push(
                    Severity::RenderFailure,
                    "render recursion limit reached (self-referential declaration?)",
                );
            }
            return;
        }
        self.depth += 1;

        let mut i = 0;
        while i < nodes.len() {
            match &nodes[i] {
                // consecutive same-hash tokens render as one group so a
                // brace-form wrapper declaration can enclose them
                Ast::Token { hash, .. } => {
                    let start = i;
                    while i < nodes.len()
                        && matches!(&nodes[i], Ast::Token { hash: h, .. } if h == hash)
                    {
                        i += 1;
                    }

                    let mut body = String::new();
                    for node in &nodes[start..i] {
                        if let Ast::Token {
                            hash,
                            glyphs,
                            children,
                            ..
                        } = node
                        {
                            self.render_token(*hash, glyphs, children, &mut body, raw);
                        }
                    }

                    match self.scope.lookup(hash + 1).cloned() {
                        Some(wrapper) => {
                            self.invoke(&wrapper.value, body, out, raw);
                        }
                        None => out.push_str(&body),
                    }
                    out.push('\n');
                    continue;
                }

                Ast::FormatBegin { style, .. } if !raw => {
                    let style = *style;
                    if let Some(end) = nodes[i + 1..]
                        .iter()
                        .position(|n| matches!(n, Ast::FormatEnd { style: s, .. } if *s == style))
                    {
                        let inner = self.render_to_string(&nodes[i + 1..i + 1 + end], raw);

                        match self.scope.lookup(new_hash(style.glyphs())).cloned() {
                            Some(slot) => self.invoke(&slot.value, inner, out, raw),
                            None => {
                                let (open, close) = style.fallback();
                                out.push_str(open);
                                out.push_str(&inner);
                                out.push_str(close);
                            }
                        }
                        i += end + 2;
                        continue;
                    }
                    out.push_str(style.glyphs());
                }

                node => self.render_node(node, out, raw),
            }
            i += 1;
        }

        self.depth -= 1;
    }

    fn render_node(&mut self, node: &Ast, out: &mut String, raw: bool) {
        match node {
            Ast::Text { text, .. } | Ast::Raw { text, .. } => out.push_str(text),
            Ast::Whitespace { .. } => out.push(' '),
            Ast::Blank { .. } => out.push('\n'),

            Ast::Paragraph { children, raw: is_raw, .. } => {
                let body = self.render_to_string(children, raw || *is_raw);

                if *is_raw || raw {
                    out.push_str(&body);
                } else {
                    match self.scope.lookup(DEFAULT_HASH).cloned() {
                        Some(wrapper) => self.invoke(&wrapper.value, body, out, raw),
                        None => out.push_str(&body),
                    }
                }
                out.push('\n');
            }

            Ast::Block { hash, children, .. } => {
                self.scope.push_blank();
                let body = self.render_to_string(children, raw);
                self.scope.pop();

                match (*hash != 0).then(|| self.scope.lookup(*hash).cloned()).flatten() {
                    Some(template) => self.invoke(&template.value, body, out, raw),
                    None => out.push_str(&body),
                }
            }

            Ast::Decl(d) => {
                let slot = if d.immediate {
                    let text = self.render_to_string(&d.value, raw);
                    Slot::text(d.pos.clone(), text)
                } else {
                    Slot {
                        value: d.value.clone(),
                        is_soft: d.is_soft,
                    }
                };
                self.declare_respecting_softness(d, slot);
            }

            Ast::DeclToken(d) | Ast::DeclBlock(d) => {
                let slot = Slot {
                    value: d.value.clone(),
                    is_soft: d.is_soft,
                };
                self.declare_respecting_softness(d, slot);
            }

            Ast::Var(v) => {
                let text = self.render_var(v);
                out.push_str(&text);
            }

            Ast::VarAnon { modifier, .. } => {
                if let Some(slot) = self.scope.lookup(BASE_HASH).cloned() {
                    let value = self.render_value(&slot.value, *modifier);
                    out.push_str(&self.apply_modifier(value, *modifier));
                }
            }

            Ast::VarEnum { n, modifier, .. } => {
                if let Some(slot) = self.scope.lookup(BASE_HASH).cloned() {
                    let whole = self.render_value(&slot.value, Modifier::None);
                    let word = whole
                        .split_whitespace()
                        .nth((*n as usize).saturating_sub(1))
                        .unwrap_or_default()
                        .to_owned();
                    out.push_str(&self.apply_modifier(word, *modifier));
                }
            }

            Ast::Exec(exec) => match exec.kind {
                ExecKind::Locator => {
                    let url = self.render_locator(exec);
                    out.push_str(&url);
                }
                ExecKind::Date => {
                    let text = self.render_date(exec);
                    out.push_str(&text);
                }
            },

            Ast::If(node) => {
                if self.eval_conditions(&node.conditions) != node.is_else {
                    self.render_nodes(&node.body, out, raw);
                }
            }

            Ast::For(node) => self.render_for(node, out, raw),

            Ast::Partial { hash, name, pos } => match self.ctx.partials.get(hash) {
                Some(partial) => {
                    let partial = partial.clone();
                    // the partial's own declarations fill in around the
                    // caller's scope without displacing it
                    self.scope.push_blank();
                    self.scope.merge_soft(&partial.scope);
                    self.render_nodes(&partial.ast, out, raw);
                    self.scope.pop();
                }
                None => self.state.errors.push_pos(
                    Severity::RenderFailure,
                    pos.clone(),
                    format!("partial {name:?} does not exist"),
                ),
            },

            Ast::Unset { hash, .. } => self.scope.unset(*hash),

            Ast::Import(import) => self.render_import(import),

            Ast::Script { name, children, pos, .. } => {
                let args = self.render_to_string(children, true);
                match self.ctx.scripts.as_ref().and_then(|s| s.run(name, &args)) {
                    Some(text) => out.push_str(&text),
                    None => self.state.errors.push_pos(
                        Severity::RenderWarning,
                        pos.clone(),
                        format!("script {name:?} is not available"),
                    ),
                }
            }

            // normally grouped and dispatched by render_nodes; handled here
            // for completeness if ever reached directly
            Ast::Token { hash, glyphs, children, .. } => {
                self.render_token(*hash, glyphs, children, out, raw);
            }

            // handled at page level / by enclosing constructs
            Ast::Template { .. } => {}
            Ast::OpNot { .. } | Ast::OpAnd { .. } | Ast::OpOr { .. } => {}
            Ast::FormatBegin { style, .. } | Ast::FormatEnd { style, .. } => {
                out.push_str(style.glyphs());
            }
        }
    }

    /// A declaration from a support file never displaces a page's own
    /// binding of the same name.
    fn declare_respecting_softness(&mut self, d: &crate::markup::Decl, slot: Slot) {
        if d.is_soft && self.scope.lookup(d.field).is_some_and(|existing| !existing.is_soft) {
            return;
        }
        self.scope.declare(d.field, slot);
    }

    fn render_to_string(&mut self, nodes: &[Ast], raw: bool) -> String {
        let mut out = String::new();
        self.render_nodes(nodes, &mut out, raw);
        out
    }

    /// Expand a declaration body with `%%` bound to pre-rendered text.
    fn invoke(&mut self, value: &Arc<Vec<Ast>>, body: String, out: &mut String, raw: bool) {
        self.scope.push_blank();
        let pos = self.synthetic_pos();
        self.scope.declare(BASE_HASH, Slot::text(pos, body));
        self.render_nodes(value, out, raw);
        self.scope.pop();
    }

    // ------------------------------------------------------------------
    // tokens
    // ------------------------------------------------------------------

    fn render_token(
        &mut self,
        hash: u32,
        glyphs: &str,
        children: &[Ast],
        out: &mut String,
        raw: bool,
    ) {
        let body = self.render_to_string(children, raw);

        match self.scope.lookup(hash).cloned() {
            Some(slot) => self.invoke(&slot.value, body, out, raw),
            // the plain-line token: content as-is, no wrapper
            None if hash == STOP_HASH => out.push_str(&body),
            None => {
                // no declaration teaches this glyph run; fall back to a
                // plain paragraph keeping the glyphs
                let body = format!("{glyphs} {body}");
                match self.scope.lookup(DEFAULT_HASH).cloned() {
                    Some(wrapper) => self.invoke(&wrapper.value, body, out, raw),
                    None => out.push_str(&body),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // variables
    // ------------------------------------------------------------------

    fn render_var(&mut self, v: &Var) -> String {
        match self.resolve_var(v) {
            Some(Resolved::Slot(slot)) => {
                let text = self.render_value(&slot.value, v.modifier);
                self.apply_modifier(text, v.modifier)
            }
            Some(Resolved::Text(text)) => self.apply_modifier(text, v.modifier),
            None => {
                // only plain names warn: dotted lookups routinely probe
                // optional fields of iterated or imported pages
                if v.taxonomy == 0 {
                    self.state.errors.push_pos(
                        Severity::RenderWarning,
                        v.pos.clone(),
                        format!("variable {:?} is not declared", v.name),
                    );
                }
                String::new()
            }
        }
    }

    fn resolve_var(&self, v: &Var) -> Option<Resolved> {
        if v.taxonomy == IT_HASH
            && let Some(iter) = self.iterations.last()
        {
            return match v.subname {
                INFO_SLUG_HASH => Some(Resolved::Text(iter.slug.clone())),
                INFO_URL_HASH => Some(Resolved::Text(iter.url.clone())),
                INFO_DATE_HASH => Some(Resolved::Text(iter.date.clone())),
                sub => iter.scope.get(&sub).cloned().map(Resolved::Slot),
            };
        }

        if v.taxonomy != 0
            && let Some(imported) = self.imports.get(&v.taxonomy)
        {
            return imported.get(&v.subname).cloned().map(Resolved::Slot);
        }

        self.scope.lookup(v.field).cloned().map(Resolved::Slot)
    }

    fn render_value(&mut self, value: &Arc<Vec<Ast>>, modifier: Modifier) -> String {
        self.scope.push_blank();
        let text = self.render_to_string(value, modifier == Modifier::Raw);
        self.scope.pop();
        text
    }

    fn apply_modifier(&mut self, text: String, modifier: Modifier) -> String {
        match modifier {
            Modifier::None | Modifier::Raw => text,
            Modifier::Slug => make_element_id(&text),
            Modifier::UniqueSlug => {
                let base = make_element_id(&text);
                let count = self.slugs.entry(base.clone()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    base
                } else {
                    format!("{base}-{count}")
                }
            }
            Modifier::Upper => text.to_uppercase(),
            Modifier::Lower => text.to_lowercase(),
            Modifier::Title => make_title(&text),
        }
    }

    // ------------------------------------------------------------------
    // conditions
    // ------------------------------------------------------------------

    fn eval_conditions(&mut self, list: &[Ast]) -> bool {
        let mut result: Option<bool> = None;
        let mut or_pending = false;
        let mut negate = false;

        for node in list {
            match node {
                Ast::OpNot { .. } => negate = !negate,
                Ast::OpAnd { .. } => or_pending = false,
                Ast::OpOr { .. } => or_pending = true,
                Ast::Var(v) => {
                    let value = self.var_truthy(v) != negate;
                    negate = false;

                    result = Some(match result {
                        None => value,
                        Some(r) if or_pending => r || value,
                        Some(r) => r && value,
                    });
                }
                _ => {}
            }
        }

        result.unwrap_or(false)
    }

    /// A variable is truthy when present and not the literal `0`.
    fn var_truthy(&mut self, v: &Var) -> bool {
        match self.resolve_var(v) {
            Some(Resolved::Slot(slot)) => {
                let text = self.render_value(&slot.value, Modifier::None);
                text.trim() != "0"
            }
            Some(Resolved::Text(text)) => text.trim() != "0",
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // exec: locator
    // ------------------------------------------------------------------

    fn render_locator(&mut self, exec: &Exec) -> String {
        let query = self.render_to_string(&exec.target, true).trim().to_owned();

        if query.contains("://") {
            return query;
        }

        let Some(node) = find_file(
            &self.ctx.tree,
            self.ctx.tree.root,
            &query,
            &mut self.state.finder_cache,
        ) else {
            self.state.errors.push_pos(
                Severity::RenderFailure,
                exec.pos.clone(),
                format!("could not find {query:?}"),
            );
            return String::new();
        };

        let file = self.ctx.tree.node(node);

        if file.is_draft && !self.ctx.build_drafts {
            self.state.errors.push_pos(
                Severity::RenderWarning,
                exec.pos.clone(),
                format!("{:?} is a draft", file.path),
            );
        }

        let url = if file.file_type.is_image() {
            match self.image_settings_for(exec) {
                Some(settings) => {
                    let rel = self.queue_gen_image(node, settings);
                    format!("/{rel}")
                }
                None => format!("/{}", self.ctx.tree.source_relative(node)),
            }
        } else {
            self.ctx.page_url(node)
        };

        match exec.path_type {
            PathType::Rooted => url,
            PathType::Absolute => join_url(&self.ctx.config.domain, &url),
            PathType::Relative => {
                let from = self.ctx.page_url(self.page.node);
                make_relative(&from, &url)
            }
        }
    }

    /// Explicit settings win; otherwise the configuration's image
    /// defaults apply when any are set.
    fn image_settings_for(&self, exec: &Exec) -> Option<ImageSettings> {
        if let Some(mut settings) = exec.settings {
            if settings.quality == 0 {
                settings.quality = self.ctx.config.image_quality;
            }
            if settings.codec.is_none() {
                settings.codec = self.ctx.config.image_format;
            }
            return Some(settings);
        }

        let config = &self.ctx.config;
        let any = config.image_quality > 0 || config.image_max_size > 0 || config.image_format.is_some();
        any.then_some(ImageSettings {
            max_size: config.image_max_size,
            height: 0,
            quality: config.image_quality,
            codec: config.image_format,
        })
    }

    fn queue_gen_image(&mut self, node: NodeId, settings: ImageSettings) -> String {
        let source_rel = self.ctx.tree.source_relative(node).to_owned();
        let output_rel = gen_image_rel(&source_rel, &settings);
        let key = image_key(&source_rel, &settings);

        self.state.gen_images.entry(key).or_insert(GenImage {
            node,
            settings,
            output_rel: output_rel.clone(),
        });

        output_rel
    }

    // ------------------------------------------------------------------
    // exec: date
    // ------------------------------------------------------------------

    fn render_date(&mut self, exec: &Exec) -> String {
        let Some(pattern) = self
            .ctx
            .config
            .date_format(exec.format.as_deref())
            .map(str::to_owned)
        else {
            self.state.errors.push_pos(
                Severity::RenderFailure,
                exec.pos.clone(),
                format!(
                    "date format {:?} is not configured",
                    exec.format.as_deref().unwrap_or_default()
                ),
            );
            return String::new();
        };

        let query = self.render_to_string(&exec.target, true).trim().to_owned();

        let source = if query.is_empty() {
            self.scope
                .lookup(DATE_HASH)
                .map(|slot| literal_text(&slot.value))
        } else {
            let node = find_file(
                &self.ctx.tree,
                self.ctx.tree.root,
                &query,
                &mut self.state.finder_cache,
            );
            match node {
                Some(node) => self
                    .ctx
                    .load_page(node, &mut self.state.errors)
                    .and_then(|p| p.scope.get(&DATE_HASH).map(|s| literal_text(&s.value))),
                None => {
                    self.state.errors.push_pos(
                        Severity::RenderFailure,
                        exec.pos.clone(),
                        format!("could not find {query:?}"),
                    );
                    return String::new();
                }
            }
        };

        let Some(text) = source.filter(|t| !t.is_empty()) else {
            self.state.errors.push_pos(
                Severity::RenderWarning,
                exec.pos.clone(),
                "no date declared",
            );
            return String::new();
        };

        match Date::parse(&text) {
            Some(date) => date.format(&pattern),
            None => {
                self.state.errors.push_pos(
                    Severity::RenderFailure,
                    exec.pos.clone(),
                    format!("{text:?} is not a date"),
                );
                String::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // for loops
    // ------------------------------------------------------------------

    fn render_for(&mut self, node: &crate::markup::ast::ForNode, out: &mut String, raw: bool) {
        match &node.source {
            Ast::Exec(exec) if exec.kind == ExecKind::Locator => {
                let query = self.render_to_string(&exec.target, true).trim().to_owned();

                let Some(dir) = find_directory(
                    &self.ctx.tree,
                    self.ctx.tree.root,
                    &query,
                    &mut self.state.finder_cache,
                ) else {
                    self.state.errors.push_pos(
                        Severity::RenderFailure,
                        exec.pos.clone(),
                        format!("could not find {query:?} to iterate"),
                    );
                    return;
                };

                if self.ctx.tree.node(dir).file_type != FileType::Directory {
                    self.state.errors.push_pos(
                        Severity::RenderFailure,
                        exec.pos.clone(),
                        format!("{query:?} is not a directory"),
                    );
                    return;
                }

                let children: Vec<NodeId> = self.ctx.tree.node(dir).children.clone();
                for child in children {
                    let file = self.ctx.tree.node(child);
                    if file.file_type != FileType::Markup || child == self.page.node {
                        continue;
                    }
                    if file.is_draft && !self.ctx.build_drafts {
                        continue;
                    }

                    let Some(child_page) = self.ctx.load_page(child, &mut self.state.errors)
                    else {
                        continue;
                    };
                    file.mark_used();

                    if !self.admit_tagged(&child_page.scope) {
                        continue;
                    }

                    let stem = {
                        let base = file.base_name();
                        base.rfind('.').map(|d| &base[..d]).unwrap_or(base).to_owned()
                    };
                    let url = self.ctx.page_url(child);
                    let date = child_page
                        .scope
                        .get(&DATE_HASH)
                        .map(|s| literal_text(&s.value))
                        .unwrap_or_default();

                    self.iterations.push(IterationFrame {
                        scope: child_page.scope.clone(),
                        slug: make_element_id(&stem),
                        url: join_url(&self.ctx.config.domain, &url),
                        date,
                    });
                    self.scope.push_blank();
                    self.render_nodes(&node.body, out, raw);
                    self.scope.pop();
                    self.iterations.pop();
                }
            }

            source => {
                let words: Vec<String> = match source {
                    Ast::Var(v) => match self.resolve_var(v) {
                        Some(Resolved::Slot(slot)) => {
                            let text = self.render_value(&slot.value, Modifier::None);
                            text.split_whitespace().map(str::to_owned).collect()
                        }
                        Some(Resolved::Text(text)) => {
                            text.split_whitespace().map(str::to_owned).collect()
                        }
                        None => Vec::new(),
                    },
                    Ast::VarAnon { .. } | Ast::VarEnum { .. } => {
                        match self.scope.lookup(BASE_HASH).cloned() {
                            Some(slot) => {
                                let text = self.render_value(&slot.value, Modifier::None);
                                text.split_whitespace().map(str::to_owned).collect()
                            }
                            None => Vec::new(),
                        }
                    }
                    _ => Vec::new(),
                };

                for word in words {
                    let pos = self.synthetic_pos();
                    self.scope.push_blank();
                    self.scope
                        .declare(IT_HASH, Slot::text(pos.clone(), word.as_str()));
                    self.scope.declare(BASE_HASH, Slot::text(pos, word.as_str()));
                    self.render_nodes(&node.body, out, raw);
                    self.scope.pop();
                }
            }
        }
    }

    /// Taginator bookkeeping for one candidate page: collect its tags on
    /// a base render, filter it on a tag pass. Non-taginator pages admit
    /// everything.
    fn admit_tagged(&mut self, child_scope: &Frame) -> bool {
        let Some(field) = self.tag_field else {
            return true;
        };

        if child_scope.contains_key(&TAGINATOR_HASH) {
            self.state.errors.push(
                Severity::RenderFailure,
                "nested taginators are not supported",
            );
            return false;
        }

        let tags: Vec<String> = child_scope
            .get(&field)
            .map(|slot| {
                literal_text(&slot.value)
                    .split_whitespace()
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        match &self.page.tag {
            Some(active) => tags.iter().any(|t| t == active),
            None => {
                self.discovered.extend(tags);
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // imports
    // ------------------------------------------------------------------

    fn render_import(&mut self, import: &crate::markup::ast::ImportNode) {
        let query = self.render_to_string(&import.target, true).trim().to_owned();

        let Some(node) = find_file(
            &self.ctx.tree,
            self.ctx.tree.root,
            &query,
            &mut self.state.finder_cache,
        ) else {
            self.state.errors.push_pos(
                Severity::RenderFailure,
                import.pos.clone(),
                format!("import could not find {query:?}"),
            );
            return;
        };

        if self.ctx.tree.node(node).file_type != FileType::Markup {
            self.state.errors.push_pos(
                Severity::RenderFailure,
                import.pos.clone(),
                format!("import {query:?} is not a page"),
            );
            return;
        }

        let Some(page) = self.ctx.load_page(node, &mut self.state.errors) else {
            self.state.errors.push_pos(
                Severity::RenderFailure,
                import.pos.clone(),
                format!("import {query:?} could not be read"),
            );
            return;
        };

        if self.tag_field.is_some() {
            self.admit_tagged(&page.scope);
        }

        self.imports.insert(import.hash, page.scope);
    }
}

enum Resolved {
    Slot(Slot),
    Text(String),
}

fn frame_from_arc(frame: &Arc<Frame>) -> Frame {
    frame.as_ref().clone()
}

/// Concatenated literal content of a declaration value, for names, tags
/// and dates where nested markup makes no sense.
fn literal_text(value: &[Ast]) -> String {
    let mut out = String::new();
    for node in value {
        match node {
            Ast::Text { text, .. } | Ast::Raw { text, .. } => out.push_str(text),
            Ast::Whitespace { .. } => out.push(' '),
            _ => {}
        }
    }
    out.trim().to_owned()
}

/// Relative URL from one site-rooted page to another.
fn make_relative(from_page: &str, to: &str) -> String {
    let from_dir = match from_page.rfind('/') {
        Some(0) | None => "",
        Some(split) => &from_page[1..split],
    };

    let to = to.trim_start_matches('/');

    let mut from_parts: Vec<&str> = from_dir.split('/').filter(|s| !s.is_empty()).collect();
    let mut to_parts: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();

    while !from_parts.is_empty() && !to_parts.is_empty() && from_parts[0] == to_parts[0] {
        from_parts.remove(0);
        to_parts.remove(0);
    }

    let mut parts: Vec<String> = from_parts.iter().map(|_| "..".to_owned()).collect();
    parts.extend(to_parts.iter().map(|s| (*s).to_owned()));

    if parts.is_empty() {
        ".".to_owned()
    } else {
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::errors::Diagnostics;
    use crate::tree::tests::project;

    /// Build a context from on-disk files and render one page.
    fn render(
        files: &[(&str, &str)],
        page_path: &str,
    ) -> (String, Diagnostics) {
        render_tagged(files, page_path, None)
    }

    fn render_tagged(
        files: &[(&str, &str)],
        page_path: &str,
        tag: Option<&str>,
    ) -> (String, Diagnostics) {
        let dir = project(files);
        let mut errors = Diagnostics::new();
        let config = Config::load(dir.path()).unwrap();
        let ctx = Context::load(dir.path(), config, None, &mut errors).unwrap();
        let mut state = BuildState::new();
        state.errors = errors;

        let node = ctx
            .tree
            .ids()
            .find(|&id| ctx.tree.node(id).path == page_path)
            .expect("page exists");
        let mut page = ctx.load_page(node, &mut state.errors).unwrap();
        page.tag = tag.map(str::to_owned);

        let out = render_page(&ctx, &mut state, &page);
        (out, state.errors)
    }

    #[test]
    fn test_declaration_substitutes_verbatim() {
        let (out, errors) = render(
            &[("source/index.x", "x = a literal value\n%x")],
            "source/index.x",
        );
        assert!(!errors.has_failures());
        assert!(out.contains("a literal value"));
    }

    #[test]
    fn test_template_wraps_body() {
        let (out, errors) = render(
            &[
                ("source/index.x", "& main\n\ntitle = Hello\n\nbody text"),
                (
                    "config/templates/main.x",
                    "<title>%title</title><body>%%</body>",
                ),
            ],
            "source/index.x",
        );
        assert!(!errors.has_failures(), "{}", errors.render_term());
        assert!(out.contains("<title>Hello</title>"));
        assert!(out.contains("<body>"));
        assert!(out.contains("body text"));
    }

    #[test]
    fn test_missing_template_fails() {
        let (_, errors) = render(&[("source/index.x", "& ghost\n\nhi")], "source/index.x");
        assert!(errors.has_failures());
    }

    #[test]
    fn test_user_token() {
        let (out, errors) = render(
            &[(
                "source/index.x",
                "[##] = <h2>%%</h2>\n\n## Alpha",
            )],
            "source/index.x",
        );
        assert!(!errors.has_failures());
        assert!(out.contains("<h2>Alpha</h2>"));
    }

    #[test]
    fn test_user_token_from_global_config() {
        let (out, _) = render(
            &[
                ("source/index.x", "## Alpha"),
                ("config/spindle.x", "[##] = <h2>%%</h2>"),
            ],
            "source/index.x",
        );
        assert!(out.contains("<h2>Alpha</h2>"));
    }

    #[test]
    fn test_heading_with_unique_slug() {
        let (out, _) = render(
            &[(
                "source/index.x",
                "[#] = <h1 id=\"%%:slug\">%%</h1>\n\n# Hi",
            )],
            "source/index.x",
        );
        assert!(out.contains("<h1 id=\"hi\">Hi</h1>"));
    }

    #[test]
    fn test_unique_slug_counters() {
        let (out, _) = render(
            &[(
                "source/index.x",
                "[#] = <a id=\"%%:unique_slug\"></a>\n\n# Same\n# Same",
            )],
            "source/index.x",
        );
        assert!(out.contains("id=\"same\""));
        assert!(out.contains("id=\"same-2\""));
    }

    #[test]
    fn test_token_run_wrapper() {
        let (out, _) = render(
            &[(
                "source/index.x",
                "{-} = <ul>%%</ul>\n[-] = <li>%%</li>\n\n- one\n- two",
            )],
            "source/index.x",
        );
        assert!(out.contains("<ul>"));
        assert_eq!(out.matches("<li>").count(), 2);
        assert!(out.contains("<li>one</li>"));
        assert!(out.contains("<li>two</li>"));
        // one list, not two
        assert_eq!(out.matches("<ul>").count(), 1);
    }

    #[test]
    fn test_default_paragraph_wrapper() {
        let (out, _) = render(
            &[(
                "source/index.x",
                "[default] = <p>%%</p>\n\njust a line",
            )],
            "source/index.x",
        );
        assert!(out.contains("<p>just a line</p>"));
    }

    #[test]
    fn test_raw_paragraph_skips_wrapper() {
        let (out, _) = render(
            &[(
                "source/index.x",
                "[default] = <p>%%</p>\n\n<div>markup line</div>",
            )],
            "source/index.x",
        );
        assert!(out.contains("<div>markup line</div>"));
        assert!(!out.contains("<p><div>"));
    }

    #[test]
    fn test_if_else() {
        let source = "if %draft {\nDRAFT\n}\nelse {\nLIVE\n}";

        let (out, errors) = render(&[("source/index.x", source)], "source/index.x");
        assert!(!errors.has_failures());
        assert!(out.contains("LIVE"));
        assert!(!out.contains("DRAFT"));

        let with_draft = format!("draft = 1\n\n{source}");
        let (out, _) = render(&[("source/index.x", &with_draft)], "source/index.x");
        assert!(out.contains("DRAFT"));
        assert!(!out.contains("LIVE"));
    }

    #[test]
    fn test_if_zero_is_falsy() {
        let (out, _) = render(
            &[("source/index.x", "x = 0\n\nif %x {\nYES\n}\nelse {\nNO\n}")],
            "source/index.x",
        );
        assert!(out.contains("NO"));
    }

    #[test]
    fn test_if_operators() {
        let (out, _) = render(
            &[(
                "source/index.x",
                "a = 1\n\nif %a + %missing {\nAND\n}\nif %a | %missing {\nOR\n}\nif !%missing {\nNOT\n}",
            )],
            "source/index.x",
        );
        assert!(!out.contains("AND"));
        assert!(out.contains("OR"));
        assert!(out.contains("NOT"));
    }

    #[test]
    fn test_finder_link_rooted() {
        let (out, errors) = render(
            &[
                ("source/index.x", "%{find posts/hello}"),
                ("source/posts/hello.x", "title = Post"),
            ],
            "source/index.x",
        );
        assert!(!errors.has_failures(), "{}", errors.render_term());
        assert!(out.contains("/posts/hello"));
    }

    #[test]
    fn test_finder_link_absolute() {
        let (out, _) = render(
            &[
                ("source/index.x", "%{link:abs posts/hello}"),
                ("source/posts/hello.x", ""),
                ("config/spindle.toml", "domain = \"https://example.com\""),
            ],
            "source/index.x",
        );
        assert!(out.contains("https://example.com/posts/hello"));
    }

    #[test]
    fn test_finder_link_relative() {
        let (out, _) = render(
            &[
                ("source/posts/a.x", "%{find:rel posts/b}"),
                ("source/posts/b.x", ""),
            ],
            "source/posts/a.x",
        );
        assert!(out.contains('b'));
        assert!(!out.contains("/posts/b"));
    }

    #[test]
    fn test_finder_miss_is_failure() {
        let (_, errors) = render(
            &[("source/index.x", "%{find nothing/here}")],
            "source/index.x",
        );
        assert!(errors.has_failures());
    }

    #[test]
    fn test_external_url_passthrough() {
        let (out, errors) = render(
            &[("source/index.x", "%{link https://other.net/x}")],
            "source/index.x",
        );
        assert!(!errors.has_failures());
        assert!(out.contains("https://other.net/x"));
    }

    #[test]
    fn test_image_link_queues_generated_image() {
        let dir = project(&[
            ("source/index.x", "%{find pic.jpg 600 x400 webp}"),
            ("source/pic.jpg", "fakebytes"),
        ]);
        let mut errors = Diagnostics::new();
        let config = Config::load(dir.path()).unwrap();
        let ctx = Context::load(dir.path(), config, None, &mut errors).unwrap();
        let mut state = BuildState::new();

        let node = ctx
            .tree
            .ids()
            .find(|&id| ctx.tree.node(id).path == "source/index.x")
            .unwrap();
        let page = ctx.load_page(node, &mut state.errors).unwrap();
        let out = render_page(&ctx, &mut state, &page);

        assert_eq!(state.gen_images.len(), 1);
        let r#gen = state.gen_images.values().next().unwrap();
        assert!(r#gen.output_rel.ends_with(".webp"));
        assert!(out.contains(&format!("/{}", r#gen.output_rel)));
    }

    #[test]
    fn test_raw_and_html_blocks() {
        let (out, _) = render(
            &[(
                "source/index.x",
                "x raw {\n<b>&</b>\n}\ny html {\n<b>&</b>\n}\n%x\n%y",
            )],
            "source/index.x",
        );
        assert!(out.contains("&lt;b&gt;&amp;&lt;/b&gt;"));
        assert!(out.contains("<b>&</b>"));
    }

    #[test]
    fn test_modifiers() {
        let (out, _) = render(
            &[(
                "source/index.x",
                "x = mixed Case words\n%x:upper\n%x:lower\n%x:title\n%x:slug",
            )],
            "source/index.x",
        );
        assert!(out.contains("MIXED CASE WORDS"));
        assert!(out.contains("mixed case words"));
        assert!(out.contains("Mixed Case Words"));
        assert!(out.contains("mixed-case-words"));
    }

    #[test]
    fn test_missing_variable_warns() {
        let (out, errors) = render(&[("source/index.x", "a %missing b")], "source/index.x");
        assert!(errors.has_errors());
        assert!(!errors.has_failures());
        assert!(out.contains("a  b"));
    }

    #[test]
    fn test_unset_removes_binding() {
        let (out, _) = render(
            &[(
                "source/index.x",
                "x = value\n\n* x\n\nif %x {\nSTILL\n}\nelse {\nGONE\n}",
            )],
            "source/index.x",
        );
        assert!(out.contains("GONE"));
    }

    #[test]
    fn test_partial_inherits_scope() {
        let (out, errors) = render(
            &[
                ("source/index.x", "title = Front\n\n> header"),
                ("config/partials/header.x", "<h1>%title</h1>"),
            ],
            "source/index.x",
        );
        assert!(!errors.has_failures());
        assert!(out.contains("<h1>Front</h1>"));
    }

    #[test]
    fn test_missing_partial_fails() {
        let (_, errors) = render(&[("source/index.x", "> ghost")], "source/index.x");
        assert!(errors.has_failures());
    }

    #[test]
    fn test_import_binds_page_scope() {
        let (out, errors) = render(
            &[
                ("source/index.x", "~ post posts/hello\n\n<a>%post.title</a>"),
                ("source/posts/hello.x", "title = Hello Post"),
            ],
            "source/index.x",
        );
        assert!(!errors.has_failures(), "{}", errors.render_term());
        assert!(out.contains("<a>Hello Post</a>"));
    }

    #[test]
    fn test_for_over_declaration_words() {
        let (out, _) = render(
            &[(
                "source/index.x",
                "tags = alpha beta\n\nfor %tags {\n<li>%it</li>\n}",
            )],
            "source/index.x",
        );
        assert!(out.contains("<li>alpha</li>"));
        assert!(out.contains("<li>beta</li>"));
    }

    #[test]
    fn test_for_over_directory() {
        let (out, errors) = render(
            &[
                (
                    "source/index.x",
                    "for %{find posts} {\n<li><a href=\"%it.info.url\">%it.title</a></li>\n}",
                ),
                ("source/posts/a.x", "title = First"),
                ("source/posts/b.x", "title = Second"),
            ],
            "source/index.x",
        );
        assert!(!errors.has_failures(), "{}", errors.render_term());
        assert!(out.contains(">First</a>"));
        assert!(out.contains(">Second</a>"));
        assert!(out.contains("/posts/a"));
        // deterministic order: path-sorted
        assert!(out.find("First").unwrap() < out.find("Second").unwrap());
    }

    #[test]
    fn test_for_skips_drafts() {
        let (out, _) = render(
            &[
                ("source/index.x", "for %{find posts} {\n<i>%it.title</i>\n}"),
                ("source/posts/live.x", "title = Live"),
                ("source/posts/_wip.x", "title = Wip"),
            ],
            "source/index.x",
        );
        assert!(out.contains("Live"));
        assert!(!out.contains("Wip"));
    }

    #[test]
    fn test_taginator_discovers_tags() {
        let dir = project(&[
            (
                "source/index.x",
                "taginator = tags\n\nfor %{find posts} {\n<li>%it.title</li>\n}",
            ),
            ("source/posts/a.x", "title = A\ntags = rust web"),
            ("source/posts/b.x", "title = B\ntags = rust"),
        ]);
        let mut errors = Diagnostics::new();
        let config = Config::load(dir.path()).unwrap();
        let ctx = Context::load(dir.path(), config, None, &mut errors).unwrap();
        let mut state = BuildState::new();

        let node = ctx
            .tree
            .ids()
            .find(|&id| ctx.tree.node(id).path == "source/index.x")
            .unwrap();
        let page = ctx.load_page(node, &mut state.errors).unwrap();
        let out = render_page(&ctx, &mut state, &page);

        assert!(out.contains("A") && out.contains("B"));
        assert_eq!(state.gen_pages.len(), 2);
        assert!(state.gen_pages.contains_key("/tag/rust"));
        assert!(state.gen_pages.contains_key("/tag/web"));
        let rust = &state.gen_pages["/tag/rust"];
        assert_eq!(rust.output_rel, "tag/rust/index.html");
    }

    #[test]
    fn test_taginator_pass_filters() {
        let files: &[(&str, &str)] = &[
            (
                "source/index.x",
                "taginator = tags\n\nfor %{find posts} {\n<li>%it.title</li>\n}",
            ),
            ("source/posts/a.x", "title = OnlyWeb\ntags = web"),
            ("source/posts/b.x", "title = OnlyRust\ntags = rust"),
        ];

        let (out, errors) = render_tagged(files, "source/index.x", Some("rust"));
        assert!(!errors.has_failures());
        assert!(out.contains("OnlyRust"));
        assert!(!out.contains("OnlyWeb"));
    }

    #[test]
    fn test_taginator_pass_exposes_tag() {
        let files: &[(&str, &str)] = &[
            (
                "source/index.x",
                "taginator = tags\n\n<h1>%it</h1><p>%taginator.tag</p>",
            ),
            ("source/posts/a.x", "tags = rust"),
        ];

        let (out, _) = render_tagged(files, "source/index.x", Some("rust"));
        assert!(out.contains("<h1>rust</h1>"));
        assert!(out.contains("<p>rust</p>"));
    }

    #[test]
    fn test_plate_merges_under_page() {
        let (out, errors) = render(
            &[
                (
                    "source/index.x",
                    "plate = base\ntitle = Mine\n\n<i>%title</i><i>%footer</i>",
                ),
                ("config/plates/base.x", "title = Theirs\nfooter = Base Footer"),
            ],
            "source/index.x",
        );
        assert!(!errors.has_failures());
        assert!(out.contains("<i>Mine</i>"));
        assert!(out.contains("<i>Base Footer</i>"));
    }

    #[test]
    fn test_date_from_scope() {
        let (out, errors) = render(
            &[("source/index.x", "date = 2024-06-15\n\n%{date}")],
            "source/index.x",
        );
        assert!(!errors.has_failures());
        assert!(out.contains("2024-06-15"));
    }

    #[test]
    fn test_date_named_format() {
        let (out, errors) = render(
            &[
                ("source/index.x", "date = 2024-06-15\n\n%{date:long}"),
                (
                    "config/spindle.toml",
                    "[dates]\nlong = \"MMMM D, YYYY\"",
                ),
            ],
            "source/index.x",
        );
        assert!(!errors.has_failures());
        assert!(out.contains("June 15, 2024"));
    }

    #[test]
    fn test_date_unknown_format_fails() {
        let (_, errors) = render(
            &[("source/index.x", "date = 2024-06-15\n\n%{date:bogus}")],
            "source/index.x",
        );
        assert!(errors.has_failures());
    }

    #[test]
    fn test_date_from_referenced_page() {
        let (out, _) = render(
            &[
                ("source/index.x", "%{date posts/a}"),
                ("source/posts/a.x", "date = 2020-01-02"),
            ],
            "source/index.x",
        );
        assert!(out.contains("2020-01-02"));
    }

    #[test]
    fn test_bad_date_fails() {
        let (_, errors) = render(
            &[("source/index.x", "date = whenever\n\n%{date}")],
            "source/index.x",
        );
        assert!(errors.has_failures());
    }

    #[test]
    fn test_inline_formats() {
        let (out, _) = render(
            &[("source/index.x", "some **bold** and *italic* text")],
            "source/index.x",
        );
        assert!(out.contains("<b>bold</b>"));
        assert!(out.contains("<i>italic</i>"));
    }

    #[test]
    fn test_inline_format_declaration_override() {
        let (out, _) = render(
            &[(
                "source/index.x",
                "[**] = <strong>%%</strong>\n\nvery **bold** move",
            )],
            "source/index.x",
        );
        assert!(out.contains("<strong>bold</strong>"));
    }

    #[test]
    fn test_script_without_engine_warns() {
        let (_, errors) = render(&[("source/index.x", "$ analytics run")], "source/index.x");
        assert!(errors.has_errors());
        assert!(!errors.has_failures());
    }

    #[test]
    fn test_self_referential_declaration_is_caught() {
        let (_, errors) = render(&[("source/index.x", "x = %x\n%x")], "source/index.x");
        assert!(errors.has_failures());
    }

    #[test]
    fn test_determinism() {
        let files: &[(&str, &str)] = &[
            (
                "source/index.x",
                "title = T\n\n# H\n\nfor %{find posts} {\n%it.title\n}",
            ),
            ("source/posts/a.x", "title = A"),
            ("source/posts/b.x", "title = B"),
        ];
        let (a, _) = render(files, "source/index.x");
        let (b, _) = render(files, "source/index.x");
        assert_eq!(a, b);
    }

    #[test]
    fn test_regex_rewrites_apply() {
        let (out, _) = render(
            &[
                ("source/index.x", "see [docs](/docs) now"),
                (
                    "config/spindle.toml",
                    "[[rewrites]]\npattern = '\\[(.+?)\\]\\((.+?)\\)'\ntemplate = '<a href=\"$2\">$1</a>'",
                ),
            ],
            "source/index.x",
        );
        assert!(out.contains(r#"<a href="/docs">docs</a>"#));
    }

    #[test]
    fn test_make_relative() {
        assert_eq!(make_relative("/posts/a", "/posts/b"), "b");
        assert_eq!(make_relative("/posts/a", "/about"), "../about");
        assert_eq!(make_relative("/", "/posts/b"), "posts/b");
        assert_eq!(make_relative("/a/b/c", "/a/x"), "../x");
        assert_eq!(make_relative("/posts/a", "/posts/a"), "a");
    }
}
