//! One-shot site building.
//!
//! Page rendering runs on a single thread inside a fixed-point loop:
//! rendering marks files as used and can queue generated pages, so passes
//! repeat until one makes no progress. Asset work (copy, minify, image
//! conversion) is independent per file and fans out over rayon afterwards
//! with a wait-for-all join.

use crate::assets::{
    ImagePipeline, LineFolding, Minifier, PassthroughImages, convert_image, copy_file,
    copy_minified, write_output,
};
use crate::errors::Severity;
use crate::finder::find_file;
use crate::markup::ImageSettings;
use crate::render::render_page;
use crate::site::{BuildState, Context, GenPage};
use crate::sitemap::build_sitemap;
use crate::text::join_url;
use crate::tree::{FileType, NodeId};
use anyhow::{Context as _, Result};
use rayon::prelude::*;
use std::fs;

/// Build the whole site into the output directory. Failures are recorded
/// on `state.errors`; the exit code is the caller's business.
pub fn build_site(ctx: &Context, state: &mut BuildState) -> Result<()> {
    fs::create_dir_all(&ctx.output_dir)
        .with_context(|| format!("failed to create {}", ctx.output_dir.display()))?;

    if find_file(&ctx.tree, ctx.tree.root, "index", &mut state.finder_cache).is_none() {
        state
            .errors
            .push(Severity::Failure, "a root index page is required");
        return Ok(());
    }
    let _ = find_file(
        &ctx.tree,
        ctx.tree.root,
        "favicon.ico",
        &mut state.finder_cache,
    );

    // pages settle to a fixed point: rendering can mark new files used
    // and queue generated pages
    let mut assets: Vec<NodeId> = Vec::new();
    loop {
        let done = build_pass(ctx, state, &mut assets);
        if done || state.errors.has_failures() {
            break;
        }
    }

    if !state.errors.has_failures() {
        render_generated_pages(ctx, state);
    }

    process_assets(ctx, state, &assets);

    if !ctx.skip_images {
        process_gen_images(ctx, state);
    }

    if !state.errors.has_failures() {
        write_sitemap(ctx, state)?;
    }

    Ok(())
}

/// One sweep over the tree; reports whether nothing was left to do.
fn build_pass(ctx: &Context, state: &mut BuildState, assets: &mut Vec<NodeId>) -> bool {
    let mut done = true;

    for id in ctx.tree.ids() {
        let file = ctx.tree.node(id);

        if file.file_type == FileType::Directory || file.is_built() {
            continue;
        }
        if file.is_draft && !ctx.build_drafts {
            continue;
        }
        if ctx.only_used && !file.is_used() {
            continue;
        }

        done = false;
        file.mark_built();

        match file.file_type {
            FileType::Markup => build_page(ctx, state, id),
            _ => assets.push(id),
        }

        if state.errors.has_failures() {
            break;
        }
    }

    done
}

fn build_page(ctx: &Context, state: &mut BuildState, node: NodeId) {
    let Some(page) = ctx.load_page(node, &mut state.errors) else {
        state.errors.push(
            Severity::Failure,
            format!("{:?} could not be read", ctx.tree.node(node).path),
        );
        return;
    };

    let assembled = render_page(ctx, state, &page);
    let output = ctx.output_path(node);

    if let Err(err) = write_output(&output, assembled.as_bytes()) {
        state
            .errors
            .push(Severity::Failure, format!("{err:#}"));
    }
}

fn render_generated_pages(ctx: &Context, state: &mut BuildState) {
    let mut queued: Vec<GenPage> = state.gen_pages.values().cloned().collect();
    queued.sort_by(|a, b| a.url.cmp(&b.url));

    for r#gen in queued {
        let Some(mut page) = ctx.load_page(r#gen.node, &mut state.errors) else {
            continue;
        };
        page.tag = Some(r#gen.tag.clone());

        let assembled = render_page(ctx, state, &page);
        let output = ctx.output_dir.join(&r#gen.output_rel);

        if let Err(err) = write_output(&output, assembled.as_bytes()) {
            state
                .errors
                .push(Severity::Failure, format!("{err:#}"));
            break;
        }
    }
}

/// Copy, minify or rewrite every collected asset, in parallel. Workers
/// share nothing; their failures are gathered after the join.
fn process_assets(ctx: &Context, state: &mut BuildState, assets: &[NodeId]) {
    let minifier = LineFolding;
    let pipeline = PassthroughImages;

    let failures: Vec<String> = assets
        .par_iter()
        .filter_map(|&id| process_asset(ctx, &minifier, &pipeline, id).err())
        .map(|err| format!("{err:#}"))
        .collect();

    for message in failures {
        state.errors.push(Severity::Failure, message);
    }
}

fn process_asset(
    ctx: &Context,
    minifier: &dyn Minifier,
    pipeline: &dyn ImagePipeline,
    id: NodeId,
) -> Result<()> {
    let file = ctx.tree.node(id);
    let source = ctx.tree.real_path(id);

    match file.file_type {
        FileType::Css | FileType::Scss | FileType::Javascript => {
            copy_minified(minifier, &source, &ctx.output_path(id))
        }
        t if t.is_image() && rewrites_to_codec(ctx, file.base_name()) => {
            let codec = ctx.config.image_format.expect("rewrite requires a codec");
            let settings = ImageSettings {
                max_size: ctx.config.image_max_size,
                height: 0,
                quality: ctx.config.image_quality,
                codec: Some(codec),
            };

            let rel = ctx.output_rel(id);
            let rel = match rel.rfind('.') {
                Some(dot) => format!("{}.{}", &rel[..dot], codec.extension()),
                None => rel,
            };
            convert_image(pipeline, &source, &ctx.output_dir.join(rel), &settings)
        }
        _ => copy_file(&source, &ctx.output_path(id)),
    }
}

/// Whether configuration asks for this file to be re-encoded.
fn rewrites_to_codec(ctx: &Context, base_name: &str) -> bool {
    if ctx.config.image_format.is_none() {
        return false;
    }
    let ext = base_name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    ctx.config
        .image_rewrite_extensions
        .iter()
        .any(|e| e.eq_ignore_ascii_case(&ext))
}

fn process_gen_images(ctx: &Context, state: &mut BuildState) {
    let pipeline = PassthroughImages;

    let mut queued: Vec<_> = state.gen_images.values().cloned().collect();
    queued.sort_by(|a, b| a.output_rel.cmp(&b.output_rel));

    let failures: Vec<String> = queued
        .par_iter()
        .filter_map(|r#gen| {
            let file = ctx.tree.node(r#gen.node);
            if file.is_draft && !ctx.build_drafts {
                return None;
            }

            convert_image(
                &pipeline,
                &ctx.tree.real_path(r#gen.node),
                &ctx.output_dir.join(&r#gen.output_rel),
                &r#gen.settings,
            )
            .err()
            .map(|err| format!("{err:#}"))
        })
        .collect();

    for message in failures {
        state.errors.push(Severity::Failure, message);
    }
}

fn write_sitemap(ctx: &Context, state: &mut BuildState) -> Result<()> {
    let mut urls: Vec<String> = ctx
        .tree
        .ids()
        .filter(|&id| {
            let file = ctx.tree.node(id);
            matches!(file.file_type, FileType::Markup | FileType::Html) && file.is_built()
        })
        .map(|id| join_url(&ctx.config.domain, &ctx.page_url(id)))
        .collect();

    urls.extend(
        state
            .gen_pages
            .values()
            .map(|r#gen| join_url(&ctx.config.domain, &r#gen.url)),
    );

    let xml = build_sitemap(&urls);
    write_output(&ctx.output_dir.join("sitemap.xml"), xml.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::errors::Diagnostics;
    use crate::tree::tests::project;
    use std::path::Path;

    struct Built {
        _dir: tempfile::TempDir,
        output: std::path::PathBuf,
        errors: Diagnostics,
    }

    impl Built {
        fn read(&self, rel: &str) -> String {
            fs::read_to_string(self.output.join(rel))
                .unwrap_or_else(|_| panic!("missing output {rel}"))
        }

        fn exists(&self, rel: &str) -> bool {
            self.output.join(rel).exists()
        }
    }

    fn build(files: &[(&str, &str)]) -> Built {
        build_with(files, |_| {})
    }

    fn build_with(files: &[(&str, &str)], tweak: impl FnOnce(&mut Context)) -> Built {
        let dir = project(files);
        let mut errors = Diagnostics::new();
        let config = Config::load(dir.path()).unwrap();
        let mut ctx = Context::load(dir.path(), config, None, &mut errors).unwrap();
        tweak(&mut ctx);

        let mut state = BuildState::new();
        state.errors = errors;
        build_site(&ctx, &mut state).unwrap();

        Built {
            output: ctx.output_dir.clone(),
            _dir: dir,
            errors: state.errors,
        }
    }

    #[test]
    fn test_index_with_template() {
        let built = build(&[
            (
                "source/index.x",
                "& main\n\ntitle = Hello\n\n# Hi",
            ),
            (
                "config/templates/main.x",
                "[#] = <h1 id=\"%%:unique_slug\">%%</h1>\n\n<title>%title</title><body>%%</body>",
            ),
        ]);

        assert!(!built.errors.has_failures(), "{}", built.errors.render_term());
        let html = built.read("index.html");
        assert!(html.contains("<title>Hello</title>"));
        assert!(html.contains("<h1 id=\"hi\">Hi</h1>"));
    }

    #[test]
    fn test_missing_root_index_fails() {
        let built = build(&[("source/about.x", "hi")]);
        assert!(built.errors.has_failures());
    }

    #[test]
    fn test_nested_outputs_mirror_source() {
        let built = build(&[
            ("source/index.x", "home"),
            ("source/posts/hello.x", "post body"),
            ("source/style.css", "body { margin: 0; }\n\n"),
            ("source/notes.txt", "plain"),
        ]);

        assert!(built.exists("index.html"));
        assert!(built.exists("posts/hello.html"));
        assert!(built.exists("notes.txt"));
        // css went through the minifier
        assert_eq!(built.read("style.css"), "body { margin: 0; }\n");
    }

    #[test]
    fn test_drafts_skipped_by_default() {
        let built = build(&[
            ("source/index.x", "home"),
            ("source/_wip.x", "secret"),
        ]);
        assert!(!built.exists("_wip.html"));

        let built = build_with(
            &[("source/index.x", "home"), ("source/_wip.x", "secret")],
            |ctx| ctx.build_drafts = true,
        );
        assert!(built.exists("_wip.html"));
    }

    #[test]
    fn test_only_used_prunes_and_reaches_fixed_point() {
        let files: &[(&str, &str)] = &[
            ("source/index.x", "%{find posts/linked}"),
            ("source/posts/linked.x", "reached"),
            ("source/posts/orphan.x", "unreachable"),
            ("source/unused.png", "bytes"),
        ];

        let built = build_with(files, |ctx| ctx.only_used = true);
        assert!(!built.errors.has_failures(), "{}", built.errors.render_term());
        assert!(built.exists("index.html"));
        // discovered through the finder in a later pass
        assert!(built.exists("posts/linked.html"));
        assert!(!built.exists("posts/orphan.html"));
        assert!(!built.exists("unused.png"));
    }

    #[test]
    fn test_skip_images() {
        let files: &[(&str, &str)] = &[
            ("source/index.x", "%{find pic.jpg 600 x400 webp}"),
            ("source/pic.jpg", "rawbytes"),
        ];

        let built = build_with(files, |ctx| ctx.skip_images = true);
        let generated: Vec<_> = walk_outputs(&built.output)
            .into_iter()
            .filter(|p| p.ends_with(".webp"))
            .collect();
        assert!(generated.is_empty());

        let built = build(files);
        let generated: Vec<_> = walk_outputs(&built.output)
            .into_iter()
            .filter(|p| p.ends_with(".webp"))
            .collect();
        assert_eq!(generated.len(), 1);
    }

    #[test]
    fn test_sitemap_contents_sorted() {
        let built = build(&[
            ("source/index.x", "home"),
            ("source/zebra.x", "z"),
            ("source/alpha.x", "a"),
            (
                "config/spindle.toml",
                "domain = \"https://example.com\"",
            ),
        ]);

        let xml = built.read("sitemap.xml");
        assert!(xml.contains("<loc>https://example.com/</loc>"));
        assert!(xml.contains("<loc>https://example.com/alpha</loc>"));
        let alpha = xml.find("/alpha").unwrap();
        let zebra = xml.find("/zebra").unwrap();
        assert!(alpha < zebra);
    }

    #[test]
    fn test_taginator_end_to_end() {
        let built = build(&[
            (
                "source/index.x",
                "taginator = tags\n\nfor %{find posts} {\n<li>%it.title</li>\n}",
            ),
            ("source/posts/a.x", "title = A\ntags = rust web"),
            ("source/posts/b.x", "title = B\ntags = rust"),
            ("config/spindle.toml", "domain = \"https://example.com\""),
        ]);

        assert!(!built.errors.has_failures(), "{}", built.errors.render_term());

        // one output page per distinct tag
        let rust = built.read("tag/rust/index.html");
        assert!(rust.contains("<li>A</li>"));
        assert!(rust.contains("<li>B</li>"));

        let web = built.read("tag/web/index.html");
        assert!(web.contains("<li>A</li>"));
        assert!(!web.contains("<li>B</li>"));

        // sitemap lists the generated URLs, sorted
        let xml = built.read("sitemap.xml");
        assert!(xml.contains("<loc>https://example.com/tag/rust</loc>"));
        assert!(xml.contains("<loc>https://example.com/tag/web</loc>"));
        let rust_at = xml.find("/tag/rust").unwrap();
        let web_at = xml.find("/tag/web").unwrap();
        assert!(rust_at < web_at);
    }

    #[test]
    fn test_parse_failure_reaches_exit_state() {
        let built = build(&[("source/index.x", "else {\nX\n}")]);
        assert!(built.errors.has_failures());
        assert!(!built.exists("sitemap.xml"));
    }

    #[test]
    fn test_image_rewrite_extensions() {
        let built = build(&[
            ("source/index.x", "home"),
            ("source/photo.jpg", "jpegbytes"),
            (
                "config/spindle.toml",
                "image_format = \"webp\"\nimage_rewrite_extensions = [\"jpg\"]",
            ),
        ]);

        assert!(built.exists("photo.webp"));
        assert!(!built.exists("photo.jpg"));
    }

    fn walk_outputs(root: &Path) -> Vec<String> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().display().to_string())
            .collect()
    }
}
