//! Project scaffolding for `spindle init`.

use crate::config;
use anyhow::{Context, Result, bail};
use std::fs;
use std::path::Path;

const DEFAULT_CONFIG: &str = r#"# spindle configuration

# domain = "https://example.com"
port = 3011

draft_marker = "_"
tag_path = "tag"

image_quality = 90
# image_max_size = 1600
# image_format = "webp"
# image_rewrite_extensions = ["jpg", "png"]

[dates]
long = "MMMM D, YYYY"
"#;

/// The default template carries a small markdown emulation in user
/// space: headings, paragraphs, lists, images and inline formatting are
/// all plain declarations the user can change or delete.
const MAIN_TEMPLATE: &str = r#"/ markdown emulation
/ headings
[#]      = <h1 id="%%:unique_slug">%%</h1>
[##]     = <h2 id="%%:unique_slug">%%</h2>
[###]    = <h3 id="%%:unique_slug">%%</h3>
[####]   = <h4 id="%%:unique_slug">%%</h4>
[#####]  = <h5 id="%%:unique_slug">%%</h5>
[######] = <h6 id="%%:unique_slug">%%</h6>

/ "default" wraps any regular line with no leading token
[default] = <p>%%</p>

/ images
[!] = <img src="%1" alt="%2">

/ lists
{-} = <ul>%%</ul>
[-] = <li>%%</li>

{+} = <ol>%%</ol>
[+] = <li>%%</li>

/ inline formatting
[*]  = <i>%%</i>
[**] = <b>%%</b>

/ codeblocks
[code] = <pre><code>%%</code></pre>

<!DOCTYPE html>
<html>
<head>
	<meta charset="utf-8">
	<meta name="viewport" content="width=device-width, initial-scale=1">
	<title>%title</title>

	/ hotload pages during local development
	if %spindle.is_server {
		. %spindle.reload_script
	}
</head>
<body>%%</body>
</html>
"#;

const INDEX_PAGE: &str = r#"& main

title = Hello, World!

# Welcome to your new site

Edit source/index.x and refresh.
"#;

/// Create a minimal project in `root`. Refuses to touch an existing one.
pub fn scaffold(root: &Path) -> Result<()> {
    if root.join(config::SOURCE_DIR).exists() {
        bail!("a source/ directory already exists here");
    }

    for dir in [
        config::SOURCE_DIR,
        config::TEMPLATE_DIR,
        config::PARTIAL_DIR,
        config::PLATE_DIR,
        config::SCRIPT_DIR,
        config::DEFAULT_OUTPUT,
    ] {
        fs::create_dir_all(root.join(dir))
            .with_context(|| format!("failed to create {dir}"))?;
    }

    write_new(&root.join(config::CONFIG_FILE), DEFAULT_CONFIG)?;
    write_new(
        &root.join(config::TEMPLATE_DIR).join("main.x"),
        MAIN_TEMPLATE,
    )?;
    write_new(&root.join(config::SOURCE_DIR).join("index.x"), INDEX_PAGE)?;

    crate::log!("init"; "created a new project");
    Ok(())
}

fn write_new(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
