//! Change detection for the dev server.
//!
//! A once-per-second poll over the source, template and partial
//! directories. On change the affected caches reload under the site's
//! write barrier, then every connected browser gets a `reload`.

use crate::config::{GLOBAL_DECLS, PARTIAL_DIR, PLATE_DIR, SOURCE_DIR, TEMPLATE_DIR};
use crate::errors::Diagnostics;
use crate::serve::SharedSite;
use std::path::Path;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Blocking poll loop; runs on its own thread for the life of the
/// server.
pub fn watch_loop(site: &SharedSite) {
    let project_root = site.ctx.read().project_root.clone();
    let mut last_run = SystemTime::now();

    loop {
        std::thread::sleep(POLL_INTERVAL);

        if folder_has_changes(&project_root.join(SOURCE_DIR), last_run) {
            last_run = SystemTime::now();

            let mut ctx = site.ctx.write();
            match ctx.reload_tree() {
                Ok(()) => {
                    // queued taginator URLs may no longer exist
                    site.gen_pages.lock().clear();
                    drop(ctx);
                    crate::log!("watch"; "source changed, reloading");
                    site.hub.broadcast("reload");
                }
                Err(err) => crate::log!("error"; "{err:#}"),
            }
        } else if support_has_changes(&project_root, last_run) {
            last_run = SystemTime::now();

            let mut errors = Diagnostics::new();
            let mut ctx = site.ctx.write();
            ctx.reload_support(&mut errors);
            drop(ctx);

            if errors.has_errors() {
                crate::log!("watch"; "{}", errors.render_term());
            }
            crate::log!("watch"; "support files changed, reloading");
            site.hub.broadcast("reload");
        }
    }
}

fn support_has_changes(project_root: &Path, since: SystemTime) -> bool {
    folder_has_changes(&project_root.join(TEMPLATE_DIR), since)
        || folder_has_changes(&project_root.join(PARTIAL_DIR), since)
        || folder_has_changes(&project_root.join(PLATE_DIR), since)
        || file_has_changes(&project_root.join(GLOBAL_DECLS), since)
}

/// Whether anything under `root` was modified after `since`.
pub fn folder_has_changes(root: &Path, since: SystemTime) -> bool {
    if !root.exists() {
        return false;
    }

    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| {
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .is_some_and(|modified| modified > since)
        })
}

fn file_has_changes(path: &Path, since: SystemTime) -> bool {
    path.metadata()
        .and_then(|m| m.modified())
        .is_ok_and(|modified| modified > since)
}
