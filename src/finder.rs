//! Fuzzy resolution of symbolic references to file-tree nodes.
//!
//! A query like `posts/hello` matches any node whose (extension-stripped)
//! path ends in something close to it: the path must be longer than the
//! query, the edit distance may not exceed the length difference, and the
//! final path segments have to agree on first character and length. A
//! directory hit redirects to its `index` child. Results are cached per
//! build by the literal query string.

use crate::hash::INDEX_HASH;
use crate::tree::{FileTree, FileType, NodeId};
use rustc_hash::FxHashMap;

pub type FinderCache = FxHashMap<String, NodeId>;

/// Resolve `query` from `start` downward. A hit is marked as used.
pub fn find_file(
    tree: &FileTree,
    start: NodeId,
    query: &str,
    cache: &mut FinderCache,
) -> Option<NodeId> {
    if query.is_empty() {
        return None;
    }

    if let Some(&hit) = cache.get(query) {
        tree.node(hit).mark_used();
        return Some(hit);
    }

    let hit = search(tree, start, query, true)?;
    tree.node(hit).mark_used();
    cache.insert(query.to_owned(), hit);
    Some(hit)
}

/// Like [`find_file`], but a directory match returns the directory node
/// itself instead of redirecting to its `index` child. Used by `for`
/// iteration sources.
pub fn find_directory(
    tree: &FileTree,
    start: NodeId,
    query: &str,
    cache: &mut FinderCache,
) -> Option<NodeId> {
    if query.is_empty() {
        return None;
    }

    // separate keyspace: the same query resolves differently here
    let key = format!("dir:{query}");
    if let Some(&hit) = cache.get(&key) {
        tree.node(hit).mark_used();
        return Some(hit);
    }

    let hit = search(tree, start, query, false)?;
    tree.node(hit).mark_used();
    cache.insert(key, hit);
    Some(hit)
}

fn search(tree: &FileTree, start: NodeId, query: &str, redirect_index: bool) -> Option<NodeId> {
    for &child in &tree.node(start).children {
        let node = tree.node(child);
        let check = node.match_path();

        let Some(diff) = check.len().checked_sub(query.len()).filter(|d| *d > 0) else {
            continue;
        };

        if levenshtein(check, query) <= diff {
            let check_base = last_segment(check);
            let query_base = last_segment(query);

            if check_base.len() != query_base.len()
                || check_base.as_bytes().first() != query_base.as_bytes().first()
            {
                continue;
            }

            if node.file_type == FileType::Directory {
                if !redirect_index {
                    return Some(child);
                }
                return node
                    .children
                    .iter()
                    .copied()
                    .find(|&c| tree.node(c).hash_name == INDEX_HASH);
            }

            return Some(child);
        }
    }

    for &child in &tree.node(start).children {
        if tree.node(child).file_type == FileType::Directory
            && let Some(hit) = search(tree, child, query, redirect_index)
        {
            return Some(hit);
        }
    }

    None
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Classic two-row edit distance; inputs here are short paths.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;

        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }

        std::mem::swap(&mut prev, &mut current);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tree::tests::project;

    fn load(files: &[(&str, &str)]) -> (tempfile::TempDir, FileTree) {
        let dir = project(files);
        let tree = FileTree::load(dir.path(), &Config::default()).unwrap();
        (dir, tree)
    }

    fn path_of(tree: &FileTree, id: NodeId) -> &str {
        &tree.node(id).path
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("source/posts/hello", "posts/hello"), 7);
    }

    #[test]
    fn test_exact_relative_path_resolves() {
        let (_dir, tree) = load(&[
            ("source/index.x", ""),
            ("source/posts/hello.x", ""),
            ("source/posts/other.x", ""),
        ]);
        let mut cache = FinderCache::default();

        let hit = find_file(&tree, tree.root, "posts/hello", &mut cache).unwrap();
        assert_eq!(path_of(&tree, hit), "source/posts/hello.x");
    }

    #[test]
    fn test_bare_name_resolves_from_root() {
        let (_dir, tree) = load(&[("source/about.x", ""), ("source/index.x", "")]);
        let mut cache = FinderCache::default();

        let hit = find_file(&tree, tree.root, "about", &mut cache).unwrap();
        assert_eq!(path_of(&tree, hit), "source/about.x");
    }

    #[test]
    fn test_nested_lookup_descends() {
        let (_dir, tree) = load(&[("source/deep/nest/target.x", "")]);
        let mut cache = FinderCache::default();

        let hit = find_file(&tree, tree.root, "target", &mut cache).unwrap();
        assert_eq!(path_of(&tree, hit), "source/deep/nest/target.x");
    }

    #[test]
    fn test_directory_redirects_to_index() {
        let (_dir, tree) = load(&[
            ("source/posts/index.x", ""),
            ("source/posts/hello.x", ""),
        ]);
        let mut cache = FinderCache::default();

        let hit = find_file(&tree, tree.root, "posts", &mut cache).unwrap();
        assert_eq!(path_of(&tree, hit), "source/posts/index.x");
    }

    #[test]
    fn test_directory_without_index_misses() {
        let (_dir, tree) = load(&[("source/posts/hello.x", "")]);
        let mut cache = FinderCache::default();

        assert!(find_file(&tree, tree.root, "posts", &mut cache).is_none());
    }

    #[test]
    fn test_static_files_keep_extension() {
        let (_dir, tree) = load(&[("source/favicon.ico", ""), ("source/pic.jpg", "")]);
        let mut cache = FinderCache::default();

        let hit = find_file(&tree, tree.root, "favicon.ico", &mut cache).unwrap();
        assert_eq!(path_of(&tree, hit), "source/favicon.ico");

        let hit = find_file(&tree, tree.root, "pic.jpg", &mut cache).unwrap();
        assert_eq!(path_of(&tree, hit), "source/pic.jpg");
    }

    #[test]
    fn test_similar_names_do_not_cross_match() {
        let (_dir, tree) = load(&[
            ("source/posts/hello.x", ""),
            ("source/posts/hallo2.x", ""),
        ]);
        let mut cache = FinderCache::default();

        // same length and first char are required of the final segment
        let hit = find_file(&tree, tree.root, "posts/hello", &mut cache).unwrap();
        assert_eq!(path_of(&tree, hit), "source/posts/hello.x");
    }

    #[test]
    fn test_miss_returns_none() {
        let (_dir, tree) = load(&[("source/index.x", "")]);
        let mut cache = FinderCache::default();

        assert!(find_file(&tree, tree.root, "nonexistent", &mut cache).is_none());
        assert!(find_file(&tree, tree.root, "", &mut cache).is_none());
    }

    #[test]
    fn test_hit_is_marked_used_and_cached() {
        let (_dir, tree) = load(&[("source/about.x", "")]);
        let mut cache = FinderCache::default();

        let hit = find_file(&tree, tree.root, "about", &mut cache).unwrap();
        assert!(tree.node(hit).is_used());
        assert_eq!(cache.len(), 1);

        // cached path returns the same node
        let again = find_file(&tree, tree.root, "about", &mut cache).unwrap();
        assert_eq!(hit, again);
    }

    #[test]
    fn test_find_directory_returns_directory() {
        let (_dir, tree) = load(&[
            ("source/posts/index.x", ""),
            ("source/posts/hello.x", ""),
        ]);
        let mut cache = FinderCache::default();

        let hit = find_directory(&tree, tree.root, "posts", &mut cache).unwrap();
        assert_eq!(path_of(&tree, hit), "source/posts");

        // and its cache entry does not collide with the file lookup
        let file_hit = find_file(&tree, tree.root, "posts", &mut cache).unwrap();
        assert_eq!(path_of(&tree, file_hit), "source/posts/index.x");
    }

    #[test]
    fn test_deterministic_across_runs() {
        let (_dir, tree) = load(&[
            ("source/a/target.x", ""),
            ("source/b/target.x", ""),
        ]);

        let mut first = FinderCache::default();
        let mut second = FinderCache::default();
        let a = find_file(&tree, tree.root, "target", &mut first);
        let b = find_file(&tree, tree.root, "target", &mut second);
        assert_eq!(a, b);
    }
}
