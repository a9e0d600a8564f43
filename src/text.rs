//! Small text transforms shared by the renderer and the build driver.
//!
//! Everything here is pure string-in/string-out: HTML escaping, slug
//! synthesis for element ids, title casing, URL assembly and the
//! re-indentation applied to raw blocks.

use std::borrow::Cow;

/// Escape text for inclusion in HTML output.
///
/// Only `&`, `<` and `>` are rewritten; quotes survive so that attribute
/// values authored in markup stay readable. Returns the input unchanged
/// when nothing needs escaping.
pub fn escape_html(input: &str) -> Cow<'_, str> {
    if !input.contains(['&', '<', '>']) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len() + 16);
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Remove HTML elements from rendered text, keeping only the character data.
pub fn strip_tags(input: &str) -> Cow<'_, str> {
    if !input.contains('<') {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut inside = false;

    for c in input.chars() {
        match c {
            '<' => inside = true,
            '>' => inside = false,
            _ if !inside => out.push(c),
            _ => {}
        }
    }
    Cow::Owned(out)
}

/// Synthesise an element id from rendered text.
///
/// Tags are stripped, letters and digits are lowercased, runs of
/// whitespace and dashes collapse to a single `-`, everything else is
/// dropped.
pub fn make_element_id(source: &str) -> String {
    let source = strip_tags(source);

    let mut out = String::with_capacity(source.len());
    let mut pending_dash = false;

    for c in source.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(c.to_lowercase());
        } else if c.is_whitespace() || c == '-' {
            pending_dash = true;
        }
    }

    out
}

// connectives that stay lowercase mid-title
const SHORT_WORDS: &[&str] = &[
    "a", "an", "and", "the", "on", "to", "in", "for", "nor", "or", "from", "but", "is",
];

/// Title-case a phrase, keeping short connective words lowercase except in
/// the leading position. Hyphenated compounds capitalise both halves.
pub fn make_title(input: &str) -> String {
    input
        .split(' ')
        .enumerate()
        .map(|(i, word)| {
            if i > 0 && SHORT_WORDS.contains(&word) {
                word.to_owned()
            } else {
                capitalize_word(word)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize_word(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut at_start = true;

    for c in word.chars() {
        if c == '-' {
            out.push(c);
            at_start = true;
        } else if at_start {
            out.extend(c.to_uppercase());
            at_start = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }

    out
}

/// Join a site domain and a site-rooted path into one URL.
///
/// Paths that already carry a scheme pass through untouched.
pub fn join_url(domain: &str, path: &str) -> String {
    if path.contains("://") {
        return path.to_owned();
    }

    let base = domain.trim_end_matches('/');
    if path.is_empty() {
        return format!("{base}/");
    }

    format!("{}/{}", base, path.trim_start_matches('/'))
}

/// Re-indent a raw block to its minimum common leading indent.
///
/// Tabs expand to four spaces first so mixed indentation measures
/// consistently; fully blank lines are ignored when measuring and the
/// result is trimmed of outer blank lines.
pub fn reindent_text(input: &str) -> String {
    let input = input.replace('\t', "    ");

    let shortest = input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.chars().take_while(|c| *c == ' ').count())
        .min()
        .unwrap_or(0);

    let mut out = String::with_capacity(input.len());
    for line in input.lines() {
        if line.trim().is_empty() {
            out.push('\n');
        } else {
            out.push_str(&line[shortest..]);
            out.push('\n');
        }
    }

    out.trim_matches('\n').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------------
    // escape_html
    // ------------------------------------------------------------------------

    #[test]
    fn test_escape_html_passthrough() {
        assert!(matches!(escape_html("plain text"), Cow::Borrowed(_)));
        assert_eq!(escape_html("plain text"), "plain text");
    }

    #[test]
    fn test_escape_html_specials() {
        assert_eq!(escape_html("<b>&</b>"), "&lt;b&gt;&amp;&lt;/b&gt;");
        assert_eq!(escape_html("a < b > c"), "a &lt; b &gt; c");
    }

    #[test]
    fn test_escape_html_keeps_quotes() {
        assert_eq!(escape_html(r#"say "hi""#), r#"say "hi""#);
    }

    // ------------------------------------------------------------------------
    // element ids
    // ------------------------------------------------------------------------

    #[test]
    fn test_make_element_id_basic() {
        assert_eq!(make_element_id("Hi"), "hi");
        assert_eq!(make_element_id("Hello World"), "hello-world");
    }

    #[test]
    fn test_make_element_id_strips_tags() {
        assert_eq!(make_element_id("<b>Bold</b> Claim"), "bold-claim");
    }

    #[test]
    fn test_make_element_id_collapses_separators() {
        assert_eq!(make_element_id("a  -  b"), "a-b");
        assert_eq!(make_element_id("  edges  "), "edges");
    }

    #[test]
    fn test_make_element_id_drops_punctuation() {
        assert_eq!(make_element_id("What? Really!"), "what-really");
    }

    // ------------------------------------------------------------------------
    // titles
    // ------------------------------------------------------------------------

    #[test]
    fn test_make_title_basic() {
        assert_eq!(make_title("the quick brown fox"), "The quick Brown Fox");
    }

    #[test]
    fn test_make_title_leading_short_word() {
        assert_eq!(make_title("on writing"), "On Writing");
    }

    #[test]
    fn test_make_title_hyphenated() {
        assert_eq!(make_title("well-known issues"), "Well-Known Issues");
    }

    #[test]
    fn test_make_title_normalises_case() {
        assert_eq!(make_title("SHOUTING text"), "Shouting Text");
    }

    // ------------------------------------------------------------------------
    // urls
    // ------------------------------------------------------------------------

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://example.com", "/posts/hello"),
            "https://example.com/posts/hello"
        );
        assert_eq!(
            join_url("https://example.com/", "posts/hello"),
            "https://example.com/posts/hello"
        );
        assert_eq!(join_url("https://example.com", ""), "https://example.com/");
    }

    #[test]
    fn test_join_url_absolute_passthrough() {
        assert_eq!(
            join_url("https://example.com", "https://other.net/x"),
            "https://other.net/x"
        );
    }

    // ------------------------------------------------------------------------
    // reindent
    // ------------------------------------------------------------------------

    #[test]
    fn test_reindent_strips_common_indent() {
        let input = "\n    fn main() {\n        body\n    }\n";
        assert_eq!(reindent_text(input), "fn main() {\n    body\n}");
    }

    #[test]
    fn test_reindent_expands_tabs() {
        assert_eq!(reindent_text("\tone\n\t\ttwo"), "one\n    two");
    }

    #[test]
    fn test_reindent_ignores_blank_lines() {
        let input = "    a\n\n    b";
        assert_eq!(reindent_text(input), "a\n\nb");
    }

    #[test]
    fn test_reindent_no_indent() {
        assert_eq!(reindent_text("a\nb"), "a\nb");
    }
}
