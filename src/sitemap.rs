//! Sitemap generation.
//!
//! One `<url><loc>…</loc></url>` per page, wrapped by the fixed
//! `<urlset>` envelope. Entries are sorted lexicographically so the file
//! is byte-stable regardless of build order, and empty entries are
//! skipped to keep the XML well-formed.

use crate::text::escape_html;

const SITEMAP_NS: &str = "http://www.sitemaps.org/schemas/sitemap/0.9";

/// Assemble the sitemap document from page URLs, in any order.
pub fn build_sitemap(urls: &[String]) -> String {
    let mut ordered: Vec<&str> = urls
        .iter()
        .map(String::as_str)
        .filter(|u| !u.is_empty())
        .collect();
    ordered.sort_unstable();
    ordered.dedup();

    let mut xml = String::with_capacity(128 + ordered.len() * 64);
    xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    xml.push('\n');
    xml.push_str(&format!(r#"<urlset xmlns="{SITEMAP_NS}">"#));
    xml.push('\n');

    for url in ordered {
        xml.push_str("  <url><loc>");
        xml.push_str(&escape_html(url));
        xml.push_str("</loc></url>\n");
    }

    xml.push_str("</urlset>\n");
    xml
}
