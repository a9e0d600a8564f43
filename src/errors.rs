//! Positioned diagnostics.
//!
//! User mistakes in markup are not Rust errors: the pipeline records them
//! here and keeps going, so one build reports everything it can find.
//! Failures flip a sticky flag that decides the process exit code and
//! whether the dev server swaps the page for the error report.

use colored::Colorize;
use std::fmt;
use std::sync::Arc;

/// Byte range a token or AST node was derived from.
#[derive(Debug, Clone)]
pub struct Position {
    pub file: Arc<str>,
    pub start: u32,
    pub end: u32,
    pub line: u32,
}

impl Position {
    pub fn new(file: Arc<str>, start: u32, end: u32, line: u32) -> Self {
        Self {
            file,
            start,
            end,
            line,
        }
    }
}

/// Diagnostic kinds, ascending severity. Everything from `Failure` up
/// affects the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    RenderWarning,
    ParserWarning,
    Failure,
    RenderFailure,
    ParserFailure,
}

impl Severity {
    pub fn is_failure(self) -> bool {
        self >= Severity::Failure
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Warning => "Warning",
            Severity::RenderWarning => "Render Warning",
            Severity::ParserWarning => "Parser Warning",
            Severity::Failure => "Failure",
            Severity::RenderFailure => "Render Failure",
            Severity::ParserFailure => "Parser Failure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: Severity,
    pub pos: Option<Position>,
    pub message: String,
}

/// Collector shared by the parser, renderer and build driver.
#[derive(Debug, Default)]
pub struct Diagnostics {
    all: Vec<Diagnostic>,
    has_failures: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; the dev server calls this between renders.
    pub fn reset(&mut self) {
        self.all.clear();
        self.has_failures = false;
    }

    pub fn push(&mut self, kind: Severity, message: impl Into<String>) {
        if kind.is_failure() {
            self.has_failures = true;
        }
        self.all.push(Diagnostic {
            kind,
            pos: None,
            message: message.into(),
        });
    }

    pub fn push_pos(&mut self, kind: Severity, pos: Position, message: impl Into<String>) {
        if kind.is_failure() {
            self.has_failures = true;
        }
        self.all.push(Diagnostic {
            kind,
            pos: Some(pos),
            message: message.into(),
        });
    }

    pub fn has_failures(&self) -> bool {
        self.has_failures
    }

    pub fn has_errors(&self) -> bool {
        !self.all.is_empty()
    }

    /// Diagnostics sorted most-severe first, original order preserved
    /// within a severity.
    fn sorted(&self) -> Vec<&Diagnostic> {
        let mut list: Vec<&Diagnostic> = self.all.iter().collect();
        list.sort_by(|a, b| b.kind.cmp(&a.kind));
        list
    }

    /// Plain-text report, one diagnostic per paragraph.
    pub fn render_term(&self) -> String {
        let mut out = String::with_capacity(self.all.len() * 128);

        for d in self.sorted() {
            let heading = if d.kind.is_failure() {
                format!("{}!", d.kind).bright_red().bold()
            } else {
                format!("{}!", d.kind).bright_yellow().bold()
            };

            match &d.pos {
                Some(pos) => {
                    out.push_str(&format!(
                        "{} {} — line {}\n    {}\n\n",
                        heading, pos.file, pos.line, d.message
                    ));
                }
                None => {
                    out.push_str(&format!("{}\n    {}\n\n", heading, d.message));
                }
            }
        }

        out.trim_end().to_owned()
    }

    /// The error page the dev server substitutes for a broken render.
    /// `reload_script` is spliced into the head so the page refreshes
    /// itself once the markup is fixed.
    pub fn render_html_page(&self, reload_script: &str) -> String {
        let mut sections = String::with_capacity(self.all.len() * 128);

        for d in self.sorted() {
            match &d.pos {
                Some(pos) => sections.push_str(&format!(
                    "<section><p><b>{} — line {}</b></p>\
                     <p class=\"space\"><tt>{}</tt></p><p>{}</p></section>\n",
                    d.kind, pos.line, pos.file, d.message
                )),
                None => sections.push_str(&format!(
                    "<section><p><b>{}!</b></p><p>{}</p></section>\n",
                    d.kind, d.message
                )),
            }
        }

        ERROR_PAGE
            .replace("{style}", ERROR_STYLE)
            .replace("{reload}", reload_script)
            .replace("{sections}", &sections)
    }
}

const ERROR_STYLE: &str = r#"<style type="text/css">
    body {
        font-family: Helvetica, Arial, sans-serif;
        margin: 5ex;
        font-size: 1.2rem;
    }
    tt {
        font-family: SF Mono, Roboto Mono, Source Code Pro, monospace;
    }
    tt, p { padding: 0; margin: 0; margin-bottom: .5ex }
    main  { max-width: 70ex }
    section:not(:first-child) { margin-top: 2rem }
</style>"#;

const ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html><head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>Spindle</title>{style}{reload}</head>
<body>
    <h1>Spindle</h1>
    <main>
{sections}
    </main>
</body></html>"#;

/// The page the dev server returns for unknown routes.
pub fn not_found_page(reload_script: &str) -> String {
    ERROR_PAGE
        .replace("{style}", ERROR_STYLE)
        .replace("{reload}", reload_script)
        .replace(
            "{sections}",
            "<section><p><b>Page not found...</b></p></section>",
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(line: u32) -> Position {
        Position::new(Arc::from("source/index.x"), 0, 4, line)
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Warning < Severity::Failure);
        assert!(Severity::ParserWarning < Severity::Failure);
        assert!(Severity::Failure < Severity::ParserFailure);
        assert!(!Severity::ParserWarning.is_failure());
        assert!(Severity::RenderFailure.is_failure());
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let mut d = Diagnostics::new();
        d.push(Severity::Warning, "odd but fine");
        d.push_pos(Severity::ParserWarning, pos(3), "rewound");

        assert!(d.has_errors());
        assert!(!d.has_failures());
    }

    #[test]
    fn test_failures_are_sticky() {
        let mut d = Diagnostics::new();
        d.push_pos(Severity::ParserFailure, pos(1), "bad declaration");
        d.push(Severity::Warning, "later warning");

        assert!(d.has_failures());
        d.reset();
        assert!(!d.has_failures());
        assert!(!d.has_errors());
    }

    #[test]
    fn test_term_report_sorted_by_severity() {
        let mut d = Diagnostics::new();
        d.push(Severity::Warning, "first-warning");
        d.push_pos(Severity::RenderFailure, pos(9), "the-failure");

        let report = d.render_term();
        let fail_at = report.find("the-failure").unwrap();
        let warn_at = report.find("first-warning").unwrap();
        assert!(fail_at < warn_at);
    }

    #[test]
    fn test_term_report_includes_position() {
        let mut d = Diagnostics::new();
        d.push_pos(Severity::ParserFailure, pos(12), "unclosed block");

        let report = d.render_term();
        assert!(report.contains("source/index.x"));
        assert!(report.contains("line 12"));
        assert!(report.contains("unclosed block"));
    }

    #[test]
    fn test_html_page_contains_sections() {
        let mut d = Diagnostics::new();
        d.push_pos(Severity::RenderFailure, pos(2), "missing file");

        let html = d.render_html_page("<script></script>");
        assert!(html.contains("<!DOCTYPE html>"));
        assert!(html.contains("Render Failure — line 2"));
        assert!(html.contains("missing file"));
        assert!(html.contains("<script></script>"));
        assert!(!html.contains("{style}"));
    }
}
