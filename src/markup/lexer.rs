//! Byte-to-token stream over source text.
//!
//! The lexer is non-interpretive: it classifies punctuation, groups name
//! characters into words/identifiers/numbers, and records byte offsets for
//! diagnostics. Disambiguation (is `&` a template reference or literal
//! text?) is entirely the parser's business.

use crate::errors::Position;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Eof,
    Newline,
    Whitespace,
    Word,
    Ident,
    Number,
    Escape,
    BraceOpen,
    BraceClose,
    BracketOpen,
    BracketClose,
    AngleOpen,
    AngleClose,
    Colon,
    Equals,
    Percent,
    Stop,
    Tilde,
    Ampersand,
    Asterisk,
    Pipe,
    Bang,
    Plus,
    ForwardSlash,
    Dollar,
    /// A run of one repeated punctuation character with no kind of its own
    /// (`#`, `--`, `???`).
    NonWord,
}

impl TokenKind {
    /// Kinds that can appear inside a `[glyphs]` token declaration.
    pub fn is_glyph(self) -> bool {
        matches!(
            self,
            TokenKind::Stop
                | TokenKind::Tilde
                | TokenKind::Ampersand
                | TokenKind::Asterisk
                | TokenKind::Pipe
                | TokenKind::Bang
                | TokenKind::Plus
                | TokenKind::ForwardSlash
                | TokenKind::Dollar
                | TokenKind::AngleOpen
                | TokenKind::AngleClose
                | TokenKind::NonWord
        )
    }

    /// Kinds that can open a user-token application at the start of a
    /// line. Builtin sigils (`~ & > * / $`) are excluded: those read as
    /// builtins first and reach user-token treatment only via escaping.
    pub fn starts_user_token(self) -> bool {
        matches!(
            self,
            TokenKind::Stop
                | TokenKind::Bang
                | TokenKind::Plus
                | TokenKind::Pipe
                | TokenKind::NonWord
        )
    }

    pub fn is(self, kinds: &[TokenKind]) -> bool {
        kinds.contains(&self)
    }
}

#[derive(Debug, Clone)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub pos: Position,
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn single_glyph(c: char) -> Option<TokenKind> {
    let kind = match c {
        '{' => TokenKind::BraceOpen,
        '}' => TokenKind::BraceClose,
        '[' => TokenKind::BracketOpen,
        ']' => TokenKind::BracketClose,
        '<' => TokenKind::AngleOpen,
        '>' => TokenKind::AngleClose,
        ':' => TokenKind::Colon,
        '=' => TokenKind::Equals,
        '%' => TokenKind::Percent,
        '.' => TokenKind::Stop,
        '~' => TokenKind::Tilde,
        '&' => TokenKind::Ampersand,
        '*' => TokenKind::Asterisk,
        '|' => TokenKind::Pipe,
        '!' => TokenKind::Bang,
        '+' => TokenKind::Plus,
        '/' => TokenKind::ForwardSlash,
        '$' => TokenKind::Dollar,
        '\\' => TokenKind::Escape,
        _ => return None,
    };
    Some(kind)
}

/// Tokenise a whole document. The stream always ends with one EOF token.
pub fn lex<'a>(input: &'a str, file: &Arc<str>) -> Vec<Token<'a>> {
    let mut stream = Vec::with_capacity(input.len() / 4 + 8);
    let mut chars = input.char_indices().peekable();
    let mut line: u32 = 1;

    let pos = |start: usize, end: usize, line: u32| {
        Position::new(file.clone(), start as u32, end as u32, line)
    };

    while let Some(&(start, c)) = chars.peek() {
        // CR before LF is absorbed; a stray CR reads as whitespace
        if c == '\r' {
            chars.next();
            continue;
        }

        if c == '\n' {
            chars.next();
            stream.push(Token {
                kind: TokenKind::Newline,
                text: &input[start..start + 1],
                pos: pos(start, start + 1, line),
            });
            line += 1;
            continue;
        }

        if c == ' ' || c == '\t' {
            let mut end = start;
            while let Some(&(i, c)) = chars.peek() {
                if c != ' ' && c != '\t' {
                    break;
                }
                end = i + c.len_utf8();
                chars.next();
            }
            stream.push(Token {
                kind: TokenKind::Whitespace,
                text: &input[start..end],
                pos: pos(start, end, line),
            });
            continue;
        }

        if is_name_char(c) {
            let mut end = start;
            while let Some(&(i, c)) = chars.peek() {
                if is_name_char(c) {
                    end = i + c.len_utf8();
                    chars.next();
                    continue;
                }
                // a dot continues the name only when another name char
                // follows, so prose like "end." keeps its full stop
                if c == '.' {
                    let mut ahead = chars.clone();
                    ahead.next();
                    if ahead.peek().is_some_and(|&(_, next)| is_name_char(next)) {
                        end = i + 1;
                        chars.next();
                        continue;
                    }
                }
                break;
            }

            let text = &input[start..end];
            let kind = if text.bytes().all(|b| b.is_ascii_digit()) {
                TokenKind::Number
            } else if text.starts_with('_') || text.contains('.') {
                TokenKind::Ident
            } else {
                TokenKind::Word
            };

            stream.push(Token {
                kind,
                text,
                pos: pos(start, end, line),
            });
            continue;
        }

        if let Some(kind) = single_glyph(c) {
            chars.next();
            let end = start + c.len_utf8();
            stream.push(Token {
                kind,
                text: &input[start..end],
                pos: pos(start, end, line),
            });
            continue;
        }

        // unrecognised punctuation: group a run of the same character
        let mut end = start + c.len_utf8();
        chars.next();
        while let Some(&(i, next)) = chars.peek() {
            if next != c {
                break;
            }
            end = i + next.len_utf8();
            chars.next();
        }
        stream.push(Token {
            kind: TokenKind::NonWord,
            text: &input[start..end],
            pos: pos(start, end, line),
        });
    }

    let end = input.len();
    stream.push(Token {
        kind: TokenKind::Eof,
        text: "",
        pos: pos(end, end, line),
    });

    stream
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        let file: Arc<str> = Arc::from("test.x");
        lex(input, &file).into_iter().map(|t| t.kind).collect()
    }

    fn texts(input: &str) -> Vec<String> {
        let file: Arc<str> = Arc::from("test.x");
        lex(input, &file)
            .into_iter()
            .map(|t| t.text.to_owned())
            .collect()
    }

    #[test]
    fn test_empty_input_is_just_eof() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_words_and_numbers() {
        assert_eq!(
            kinds("hello 42"),
            vec![
                TokenKind::Word,
                TokenKind::Whitespace,
                TokenKind::Number,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_ident_classification() {
        assert_eq!(kinds("_private")[0], TokenKind::Ident);
        assert_eq!(kinds("it.info.slug")[0], TokenKind::Ident);
        assert_eq!(kinds("name")[0], TokenKind::Word);
        assert_eq!(kinds("name2")[0], TokenKind::Word);
    }

    #[test]
    fn test_trailing_stop_not_merged_into_name() {
        assert_eq!(
            kinds("end."),
            vec![TokenKind::Word, TokenKind::Stop, TokenKind::Eof]
        );
        assert_eq!(texts("it.info"), vec!["it.info", ""]);
    }

    #[test]
    fn test_whitespace_runs_collapse() {
        assert_eq!(
            kinds("a  \t b"),
            vec![
                TokenKind::Word,
                TokenKind::Whitespace,
                TokenKind::Word,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_crlf_absorbed() {
        assert_eq!(
            kinds("a\r\nb"),
            vec![
                TokenKind::Word,
                TokenKind::Newline,
                TokenKind::Word,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_recognised_glyphs() {
        assert_eq!(
            kinds("%{}="),
            vec![
                TokenKind::Percent,
                TokenKind::BraceOpen,
                TokenKind::BraceClose,
                TokenKind::Equals,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_non_word_runs_group_same_character() {
        assert_eq!(kinds("##"), vec![TokenKind::NonWord, TokenKind::Eof]);
        assert_eq!(texts("###"), vec!["###", ""]);
        // different characters stay separate tokens
        assert_eq!(
            kinds("#?"),
            vec![TokenKind::NonWord, TokenKind::NonWord, TokenKind::Eof]
        );
    }

    #[test]
    fn test_recognised_glyph_runs_stay_single() {
        // the parser re-merges runs of recognised glyphs itself
        assert_eq!(
            kinds("**"),
            vec![TokenKind::Asterisk, TokenKind::Asterisk, TokenKind::Eof]
        );
    }

    #[test]
    fn test_escape_token() {
        assert_eq!(
            kinds("\\&"),
            vec![TokenKind::Escape, TokenKind::Ampersand, TokenKind::Eof]
        );
    }

    #[test]
    fn test_positions_reference_source_bytes() {
        let file: Arc<str> = Arc::from("test.x");
        let input = "ab cd\nef";
        for token in lex(input, &file) {
            let (s, e) = (token.pos.start as usize, token.pos.end as usize);
            assert_eq!(&input[s..e], token.text);
        }
    }

    #[test]
    fn test_line_numbers() {
        let file: Arc<str> = Arc::from("test.x");
        let tokens = lex("a\nb\nc", &file);
        let lines: Vec<u32> = tokens.iter().map(|t| t.pos.line).collect();
        assert_eq!(lines, vec![1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_unicode_words() {
        assert_eq!(kinds("café")[0], TokenKind::Word);
        let file: Arc<str> = Arc::from("test.x");
        let tokens = lex("日本語 text", &file);
        assert_eq!(tokens[0].kind, TokenKind::Word);
        assert_eq!(tokens[0].text, "日本語");
    }

    #[test]
    fn test_glyph_predicates() {
        assert!(TokenKind::NonWord.starts_user_token());
        assert!(TokenKind::Bang.starts_user_token());
        assert!(!TokenKind::Ampersand.starts_user_token());
        assert!(TokenKind::Ampersand.is_glyph());
        assert!(!TokenKind::Word.is_glyph());
    }
}
