//! Lexer for the scene DSL.
//!
//! Token stream via the logos lexer generator. The language is a small
//! Python-shaped subset: identifiers, numeric/string/bool/None literals,
//! arithmetic, calls, method calls, list literals, `import`, assignment.
//! Statements are separated by newlines or `;`.

use logos::Logos;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t]+")]
#[logos(skip r"#[^\n]*")]
pub enum Tok {
    #[token("import")]
    Import,

    #[token("True")]
    True,

    #[token("False")]
    False,

    #[token("None")]
    NoneKw,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r#"'([^'\\\n]|\\.)*'"#, |lex| unescape(lex.slice()))]
    Str(String),

    #[token("=")]
    Assign,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,

    #[regex(r"(\r?\n|;)+")]
    Newline,
}

fn unescape(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('\\') => out.push('\\'),
                Some('\'') => out.push('\''),
                Some('"') => out.push('"'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// A token plus its byte span in the source.
pub type SpannedTok = (Tok, std::ops::Range<usize>);

/// Tokenize, reporting the first lex error with its offending slice.
pub fn tokenize(src: &str) -> Result<Vec<SpannedTok>, String> {
    let mut out = Vec::new();
    for (tok, span) in Tok::lexer(src).spanned() {
        match tok {
            Ok(t) => out.push((t, span)),
            Err(()) => {
                return Err(format!(
                    "SyntaxError: unexpected character {:?}",
                    &src[span.start..span.end.min(src.len())]
                ))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_assignment_and_call() {
        let toks: Vec<Tok> = tokenize("x = rect(0, 0, 10, 20)\n")
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        assert_eq!(toks[0], Tok::Ident("x".into()));
        assert_eq!(toks[1], Tok::Assign);
        assert_eq!(toks[2], Tok::Ident("rect".into()));
        assert!(toks.contains(&Tok::Int(20)));
        assert_eq!(*toks.last().unwrap(), Tok::Newline);
    }

    #[test]
    fn strings_unescape_both_quote_styles() {
        let toks = tokenize(r#"a = "he\nllo"; b = 'it\'s'"#).unwrap();
        let strings: Vec<&Tok> = toks
            .iter()
            .map(|(t, _)| t)
            .filter(|t| matches!(t, Tok::Str(_)))
            .collect();
        assert_eq!(strings[0], &Tok::Str("he\nllo".into()));
        assert_eq!(strings[1], &Tok::Str("it's".into()));
    }

    #[test]
    fn comments_and_floats() {
        let toks: Vec<Tok> = tokenize("y = 1.5  # half\n")
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        assert!(toks.contains(&Tok::Float(1.5)));
        assert!(!toks.iter().any(|t| matches!(t, Tok::Str(_))));
    }

    #[test]
    fn rejects_garbage() {
        assert!(tokenize("x = $bad").is_err());
    }
}
