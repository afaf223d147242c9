//! Parser for the scene DSL.
//!
//! Recursive descent over the token stream. Each statement keeps its exact
//! source slice — the CONTEXT compactor and snapshot labels work on source
//! text, so the parser must preserve it byte-for-byte.

use crate::exec::lexer::{tokenize, SpannedTok, Tok};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    List(Vec<Expr>),
    Neg(Box<Expr>),
    Bin {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: String,
        args: Vec<Expr>,
    },
    Method {
        target: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Root identifier of a method-call chain (`a.set_pos(...)` → `a`).
    pub fn method_root(&self) -> Option<&str> {
        match self {
            Expr::Method { target, .. } => match target.as_ref() {
                Expr::Ident(name) => Some(name),
                other => other.method_root(),
            },
            _ => None,
        }
    }

    /// Names this expression reads.
    pub fn collect_reads(&self, out: &mut Vec<String>) {
        match self {
            Expr::Ident(name) => out.push(name.clone()),
            Expr::List(items) => items.iter().for_each(|e| e.collect_reads(out)),
            Expr::Neg(e) => e.collect_reads(out),
            Expr::Bin { lhs, rhs, .. } => {
                lhs.collect_reads(out);
                rhs.collect_reads(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|e| e.collect_reads(out)),
            Expr::Method { target, args, .. } => {
                target.collect_reads(out);
                args.iter().for_each(|e| e.collect_reads(out));
            }
            _ => {}
        }
    }

    /// Whether evaluating this expression constructs a scene item.
    pub fn creates_item(&self) -> bool {
        match self {
            Expr::Call { func, .. } => crate::exec::context::is_constructor(func),
            Expr::Bin { lhs, rhs, .. } => lhs.creates_item() || rhs.creates_item(),
            Expr::Neg(e) => e.creates_item(),
            Expr::List(items) => items.iter().any(Expr::creates_item),
            Expr::Method { target, .. } => target.creates_item(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Import { module: String },
    Assign { name: String, expr: Expr },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    /// Exact source of this statement, trimmed.
    pub source: String,
}

/// Parse a program into statements. Any error aborts the whole parse —
/// callers treat the block as opaque (compaction falls back to raw text,
/// execution reports the error via STDERR).
pub fn parse_program(src: &str) -> Result<Vec<Stmt>, String> {
    let tokens = tokenize(src)?;
    let mut stmts = Vec::new();

    for group in split_statements(&tokens) {
        if group.is_empty() {
            continue;
        }
        let start = group.first().unwrap().1.start;
        let end = group.last().unwrap().1.end;
        let source = src[start..end].trim().to_string();

        let mut p = Parser { toks: group, pos: 0 };
        let kind = p.statement()?;
        p.expect_end()?;
        stmts.push(Stmt { kind, source });
    }

    Ok(stmts)
}

fn split_statements<'a>(tokens: &'a [SpannedTok]) -> Vec<&'a [SpannedTok]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for (i, (tok, _)) in tokens.iter().enumerate() {
        if matches!(tok, Tok::Newline) {
            if i > start {
                groups.push(&tokens[start..i]);
            }
            start = i + 1;
        }
    }
    if start < tokens.len() {
        groups.push(&tokens[start..]);
    }
    groups
}

struct Parser<'a> {
    toks: &'a [SpannedTok],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|(t, _)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), String> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(format!("SyntaxError: expected {what}"))
        }
    }

    fn expect_end(&self) -> Result<(), String> {
        if self.pos == self.toks.len() {
            Ok(())
        } else {
            Err("SyntaxError: trailing tokens after statement".to_string())
        }
    }

    fn statement(&mut self) -> Result<StmtKind, String> {
        if self.eat(&Tok::Import) {
            return self.import_rest();
        }

        // `ident = expr` is an assignment; anything else is an expression.
        if let (Some(Tok::Ident(name)), Some((Tok::Assign, _))) =
            (self.peek().cloned(), self.toks.get(self.pos + 1))
        {
            self.pos += 2;
            let expr = self.expr()?;
            return Ok(StmtKind::Assign { name, expr });
        }

        let expr = self.expr()?;
        Ok(StmtKind::Expr(expr))
    }

    fn import_rest(&mut self) -> Result<StmtKind, String> {
        let mut module = match self.next() {
            Some(Tok::Ident(name)) => name,
            _ => return Err("SyntaxError: expected module name after import".to_string()),
        };
        while self.eat(&Tok::Dot) {
            match self.next() {
                Some(Tok::Ident(part)) => {
                    module.push('.');
                    module.push_str(&part);
                }
                _ => return Err("SyntaxError: expected name after '.'".to_string()),
            }
        }
        Ok(StmtKind::Import { module })
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Bin {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::Bin {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, String> {
        if self.eat(&Tok::Minus) {
            return Ok(Expr::Neg(Box::new(self.factor()?)));
        }
        let atom = self.atom()?;
        self.postfix(atom)
    }

    fn atom(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Tok::NoneKw) => Ok(Expr::Null),
            Some(Tok::True) => Ok(Expr::Bool(true)),
            Some(Tok::False) => Ok(Expr::Bool(false)),
            Some(Tok::Int(n)) => Ok(Expr::Int(n)),
            Some(Tok::Float(f)) => Ok(Expr::Float(f)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Ident(name)) => {
                if self.eat(&Tok::LParen) {
                    let args = self.args(Tok::RParen)?;
                    Ok(Expr::Call { func: name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Tok::LParen) => {
                let inner = self.expr()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(inner)
            }
            Some(Tok::LBracket) => {
                let items = self.args(Tok::RBracket)?;
                Ok(Expr::List(items))
            }
            other => Err(format!("SyntaxError: unexpected token {other:?}")),
        }
    }

    fn postfix(&mut self, mut expr: Expr) -> Result<Expr, String> {
        while self.eat(&Tok::Dot) {
            let name = match self.next() {
                Some(Tok::Ident(name)) => name,
                _ => return Err("SyntaxError: expected method name after '.'".to_string()),
            };
            self.expect(&Tok::LParen, "'(' after method name")?;
            let args = self.args(Tok::RParen)?;
            expr = Expr::Method {
                target: Box::new(expr),
                name,
                args,
            };
        }
        Ok(expr)
    }

    fn args(&mut self, close: Tok) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat(&Tok::Comma) {
                continue;
            }
            self.expect(&close, "closing delimiter")?;
            break;
        }
        Ok(args)
    }
}

/// Accumulates code across writes and yields it when the handle closes.
/// Chunks arrive in arbitrary sizes (9P `msize` is typically 8–64 KiB), so
/// nothing is interpreted until the flush.
#[derive(Default)]
pub struct StreamingParser {
    buffer: String,
}

impl StreamingParser {
    pub fn feed(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    /// Take the accumulated code if it holds anything non-blank.
    pub fn flush(&mut self) -> Option<String> {
        let code = std::mem::take(&mut self.buffer);
        if code.trim().is_empty() {
            None
        } else {
            Some(code)
        }
    }

    pub fn has_content(&self) -> bool {
        !self.buffer.trim().is_empty()
    }
}
