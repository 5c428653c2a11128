// Lexer for HLO module text.
//
// Tokenizes the textual HLO form consumed by the coalescing analyzer (module
// header, computations, instructions, shapes, attributes). Uses the `logos`
// crate for DFA-based lexing.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// HLO token types.
///
/// Whitespace (including newlines) is insignificant in HLO text, as are
/// `//` line comments. A leading `%` on names is accepted and dropped.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+|//[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("HloModule")]
    HloModule,
    #[token("ENTRY")]
    Entry,
    #[token("ROOT")]
    Root,

    // ── Symbols ──
    #[token("=")]
    Equals,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,

    // ── Literals ──
    //
    // Float must be tried alongside Int; logos picks the longest match, so
    // `1.5` lexes as Float and `15` as Int.
    /// Floating-point literal (constants only).
    #[regex(r"-?[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", parse_float)]
    Float(f64),

    /// Integer literal (dimensions, attribute values, parameter numbers).
    #[regex(r"-?[0-9]+", parse_int)]
    Int(i64),

    // ── Names ──
    //
    // Instruction, computation and opcode names may contain `.` and `-`
    // (`fused_computation.1`, `dynamic-slice`). Keywords win over this regex
    // for equal-length matches.
    #[regex(r"%?[a-zA-Z_][a-zA-Z0-9_.\-]*", parse_name)]
    Name(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::HloModule => write!(f, "HloModule"),
            Token::Entry => write!(f, "ENTRY"),
            Token::Root => write!(f, "ROOT"),
            Token::Equals => write!(f, "="),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Float(v) => write!(f, "{v}"),
            Token::Int(v) => write!(f, "{v}"),
            Token::Name(s) => write!(f, "{s}"),
        }
    }
}

// ── Callbacks ──

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    lex.slice().parse().ok()
}

fn parse_float(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_name(lex: &mut logos::Lexer<'_, Token>) -> String {
    lex.slice().trim_start_matches('%').to_string()
}

// ── Public API ──

/// Lex HLO text into tokens.
///
/// Lexing is non-fatal: errors are collected and the lexer continues past
/// bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──
