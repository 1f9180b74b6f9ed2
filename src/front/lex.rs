//! The lexer.

use derive_more::Display;
use regex::Regex;

use crate::common::{Diagnostic, ErrorKind, Pos};

/// Tokens in the program
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("kind: '{kind}', part of input: '{text}' at {pos}")]
pub struct Token<'src> {
    /// What token class this token belongs to.
    kind: TokenKind,
    /// What part of the input this token carries.
    text: &'src str,
    /// Where the token starts.
    pos: Pos,
}

impl<'src> Token<'src> {
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn text(&self) -> &'src str {
        self.text
    }

    pub fn pos(&self) -> Pos {
        self.pos
    }
}

impl std::fmt::Debug for Token<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
pub enum TokenKind {
    #[display("id")]
    Id,
    #[display("num")]
    Num,
    #[display("if")]
    If,
    #[display("else")]
    Else,
    #[display("while")]
    While,
    #[display("for")]
    For,
    #[display("return")]
    Return,
    #[display("break")]
    Break,
    #[display("continue")]
    Continue,
    #[display("int")]
    Int,
    #[display("let")]
    Let,
    #[display("function")]
    Function,
    #[display("struct")]
    Struct,
    #[display("==")]
    EqEq,
    #[display("!=")]
    Ne,
    #[display("<=")]
    Le,
    #[display(">=")]
    Ge,
    #[display("&&")]
    AndAnd,
    #[display("||")]
    OrOr,
    #[display("**")]
    Power,
    #[display("->")]
    Arrow,
    #[display("=")]
    Assign,
    #[display("<")]
    Lt,
    #[display(">")]
    Gt,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("/")]
    Slash,
    #[display("%")]
    Percent,
    #[display("&")]
    Amp,
    #[display("!")]
    Bang,
    #[display(".")]
    Dot,
    #[display(",")]
    Comma,
    #[display(";")]
    Semi,
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    line: usize,
    column: usize,
    whitespace: Regex,
    matchers: Vec<(Regex, TokenKind)>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        use TokenKind::*;

        // Multi-character operators must come before their one-character
        // prefixes so one-char lookahead falls out of the match order.
        let table: &[(&str, TokenKind)] = &[
            (r"\A[0-9]+", Num),
            (r"\A[A-Za-z_][A-Za-z0-9_]*", Id),
            (r"\A==", EqEq),
            (r"\A!=", Ne),
            (r"\A<=", Le),
            (r"\A>=", Ge),
            (r"\A&&", AndAnd),
            (r"\A\|\|", OrOr),
            (r"\A\*\*", Power),
            (r"\A->", Arrow),
            (r"\A=", Assign),
            (r"\A<", Lt),
            (r"\A>", Gt),
            (r"\A\+", Plus),
            (r"\A-", Minus),
            (r"\A\*", Star),
            (r"\A/", Slash),
            (r"\A%", Percent),
            (r"\A&", Amp),
            (r"\A!", Bang),
            (r"\A\.", Dot),
            (r"\A,", Comma),
            (r"\A;", Semi),
            (r"\A\(", LParen),
            (r"\A\)", RParen),
            (r"\A\{", LBrace),
            (r"\A\}", RBrace),
        ];

        Lexer {
            input,
            pos: 0,
            line: 1,
            column: 1,
            whitespace: Regex::new(r"\A(?:[ \t\f\r\n\v]|//[^\n]*|#[^\n]*)*").unwrap(),
            matchers: table
                .iter()
                .map(|(re, kind)| (Regex::new(re).unwrap(), *kind))
                .collect(),
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    fn here(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
            offset: self.pos,
        }
    }

    /// Consume `len` bytes, keeping the line/column counters in step.
    fn advance(&mut self, len: usize) {
        for ch in self.input[self.pos..self.pos + len].chars() {
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.pos += len;
    }

    // Skip comments (`// ...` and `# ...`) and whitespace
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.advance(m.end());
        }
    }

    /// Get the next token if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<Token<'input>>, Diagnostic> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }
        let pos = self.here();
        let rest = &self.input[self.pos..];
        for (re, kind) in &self.matchers {
            if let Some(m) = re.find(rest) {
                let text = m.as_str();
                let token = cook(*kind, text, pos);
                let len = m.end();
                self.advance(len);
                return Ok(Some(token));
            }
        }
        let ch = rest.chars().next().unwrap_or('\0');
        Err(Diagnostic::at(
            ErrorKind::Lex,
            pos,
            format!("unexpected character {ch:?}"),
        ))
    }
}

/// Rewrite raw identifier matches into keywords, and the `true`/`false`
/// literals into number tokens.
fn cook<'src>(kind: TokenKind, text: &'src str, pos: Pos) -> Token<'src> {
    use TokenKind::*;

    let (kind, text) = match (kind, text) {
        (Id, "if") => (If, text),
        (Id, "else") => (Else, text),
        (Id, "while") => (While, text),
        (Id, "for") => (For, text),
        (Id, "return") => (Return, text),
        (Id, "break") => (Break, text),
        (Id, "continue") => (Continue, text),
        (Id, "int") => (Int, text),
        (Id, "let") => (Let, text),
        (Id, "function") => (Function, text),
        (Id, "struct") => (Struct, text),
        (Id, "true") => (Num, "1"),
        (Id, "false") => (Num, "0"),
        _ => (kind, text),
    };
    Token { kind, text, pos }
}

/// Scan the whole input.  Unknown characters are reported and skipped so
/// that one stray character does not hide the rest of the program.
pub fn tokenize(input: &str) -> (Vec<Token<'_>>, Vec<Diagnostic>) {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();
    loop {
        match lexer.next() {
            Ok(Some(token)) => tokens.push(token),
            Ok(None) => break,
            Err(diag) => {
                errors.push(diag);
                let skip = lexer.input[lexer.pos..]
                    .chars()
                    .next()
                    .map_or(0, char::len_utf8);
                lexer.advance(skip);
            }
        }
    }
    (tokens, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (tokens, errors) = tokenize(src);
        assert!(errors.is_empty(), "unexpected lex errors: {errors:?}");
        tokens.iter().map(Token::kind).collect()
    }

    #[test]
    fn operators_use_longest_match() {
        use TokenKind::*;
        assert_eq!(kinds("a ** b == c"), vec![Id, Power, Id, EqEq, Id]);
        assert_eq!(kinds("p->x <= 3"), vec![Id, Arrow, Id, Le, Num]);
        assert_eq!(kinds("&x && *p"), vec![Amp, Id, AndAnd, Star, Id]);
    }

    #[test]
    fn comments_and_positions() {
        let (tokens, errors) = tokenize("x = 1; # trailing\n// whole line\ny = 2;");
        assert!(errors.is_empty());
        let y = tokens.iter().find(|t| t.text() == "y").unwrap();
        assert_eq!(y.pos().line, 3);
        assert_eq!(y.pos().column, 1);
    }

    #[test]
    fn booleans_become_numbers() {
        let (tokens, _) = tokenize("true false");
        assert_eq!(tokens[0].kind(), TokenKind::Num);
        assert_eq!(tokens[0].text(), "1");
        assert_eq!(tokens[1].kind(), TokenKind::Num);
        assert_eq!(tokens[1].text(), "0");
    }

    #[test]
    fn unknown_character_is_reported_and_skipped() {
        let (tokens, errors) = tokenize("x @ y");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Lex);
        assert_eq!(tokens.len(), 2);
    }
}
