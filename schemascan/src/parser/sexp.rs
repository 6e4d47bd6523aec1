use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unexpected end of input")]
    UnexpectedEof,
    #[error("Unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("Trailing input at position {0}")]
    TrailingInput(usize),
}

/// S-expression tree. `Atom` is a bare token, `Text` a quoted string.
#[derive(Debug, Clone, PartialEq)]
pub enum SExp {
    Atom(String),
    Text(String),
    List(Vec<SExp>),
}

impl SExp {
    pub fn atom(value: impl fmt::Display) -> SExp {
        SExp::Atom(value.to_string())
    }

    pub fn text(value: impl Into<String>) -> SExp {
        SExp::Text(value.into())
    }

    /// `(head items...)`
    pub fn list(head: &str, items: Vec<SExp>) -> SExp {
        let mut all = Vec::with_capacity(items.len() + 1);
        all.push(SExp::Atom(head.to_string()));
        all.extend(items);
        SExp::List(all)
    }

    /// `(head value)` with a bare value.
    pub fn pair(head: &str, value: impl fmt::Display) -> SExp {
        SExp::list(head, vec![SExp::atom(value)])
    }

    /// Leaf text, quoted or not.
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            SExp::Atom(s) | SExp::Text(s) => Some(s),
            SExp::List(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_atom().and_then(|s| s.parse().ok())
    }

    pub fn as_list(&self) -> Option<&[SExp]> {
        match self {
            SExp::List(items) => Some(items),
            _ => None,
        }
    }

    /// First token of a list.
    pub fn head(&self) -> Option<&str> {
        self.as_list().and_then(|l| l.first()).and_then(|a| a.as_atom())
    }

    /// Items after the head.
    pub fn args(&self) -> &[SExp] {
        match self {
            SExp::List(items) if !items.is_empty() => &items[1..],
            _ => &[],
        }
    }

    pub fn arg(&self, index: usize) -> Option<&SExp> {
        self.args().get(index)
    }

    /// First child list whose head is `key`.
    pub fn find(&self, key: &str) -> Option<&SExp> {
        self.args().iter().find(|item| item.head() == Some(key))
    }

    pub fn find_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a SExp> + 'a {
        self.args().iter().filter(move |item| item.head() == Some(key))
    }

    /// Value of a `(key value)` child.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.find(key).and_then(|l| l.arg(0)).and_then(|v| v.as_atom())
    }

    /// Multi-line rendering with nested lists indented by two spaces.
    /// Lists holding only leaves stay on one line.
    pub fn to_pretty(&self) -> String {
        let mut out = String::new();
        self.write_pretty(&mut out, 0);
        out.push('\n');
        out
    }

    fn write_pretty(&self, out: &mut String, depth: usize) {
        let items = match self {
            SExp::List(items) if items.iter().any(|i| matches!(i, SExp::List(_))) => items,
            _ => {
                out.push_str(&self.to_string());
                return;
            }
        };
        out.push('(');
        let mut first = true;
        for item in items {
            match item {
                SExp::List(_) => {
                    out.push('\n');
                    out.push_str(&"  ".repeat(depth + 1));
                    item.write_pretty(out, depth + 1);
                }
                leaf => {
                    if !first {
                        out.push(' ');
                    }
                    out.push_str(&leaf.to_string());
                }
            }
            first = false;
        }
        out.push('\n');
        out.push_str(&"  ".repeat(depth));
        out.push(')');
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}

impl fmt::Display for SExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SExp::Atom(s) => {
                // bare tokens that would not survive re-reading get quoted
                if s.is_empty() || s.chars().any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '"')) {
                    write!(f, "\"{}\"", escape(s))
                } else {
                    write!(f, "{}", s)
                }
            }
            SExp::Text(s) => write!(f, "\"{}\"", escape(s)),
            SExp::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

pub struct SExpParser {
    input: Vec<char>,
    pos: usize,
}

impl SExpParser {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    /// Parse one expression; only whitespace may follow it.
    pub fn parse(&mut self) -> Result<SExp, ParseError> {
        self.skip_whitespace();
        if self.is_eof() {
            return Err(ParseError::UnexpectedEof);
        }
        let sexp = self.parse_sexp()?;
        self.skip_whitespace();
        if !self.is_eof() {
            return Err(ParseError::TrailingInput(self.pos));
        }
        Ok(sexp)
    }

    fn parse_sexp(&mut self) -> Result<SExp, ParseError> {
        self.skip_whitespace();

        if self.is_eof() {
            return Err(ParseError::UnexpectedEof);
        }

        match self.peek() {
            '(' => self.parse_list(),
            ')' => Err(ParseError::UnexpectedToken(format!("')' at position {}", self.pos))),
            '"' => self.parse_string(),
            _ => self.parse_symbol(),
        }
    }

    fn parse_list(&mut self) -> Result<SExp, ParseError> {
        self.expect_char('(')?;
        let mut items = Vec::new();

        loop {
            self.skip_whitespace();

            if self.is_eof() {
                return Err(ParseError::UnexpectedEof);
            }

            if self.peek() == ')' {
                self.advance();
                break;
            }

            items.push(self.parse_sexp()?);
        }

        Ok(SExp::List(items))
    }

    fn parse_string(&mut self) -> Result<SExp, ParseError> {
        self.expect_char('"')?;
        let mut s = String::new();
        let mut escaped = false;

        loop {
            if self.is_eof() {
                return Err(ParseError::UnexpectedEof);
            }
            let ch = self.peek();
            self.advance();

            if escaped {
                match ch {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    'r' => s.push('\r'),
                    _ => s.push(ch),
                }
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                break;
            } else {
                s.push(ch);
            }
        }

        Ok(SExp::Text(s))
    }

    fn parse_symbol(&mut self) -> Result<SExp, ParseError> {
        let mut s = String::new();

        while !self.is_eof() {
            let ch = self.peek();
            if ch.is_whitespace() || ch == '(' || ch == ')' {
                break;
            }
            s.push(ch);
            self.advance();
        }

        if s.is_empty() {
            Err(ParseError::UnexpectedToken("empty symbol".to_string()))
        } else {
            Ok(SExp::Atom(s))
        }
    }

    fn skip_whitespace(&mut self) {
        while !self.is_eof() && self.peek().is_whitespace() {
            self.advance();
        }
    }

    fn peek(&self) -> char {
        if self.pos < self.input.len() {
            self.input[self.pos]
        } else {
            '\0'
        }
    }

    fn advance(&mut self) {
        if self.pos < self.input.len() {
            self.pos += 1;
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        if self.is_eof() {
            return Err(ParseError::UnexpectedEof);
        }

        let ch = self.peek();
        if ch == expected {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken(format!(
                "Expected '{}', found '{}'",
                expected, ch
            )))
        }
    }
}
