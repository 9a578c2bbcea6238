//! Label selector expressions.
//!
//! Selectors use the datastore's textual grammar:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | "all()" | "has(" label ")"
//!          | label "==" string | label "!=" string
//!          | label "in" set | label "not" "in" set
//! set     := "{" ( string ( "," string )* )? "}"
//! ```
//!
//! Strings may be single- or double-quoted. Every parsed selector is normalized so that
//! semantically equal selectors written differently share a canonical string, and therefore an
//! IP set identifier.

use crate::labels::Labels;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::{collections::BTreeSet, fmt, hash, str::FromStr, sync::Arc};

/// Number of hash characters retained in a selector's unique identifier.
const ID_HASH_LEN: usize = 28;

/// A parsed, normalized label selector.
#[derive(Clone)]
pub struct Selector {
    expr: Arc<Expr>,
    canonical: Arc<str>,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("selector is empty")]
    Empty,

    #[error("unexpected character {c:?} at offset {pos}")]
    UnexpectedChar { pos: usize, c: char },

    #[error("unterminated string starting at offset {pos}")]
    UnterminatedString { pos: usize },

    #[error("expected {expected}, found {found}")]
    Unexpected {
        expected: &'static str,
        found: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Expr {
    All,
    Has(String),
    Eq(String, String),
    Ne(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Label(String),
    Str(String),
    EqEq,
    NotEq,
    Not,
    And,
    Or,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

// === impl Selector ===

impl Selector {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let tokens = tokenize(s)?;
        if tokens.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.next() {
            return Err(ParseError::Unexpected {
                expected: "end of selector",
                found: tok.to_string(),
            });
        }
        Ok(Self::from_expr(expr))
    }

    /// Matches every set of labels.
    pub fn all() -> Self {
        Self::from_expr(Expr::All)
    }

    /// Matches no set of labels.
    pub fn deny_all() -> Self {
        Self::from_expr(Expr::Not(Box::new(Expr::All)))
    }

    /// Returns a selector that matches only when both selectors match.
    pub fn and(&self, other: &Self) -> Self {
        Self::from_expr(Expr::And(vec![
            (*self.expr).clone(),
            (*other.expr).clone(),
        ]))
    }

    /// Rewrites every label key referenced by this selector with the given prefix.
    ///
    /// Namespace selectors are evaluated against endpoint labels that carry a namespace prefix,
    /// so a namespace selector `name == "ns1"` becomes `pcns.name == "ns1"`.
    pub fn with_label_prefix(&self, prefix: &str) -> Self {
        Self::from_expr(self.expr.with_label_prefix(prefix))
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.expr.matches(labels)
    }

    /// The normalized textual form of the selector.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Derives a stable identifier from the canonical form: `<prefix>:<hash>`.
    pub fn unique_id(&self, prefix: &str) -> String {
        let digest = Sha256::digest(self.canonical.as_bytes());
        let mut hash = URL_SAFE_NO_PAD.encode(digest);
        hash.truncate(ID_HASH_LEN);
        format!("{prefix}:{hash}")
    }

    fn from_expr(expr: Expr) -> Self {
        let expr = expr.normalize();
        let canonical = expr.to_string().into();
        Self {
            expr: Arc::new(expr),
            canonical,
        }
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Selector").field(&self.canonical).finish()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Selector {}

impl hash::Hash for Selector {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state)
    }
}

impl PartialOrd for Selector {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Selector {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// === impl Expr ===

impl Expr {
    fn matches(&self, labels: &Labels) -> bool {
        match self {
            Self::All => true,
            Self::Has(k) => labels.contains_key(k),
            Self::Eq(k, v) => labels.get(k) == Some(v.as_str()),
            Self::Ne(k, v) => labels.get(k) != Some(v.as_str()),
            Self::In(k, vs) => labels.get(k).map_or(false, |v| vs.contains(v)),
            Self::NotIn(k, vs) => labels.get(k).map_or(true, |v| !vs.contains(v)),
            Self::Not(e) => !e.matches(labels),
            Self::And(es) => es.iter().all(|e| e.matches(labels)),
            Self::Or(es) => es.iter().any(|e| e.matches(labels)),
        }
    }

    fn with_label_prefix(&self, prefix: &str) -> Self {
        let key = |k: &String| format!("{prefix}{k}");
        match self {
            Self::All => Self::All,
            Self::Has(k) => Self::Has(key(k)),
            Self::Eq(k, v) => Self::Eq(key(k), v.clone()),
            Self::Ne(k, v) => Self::Ne(key(k), v.clone()),
            Self::In(k, vs) => Self::In(key(k), vs.clone()),
            Self::NotIn(k, vs) => Self::NotIn(key(k), vs.clone()),
            Self::Not(e) => Self::Not(Box::new(e.with_label_prefix(prefix))),
            Self::And(es) => Self::And(es.iter().map(|e| e.with_label_prefix(prefix)).collect()),
            Self::Or(es) => Self::Or(es.iter().map(|e| e.with_label_prefix(prefix)).collect()),
        }
    }

    fn normalize(self) -> Self {
        match self {
            Self::In(k, mut vs) if vs.len() == 1 => match vs.pop_first() {
                Some(v) => Self::Eq(k, v),
                None => Self::In(k, vs),
            },
            Self::NotIn(k, mut vs) if vs.len() == 1 => match vs.pop_first() {
                Some(v) => Self::Ne(k, v),
                None => Self::NotIn(k, vs),
            },
            Self::Not(e) => match (*e).normalize() {
                Self::Not(inner) => *inner,
                e => Self::Not(Box::new(e)),
            },
            Self::And(es) => Self::normalize_group(es, true),
            Self::Or(es) => Self::normalize_group(es, false),
            e => e,
        }
    }

    /// Flattens nested groups of the same operator, then orders and dedupes the operands.
    fn normalize_group(exprs: Vec<Self>, and: bool) -> Self {
        let mut flat = Vec::with_capacity(exprs.len());
        for e in exprs {
            match e.normalize() {
                Self::And(inner) if and => flat.extend(inner),
                Self::Or(inner) if !and => flat.extend(inner),
                e => flat.push(e),
            }
        }

        let mut keyed = flat
            .into_iter()
            .map(|e| (e.to_string(), e))
            .collect::<Vec<_>>();
        keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
        keyed.dedup_by(|(a, _), (b, _)| a == b);

        let mut exprs = keyed.into_iter().map(|(_, e)| e).collect::<Vec<_>>();
        if exprs.len() == 1 {
            return exprs.remove(0);
        }
        if and {
            Self::And(exprs)
        } else {
            Self::Or(exprs)
        }
    }

    fn is_group(&self) -> bool {
        matches!(self, Self::And(_) | Self::Or(_))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all()"),
            Self::Has(k) => write!(f, "has({k})"),
            Self::Eq(k, v) => write!(f, "{k} == {}", Quoted(v)),
            Self::Ne(k, v) => write!(f, "{k} != {}", Quoted(v)),
            Self::In(k, vs) => write!(f, "{k} in {}", QuotedSet(vs)),
            Self::NotIn(k, vs) => write!(f, "{k} not in {}", QuotedSet(vs)),
            Self::Not(e) if e.is_group() => write!(f, "!({e})"),
            Self::Not(e) => match **e {
                Self::Eq(..) | Self::Ne(..) | Self::In(..) | Self::NotIn(..) => write!(f, "!({e})"),
                _ => write!(f, "!{e}"),
            },
            Self::And(es) => {
                for (i, e) in es.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" && ")?;
                    }
                    if matches!(e, Self::Or(_)) {
                        write!(f, "({e})")?;
                    } else {
                        write!(f, "{e}")?;
                    }
                }
                Ok(())
            }
            Self::Or(es) => {
                for (i, e) in es.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" || ")?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
        }
    }
}

struct Quoted<'a>(&'a str);

impl fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.contains('"') {
            write!(f, "'{}'", self.0)
        } else {
            write!(f, "\"{}\"", self.0)
        }
    }
}

struct QuotedSet<'a>(&'a BTreeSet<String>);

impl fmt::Display for QuotedSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", Quoted(v))?;
        }
        f.write_str("}")
    }
}

// === impl Token ===

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Label(l) => write!(f, "label {l:?}"),
            Self::Str(s) => write!(f, "string {s:?}"),
            Self::EqEq => f.write_str("'=='"),
            Self::NotEq => f.write_str("'!='"),
            Self::Not => f.write_str("'!'"),
            Self::And => f.write_str("'&&'"),
            Self::Or => f.write_str("'||'"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
            Self::LBrace => f.write_str("'{'"),
            Self::RBrace => f.write_str("'}'"),
            Self::Comma => f.write_str("','"),
        }
    }
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')
}

fn tokenize(s: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = s.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        chars.next();
        let tok = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            '=' => match chars.next() {
                Some((_, '=')) => Token::EqEq,
                _ => return Err(ParseError::UnexpectedChar { pos, c }),
            },
            '&' => match chars.next() {
                Some((_, '&')) => Token::And,
                _ => return Err(ParseError::UnexpectedChar { pos, c }),
            },
            '|' => match chars.next() {
                Some((_, '|')) => Token::Or,
                _ => return Err(ParseError::UnexpectedChar { pos, c }),
            },
            '!' => {
                if let Some((_, '=')) = chars.peek() {
                    chars.next();
                    Token::NotEq
                } else {
                    Token::Not
                }
            }
            '"' | '\'' => {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, q)) if q == c => break,
                        Some((_, ch)) => value.push(ch),
                        None => return Err(ParseError::UnterminatedString { pos }),
                    }
                }
                Token::Str(value)
            }
            c if is_label_char(c) => {
                let mut label = c.to_string();
                while let Some(&(_, ch)) = chars.peek() {
                    if !is_label_char(ch) {
                        break;
                    }
                    label.push(ch);
                    chars.next();
                }
                Token::Label(label)
            }
            c => return Err(ParseError::UnexpectedChar { pos, c }),
        };
        tokens.push(tok);
    }

    Ok(tokens)
}

// === impl Parser ===

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect(&mut self, tok: Token, expected: &'static str) -> Result<(), ParseError> {
        match self.next() {
            Some(t) if t == tok => Ok(()),
            found => Err(unexpected(expected, found)),
        }
    }

    fn expect_str(&mut self) -> Result<String, ParseError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            found => Err(unexpected("a quoted string", found)),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            terms.push(self.parse_and()?);
        }
        if terms.len() == 1 {
            return Ok(terms.remove(0));
        }
        Ok(Expr::Or(terms))
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut terms = vec![self.parse_unary()?];
        while self.eat(&Token::And) {
            terms.push(self.parse_unary()?);
        }
        if terms.len() == 1 {
            return Ok(terms.remove(0));
        }
        Ok(Expr::And(terms))
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }

            Some(Token::Label(l)) if l == "all" && self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                self.expect(Token::RParen, "')'")?;
                Ok(Expr::All)
            }

            Some(Token::Label(l)) if l == "has" && self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                let key = match self.next() {
                    Some(Token::Label(k)) => k,
                    found => return Err(unexpected("a label", found)),
                };
                self.expect(Token::RParen, "')'")?;
                Ok(Expr::Has(key))
            }

            Some(Token::Label(key)) => match self.next() {
                Some(Token::EqEq) => Ok(Expr::Eq(key, self.expect_str()?)),
                Some(Token::NotEq) => Ok(Expr::Ne(key, self.expect_str()?)),
                Some(Token::Label(op)) if op == "in" => Ok(Expr::In(key, self.parse_set()?)),
                Some(Token::Label(op)) if op == "not" => {
                    match self.next() {
                        Some(Token::Label(op)) if op == "in" => {}
                        found => return Err(unexpected("'in'", found)),
                    }
                    Ok(Expr::NotIn(key, self.parse_set()?))
                }
                found => Err(unexpected("an operator", found)),
            },

            found => Err(unexpected("an expression", found)),
        }
    }

    fn parse_set(&mut self) -> Result<BTreeSet<String>, ParseError> {
        self.expect(Token::LBrace, "'{'")?;
        let mut values = BTreeSet::new();
        if self.eat(&Token::RBrace) {
            return Ok(values);
        }
        loop {
            values.insert(self.expect_str()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RBrace, "'}'")?;
            return Ok(values);
        }
    }
}

fn unexpected(expected: &'static str, found: Option<Token>) -> ParseError {
    ParseError::Unexpected {
        expected,
        found: found.map_or_else(|| "end of selector".to_string(), |t| t.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&'static str, &'static str)]) -> Labels {
        pairs.iter().copied().collect()
    }

    #[test]
    fn canonicalizes_quoting_and_whitespace() {
        let a = Selector::parse("egress-provider == 'true'").unwrap();
        let b = Selector::parse(r#"egress-provider=="true""#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical(), r#"egress-provider == "true""#);
        assert_eq!(a.unique_id("e"), b.unique_id("e"));
    }

    #[test]
    fn canonicalizes_operand_order() {
        let a = Selector::parse("a == 'x' && b == 'y' && has(c)").unwrap();
        let b = Selector::parse("has(c) && (b == 'y' && a == 'x')").unwrap();
        assert_eq!(a, b);

        let c = Selector::parse("a == 'x' || a == 'x'").unwrap();
        assert_eq!(c.canonical(), r#"a == "x""#);
    }

    #[test]
    fn canonicalizes_sets() {
        let a = Selector::parse("color in {'red', \"blue\", 'red'}").unwrap();
        assert_eq!(a.canonical(), r#"color in {"blue", "red"}"#);

        let single = Selector::parse("color in {'red'}").unwrap();
        assert_eq!(single, Selector::parse("color == 'red'").unwrap());

        let not_single = Selector::parse("color not in {'red'}").unwrap();
        assert_eq!(not_single, Selector::parse("color != 'red'").unwrap());
    }

    #[test]
    fn double_negation_collapses() {
        let a = Selector::parse("!!has(a)").unwrap();
        assert_eq!(a, Selector::parse("has(a)").unwrap());
        assert_eq!(Selector::deny_all().canonical(), "!all()");
    }

    #[test]
    fn canonical_form_reparses() {
        for s in [
            "a == 'x' && (b == 'y' || c != 'z')",
            "!(a == 'x' && has(b))",
            "k not in {'a', 'b'} || !has(q)",
            "!all()",
            "x in {}",
        ] {
            let sel = Selector::parse(s).unwrap();
            let reparsed = Selector::parse(sel.canonical()).unwrap();
            assert_eq!(sel.canonical(), reparsed.canonical(), "{s}");
        }
    }

    #[test]
    fn matches_labels() {
        let ls = labels(&[("app", "web"), ("tier", "frontend")]);

        let cases = [
            ("all()", true),
            ("!all()", false),
            ("has(app)", true),
            ("!has(app)", false),
            ("app == 'web'", true),
            ("app != 'web'", false),
            ("missing != 'web'", true),
            ("app in {'web', 'db'}", true),
            ("app not in {'web', 'db'}", false),
            ("missing not in {'web'}", true),
            ("missing in {'web'}", false),
            ("app == 'web' && tier == 'backend'", false),
            ("app == 'web' || tier == 'backend'", true),
            ("!(app == 'db') && has(tier)", true),
            ("x in {}", false),
        ];
        for (s, expected) in cases {
            let sel = Selector::parse(s).unwrap();
            assert_eq!(sel.matches(&ls), expected, "{s}");
        }
    }

    #[test]
    fn prefixes_labels() {
        let sel = Selector::parse("name == 'ns1' || has(team)")
            .unwrap()
            .with_label_prefix("pcns.");
        assert_eq!(sel.canonical(), r#"has(pcns.team) || pcns.name == "ns1""#);
        assert!(sel.matches(&labels(&[("pcns.name", "ns1")])));
        assert!(!sel.matches(&labels(&[("name", "ns1")])));
    }

    #[test]
    fn conjunction() {
        let ns = Selector::parse("name == 'ns1'").unwrap();
        let gw = Selector::parse("egress == 'gw'").unwrap();
        let both = ns.with_label_prefix("pcns.").and(&gw);
        assert!(both.matches(&labels(&[("pcns.name", "ns1"), ("egress", "gw")])));
        assert!(!both.matches(&labels(&[("egress", "gw")])));
    }

    #[test]
    fn unique_ids() {
        let sel = Selector::parse("has(a)").unwrap();
        let id = sel.unique_id("e");
        assert!(id.starts_with("e:"));
        assert_eq!(id.len(), 2 + ID_HASH_LEN);
        assert_ne!(id, Selector::parse("has(b)").unwrap().unique_id("e"));
        assert_ne!(id, sel.unique_id("s"));
    }

    #[test]
    fn rejects_invalid() {
        assert_eq!(Selector::parse("  "), Err(ParseError::Empty));
        assert!(matches!(
            Selector::parse("a = 'b'"),
            Err(ParseError::UnexpectedChar { c: '=', .. })
        ));
        assert!(matches!(
            Selector::parse("a == 'b"),
            Err(ParseError::UnterminatedString { pos: 5 })
        ));
        assert!(Selector::parse("a == b").is_err());
        assert!(Selector::parse("has(a").is_err());
        assert!(Selector::parse("a == 'x' b == 'y'").is_err());
        assert!(Selector::parse("a not {'x'}").is_err());
        assert!(Selector::parse("a in {'x',}").is_err());
    }

    #[test]
    fn serde_uses_canonical_string() {
        let sel: Selector = serde_json::from_str(r#""b == 'y' && a == 'x'""#).unwrap();
        assert_eq!(
            serde_json::to_string(&sel).unwrap(),
            r#""a == \"x\" && b == \"y\"""#
        );
    }
}
