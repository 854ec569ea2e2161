//! Conditional dependency rules.
//!
//! A rule is the `if` clause of a `rules:` or `matches:` entry:
//!
//! ```text
//! target in [esp32, esp32s3] && idf_version >=5.0
//! $CONFIG{BT_ENABLED} == True || target != linux
//! ```
//!
//! Rules are parsed when the manifest is loaded and evaluated against a
//! [`BuildContext`] during resolution. Kconfig options missing from the
//! context make a comparison true, with a warning.

use std::cmp::Ordering;
use std::fmt;

use crate::core::context::{BuildContext, KconfigValue};
use crate::core::manifest::ManifestError;
use crate::core::version::VersionSpec;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    And,
    Or,
    Op(CmpOp),
    Config(String),
    Word(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Version-only operators kept verbatim for the spec parser.
    Tilde,
    Compatible,
    Caret,
}

impl CmpOp {
    fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Tilde => "~",
            CmpOp::Compatible => "~=",
            CmpOp::Caret => "^",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Target { negate: bool, values: Vec<String> },
    ToolchainVersion(VersionSpec),
    Config { name: String, op: CmpOp, value: String },
}

/// A parsed `if` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    raw: String,
    expr: Expr,
}

impl Rule {
    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let invalid = |reason: String| ManifestError::InvalidRule {
            rule: raw.to_string(),
            reason,
        };
        let tokens = lex(raw).map_err(&invalid)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr().map_err(&invalid)?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(format!(
                "unexpected `{}`",
                describe(&parser.tokens[parser.pos])
            )));
        }
        Ok(Rule {
            raw: raw.trim().to_string(),
            expr,
        })
    }

    pub fn evaluate(&self, ctx: &BuildContext) -> bool {
        eval(&self.expr, ctx, &self.raw)
    }

    /// Whether the rule mentions the build target.
    pub fn depends_on_target(&self) -> bool {
        fn walk(e: &Expr) -> bool {
            match e {
                Expr::And(a, b) | Expr::Or(a, b) => walk(a) || walk(b),
                Expr::Target { .. } => true,
                _ => false,
            }
        }
        walk(&self.expr)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::LParen => "(".into(),
        Token::RParen => ")".into(),
        Token::LBracket => "[".into(),
        Token::RBracket => "]".into(),
        Token::Comma => ",".into(),
        Token::And => "&&".into(),
        Token::Or => "||".into(),
        Token::Op(op) => op.as_str().into(),
        Token::Config(name) => format!("$CONFIG{{{}}}", name),
        Token::Word(w) => w.clone(),
    }
}

fn lex(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '<' | '>' => {
                let inclusive = next == Some('=');
                let op = match (c, inclusive) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                tokens.push(Token::Op(op));
                i += if inclusive { 2 } else { 1 };
            }
            '~' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Compatible));
                i += 2;
            }
            '~' => {
                tokens.push(Token::Op(CmpOp::Tilde));
                i += 1;
            }
            '^' => {
                tokens.push(Token::Op(CmpOp::Caret));
                i += 1;
            }
            '"' | '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| "unterminated string".to_string())?;
                tokens.push(Token::Word(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '$' => {
                let prefix: Vec<char> = "$CONFIG{".chars().collect();
                if !chars[i..].starts_with(&prefix) {
                    return Err("expected `$CONFIG{NAME}`".to_string());
                }
                let start = i + prefix.len();
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .map(|p| p + start)
                    .ok_or_else(|| "unterminated `$CONFIG{`".to_string())?;
                let name: String = chars[start..end].iter().collect();
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err("empty Kconfig option name".to_string());
                }
                tokens.push(Token::Config(name));
                i = end + 1;
            }
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character `{}`", other)),
        }
    }
    Ok(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+' | '*')
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.bump() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(format!("expected `{}`, found `{}`", describe(&want), describe(&t))),
            None => Err(format!("expected `{}`", describe(&want))),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.atom()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.atom()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn atom(&mut self) -> Result<Expr, String> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Config(name)) => {
                let op = match self.bump() {
                    Some(Token::Op(op)) if !version_only(op) => op,
                    _ => return Err(format!("expected comparison after $CONFIG{{{}}}", name)),
                };
                let value = self.word()?;
                Ok(Expr::Config { name, op, value })
            }
            Some(Token::Word(w)) if w == "target" => self.target(),
            Some(Token::Word(w)) if w == "idf_version" => self.toolchain_version(),
            Some(t) => Err(format!("unexpected `{}`", describe(&t))),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn word(&mut self) -> Result<String, String> {
        match self.bump() {
            Some(Token::Word(w)) => Ok(w),
            Some(t) => Err(format!("expected a value, found `{}`", describe(&t))),
            None => Err("expected a value".to_string()),
        }
    }

    fn target(&mut self) -> Result<Expr, String> {
        match self.bump() {
            Some(Token::Op(CmpOp::Eq)) => Ok(Expr::Target {
                negate: false,
                values: vec![self.word()?.to_lowercase()],
            }),
            Some(Token::Op(CmpOp::Ne)) => Ok(Expr::Target {
                negate: true,
                values: vec![self.word()?.to_lowercase()],
            }),
            Some(Token::Word(w)) if w == "in" => Ok(Expr::Target {
                negate: false,
                values: self.list()?,
            }),
            Some(Token::Word(w)) if w == "not" => {
                match self.bump() {
                    Some(Token::Word(w)) if w == "in" => {}
                    _ => return Err("expected `in` after `not`".to_string()),
                }
                Ok(Expr::Target {
                    negate: true,
                    values: self.list()?,
                })
            }
            _ => Err("expected `==`, `!=`, `in` or `not in` after `target`".to_string()),
        }
    }

    fn list(&mut self) -> Result<Vec<String>, String> {
        self.expect(Token::LBracket)?;
        let mut values = Vec::new();
        loop {
            match self.bump() {
                Some(Token::RBracket) => break,
                Some(Token::Word(w)) => values.push(w.to_lowercase()),
                Some(t) => return Err(format!("unexpected `{}` in list", describe(&t))),
                None => return Err("unterminated list".to_string()),
            }
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => break,
                _ => return Err("expected `,` or `]` in list".to_string()),
            }
        }
        Ok(values)
    }

    /// `idf_version >=5.0, <6` reads clauses while a comma is followed by
    /// another operator.
    fn toolchain_version(&mut self) -> Result<Expr, String> {
        let mut clauses = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) => {
                    let op = *op;
                    self.pos += 1;
                    op.as_str()
                }
                _ => "",
            };
            clauses.push(format!("{}{}", op, self.word()?));

            let continues = self.peek() == Some(&Token::Comma)
                && matches!(self.tokens.get(self.pos + 1), Some(Token::Op(_)));
            if !continues {
                break;
            }
            self.pos += 1;
        }
        let spec = clauses.join(",");
        VersionSpec::parse(&spec)
            .map(Expr::ToolchainVersion)
            .map_err(|e| e.to_string())
    }
}

fn version_only(op: CmpOp) -> bool {
    matches!(op, CmpOp::Tilde | CmpOp::Compatible | CmpOp::Caret)
}

fn eval(expr: &Expr, ctx: &BuildContext, raw: &str) -> bool {
    match expr {
        Expr::And(a, b) => eval(a, ctx, raw) && eval(b, ctx, raw),
        Expr::Or(a, b) => eval(a, ctx, raw) || eval(b, ctx, raw),
        Expr::Target { negate, values } => values.iter().any(|v| *v == ctx.target) != *negate,
        Expr::ToolchainVersion(spec) => match &ctx.toolchain_version {
            Some(version) => spec.matches_with(version, true),
            None => {
                tracing::warn!(
                    "toolchain version is unknown; assuming `{}` is true",
                    raw
                );
                true
            }
        },
        Expr::Config { name, op, value } => match ctx.kconfig.get(name) {
            Some(actual) => compare_kconfig(actual, *op, value),
            None => {
                tracing::warn!(
                    "Kconfig option `{}` is not set; assuming `{}` is true",
                    name,
                    raw
                );
                true
            }
        },
    }
}

fn compare_kconfig(actual: &KconfigValue, op: CmpOp, expected: &str) -> bool {
    let ordering = match actual {
        KconfigValue::Bool(b) => parse_kconfig_bool(expected).map(|e| b.cmp(&e)),
        KconfigValue::Int(i) => parse_int(expected).map(|e| i.cmp(&e)),
        KconfigValue::Str(s) => Some(s.as_str().cmp(expected)),
    };
    let Some(ordering) = ordering else {
        // type mismatch: only inequality holds
        return op == CmpOp::Ne;
    };
    match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Tilde | CmpOp::Compatible | CmpOp::Caret => false,
    }
}

fn parse_kconfig_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "y" | "yes" | "1" => Some(true),
        "false" | "n" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn parse_int(s: &str) -> Option<i64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::version::Version;
    use std::collections::BTreeMap;

    fn ctx() -> BuildContext {
        let mut kconfig = BTreeMap::new();
        kconfig.insert("BT_ENABLED".to_string(), KconfigValue::Bool(true));
        kconfig.insert("LOG_LEVEL".to_string(), KconfigValue::Int(3));
        kconfig.insert("CHIP".to_string(), KconfigValue::Str("esp32s3".into()));
        BuildContext::new("esp32s3", Some(Version::parse("5.1.2").unwrap())).with_kconfig(kconfig)
    }

    fn eval_rule(s: &str) -> bool {
        Rule::parse(s).unwrap().evaluate(&ctx())
    }

    #[test]
    fn test_target_rules() {
        assert!(eval_rule("target == esp32s3"));
        assert!(!eval_rule("target != esp32s3"));
        assert!(eval_rule("target in [esp32, esp32s3]"));
        assert!(!eval_rule("target not in [esp32, 'esp32s3']"));
    }

    #[test]
    fn test_toolchain_version_rules() {
        assert!(eval_rule("idf_version >=5.0"));
        assert!(eval_rule("idf_version >=5.0, <6"));
        assert!(!eval_rule("idf_version <5.1"));
        assert!(eval_rule("idf_version ^5"));
    }

    #[test]
    fn test_config_rules() {
        assert!(eval_rule("$CONFIG{BT_ENABLED} == True"));
        assert!(!eval_rule("$CONFIG{BT_ENABLED} == False"));
        assert!(eval_rule("$CONFIG{LOG_LEVEL} >= 2"));
        assert!(eval_rule("$CONFIG{CHIP} == \"esp32s3\""));
        assert!(eval_rule("$CONFIG{LOG_LEVEL} != abc"));
    }

    #[test]
    fn test_unknown_config_is_true() {
        assert!(eval_rule("$CONFIG{MISSING} == True"));
    }

    #[test]
    fn test_boolean_composition() {
        assert!(eval_rule("target == esp32 || idf_version >=5"));
        assert!(!eval_rule("target == esp32 && idf_version >=5"));
        assert!(eval_rule("(target == esp32 || target == esp32s3) && $CONFIG{LOG_LEVEL} > 1"));
    }

    #[test]
    fn test_depends_on_target() {
        assert!(Rule::parse("idf_version >=5 && target == linux")
            .unwrap()
            .depends_on_target());
        assert!(!Rule::parse("idf_version >=5").unwrap().depends_on_target());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Rule::parse("target").is_err());
        assert!(Rule::parse("target == esp32 &&").is_err());
        assert!(Rule::parse("platform == linux").is_err());
        assert!(Rule::parse("$CONFIG{} == 1").is_err());
        assert!(Rule::parse("target in [esp32").is_err());
        assert!(Rule::parse("(target == esp32").is_err());
    }
}
