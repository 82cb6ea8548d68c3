//! Alertas por fórmula: expressões booleanas sobre um vocabulário fixo.
//!
//! A expressão é parseada para uma AST tipada e avaliada diretamente.
//! A gramática só conhece literais, as variáveis do vocabulário,
//! aritmética, comparações e conectivos booleanos; chamadas de função,
//! acesso a atributos e nomes desconhecidos são rejeitados no parse.
//!
//! ```text
//! expr    := or
//! or      := and ("or" and)*
//! and     := not ("and" not)*
//! not     := "not" not | compare
//! compare := sum (cmp_op sum)*          -- encadeável: 10 < x <= 20
//! sum     := term (("+" | "-") term)*
//! term    := unary (("*" | "/" | "//" | "%") unary)*
//! unary   := ("-" | "+") unary | power
//! power   := atom ("**" unary)?
//! atom    := número | string | True | False | variável
//!          | "(" expr ")" | "[" lista "]" | "(" lista ")"
//! cmp_op  := "<" | "<=" | ">" | ">=" | "==" | "!=" | "in" | "not in"
//! ```

use crate::types::TelemetrySample;
use std::fmt;
use std::str::FromStr;

/// Tamanho máximo do texto de uma fórmula, em bytes.
pub const MAX_SOURCE_LEN: usize = 4096;
/// Profundidade máxima de aninhamento aceita pelo parser.
pub const MAX_DEPTH: usize = 64;

/// Erros de parse, avaliação e formatação de mensagens.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormulaError {
    #[error("syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("name '{0}' is not defined")]
    UnknownVariable(String),

    #[error("unsupported operand types for {op}: '{lhs}' and '{rhs}'")]
    Type {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("bad operand type for unary {op}: '{operand}'")]
    UnaryType {
        op: &'static str,
        operand: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("invalid variable in formula message: '{0}'")]
    UnknownPlaceholder(String),

    #[error("invalid formula message: {0}")]
    Template(String),
}

// ──────────────────────────────────────────────
// Vocabulário
// ──────────────────────────────────────────────

/// Variáveis que uma fórmula pode referenciar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    UpsLoad,
    BatteryCharge,
    BatteryRuntime,
    ActualRuntimeMinutes,
    BatteryVoltage,
    InputVoltage,
    UpsStatus,
}

impl Variable {
    pub const ALL: [Variable; 7] = [
        Variable::UpsLoad,
        Variable::BatteryCharge,
        Variable::BatteryRuntime,
        Variable::ActualRuntimeMinutes,
        Variable::BatteryVoltage,
        Variable::InputVoltage,
        Variable::UpsStatus,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::UpsLoad => "ups_load",
            Self::BatteryCharge => "battery_charge",
            Self::BatteryRuntime => "battery_runtime",
            Self::ActualRuntimeMinutes => "actual_runtime_minutes",
            Self::BatteryVoltage => "battery_voltage",
            Self::InputVoltage => "input_voltage",
            Self::UpsStatus => "ups_status",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.name() == name)
    }
}

/// Valores do vocabulário extraídos de uma amostra.
///
/// Variáveis numéricas ausentes valem 0; o runtime chega em segundos e
/// é convertido para minutos em `actual_runtime_minutes`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsEnv {
    pub ups_load: f64,
    pub battery_charge: f64,
    pub battery_runtime: f64,
    pub actual_runtime_minutes: f64,
    pub battery_voltage: f64,
    pub input_voltage: f64,
    /// Status em minúsculas (`"ol"`, `"ob lb"`…)
    pub ups_status: String,
}

impl UpsEnv {
    pub fn from_sample(sample: &TelemetrySample) -> Self {
        let number = |key: &str| sample.number(key).unwrap_or(0.0);
        let battery_runtime = number("battery.runtime");
        Self {
            ups_load: number("ups.load"),
            battery_charge: number("battery.charge"),
            battery_runtime,
            actual_runtime_minutes: battery_runtime / 60.0,
            battery_voltage: number("battery.voltage"),
            input_voltage: number("input.voltage"),
            ups_status: sample
                .text("ups.status")
                .unwrap_or_default()
                .trim()
                .to_lowercase(),
        }
    }

    pub fn get(&self, var: Variable) -> Value {
        match var {
            Variable::UpsLoad => Value::Number(self.ups_load),
            Variable::BatteryCharge => Value::Number(self.battery_charge),
            Variable::BatteryRuntime => Value::Number(self.battery_runtime),
            Variable::ActualRuntimeMinutes => Value::Number(self.actual_runtime_minutes),
            Variable::BatteryVoltage => Value::Number(self.battery_voltage),
            Variable::InputVoltage => Value::Number(self.input_voltage),
            Variable::UpsStatus => Value::Text(self.ups_status.clone()),
        }
    }
}

// ──────────────────────────────────────────────
// Valores
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
    Bool(bool),
    List(Vec<Value>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Text(_) => "str",
            Self::Bool(_) => "bool",
            Self::List(_) => "list",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Number(n) => *n != 0.0,
            Self::Text(s) => !s.is_empty(),
            Self::Bool(b) => *b,
            Self::List(items) => !items.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", format_number(*n)),
            Self::Text(s) => f.write_str(s),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Floats inteiros exibidos com `.0`, como o operador os digitaria.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{n:.1}")
    } else {
        format!("{n}")
    }
}

// ──────────────────────────────────────────────
// AST
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
}

impl ArithOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Rem => "%",
            Self::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    In,
    NotIn,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(Variable),
    List(Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Arith {
        op: ArithOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Comparação encadeada: `a < b < c` equivale a `a < b and b < c`.
    Compare {
        first: Box<Expr>,
        rest: Vec<(CompareOp, Expr)>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn eval(&self, env: &UpsEnv) -> Result<Value, FormulaError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Var(var) => Ok(env.get(*var)),
            Self::List(items) => items
                .iter()
                .map(|item| item.eval(env))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Self::Neg(inner) => match inner.eval(env)? {
                Value::Number(n) => Ok(Value::Number(-n)),
                other => Err(FormulaError::UnaryType {
                    op: "-",
                    operand: other.type_name(),
                }),
            },
            Self::Not(inner) => Ok(Value::Bool(!inner.eval(env)?.truthy())),
            Self::Arith { op, lhs, rhs } => arith(*op, lhs.eval(env)?, rhs.eval(env)?),
            Self::Compare { first, rest } => {
                let mut left = first.eval(env)?;
                for (op, next) in rest {
                    let right = next.eval(env)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            // `and`/`or` devolvem o operando decisivo, não um booleano
            Self::And(lhs, rhs) => {
                let left = lhs.eval(env)?;
                if left.truthy() { rhs.eval(env) } else { Ok(left) }
            }
            Self::Or(lhs, rhs) => {
                let left = lhs.eval(env)?;
                if left.truthy() { Ok(left) } else { rhs.eval(env) }
            }
        }
    }
}

fn arith(op: ArithOp, lhs: Value, rhs: Value) -> Result<Value, FormulaError> {
    let (a, b) = match (&lhs, &rhs) {
        (Value::Number(a), Value::Number(b)) => (*a, *b),
        (Value::Text(a), Value::Text(b)) if op == ArithOp::Add => {
            return Ok(Value::Text(format!("{a}{b}")));
        }
        _ => {
            return Err(FormulaError::Type {
                op: op.symbol(),
                lhs: lhs.type_name(),
                rhs: rhs.type_name(),
            });
        }
    };
    let result = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Pow if a == 0.0 && b < 0.0 => return Err(FormulaError::DivisionByZero),
        ArithOp::Pow => a.powf(b),
        ArithOp::Div | ArithOp::FloorDiv | ArithOp::Rem if b == 0.0 => {
            return Err(FormulaError::DivisionByZero);
        }
        ArithOp::Div => a / b,
        ArithOp::FloorDiv => (a / b).floor(),
        // Resto com o sinal do divisor
        ArithOp::Rem => a - b * (a / b).floor(),
    };
    Ok(Value::Number(result))
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<bool, FormulaError> {
    let type_error = || FormulaError::Type {
        op: op.symbol(),
        lhs: lhs.type_name(),
        rhs: rhs.type_name(),
    };
    match op {
        CompareOp::Eq => Ok(lhs == rhs),
        CompareOp::Ne => Ok(lhs != rhs),
        CompareOp::In | CompareOp::NotIn => {
            let found = match (lhs, rhs) {
                (_, Value::List(items)) => items.contains(lhs),
                (Value::Text(needle), Value::Text(haystack)) => haystack.contains(needle.as_str()),
                _ => return Err(type_error()),
            };
            Ok(found == (op == CompareOp::In))
        }
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
                _ => return Err(type_error()),
            };
            // NaN não é ordenável: toda comparação é falsa
            let Some(ordering) = ordering else {
                return Ok(false);
            };
            Ok(match op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
    }
}

// ──────────────────────────────────────────────
// Fórmula compilada
// ──────────────────────────────────────────────

/// Expressão parseada, pronta para avaliar contra um [`UpsEnv`].
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(syntax(
                MAX_SOURCE_LEN,
                format!("expression longer than {MAX_SOURCE_LEN} bytes"),
            ));
        }
        let tokens = lex(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
            depth: 0,
        };
        let expr = parser.expression()?;
        if let Some(tok) = parser.peek_token() {
            return Err(FormulaError::Syntax {
                position: tok.position,
                message: format!("unexpected {}", tok.kind.describe()),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Avalia a fórmula; o resultado é a "truthiness" do valor final.
    pub fn evaluate(&self, env: &UpsEnv) -> Result<bool, FormulaError> {
        self.expr.eval(env).map(|v| v.truthy())
    }
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ──────────────────────────────────────────────
// Lexer
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    And,
    Or,
    Not,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            Self::Number(n) => format!("number {}", format_number(*n)),
            Self::Str(s) => format!("string '{s}'"),
            Self::Ident(name) => format!("name '{name}'"),
            Self::True => "'True'".into(),
            Self::False => "'False'".into(),
            Self::And => "'and'".into(),
            Self::Or => "'or'".into(),
            Self::Not => "'not'".into(),
            Self::In => "'in'".into(),
            Self::LParen => "'('".into(),
            Self::RParen => "')'".into(),
            Self::LBracket => "'['".into(),
            Self::RBracket => "']'".into(),
            Self::Comma => "','".into(),
            Self::Plus => "'+'".into(),
            Self::Minus => "'-'".into(),
            Self::Star => "'*'".into(),
            Self::StarStar => "'**'".into(),
            Self::Slash => "'/'".into(),
            Self::SlashSlash => "'//'".into(),
            Self::Percent => "'%'".into(),
            Self::Lt => "'<'".into(),
            Self::Le => "'<='".into(),
            Self::Gt => "'>'".into(),
            Self::Ge => "'>='".into(),
            Self::EqEq => "'=='".into(),
            Self::NotEq => "'!='".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn syntax(position: usize, message: impl Into<String>) -> FormulaError {
    FormulaError::Syntax {
        position,
        message: message.into(),
    }
}

fn lex(source: &str) -> Result<Vec<Token>, FormulaError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let (kind, len) = match c {
            b'0'..=b'9' => lex_number(source, start)?,
            b'.' if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                lex_number(source, start)?
            }
            b'.' => return Err(syntax(start, "attribute access is not allowed")),
            b'"' | b'\'' => lex_string(source, start)?,
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let len = source[start..]
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .unwrap_or(source.len() - start);
                let word = &source[start..start + len];
                let kind = match word {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "in" => TokenKind::In,
                    "True" | "true" => TokenKind::True,
                    "False" | "false" => TokenKind::False,
                    _ => TokenKind::Ident(word.to_string()),
                };
                (kind, len)
            }
            b'(' => (TokenKind::LParen, 1),
            b')' => (TokenKind::RParen, 1),
            b'[' => (TokenKind::LBracket, 1),
            b']' => (TokenKind::RBracket, 1),
            b',' => (TokenKind::Comma, 1),
            b'+' => (TokenKind::Plus, 1),
            b'-' => (TokenKind::Minus, 1),
            b'%' => (TokenKind::Percent, 1),
            b'*' if bytes.get(i + 1) == Some(&b'*') => (TokenKind::StarStar, 2),
            b'*' => (TokenKind::Star, 1),
            b'/' if bytes.get(i + 1) == Some(&b'/') => (TokenKind::SlashSlash, 2),
            b'/' => (TokenKind::Slash, 1),
            b'<' if bytes.get(i + 1) == Some(&b'=') => (TokenKind::Le, 2),
            b'<' => (TokenKind::Lt, 1),
            b'>' if bytes.get(i + 1) == Some(&b'=') => (TokenKind::Ge, 2),
            b'>' => (TokenKind::Gt, 1),
            b'=' if bytes.get(i + 1) == Some(&b'=') => (TokenKind::EqEq, 2),
            b'=' => return Err(syntax(start, "assignment is not allowed, use '=='")),
            b'!' if bytes.get(i + 1) == Some(&b'=') => (TokenKind::NotEq, 2),
            _ => {
                let ch = source[start..].chars().next().unwrap_or('?');
                return Err(syntax(start, format!("unexpected character '{ch}'")));
            }
        };

        tokens.push(Token {
            kind,
            position: start,
        });
        i = start + len;
    }

    Ok(tokens)
}

fn lex_number(source: &str, start: usize) -> Result<(TokenKind, usize), FormulaError> {
    let bytes = source.as_bytes();
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && matches!(bytes[exp], b'+' | b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            while exp < bytes.len() && bytes[exp].is_ascii_digit() {
                exp += 1;
            }
            end = exp;
        }
    }
    let text = &source[start..end];
    let value = text
        .parse::<f64>()
        .map_err(|_| syntax(start, format!("invalid number '{text}'")))?;
    Ok((TokenKind::Number(value), end - start))
}

fn lex_string(source: &str, start: usize) -> Result<(TokenKind, usize), FormulaError> {
    let mut chars = source[start..].char_indices();
    let (_, quote) = chars.next().ok_or_else(|| syntax(start, "empty string"))?;
    let mut out = String::new();
    while let Some((offset, c)) = chars.next() {
        match c {
            '\\' => {
                let (_, escaped) = chars
                    .next()
                    .ok_or_else(|| syntax(start, "unterminated string"))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
            }
            c if c == quote => return Ok((TokenKind::Str(out), offset + c.len_utf8())),
            other => out.push(other),
        }
    }
    Err(syntax(start, "unterminated string"))
}

// ──────────────────────────────────────────────
// Parser (descida recursiva)
// ──────────────────────────────────────────────

/// `depth` conta parênteses, operadores unários e operadores encadeados
/// abertos; limita a altura da AST e, com ela, a recursão do parse e da
/// avaliação.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek_token(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.peek_token().map(|t| &t.kind)
    }

    fn peek_at(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| &t.kind)
    }

    fn position(&self) -> usize {
        self.peek_token().map(|t| t.position).unwrap_or(self.end)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), FormulaError> {
        if self.eat(&kind) {
            return Ok(());
        }
        let found = match self.peek() {
            Some(tok) => tok.describe(),
            None => "end of expression".to_string(),
        };
        Err(syntax(
            self.position(),
            format!("expected {}, found {found}", kind.describe()),
        ))
    }

    fn descend(&mut self) -> Result<(), FormulaError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(syntax(self.position(), "expression nested too deeply"));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr, FormulaError> {
        let saved = self.depth;
        self.descend()?;
        let mut lhs = self.and_expr()?;
        while self.eat(&TokenKind::Or) {
            self.descend()?;
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth = saved;
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, FormulaError> {
        let saved = self.depth;
        let mut lhs = self.not_expr()?;
        while self.eat(&TokenKind::And) {
            self.descend()?;
            let rhs = self.not_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        self.depth = saved;
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, FormulaError> {
        if self.eat(&TokenKind::Not) {
            self.descend()?;
            let inner = self.not_expr()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, FormulaError> {
        let first = self.sum()?;
        let mut rest = Vec::new();
        loop {
            let op = match (self.peek(), self.peek_at(1)) {
                (Some(TokenKind::Lt), _) => CompareOp::Lt,
                (Some(TokenKind::Le), _) => CompareOp::Le,
                (Some(TokenKind::Gt), _) => CompareOp::Gt,
                (Some(TokenKind::Ge), _) => CompareOp::Ge,
                (Some(TokenKind::EqEq), _) => CompareOp::Eq,
                (Some(TokenKind::NotEq), _) => CompareOp::Ne,
                (Some(TokenKind::In), _) => CompareOp::In,
                (Some(TokenKind::Not), Some(TokenKind::In)) => {
                    self.pos += 1;
                    CompareOp::NotIn
                }
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.sum()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn sum(&mut self) -> Result<Expr, FormulaError> {
        let saved = self.depth;
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => ArithOp::Add,
                Some(TokenKind::Minus) => ArithOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            let rhs = self.term()?;
            lhs = Expr::Arith {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.depth = saved;
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let saved = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => ArithOp::Mul,
                Some(TokenKind::Slash) => ArithOp::Div,
                Some(TokenKind::SlashSlash) => ArithOp::FloorDiv,
                Some(TokenKind::Percent) => ArithOp::Rem,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            let rhs = self.unary()?;
            lhs = Expr::Arith {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.depth = saved;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if self.eat(&TokenKind::Minus) {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        if self.eat(&TokenKind::Plus) {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(inner);
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, FormulaError> {
        let base = self.atom()?;
        if self.eat(&TokenKind::StarStar) {
            self.descend()?;
            let exponent = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Arith {
                op: ArithOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, FormulaError> {
        let position = self.position();
        let Some(token) = self.tokens.get(self.pos).cloned() else {
            return Err(syntax(position, "unexpected end of expression"));
        };
        self.pos += 1;

        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::Text(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Ident(name) => {
                if self.peek() == Some(&TokenKind::LParen) {
                    return Err(syntax(
                        position,
                        format!("function calls are not allowed ('{name}')"),
                    ));
                }
                Variable::from_name(&name)
                    .map(Expr::Var)
                    .ok_or(FormulaError::UnknownVariable(name))
            }
            TokenKind::LParen => {
                let first = self.expression()?;
                if self.eat(&TokenKind::Comma) {
                    let items = self.list_tail(first, TokenKind::RParen)?;
                    return Ok(Expr::List(items));
                }
                self.expect(TokenKind::RParen)?;
                Ok(first)
            }
            TokenKind::LBracket => {
                if self.eat(&TokenKind::RBracket) {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.expression()?;
                let items = if self.eat(&TokenKind::Comma) {
                    self.list_tail(first, TokenKind::RBracket)?
                } else {
                    self.expect(TokenKind::RBracket)?;
                    vec![first]
                };
                Ok(Expr::List(items))
            }
            other => Err(syntax(position, format!("unexpected {}", other.describe()))),
        }
    }

    /// Resto de uma lista depois do primeiro item e da vírgula.
    fn list_tail(&mut self, first: Expr, close: TokenKind) -> Result<Vec<Expr>, FormulaError> {
        let mut items = vec![first];
        while !self.eat(&close) {
            items.push(self.expression()?);
            if !self.eat(&TokenKind::Comma) {
                self.expect(close)?;
                break;
            }
        }
        Ok(items)
    }
}

// ──────────────────────────────────────────────
// Mensagens com interpolação
// ──────────────────────────────────────────────

/// Substitui `{variavel}` e `{variavel:.1f}` pelos valores do vocabulário.
///
/// `{{` e `}}` produzem chaves literais. Especificações aceitas: vazia,
/// `.Nf`, `f` e `d`.
pub fn render_template(template: &str, env: &UpsEnv) -> Result<String, FormulaError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(FormulaError::Template("single '}' encountered".into())),
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => {
                            return Err(FormulaError::Template("unclosed '{' in message".into()));
                        }
                    }
                }
                let (name, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                let name = name.trim();
                let var = Variable::from_name(name)
                    .ok_or_else(|| FormulaError::UnknownPlaceholder(name.to_string()))?;
                out.push_str(&format_value(&env.get(var), spec)?);
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

fn format_value(value: &Value, spec: &str) -> Result<String, FormulaError> {
    let invalid = || FormulaError::Template(format!("invalid format spec '{spec}'"));
    if spec.is_empty() {
        return Ok(value.to_string());
    }
    let Value::Number(n) = value else {
        return Err(invalid());
    };
    match spec {
        "f" => Ok(format!("{n:.6}")),
        "d" if n.fract() == 0.0 => Ok(format!("{n:.0}")),
        _ => {
            let digits = spec
                .strip_prefix('.')
                .and_then(|s| s.strip_suffix('f'))
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(invalid)?;
            Ok(format!("{n:.digits$}"))
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
