//! Condition parser and evaluator for step `condition` gates.
//!
//! Conditions use a fixed operator set (see `ConditionOperator`) combined
//! with `and` / `or` / `not`. They are written either as a structured tree
//! or as a compact string:
//!
//! ```text
//! {{steps.fetch.ok}} == true && (exists {{steps.fetch.items}} || not {{vars.dry_run}})
//! ```
//!
//! `{{ path }}` operands are looked up in the run context; everything else is
//! a literal. Evaluation never fails outward: errors produce `false` with the
//! error attached to the `ConditionOutcome`.

use conductor_types::condition::{Condition, ConditionOperator, ConditionSpec};
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;

use super::context::{WorkflowContext, has_reference, single_reference, value_to_string};
use super::error::WorkflowError;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A `{{ path }}` lookup; absent paths resolve to *missing*.
    Reference(String),
    /// Text with embedded references, interpolated into a string.
    Template(String),
    Literal(Value),
}

/// Compiled condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        left: Operand,
        operator: ConditionOperator,
        right: Option<Operand>,
    },
    /// Bare operand: true when the resolved value is truthy.
    Truthy(Operand),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

/// Result of evaluating a condition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    pub result: bool,
    /// The condition with operands replaced by their resolved values.
    pub rendered: String,
    /// Parse or evaluation failure; `result` is `false` when set.
    pub error: Option<WorkflowError>,
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Compile a condition in either form.
pub fn compile(spec: &ConditionSpec) -> Result<Expr, WorkflowError> {
    match spec {
        ConditionSpec::Expression(text) => parse(text),
        ConditionSpec::Tree(tree) => from_tree(tree),
    }
}

/// Convert a structured condition tree.
pub fn from_tree(condition: &Condition) -> Result<Expr, WorkflowError> {
    match condition {
        Condition::Compare(cmp) => {
            if !cmp.operator.is_unary() && cmp.right.is_none() {
                return Err(WorkflowError::InvalidExpression(format!(
                    "operator '{}' needs a right operand",
                    cmp.operator.symbol()
                )));
            }
            Ok(Expr::Compare {
                left: operand_from_value(&cmp.left),
                operator: cmp.operator,
                right: cmp.right.as_ref().map(operand_from_value),
            })
        }
        Condition::And(children) => Ok(Expr::And(
            children.iter().map(from_tree).collect::<Result<_, _>>()?,
        )),
        Condition::Or(children) => Ok(Expr::Or(
            children.iter().map(from_tree).collect::<Result<_, _>>()?,
        )),
        Condition::Not(children) => match children.as_slice() {
            [only] => Ok(Expr::Not(Box::new(from_tree(only)?))),
            _ => Err(WorkflowError::InvalidExpression(format!(
                "not expects exactly one operand, got {}",
                children.len()
            ))),
        },
    }
}

fn operand_from_value(value: &Value) -> Operand {
    match value {
        Value::String(s) => {
            if let Some(path) = single_reference(s) {
                Operand::Reference(path.to_string())
            } else if has_reference(s) {
                Operand::Template(s.clone())
            } else {
                Operand::Literal(value.clone())
            }
        }
        other => Operand::Literal(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Reference(String),
    Quoted(String),
    Word(String),
    Symbol(&'static str),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

const SYMBOLS: &[&str] = &["==", "!=", ">=", "<=", "=~", "!~", ">", "<"];

fn tokenize(input: &str) -> Result<Vec<Token>, WorkflowError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let starts_with = |i: usize, pat: &str| -> bool {
        pat.chars()
            .enumerate()
            .all(|(k, c)| chars.get(i + k) == Some(&c))
    };

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if starts_with(i, "{{") {
            let rest: String = chars[i + 2..].iter().collect();
            let end = rest.find("}}").ok_or_else(|| {
                WorkflowError::InvalidExpression("unterminated '{{' reference".to_string())
            })?;
            let inner = rest[..end].trim().to_string();
            if inner.is_empty() {
                return Err(WorkflowError::InvalidExpression(
                    "empty '{{ }}' reference".to_string(),
                ));
            }
            i += 2 + rest[..end].chars().count() + 2;
            tokens.push(Token::Reference(inner));
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                match chars[i] {
                    '\\' if chars.get(i + 1).is_some_and(|&n| n == quote || n == '\\') => {
                        value.push(chars[i + 1]);
                        i += 2;
                    }
                    ch if ch == quote => {
                        i += 1;
                        closed = true;
                        break;
                    }
                    ch => {
                        value.push(ch);
                        i += 1;
                    }
                }
            }
            if !closed {
                return Err(WorkflowError::InvalidExpression(
                    "unterminated string literal".to_string(),
                ));
            }
            tokens.push(Token::Quoted(value));
            continue;
        }

        if starts_with(i, "&&") {
            tokens.push(Token::And);
            i += 2;
            continue;
        }
        if starts_with(i, "||") {
            tokens.push(Token::Or);
            i += 2;
            continue;
        }
        if let Some(&sym) = SYMBOLS.iter().find(|&&s| starts_with(i, s)) {
            tokens.push(Token::Symbol(sym));
            i += sym.len();
            continue;
        }
        match c {
            '!' => {
                tokens.push(Token::Not);
                i += 1;
                continue;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
                continue;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
                continue;
            }
            '&' | '|' | '=' => {
                return Err(WorkflowError::InvalidExpression(format!(
                    "unexpected '{c}' at position {i}"
                )));
            }
            _ => {}
        }

        let start = i;
        while i < chars.len() {
            let ch = chars[i];
            if ch.is_whitespace()
                || matches!(ch, '(' | ')' | '!' | '=' | '<' | '>' | '&' | '|' | '"' | '\'')
                || starts_with(i, "{{")
            {
                break;
            }
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        tokens.push(match word.as_str() {
            "and" | "AND" => Token::And,
            "or" | "OR" => Token::Or,
            "not" | "NOT" => Token::Not,
            _ => Token::Word(word),
        });
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse the compact string form.
pub fn parse(input: &str) -> Result<Expr, WorkflowError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(WorkflowError::InvalidExpression(
            "empty condition".to_string(),
        ));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(WorkflowError::InvalidExpression(format!(
            "unexpected token {token:?} after end of condition"
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, WorkflowError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, WorkflowError> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, WorkflowError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, WorkflowError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(WorkflowError::InvalidExpression(
                    "missing closing ')'".to_string(),
                )),
            };
        }

        // Prefix `exists x` / `not_exists x`.
        if let Some(Token::Word(word)) = self.peek() {
            if let Some(op) = ConditionOperator::parse(word).filter(|op| op.is_unary()) {
                self.pos += 1;
                let operand = self.parse_operand()?;
                return Ok(Expr::Compare {
                    left: operand,
                    operator: op,
                    right: None,
                });
            }
        }

        let left = self.parse_operand()?;

        let operator = match self.peek() {
            Some(Token::Symbol(sym)) => ConditionOperator::parse(sym),
            Some(Token::Word(word)) => ConditionOperator::parse(word),
            _ => None,
        };
        let Some(operator) = operator else {
            return Ok(Expr::Truthy(left));
        };
        self.pos += 1;

        if operator.is_unary() {
            return Ok(Expr::Compare {
                left,
                operator,
                right: None,
            });
        }

        let right = self.parse_operand()?;
        Ok(Expr::Compare {
            left,
            operator,
            right: Some(right),
        })
    }

    fn parse_operand(&mut self) -> Result<Operand, WorkflowError> {
        match self.next() {
            Some(Token::Reference(path)) => Ok(Operand::Reference(path)),
            Some(Token::Quoted(text)) => Ok(if has_reference(&text) {
                Operand::Template(text)
            } else {
                Operand::Literal(Value::String(text))
            }),
            Some(Token::Word(word)) => Ok(Operand::Literal(literal_from_word(&word))),
            Some(other) => Err(WorkflowError::InvalidExpression(format!(
                "expected an operand, found {other:?}"
            ))),
            None => Err(WorkflowError::InvalidExpression(
                "expected an operand, found end of condition".to_string(),
            )),
        }
    }
}

fn literal_from_word(word: &str) -> Value {
    match word {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => {
            if let Ok(n) = word.parse::<i64>() {
                Value::from(n)
            } else if let Some(n) = word
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
            {
                Value::Number(n)
            } else {
                Value::String(word.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates conditions against a run context, caching compiled regexes.
#[derive(Debug, Default)]
pub struct ConditionEvaluator {
    regex_cache: DashMap<String, Regex>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and evaluate a condition. Never fails; see `ConditionOutcome`.
    pub fn evaluate(&self, spec: &ConditionSpec, ctx: &WorkflowContext) -> ConditionOutcome {
        match compile(spec) {
            Ok(expr) => self.evaluate_expr(&expr, ctx),
            Err(error) => ConditionOutcome {
                result: false,
                rendered: raw_text(spec),
                error: Some(error),
            },
        }
    }

    /// Evaluate an already compiled condition.
    pub fn evaluate_expr(&self, expr: &Expr, ctx: &WorkflowContext) -> ConditionOutcome {
        let rendered = render(expr, ctx);
        match self.eval(expr, ctx) {
            Ok(result) => ConditionOutcome {
                result,
                rendered,
                error: None,
            },
            Err(error) => ConditionOutcome {
                result: false,
                rendered,
                error: Some(error),
            },
        }
    }

    fn eval(&self, expr: &Expr, ctx: &WorkflowContext) -> Result<bool, WorkflowError> {
        match expr {
            Expr::And(terms) => {
                for term in terms {
                    if !self.eval(term, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Or(terms) => {
                for term in terms {
                    if self.eval(term, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Not(inner) => Ok(!self.eval(inner, ctx)?),
            Expr::Truthy(operand) => Ok(is_truthy(resolve(operand, ctx).as_ref())),
            Expr::Compare {
                left,
                operator,
                right,
            } => {
                let left = resolve(left, ctx);
                let right = right.as_ref().and_then(|r| resolve(r, ctx));
                self.compare(*operator, left.as_ref(), right.as_ref())
            }
        }
    }

    fn compare(
        &self,
        operator: ConditionOperator,
        left: Option<&Value>,
        right: Option<&Value>,
    ) -> Result<bool, WorkflowError> {
        use ConditionOperator as Op;

        let both = left.zip(right);
        Ok(match operator {
            Op::Exists => left.is_some_and(|v| !v.is_null()),
            Op::NotExists => !left.is_some_and(|v| !v.is_null()),
            Op::Equals => both.is_some_and(|(l, r)| values_equal(l, r)),
            Op::NotEquals => !both.is_some_and(|(l, r)| values_equal(l, r)),
            Op::Contains => both.is_some_and(|(l, r)| contains(l, r)),
            Op::NotContains => !both.is_some_and(|(l, r)| contains(l, r)),
            Op::GreaterThan => ordering(both).is_some_and(|o| o.is_gt()),
            Op::GreaterThanOrEqual => ordering(both).is_some_and(|o| o.is_ge()),
            Op::LessThan => ordering(both).is_some_and(|o| o.is_lt()),
            Op::LessThanOrEqual => ordering(both).is_some_and(|o| o.is_le()),
            Op::Matches => self.matches(left, right)?,
            Op::NotMatches => !self.matches(left, right)?,
        })
    }

    fn matches(&self, left: Option<&Value>, right: Option<&Value>) -> Result<bool, WorkflowError> {
        let (Some(Value::String(text)), Some(Value::String(pattern))) = (left, right) else {
            return Err(WorkflowError::InvalidExpression(
                "matches requires string operands".to_string(),
            ));
        };

        if let Some(re) = self.regex_cache.get(pattern) {
            return Ok(re.is_match(text));
        }
        let re = Regex::new(pattern).map_err(|e| {
            WorkflowError::InvalidExpression(format!("invalid regex '{pattern}': {e}"))
        })?;
        let matched = re.is_match(text);
        self.regex_cache.insert(pattern.clone(), re);
        Ok(matched)
    }
}

fn resolve(operand: &Operand, ctx: &WorkflowContext) -> Option<Value> {
    match operand {
        Operand::Reference(path) => ctx.get_path(path),
        Operand::Template(text) => Some(Value::String(ctx.interpolate(text))),
        Operand::Literal(value) => Some(value.clone()),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) if left.is_number() && right.is_number() => l == r,
        _ => left == right,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

/// Ordering is only defined between two numbers or two strings.
fn ordering(pair: Option<(&Value, &Value)>) -> Option<std::cmp::Ordering> {
    match pair? {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn raw_text(spec: &ConditionSpec) -> String {
    match spec {
        ConditionSpec::Expression(text) => text.clone(),
        ConditionSpec::Tree(tree) => serde_json::to_string(tree).unwrap_or_default(),
    }
}

fn render(expr: &Expr, ctx: &WorkflowContext) -> String {
    match expr {
        Expr::Compare {
            left,
            operator,
            right,
        } => {
            let left = render_operand(left, ctx);
            match right {
                Some(right) => format!("{left} {} {}", operator.symbol(), render_operand(right, ctx)),
                None => format!("{} {left}", operator.symbol()),
            }
        }
        Expr::Truthy(operand) => render_operand(operand, ctx),
        Expr::And(terms) => join(terms, " && ", ctx),
        Expr::Or(terms) => join(terms, " || ", ctx),
        Expr::Not(inner) => format!("!{}", render(inner, ctx)),
    }
}

fn join(terms: &[Expr], sep: &str, ctx: &WorkflowContext) -> String {
    let parts: Vec<String> = terms.iter().map(|t| render(t, ctx)).collect();
    format!("({})", parts.join(sep))
}

fn render_operand(operand: &Operand, ctx: &WorkflowContext) -> String {
    match resolve(operand, ctx) {
        None => "<missing>".to_string(),
        Some(Value::String(s)) => format!("{s:?}"),
        Some(other) => value_to_string(&other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
