//! Arithmetic formulas for rate constants.
//!
//! Formulas such as `k0 * exp(-Ea / (R * temperature))` are parsed once with
//! nom, then evaluated either against named values ([`EvaluationContext`])
//! or, after [`Expression::bind`], against a plain slice of values indexed
//! by slot, which is what the kinetic evaluators do in their inner loop.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, multispace0},
    combinator::recognize,
    multi::many0,
    number::complete::double,
    sequence::{delimited, pair},
    IResult, Parser,
};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Error that can occur during expression parsing or evaluation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Failed to parse expression: {message}")]
    ParseError { message: String },

    #[error("Undefined variable: {name}")]
    UndefinedVariable { name: String },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("Undefined function: {name}")]
    UndefinedFunction { name: String },
}

/// Result type for expression evaluation
type ExprResult<T> = Result<T, ExpressionError>;

/// Expression AST node
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Constant number
    Number(f64),

    /// Variable reference
    Variable(String),

    /// Variable resolved to a position in a value slice
    Slot(usize),

    /// Negation
    Neg(Box<Expression>),

    /// Binary operations
    Binary(BinaryOp, Box<Expression>, Box<Expression>),

    /// Function call
    Function(String, Vec<Expression>),
}

/// Binary operations
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Context for expression evaluation, providing variable values
pub trait EvaluationContext {
    /// Get the value of a variable
    fn get_variable(&self, name: &str) -> ExprResult<f64>;

    /// Get the value of a bound slot
    fn get_slot(&self, slot: usize) -> ExprResult<f64> {
        Err(ExpressionError::InvalidOperation {
            message: format!("slot {} used in an unbound context", slot),
        })
    }
}

/// Simple implementation of EvaluationContext using a HashMap
#[derive(Debug, Clone, Default)]
pub struct SimpleContext {
    variables: HashMap<String, f64>,
}

impl SimpleContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable value
    pub fn set_variable(&mut self, name: &str, value: f64) {
        self.variables.insert(name.to_string(), value);
    }

    /// Create a new context with the given variables
    pub fn with_variables(variables: HashMap<String, f64>) -> Self {
        Self { variables }
    }
}

impl EvaluationContext for SimpleContext {
    fn get_variable(&self, name: &str) -> ExprResult<f64> {
        self.variables
            .get(name)
            .copied()
            .ok_or_else(|| ExpressionError::UndefinedVariable {
                name: name.to_string(),
            })
    }
}

/// Values of bound expressions, indexed by slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotValues<'a>(pub &'a [f64]);

impl EvaluationContext for SlotValues<'_> {
    fn get_variable(&self, name: &str) -> ExprResult<f64> {
        Err(ExpressionError::UndefinedVariable {
            name: name.to_string(),
        })
    }

    fn get_slot(&self, slot: usize) -> ExprResult<f64> {
        self.0
            .get(slot)
            .copied()
            .ok_or_else(|| ExpressionError::InvalidOperation {
                message: format!("slot {} out of {} values", slot, self.0.len()),
            })
    }
}

fn one_argument(name: &str, args: &[f64]) -> ExprResult<f64> {
    match args {
        [x] => Ok(*x),
        _ => Err(ExpressionError::InvalidOperation {
            message: format!("{}() requires 1 argument, got {}", name, args.len()),
        }),
    }
}

fn call_function(name: &str, args: &[f64]) -> ExprResult<f64> {
    let f: fn(f64) -> f64 = match name {
        "exp" => f64::exp,
        "log" | "ln" => f64::ln,
        "log10" => f64::log10,
        "sqrt" => f64::sqrt,
        "abs" => f64::abs,
        "sin" => f64::sin,
        "cos" => f64::cos,
        "tanh" => f64::tanh,
        "max" | "min" => {
            if args.len() < 2 {
                return Err(ExpressionError::InvalidOperation {
                    message: format!("{}() requires at least 2 arguments", name),
                });
            }
            return Ok(if name == "max" {
                args.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b))
            } else {
                args.iter().fold(f64::INFINITY, |a, &b| a.min(b))
            });
        }
        _ => {
            return Err(ExpressionError::UndefinedFunction {
                name: name.to_string(),
            })
        }
    };
    Ok(f(one_argument(name, args)?))
}

impl Expression {
    /// Parse an expression from a string
    pub fn parse(input: &str) -> ExprResult<Self> {
        match expr_parser(input.trim()) {
            Ok((remainder, expr)) if remainder.trim().is_empty() => Ok(expr),
            Ok((remainder, _)) => Err(ExpressionError::ParseError {
                message: format!("Unexpected trailing characters: '{}'", remainder),
            }),
            Err(e) => Err(ExpressionError::ParseError {
                message: format!("{:?}", e),
            }),
        }
    }

    /// Evaluate the expression with the given context
    pub fn evaluate<C: EvaluationContext + ?Sized>(&self, context: &C) -> ExprResult<f64> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Variable(name) => context.get_variable(name),
            Self::Slot(slot) => context.get_slot(*slot),
            Self::Neg(expr) => Ok(-expr.evaluate(context)?),
            Self::Binary(op, left, right) => {
                let lhs = left.evaluate(context)?;
                let rhs = right.evaluate(context)?;
                match op {
                    BinaryOp::Add => Ok(lhs + rhs),
                    BinaryOp::Sub => Ok(lhs - rhs),
                    BinaryOp::Mul => Ok(lhs * rhs),
                    BinaryOp::Div if rhs == 0.0 => Err(ExpressionError::DivisionByZero),
                    BinaryOp::Div => Ok(lhs / rhs),
                    BinaryOp::Pow => Ok(lhs.powf(rhs)),
                }
            }
            Self::Function(name, args) => {
                let values = args
                    .iter()
                    .map(|a| a.evaluate(context))
                    .collect::<ExprResult<Vec<_>>>()?;
                call_function(name, &values)
            }
        }
    }

    /// Replaces every variable by its slot, as given by `lookup`.
    ///
    /// # Errors
    ///
    /// * `ExpressionError::UndefinedVariable` for names `lookup` does not know
    pub fn bind<F>(&self, lookup: &F) -> ExprResult<Expression>
    where
        F: Fn(&str) -> Option<usize>,
    {
        Ok(match self {
            Self::Variable(name) => {
                Self::Slot(lookup(name).ok_or_else(|| ExpressionError::UndefinedVariable {
                    name: name.clone(),
                })?)
            }
            Self::Neg(e) => Self::Neg(Box::new(e.bind(lookup)?)),
            Self::Binary(op, l, r) => {
                Self::Binary(*op, Box::new(l.bind(lookup)?), Box::new(r.bind(lookup)?))
            }
            Self::Function(name, args) => Self::Function(
                name.clone(),
                args.iter()
                    .map(|a| a.bind(lookup))
                    .collect::<ExprResult<Vec<_>>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Find all variable names used in the expression
    pub fn variables(&self) -> Vec<String> {
        let mut vars = Vec::new();
        self.collect_variables(&mut vars);
        vars.sort();
        vars.dedup();
        vars
    }

    fn collect_variables(&self, vars: &mut Vec<String>) {
        match self {
            Self::Variable(name) => vars.push(name.clone()),
            Self::Neg(expr) => expr.collect_variables(vars),
            Self::Binary(_, left, right) => {
                left.collect_variables(vars);
                right.collect_variables(vars);
            }
            Self::Function(_, args) => args.iter().for_each(|a| a.collect_variables(vars)),
            Self::Number(_) | Self::Slot(_) => {}
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
        };
        f.write_str(op)
    }
}

/// Fully parenthesized, so that the output parses back to the same tree.
impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Variable(name) => f.write_str(name),
            Self::Slot(slot) => write!(f, "${}", slot),
            Self::Neg(e) => write!(f, "-({})", e),
            Self::Binary(op, l, r)
                if matches!(op, BinaryOp::Add | BinaryOp::Mul) && is_atom(l) && is_atom(r) =>
            {
                write!(f, "{} {} {}", l, op, r)
            }
            Self::Binary(op, l, r) => write!(f, "({}) {} ({})", l, op, r),
            Self::Function(name, args) => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                f.write_str(")")
            }
        }
    }
}

fn is_atom(e: &Expression) -> bool {
    matches!(e, Expression::Number(n) if *n >= 0.0) || matches!(e, Expression::Variable(_))
}

// Parser functions using nom

/// Parse an identifier (variable or function name)
pub(crate) fn identifier(input: &str) -> IResult<&str, String> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))
    .map(|s: &str| s.to_string())
    .parse(input)
}

/// Parse a single character surrounded by optional whitespace
pub(crate) fn spaced(c: char, input: &str) -> IResult<&str, char> {
    delimited(multispace0, char(c), multispace0).parse(input)
}

/// Parse a function call or a variable
fn named(input: &str) -> IResult<&str, Expression> {
    let (input, name) = identifier(input)?;
    let Ok((mut input, _)) = spaced('(', input) else {
        return Ok((input, Expression::Variable(name)));
    };

    let mut args = Vec::new();
    if let Ok((rest, _)) = spaced(')', input) {
        return Ok((rest, Expression::Function(name, args)));
    }
    loop {
        let (rest, arg) = expr_parser(input)?;
        args.push(arg);
        if let Ok((rest, _)) = spaced(',', rest) {
            input = rest;
            continue;
        }
        let (rest, _) = spaced(')', rest)?;
        return Ok((rest, Expression::Function(name, args)));
    }
}

/// Parse a parenthesized expression
fn parens(input: &str) -> IResult<&str, Expression> {
    let (input, _) = spaced('(', input)?;
    let (input, expr) = expr_parser(input)?;
    let (input, _) = spaced(')', input)?;
    Ok((input, expr))
}

/// Parse a primary expression (number, name or parenthesized expression)
fn primary(input: &str) -> IResult<&str, Expression> {
    let (input, _) = multispace0.parse(input)?;
    match input.chars().next() {
        // Names first, so that `inflow` is not read as `inf` + `low`
        Some(c) if c.is_alphabetic() || c == '_' => named(input),
        Some('(') => parens(input),
        _ => {
            let (input, num) = double::<&str, nom::error::Error<&str>>(input)?;
            Ok((input, Expression::Number(num)))
        }
    }
}

/// Parse a power expression; `^` is right-associative and binds tighter
/// than negation
fn power(input: &str) -> IResult<&str, Expression> {
    let (input, base) = primary(input)?;
    match spaced('^', input) {
        Ok((rest, _)) => {
            let (rest, exponent) = unary(rest)?;
            Ok((
                rest,
                Expression::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)),
            ))
        }
        Err(_) => Ok((input, base)),
    }
}

/// Parse a unary expression (-expr)
fn unary(input: &str) -> IResult<&str, Expression> {
    match spaced('-', input) {
        Ok((rest, _)) => {
            let (rest, expr) = unary(rest)?;
            Ok((rest, Expression::Neg(Box::new(expr))))
        }
        Err(_) => power(input),
    }
}

/// Left fold of `operand (op operand)*` over the given operators
fn left_fold<'a>(
    input: &'a str,
    operand: fn(&str) -> IResult<&str, Expression>,
    ops: &[(char, BinaryOp)],
) -> IResult<&'a str, Expression> {
    let (mut input, mut acc) = operand(input)?;
    'outer: loop {
        for &(c, op) in ops {
            if let Ok((rest, _)) = spaced(c, input) {
                let (rest, rhs) = operand(rest)?;
                acc = Expression::Binary(op, Box::new(acc), Box::new(rhs));
                input = rest;
                continue 'outer;
            }
        }
        return Ok((input, acc));
    }
}

/// Parse a multiplicative expression (expr * expr, expr / expr)
fn term(input: &str) -> IResult<&str, Expression> {
    left_fold(input, unary, &[('*', BinaryOp::Mul), ('/', BinaryOp::Div)])
}

/// Parse an additive expression (expr + expr, expr - expr)
fn expr_parser(input: &str) -> IResult<&str, Expression> {
    left_fold(input, term, &[('+', BinaryOp::Add), ('-', BinaryOp::Sub)])
}
