//! Target syntax tree and its source rendering.
//!
//! Binary, conditional and nested assignment expressions are always
//! parenthesised, so rendering never needs precedence tables.

use std::{fmt, sync::Arc};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Identifier(String),
    This,
    Member {
        object: Box<Expr>,
        property: Box<Expr>,
        computed: bool,
    },
    Unary {
        operator: &'static str,
        argument: Box<Expr>,
    },
    Binary {
        operator: &'static str,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        arguments: Vec<Expr>,
    },
    Array(Vec<Expr>),
    Object(Vec<(Expr, Expr)>),
}

impl Expr {
    pub fn id(name: &str) -> Expr {
        Expr::Identifier(name.into())
    }

    pub fn number(value: f64) -> Expr {
        Expr::Literal(Literal::Number(value))
    }

    /// `object.name`
    pub fn dot(object: Expr, name: &str) -> Expr {
        Expr::Member {
            object: Box::new(object),
            property: Box::new(Expr::id(name)),
            computed: false,
        }
    }

    /// `object[property]`
    pub fn index(object: Expr, property: Expr) -> Expr {
        Expr::Member {
            object: Box::new(object),
            property: Box::new(property),
            computed: true,
        }
    }

    pub fn unary(operator: &'static str, argument: Expr) -> Expr {
        Expr::Unary {
            operator,
            argument: Box::new(argument),
        }
    }

    pub fn binary(operator: &'static str, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            operator,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn assign(target: Expr, value: Expr) -> Expr {
        Expr::Assign {
            target: Box::new(target),
            value: Box::new(value),
        }
    }

    pub fn call(callee: Expr, arguments: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: Box::new(callee),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Var(Vec<(String, Option<Expr>)>),
    Block(Vec<Stmt>),
    If {
        test: Expr,
        consequent: Box<Stmt>,
        alternate: Option<Box<Stmt>>,
    },
    While {
        test: Expr,
        body: Box<Stmt>,
    },
    Switch {
        discriminant: Expr,
        cases: Vec<(Option<Expr>, Vec<Stmt>)>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Throw(Expr),
}

pub fn is_identifier_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '$' || c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '$' || c == '_' || c.is_alphanumeric())
}

/// Number formatting of the generated language.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        "NaN".into()
    } else if value.is_infinite() {
        let name = if value > 0.0 { "Infinity" } else { "-Infinity" };
        name.into()
    } else if value == 0.0 {
        "0".into()
    } else {
        value.to_string()
    }
}

fn write_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if (c as u32) < 0x20 => write!(f, "\\u{:04x}", c as u32)?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("null"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Number(n) => f.write_str(&format_number(*n)),
            Literal::String(s) => write_string(f, s),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(literal) => write!(f, "{literal}"),
            Expr::Identifier(name) => f.write_str(name),
            Expr::This => f.write_str("this"),
            Expr::Member {
                object,
                property,
                computed: false,
            } => write!(f, "{object}.{property}"),
            Expr::Member {
                object, property, ..
            } => write!(f, "{object}[{property}]"),
            Expr::Unary { operator, argument } => {
                let argument = argument.to_string();
                if argument.starts_with(operator) {
                    write!(f, "{operator} {argument}")
                } else {
                    write!(f, "{operator}{argument}")
                }
            }
            Expr::Binary {
                operator,
                left,
                right,
            } => write!(f, "({left} {operator} {right})"),
            Expr::Assign { target, value } => write!(f, "({target} = {value})"),
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => write!(f, "({test} ? {consequent} : {alternate})"),
            Expr::Call { callee, arguments } => {
                write!(f, "{callee}(")?;
                write_list(f, arguments)?;
                f.write_str(")")
            }
            Expr::Array(elements) => {
                f.write_str("[")?;
                write_list(f, elements)?;
                f.write_str("]")
            }
            Expr::Object(properties) => {
                f.write_str("{")?;
                for (i, (key, value)) in properties.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

const INDENT: &str = "  ";

impl Stmt {
    /// Render at `depth` levels of indentation, without a trailing newline.
    pub fn write(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str(INDENT);
        }
        self.write_inline(out, depth);
    }

    fn write_inline(&self, out: &mut String, depth: usize) {
        match self {
            Stmt::Expr(Expr::Assign { target, value }) => {
                out.push_str(&format!("{target} = {value};"));
            }
            Stmt::Expr(expr) => out.push_str(&format!("{expr};")),
            Stmt::Var(declarations) => {
                out.push_str("var ");
                for (i, (name, init)) in declarations.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(name);
                    if let Some(init) = init {
                        out.push_str(&format!(" = {init}"));
                    }
                }
                out.push(';');
            }
            Stmt::Block(body) => write_block(out, body, depth),
            Stmt::If {
                test,
                consequent,
                alternate,
            } => {
                out.push_str(&format!("if ({test}) "));
                consequent.write_inline(out, depth);
                if let Some(alternate) = alternate {
                    out.push_str(" else ");
                    alternate.write_inline(out, depth);
                }
            }
            Stmt::While { test, body } => {
                out.push_str(&format!("while ({test}) "));
                body.write_inline(out, depth);
            }
            Stmt::Switch {
                discriminant,
                cases,
            } => {
                out.push_str(&format!("switch ({discriminant}) {{\n"));
                for (test, body) in cases {
                    for _ in 0..=depth {
                        out.push_str(INDENT);
                    }
                    match test {
                        Some(test) => out.push_str(&format!("case {test}:\n")),
                        None => out.push_str("default:\n"),
                    }
                    for stmt in body {
                        stmt.write(out, depth + 2);
                        out.push('\n');
                    }
                }
                for _ in 0..depth {
                    out.push_str(INDENT);
                }
                out.push('}');
            }
            Stmt::Break => out.push_str("break;"),
            Stmt::Continue => out.push_str("continue;"),
            Stmt::Return(Some(value)) => out.push_str(&format!("return {value};")),
            Stmt::Return(None) => out.push_str("return;"),
            Stmt::Throw(value) => out.push_str(&format!("throw {value};")),
        }
    }
}

fn write_block(out: &mut String, body: &[Stmt], depth: usize) {
    if body.is_empty() {
        out.push_str("{}");
        return;
    }
    out.push_str("{\n");
    for stmt in body {
        stmt.write(out, depth + 1);
        out.push('\n');
    }
    for _ in 0..depth {
        out.push_str(INDENT);
    }
    out.push('}');
}

/// Source text of a function body.
pub fn render(body: &[Stmt]) -> String {
    let mut out = String::new();
    for (i, stmt) in body.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        stmt.write(&mut out, 0);
    }
    out
}
