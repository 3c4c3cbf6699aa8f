//! Evaluator for generated code, with the value semantics of the target
//! language: numbers are doubles, `| 0` is ToInt32, `===` compares
//! identities of objects.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use super::{
    Compilation,
    ast::{Expr, Literal, Stmt, format_number},
};
use crate::{Kind, Value};

pub type ScriptResult<T> = Result<T, ScriptError>;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("uncaught {0}")]
    Thrown(ScriptValue),
    #[error("{0} is not defined")]
    Reference(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("constant {0} is out of range")]
    ConstantIndex(usize),
    #[error("{0} outside of a loop or switch")]
    StrayJump(&'static str),
}

type HostFn = dyn Fn(&Globals, ScriptValue, &[ScriptValue]) -> ScriptResult<ScriptValue> + Send + Sync;

/// A function implemented by the host.
#[derive(Clone)]
pub struct ScriptFunction(Arc<HostFn>);

impl ScriptFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Globals, ScriptValue, &[ScriptValue]) -> ScriptResult<ScriptValue>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(
        &self,
        globals: &Globals,
        this: ScriptValue,
        args: &[ScriptValue],
    ) -> ScriptResult<ScriptValue> {
        (self.0)(globals, this, args)
    }
}

#[derive(Clone)]
pub enum ScriptValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Array(Arc<Mutex<Vec<ScriptValue>>>),
    Object(Arc<Mutex<HashMap<String, ScriptValue>>>),
    Function(ScriptFunction),
    /// A compiled unit, `$$F<id>` in generated code.
    Unit(Arc<Compilation>),
    /// The constant table of a unit, `$C` in generated code.
    ConstantTable(Arc<Compilation>),
    /// Interpreter value without a native counterpart: longs and
    /// references.
    Host(Value),
}

impl ScriptValue {
    pub fn array(elements: Vec<ScriptValue>) -> Self {
        ScriptValue::Array(Arc::new(Mutex::new(elements)))
    }

    pub fn object(properties: impl IntoIterator<Item = (String, ScriptValue)>) -> Self {
        ScriptValue::Object(Arc::new(Mutex::new(properties.into_iter().collect())))
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Globals, ScriptValue, &[ScriptValue]) -> ScriptResult<ScriptValue>
            + Send
            + Sync
            + 'static,
    {
        ScriptValue::Function(ScriptFunction::new(f))
    }

    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Int(v) => ScriptValue::Number(*v as f64),
            Value::Float(v) => ScriptValue::Number(*v as f64),
            Value::Double(v) => ScriptValue::Number(*v),
            Value::Reference(None) => ScriptValue::Null,
            other => ScriptValue::Host(other.clone()),
        }
    }

    /// Convert a result back into an interpreter value of `kind`.
    pub fn to_value(&self, kind: Kind) -> ScriptResult<Option<Value>> {
        let value = match kind {
            Kind::Void => return Ok(None),
            Kind::Boolean | Kind::Byte | Kind::Char | Kind::Short | Kind::Int => {
                Value::Int(self.to_int32()).narrow(kind)
            }
            Kind::Float => Value::Float(self.to_number() as f32),
            Kind::Double => Value::Double(self.to_number()),
            Kind::Long => match self {
                ScriptValue::Host(Value::Long(v)) => Value::Long(*v),
                other => Value::Long(other.to_number() as i64),
            },
            Kind::Reference => match self {
                ScriptValue::Undefined | ScriptValue::Null => Value::NULL,
                ScriptValue::Host(v @ Value::Reference(_)) => v.clone(),
                other => {
                    return Err(ScriptError::Type(format!("{other} is not a reference")));
                }
            },
        };
        Ok(Some(value))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            ScriptValue::Undefined | ScriptValue::Null => false,
            ScriptValue::Bool(b) => *b,
            ScriptValue::Number(n) => *n != 0.0 && !n.is_nan(),
            ScriptValue::String(s) => !s.is_empty(),
            ScriptValue::Host(Value::Reference(None)) => false,
            _ => true,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            ScriptValue::Undefined => f64::NAN,
            ScriptValue::Null => 0.0,
            ScriptValue::Bool(b) => *b as u8 as f64,
            ScriptValue::Number(n) => *n,
            ScriptValue::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    0.0
                } else {
                    s.parse().unwrap_or(f64::NAN)
                }
            }
            ScriptValue::Host(Value::Int(v)) => *v as f64,
            ScriptValue::Host(Value::Float(v)) => *v as f64,
            ScriptValue::Host(Value::Long(v)) => *v as f64,
            ScriptValue::Host(Value::Double(v)) => *v,
            _ => f64::NAN,
        }
    }

    pub fn to_int32(&self) -> i32 {
        to_int32(self.to_number())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn property_key(&self) -> String {
        match self {
            ScriptValue::String(s) => s.to_string(),
            other => other.to_string(),
        }
    }
}

/// ToInt32: wrap modulo 2^32, NaN and infinities to zero.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let wrapped = n.trunc().rem_euclid(4_294_967_296.0);
    wrapped as u32 as i32
}

/// `===` except that `NaN` matches itself and `0` differs from `-0`.
pub(super) fn identical(a: &ScriptValue, b: &ScriptValue) -> bool {
    match (a, b) {
        (ScriptValue::Number(a), ScriptValue::Number(b)) => a.to_bits() == b.to_bits(),
        _ => strict_equals(a, b),
    }
}

fn strict_equals(a: &ScriptValue, b: &ScriptValue) -> bool {
    use ScriptValue::*;
    match (a, b) {
        (Undefined, Undefined) | (Null, Null) => true,
        (Bool(a), Bool(b)) => a == b,
        (Number(a), Number(b)) => a == b,
        (String(a), String(b)) => a == b,
        (Array(a), Array(b)) => Arc::ptr_eq(a, b),
        (Object(a), Object(b)) => Arc::ptr_eq(a, b),
        (Function(a), Function(b)) => Arc::ptr_eq(&a.0, &b.0),
        (Unit(a), Unit(b)) | (ConstantTable(a), ConstantTable(b)) => Arc::ptr_eq(a, b),
        (Host(a), Host(b)) => a == b,
        _ => false,
    }
}

fn loose_equals(a: &ScriptValue, b: &ScriptValue) -> bool {
    use ScriptValue::*;
    match (a, b) {
        (Undefined | Null, Undefined | Null) => true,
        (Undefined | Null, _) | (_, Undefined | Null) => false,
        (String(x), String(y)) => x == y,
        (Number(_) | String(_) | Bool(_), Number(_) | String(_) | Bool(_)) => {
            a.to_number() == b.to_number()
        }
        _ => strict_equals(a, b),
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Undefined => f.write_str("undefined"),
            ScriptValue::Null => f.write_str("null"),
            ScriptValue::Bool(b) => write!(f, "{b}"),
            ScriptValue::Number(n) => f.write_str(&format_number(*n)),
            ScriptValue::String(s) => f.write_str(s),
            ScriptValue::Array(elements) => {
                let elements = elements.lock();
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{element}")?;
                }
                Ok(())
            }
            ScriptValue::Object(_) => f.write_str("[object Object]"),
            ScriptValue::Function(_) => f.write_str("function"),
            ScriptValue::Unit(unit) => write!(f, "[compilation {}]", unit.global_name()),
            ScriptValue::ConstantTable(unit) => write!(f, "[constants {}]", unit.global_name()),
            ScriptValue::Host(value) => write!(f, "{value:?}"),
        }
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::String(s) => write!(f, "{s:?}"),
            other => write!(f, "{other}"),
        }
    }
}

/// Global bindings visible to every compiled unit.
pub struct Globals {
    values: RwLock<HashMap<String, ScriptValue>>,
}

impl Globals {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    /// `Math`, the unwind flag `U` (clear) and the `unwind` hook.
    pub fn standard() -> Self {
        let globals = Self::new();
        globals.set("Math", math());
        globals.set("U", ScriptValue::Bool(false));
        globals.set(
            "unwind",
            ScriptValue::function(|_, _, args| {
                log::debug!("unwind requested at pc {}", args.first().map_or(0.0, |pc| pc.to_number()));
                Ok(ScriptValue::Undefined)
            }),
        );
        globals
    }

    pub fn get(&self, name: &str) -> Option<ScriptValue> {
        self.values.read().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: ScriptValue) {
        self.values.write().insert(name.to_string(), value);
    }
}

impl Default for Globals {
    fn default() -> Self {
        Self::standard()
    }
}

fn math() -> ScriptValue {
    fn unary(f: fn(f64) -> f64) -> ScriptValue {
        ScriptValue::function(move |_, _, args| {
            let x = args.first().map_or(f64::NAN, ScriptValue::to_number);
            Ok(ScriptValue::Number(f(x)))
        })
    }
    fn binary(f: fn(f64, f64) -> f64) -> ScriptValue {
        ScriptValue::function(move |_, _, args| {
            let x = args.first().map_or(f64::NAN, ScriptValue::to_number);
            let y = args.get(1).map_or(f64::NAN, ScriptValue::to_number);
            Ok(ScriptValue::Number(f(x, y)))
        })
    }
    ScriptValue::object([
        ("fround".to_string(), unary(|x| x as f32 as f64)),
        ("floor".to_string(), unary(f64::floor)),
        ("ceil".to_string(), unary(f64::ceil)),
        ("abs".to_string(), unary(f64::abs)),
        ("sqrt".to_string(), unary(f64::sqrt)),
        ("min".to_string(), binary(f64::min)),
        ("max".to_string(), binary(f64::max)),
        (
            "imul".to_string(),
            binary(|x, y| to_int32(x).wrapping_mul(to_int32(y)) as f64),
        ),
    ])
}

pub(crate) fn call_value(
    globals: &Globals,
    callee: &ScriptValue,
    this: ScriptValue,
    args: &[ScriptValue],
) -> ScriptResult<ScriptValue> {
    match callee {
        ScriptValue::Function(f) => f.call(globals, this, args),
        ScriptValue::Unit(unit) => unit.invoke(globals, this, args),
        other => Err(ScriptError::Type(format!("{other} is not a function"))),
    }
}

/// `f.call(this, ...args)` for any callable `f`.
fn call_method(target: ScriptValue) -> ScriptValue {
    ScriptValue::function(move |globals, _, args| {
        let (this, rest) = match args.split_first() {
            Some((this, rest)) => (this.clone(), rest),
            None => (ScriptValue::Undefined, args),
        };
        call_value(globals, &target, this, rest)
    })
}

fn get_property(object: &ScriptValue, key: &str) -> ScriptResult<ScriptValue> {
    let value = match object {
        ScriptValue::Undefined | ScriptValue::Null => {
            return Err(ScriptError::Type(format!(
                "cannot read property {key} of {object}"
            )));
        }
        ScriptValue::Array(elements) => {
            let elements = elements.lock();
            match key {
                "length" => ScriptValue::Number(elements.len() as f64),
                _ => key
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| elements.get(i).cloned())
                    .unwrap_or(ScriptValue::Undefined),
            }
        }
        ScriptValue::String(s) if key == "length" => ScriptValue::Number(s.chars().count() as f64),
        ScriptValue::Object(properties) => properties
            .lock()
            .get(key)
            .cloned()
            .unwrap_or(ScriptValue::Undefined),
        ScriptValue::Unit(unit) => match key {
            "constants" => ScriptValue::ConstantTable(unit.clone()),
            "C" => {
                let unit = unit.clone();
                ScriptValue::function(move |_, _, args| {
                    let index = args.first().map_or(f64::NAN, ScriptValue::to_number);
                    unit.resolve(index as usize)
                })
            }
            "call" => call_method(object.clone()),
            _ => ScriptValue::Undefined,
        },
        ScriptValue::ConstantTable(unit) => match key.parse::<usize>() {
            Ok(index) => unit.resolve(index)?,
            Err(_) => ScriptValue::Undefined,
        },
        ScriptValue::Function(_) if key == "call" => call_method(object.clone()),
        _ => ScriptValue::Undefined,
    };
    Ok(value)
}

fn set_property(object: &ScriptValue, key: &str, value: ScriptValue) -> ScriptResult<()> {
    match object {
        ScriptValue::Array(elements) => {
            let index = key
                .parse::<usize>()
                .map_err(|_| ScriptError::Type(format!("cannot set {key} of an array")))?;
            let mut elements = elements.lock();
            if index >= elements.len() {
                elements.resize(index + 1, ScriptValue::Undefined);
            }
            elements[index] = value;
            Ok(())
        }
        ScriptValue::Object(properties) => {
            properties.lock().insert(key.to_string(), value);
            Ok(())
        }
        other => Err(ScriptError::Type(format!("cannot set property {key} of {other}"))),
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(ScriptValue),
}

/// One running invocation of a compiled unit.
pub(crate) struct Activation<'a> {
    unit: &'a Arc<Compilation>,
    globals: &'a Globals,
    this: ScriptValue,
    arguments: Vec<ScriptValue>,
    scope: HashMap<String, ScriptValue>,
}

impl<'a> Activation<'a> {
    pub(crate) fn new(
        unit: &'a Arc<Compilation>,
        globals: &'a Globals,
        this: ScriptValue,
        args: &[ScriptValue],
    ) -> Self {
        let scope = unit
            .parameters()
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), args.get(i).cloned().unwrap_or(ScriptValue::Undefined)))
            .collect();
        Self {
            unit,
            globals,
            this,
            arguments: args.to_vec(),
            scope,
        }
    }

    pub(crate) fn run(mut self, body: &[Stmt]) -> ScriptResult<ScriptValue> {
        match self.exec_all(body)? {
            Flow::Normal => Ok(ScriptValue::Undefined),
            Flow::Return(value) => Ok(value),
            Flow::Break => Err(ScriptError::StrayJump("break")),
            Flow::Continue => Err(ScriptError::StrayJump("continue")),
        }
    }

    fn exec_all(&mut self, body: &[Stmt]) -> ScriptResult<Flow> {
        for stmt in body {
            match self.exec(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> ScriptResult<Flow> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
            Stmt::Var(declarations) => {
                for (name, init) in declarations {
                    let value = match init {
                        Some(init) => self.eval(init)?,
                        None => self
                            .scope
                            .get(name)
                            .cloned()
                            .unwrap_or(ScriptValue::Undefined),
                    };
                    self.scope.insert(name.clone(), value);
                }
            }
            Stmt::Block(body) => return self.exec_all(body),
            Stmt::If {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test)?.is_truthy() {
                    return self.exec(consequent);
                } else if let Some(alternate) = alternate {
                    return self.exec(alternate);
                }
            }
            Stmt::While { test, body } => {
                while self.eval(test)?.is_truthy() {
                    match self.exec(body)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
            }
            Stmt::Switch {
                discriminant,
                cases,
            } => {
                let value = self.eval(discriminant)?;
                let mut start = None;
                for (i, (test, _)) in cases.iter().enumerate() {
                    if let Some(test) = test {
                        if strict_equals(&self.eval(test)?, &value) {
                            start = Some(i);
                            break;
                        }
                    }
                }
                let start = start.or_else(|| cases.iter().position(|(test, _)| test.is_none()));
                if let Some(start) = start {
                    for (_, body) in &cases[start..] {
                        match self.exec_all(body)? {
                            Flow::Normal => {}
                            Flow::Break => break,
                            flow => return Ok(flow),
                        }
                    }
                }
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Return(value) => {
                let value = match value {
                    Some(value) => self.eval(value)?,
                    None => ScriptValue::Undefined,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Throw(value) => return Err(ScriptError::Thrown(self.eval(value)?)),
        }
        Ok(Flow::Normal)
    }

    fn lookup(&self, name: &str) -> ScriptResult<ScriptValue> {
        if let Some(value) = self.scope.get(name) {
            return Ok(value.clone());
        }
        let value = match name {
            "undefined" => ScriptValue::Undefined,
            "NaN" => ScriptValue::Number(f64::NAN),
            "Infinity" => ScriptValue::Number(f64::INFINITY),
            "arguments" => ScriptValue::array(self.arguments.clone()),
            _ if name == self.unit.global_name() => ScriptValue::Unit(self.unit.clone()),
            _ => self
                .globals
                .get(name)
                .ok_or_else(|| ScriptError::Reference(name.to_string()))?,
        };
        Ok(value)
    }

    fn key(&mut self, property: &Expr, computed: bool) -> ScriptResult<String> {
        match (property, computed) {
            (Expr::Identifier(name), false) => Ok(name.clone()),
            (property, _) => Ok(self.eval(property)?.property_key()),
        }
    }

    fn eval(&mut self, expr: &Expr) -> ScriptResult<ScriptValue> {
        let value = match expr {
            Expr::Literal(Literal::Null) => ScriptValue::Null,
            Expr::Literal(Literal::Bool(b)) => ScriptValue::Bool(*b),
            Expr::Literal(Literal::Number(n)) => ScriptValue::Number(*n),
            Expr::Literal(Literal::String(s)) => ScriptValue::String(s.clone()),
            Expr::Identifier(name) => self.lookup(name)?,
            Expr::This => self.this.clone(),
            Expr::Member {
                object,
                property,
                computed,
            } => {
                let object = self.eval(object)?;
                let key = self.key(property, *computed)?;
                get_property(&object, &key)?
            }
            Expr::Unary { operator, argument } => {
                let argument = self.eval(argument)?;
                match *operator {
                    "-" => ScriptValue::Number(-argument.to_number()),
                    "+" => ScriptValue::Number(argument.to_number()),
                    "!" => ScriptValue::Bool(!argument.is_truthy()),
                    "~" => ScriptValue::Number(!argument.to_int32() as f64),
                    other => return Err(ScriptError::Type(format!("unary operator {other}"))),
                }
            }
            Expr::Binary {
                operator: "||",
                left,
                right,
            } => {
                let left = self.eval(left)?;
                if left.is_truthy() { left } else { self.eval(right)? }
            }
            Expr::Binary {
                operator: "&&",
                left,
                right,
            } => {
                let left = self.eval(left)?;
                if left.is_truthy() { self.eval(right)? } else { left }
            }
            Expr::Binary {
                operator,
                left,
                right,
            } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(operator, &left, &right)?
            }
            Expr::Assign { target, value } => {
                let value = self.eval(value)?;
                match &**target {
                    Expr::Identifier(name) => {
                        self.scope.insert(name.clone(), value.clone());
                    }
                    Expr::Member {
                        object,
                        property,
                        computed,
                    } => {
                        let object = self.eval(object)?;
                        let key = self.key(property, *computed)?;
                        set_property(&object, &key, value.clone())?;
                    }
                    other => return Err(ScriptError::Type(format!("cannot assign to {other}"))),
                }
                value
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test)?.is_truthy() {
                    self.eval(consequent)?
                } else {
                    self.eval(alternate)?
                }
            }
            Expr::Call { callee, arguments } => {
                let (this, function) = match &**callee {
                    Expr::Member {
                        object,
                        property,
                        computed,
                    } => {
                        let object = self.eval(object)?;
                        let key = self.key(property, *computed)?;
                        let function = get_property(&object, &key)?;
                        (object, function)
                    }
                    other => (ScriptValue::Undefined, self.eval(other)?),
                };
                let args = arguments
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<ScriptResult<Vec<_>>>()?;
                call_value(self.globals, &function, this, &args)?
            }
            Expr::Array(elements) => {
                let elements = elements
                    .iter()
                    .map(|element| self.eval(element))
                    .collect::<ScriptResult<Vec<_>>>()?;
                ScriptValue::array(elements)
            }
            Expr::Object(properties) => {
                let mut fields = HashMap::new();
                for (key, value) in properties {
                    let key = self.key(key, false)?;
                    let value = self.eval(value)?;
                    fields.insert(key, value);
                }
                ScriptValue::object(fields)
            }
        };
        Ok(value)
    }
}

fn binary(operator: &str, a: &ScriptValue, b: &ScriptValue) -> ScriptResult<ScriptValue> {
    use ScriptValue::{Bool, Number};
    let value = match operator {
        "+" => match (a, b) {
            (ScriptValue::String(_), _) | (_, ScriptValue::String(_)) => {
                ScriptValue::String(format!("{a}{b}").into())
            }
            _ => Number(a.to_number() + b.to_number()),
        },
        "-" => Number(a.to_number() - b.to_number()),
        "*" => Number(a.to_number() * b.to_number()),
        "/" => Number(a.to_number() / b.to_number()),
        "%" => Number(a.to_number() % b.to_number()),
        "|" => Number((a.to_int32() | b.to_int32()) as f64),
        "&" => Number((a.to_int32() & b.to_int32()) as f64),
        "^" => Number((a.to_int32() ^ b.to_int32()) as f64),
        "<<" => Number(a.to_int32().wrapping_shl(b.to_int32() as u32) as f64),
        ">>" => Number(a.to_int32().wrapping_shr(b.to_int32() as u32) as f64),
        ">>>" => Number((a.to_int32() as u32).wrapping_shr(b.to_int32() as u32) as f64),
        "===" => Bool(strict_equals(a, b)),
        "!==" => Bool(!strict_equals(a, b)),
        "==" => Bool(loose_equals(a, b)),
        "!=" => Bool(!loose_equals(a, b)),
        "<" | "<=" | ">" | ">=" => {
            let ordering = match (a, b) {
                (ScriptValue::String(x), ScriptValue::String(y)) => Some(x.cmp(y)),
                _ => a.to_number().partial_cmp(&b.to_number()),
            };
            Bool(match (operator, ordering) {
                (_, None) => false,
                ("<", Some(o)) => o.is_lt(),
                ("<=", Some(o)) => o.is_le(),
                (">", Some(o)) => o.is_gt(),
                (_, Some(o)) => o.is_ge(),
            })
        }
        other => return Err(ScriptError::Type(format!("binary operator {other}"))),
    };
    Ok(value)
}
