//! Lowering of structured IR to target source.

use super::{
    BackendError, Compilation, ScriptValue,
    ast::{Expr, Literal, Stmt, is_identifier_name},
    compilation::{self, ConstantEntry},
    ir::{
        Block, Constant, Control, End, LabelCase, Node, StructuredMethod, SwitchCase,
        UnaryOperator, UnwindState, ValueGraph, ValueId,
    },
};

type CompileResult<T> = Result<T, BackendError>;

const LABEL: &str = "$L";
const UNIT: &str = "$F";
const CONSTANTS: &str = "$C";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Local {
    Variable(ValueId),
    Label,
}

/// Accumulates what one method body references while it is lowered.
struct Context<'g> {
    graph: &'g ValueGraph,
    variables: Vec<Local>,
    /// Constant nodes in first-use order; the position is the table index.
    /// Nodes holding an identical constant share the first one's entry.
    constants: Vec<ValueId>,
    parameters: Vec<Option<String>>,
}

impl<'g> Context<'g> {
    fn new(graph: &'g ValueGraph) -> Self {
        Self {
            graph,
            variables: Vec::new(),
            constants: Vec::new(),
            parameters: Vec::new(),
        }
    }

    fn node(&self, id: ValueId) -> CompileResult<&'g Node> {
        if id.index() >= self.graph.len() {
            return Err(BackendError::Malformed(format!("value {} is not in the graph", id.index())));
        }
        Ok(&self.graph.get(id).node)
    }

    fn use_local(&mut self, local: Local) {
        if !self.variables.contains(&local) {
            self.variables.push(local);
        }
    }

    /// Identifier of the variable node `id`, registered for declaration.
    fn use_variable(&mut self, id: ValueId) -> CompileResult<Expr> {
        match self.node(id)? {
            Node::Variable { name } => {
                self.use_local(Local::Variable(id));
                Ok(Expr::id(name))
            }
            other => Err(BackendError::Malformed(format!("{other:?} is not a variable"))),
        }
    }

    fn use_constant(&mut self, id: ValueId) -> usize {
        let graph = self.graph;
        let same = |other: &ValueId| {
            *other == id
                || match (&graph.get(*other).node, &graph.get(id).node) {
                    (Node::Constant(a), Node::Constant(b)) => a.is_identical(b),
                    _ => false,
                }
        };
        match self.constants.iter().position(same) {
            Some(index) => index,
            None => {
                self.constants.push(id);
                self.constants.len() - 1
            }
        }
    }

    fn local_name(&self, local: Local) -> String {
        match local {
            Local::Label => LABEL.to_string(),
            Local::Variable(id) => match &self.graph.get(id).node {
                Node::Variable { name } => name.clone(),
                _ => format!("v{}", id.index()),
            },
        }
    }

    // ── control ────────────────────────────────────────────────────

    fn compile(&mut self, control: &Control) -> CompileResult<Stmt> {
        match control {
            Control::Seq(children) => {
                let mut body = Vec::new();
                for child in children {
                    match self.compile(child)? {
                        Stmt::Block(stmts) => body.extend(stmts),
                        stmt => body.push(stmt),
                    }
                }
                Ok(Stmt::Block(body))
            }
            Control::If {
                cond,
                then,
                els,
                negated,
            } => {
                let mut body = self.compile_block(cond)?;
                let consequent = match then {
                    Some(then) => braced(self.compile(then)?),
                    None => Stmt::Block(Vec::new()),
                };
                let alternate = match els {
                    Some(els) => Some(Box::new(braced(self.compile(els)?))),
                    None => None,
                };
                let End::If { predicate } = cond.end else {
                    return Err(BackendError::Malformed("if condition block does not end in a branch".into()));
                };
                let test = self.compile_value(predicate)?;
                let test = if *negated { negate(test) } else { test };
                body.push(Stmt::If {
                    test,
                    consequent: Box::new(consequent),
                    alternate,
                });
                Ok(Stmt::Block(body))
            }
            Control::Loop(inner) => Ok(Stmt::While {
                test: Expr::Literal(Literal::Bool(true)),
                body: Box::new(braced(self.compile(inner)?)),
            }),
            Control::Switch { determinant, cases } => self.compile_switch(determinant, cases),
            Control::LabelSwitch(cases) => self.compile_label_switch(cases),
            Control::Break { label } => {
                let mut body = self.label_assignment(*label);
                body.push(Stmt::Break);
                Ok(Stmt::Block(body))
            }
            Control::Continue { label } => {
                let mut body = self.label_assignment(*label);
                body.push(Stmt::Continue);
                Ok(Stmt::Block(body))
            }
            Control::Exit { label } => Ok(Stmt::Block(self.label_assignment(*label))),
            Control::Try { .. } => Err(BackendError::Unsupported("try")),
            Control::Block(block) => Ok(Stmt::Block(self.compile_block(block)?)),
        }
    }

    fn label_assignment(&mut self, label: Option<u32>) -> Vec<Stmt> {
        match label {
            Some(label) => {
                self.use_local(Local::Label);
                vec![Stmt::Expr(Expr::assign(Expr::id(LABEL), Expr::number(label as f64)))]
            }
            None => Vec::new(),
        }
    }

    fn compile_switch(&mut self, determinant: &Block, cases: &[SwitchCase]) -> CompileResult<Stmt> {
        let mut body = self.compile_block(determinant)?;
        let mut compiled = Vec::with_capacity(cases.len());
        for case in cases {
            let stmts = match &case.body {
                Some(control) => match self.compile(control)? {
                    Stmt::Block(stmts) => stmts,
                    stmt => vec![stmt],
                },
                None => Vec::new(),
            };
            let test = case.index.map(|index| Expr::number(index as f64));
            compiled.push((test, stmts));
        }
        let End::Switch { determinant } = determinant.end else {
            return Err(BackendError::Malformed("switch determinant block does not end in a switch".into()));
        };
        let discriminant = self.compile_value(determinant)?;
        body.push(Stmt::Switch {
            discriminant,
            cases: compiled,
        });
        Ok(Stmt::Block(body))
    }

    /// Chain of `$L === n` tests, built from the last case outwards so the
    /// first case is tested first.
    fn compile_label_switch(&mut self, cases: &[LabelCase]) -> CompileResult<Stmt> {
        self.use_local(Local::Label);
        let label_test = |label: u32| Expr::binary("===", Expr::id(LABEL), Expr::number(label as f64));
        let mut statement: Option<Stmt> = None;
        for case in cases.iter().rev() {
            let Some((first, rest)) = case.labels.split_first() else {
                return Err(BackendError::Malformed("label switch case without labels".into()));
            };
            let test = rest
                .iter()
                .fold(label_test(*first), |test, label| Expr::binary("||", test, label_test(*label)));
            let consequent = match &case.body {
                Some(body) => braced(self.compile(body)?),
                None => Stmt::Block(Vec::new()),
            };
            statement = Some(Stmt::If {
                test,
                consequent: Box::new(consequent),
                alternate: statement.map(Box::new),
            });
        }
        Ok(statement.unwrap_or(Stmt::Block(Vec::new())))
    }

    fn compile_block(&mut self, block: &Block) -> CompileResult<Vec<Stmt>> {
        let mut body = Vec::with_capacity(block.nodes.len() + 1);
        for &id in &block.nodes {
            let statement = match self.node(id)? {
                Node::Throw { argument } => Stmt::Throw(self.compile_value(*argument)?),
                Node::Move { to, from } => {
                    let target = self.use_variable(*to)?;
                    let value = self.compile_value(*from)?;
                    Stmt::Expr(Expr::assign(target, value))
                }
                _ => {
                    let value = self.compile_node(id)?;
                    match self.graph.get(id).variable {
                        Some(variable) => Stmt::Expr(Expr::assign(self.use_variable(variable)?, value)),
                        None => Stmt::Expr(value),
                    }
                }
            };
            body.push(statement);
        }
        if let End::Stop { argument } = block.end {
            body.push(Stmt::Return(Some(self.compile_value(argument)?)));
        }
        Ok(body)
    }

    // ── values ─────────────────────────────────────────────────────

    /// A value as an operand: its variable when it has one.
    fn compile_value(&mut self, id: ValueId) -> CompileResult<Expr> {
        if id.index() < self.graph.len() {
            if let Some(variable) = self.graph.get(id).variable {
                return self.use_variable(variable);
            }
        }
        self.compile_node(id)
    }

    fn compile_values(&mut self, ids: &[ValueId]) -> CompileResult<Vec<Expr>> {
        ids.iter().map(|id| self.compile_value(*id)).collect()
    }

    fn compile_node(&mut self, id: ValueId) -> CompileResult<Expr> {
        let expr = match self.node(id)? {
            Node::Parameter { index, name } => {
                if self.parameters.len() <= *index {
                    self.parameters.resize(*index + 1, None);
                }
                self.parameters[*index] = Some(name.clone());
                Expr::id(name)
            }
            Node::Constant(constant) => self.constant(id, constant),
            Node::Variable { name } => Expr::id(name),
            Node::Phi => {
                return Err(BackendError::Malformed(format!("phi {} has no variable", id.index())));
            }
            Node::Latch {
                condition,
                left,
                right,
            } => Expr::Conditional {
                test: Box::new(self.compile_value(*condition)?),
                consequent: Box::new(self.compile_value(*left)?),
                alternate: Box::new(self.compile_value(*right)?),
            },
            Node::Unary { operator, argument } => {
                let result = Expr::unary(operator.symbol(), self.compile_value(*argument)?);
                if *operator == UnaryOperator::INeg {
                    Expr::binary("|", result, Expr::number(0.0))
                } else {
                    result
                }
            }
            Node::Binary {
                operator,
                left,
                right,
            } => {
                let left = self.compile_value(*left)?;
                let right = self.compile_value(*right)?;
                let result = Expr::binary(operator.symbol(), left, right);
                if operator.is_int() {
                    Expr::binary("|", result, Expr::number(0.0))
                } else if operator.is_float() {
                    Expr::call(Expr::dot(Expr::id("Math"), "fround"), vec![result])
                } else if operator.is_double() {
                    Expr::unary("+", result)
                } else {
                    result
                }
            }
            Node::CallProperty { object, name, args } => {
                let object = self.compile_value(*object)?;
                let name = self.compile_value(*name)?;
                let args = self.compile_values(args)?;
                Expr::call(property(object, name), args)
            }
            Node::Call {
                callee,
                object,
                args,
            } => {
                let args = self.compile_values(args)?;
                let callee = self.compile_value(*callee)?;
                let object = match object {
                    Some(object) => self.compile_value(*object)?,
                    None => Expr::Literal(Literal::Null),
                };
                let mut arguments = Vec::with_capacity(args.len() + 1);
                arguments.push(object);
                arguments.extend(args);
                Expr::call(Expr::dot(callee, "call"), arguments)
            }
            Node::This => Expr::This,
            Node::Arguments => Expr::id("arguments"),
            Node::GlobalProperty { name } => {
                let mut parts = name.split('.');
                let first = parts.next().unwrap_or_default();
                parts.fold(Expr::id(first), Expr::dot)
            }
            Node::GetProperty { object, name } => {
                let object = self.compile_value(*object)?;
                let name = self.compile_value(*name)?;
                property(object, name)
            }
            Node::SetProperty {
                object,
                name,
                value,
            } => {
                let object = self.compile_value(*object)?;
                let name = self.compile_value(*name)?;
                let value = self.compile_value(*value)?;
                Expr::assign(property(object, name), value)
            }
            Node::Projection { argument } => match self.node(*argument)? {
                Node::Start { scope } => self.compile_value(*scope)?,
                other => {
                    return Err(BackendError::Malformed(format!("projection of {other:?}")));
                }
            },
            Node::NewArray { elements } => Expr::Array(self.compile_values(elements)?),
            Node::NewObject { properties } => {
                let mut compiled = Vec::with_capacity(properties.len());
                for (key, value) in properties {
                    compiled.push((self.compile_value(*key)?, self.compile_value(*value)?));
                }
                Expr::Object(compiled)
            }
            Node::Copy { argument } => self.compile_value(*argument)?,
            Node::Throw { .. } | Node::Move { .. } | Node::Start { .. } => {
                return Err(BackendError::Malformed(format!(
                    "value {} can only appear as a statement",
                    id.index()
                )));
            }
        };
        Ok(expr)
    }

    fn constant(&mut self, id: ValueId, constant: &Constant) -> Expr {
        let value = match constant {
            Constant::Lazy(_) => {
                let index = self.use_constant(id);
                return Expr::call(Expr::dot(Expr::id(UNIT), "C"), vec![Expr::number(index as f64)]);
            }
            Constant::Value(value) => value,
        };
        match value {
            ScriptValue::Undefined => Expr::id("undefined"),
            ScriptValue::Null => Expr::Literal(Literal::Null),
            ScriptValue::Bool(b) => Expr::Literal(Literal::Bool(*b)),
            ScriptValue::String(s) => Expr::Literal(Literal::String(s.clone())),
            ScriptValue::Number(n) => number(*n),
            _ => {
                let index = self.use_constant(id);
                Expr::index(Expr::id(CONSTANTS), Expr::number(index as f64))
            }
        }
    }

    fn constant_entries(&self) -> CompileResult<Vec<ConstantEntry>> {
        self.constants
            .iter()
            .map(|id| match self.node(*id)? {
                Node::Constant(Constant::Value(value)) => Ok(ConstantEntry::Ready(value.clone())),
                Node::Constant(Constant::Lazy(initializer)) => {
                    Ok(ConstantEntry::Lazy(initializer.clone()))
                }
                other => Err(BackendError::Malformed(format!("{other:?} is not a constant"))),
            })
            .collect()
    }

    /// `if (U) { return unwind(pc, [values]); }`
    fn compile_unwind(&mut self, state: &UnwindState) -> CompileResult<Stmt> {
        let values = self.compile_values(&state.values)?;
        let call = Expr::call(
            Expr::id("unwind"),
            vec![Expr::number(state.pc as f64), Expr::Array(values)],
        );
        Ok(Stmt::If {
            test: Expr::id("U"),
            consequent: Box::new(Stmt::Block(vec![Stmt::Return(Some(call))])),
            alternate: None,
        })
    }
}

/// Numbers as source; special values by name so bit patterns survive.
fn number(value: f64) -> Expr {
    if value.is_nan() {
        Expr::id("NaN")
    } else if value == f64::INFINITY {
        Expr::id("Infinity")
    } else if value == f64::NEG_INFINITY {
        Expr::unary("-", Expr::id("Infinity"))
    } else if value.is_sign_negative() {
        Expr::unary("-", Expr::number(value.abs()))
    } else {
        Expr::number(value)
    }
}

/// `object.name` when the name is a valid identifier, `object[name]`
/// otherwise.
fn property(object: Expr, name: Expr) -> Expr {
    match name {
        Expr::Literal(Literal::String(ref s)) if is_identifier_name(s) => Expr::dot(object, s),
        name => Expr::index(object, name),
    }
}

fn braced(stmt: Stmt) -> Stmt {
    match stmt {
        Stmt::Block(_) => stmt,
        stmt => Stmt::Block(vec![stmt]),
    }
}

/// Logical negation with the obvious simplifications.
fn negate(expr: Expr) -> Expr {
    match expr {
        Expr::Literal(Literal::Bool(b)) => Expr::Literal(Literal::Bool(!b)),
        Expr::Identifier(_) => Expr::unary("!", expr),
        Expr::Binary {
            operator: "==",
            left,
            right,
        } if *right == Expr::Literal(Literal::Bool(false)) => *left,
        Expr::Unary {
            operator: "!",
            argument,
        } => *argument,
        Expr::Binary {
            operator,
            left,
            right,
        } if opposite(operator).is_some() => Expr::Binary {
            operator: opposite(operator).unwrap_or(operator),
            left,
            right,
        },
        expr => Expr::unary("!", expr),
    }
}

fn opposite(operator: &str) -> Option<&'static str> {
    match operator {
        "==" => Some("!="),
        "!=" => Some("=="),
        "===" => Some("!=="),
        "!==" => Some("==="),
        _ => None,
    }
}

/// Lower `method` to a compiled unit. With `unwind`, the unit first checks
/// the global unwind flag and hands `unwind.values` back to the
/// interpreter instead of running.
pub fn generate(
    method: &StructuredMethod,
    unwind: Option<&UnwindState>,
) -> Result<Compilation, BackendError> {
    let mut cx = Context::new(&method.graph);
    let mut body = match cx.compile(&method.root)? {
        Stmt::Block(body) => body,
        stmt => vec![stmt],
    };
    // compiled ahead of the declarations, it may reference locals too
    let unwind = unwind.map(|state| cx.compile_unwind(state)).transpose()?;

    let id = compilation::next_id();
    let global_name = compilation::global_name(id);
    let parameters: Vec<String> = cx
        .parameters
        .iter()
        .enumerate()
        .map(|(i, name)| name.clone().unwrap_or_else(|| format!("_{i}")))
        .collect();

    if !cx.constants.is_empty() {
        body.insert(
            0,
            Stmt::Var(vec![
                (UNIT.to_string(), Some(Expr::id(&global_name))),
                (
                    CONSTANTS.to_string(),
                    Some(Expr::dot(Expr::id(&global_name), "constants")),
                ),
            ]),
        );
    }
    if !cx.variables.is_empty() {
        let locals = cx
            .variables
            .iter()
            .map(|local| (cx.local_name(*local), None))
            .collect();
        body.insert(0, Stmt::Var(locals));
    }
    if let Some(unwind) = unwind {
        body.insert(0, unwind);
    }

    let constants = cx.constant_entries()?;
    let unit = Compilation::with_id(id, parameters, body, constants);
    log::debug!(
        "generated {global_name} ({} parameters, {} constants, {} locals)",
        unit.parameters().len(),
        unit.constant_count(),
        cx.variables.len()
    );
    log::trace!("{global_name}:\n{}", unit.source());
    Ok(unit)
}
