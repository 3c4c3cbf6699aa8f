//! Structured intermediate representation consumed by [`generate`].
//!
//! Value nodes live in a [`ValueGraph`] and are referred to by [`ValueId`];
//! a node's identity is its id. Control flow has already been structured by
//! an external pass into a [`Control`] tree whose leaves are [`Block`]s.
//!
//! [`generate`]: super::generate

use std::{fmt, sync::Arc};

use super::{ScriptError, ScriptValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Computes a constant-table entry the first time generated code asks for
/// it.
#[derive(Clone)]
pub struct LazyInitializer(Arc<dyn Fn() -> Result<ScriptValue, ScriptError> + Send + Sync>);

impl LazyInitializer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Result<ScriptValue, ScriptError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn resolve(&self) -> Result<ScriptValue, ScriptError> {
        (self.0)()
    }
}

impl fmt::Debug for LazyInitializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LazyInitializer")
    }
}

#[derive(Debug, Clone)]
pub enum Constant {
    Value(ScriptValue),
    Lazy(LazyInitializer),
}

impl Constant {
    /// Whether both denote the same table entry: identical values (numbers
    /// bit for bit) or the same initializer.
    pub fn is_identical(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::Value(a), Constant::Value(b)) => super::eval::identical(a, b),
            (Constant::Lazy(a), Constant::Lazy(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    INeg,
    FNeg,
    DNeg,
    Neg,
    Plus,
    Not,
    BitNot,
}

impl UnaryOperator {
    pub const fn symbol(self) -> &'static str {
        match self {
            UnaryOperator::INeg | UnaryOperator::FNeg | UnaryOperator::DNeg | UnaryOperator::Neg => {
                "-"
            }
            UnaryOperator::Plus => "+",
            UnaryOperator::Not => "!",
            UnaryOperator::BitNot => "~",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    IAdd,
    ISub,
    IMul,
    IDiv,
    IRem,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
    DAdd,
    DSub,
    DMul,
    DDiv,
    DRem,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    LogicalAnd,
    LogicalOr,
}

impl BinaryOperator {
    pub const fn symbol(self) -> &'static str {
        use BinaryOperator::*;
        match self {
            IAdd | FAdd | DAdd | Add => "+",
            ISub | FSub | DSub | Sub => "-",
            IMul | FMul | DMul | Mul => "*",
            IDiv | FDiv | DDiv | Div => "/",
            IRem | FRem | DRem | Rem => "%",
            And => "&",
            Or => "|",
            Xor => "^",
            Shl => "<<",
            Shr => ">>",
            UShr => ">>>",
            Eq => "==",
            Ne => "!=",
            StrictEq => "===",
            StrictNe => "!==",
            Lt => "<",
            Le => "<=",
            Gt => ">",
            Ge => ">=",
            LogicalAnd => "&&",
            LogicalOr => "||",
        }
    }

    /// 32-bit integer arithmetic, truncated with `| 0`.
    pub const fn is_int(self) -> bool {
        matches!(
            self,
            BinaryOperator::IAdd
                | BinaryOperator::ISub
                | BinaryOperator::IMul
                | BinaryOperator::IDiv
                | BinaryOperator::IRem
        )
    }

    /// Single precision arithmetic, rounded with `Math.fround`.
    pub const fn is_float(self) -> bool {
        matches!(
            self,
            BinaryOperator::FAdd
                | BinaryOperator::FSub
                | BinaryOperator::FMul
                | BinaryOperator::FDiv
                | BinaryOperator::FRem
        )
    }

    /// Double precision arithmetic, coerced with unary `+`.
    pub const fn is_double(self) -> bool {
        matches!(
            self,
            BinaryOperator::DAdd
                | BinaryOperator::DSub
                | BinaryOperator::DMul
                | BinaryOperator::DDiv
                | BinaryOperator::DRem
        )
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Parameter {
        index: usize,
        name: String,
    },
    Constant(Constant),
    Variable {
        name: String,
    },
    /// Merge point; only meaningful through its variable.
    Phi,
    Latch {
        condition: ValueId,
        left: ValueId,
        right: ValueId,
    },
    Unary {
        operator: UnaryOperator,
        argument: ValueId,
    },
    Binary {
        operator: BinaryOperator,
        left: ValueId,
        right: ValueId,
    },
    CallProperty {
        object: ValueId,
        name: ValueId,
        args: Vec<ValueId>,
    },
    Call {
        callee: ValueId,
        object: Option<ValueId>,
        args: Vec<ValueId>,
    },
    This,
    Throw {
        argument: ValueId,
    },
    Arguments,
    GlobalProperty {
        name: String,
    },
    GetProperty {
        object: ValueId,
        name: ValueId,
    },
    SetProperty {
        object: ValueId,
        name: ValueId,
        value: ValueId,
    },
    /// Context projection of a [`Node::Start`].
    Projection {
        argument: ValueId,
    },
    NewArray {
        elements: Vec<ValueId>,
    },
    NewObject {
        properties: Vec<(ValueId, ValueId)>,
    },
    Copy {
        argument: ValueId,
    },
    Move {
        to: ValueId,
        from: ValueId,
    },
    Start {
        scope: ValueId,
    },
}

#[derive(Debug, Clone)]
pub struct ValueNode {
    pub node: Node,
    /// A [`Node::Variable`] holding this value.
    pub variable: Option<ValueId>,
}

/// Arena of value nodes.
#[derive(Debug, Clone, Default)]
pub struct ValueGraph {
    nodes: Vec<ValueNode>,
}

impl ValueGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: Node) -> ValueId {
        self.push(node, None)
    }

    /// Add a node whose value lives in `variable`.
    pub fn add_with_variable(&mut self, node: Node, variable: ValueId) -> ValueId {
        self.push(node, Some(variable))
    }

    fn push(&mut self, node: Node, variable: Option<ValueId>) -> ValueId {
        let id = ValueId(self.nodes.len() as u32);
        self.nodes.push(ValueNode { node, variable });
        id
    }

    pub fn get(&self, id: ValueId) -> &ValueNode {
        &self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ── shorthands ─────────────────────────────────────────────────

    pub fn parameter(&mut self, index: usize, name: &str) -> ValueId {
        self.add(Node::Parameter {
            index,
            name: name.into(),
        })
    }

    pub fn constant(&mut self, value: ScriptValue) -> ValueId {
        self.add(Node::Constant(Constant::Value(value)))
    }

    pub fn number(&mut self, value: f64) -> ValueId {
        self.constant(ScriptValue::Number(value))
    }

    pub fn string(&mut self, value: &str) -> ValueId {
        self.constant(ScriptValue::String(value.into()))
    }

    pub fn lazy(&mut self, initializer: LazyInitializer) -> ValueId {
        self.add(Node::Constant(Constant::Lazy(initializer)))
    }

    pub fn variable(&mut self, name: &str) -> ValueId {
        self.add(Node::Variable { name: name.into() })
    }

    pub fn unary(&mut self, operator: UnaryOperator, argument: ValueId) -> ValueId {
        self.add(Node::Unary { operator, argument })
    }

    pub fn binary(&mut self, operator: BinaryOperator, left: ValueId, right: ValueId) -> ValueId {
        self.add(Node::Binary {
            operator,
            left,
            right,
        })
    }
}

/// How a [`Block`] hands control on.
#[derive(Debug, Clone)]
pub enum End {
    /// Return `argument`.
    Stop { argument: ValueId },
    /// Branch on `predicate`; the enclosing [`Control::If`] has the targets.
    If { predicate: ValueId },
    /// Dispatch on `determinant`; the enclosing [`Control::Switch`] has the
    /// cases.
    Switch { determinant: ValueId },
    /// Fall through to whatever the control tree does next.
    Jump,
}

/// Straight-line code.
#[derive(Debug, Clone)]
pub struct Block {
    pub nodes: Vec<ValueId>,
    pub end: End,
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    /// `None` for the default case.
    pub index: Option<i32>,
    pub body: Option<Control>,
}

#[derive(Debug, Clone)]
pub struct LabelCase {
    pub labels: Vec<u32>,
    pub body: Option<Control>,
}

/// Structured control tree.
#[derive(Debug, Clone)]
pub enum Control {
    Seq(Vec<Control>),
    If {
        cond: Block,
        then: Option<Box<Control>>,
        els: Option<Box<Control>>,
        negated: bool,
    },
    Loop(Box<Control>),
    Switch {
        determinant: Block,
        cases: Vec<SwitchCase>,
    },
    /// Dispatch on the label variable set by a labelled `Break`,
    /// `Continue` or `Exit`.
    LabelSwitch(Vec<LabelCase>),
    Break {
        label: Option<u32>,
    },
    Continue {
        label: Option<u32>,
    },
    Exit {
        label: Option<u32>,
    },
    Try {
        body: Box<Control>,
        catches: Vec<Control>,
    },
    Block(Block),
}

/// A method ready for [`generate`](super::generate).
#[derive(Debug, Clone)]
pub struct StructuredMethod {
    pub graph: ValueGraph,
    pub root: Control,
}

/// Values to hand back to the interpreter when a compiled unit is entered
/// while an unwind is pending.
#[derive(Debug, Clone)]
pub struct UnwindState {
    pub pc: usize,
    pub values: Vec<ValueId>,
}
