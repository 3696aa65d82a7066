//! Symbolic expression trees for the operations the generator lowers.
//!
//! A statement like `A = prod(trans(B), C)` is built with [`ExprBuilder`]
//! into an arena-backed [`ExprTree`]. The emitter does not walk the tree
//! directly; it asks for the [`GemmVariant`] classification and fails on
//! anything outside the supported matrix-product family.

use serde::{Deserialize, Serialize};

use crate::error::TuneError;

/// Element type of every matrix in one expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    F32,
    F64,
}

impl ScalarType {
    pub fn size_of(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /// Spelling of the type in emitted kernel source.
    pub fn device_name(self) -> &'static str {
        match self {
            Self::F32 => "float",
            Self::F64 => "double",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TuneError> {
        match s {
            "float" | "f32" => Ok(Self::F32),
            "double" | "f64" => Ok(Self::F64),
            other => Err(TuneError::Configuration(format!(
                "unknown scalar type '{other}' (expected float or double)"
            ))),
        }
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.device_name())
    }
}

/// Leaf of an expression: a named matrix or a literal scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Matrix { id: u32 },
    Scalar { value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Trans,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Assign,
    Prod,
    Add,
}

/// Index of a node in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Node {
    Leaf(Operand),
    Unary { op: UnaryOp, child: NodeId },
    Binary { op: BinaryOp, lhs: NodeId, rhs: NodeId },
}

/// An expression statement rooted at an assignment.
#[derive(Debug, Clone)]
pub struct ExprTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl ExprTree {
    /// The canonical `dst = prod(lhs, rhs)` statement, with optional
    /// transposes on either product operand. Matrix ids are fixed:
    /// 0 = destination, 1 = lhs, 2 = rhs.
    pub fn gemm(lhs_trans: bool, rhs_trans: bool) -> Self {
        let mut b = ExprBuilder::new();
        let dst = b.matrix(0);
        let mut lhs = b.matrix(1);
        if lhs_trans {
            lhs = b.trans(lhs);
        }
        let mut rhs = b.matrix(2);
        if rhs_trans {
            rhs = b.trans(rhs);
        }
        let prod = b.prod(lhs, rhs);
        b.assign(dst, prod)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    /// Pre-order traversal from the root.
    pub fn visit<F: FnMut(NodeId, &Node)>(&self, mut f: F) {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            f(id, node);
            match *node {
                Node::Leaf(_) => {}
                Node::Unary { child, .. } => stack.push(child),
                Node::Binary { lhs, rhs, .. } => {
                    stack.push(rhs);
                    stack.push(lhs);
                }
            }
        }
    }

    /// Ids of every matrix leaf, in traversal order.
    pub fn matrices(&self) -> Vec<u32> {
        let mut out = Vec::new();
        self.visit(|_, node| {
            if let Node::Leaf(Operand::Matrix { id }) = node {
                out.push(*id);
            }
        });
        out
    }

    /// Classifies the tree as one of the supported matrix-product shapes.
    ///
    /// The tree must be `assign(matrix, prod(x, y))` where each of `x`, `y`
    /// is a matrix leaf or `trans(matrix)`. Anything else is rejected.
    pub fn gemm_variant(&self) -> Result<GemmVariant, TuneError> {
        let (dst, rhs_of_assign) = match *self.node(self.root) {
            Node::Binary { op: BinaryOp::Assign, lhs, rhs } => (lhs, rhs),
            _ => {
                return Err(TuneError::UnsupportedExpressionKind(
                    "statement root is not an assignment".to_string(),
                ))
            }
        };
        if !matches!(self.node(dst), Node::Leaf(Operand::Matrix { .. })) {
            return Err(TuneError::UnsupportedExpressionKind(
                "assignment destination is not a matrix".to_string(),
            ));
        }
        let (a, b) = match *self.node(rhs_of_assign) {
            Node::Binary { op: BinaryOp::Prod, lhs, rhs } => (lhs, rhs),
            Node::Binary { op: BinaryOp::Add, .. } => {
                return Err(TuneError::UnsupportedExpressionKind(
                    "matrix addition is not a product expression".to_string(),
                ))
            }
            _ => {
                return Err(TuneError::UnsupportedExpressionKind(
                    "right-hand side is not a matrix product".to_string(),
                ))
            }
        };
        let lhs_trans = self.operand_transposed(a)?;
        let rhs_trans = self.operand_transposed(b)?;
        Ok(GemmVariant::from_flags(lhs_trans, rhs_trans))
    }

    fn operand_transposed(&self, id: NodeId) -> Result<bool, TuneError> {
        match *self.node(id) {
            Node::Leaf(Operand::Matrix { .. }) => Ok(false),
            Node::Leaf(Operand::Scalar { .. }) => Err(TuneError::UnsupportedExpressionKind(
                "scalar operand in matrix product".to_string(),
            )),
            Node::Unary { op: UnaryOp::Trans, child } => match *self.node(child) {
                Node::Leaf(Operand::Matrix { .. }) => Ok(true),
                _ => Err(TuneError::UnsupportedExpressionKind(
                    "transpose of a non-matrix operand".to_string(),
                )),
            },
            Node::Binary { .. } => Err(TuneError::UnsupportedExpressionKind(
                "nested compound operand in matrix product".to_string(),
            )),
        }
    }
}

/// Incremental builder; `assign` seals the tree.
#[derive(Debug, Default)]
pub struct ExprBuilder {
    nodes: Vec<Node>,
}

impl ExprBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn matrix(&mut self, id: u32) -> NodeId {
        self.push(Node::Leaf(Operand::Matrix { id }))
    }

    pub fn scalar(&mut self, value: f64) -> NodeId {
        self.push(Node::Leaf(Operand::Scalar { value }))
    }

    pub fn trans(&mut self, child: NodeId) -> NodeId {
        self.push(Node::Unary { op: UnaryOp::Trans, child })
    }

    pub fn prod(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.push(Node::Binary { op: BinaryOp::Prod, lhs, rhs })
    }

    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.push(Node::Binary { op: BinaryOp::Add, lhs, rhs })
    }

    pub fn assign(mut self, dst: NodeId, rhs: NodeId) -> ExprTree {
        let root = self.push(Node::Binary { op: BinaryOp::Assign, lhs: dst, rhs });
        ExprTree { nodes: self.nodes, root }
    }
}

/// The four transpose layouts of `dst = prod(lhs, rhs)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GemmVariant {
    /// Neither operand transposed.
    AA,
    /// Rhs transposed.
    AT,
    /// Lhs transposed.
    TA,
    /// Both operands transposed.
    TT,
}

impl GemmVariant {
    pub fn from_flags(lhs_trans: bool, rhs_trans: bool) -> Self {
        match (lhs_trans, rhs_trans) {
            (false, false) => Self::AA,
            (false, true) => Self::AT,
            (true, false) => Self::TA,
            (true, true) => Self::TT,
        }
    }

    /// Layout index used on the command line: 0=AA, 1=TA, 2=AT, 3=TT.
    pub fn from_layout(layout: u32) -> Result<Self, TuneError> {
        match layout {
            0 => Ok(Self::AA),
            1 => Ok(Self::TA),
            2 => Ok(Self::AT),
            3 => Ok(Self::TT),
            other => Err(TuneError::Configuration(format!(
                "unknown layout {other} (expected 0..=3)"
            ))),
        }
    }

    pub fn lhs_transposed(self) -> bool {
        matches!(self, Self::TA | Self::TT)
    }

    pub fn rhs_transposed(self) -> bool {
        matches!(self, Self::AT | Self::TT)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::AA => "aa",
            Self::AT => "at",
            Self::TA => "ta",
            Self::TT => "tt",
        }
    }
}

impl std::fmt::Display for GemmVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AA => f.write_str("AA"),
            Self::AT => f.write_str("AT"),
            Self::TA => f.write_str("TA"),
            Self::TT => f.write_str("TT"),
        }
    }
}
