use crate::uop::{AluOp, Val};

/// Elementwise unary operators. `Noop` and `Cast` are shape-only and never
/// reach the ALU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Noop,
    Cast,
    Neg,
    Exp2,
    Log2,
    Sin,
    Sqrt,
}

impl UnaryOp {
    #[must_use]
    pub fn alu(self) -> AluOp {
        match self {
            Self::Neg => AluOp::Neg,
            Self::Exp2 => AluOp::Exp2,
            Self::Log2 => AluOp::Log2,
            Self::Sin => AluOp::Sin,
            Self::Sqrt => AluOp::Sqrt,
            Self::Noop | Self::Cast => unreachable!("{self:?} is not an ALU op"),
        }
    }
}

/// Elementwise binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Max,
    CmpLt,
}

impl BinaryOp {
    #[must_use]
    pub fn alu(self) -> AluOp {
        match self {
            Self::Add => AluOp::Add,
            Self::Sub => AluOp::Sub,
            Self::Mul => AluOp::Mul,
            Self::Div => AluOp::Div,
            Self::Mod => AluOp::Mod,
            Self::Max => AluOp::Max,
            Self::CmpLt => AluOp::CmpLt,
        }
    }
}

/// Elementwise ternary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TernaryOp {
    MulAcc,
    Where,
}

impl TernaryOp {
    #[must_use]
    pub fn alu(self) -> AluOp {
        match self {
            Self::MulAcc => AluOp::MulAcc,
            Self::Where => AluOp::Where,
        }
    }
}

/// Reduction operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    /// The identity the accumulator is initialized to.
    #[must_use]
    pub fn identity(self) -> Val {
        match self {
            Self::Sum => Val::Float(0.0),
            Self::Max => Val::Float(f64::NEG_INFINITY),
        }
    }

    /// The ALU op that folds a value into the accumulator.
    #[must_use]
    pub fn alu(self) -> AluOp {
        match self {
            Self::Sum => AluOp::Add,
            Self::Max => AluOp::Max,
        }
    }
}

/// A tensor expression tree. Leaves load buffer slots, the root stores
/// into the output slot; everything in between is elementwise arithmetic
/// with at most one reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LazyOp {
    Unary(UnaryOp, Box<LazyOp>),
    Binary(BinaryOp, Box<LazyOp>, Box<LazyOp>),
    Ternary(TernaryOp, Box<LazyOp>, Box<LazyOp>, Box<LazyOp>),
    Reduce(ReduceOp, Box<LazyOp>),
    /// Load from a buffer slot
    Load(usize),
    /// Store into a buffer slot; only valid at the root
    Store(usize, Box<LazyOp>),
}

impl LazyOp {
    #[must_use]
    pub fn load(slot: usize) -> Self {
        Self::Load(slot)
    }

    #[must_use]
    pub fn store(slot: usize, value: LazyOp) -> Self {
        Self::Store(slot, Box::new(value))
    }

    #[must_use]
    pub fn unary(op: UnaryOp, src: LazyOp) -> Self {
        Self::Unary(op, Box::new(src))
    }

    #[must_use]
    pub fn binary(op: BinaryOp, a: LazyOp, b: LazyOp) -> Self {
        Self::Binary(op, Box::new(a), Box::new(b))
    }

    #[must_use]
    pub fn reduce(op: ReduceOp, src: LazyOp) -> Self {
        Self::Reduce(op, Box::new(src))
    }

    /// The reduce node of this tree, if any.
    #[must_use]
    pub fn reduce_node(&self) -> Option<&LazyOp> {
        match self {
            Self::Reduce(..) => Some(self),
            Self::Load(_) => None,
            Self::Unary(_, a) => a.reduce_node(),
            Self::Binary(_, a, b) => a.reduce_node().or_else(|| b.reduce_node()),
            Self::Ternary(_, a, b, c) => a
                .reduce_node()
                .or_else(|| b.reduce_node())
                .or_else(|| c.reduce_node()),
            Self::Store(_, v) => v.reduce_node(),
        }
    }

    /// Buffer slots loaded anywhere in this tree, in first-use order.
    #[must_use]
    pub fn loaded_slots(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_slots(&mut out);
        out
    }

    fn collect_slots(&self, out: &mut Vec<usize>) {
        match self {
            Self::Load(slot) => {
                if !out.contains(slot) {
                    out.push(*slot);
                }
            }
            Self::Unary(_, a) | Self::Reduce(_, a) | Self::Store(_, a) => a.collect_slots(out),
            Self::Binary(_, a, b) => {
                a.collect_slots(out);
                b.collect_slots(out);
            }
            Self::Ternary(_, a, b, c) => {
                a.collect_slots(out);
                b.collect_slots(out);
                c.collect_slots(out);
            }
        }
    }
}
