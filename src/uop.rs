use std::collections::{HashMap, HashSet};
use std::fmt;

use num_enum::TryFromPrimitive;

/// Scalar base types carried by uops and buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum DTypeKind {
    Bool = 0,
    Int32 = 1,
    Float32 = 2,
}

/// A scalar or short-vector data type, optionally a pointer to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    pub kind: DTypeKind,
    /// Vector lane count; 1 for scalars.
    pub count: u8,
    pub ptr: bool,
}

impl DType {
    pub const BOOL: Self = Self::scalar(DTypeKind::Bool);
    pub const INT32: Self = Self::scalar(DTypeKind::Int32);
    pub const FLOAT32: Self = Self::scalar(DTypeKind::Float32);
    pub const FLOAT2: Self = Self::vec(DTypeKind::Float32, 2);
    pub const FLOAT4: Self = Self::vec(DTypeKind::Float32, 4);

    #[must_use]
    pub const fn scalar(kind: DTypeKind) -> Self {
        Self {
            kind,
            count: 1,
            ptr: false,
        }
    }

    #[must_use]
    pub const fn vec(kind: DTypeKind, count: u8) -> Self {
        Self {
            kind,
            count,
            ptr: false,
        }
    }

    /// The pointer type to this type.
    #[must_use]
    pub const fn ptr_to(self) -> Self {
        Self { ptr: true, ..self }
    }

    /// The element type of a vector or pointer.
    #[must_use]
    pub const fn base(self) -> Self {
        Self::scalar(self.kind)
    }

    #[must_use]
    pub const fn is_int(self) -> bool {
        matches!(self.kind, DTypeKind::Int32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.kind {
            DTypeKind::Bool => "bool",
            DTypeKind::Int32 => "int32",
            DTypeKind::Float32 => "float",
        };
        if self.count > 1 {
            write!(f, "{base}{}", self.count)?;
        } else {
            f.write_str(base)?;
        }
        if self.ptr {
            f.write_str("*")?;
        }
        Ok(())
    }
}

/// A scalar constant. `Eq` and `Hash` use the float's bit pattern so the
/// common-subexpression cache can key on it.
#[derive(Debug, Clone, Copy)]
pub enum Val {
    Int(i64),
    Float(f64),
}

impl Val {
    #[must_use]
    pub fn is_zero(self) -> bool {
        match self {
            Self::Int(v) => v == 0,
            Self::Float(v) => v == 0.0,
        }
    }

    #[must_use]
    pub fn is_one(self) -> bool {
        match self {
            Self::Int(v) => v == 1,
            Self::Float(v) => v == 1.0,
        }
    }

    #[must_use]
    pub fn neg(self) -> Self {
        match self {
            Self::Int(v) => Self::Int(-v),
            Self::Float(v) => Self::Float(-v),
        }
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Val {}

impl std::hash::Hash for Val {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Self::Int(v) => {
                state.write_u8(0);
                v.hash(state);
            }
            Self::Float(v) => {
                state.write_u8(1);
                v.to_bits().hash(state);
            }
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
        }
    }
}

/// Uop opcodes. The numbering is stable so downstream encoders can rely
/// on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum UOpKind {
    Loop = 0,
    If,
    End,
    Special,
    DefineGlobal,
    DefineLocal,
    DefineAcc,
    Load,
    Store,
    Const,
    Barrier,
    Alu,
    Wmma,
    Cast,
    Gep,
}

impl UOpKind {
    /// Opcodes that model control flow or stateful effects; these are
    /// never deduplicated.
    #[must_use]
    pub fn cachable(self) -> bool {
        !matches!(
            self,
            Self::Loop | Self::If | Self::End | Self::DefineAcc | Self::Barrier
        )
    }

    /// Opcodes kept alive by the dead-code pass even without consumers.
    #[must_use]
    pub fn has_side_effect(self) -> bool {
        matches!(
            self,
            Self::Store | Self::Wmma | Self::End | Self::Barrier | Self::DefineGlobal
        )
    }
}

/// Operator tags carried by `ALU` uops. Stable numbering, as with
/// [`UOpKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum AluOp {
    Neg = 0,
    Exp2,
    Log2,
    Sin,
    Sqrt,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Max,
    CmpLt,
    MulAcc,
    Where,
}

/// Hardware matrix-multiply targets expanded by a device backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WmmaTarget {
    Metal,
    Hip,
}

impl fmt::Display for WmmaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Metal => "METAL",
            Self::Hip => "HIP",
        })
    }
}

/// Per-kind uop payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arg {
    None,
    /// `(dimension index, axis name, size)` of a hardware-provided index
    Special {
        dim: u8,
        name: String,
        size: u32,
    },
    DefineGlobal {
        name: String,
        dtype: DType,
    },
    DefineLocal {
        name: String,
        count: u32,
    },
    /// Accumulator initial value
    Acc(Val),
    Const(Val),
    Alu(AluOp),
    Wmma(WmmaTarget),
    /// Vector lane selected by a `GEP`
    Lane(u8),
}

/// Identifies a uop in its graph. Ids are assigned in insertion order and
/// stay sparse after dead-code elimination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UOpId(u32);

impl UOpId {
    #[inline]
    #[must_use]
    pub fn id(self) -> u32 {
        self.0
    }
}

/// A single micro-operation. Identity is the `id`; the operand list refers
/// to earlier uops in the same graph.
#[derive(Debug, Clone)]
pub struct UOp {
    pub id: UOpId,
    pub op: UOpKind,
    pub dtype: Option<DType>,
    pub operands: Vec<UOpId>,
    pub arg: Arg,
}

impl fmt::Display for UOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dtype = self.dtype.map(|d| d.to_string()).unwrap_or_default();
        let operands: Vec<u32> = self.operands.iter().map(|x| x.id()).collect();
        write!(
            f,
            "{:4} {:16} {:10} {:24} {:?}",
            self.id.id(),
            format!("{:?}", self.op),
            dtype,
            format!("{operands:?}"),
            self.arg
        )
    }
}

type CacheKey = (UOpKind, Option<DType>, Vec<UOpId>, Arg);

/// An append-only sequence of uops with deduplicating insertion and
/// peephole rewrites. Relative order of retained uops is the emission
/// order; downstream codegen relies on it.
#[derive(Debug, Default)]
pub struct UOpGraph {
    uops: Vec<UOp>,
    cache: HashMap<CacheKey, UOpId>,
    next_id: u32,
}

impl UOpGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.uops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uops.is_empty()
    }

    #[must_use]
    pub fn uops(&self) -> &[UOp] {
        &self.uops
    }

    /// Look up a uop by id. Ids stay sorted even after the dead-code pass,
    /// so this stays cheap on sparse graphs.
    #[must_use]
    pub fn get(&self, id: UOpId) -> &UOp {
        let idx = self
            .uops
            .binary_search_by_key(&id, |u| u.id)
            .unwrap_or_else(|_| panic!("dangling uop id {}", id.id()));
        &self.uops[idx]
    }

    /// Emit (or reuse) a `CONST`.
    pub fn const_val(&mut self, value: Val, dtype: DType) -> UOpId {
        self.emit(UOpKind::Const, Some(dtype), vec![], Arg::Const(value), true)
    }

    /// Append a uop, applying the insertion-time rewrites in order. A
    /// rewrite that fires re-enters from the top. When `cachable`, an
    /// identical `(op, dtype, operands, arg)` returns the existing id.
    pub fn emit(
        &mut self,
        op: UOpKind,
        dtype: Option<DType>,
        operands: Vec<UOpId>,
        arg: Arg,
        cachable: bool,
    ) -> UOpId {
        // control flow and stateful effects are never deduplicated
        let cachable = cachable && op.cachable();
        // self-store is a no-op
        if op == UOpKind::Store && operands.len() == 2 && operands[0] == operands[1] {
            return operands[0];
        }
        // CAST over GEPs that recompose the full source vector in order
        if op == UOpKind::Cast && !operands.is_empty() {
            let geps: Vec<&UOp> = operands.iter().map(|&x| self.get(x)).collect();
            if geps.iter().all(|u| u.op == UOpKind::Gep) {
                let src = geps[0].operands[0];
                let in_order = geps
                    .iter()
                    .enumerate()
                    .all(|(i, u)| u.operands[0] == src && u.arg == Arg::Lane(i as u8));
                let full_width = self.get(src).dtype.map(|d| d.count as usize) == Some(geps.len());
                if in_order && full_width {
                    return src;
                }
            }
        }
        // GEP of a constant selects the same constant
        if op == UOpKind::Gep {
            if let Arg::Const(c) = self.get(operands[0]).arg {
                let dt = dtype.unwrap_or(DType::FLOAT32);
                return self.const_val(c, dt);
            }
        }
        if op == UOpKind::Alu {
            if arg == Arg::Alu(AluOp::Neg) {
                if let Arg::Const(c) = self.get(operands[0]).arg {
                    let dt = dtype.unwrap_or(DType::FLOAT32);
                    return self.const_val(c.neg(), dt);
                }
            }
            if operands.len() == 2 {
                // a + (-b) becomes a - b; the NEG stays behind for the
                // dead-code pass
                if arg == Arg::Alu(AluOp::Add) {
                    let rhs = self.get(operands[1]);
                    if rhs.op == UOpKind::Alu && rhs.arg == Arg::Alu(AluOp::Neg) {
                        let new_operands = vec![operands[0], rhs.operands[0]];
                        return self.emit(op, dtype, new_operands, Arg::Alu(AluOp::Sub), cachable);
                    }
                }
                // zero and identity folds, either side of the commutative ops
                for x in 0..2 {
                    if let Arg::Const(c) = self.get(operands[x]).arg {
                        if arg == Arg::Alu(AluOp::Add) && c.is_zero() {
                            return operands[1 - x];
                        }
                        if arg == Arg::Alu(AluOp::Mul) && c.is_one() {
                            return operands[1 - x];
                        }
                        if arg == Arg::Alu(AluOp::Mul) && c.is_zero() {
                            return operands[x];
                        }
                    }
                }
                if let Arg::Const(c) = self.get(operands[1]).arg {
                    if arg == Arg::Alu(AluOp::Sub) && c.is_zero() {
                        return operands[0];
                    }
                    if arg == Arg::Alu(AluOp::Div) && c.is_one() {
                        return operands[0];
                    }
                }
            }
        }
        let key = (op, dtype, operands, arg);
        if cachable {
            if let Some(&id) = self.cache.get(&key) {
                return id;
            }
        }
        let (op, dtype, operands, arg) = key;
        let id = UOpId(self.next_id);
        self.next_id += 1;
        let uop = UOp {
            id,
            op,
            dtype,
            operands,
            arg,
        };
        log::trace!("{uop}");
        if cachable {
            self.cache.insert(
                (uop.op, uop.dtype, uop.operands.clone(), uop.arg.clone()),
                id,
            );
        }
        self.uops.push(uop);
        id
    }

    /// Drop every uop that is neither referenced by a retained uop nor a
    /// side effect, repeating until a fixpoint. Ids are not renumbered.
    pub fn eliminate_dead(&mut self) {
        loop {
            let mut has_child: HashSet<UOpId> = HashSet::with_capacity(self.uops.len());
            for u in &self.uops {
                for &v in &u.operands {
                    has_child.insert(v);
                }
            }
            let before = self.uops.len();
            self.uops
                .retain(|u| has_child.contains(&u.id) || u.op.has_side_effect());
            if self.uops.len() == before {
                break;
            }
            log::debug!("reduced uop count from {} to {}", before, self.uops.len());
        }
        if cfg!(debug_assertions) {
            let live: HashSet<UOpId> = self.uops.iter().map(|u| u.id).collect();
            for u in &self.uops {
                for v in &u.operands {
                    debug_assert!(live.contains(v), "dangling operand {} in {}", v.id(), u);
                }
            }
        }
        self.cache.clear();
    }
}

impl<'a> IntoIterator for &'a UOpGraph {
    type Item = &'a UOp;
    type IntoIter = std::slice::Iter<'a, UOp>;
    fn into_iter(self) -> Self::IntoIter {
        self.uops.iter()
    }
}
