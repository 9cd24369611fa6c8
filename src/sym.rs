use std::collections::HashMap;
use std::sync::Arc;
use std::{error, fmt};

use crate::uop::{AluOp, DType, UOpId};

/// Symbolic algebra errors
#[derive(Debug, Clone)]
pub enum Error {
    /// Divisor or modulus that is not a positive integer
    NonPositiveDivisor(i64),
    /// Variable declared with `lo > hi`
    EmptyRange { lo: i64, hi: i64 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveDivisor(b) => write!(f, "divisor must be positive, got {b}"),
            Self::EmptyRange { lo, hi } => write!(f, "variable range [{lo}, {hi}] is empty"),
        }
    }
}

impl error::Error for Error {}

/// A symbolic integer expression with a known `[min, max]` bound.
///
/// Nodes are immutable; the constructors normalize eagerly, so two
/// expressions that simplify to the same form compare equal structurally.
/// All arithmetic is two's-complement 64-bit, division and modulus are
/// floor-based with a positive right-hand side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymNode {
    kind: SymKind,
    min: i64,
    max: i64,
}

/// The variant tag of a [`SymNode`].
///
/// `Mul`/`Div`/`Mod`/`Lt` keep an integer right-hand side; `Sum` and `And`
/// are kept flat (no nested node of the same variant survives construction).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymKind {
    Num(i64),
    /// A symbolic integer. Anonymous variables (`name == None`) are upcast
    /// placeholders that get substituted or expanded before rendering.
    Var(Option<Arc<str>>),
    Mul(Arc<SymNode>, i64),
    Div(Arc<SymNode>, i64),
    Mod(Arc<SymNode>, i64),
    Lt(Arc<SymNode>, i64),
    Sum(Vec<Arc<SymNode>>),
    And(Vec<Arc<SymNode>>),
}

/// Context callbacks used to render a [`SymNode`] into uops.
///
/// The linearizer implements this; index arithmetic renders as `int32` ALU
/// chains and comparisons as `bool`.
pub trait SymRender {
    type Error;
    /// Resolve a named variable to the uop holding its value.
    fn var_uop(&mut self, name: &str) -> Result<UOpId, Self::Error>;
    /// Emit (or reuse) an integer constant.
    fn const_uop(&mut self, value: i64, dtype: DType) -> UOpId;
    /// Emit (or reuse) a binary ALU op.
    fn alu_uop(&mut self, op: AluOp, dtype: DType, a: UOpId, b: UOpId) -> UOpId;
}

impl SymNode {
    #[must_use]
    pub fn num(value: i64) -> Self {
        Self {
            kind: SymKind::Num(value),
            min: value,
            max: value,
        }
    }

    /// A named variable ranging over `[lo, hi]`. A single-valued range
    /// collapses to a constant.
    pub fn var(name: impl Into<Arc<str>>, lo: i64, hi: i64) -> Result<Self, Error> {
        if lo > hi {
            return Err(Error::EmptyRange { lo, hi });
        }
        if lo == hi {
            return Ok(Self::num(lo));
        }
        Ok(Self {
            kind: SymKind::Var(Some(name.into())),
            min: lo,
            max: hi,
        })
    }

    /// An anonymous upcast placeholder over `[lo, hi]`.
    pub fn var_anon(lo: i64, hi: i64) -> Result<Self, Error> {
        if lo > hi {
            return Err(Error::EmptyRange { lo, hi });
        }
        if lo == hi {
            return Ok(Self::num(lo));
        }
        Ok(Self {
            kind: SymKind::Var(None),
            min: lo,
            max: hi,
        })
    }

    #[must_use]
    pub fn min(&self) -> i64 {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> i64 {
        self.max
    }

    #[must_use]
    pub fn kind(&self) -> &SymKind {
        &self.kind
    }

    /// The variable's name, if this is a named `Var`.
    #[must_use]
    pub fn var_name(&self) -> Option<&str> {
        match &self.kind {
            SymKind::Var(Some(name)) => Some(name),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_num(&self) -> bool {
        matches!(self.kind, SymKind::Num(_))
    }

    #[must_use]
    pub fn as_num(&self) -> Option<i64> {
        match self.kind {
            SymKind::Num(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn add(&self, other: &SymNode) -> Self {
        Self::sum(vec![self.clone(), other.clone()])
    }

    #[must_use]
    pub fn mul(&self, b: i64) -> Self {
        if b == 0 {
            return Self::num(0);
        }
        if b == 1 {
            return self.clone();
        }
        match &self.kind {
            SymKind::Num(a) => Self::num(a * b),
            // constant factors combine through nested muls
            SymKind::Mul(a, b0) => a.mul(b0 * b),
            // distributing over a sum tightens bounds
            SymKind::Sum(nodes) => Self::sum(nodes.iter().map(|n| n.mul(b)).collect()),
            _ => {
                let (lo, hi) = (self.min * b, self.max * b);
                Self {
                    kind: SymKind::Mul(Arc::new(self.clone()), b),
                    min: lo.min(hi),
                    max: lo.max(hi),
                }
            }
        }
    }

    /// Floor division by a positive constant.
    pub fn div(&self, b: i64) -> Result<Self, Error> {
        if b <= 0 {
            return Err(Error::NonPositiveDivisor(b));
        }
        Ok(self.fdiv(b))
    }

    /// Remainder after floor division by a positive constant.
    pub fn modulo(&self, b: i64) -> Result<Self, Error> {
        if b <= 0 {
            return Err(Error::NonPositiveDivisor(b));
        }
        Ok(self.fmod(b))
    }

    // Worker for `div`; the divisor has been validated positive.
    fn fdiv(&self, b: i64) -> Self {
        debug_assert!(b > 0);
        if b == 1 {
            return self.clone();
        }
        match &self.kind {
            SymKind::Num(a) => Self::num(a.div_euclid(b)),
            SymKind::Mul(a, b0) => {
                if b0 % b == 0 {
                    a.mul(b0 / b)
                } else if b % b0 == 0 && *b0 > 0 {
                    a.fdiv(b / b0)
                } else {
                    self.fdiv_generic(b)
                }
            }
            SymKind::Sum(nodes) => {
                // divide through when every term is divisible; a small
                // non-negative remainder vanishes under the floor
                let mut divided = Vec::new();
                let mut rest = Vec::new();
                for n in nodes {
                    let divisible = match &n.kind {
                        SymKind::Num(a) => a % b == 0,
                        SymKind::Mul(_, b0) => b0 % b == 0,
                        _ => false,
                    };
                    if divisible {
                        divided.push(n.fdiv(b));
                    } else {
                        rest.push(n.as_ref().clone());
                    }
                }
                if rest.is_empty() {
                    return Self::sum(divided);
                }
                let rem = Self::sum(rest);
                if rem.min >= 0 && rem.max < b {
                    return Self::sum(divided);
                }
                self.fdiv_generic(b)
            }
            _ => self.fdiv_generic(b),
        }
    }

    fn fdiv_generic(&self, b: i64) -> Self {
        // shift a negative-min child into non-negative range first
        if self.min < 0 {
            let offset = self.min.div_euclid(b);
            return self
                .add(&Self::num(-offset * b))
                .fdiv(b)
                .add(&Self::num(offset));
        }
        Self {
            kind: SymKind::Div(Arc::new(self.clone()), b),
            min: self.min.div_euclid(b),
            max: self.max.div_euclid(b),
        }
    }

    // Worker for `modulo`; the modulus has been validated positive.
    fn fmod(&self, b: i64) -> Self {
        debug_assert!(b > 0);
        if b == 1 {
            return Self::num(0);
        }
        match &self.kind {
            SymKind::Num(a) => Self::num(a.rem_euclid(b)),
            SymKind::Mul(a, b0) => {
                let m = b0.rem_euclid(b);
                if m == 0 {
                    return Self::num(0);
                }
                let reduced = a.mul(m);
                if reduced == *self {
                    self.fmod_generic(b)
                } else {
                    reduced.fmod(b)
                }
            }
            SymKind::Sum(nodes) => {
                // reduce each term's constant factor before the fold
                let reduced = Self::sum(
                    nodes
                        .iter()
                        .map(|n| match &n.kind {
                            SymKind::Num(a) => Self::num(a.rem_euclid(b)),
                            SymKind::Mul(a, b0) => a.mul(b0.rem_euclid(b)),
                            _ => n.as_ref().clone(),
                        })
                        .collect(),
                );
                if reduced == *self {
                    self.fmod_generic(b)
                } else {
                    reduced.fmod(b)
                }
            }
            _ => self.fmod_generic(b),
        }
    }

    fn fmod_generic(&self, b: i64) -> Self {
        if self.min >= 0 && self.max < b {
            return self.clone();
        }
        let (qlo, qhi) = (self.min.div_euclid(b), self.max.div_euclid(b));
        if qlo == qhi {
            return self.add(&Self::num(-b * qlo));
        }
        if self.min < 0 {
            return self.add(&Self::num(-qlo * b)).fmod(b);
        }
        let (lo, hi) = if self.max - self.min >= b
            || (self.min != self.max && self.min.rem_euclid(b) >= self.max.rem_euclid(b))
        {
            (0, b - 1)
        } else {
            (self.min.rem_euclid(b), self.max.rem_euclid(b))
        };
        Self {
            kind: SymKind::Mod(Arc::new(self.clone()), b),
            min: lo,
            max: hi,
        }
    }

    /// Boolean-valued comparison `self < b`, folded when the bounds decide it.
    #[must_use]
    pub fn lt(&self, b: i64) -> Self {
        if self.max < b {
            return Self::num(1);
        }
        if self.min >= b {
            return Self::num(0);
        }
        Self {
            kind: SymKind::Lt(Arc::new(self.clone()), b),
            min: 0,
            max: 1,
        }
    }

    /// Boolean-valued `self >= b`, encoded through [`SymNode::lt`].
    #[must_use]
    pub fn ge(&self, b: i64) -> Self {
        self.mul(-1).lt(1 - b)
    }

    /// Commutative flattened sum. Constants fold into a single trailing
    /// term, zero terms are dropped, a singleton collapses.
    #[must_use]
    pub fn sum(nodes: Vec<SymNode>) -> Self {
        let mut flat: Vec<Arc<SymNode>> = Vec::new();
        let mut acc = 0i64;
        let mut stack: Vec<SymNode> = nodes;
        stack.reverse();
        while let Some(n) = stack.pop() {
            match n.kind {
                SymKind::Num(v) => acc += v,
                SymKind::Sum(children) => {
                    for c in children {
                        match &c.kind {
                            SymKind::Num(v) => acc += v,
                            _ => flat.push(c),
                        }
                    }
                }
                _ => {
                    if n.min != 0 || n.max != 0 {
                        flat.push(Arc::new(n));
                    }
                }
            }
        }
        if acc != 0 {
            flat.push(Arc::new(Self::num(acc)));
        }
        match flat.len() {
            0 => Self::num(0),
            1 => flat[0].as_ref().clone(),
            _ => {
                let min = flat.iter().map(|n| n.min).sum();
                let max = flat.iter().map(|n| n.max).sum();
                Self {
                    kind: SymKind::Sum(flat),
                    min,
                    max,
                }
            }
        }
    }

    /// Flattened boolean conjunction. A constant-false child collapses the
    /// whole node, constant-true children are dropped.
    #[must_use]
    pub fn ands(nodes: Vec<SymNode>) -> Self {
        let mut flat: Vec<Arc<SymNode>> = Vec::new();
        let mut stack: Vec<SymNode> = nodes;
        stack.reverse();
        while let Some(n) = stack.pop() {
            match n.kind {
                SymKind::And(children) => {
                    for c in children {
                        if c.min == 0 && c.max == 0 {
                            return Self::num(0);
                        }
                        if c.min != c.max {
                            flat.push(c);
                        }
                    }
                }
                _ => {
                    if n.min == 0 && n.max == 0 {
                        return Self::num(0);
                    }
                    if n.min != n.max {
                        flat.push(Arc::new(n));
                    }
                }
            }
        }
        match flat.len() {
            0 => Self::num(1),
            1 => flat[0].as_ref().clone(),
            _ => {
                let min = flat.iter().map(|n| n.min).min().unwrap_or(0);
                let max = flat.iter().map(|n| n.max).max().unwrap_or(1);
                Self {
                    kind: SymKind::And(flat),
                    min,
                    max,
                }
            }
        }
    }

    /// Replace variables (keyed by the whole `Var` node, so anonymous
    /// placeholders can be targeted) and rebuild through the normalizing
    /// constructors. The original node is untouched.
    #[must_use]
    pub fn substitute(&self, map: &HashMap<SymNode, SymNode>) -> Self {
        match &self.kind {
            SymKind::Num(_) => self.clone(),
            SymKind::Var(_) => map.get(self).cloned().unwrap_or_else(|| self.clone()),
            SymKind::Mul(a, b) => a.substitute(map).mul(*b),
            SymKind::Div(a, b) => a.substitute(map).fdiv(*b),
            SymKind::Mod(a, b) => a.substitute(map).fmod(*b),
            SymKind::Lt(a, b) => a.substitute(map).lt(*b),
            SymKind::Sum(nodes) => Self::sum(nodes.iter().map(|n| n.substitute(map)).collect()),
            SymKind::And(nodes) => Self::ands(nodes.iter().map(|n| n.substitute(map)).collect()),
        }
    }

    /// All `Var` nodes reachable from this node, in first-use order.
    #[must_use]
    pub fn vars(&self) -> Vec<&SymNode> {
        let mut out = Vec::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars<'a>(&'a self, out: &mut Vec<&'a SymNode>) {
        match &self.kind {
            SymKind::Num(_) => {}
            SymKind::Var(_) => {
                if !out.contains(&self) {
                    out.push(self);
                }
            }
            SymKind::Mul(a, _) | SymKind::Div(a, _) | SymKind::Mod(a, _) | SymKind::Lt(a, _) => {
                a.collect_vars(out);
            }
            SymKind::Sum(nodes) | SymKind::And(nodes) => {
                for n in nodes {
                    n.collect_vars(out);
                }
            }
        }
    }

    /// The anonymous upcast placeholder inside this node, if any.
    #[must_use]
    pub fn expand_idx(&self) -> Option<SymNode> {
        self.vars()
            .into_iter()
            .find(|v| matches!(v.kind, SymKind::Var(None)))
            .cloned()
    }

    /// Enumerate the concrete value tuples of `vars` with the first
    /// variable varying fastest, matching [`SymNode::expand`].
    #[must_use]
    pub fn iter_idxs(vars: &[SymNode]) -> Vec<Vec<i64>> {
        let mut out = vec![Vec::new()];
        for v in vars {
            let mut next = Vec::with_capacity(out.len() * (v.max - v.min + 1) as usize);
            for val in v.min..=v.max {
                for prefix in &out {
                    let mut t = prefix.clone();
                    t.push(val);
                    next.push(t);
                }
            }
            out = next;
        }
        out
    }

    /// Substitute every assignment of `vars` into this node, in
    /// [`SymNode::iter_idxs`] order.
    #[must_use]
    pub fn expand(&self, vars: &[SymNode]) -> Vec<SymNode> {
        Self::iter_idxs(vars)
            .into_iter()
            .map(|vals| {
                let map = vars
                    .iter()
                    .zip(&vals)
                    .map(|(v, &val)| (v.clone(), Self::num(val)))
                    .collect();
                self.substitute(&map)
            })
            .collect()
    }

    /// Enumerate this node over its own anonymous placeholder, if present.
    #[must_use]
    pub fn expand_self(&self) -> Vec<SymNode> {
        match self.expand_idx() {
            Some(v) => self.expand(&[v]),
            None => vec![self.clone()],
        }
    }

    /// Lower this node to uops through the context. `Sum` renders as a left
    /// fold of ADD, `And` as a left fold of boolean MUL.
    pub fn render<R: SymRender>(&self, ctx: &mut R) -> Result<UOpId, R::Error> {
        match &self.kind {
            SymKind::Num(v) => Ok(ctx.const_uop(*v, DType::INT32)),
            SymKind::Var(Some(name)) => {
                let name = name.clone();
                ctx.var_uop(&name)
            }
            SymKind::Var(None) => unreachable!("anonymous variable reached render"),
            SymKind::Mul(a, b) => Self::render_alu(ctx, a, *b, AluOp::Mul, DType::INT32),
            SymKind::Div(a, b) => Self::render_alu(ctx, a, *b, AluOp::Div, DType::INT32),
            SymKind::Mod(a, b) => Self::render_alu(ctx, a, *b, AluOp::Mod, DType::INT32),
            SymKind::Lt(a, b) => Self::render_alu(ctx, a, *b, AluOp::CmpLt, DType::BOOL),
            SymKind::Sum(nodes) => Self::render_fold(ctx, nodes, AluOp::Add, DType::INT32),
            SymKind::And(nodes) => Self::render_fold(ctx, nodes, AluOp::Mul, DType::BOOL),
        }
    }

    fn render_alu<R: SymRender>(
        ctx: &mut R,
        a: &SymNode,
        b: i64,
        op: AluOp,
        dtype: DType,
    ) -> Result<UOpId, R::Error> {
        let lhs = a.render(ctx)?;
        let rhs = ctx.const_uop(b, DType::INT32);
        Ok(ctx.alu_uop(op, dtype, lhs, rhs))
    }

    fn render_fold<R: SymRender>(
        ctx: &mut R,
        nodes: &[Arc<SymNode>],
        op: AluOp,
        dtype: DType,
    ) -> Result<UOpId, R::Error> {
        debug_assert!(!nodes.is_empty());
        let mut acc = nodes[0].render(ctx)?;
        for n in &nodes[1..] {
            let rhs = n.render(ctx)?;
            acc = ctx.alu_uop(op, dtype, acc, rhs);
        }
        Ok(acc)
    }
}

impl fmt::Display for SymNode {
    /// Deterministic textual form; the linearizer's load cache keys on it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SymKind::Num(v) => write!(f, "{v}"),
            SymKind::Var(Some(name)) => f.write_str(name),
            SymKind::Var(None) => write!(f, "?[{}..{}]", self.min, self.max),
            SymKind::Mul(a, b) => write!(f, "({a}*{b})"),
            SymKind::Div(a, b) => write!(f, "({a}//{b})"),
            SymKind::Mod(a, b) => write!(f, "({a}%{b})"),
            SymKind::Lt(a, b) => write!(f, "({a}<{b})"),
            SymKind::Sum(nodes) => {
                f.write_str("(")?;
                for (i, n) in nodes.iter().enumerate() {
                    if i > 0 {
                        f.write_str("+")?;
                    }
                    write!(f, "{n}")?;
                }
                f.write_str(")")
            }
            SymKind::And(nodes) => {
                f.write_str("(")?;
                for (i, n) in nodes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" and ")?;
                    }
                    write!(f, "{n}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(name: &str, lo: i64, hi: i64) -> SymNode {
        SymNode::var(name, lo, hi).unwrap()
    }

    /// Evaluate a node under a total assignment of its named variables.
    fn eval(n: &SymNode, env: &HashMap<&str, i64>) -> i64 {
        match n.kind() {
            SymKind::Num(v) => *v,
            SymKind::Var(Some(name)) => env[name.as_ref()],
            SymKind::Var(None) => panic!("anonymous var in eval"),
            SymKind::Mul(a, b) => eval(a, env) * b,
            SymKind::Div(a, b) => eval(a, env).div_euclid(*b),
            SymKind::Mod(a, b) => eval(a, env).rem_euclid(*b),
            SymKind::Lt(a, b) => i64::from(eval(a, env) < *b),
            SymKind::Sum(nodes) => nodes.iter().map(|x| eval(x, env)).sum(),
            SymKind::And(nodes) => i64::from(nodes.iter().all(|x| eval(x, env) != 0)),
        }
    }

    #[test]
    fn test_folding_identities() {
        let x = v("x", 0, 7);
        assert_eq!(x.add(&SymNode::num(0)), x);
        assert_eq!(x.mul(1), x);
        assert_eq!(x.mul(0), SymNode::num(0));
        assert_eq!(SymNode::num(17).modulo(5).unwrap(), SymNode::num(2));
        assert_eq!(SymNode::num(3).lt(4), SymNode::num(1));
        assert_eq!(SymNode::num(4).lt(4), SymNode::num(0));
        assert_eq!(SymNode::num(7).div(2).unwrap(), SymNode::num(3));
    }

    #[test]
    fn test_invalid_algebra() {
        let x = v("x", 0, 7);
        assert!(x.div(0).is_err());
        assert!(x.div(-2).is_err());
        assert!(x.modulo(0).is_err());
        assert!(SymNode::var("y", 3, 2).is_err());
    }

    #[test]
    fn test_var_collapse() {
        assert_eq!(SymNode::var("x", 4, 4).unwrap(), SymNode::num(4));
        assert_eq!(SymNode::var_anon(0, 0).unwrap(), SymNode::num(0));
    }

    #[test]
    fn test_mul_div_cancel() {
        let x = v("x", 0, 7);
        assert_eq!(x.mul(4).div(4).unwrap(), x);
        assert_eq!(x.mul(8).div(4).unwrap(), x.mul(2));
        assert_eq!(x.mul(2).div(4).unwrap(), x.div(2).unwrap());
    }

    #[test]
    fn test_sum_flattening() {
        let x = v("x", 0, 7);
        let y = v("y", 0, 3);
        let inner = x.add(&SymNode::num(2));
        let outer = inner.add(&y).add(&SymNode::num(3));
        // one flat sum, one folded constant
        match outer.kind() {
            SymKind::Sum(nodes) => {
                assert_eq!(nodes.len(), 3);
                assert_eq!(nodes[2].as_num(), Some(5));
            }
            other => panic!("expected sum, got {other:?}"),
        }
    }

    #[test]
    fn test_sum_div_factoring() {
        let x = v("x", 0, 7);
        let anon = SymNode::var_anon(0, 3).unwrap();
        // (x*4 + u) // 4 drops the in-range remainder
        let idx = x.mul(4).add(&anon);
        assert_eq!(idx.div(4).unwrap(), x);
        // (x*4 + 8) // 4 divides through
        let idx = x.mul(4).add(&SymNode::num(8));
        assert_eq!(idx.div(4).unwrap(), x.add(&SymNode::num(2)));
        // (x*4 + 1) stays un-factored under *4 after //4
        let idx = x.mul(4).add(&SymNode::num(1));
        assert_ne!(idx.div(4).unwrap().mul(4), idx);
    }

    #[test]
    fn test_mod_folding() {
        let x = v("x", 0, 3);
        assert_eq!(x.modulo(8).unwrap(), x);
        assert_eq!(x.mul(8).modulo(4).unwrap(), SymNode::num(0));
        let y = v("y", 0, 15);
        let m = y.modulo(4).unwrap();
        assert_eq!((m.min(), m.max()), (0, 3));
    }

    #[test]
    fn test_bounds() {
        let x = v("x", 2, 7);
        assert_eq!((x.mul(3).min(), x.mul(3).max()), (6, 21));
        assert_eq!((x.mul(-1).min(), x.mul(-1).max()), (-7, -2));
        let d = x.div(2).unwrap();
        assert_eq!((d.min(), d.max()), (1, 3));
        let s = x.add(&v("y", 0, 3));
        assert_eq!((s.min(), s.max()), (2, 10));
        let l = x.lt(5);
        assert_eq!((l.min(), l.max()), (0, 1));
    }

    #[test]
    fn test_ands() {
        let a = v("x", 0, 7).lt(3);
        let b = v("y", 0, 7).lt(5);
        let both = SymNode::ands(vec![a.clone(), b.clone()]);
        match both.kind() {
            SymKind::And(nodes) => assert_eq!(nodes.len(), 2),
            other => panic!("expected and, got {other:?}"),
        }
        assert_eq!(SymNode::ands(vec![a.clone(), SymNode::num(1)]), a);
        assert_eq!(
            SymNode::ands(vec![a, SymNode::num(0)]),
            SymNode::num(0)
        );
        assert_eq!(SymNode::ands(vec![]), SymNode::num(1));
    }

    #[test]
    fn test_ge_encoding() {
        let x = v("x", 0, 7);
        let ge2 = x.ge(2);
        for val in 0..8 {
            let env = HashMap::from([("x", val)]);
            assert_eq!(eval(&ge2, &env), i64::from(val >= 2), "x = {val}");
        }
    }

    #[test]
    fn test_normalization_is_semantic_identity() {
        // a grab bag of compound expressions, evaluated against the
        // unsimplified arithmetic over every assignment
        let x = v("x", 0, 5);
        let y = v("y", 1, 4);
        let exprs = [
            x.mul(3).add(&y.mul(-2)).add(&SymNode::num(7)),
            x.mul(6).div(3).unwrap(),
            x.add(&y).modulo(4).unwrap(),
            x.mul(4).add(&y).div(2).unwrap(),
            x.add(&SymNode::num(-3)).div(2).unwrap(),
            x.add(&SymNode::num(-3)).modulo(3).unwrap(),
            x.lt(3),
        ];
        let direct: [fn(i64, i64) -> i64; 7] = [
            |x, y| 3 * x - 2 * y + 7,
            |x, _| (6 * x).div_euclid(3),
            |x, y| (x + y).rem_euclid(4),
            |x, y| (4 * x + y).div_euclid(2),
            |x, _| (x - 3).div_euclid(2),
            |x, _| (x - 3).rem_euclid(3),
            |x, _| i64::from(x < 3),
        ];
        for (expr, f) in exprs.iter().zip(direct) {
            for xv in 0..=5 {
                for yv in 1..=4 {
                    let env = HashMap::from([("x", xv), ("y", yv)]);
                    assert_eq!(eval(expr, &env), f(xv, yv), "{expr} at x={xv} y={yv}");
                    assert!(eval(expr, &env) >= expr.min(), "{expr}");
                    assert!(eval(expr, &env) <= expr.max(), "{expr}");
                }
            }
        }
    }

    #[test]
    fn test_substitute_is_pure() {
        let x = v("x", 0, 7);
        let expr = x.mul(2).add(&SymNode::num(1));
        let map = HashMap::from([(x.clone(), SymNode::num(3))]);
        let substituted = expr.substitute(&map);
        assert_eq!(substituted, SymNode::num(7));
        // original untouched
        assert_eq!(expr, x.mul(2).add(&SymNode::num(1)));
    }

    #[test]
    fn test_expand_order() {
        let a = SymNode::var_anon(0, 1).unwrap();
        let b = SymNode::var_anon(0, 2).unwrap();
        // distinct anon vars: wrap one in an expression so they differ
        let expr = a.mul(10).add(&b.mul(100));
        let idxs = SymNode::iter_idxs(&[a.clone(), b.clone()]);
        assert_eq!(
            idxs,
            vec![
                vec![0, 0],
                vec![1, 0],
                vec![0, 1],
                vec![1, 1],
                vec![0, 2],
                vec![1, 2],
            ]
        );
        let expanded = expr.expand(&[a, b]);
        assert_eq!(expanded[0], SymNode::num(0));
        assert_eq!(expanded[1], SymNode::num(10));
        assert_eq!(expanded[2], SymNode::num(100));
        assert_eq!(expanded[5], SymNode::num(210));
    }

    #[test]
    fn test_display() {
        let x = v("x", 0, 7);
        assert_eq!(x.mul(4).to_string(), "(x*4)");
        assert_eq!(x.mul(4).add(&SymNode::num(2)).to_string(), "((x*4)+2)");
        assert_eq!(x.lt(5).to_string(), "(x<5)");
    }
}
