use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::{error, fmt};

use crate::kernel::{Buffer, Device, Kernel};
use crate::ops::{BinaryOp, LazyOp, ReduceOp, UnaryOp};
use crate::shape::{self, ShapeTracker};
use crate::sym::{self, SymNode, SymRender};
use crate::uop::{AluOp, Arg, DType, UOpGraph, UOpId, UOpKind, Val};

/// Lowering errors. All of them abort the current lowering; no partial
/// graph is ever returned.
#[derive(Debug, Clone)]
pub enum Error {
    /// A symbolic-index constructor was handed bad algebra
    InvalidAlgebra(sym::Error),
    /// Coordinate or partition arity disagreement
    ShapeMismatch { expected: usize, got: usize },
    /// A view transform the tracker cannot express
    Reshape(shape::Error),
    /// Tensor-core lowering requested for a device without one
    UnsupportedTarget(Device),
    MalformedAst(&'static str),
    /// A rendered variable with no defining uop
    UnboundVariable(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAlgebra(e) => write!(f, "invalid algebra: {e}"),
            Self::ShapeMismatch { expected, got } => {
                write!(f, "shape mismatch: expected {expected}, got {got}")
            }
            Self::Reshape(e) => e.fmt(f),
            Self::UnsupportedTarget(d) => write!(f, "no tensor-core lowering for {d:?}"),
            Self::MalformedAst(msg) => write!(f, "malformed ast: {msg}"),
            Self::UnboundVariable(name) => write!(f, "variable `{name}` has no defining uop"),
        }
    }
}

impl error::Error for Error {}

impl From<sym::Error> for Error {
    fn from(e: sym::Error) -> Self {
        Self::InvalidAlgebra(e)
    }
}

impl From<shape::Error> for Error {
    fn from(e: shape::Error) -> Self {
        Self::Reshape(e)
    }
}

/// The lowered kernel handed to downstream codegen.
#[derive(Debug)]
pub struct Program {
    pub name: String,
    pub uops: UOpGraph,
    /// Grid sizes, outermost last; empty without hardware indices
    pub global_size: Vec<i64>,
    pub local_size: Vec<i64>,
}

// The only process-wide state: per-signature kernel counter for unique
// function names.
static KERNEL_CNT: LazyLock<Mutex<HashMap<String, u32>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Axis index variables for one partition run, optionally compressed to
/// `maxdim` hardware dimensions. The compressed run folds the trailing
/// axes into one variable and recovers per-axis coordinates by successive
/// mod/div. Returns `(per_axis_idxs, loop_idxs)`; the latter is what
/// actually becomes a loop or hardware index, size-1 axes dropped.
fn get_grouped_dims(
    prefix: &str,
    start_dim: usize,
    dims: &[i64],
    maxdim: usize,
) -> Result<(Vec<SymNode>, Vec<SymNode>), Error> {
    let compressed = maxdim != 0 && dims.len() > maxdim;
    let sizes: Vec<i64> = if compressed {
        let mut s = dims[..maxdim - 1].to_vec();
        s.push(dims[maxdim - 1..].iter().product());
        s
    } else {
        dims.to_vec()
    };
    let loop_idxs: Vec<SymNode> = sizes
        .iter()
        .enumerate()
        .map(|(i, &s)| SymNode::var(format!("{prefix}{}", start_dim + i), 0, s - 1))
        .collect::<Result<_, _>>()?;
    let mut idxs = loop_idxs.clone();
    if compressed {
        let mut dd = loop_idxs[maxdim - 1].clone();
        let mut tail = Vec::new();
        for &s in dims[maxdim - 1..].iter().rev() {
            tail.push(dd.modulo(s)?);
            dd = dd.div(s)?;
        }
        tail.reverse();
        idxs = loop_idxs[..maxdim - 1].to_vec();
        idxs.extend(tail);
    }
    let loop_idxs = loop_idxs.into_iter().filter(|x| !x.is_num()).collect();
    Ok((idxs, loop_idxs))
}

/// Cartesian product of per-coordinate expansions, first coordinate
/// varying fastest.
fn expand_product(lists: &[Vec<SymNode>]) -> Vec<Vec<SymNode>> {
    let mut out = vec![Vec::new()];
    for lst in lists {
        let mut next = Vec::with_capacity(out.len() * lst.len());
        for item in lst {
            for prefix in &out {
                let mut t = prefix.clone();
                t.push(item.clone());
                next.push(t);
            }
        }
        out = next;
    }
    out
}

/// Walks the tensor AST and appends uops for one kernel: buffer defines,
/// loop nest, loads, the reduce body, the late elementwise tail and the
/// final store, then sweeps dead code.
pub struct Linearizer {
    kernel: Kernel,
    uops: UOpGraph,
    buf_uops: Vec<Option<UOpId>>,
    loop_uops: HashMap<String, UOpId>,
    load_cache: HashMap<String, UOpId>,
}

impl SymRender for Linearizer {
    type Error = Error;

    fn var_uop(&mut self, name: &str) -> Result<UOpId, Error> {
        self.loop_uops
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnboundVariable(name.to_string()))
    }

    fn const_uop(&mut self, value: i64, dtype: DType) -> UOpId {
        self.uops.const_val(Val::Int(value), dtype)
    }

    fn alu_uop(&mut self, op: AluOp, dtype: DType, a: UOpId, b: UOpId) -> UOpId {
        self.uops
            .emit(UOpKind::Alu, Some(dtype), vec![a, b], Arg::Alu(op), true)
    }
}

impl Linearizer {
    #[must_use]
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            uops: UOpGraph::new(),
            buf_uops: Vec::new(),
            loop_uops: HashMap::new(),
            load_cache: HashMap::new(),
        }
    }

    fn const_int(&mut self, v: i64) -> UOpId {
        self.uops.const_val(Val::Int(v), DType::INT32)
    }

    fn render_sym(&mut self, n: &SymNode) -> Result<UOpId, Error> {
        n.render(self)
    }

    fn barrier(&mut self) -> UOpId {
        self.uops
            .emit(UOpKind::Barrier, None, vec![], Arg::None, false)
    }

    fn render_loop(&mut self, idxs: &[SymNode]) {
        for x in idxs {
            if let Some(name) = x.var_name() {
                let name = name.to_string();
                let lo = self.const_int(x.min());
                let hi = self.const_int(x.max() + 1);
                let u = self
                    .uops
                    .emit(UOpKind::Loop, Some(DType::INT32), vec![lo, hi], Arg::None, false);
                self.loop_uops.insert(name, u);
            }
        }
    }

    fn end_loop(&mut self, idxs: &[SymNode]) {
        for x in idxs.iter().rev() {
            let Some(name) = x.var_name() else { continue };
            let Some(&loop_uop) = self.loop_uops.get(name) else {
                continue;
            };
            if self.uops.get(loop_uop).op == UOpKind::Loop {
                self.uops
                    .emit(UOpKind::End, None, vec![loop_uop], Arg::None, false);
            }
        }
    }

    /// Load buffer `i` at every enumerated upcast position of `idxs`.
    /// With `acc` set, emits fresh accumulators initialized to it instead
    /// of loads. Returns one uop per position; a vector load comes back as
    /// per-lane `GEP`s.
    fn global_load(
        &mut self,
        i: usize,
        idxs: &[SymNode],
        acc: Option<Val>,
    ) -> Result<Vec<UOpId>, Error> {
        let rank = self.kernel.sts[i].shape().len();
        if idxs.len() != rank {
            return Err(Error::ShapeMismatch {
                expected: rank,
                got: idxs.len(),
            });
        }
        let buf = self.kernel.bufs[i].clone();
        let const_v: Option<Val> = match &buf {
            Buffer::Const { val, .. } => Some(*val),
            _ => acc,
        };

        // pick the vector width from a single upcast axis of 2 or 4
        let upcast_dim = self.kernel.get_upcast_dim(i);
        let mut dim: Option<usize> = None;
        let mut amt: usize = 1;
        let mut float4_expand: Vec<SymNode> = Vec::new();
        if upcast_dim.len() == 1 {
            let exp = idxs[upcast_dim[0]].expand_self();
            if matches!(exp.len(), 2 | 4) {
                dim = Some(upcast_dim[0]);
                amt = exp.len();
                float4_expand = exp;
            }
        }

        // rename every upcast placeholder to a per-coordinate variable
        let mut expand_vars = Vec::with_capacity(idxs.len());
        let mut fake_idxs = Vec::with_capacity(idxs.len());
        for (j, idx) in idxs.iter().enumerate() {
            match idx.expand_idx() {
                Some(anon) => {
                    let nv = SymNode::var(format!("_uidx{j}"), anon.min(), anon.max())?;
                    let map = HashMap::from([(anon, nv.clone())]);
                    fake_idxs.push(idx.substitute(&map));
                    expand_vars.push(nv);
                }
                None => {
                    fake_idxs.push(idx.clone());
                    expand_vars.push(SymNode::num(0));
                }
            }
        }

        let (g_idx, g_valid) = {
            let st = &self.kernel.sts[i];
            if let Some(d) = dim {
                let mut coords = fake_idxs.clone();
                coords[d] = float4_expand[0].clone();
                let (gi, gv) = st.expr_idxs(&coords);
                // vector loads must start on a lane boundary
                if gi.div(amt as i64)?.mul(amt as i64) != gi {
                    dim = None;
                    amt = 1;
                    st.expr_idxs(&fake_idxs)
                } else {
                    (gi, gv)
                }
            } else {
                st.expr_idxs(&fake_idxs)
            }
        };

        let base = buf.dtype().base();
        let localtype = if amt == 1 {
            base
        } else {
            DType::vec(base.kind, amt as u8)
        };
        let invalid_value = if base.is_int() {
            Val::Int(0)
        } else {
            Val::Float(0.0)
        };

        let e_idxs = g_idx.expand(&expand_vars);
        let e_valids = g_valid.expand(&expand_vars);
        let rep_idxs = SymNode::iter_idxs(&expand_vars);

        let mut ret = Vec::with_capacity(e_idxs.len());
        for ((idx, valid), rep) in e_idxs.iter().zip(&e_valids).zip(&rep_idxs) {
            let (this_const, idx, valid) = if valid.max() == 0 {
                (Some(invalid_value), SymNode::num(0), SymNode::num(1))
            } else {
                (const_v, idx.clone(), valid.clone())
            };
            let ident = if let (Some(c), None) = (this_const, acc) {
                c.to_string()
            } else {
                match &buf {
                    Buffer::Mem { idx, .. } => idx.to_string(),
                    Buffer::Local { name, .. } => name.clone(),
                    Buffer::Const { val, .. } => val.to_string(),
                }
            };
            let key = format!("{acc:?}|{localtype}|{ident}|{idx}|{valid}");
            if !self.load_cache.contains_key(&key) {
                let u = if acc.is_some() {
                    debug_assert_eq!(valid.min(), 1, "accumulators are never masked");
                    let init = this_const.unwrap_or(invalid_value);
                    self.uops
                        .emit(UOpKind::DefineAcc, Some(localtype), vec![], Arg::Acc(init), false)
                } else if let Some(c) = this_const {
                    let mut u = self.uops.const_val(c, localtype);
                    if valid.min() == 0 && valid.max() == 1 {
                        let valid_r = self.render_sym(&valid)?;
                        let inv = self.uops.const_val(invalid_value, localtype);
                        u = self.uops.emit(
                            UOpKind::Alu,
                            Some(localtype),
                            vec![valid_r, u, inv],
                            Arg::Alu(AluOp::Where),
                            true,
                        );
                    }
                    u
                } else {
                    let buf_uop = self.buf_uops[i]
                        .ok_or(Error::MalformedAst("buffer was never defined"))?;
                    let rendered_idx = self.render_sym(&idx)?;
                    if valid.min() == 0 {
                        let valid_r = self.render_sym(&valid)?;
                        let inv = self.uops.const_val(invalid_value, localtype);
                        self.uops.emit(
                            UOpKind::Load,
                            Some(localtype),
                            vec![buf_uop, rendered_idx, valid_r, inv],
                            Arg::None,
                            true,
                        )
                    } else {
                        self.uops.emit(
                            UOpKind::Load,
                            Some(localtype),
                            vec![buf_uop, rendered_idx],
                            Arg::None,
                            true,
                        )
                    }
                };
                self.load_cache.insert(key.clone(), u);
            }
            let cached = self.load_cache[&key];
            match dim {
                Some(d) => {
                    let lane = rep[d] as u8;
                    ret.push(self.uops.emit(
                        UOpKind::Gep,
                        Some(localtype.base()),
                        vec![cached],
                        Arg::Lane(lane),
                        true,
                    ));
                }
                None => ret.push(cached),
            }
        }
        Ok(ret)
    }

    /// Store one value per enumerated upcast position of `idxs` into
    /// buffer `i`, grouping aligned always-valid lanes into one vector
    /// store.
    fn global_store(
        &mut self,
        i: usize,
        idxs: &[SymNode],
        store: Vec<UOpId>,
    ) -> Result<(), Error> {
        let buf_uop = self.buf_uops[i].ok_or(Error::MalformedAst("buffer was never defined"))?;
        let expanded_nodes: Vec<Vec<SymNode>> = idxs.iter().map(|x| x.expand_self()).collect();
        let tuples = expand_product(&expanded_nodes);
        debug_assert_eq!(tuples.len(), store.len(), "store arity");
        let mut store_offset: Vec<(Vec<SymNode>, UOpId)> =
            tuples.into_iter().zip(store).collect();

        let upcast_dim = self.kernel.get_upcast_dim(i);
        if upcast_dim.len() == 1 && matches!(expanded_nodes[upcast_dim[0]].len(), 2 | 4) {
            let d = upcast_dim[0];
            let mut grouped: Vec<(Vec<SymNode>, Vec<UOpId>)> = Vec::new();
            for (k, v) in &store_offset {
                let mut key = k.clone();
                key[d] = expanded_nodes[d][0].clone();
                match grouped.iter_mut().find(|(gk, _)| *gk == key) {
                    Some((_, vs)) => vs.push(*v),
                    None => grouped.push((key, vec![*v])),
                }
            }
            // group only when every vector is aligned and always valid
            let mut new_offset = Vec::with_capacity(grouped.len());
            let mut vectorizable = true;
            for (k, out_tokens) in &grouped {
                let amt = out_tokens.len() as i64;
                let (idx, valid) = self.kernel.sts[i].expr_idxs(k);
                if valid.min() != 1 || idx.div(amt)?.mul(amt) != idx {
                    vectorizable = false;
                    break;
                }
                let dt = if amt == 4 { DType::FLOAT4 } else { DType::FLOAT2 };
                let vec_uop =
                    self.uops
                        .emit(UOpKind::Cast, Some(dt), out_tokens.clone(), Arg::None, true);
                new_offset.push((k.clone(), vec_uop));
            }
            if vectorizable {
                store_offset = new_offset;
            }
        }

        for (k, var) in store_offset {
            let (idx, _valid) = self.kernel.sts[i].expr_idxs(&k);
            let rendered_idx = self.render_sym(&idx)?;
            self.uops.emit(
                UOpKind::Store,
                None,
                vec![buf_uop, rendered_idx, var],
                Arg::None,
                true,
            );
        }
        Ok(())
    }

    /// Fold a value (or a fused multiply pair) into the accumulators:
    /// `STORE(acc, ALU(values.., acc))` per upcast position.
    fn emit_reduce(&mut self, values: Vec<Vec<UOpId>>, op: AluOp, acc: &[UOpId]) -> Vec<UOpId> {
        let n = values[0].len();
        debug_assert!(values.iter().all(|v| v.len() == n));
        debug_assert_eq!(acc.len(), n, "accumulator arity");
        let mut out = Vec::with_capacity(n);
        for e in 0..n {
            let mut operands: Vec<UOpId> = values.iter().map(|v| v[e]).collect();
            operands.push(acc[e]);
            let alu = self.uops.emit(
                UOpKind::Alu,
                Some(DType::FLOAT32),
                operands,
                Arg::Alu(op),
                false,
            );
            out.push(self.uops.emit(
                UOpKind::Store,
                Some(DType::FLOAT32),
                vec![acc[e], alu],
                Arg::None,
                true,
            ));
        }
        out
    }

    /// Lower a subtree to one uop per upcast position. Reduce nodes fold
    /// into `acc` when `do_reduce` is set and echo it otherwise.
    fn ast_parse(
        &mut self,
        x: &LazyOp,
        acc: &[UOpId],
        loaded: &HashMap<usize, Vec<UOpId>>,
        do_reduce: bool,
    ) -> Result<Vec<UOpId>, Error> {
        match x {
            LazyOp::Load(slot) => loaded
                .get(slot)
                .cloned()
                .ok_or(Error::MalformedAst("load from an unstaged buffer")),
            LazyOp::Store(..) => Err(Error::MalformedAst("store below the ast root")),
            // casts are not ALU ops
            LazyOp::Unary(UnaryOp::Noop | UnaryOp::Cast, src) => {
                self.ast_parse(src, acc, loaded, false)
            }
            LazyOp::Reduce(..) if !do_reduce => Ok(acc.to_vec()),
            LazyOp::Reduce(op, src) => {
                // SUM(MUL(a, b)) and SUM(CAST(MUL(a, b))) fuse into MULACC
                let fused = if *op == ReduceOp::Sum {
                    match src.as_ref() {
                        LazyOp::Binary(BinaryOp::Mul, a, b) => Some((a, b)),
                        LazyOp::Unary(UnaryOp::Cast, inner) => match inner.as_ref() {
                            LazyOp::Binary(BinaryOp::Mul, a, b) => Some((a, b)),
                            _ => None,
                        },
                        _ => None,
                    }
                } else {
                    None
                };
                if let Some((a, b)) = fused {
                    let va = self.ast_parse(a, acc, loaded, false)?;
                    let vb = self.ast_parse(b, acc, loaded, false)?;
                    return Ok(self.emit_reduce(vec![va, vb], AluOp::MulAcc, acc));
                }
                let v = self.ast_parse(src, acc, loaded, false)?;
                Ok(self.emit_reduce(vec![v], op.alu(), acc))
            }
            LazyOp::Unary(op, src) => {
                let v = self.ast_parse(src, acc, loaded, false)?;
                let alu = op.alu();
                Ok(v
                    .into_iter()
                    .map(|u| {
                        self.uops.emit(
                            UOpKind::Alu,
                            Some(DType::FLOAT32),
                            vec![u],
                            Arg::Alu(alu),
                            true,
                        )
                    })
                    .collect())
            }
            LazyOp::Binary(op, a, b) => {
                let va = self.ast_parse(a, acc, loaded, false)?;
                let vb = self.ast_parse(b, acc, loaded, false)?;
                debug_assert_eq!(va.len(), vb.len());
                let alu = op.alu();
                Ok(va
                    .into_iter()
                    .zip(vb)
                    .map(|(x, y)| {
                        self.uops.emit(
                            UOpKind::Alu,
                            Some(DType::FLOAT32),
                            vec![x, y],
                            Arg::Alu(alu),
                            true,
                        )
                    })
                    .collect())
            }
            LazyOp::Ternary(op, a, b, c) => {
                let va = self.ast_parse(a, acc, loaded, false)?;
                let vb = self.ast_parse(b, acc, loaded, false)?;
                let vc = self.ast_parse(c, acc, loaded, false)?;
                debug_assert!(va.len() == vb.len() && vb.len() == vc.len());
                let alu = op.alu();
                let mut out = Vec::with_capacity(va.len());
                for ((x, y), z) in va.into_iter().zip(vb).zip(vc) {
                    out.push(self.uops.emit(
                        UOpKind::Alu,
                        Some(DType::FLOAT32),
                        vec![x, y, z],
                        Arg::Alu(alu),
                        true,
                    ));
                }
                Ok(out)
            }
        }
    }

    /// Run the lowering and hand the finished graph to the caller. The
    /// phase order here is a hard contract; it determines emission order.
    pub fn linearize(mut self) -> Result<Program, Error> {
        let gd = self.kernel.global_dims;
        let ld = self.kernel.local_dims;
        let shape_len = self.kernel.shape_len();
        let upcasted = self.kernel.upcasted;
        let first_reduce = self.kernel.first_reduce();
        let gfr_len = self.kernel.group_for_reduce.len();
        let full_shape = self.kernel.full_shape().to_vec();
        let output_shape = self.kernel.output_shape().to_vec();
        let has_local = self.kernel.has_local();
        let dont_use_locals = self.kernel.dont_use_locals();
        let use_tensor_cores = self.kernel.use_tensor_cores();
        let device = self.kernel.device;
        let earlybufs = self.kernel.earlybufs().to_vec();
        let local_alias = self.kernel.local_alias.clone();
        let ast = self.kernel.ast.clone();
        let reduce = ast.reduce_node().cloned();

        let tc_target = if use_tensor_cores {
            Some(
                device
                    .wmma_target()
                    .ok_or(Error::UnsupportedTarget(device))?,
            )
        } else {
            None
        };

        if log::log_enabled!(log::Level::Debug) {
            for (i, (buf, st)) in self.kernel.bufs.iter().zip(&self.kernel.sts).enumerate() {
                log::debug!("{i:3} {buf:?} {st:?}");
            }
        }

        // buffer prelude: globals, symbolic vars, local aliases
        self.buf_uops = vec![None; self.kernel.bufs.len()];
        for i in 0..self.kernel.bufs.len() {
            if let Buffer::Mem { idx, dtype } = self.kernel.bufs[i] {
                let u = self.uops.emit(
                    UOpKind::DefineGlobal,
                    Some(dtype.ptr_to()),
                    vec![],
                    Arg::DefineGlobal {
                        name: format!("data{idx}"),
                        dtype,
                    },
                    true,
                );
                self.buf_uops[i] = Some(u);
            }
        }
        let mut var_vals = self.kernel.var_vals.clone();
        var_vals.sort_by(|a, b| a.var_name().cmp(&b.var_name()));
        for v in var_vals {
            let Some(name) = v.var_name() else { continue };
            let name = name.to_string();
            let u = self.uops.emit(
                UOpKind::DefineGlobal,
                Some(DType::INT32),
                vec![],
                Arg::DefineGlobal {
                    name: name.clone(),
                    dtype: DType::INT32,
                },
                true,
            );
            self.loop_uops.insert(name, u);
        }
        for (&_i, &slot) in &local_alias {
            let Buffer::Local { name, size } = self.kernel.bufs[slot].clone() else {
                return Err(Error::MalformedAst("local alias is not a local buffer"));
            };
            let u = self.uops.emit(
                UOpKind::DefineLocal,
                Some(DType::FLOAT32.ptr_to()),
                vec![],
                Arg::DefineLocal {
                    name,
                    count: size as u32,
                },
                true,
            );
            self.buf_uops[slot] = Some(u);
        }
        // scratch local for the two-stage reduce
        let mut temp_slot: Option<usize> = None;
        if gfr_len > 0 {
            let mut tshape = vec![1i64; gd];
            tshape.extend_from_slice(&full_shape[gd..gd + ld + gfr_len]);
            tshape.extend(vec![1i64; shape_len - upcasted - gfr_len - first_reduce]);
            tshape.extend(self.kernel.upcasted_axis(0).iter().map(|&(s, _, _)| s));
            let st = ShapeTracker::from_shape(&tshape);
            let size = st.size();
            self.kernel.sts.push(st);
            self.kernel.bufs.push(Buffer::Local {
                name: "temp".to_string(),
                size,
            });
            let u = self.uops.emit(
                UOpKind::DefineLocal,
                Some(DType::FLOAT32.ptr_to()),
                vec![],
                Arg::DefineLocal {
                    name: "temp".to_string(),
                    count: size as u32,
                },
                true,
            );
            self.buf_uops.push(Some(u));
            temp_slot = Some(self.kernel.bufs.len() - 1);
        }

        // unique function name per shape signature
        let base_name = format!(
            "{}{}",
            if reduce.is_some() { "r_" } else { "E_" },
            full_shape
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join("_")
        );
        let name = {
            let mut counts = KERNEL_CNT.lock().unwrap();
            let cnt = counts.entry(base_name.clone()).or_insert(0);
            *cnt += 1;
            if *cnt > 1 {
                format!("{base_name}n{}", *cnt - 1)
            } else {
                base_name
            }
        };

        // axis index variables
        let maxdim = if has_local { 3 } else { 0 };
        let (global_idxs, loop_global_idxs) =
            get_grouped_dims("gidx", 0, &full_shape[..gd], maxdim)?;
        let (mut local_idxs, loop_local_idxs) = get_grouped_dims(
            "lidx",
            gd,
            &full_shape[gd..first_reduce + gfr_len],
            maxdim,
        )?;
        let full_upcast_idxs: Vec<SymNode> = full_shape[shape_len - upcasted..]
            .iter()
            .map(|&s| SymNode::var_anon(0, s - 1))
            .collect::<Result<_, _>>()?;
        let mut upcast_idxs: Vec<SymNode> = output_shape[shape_len - upcasted..]
            .iter()
            .map(|&s| SymNode::var_anon(0, s - 1))
            .collect::<Result<_, _>>()?;

        // outer loops: hardware indices where the target has them
        let mut global_size: Vec<i64> = Vec::new();
        let mut local_size: Vec<i64> = Vec::new();
        if dont_use_locals {
            global_size = loop_global_idxs.iter().rev().map(|x| x.max() + 1).collect();
            for (i, x) in loop_global_idxs.iter().enumerate() {
                let Some(expr) = x.var_name() else { continue };
                let u = self.uops.emit(
                    UOpKind::Special,
                    Some(DType::INT32),
                    vec![],
                    Arg::Special {
                        dim: (loop_global_idxs.len() - 1 - i) as u8,
                        name: expr.replace("gidx", "idx"),
                        size: (x.max() + 1) as u32,
                    },
                    true,
                );
                self.loop_uops.insert(expr.to_string(), u);
            }
        } else if has_local {
            global_size = loop_global_idxs.iter().rev().map(|x| x.max() + 1).collect();
            local_size = loop_local_idxs.iter().rev().map(|x| x.max() + 1).collect();
            global_size.resize(3, 1);
            local_size.resize(3, 1);
            for idxs in [&loop_global_idxs, &loop_local_idxs] {
                for (i, x) in idxs.iter().enumerate() {
                    let Some(expr) = x.var_name() else { continue };
                    let u = self.uops.emit(
                        UOpKind::Special,
                        Some(DType::INT32),
                        vec![],
                        Arg::Special {
                            dim: (idxs.len() - 1 - i) as u8,
                            name: expr.to_string(),
                            size: (x.max() + 1) as u32,
                        },
                        true,
                    );
                    self.loop_uops.insert(expr.to_string(), u);
                }
            }
        } else {
            let outer: Vec<SymNode> = loop_global_idxs
                .iter()
                .chain(&loop_local_idxs)
                .cloned()
                .collect();
            self.render_loop(&outer);
        }

        let mut loaded: HashMap<usize, Vec<UOpId>> = HashMap::new();
        let mut acc: Vec<UOpId> = Vec::new();
        let mut if_gate: Option<UOpId> = None;
        let mut fake_reduce_idxs: Vec<SymNode> = Vec::new();

        if let Some(reduce_node) = &reduce {
            let LazyOp::Reduce(reduce_op, _) = reduce_node else {
                return Err(Error::MalformedAst("reduce node is not a reduce"));
            };
            let reduce_op = *reduce_op;

            let reduce_idxs: Vec<SymNode> = (first_reduce + gfr_len..shape_len - upcasted)
                .map(|i| SymNode::var(format!("ridx{i}"), 0, full_shape[i] - 1))
                .collect::<Result<_, _>>()?;
            fake_reduce_idxs = reduce_idxs.iter().map(|x| x.mul(0)).collect();

            // accumulators, one per upcast position of the output
            let acc_coords: Vec<SymNode> = global_idxs
                .iter()
                .chain(&local_idxs)
                .chain(&fake_reduce_idxs)
                .chain(&upcast_idxs)
                .cloned()
                .collect();
            acc = self.global_load(0, &acc_coords, Some(reduce_op.identity()))?;

            self.render_loop(&reduce_idxs);

            if tc_target.is_some() {
                self.barrier();
            }

            // stage aliased inputs through shared memory
            let mut locals_to_store: Vec<(usize, Vec<SymNode>, Vec<UOpId>)> = Vec::new();
            for (&src, &lb_slot) in &local_alias {
                let strides = self.kernel.sts[src].real_strides().to_vec();
                let excl = self.kernel.exclude_local_upcast;
                let mut extra_locals: Vec<SymNode> = local_idxs[excl..]
                    .iter()
                    .zip(&strides[global_idxs.len() + excl..first_reduce])
                    .filter(|&(_, &st)| st == 0)
                    .map(|(l, _)| l.clone())
                    .collect();
                let mut ordering: Vec<(usize, SymNode)> =
                    full_upcast_idxs.iter().cloned().enumerate().collect();
                if self.kernel.reverse_upcast_dir {
                    ordering.reverse();
                }
                let mut this_upcast_idxs: Vec<SymNode> = Vec::new();
                for (j, v) in ordering {
                    let stride_j =
                        strides[global_idxs.len() + local_idxs.len() + reduce_idxs.len() + j];
                    if stride_j == 0 {
                        log::debug!("upcasting@{j} stride 0");
                        this_upcast_idxs.push(SymNode::num(0));
                    } else if let Some(pos) = extra_locals
                        .iter()
                        .position(|el| el.min() == v.min() && el.max() == v.max())
                    {
                        let el = extra_locals.remove(pos);
                        log::debug!("upcasting@{j} matched stride {el}");
                        this_upcast_idxs.push(el);
                    } else if extra_locals
                        .iter()
                        .any(|el| el.min() == v.min() && (v.max() + 1) % (el.max() + 1) == 0)
                    {
                        // stitch several smaller local spans together
                        let mut tacc = SymNode::num(0);
                        let mut rem = v.max() + 1;
                        while let Some(pos) = extra_locals
                            .iter()
                            .position(|el| el.min() == v.min() && rem % (el.max() + 1) == 0)
                        {
                            let el = extra_locals.remove(pos);
                            rem /= el.max() + 1;
                            log::debug!("upcasting@{j} partial stride {el} rem {rem}");
                            tacc = tacc.add(&el.mul(rem));
                        }
                        this_upcast_idxs.push(tacc.add(&SymNode::var_anon(0, rem - 1)?));
                    } else {
                        log::debug!("failed upcasting@{j}");
                        this_upcast_idxs.push(v.clone());
                    }
                }
                if self.kernel.reverse_upcast_dir {
                    this_upcast_idxs.reverse();
                }
                let mut stage_idxs: Vec<SymNode> = global_idxs
                    .iter()
                    .chain(&local_idxs)
                    .chain(&reduce_idxs)
                    .chain(&this_upcast_idxs)
                    .cloned()
                    .collect();
                for (idx, &st) in stage_idxs.iter_mut().zip(&strides) {
                    if st == 0 {
                        *idx = SymNode::num(0);
                    }
                }
                let ll = self.global_load(src, &stage_idxs, None)?;
                locals_to_store.push((lb_slot, stage_idxs, ll));
            }

            if let Some(target) = tc_target {
                if locals_to_store.len() < 2 {
                    return Err(Error::MalformedAst(
                        "tensor cores need two locally aliased inputs",
                    ));
                }
                let l0 = locals_to_store[0].2.clone();
                let l1 = locals_to_store[1].2.clone();
                match target {
                    crate::uop::WmmaTarget::Metal => {
                        if 2 * acc.len() == l0.len() * l1.len() {
                            let mut i = 0;
                            for yp in l1.chunks_exact(2) {
                                for xp in l0.chunks_exact(2) {
                                    if i + 1 >= acc.len() {
                                        break;
                                    }
                                    self.uops.emit(
                                        UOpKind::Wmma,
                                        None,
                                        vec![xp[0], xp[1], yp[0], yp[1], acc[i], acc[i + 1]],
                                        Arg::Wmma(target),
                                        true,
                                    );
                                    i += 2;
                                }
                            }
                        } else {
                            let half = l1.len() / 2;
                            let mut i = 0;
                            while i + 1 < acc.len() {
                                for t in 0..half {
                                    let (Some(&y0), Some(&y1), Some(&x0), Some(&x1)) = (
                                        l1.get(t),
                                        l1.get(half + t),
                                        l0.get(half * i + t),
                                        l0.get(half * i + half + t),
                                    ) else {
                                        break;
                                    };
                                    self.uops.emit(
                                        UOpKind::Wmma,
                                        None,
                                        vec![x0, x1, y0, y1, acc[i], acc[i + 1]],
                                        Arg::Wmma(target),
                                        true,
                                    );
                                }
                                i += 2;
                            }
                        }
                    }
                    crate::uop::WmmaTarget::Hip => {
                        let mut i = 0;
                        let mut y = 0;
                        while y < l1.len() {
                            let mut x = 0;
                            while x < l0.len() {
                                let mut operands: Vec<UOpId> =
                                    l0[x..(x + 16).min(l0.len())].to_vec();
                                operands.extend_from_slice(&l1[y..(y + 16).min(l1.len())]);
                                operands.extend_from_slice(&acc[i..(i + 8).min(acc.len())]);
                                self.uops.emit(
                                    UOpKind::Wmma,
                                    None,
                                    operands,
                                    Arg::Wmma(target),
                                    true,
                                );
                                i += 8;
                                x += 16;
                            }
                            y += 16;
                        }
                    }
                }
            } else {
                if !locals_to_store.is_empty() {
                    self.barrier();
                    for (slot, stage_idxs, ll) in locals_to_store {
                        self.global_store(slot, &stage_idxs, ll)?;
                    }
                    self.barrier();
                }

                // inputs feeding the reduce, read at the full coordinate
                let early_coords: Vec<SymNode> = global_idxs
                    .iter()
                    .chain(&local_idxs)
                    .chain(&reduce_idxs)
                    .chain(&full_upcast_idxs)
                    .cloned()
                    .collect();
                for i in 1..self.kernel.bufs.len() {
                    if earlybufs.contains(&i) {
                        let src = local_alias.get(&i).copied().unwrap_or(i);
                        let ll = self.global_load(src, &early_coords, None)?;
                        loaded.insert(i, ll);
                    }
                }

                let offs = self.kernel.acc_offsets(self.kernel.full_buf_index());
                let sel: Vec<UOpId> = offs.iter().map(|&o| acc[o]).collect();
                self.ast_parse(reduce_node, &sel, &loaded, true)?;
            }

            self.end_loop(&reduce_idxs);
            self.load_cache.clear();

            // second stage: finish the grouped reduce through shared memory
            if gfr_len > 0 {
                let temp = temp_slot.ok_or(Error::MalformedAst("missing temp buffer"))?;
                let fake_global_idxs: Vec<SymNode> =
                    global_idxs.iter().map(|x| x.mul(0)).collect();
                let stage1_coords: Vec<SymNode> = fake_global_idxs
                    .iter()
                    .chain(&local_idxs)
                    .chain(&fake_reduce_idxs)
                    .chain(&upcast_idxs)
                    .cloned()
                    .collect();
                self.global_store(temp, &stage1_coords, acc.clone())?;
                self.barrier();
                // TODO: this is ending too much, should only end what's in the if
                self.end_loop(&loop_local_idxs);
                if has_local {
                    let mut fake_idxs = vec![SymNode::num(0); shape_len];
                    for (k, idx) in local_idxs[ld..].iter().enumerate() {
                        fake_idxs[gd + ld + k] = idx.clone();
                    }
                    let (iexpr, _) = self.kernel.sts[temp].expr_idxs(&fake_idxs);
                    let cond = iexpr.lt(1);
                    let cond_u = self.render_sym(&cond)?;
                    if_gate =
                        Some(
                            self.uops
                                .emit(UOpKind::If, None, vec![cond_u], Arg::None, false),
                        );
                }

                // fresh serial loops over the group axes
                let mut end_local_idxs: Vec<SymNode> = (0..first_reduce + gfr_len)
                    .map(|i| {
                        let hi = if i >= first_reduce
                            && !self.kernel.upcast_in_mid_reduce_axes().contains(&i)
                        {
                            full_shape[i] - 1
                        } else {
                            0
                        };
                        SymNode::var(format!("tidx{i}"), 0, hi)
                    })
                    .collect::<Result<_, _>>()?;
                local_idxs = local_idxs[..ld]
                    .iter()
                    .chain(&end_local_idxs[gd + ld..])
                    .cloned()
                    .collect();

                // group axes the output keeps become upcasts here
                for j in self.kernel.upcast_in_mid_reduce_axes() {
                    let order: Vec<usize> = (0..shape_len).filter(|&k| k != j).chain([j]).collect();
                    self.kernel.reshape_and_permute(None, Some(&order))?;
                    self.kernel.upcast()?;
                    self.kernel.group_for_reduce.pop();
                    local_idxs.pop();
                    end_local_idxs.pop();
                    upcast_idxs = self.kernel.output_shape()
                        [shape_len - self.kernel.upcasted..]
                        .iter()
                        .map(|&s| SymNode::var_anon(0, s - 1))
                        .collect::<Result<_, _>>()?;
                }

                // same structure as the first-stage reduce
                let stage2_coords: Vec<SymNode> = fake_global_idxs
                    .iter()
                    .chain(&local_idxs)
                    .chain(&fake_reduce_idxs)
                    .chain(&upcast_idxs)
                    .cloned()
                    .collect();
                acc = self.global_load(temp, &stage2_coords, Some(reduce_op.identity()))?;
                self.render_loop(&end_local_idxs);
                let ll = self.global_load(temp, &stage2_coords, None)?;
                loaded.insert(temp, ll);

                let late_reduce = LazyOp::reduce(reduce_op, LazyOp::load(temp));
                let offs = self.kernel.acc_offsets(temp);
                let sel: Vec<UOpId> = offs.iter().map(|&o| acc[o]).collect();
                self.ast_parse(&late_reduce, &sel, &loaded, true)?;

                self.end_loop(&end_local_idxs);
                self.load_cache.clear();
            }
        }

        // everything after the reduce reads at the output coordinate
        let out_coords: Vec<SymNode> = global_idxs
            .iter()
            .chain(&local_idxs)
            .chain(&fake_reduce_idxs)
            .chain(&upcast_idxs)
            .cloned()
            .collect();
        for i in 0..self.kernel.bufs.len() {
            if i != 0 && !earlybufs.contains(&i) && !self.kernel.bufs[i].is_local() {
                let ll = self.global_load(i, &out_coords, None)?;
                loaded.insert(i, ll);
            }
        }

        let LazyOp::Store(_, store_value) = &ast else {
            return Err(Error::MalformedAst("ast root must be a store"));
        };
        let val = self.ast_parse(store_value, &acc, &loaded, false)?;
        self.global_store(0, &out_coords, val)?;

        // close the thread-0 gate and the outer loops
        if let Some(gate) = if_gate {
            self.uops
                .emit(UOpKind::End, None, vec![gate], Arg::None, false);
        }
        let to_end: Vec<SymNode> = if self.kernel.group_for_reduce.is_empty() {
            loop_global_idxs.iter().chain(&loop_local_idxs).cloned().collect()
        } else {
            loop_global_idxs.clone()
        };
        self.end_loop(&to_end);

        self.uops.eliminate_dead();
        Ok(Program {
            name,
            uops: self.uops,
            global_size,
            local_size,
        })
    }
}

/// Lower a kernel in one call.
pub fn lower(kernel: Kernel) -> Result<Program, Error> {
    Linearizer::new(kernel).linearize()
}
