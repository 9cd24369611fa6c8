use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::linearize::Error;
use crate::ops::LazyOp;
use crate::shape::{self, strides_for_shape, ShapeTracker};
use crate::sym::SymNode;
use crate::uop::{DType, Val, WmmaTarget};

bitflags! {
    /// Capabilities of the lowering target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TargetFlags: u8 {
        /// Hardware-provided global/local thread indices (`SPECIAL` uops)
        const HAS_LOCAL = 1;
        /// Keep hardware indices but never touch shared memory
        const DONT_USE_LOCALS = 1 << 1;
        /// Lower eligible reduces through `WMMA`
        const TENSOR_CORES = 1 << 2;
    }
}

/// Lowering target device tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    Metal,
    Hip,
}

impl Device {
    /// The matching `WMMA` target, for devices that have one.
    #[must_use]
    pub fn wmma_target(self) -> Option<WmmaTarget> {
        match self {
            Self::Metal => Some(WmmaTarget::Metal),
            Self::Hip => Some(WmmaTarget::Hip),
            Self::Cpu | Self::Cuda => None,
        }
    }
}

/// One slot of the kernel's buffer list.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    /// External memory buffer with a stable index
    Mem { idx: usize, dtype: DType },
    /// Scalar folded into loads
    Const { val: Val, dtype: DType },
    /// Shared-memory staging region
    Local { name: String, size: i64 },
}

impl Buffer {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Mem { dtype, .. } | Self::Const { dtype, .. } => *dtype,
            Self::Local { .. } => DType::FLOAT32,
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

/// Caller-decided pieces of a [`Kernel`]: the axis partition, target
/// capabilities and any free symbolic variables.
#[derive(Debug, Clone, Default)]
pub struct KernelOpts {
    pub global_dims: usize,
    pub local_dims: usize,
    /// Sizes of the reduce axes parallelized across a workgroup
    pub group_for_reduce: Vec<i64>,
    /// Trailing axes that are fully unrolled
    pub upcasted: usize,
    pub flags: TargetFlags,
    pub device: Device,
    /// Free symbolic variables referenced by the schedule
    pub var_vals: Vec<SymNode>,
}

/// Everything the linearizer needs to know about the kernel being
/// lowered: buffers with their trackers, the axis partition, and target
/// capabilities. Read-only during lowering except for the mid-reduce
/// upcast step, which reshapes the partition in place.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub ast: LazyOp,
    pub bufs: Vec<Buffer>,
    pub sts: Vec<ShapeTracker>,
    pub global_dims: usize,
    pub local_dims: usize,
    pub group_for_reduce: Vec<i64>,
    pub upcasted: usize,
    pub flags: TargetFlags,
    pub device: Device,
    pub var_vals: Vec<SymNode>,
    /// Buffer slot of the shared-memory copy of an input, by input slot
    pub local_alias: BTreeMap<usize, usize>,
    /// Leading local indices skipped when matching staging indices
    pub exclude_local_upcast: usize,
    pub reverse_upcast_dir: bool,
    full_buf_index: usize,
    earlybufs: Vec<usize>,
}

impl Kernel {
    pub fn new(
        ast: LazyOp,
        bufs: Vec<Buffer>,
        sts: Vec<ShapeTracker>,
        opts: KernelOpts,
    ) -> Result<Self, Error> {
        if bufs.len() != sts.len() {
            return Err(Error::ShapeMismatch {
                expected: bufs.len(),
                got: sts.len(),
            });
        }
        if bufs.is_empty() {
            return Err(Error::MalformedAst("kernel has no buffers"));
        }
        let shape_len = sts[0].shape().len();
        for st in &sts {
            if st.shape().len() != shape_len {
                return Err(Error::ShapeMismatch {
                    expected: shape_len,
                    got: st.shape().len(),
                });
            }
        }
        match &ast {
            LazyOp::Store(0, _) => {}
            LazyOp::Store(..) => {
                return Err(Error::MalformedAst("output store must target buffer 0"));
            }
            _ => return Err(Error::MalformedAst("ast root must be a store")),
        }
        for slot in ast.loaded_slots() {
            if slot >= bufs.len() {
                return Err(Error::MalformedAst("load references an unknown buffer slot"));
            }
        }
        if let Some(LazyOp::Reduce(_, src)) = ast.reduce_node() {
            if src.reduce_node().is_some() {
                return Err(Error::MalformedAst("nested reduce"));
            }
        }
        let mut full_buf_index = 0;
        for (i, st) in sts.iter().enumerate() {
            if st.size() > sts[full_buf_index].size() {
                full_buf_index = i;
            }
        }
        let full_shape = sts[full_buf_index].shape().to_vec();

        let first_reduce = opts.global_dims + opts.local_dims;
        let tail = first_reduce + opts.group_for_reduce.len() + opts.upcasted;
        if tail > shape_len {
            return Err(Error::ShapeMismatch {
                expected: shape_len,
                got: tail,
            });
        }
        for (k, &size) in opts.group_for_reduce.iter().enumerate() {
            if full_shape[first_reduce + k] != size {
                return Err(Error::ShapeMismatch {
                    expected: full_shape[first_reduce + k] as usize,
                    got: size as usize,
                });
            }
        }
        for &s in &full_shape[shape_len - opts.upcasted..] {
            if !matches!(s, 1 | 2 | 4) {
                return Err(Error::ShapeMismatch {
                    expected: 4,
                    got: s as usize,
                });
            }
        }
        let reduce_axes = shape_len - opts.upcasted - opts.group_for_reduce.len() - first_reduce;
        if ast.reduce_node().is_none() && (reduce_axes != 0 || !opts.group_for_reduce.is_empty()) {
            return Err(Error::MalformedAst("reduce axes without a reduce op"));
        }

        let earlybufs = match ast.reduce_node() {
            Some(node) => node.loaded_slots(),
            None => Vec::new(),
        };
        Ok(Self {
            ast,
            bufs,
            sts,
            global_dims: opts.global_dims,
            local_dims: opts.local_dims,
            group_for_reduce: opts.group_for_reduce,
            upcasted: opts.upcasted,
            flags: opts.flags,
            device: opts.device,
            var_vals: opts.var_vals,
            local_alias: BTreeMap::new(),
            exclude_local_upcast: 0,
            reverse_upcast_dir: false,
            full_buf_index,
            earlybufs,
        })
    }

    #[must_use]
    pub fn shape_len(&self) -> usize {
        self.sts[0].shape().len()
    }

    /// Shape of the largest tracker; reduce axes keep their full size here.
    #[must_use]
    pub fn full_shape(&self) -> &[i64] {
        self.sts[self.full_buf_index].shape()
    }

    #[must_use]
    pub fn output_shape(&self) -> &[i64] {
        self.sts[0].shape()
    }

    /// First axis of the reduce region (group-for-reduce axes included).
    #[must_use]
    pub fn first_reduce(&self) -> usize {
        self.global_dims + self.local_dims
    }

    #[must_use]
    pub fn full_buf_index(&self) -> usize {
        self.full_buf_index
    }

    /// Input slots consumed by the reduce part of the AST.
    #[must_use]
    pub fn earlybufs(&self) -> &[usize] {
        &self.earlybufs
    }

    #[must_use]
    pub fn has_local(&self) -> bool {
        self.flags.contains(TargetFlags::HAS_LOCAL)
    }

    #[must_use]
    pub fn dont_use_locals(&self) -> bool {
        self.flags.contains(TargetFlags::DONT_USE_LOCALS)
    }

    #[must_use]
    pub fn use_tensor_cores(&self) -> bool {
        self.flags.contains(TargetFlags::TENSOR_CORES)
    }

    /// `(size, stride, reduced)` for each upcast axis of buffer `i`;
    /// `reduced` marks axes the output has already collapsed.
    #[must_use]
    pub fn upcasted_axis(&self, i: usize) -> Vec<(i64, i64, bool)> {
        let start = self.shape_len() - self.upcasted;
        let shape = &self.sts[i].shape()[start..];
        let strides = &self.sts[i].real_strides()[start..];
        let out = &self.output_shape()[start..];
        let full = &self.full_shape()[start..];
        shape
            .iter()
            .zip(strides)
            .zip(out.iter().zip(full))
            .map(|((&s, &st), (&o, &f))| (s, st, o != f))
            .collect()
    }

    /// Upcast axes of buffer `i` eligible for vector access: float
    /// buffers only, unit stride, more than one element.
    #[must_use]
    pub fn get_upcast_dim(&self, i: usize) -> Vec<usize> {
        if self.bufs[i].dtype().base() != DType::FLOAT32 {
            return Vec::new();
        }
        let start = self.shape_len() - self.upcasted;
        self.sts[i]
            .unit_stride_axes()
            .into_iter()
            .filter(|&x| x >= start && self.sts[i].shape()[x] > 1)
            .collect()
    }

    /// Accumulator indices for each enumerated upcast position of buffer
    /// `i`. Axes the output has collapsed share an accumulator.
    #[must_use]
    pub fn acc_offsets(&self, i: usize) -> Vec<usize> {
        if self.upcasted == 0 {
            return vec![0];
        }
        let mut rev = self.upcasted_axis(i);
        rev.reverse();
        let acc_shape: Vec<i64> = rev.iter().map(|&(s, _, r)| if r { 1 } else { s }).collect();
        let strides = strides_for_shape(&acc_shape);
        let acc_strides: Vec<i64> = strides
            .iter()
            .zip(&rev)
            .map(|(&st, &(_, _, r))| if r { 0 } else { st })
            .collect();
        let mut offs = vec![0i64];
        for (k, &(s, _, _)) in rev.iter().enumerate() {
            let mut next = Vec::with_capacity(offs.len() * s as usize);
            for &o in &offs {
                for y in 0..s {
                    next.push(o + y * acc_strides[k]);
                }
            }
            offs = next;
        }
        offs.into_iter().map(|o| o as usize).collect()
    }

    /// Group-for-reduce axes the output keeps at full size; these get
    /// upcast during the second reduce stage instead of reduced.
    #[must_use]
    pub fn upcast_in_mid_reduce_axes(&self) -> Vec<usize> {
        let first_reduce = self.first_reduce();
        (first_reduce..first_reduce + self.group_for_reduce.len())
            .filter(|&j| self.full_shape()[j] == self.output_shape()[j])
            .collect()
    }

    /// Apply a reshape and/or axis permutation to every tracker.
    pub fn reshape_and_permute(
        &mut self,
        new_shape: Option<&[i64]>,
        order: Option<&[usize]>,
    ) -> Result<(), shape::Error> {
        for st in &mut self.sts {
            if let Some(shape) = new_shape {
                st.reshape(shape)?;
            }
            if let Some(order) = order {
                st.permute(order);
            }
        }
        Ok(())
    }

    /// Move the last axis into the upcast region.
    pub fn upcast(&mut self) -> Result<(), Error> {
        let last = *self
            .full_shape()
            .last()
            .ok_or(Error::MalformedAst("upcast of zero-dim kernel"))?;
        if !matches!(last, 1 | 2 | 4) {
            return Err(Error::ShapeMismatch {
                expected: 4,
                got: last as usize,
            });
        }
        self.upcasted += 1;
        Ok(())
    }

    /// Register a shared-memory staging copy for input `i`, returning the
    /// new buffer slot.
    pub fn add_local_alias(&mut self, i: usize, st: ShapeTracker) -> Result<usize, Error> {
        if st.shape().len() != self.shape_len() {
            return Err(Error::ShapeMismatch {
                expected: self.shape_len(),
                got: st.shape().len(),
            });
        }
        let slot = self.bufs.len();
        self.bufs.push(Buffer::Local {
            name: format!("ldata{i}"),
            size: st.size(),
        });
        self.sts.push(st);
        self.local_alias.insert(i, slot);
        Ok(slot)
    }
}
