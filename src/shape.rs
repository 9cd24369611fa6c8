use std::{error, fmt};

use crate::sym::SymNode;

/// Shape tracking errors
#[derive(Debug, Clone)]
pub enum Error {
    /// Reshape of a view that is not a plain contiguous layout
    NonContiguousReshape,
    /// Reshape that changes the element count
    SizeMismatch { from: i64, to: i64 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonContiguousReshape => f.write_str("cannot reshape a non-contiguous view"),
            Self::SizeMismatch { from, to } => {
                write!(f, "reshape changes element count from {from} to {to}")
            }
        }
    }
}

impl error::Error for Error {}

/// Row-major strides for `shape`, with broadcast (size-1) axes zeroed.
#[must_use]
pub fn strides_for_shape(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![0i64; shape.len()];
    let mut acc = 1;
    for (st, &s) in strides.iter_mut().zip(shape).rev() {
        if s != 1 {
            *st = acc;
        }
        acc *= s;
    }
    strides
}

/// One layer of shape/stride bookkeeping: a logical shape, per-axis
/// strides, a linear offset, and an optional per-axis valid interval left
/// behind by padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    shape: Vec<i64>,
    strides: Vec<i64>,
    offset: i64,
    mask: Option<Vec<(i64, i64)>>,
}

/// Maps logical coordinates of a tensor to `(index, valid)` SymNode pairs.
///
/// This tracker keeps a single merged view; reshapes are only accepted on
/// contiguous layouts, which is all the linearizer requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeTracker {
    view: View,
}

impl ShapeTracker {
    #[must_use]
    pub fn from_shape(shape: &[i64]) -> Self {
        Self {
            view: View {
                shape: shape.to_vec(),
                strides: strides_for_shape(shape),
                offset: 0,
                mask: None,
            },
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[i64] {
        &self.view.shape
    }

    /// Total element count of the logical shape.
    #[must_use]
    pub fn size(&self) -> i64 {
        self.view.shape.iter().product()
    }

    #[must_use]
    pub fn contiguous(&self) -> bool {
        self.view.offset == 0
            && self.view.mask.is_none()
            && self.view.strides == strides_for_shape(&self.view.shape)
    }

    /// Per-axis strides; zero for broadcast axes.
    #[must_use]
    pub fn real_strides(&self) -> &[i64] {
        &self.view.strides
    }

    /// Axes addressed with stride 1.
    #[must_use]
    pub fn unit_stride_axes(&self) -> Vec<usize> {
        self.view
            .strides
            .iter()
            .enumerate()
            .filter_map(|(i, &st)| (st == 1).then_some(i))
            .collect()
    }

    /// Reorder the axes. `order` must be a permutation of `0..ndim`.
    pub fn permute(&mut self, order: &[usize]) {
        assert_eq!(order.len(), self.view.shape.len(), "bad permutation");
        self.view.shape = order.iter().map(|&i| self.view.shape[i]).collect();
        self.view.strides = order.iter().map(|&i| self.view.strides[i]).collect();
        if let Some(mask) = &self.view.mask {
            self.view.mask = Some(order.iter().map(|&i| mask[i]).collect());
        }
    }

    /// Broadcast size-1 axes up to `new_shape`; they keep stride 0.
    pub fn expand(&mut self, new_shape: &[i64]) {
        assert_eq!(new_shape.len(), self.view.shape.len(), "bad expand rank");
        for (i, (&old, &new)) in self.view.shape.iter().zip(new_shape).enumerate() {
            assert!(old == new || old == 1, "expand of non-1 axis {i}");
        }
        if let Some(mask) = &mut self.view.mask {
            for (m, (&old, &new)) in mask.iter_mut().zip(self.view.shape.iter().zip(new_shape)) {
                if old != new {
                    *m = if *m == (0, 1) { (0, new) } else { (0, 0) };
                }
            }
        }
        self.view.shape = new_shape.to_vec();
    }

    /// Grow each axis by `(lo, hi)` zero-padding, recording the valid
    /// interval in the mask.
    pub fn pad(&mut self, padding: &[(i64, i64)]) {
        assert_eq!(padding.len(), self.view.shape.len(), "bad pad rank");
        if padding.iter().all(|&p| p == (0, 0)) {
            return;
        }
        let old_mask = self
            .view
            .mask
            .clone()
            .unwrap_or_else(|| self.view.shape.iter().map(|&s| (0, s)).collect());
        let mut mask = Vec::with_capacity(padding.len());
        for (i, &(lo, hi)) in padding.iter().enumerate() {
            assert!(lo >= 0 && hi >= 0, "negative padding");
            self.view.offset -= lo * self.view.strides[i];
            self.view.shape[i] += lo + hi;
            mask.push((old_mask[i].0 + lo, old_mask[i].1 + lo));
        }
        self.view.mask = Some(mask);
    }

    /// Change the logical shape of a contiguous view.
    pub fn reshape(&mut self, new_shape: &[i64]) -> Result<(), Error> {
        let new_size: i64 = new_shape.iter().product();
        if new_size != self.size() {
            return Err(Error::SizeMismatch {
                from: self.size(),
                to: new_size,
            });
        }
        if self.view.shape == new_shape {
            return Ok(());
        }
        if !self.contiguous() {
            return Err(Error::NonContiguousReshape);
        }
        *self = Self::from_shape(new_shape);
        Ok(())
    }

    /// The `(index, valid)` pair for a logical coordinate vector. `index`
    /// is the linear element offset; `valid` is `1` unless padding put
    /// part of the view out of bounds, in which case it is the
    /// conjunction of the per-axis range checks.
    #[must_use]
    pub fn expr_idxs(&self, coords: &[SymNode]) -> (SymNode, SymNode) {
        debug_assert_eq!(coords.len(), self.view.shape.len(), "coordinate arity");
        let mut terms = vec![SymNode::num(self.view.offset)];
        for (coord, &st) in coords.iter().zip(&self.view.strides) {
            terms.push(coord.mul(st));
        }
        let idx = SymNode::sum(terms);
        let valid = match &self.view.mask {
            None => SymNode::num(1),
            Some(mask) => {
                let mut checks = Vec::new();
                for ((coord, &(lo, hi)), &s) in coords.iter().zip(mask).zip(&self.view.shape) {
                    if (lo, hi) != (0, s) {
                        checks.push(coord.ge(lo));
                        checks.push(coord.lt(hi));
                    }
                }
                SymNode::ands(checks)
            }
        };
        (idx, valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn v(name: &str, lo: i64, hi: i64) -> SymNode {
        SymNode::var(name, lo, hi).unwrap()
    }

    #[test]
    fn test_strides() {
        assert_eq!(strides_for_shape(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides_for_shape(&[2, 1, 4]), vec![4, 0, 1]);
        assert_eq!(strides_for_shape(&[1]), vec![0]);
    }

    #[test]
    fn test_expr_idxs_contiguous() {
        let st = ShapeTracker::from_shape(&[4, 8]);
        let (idx, valid) = st.expr_idxs(&[v("i", 0, 3), v("j", 0, 7)]);
        assert_eq!(idx, v("i", 0, 3).mul(8).add(&v("j", 0, 7)));
        assert_eq!(valid, SymNode::num(1));
    }

    #[test]
    fn test_permute_and_expand() {
        let mut st = ShapeTracker::from_shape(&[4, 8]);
        st.permute(&[1, 0]);
        assert_eq!(st.shape(), &[8, 4]);
        assert_eq!(st.real_strides(), &[1, 8]);

        let mut st = ShapeTracker::from_shape(&[4, 1]);
        st.expand(&[4, 5]);
        assert_eq!(st.shape(), &[4, 5]);
        assert_eq!(st.real_strides(), &[1, 0]);
        let (idx, _) = st.expr_idxs(&[v("i", 0, 3), v("j", 0, 4)]);
        assert_eq!(idx, v("i", 0, 3));
    }

    #[test]
    fn test_pad_produces_valid_checks() {
        let mut st = ShapeTracker::from_shape(&[8]);
        st.pad(&[(2, 1)]);
        assert_eq!(st.shape(), &[11]);
        let i = v("i", 0, 10);
        let (idx, valid) = st.expr_idxs(&[i.clone()]);
        // index shifts back by the left padding
        assert_eq!(idx, i.add(&SymNode::num(-2)));
        assert_ne!(valid, SymNode::num(1));
        // evaluate the range checks at the boundaries
        let eval = |val: i64| {
            let map = HashMap::from([(i.clone(), SymNode::num(val))]);
            valid.substitute(&map)
        };
        assert_eq!(eval(1), SymNode::num(0));
        assert_eq!(eval(2), SymNode::num(1));
        assert_eq!(eval(9), SymNode::num(1));
        assert_eq!(eval(10), SymNode::num(0));
    }

    #[test]
    fn test_unit_stride_axes() {
        let st = ShapeTracker::from_shape(&[2, 3, 4]);
        assert_eq!(st.unit_stride_axes(), vec![2]);
    }

    #[test]
    fn test_reshape() {
        let mut st = ShapeTracker::from_shape(&[4, 8]);
        st.reshape(&[32]).unwrap();
        assert_eq!(st.shape(), &[32]);
        assert!(st.reshape(&[33]).is_err());
        let mut padded = ShapeTracker::from_shape(&[4]);
        padded.pad(&[(1, 1)]);
        assert!(padded.reshape(&[6, 1]).is_err());
    }
}
