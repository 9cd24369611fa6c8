//! Tensor kernel linearizer
//!
//! Lowers a tensor expression tree over multi-dimensional buffers into a
//! flat, SSA-style sequence of micro-operations ("uops") ready for
//! codegen to GPU/CPU targets: symbolic index arithmetic is resolved,
//! loop nests and accumulators are emitted, local-memory reductions get
//! their barriers, and the finished graph is deduplicated and swept of
//! dead code.

/// Kernel context: buffers, axis partition, target capabilities
pub mod kernel;
/// The lowering driver
pub mod linearize;
/// Tensor AST definitions
pub mod ops;
/// Shape and stride tracking
pub mod shape;
/// Symbolic integer algebra
pub mod sym;
/// The uop IR
pub mod uop;

pub use self::kernel::{Buffer, Device, Kernel, KernelOpts, TargetFlags};
pub use self::linearize::{lower, Error, Linearizer, Program};
pub use self::ops::LazyOp;
pub use self::shape::ShapeTracker;
pub use self::sym::SymNode;
pub use self::uop::{UOp, UOpGraph, UOpId, UOpKind};
