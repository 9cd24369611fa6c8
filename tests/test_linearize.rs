use tensor_uops::kernel::{Buffer, Device, Kernel, KernelOpts, TargetFlags};
use tensor_uops::linearize::{lower, Error};
use tensor_uops::ops::{BinaryOp, LazyOp, ReduceOp};
use tensor_uops::shape::ShapeTracker;
use tensor_uops::uop::{AluOp, Arg, DType, UOp, UOpKind, Val, WmmaTarget};

fn mem(idx: usize) -> Buffer {
    Buffer::Mem {
        idx,
        dtype: DType::FLOAT32,
    }
}

fn kinds(uops: &[UOp]) -> Vec<UOpKind> {
    uops.iter().map(|u| u.op).collect()
}

fn position(uops: &[UOp], pred: impl Fn(&UOp) -> bool) -> usize {
    uops.iter()
        .position(|u| pred(u))
        .expect("expected uop not found")
}

#[test]
fn test_elementwise_add() {
    let ast = LazyOp::store(
        0,
        LazyOp::binary(BinaryOp::Add, LazyOp::load(1), LazyOp::load(2)),
    );
    let bufs = vec![mem(0), mem(1), mem(2)];
    let sts = vec![ShapeTracker::from_shape(&[8]); 3];
    let kernel = Kernel::new(
        ast,
        bufs,
        sts,
        KernelOpts {
            global_dims: 1,
            ..KernelOpts::default()
        },
    )
    .unwrap();
    let program = lower(kernel).unwrap();
    assert_eq!(program.name, "E_8");
    assert_eq!(
        kinds(program.uops.uops()),
        vec![
            UOpKind::DefineGlobal,
            UOpKind::DefineGlobal,
            UOpKind::DefineGlobal,
            UOpKind::Const,
            UOpKind::Const,
            UOpKind::Loop,
            UOpKind::Load,
            UOpKind::Load,
            UOpKind::Alu,
            UOpKind::Store,
            UOpKind::End,
        ]
    );
    let uops = program.uops.uops();
    let alu = &uops[position(uops, |u| u.op == UOpKind::Alu)];
    assert_eq!(alu.arg, Arg::Alu(AluOp::Add));
    // the store writes the sum into buffer 0
    let store = &uops[position(uops, |u| u.op == UOpKind::Store)];
    let out_def = &uops[0];
    assert_eq!(store.operands[0], out_def.id);
    assert_eq!(store.operands[2], alu.id);
}

#[test]
fn test_dot_product_fuses_mulacc() {
    let ast = LazyOp::store(
        0,
        LazyOp::reduce(
            ReduceOp::Sum,
            LazyOp::binary(BinaryOp::Mul, LazyOp::load(1), LazyOp::load(2)),
        ),
    );
    let bufs = vec![mem(0), mem(1), mem(2)];
    let sts = vec![
        ShapeTracker::from_shape(&[1]),
        ShapeTracker::from_shape(&[16]),
        ShapeTracker::from_shape(&[16]),
    ];
    let kernel = Kernel::new(ast, bufs, sts, KernelOpts::default()).unwrap();
    let program = lower(kernel).unwrap();
    assert_eq!(program.name, "r_16");
    let uops = program.uops.uops();
    assert_eq!(
        kinds(uops),
        vec![
            UOpKind::DefineGlobal,
            UOpKind::DefineGlobal,
            UOpKind::DefineGlobal,
            UOpKind::DefineAcc,
            UOpKind::Const,
            UOpKind::Const,
            UOpKind::Loop,
            UOpKind::Load,
            UOpKind::Load,
            UOpKind::Alu,
            UOpKind::Store,
            UOpKind::End,
            UOpKind::Store,
        ]
    );
    let acc = &uops[position(uops, |u| u.op == UOpKind::DefineAcc)];
    assert_eq!(acc.arg, Arg::Acc(Val::Float(0.0)));
    // a single fused multiply-accumulate updates the accumulator in place
    let alu = &uops[position(uops, |u| u.op == UOpKind::Alu)];
    assert_eq!(alu.arg, Arg::Alu(AluOp::MulAcc));
    assert_eq!(alu.operands[2], acc.id);
    let acc_store = &uops[position(uops, |u| u.op == UOpKind::Store)];
    assert_eq!(acc_store.operands, vec![acc.id, alu.id]);
    // the final store writes the accumulator out
    let final_store = uops.last().unwrap();
    assert_eq!(final_store.operands[2], acc.id);
}

#[test]
fn test_group_for_reduce_two_stage() {
    let ast = LazyOp::store(
        0,
        LazyOp::reduce(
            ReduceOp::Sum,
            LazyOp::binary(BinaryOp::Mul, LazyOp::load(1), LazyOp::load(2)),
        ),
    );
    let bufs = vec![mem(0), mem(1), mem(2)];
    let sts = vec![
        ShapeTracker::from_shape(&[2, 1, 1]),
        ShapeTracker::from_shape(&[2, 4, 16]),
        ShapeTracker::from_shape(&[2, 4, 16]),
    ];
    let kernel = Kernel::new(
        ast,
        bufs,
        sts,
        KernelOpts {
            global_dims: 1,
            group_for_reduce: vec![4],
            flags: TargetFlags::HAS_LOCAL,
            ..KernelOpts::default()
        },
    )
    .unwrap();
    let program = lower(kernel).unwrap();
    assert_eq!(program.name, "r_2_4_16");
    assert_eq!(program.global_size, vec![2, 1, 1]);
    assert_eq!(program.local_size, vec![4, 1, 1]);
    let uops = program.uops.uops();

    // both the global and the group axis come from hardware indices
    let specials: Vec<&UOp> = uops.iter().filter(|u| u.op == UOpKind::Special).collect();
    assert_eq!(specials.len(), 2);

    let temp_def = position(uops, |u| {
        matches!(&u.arg, Arg::DefineLocal { name, .. } if name == "temp")
    });
    let first_acc = position(uops, |u| u.op == UOpKind::DefineAcc);
    let reduce_loop = position(uops, |u| u.op == UOpKind::Loop);
    let mulacc = position(uops, |u| u.arg == Arg::Alu(AluOp::MulAcc));
    let first_end = position(uops, |u| u.op == UOpKind::End);
    let temp_store = position(uops, |u| {
        u.op == UOpKind::Store && u.operands[0] == uops[temp_def].id
    });
    let barrier = position(uops, |u| u.op == UOpKind::Barrier);
    let if_gate = position(uops, |u| u.op == UOpKind::If);
    let second_acc = first_acc
        + 1
        + position(&uops[first_acc + 1..], |u| u.op == UOpKind::DefineAcc);
    let tidx_loop = reduce_loop
        + 1
        + position(&uops[reduce_loop + 1..], |u| u.op == UOpKind::Loop);
    let temp_load = position(uops, |u| {
        u.op == UOpKind::Load && u.operands[0] == uops[temp_def].id
    });
    let second_add = position(uops, |u| {
        u.arg == Arg::Alu(AluOp::Add) && u.operands.contains(&uops[second_acc].id)
    });
    let if_end = position(uops, |u| {
        u.op == UOpKind::End && u.operands[0] == uops[if_gate].id
    });

    // stage one: accumulate, stash into the temp local, synchronize
    assert!(first_acc < reduce_loop);
    assert!(reduce_loop < mulacc);
    assert!(mulacc < first_end);
    assert!(first_end < temp_store);
    assert!(temp_store < barrier);
    // stage two runs behind the thread-0 gate
    assert!(barrier < if_gate);
    assert!(if_gate < second_acc);
    assert!(second_acc < tidx_loop);
    assert!(tidx_loop < temp_load);
    assert!(temp_load < second_add);
    assert!(second_add < if_end);
    assert_eq!(if_end, uops.len() - 1);
}

#[test]
fn test_aligned_float4_load() {
    let ast = LazyOp::store(
        0,
        LazyOp::binary(BinaryOp::Add, LazyOp::load(1), LazyOp::load(2)),
    );
    let bufs = vec![mem(0), mem(1), mem(2)];
    let sts = vec![ShapeTracker::from_shape(&[8, 4]); 3];
    let kernel = Kernel::new(
        ast,
        bufs,
        sts,
        KernelOpts {
            global_dims: 1,
            upcasted: 1,
            ..KernelOpts::default()
        },
    )
    .unwrap();
    let program = lower(kernel).unwrap();
    assert_eq!(program.name, "E_8_4");
    let uops = program.uops.uops();

    // one vector load per input, fanned out into four lanes each
    let loads: Vec<&UOp> = uops.iter().filter(|u| u.op == UOpKind::Load).collect();
    assert_eq!(loads.len(), 2);
    for load in &loads {
        assert_eq!(load.dtype, Some(DType::FLOAT4));
        let geps: Vec<&UOp> = uops
            .iter()
            .filter(|u| u.op == UOpKind::Gep && u.operands[0] == load.id)
            .collect();
        assert_eq!(geps.len(), 4);
        for (lane, gep) in geps.iter().enumerate() {
            assert_eq!(gep.arg, Arg::Lane(lane as u8));
            assert_eq!(gep.dtype, Some(DType::FLOAT32));
        }
    }
    // the four lane sums regroup into one vector store through a CAST
    let adds: Vec<&UOp> = uops
        .iter()
        .filter(|u| u.arg == Arg::Alu(AluOp::Add))
        .collect();
    assert_eq!(adds.len(), 4);
    let casts: Vec<&UOp> = uops.iter().filter(|u| u.op == UOpKind::Cast).collect();
    assert_eq!(casts.len(), 1);
    assert_eq!(casts[0].dtype, Some(DType::FLOAT4));
    assert_eq!(casts[0].operands, adds.iter().map(|u| u.id).collect::<Vec<_>>());
    let stores: Vec<&UOp> = uops.iter().filter(|u| u.op == UOpKind::Store).collect();
    assert_eq!(stores.len(), 1);
    assert_eq!(stores[0].operands[2], casts[0].id);
}

#[test]
fn test_kernel_name_dedup() {
    let make = || {
        let ast = LazyOp::store(
            0,
            LazyOp::binary(BinaryOp::Add, LazyOp::load(1), LazyOp::load(2)),
        );
        let bufs = vec![mem(0), mem(1), mem(2)];
        let sts = vec![ShapeTracker::from_shape(&[7]); 3];
        Kernel::new(
            ast,
            bufs,
            sts,
            KernelOpts {
                global_dims: 1,
                ..KernelOpts::default()
            },
        )
        .unwrap()
    };
    let first = lower(make()).unwrap();
    let second = lower(make()).unwrap();
    assert_eq!(first.name, "E_7");
    assert_eq!(second.name, "E_7n1");
}

#[test]
fn test_zero_fold_leaves_no_add() {
    let ast = LazyOp::store(
        0,
        LazyOp::binary(BinaryOp::Add, LazyOp::load(1), LazyOp::load(2)),
    );
    let bufs = vec![
        mem(0),
        mem(1),
        Buffer::Const {
            val: Val::Float(0.0),
            dtype: DType::FLOAT32,
        },
    ];
    let sts = vec![ShapeTracker::from_shape(&[4]); 3];
    let kernel = Kernel::new(
        ast,
        bufs,
        sts,
        KernelOpts {
            global_dims: 1,
            ..KernelOpts::default()
        },
    )
    .unwrap();
    let program = lower(kernel).unwrap();
    let uops = program.uops.uops();
    // x + 0 folds away: the load feeds the store directly
    assert!(!uops.iter().any(|u| u.op == UOpKind::Alu));
    let load = position(uops, |u| u.op == UOpKind::Load);
    let store = &uops[position(uops, |u| u.op == UOpKind::Store)];
    assert_eq!(store.operands[2], uops[load].id);
}

#[test]
fn test_retained_uops_are_reachable() {
    let ast = LazyOp::store(
        0,
        LazyOp::reduce(
            ReduceOp::Max,
            LazyOp::binary(BinaryOp::Max, LazyOp::load(1), LazyOp::load(2)),
        ),
    );
    let bufs = vec![mem(0), mem(1), mem(2)];
    let sts = vec![
        ShapeTracker::from_shape(&[1, 1]),
        ShapeTracker::from_shape(&[4, 8]),
        ShapeTracker::from_shape(&[4, 8]),
    ];
    let kernel = Kernel::new(ast, bufs, sts, KernelOpts::default()).unwrap();
    let program = lower(kernel).unwrap();
    let uops = program.uops.uops();

    // max-reduce initializes to -inf
    let acc = &uops[position(uops, |u| u.op == UOpKind::DefineAcc)];
    assert_eq!(acc.arg, Arg::Acc(Val::Float(f64::NEG_INFINITY)));

    // every retained uop is a side effect or transitively referenced,
    // ids stay sorted, loops precede their ends
    let mut referenced = std::collections::HashSet::new();
    for u in uops {
        for v in &u.operands {
            referenced.insert(*v);
        }
    }
    for u in uops {
        assert!(u.op.has_side_effect() || referenced.contains(&u.id), "{u}");
    }
    let ids: Vec<_> = uops.iter().map(|u| u.id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
    for u in uops.iter().filter(|u| u.op == UOpKind::End) {
        assert!(position(uops, |v| v.id == u.operands[0]) < position(uops, |v| v.id == u.id));
    }
}

#[test]
fn test_metal_wmma_pairs_lanes_and_accumulators() {
    let ast = LazyOp::store(
        0,
        LazyOp::reduce(
            ReduceOp::Sum,
            LazyOp::binary(BinaryOp::Mul, LazyOp::load(1), LazyOp::load(2)),
        ),
    );
    let bufs = vec![mem(0), mem(1), mem(2)];
    let sts = vec![
        ShapeTracker::from_shape(&[1, 2]),
        ShapeTracker::from_shape(&[8, 2]),
        ShapeTracker::from_shape(&[8, 2]),
    ];
    let mut kernel = Kernel::new(
        ast,
        bufs,
        sts,
        KernelOpts {
            upcasted: 1,
            flags: TargetFlags::TENSOR_CORES,
            device: Device::Metal,
            ..KernelOpts::default()
        },
    )
    .unwrap();
    kernel
        .add_local_alias(1, ShapeTracker::from_shape(&[1, 2]))
        .unwrap();
    kernel
        .add_local_alias(2, ShapeTracker::from_shape(&[1, 2]))
        .unwrap();
    let program = lower(kernel).unwrap();
    assert_eq!(program.name, "r_8_2");
    let uops = program.uops.uops();

    // two staged vector loads, one per aliased input
    let loads: Vec<&UOp> = uops.iter().filter(|u| u.op == UOpKind::Load).collect();
    assert_eq!(loads.len(), 2);
    let data1 = position(uops, |u| {
        matches!(&u.arg, Arg::DefineGlobal { name, .. } if name == "data1")
    });
    let data2 = position(uops, |u| {
        matches!(&u.arg, Arg::DefineGlobal { name, .. } if name == "data2")
    });
    assert_eq!(loads[0].operands[0], uops[data1].id);
    assert_eq!(loads[1].operands[0], uops[data2].id);
    for load in &loads {
        assert_eq!(load.dtype, Some(DType::FLOAT2));
    }
    let acc_def = &uops[position(uops, |u| u.op == UOpKind::DefineAcc)];
    assert_eq!(acc_def.dtype, Some(DType::FLOAT2));

    // one WMMA consumes both lane pairs plus the accumulator pair
    let wmmas: Vec<&UOp> = uops.iter().filter(|u| u.op == UOpKind::Wmma).collect();
    assert_eq!(wmmas.len(), 1);
    let wmma = wmmas[0];
    assert_eq!(wmma.arg, Arg::Wmma(WmmaTarget::Metal));
    assert_eq!(wmma.operands.len(), 6);
    for lane in 0..2u8 {
        let x = &uops[position(uops, |u| u.id == wmma.operands[lane as usize])];
        assert_eq!((x.op, &x.arg), (UOpKind::Gep, &Arg::Lane(lane)));
        assert_eq!(x.operands[0], loads[0].id);
        let y = &uops[position(uops, |u| u.id == wmma.operands[2 + lane as usize])];
        assert_eq!((y.op, &y.arg), (UOpKind::Gep, &Arg::Lane(lane)));
        assert_eq!(y.operands[0], loads[1].id);
        let a = &uops[position(uops, |u| u.id == wmma.operands[4 + lane as usize])];
        assert_eq!((a.op, &a.arg), (UOpKind::Gep, &Arg::Lane(lane)));
        assert_eq!(a.operands[0], acc_def.id);
    }

    // the barrier lands between the reduce loop and the staged loads,
    // and the scalar reduce body is fully replaced by the WMMA
    let reduce_loop = position(uops, |u| u.op == UOpKind::Loop);
    let barrier = position(uops, |u| u.op == UOpKind::Barrier);
    let first_load = position(uops, |u| u.op == UOpKind::Load);
    assert!(reduce_loop < barrier && barrier < first_load);
    assert!(!uops.iter().any(|u| u.arg == Arg::Alu(AluOp::MulAcc)));
}

#[test]
fn test_hip_wmma_windows_inputs_and_accumulators() {
    let ast = LazyOp::store(
        0,
        LazyOp::reduce(
            ReduceOp::Sum,
            LazyOp::binary(BinaryOp::Mul, LazyOp::load(1), LazyOp::load(2)),
        ),
    );
    let bufs = vec![mem(0), mem(1), mem(2)];
    let sts = vec![
        ShapeTracker::from_shape(&[1, 4, 4, 2]),
        ShapeTracker::from_shape(&[8, 4, 4, 2]),
        ShapeTracker::from_shape(&[8, 4, 4, 2]),
    ];
    let mut kernel = Kernel::new(
        ast,
        bufs,
        sts,
        KernelOpts {
            upcasted: 3,
            flags: TargetFlags::TENSOR_CORES,
            device: Device::Hip,
            ..KernelOpts::default()
        },
    )
    .unwrap();
    kernel
        .add_local_alias(1, ShapeTracker::from_shape(&[1, 4, 4, 2]))
        .unwrap();
    kernel
        .add_local_alias(2, ShapeTracker::from_shape(&[1, 4, 4, 2]))
        .unwrap();
    let program = lower(kernel).unwrap();
    assert_eq!(program.name, "r_8_4_4_2");
    let uops = program.uops.uops();

    // 32 staged lanes per input and 32 accumulator lanes split into
    // 16-wide input windows and 8-wide accumulator windows: four WMMAs
    let wmmas: Vec<&UOp> = uops.iter().filter(|u| u.op == UOpKind::Wmma).collect();
    assert_eq!(wmmas.len(), 4);
    for wmma in &wmmas {
        assert_eq!(wmma.arg, Arg::Wmma(WmmaTarget::Hip));
        assert_eq!(wmma.operands.len(), 16 + 16 + 8);
    }
    // the first input window repeats across the second input's windows
    assert_eq!(wmmas[0].operands[..16], wmmas[2].operands[..16]);
    assert_eq!(wmmas[1].operands[..16], wmmas[3].operands[..16]);
    assert_ne!(wmmas[0].operands[..16], wmmas[1].operands[..16]);
    // and vice versa for the second input
    assert_eq!(wmmas[0].operands[16..32], wmmas[1].operands[16..32]);
    assert_eq!(wmmas[2].operands[16..32], wmmas[3].operands[16..32]);
    assert_ne!(wmmas[0].operands[16..32], wmmas[2].operands[16..32]);
    // every WMMA gets its own slice of the accumulators
    let acc_lanes: std::collections::HashSet<_> = wmmas
        .iter()
        .flat_map(|w| w.operands[32..].iter().copied())
        .collect();
    assert_eq!(acc_lanes.len(), 32);
    for lane in &acc_lanes {
        let u = &uops[position(uops, |u| u.id == *lane)];
        assert_eq!(u.op, UOpKind::Gep);
        assert_eq!(uops[position(uops, |v| v.id == u.operands[0])].op, UOpKind::DefineAcc);
    }
}

#[test]
fn test_tensor_cores_need_known_device() {
    let ast = LazyOp::store(
        0,
        LazyOp::reduce(
            ReduceOp::Sum,
            LazyOp::binary(BinaryOp::Mul, LazyOp::load(1), LazyOp::load(2)),
        ),
    );
    let bufs = vec![mem(0), mem(1), mem(2)];
    let sts = vec![
        ShapeTracker::from_shape(&[1]),
        ShapeTracker::from_shape(&[32]),
        ShapeTracker::from_shape(&[32]),
    ];
    let kernel = Kernel::new(
        ast,
        bufs,
        sts,
        KernelOpts {
            flags: TargetFlags::TENSOR_CORES,
            device: Device::Cpu,
            ..KernelOpts::default()
        },
    )
    .unwrap();
    assert!(matches!(
        lower(kernel),
        Err(Error::UnsupportedTarget(Device::Cpu))
    ));
}

#[test]
fn test_special_indices_when_hardware_local() {
    let ast = LazyOp::store(
        0,
        LazyOp::binary(BinaryOp::Add, LazyOp::load(1), LazyOp::load(2)),
    );
    let bufs = vec![mem(0), mem(1), mem(2)];
    let sts = vec![ShapeTracker::from_shape(&[32, 16]); 3];
    let kernel = Kernel::new(
        ast,
        bufs,
        sts,
        KernelOpts {
            global_dims: 1,
            local_dims: 1,
            flags: TargetFlags::HAS_LOCAL,
            ..KernelOpts::default()
        },
    )
    .unwrap();
    let program = lower(kernel).unwrap();
    assert_eq!(program.global_size, vec![32, 1, 1]);
    assert_eq!(program.local_size, vec![16, 1, 1]);
    let uops = program.uops.uops();
    let specials: Vec<&UOp> = uops.iter().filter(|u| u.op == UOpKind::Special).collect();
    assert_eq!(specials.len(), 2);
    assert!(matches!(
        &specials[0].arg,
        Arg::Special { dim: 0, name, size: 32 } if name == "gidx0"
    ));
    assert!(matches!(
        &specials[1].arg,
        Arg::Special { dim: 0, name, size: 16 } if name == "lidx1"
    ));
    // hardware indices never get an END
    assert!(!uops.iter().any(|u| u.op == UOpKind::End));
    assert!(!uops.iter().any(|u| u.op == UOpKind::Loop));
}

#[test]
fn test_local_alias_staging_is_bracketed_by_barriers() {
    let ast = LazyOp::store(
        0,
        LazyOp::reduce(
            ReduceOp::Sum,
            LazyOp::binary(BinaryOp::Mul, LazyOp::load(1), LazyOp::load(2)),
        ),
    );
    let bufs = vec![mem(0), mem(1), mem(2)];
    let sts = vec![
        ShapeTracker::from_shape(&[8, 1]),
        ShapeTracker::from_shape(&[8, 32]),
        ShapeTracker::from_shape(&[8, 32]),
    ];
    let mut kernel = Kernel::new(
        ast,
        bufs,
        sts,
        KernelOpts {
            global_dims: 1,
            ..KernelOpts::default()
        },
    )
    .unwrap();
    // stage input 1 through shared memory
    let mut alias_st = ShapeTracker::from_shape(&[1, 32]);
    alias_st.expand(&[8, 32]);
    kernel.add_local_alias(1, alias_st).unwrap();
    let program = lower(kernel).unwrap();
    let uops = program.uops.uops();

    let local_def = position(uops, |u| {
        matches!(&u.arg, Arg::DefineLocal { name, .. } if name == "ldata1")
    });
    let barriers: Vec<usize> = uops
        .iter()
        .enumerate()
        .filter_map(|(i, u)| (u.op == UOpKind::Barrier).then_some(i))
        .collect();
    assert_eq!(barriers.len(), 2);
    // the store into the staging buffer sits between the two barriers
    let staging_store = position(uops, |u| {
        u.op == UOpKind::Store && u.operands[0] == uops[local_def].id
    });
    assert!(barriers[0] < staging_store && staging_store < barriers[1]);
    // the reduce body reads back from the staging buffer
    let staging_load = position(uops, |u| {
        u.op == UOpKind::Load && u.operands[0] == uops[local_def].id
    });
    assert!(staging_load > barriers[1]);
}
