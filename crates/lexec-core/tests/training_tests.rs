#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lexec::{
        get_local_memory_allocator, input_tensor, is_invocation_valid, output_tensor, rvec,
        shape, Allocator, CombineAttrs, ComputationGraph, DeviceSpecific, ElementUnaryAttrs,
        ElementUnaryOpType, ElementUnaryPerDeviceState, FlatAttrs, LayerGuid, LinearAttrs,
        LocalCpuAllocator, LocalTrainingBacking, OpTaskBinding, OpTaskSignature, OpTaskType,
        PerDeviceHandle, ProfilingSettings, ReduceAttrs, ReduceOpType, ReductionAttrs,
        ReplicateAttrs, RuntimeArgConfig, SlotId, SplitAttrs, TaskId, TaskInvocation,
        TensorBackingMap, TensorGuid, TensorShape,
    };
    use rand_distr::{Distribution, Uniform};
    use test_strategy::proptest;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn backing(cg: ComputationGraph) -> anyhow::Result<LocalTrainingBacking> {
        backing_with(cg, ProfilingSettings::disabled())
    }

    fn backing_with(
        cg: ComputationGraph,
        profiling: ProfilingSettings,
    ) -> anyhow::Result<LocalTrainingBacking> {
        let config = RuntimeArgConfig::new(
            DeviceSpecific::create(0, PerDeviceHandle::default()),
            profiling,
        );
        Ok(LocalTrainingBacking::new(
            get_local_memory_allocator(),
            cg,
            TensorBackingMap::default(),
            config,
        )?)
    }

    fn write(backing: &LocalTrainingBacking, t: TensorGuid, data: &[f32]) -> anyhow::Result<()> {
        backing.tensor_backing(t).unwrap().copy_from_slice(data)?;
        Ok(())
    }

    fn write_grad(backing: &LocalTrainingBacking, t: TensorGuid, data: &[f32]) -> anyhow::Result<()> {
        backing.gradient_tensor_backing(t).unwrap().copy_from_slice(data)?;
        Ok(())
    }

    fn read(backing: &LocalTrainingBacking, t: TensorGuid) -> anyhow::Result<Vec<f32>> {
        Ok(backing.tensor_backing(t).unwrap().to_vec::<f32>()?)
    }

    fn read_grad(backing: &LocalTrainingBacking, t: TensorGuid) -> anyhow::Result<Vec<f32>> {
        Ok(backing.gradient_tensor_backing(t).unwrap().to_vec::<f32>()?)
    }

    fn random(n: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        let dist = Uniform::new(-1.0f32, 1.0);
        (0..n).map(|_| dist.sample(&mut rng)).collect()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn element_unary_identity_end_to_end() -> anyhow::Result<()> {
        init_logger();
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![2, 3]));
        let y = cg.add_layer(
            ElementUnaryAttrs::new(ElementUnaryOpType::Identity, None),
            &[x],
            &[],
        )?[0];
        let mut backing = backing(cg)?;
        let layer = backing.topological_ordering()[0];

        let init = backing.execute_init()?;
        assert_eq!(init.len(), 1);
        let state = backing.per_device_op_state(layer).unwrap().get(0)?;
        let state = state.get::<ElementUnaryPerDeviceState>()?;
        assert_eq!(state.op_type, ElementUnaryOpType::Identity);
        assert_eq!(state.output_shape, TensorShape::f32(shape![2, 3]));

        write(&backing, x, &[1.0; 6])?;
        backing.execute_forward()?;
        assert_eq!(read(&backing, y)?, vec![1.0; 6]);

        write_grad(&backing, y, &[1.0; 6])?;
        backing.execute_backward()?;
        assert_eq!(read_grad(&backing, x)?, vec![1.0; 6]);
        Ok(())
    }

    #[test]
    fn scalar_multiply_gradient() -> anyhow::Result<()> {
        init_logger();
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![4]));
        let y = cg.add_layer(
            ElementUnaryAttrs::new(ElementUnaryOpType::ScalarMultiply, Some(3.0)),
            &[x],
            &[],
        )?[0];
        let mut backing = backing(cg)?;
        backing.execute_init()?;

        write(&backing, x, &[1.0, 2.0, 3.0, 4.0])?;
        backing.execute_forward()?;
        assert_eq!(read(&backing, y)?, vec![3.0, 6.0, 9.0, 12.0]);

        write_grad(&backing, y, &[1.0; 4])?;
        backing.execute_backward()?;
        assert_eq!(read_grad(&backing, x)?, vec![3.0; 4]);

        // Gradients accumulate until cleared.
        backing.execute_backward()?;
        assert_eq!(read_grad(&backing, x)?, vec![6.0; 4]);
        backing.zero_gradients()?;
        assert_eq!(read_grad(&backing, x)?, vec![0.0; 4]);
        Ok(())
    }

    #[test]
    fn split_partitions_and_reassembles() -> anyhow::Result<()> {
        init_logger();
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![2, 5]));
        let parts = cg.add_layer(SplitAttrs::new(rvec![2, 3], 1), &[x], &[])?;
        assert_eq!(parts.len(), 2);
        let mut backing = backing(cg)?;
        assert!(backing.execute_init()?.is_empty());

        let input: Vec<f32> = (0..10).map(|v| v as f32).collect();
        write(&backing, x, &input)?;
        backing.execute_forward()?;
        assert_eq!(read(&backing, parts[0])?, vec![0.0, 1.0, 5.0, 6.0]);
        assert_eq!(read(&backing, parts[1])?, vec![2.0, 3.0, 4.0, 7.0, 8.0, 9.0]);

        write_grad(&backing, parts[0], &[10.0, 11.0, 15.0, 16.0])?;
        write_grad(&backing, parts[1], &[12.0, 13.0, 14.0, 17.0, 18.0, 19.0])?;
        backing.execute_backward()?;
        let expected: Vec<f32> = (10..20).map(|v| v as f32).collect();
        assert_eq!(read_grad(&backing, x)?, expected);
        Ok(())
    }

    #[test]
    fn reduce_mean_forward_and_backward() -> anyhow::Result<()> {
        init_logger();
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![2, 3]));
        let y = cg.add_layer(
            ReduceAttrs::new(rvec![1], ReduceOpType::Mean, false),
            &[x],
            &[],
        )?[0];
        let mut backing = backing(cg)?;
        backing.execute_init()?;

        write(&backing, x, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        backing.execute_forward()?;
        assert_close(&read(&backing, y)?, &[2.0, 5.0]);

        write_grad(&backing, y, &[3.0, 6.0])?;
        backing.execute_backward()?;
        assert_close(&read_grad(&backing, x)?, &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        Ok(())
    }

    #[test]
    fn replicate_then_reduction_doubles() -> anyhow::Result<()> {
        init_logger();
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![2, 3]));
        let y = cg.add_layer(ReplicateAttrs::new(0, 2), &[x], &[])?[0];
        let z = cg.add_layer(ReductionAttrs::new(0, 2), &[y], &[])?[0];
        assert_eq!(cg.tensor_shape(y)?, &TensorShape::f32(shape![4, 3]));
        let mut backing = backing(cg)?;
        backing.execute_init()?;

        let input = random(6);
        write(&backing, x, &input)?;
        backing.execute_forward()?;
        let tiled: Vec<f32> = input.iter().chain(input.iter()).copied().collect();
        assert_close(&read(&backing, y)?, &tiled);
        let doubled: Vec<f32> = input.iter().map(|v| v * 2.0).collect();
        assert_close(&read(&backing, z)?, &doubled);

        let grad = random(6);
        write_grad(&backing, z, &grad)?;
        backing.execute_backward()?;
        let tiled_grad: Vec<f32> = grad.iter().chain(grad.iter()).copied().collect();
        assert_close(&read_grad(&backing, y)?, &tiled_grad);
        let doubled_grad: Vec<f32> = grad.iter().map(|v| v * 2.0).collect();
        assert_close(&read_grad(&backing, x)?, &doubled_grad);
        Ok(())
    }

    /// x -> relu -> split -> (flat, reduce), with a combine on the first part.
    fn branching_graph() -> anyhow::Result<(ComputationGraph, TensorGuid)> {
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![2, 4]));
        let h = cg.add_layer(
            ElementUnaryAttrs::new(ElementUnaryOpType::Relu, None),
            &[x],
            &[],
        )?[0];
        let parts = cg.add_layer(SplitAttrs::new(rvec![2, 2], 1), &[h], &[])?;
        let c = cg.add_layer(CombineAttrs::new(1, 2), &[parts[0]], &[])?[0];
        cg.add_layer(FlatAttrs, &[c], &[])?;
        cg.add_layer(
            ReduceAttrs::new(rvec![1], ReduceOpType::Sum, true),
            &[parts[1]],
            &[],
        )?;
        Ok((cg, x))
    }

    fn producers(cg: &ComputationGraph, layer: LayerGuid) -> Vec<LayerGuid> {
        cg.get_incoming_tensors(layer)
            .unwrap()
            .iter()
            .filter_map(|t| cg.tensor_attrs(*t).and_then(|a| a.producer))
            .collect()
    }

    #[test]
    fn training_loop_visits_in_topological_order() -> anyhow::Result<()> {
        init_logger();
        let (cg, x) = branching_graph()?;
        let mut backing = backing(cg)?;
        let order = backing.topological_ordering().to_vec();
        assert_eq!(order.len(), 5);

        let init = backing.execute_init()?;
        assert_eq!(init.len(), 2);

        for _ in 0..3 {
            backing.zero_gradients()?;
            write(&backing, x, &random(8))?;
            let fwd = backing.execute_forward()?;
            let bwd = backing.execute_backward()?;

            let fwd: Vec<_> = fwd.layers().collect();
            let mut bwd: Vec<_> = bwd.layers().collect();
            assert_eq!(fwd, order);
            bwd.reverse();
            assert_eq!(bwd, fwd);

            let cg = backing.computation_graph();
            for (pos, layer) in fwd.iter().enumerate() {
                for producer in producers(cg, *layer) {
                    assert!(fwd[..pos].contains(&producer));
                }
            }
        }
        assert!(backing.execute_update().is_err());
        Ok(())
    }

    #[test]
    fn profiling_reports_elapsed_time() -> anyhow::Result<()> {
        init_logger();
        let (cg, x) = branching_graph()?;
        let mut backing = backing_with(cg, ProfilingSettings::new(1, 2))?;
        backing.execute_init()?;
        write(&backing, x, &random(8))?;
        let fwd = backing.execute_forward()?;
        assert!(fwd.entries().iter().all(|(_, t)| t.is_some()));
        assert!(fwd.total_elapsed_ms().is_some());
        Ok(())
    }

    #[test]
    fn linear_trains_its_kernel() -> anyhow::Result<()> {
        init_logger();
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![2, 3]));
        let w = cg.create_weight_tensor(TensorShape::f32(shape![3, 2]));
        let y = cg.add_layer(LinearAttrs::new(2), &[x], &[w])?[0];
        assert_eq!(cg.tensor_shape(y)?, &TensorShape::f32(shape![2, 2]));
        let mut backing = backing(cg)?;
        assert!(backing.execute_init()?.is_empty());

        write(&backing, x, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        write(&backing, w, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0])?;
        backing.execute_forward()?;
        assert_close(&read(&backing, y)?, &[4.0, 5.0, 10.0, 11.0]);

        write_grad(&backing, y, &[1.0; 4])?;
        backing.execute_backward()?;
        assert_close(&read_grad(&backing, x)?, &[1.0, 1.0, 2.0, 1.0, 1.0, 2.0]);
        assert_close(&read_grad(&backing, w)?, &[5.0, 5.0, 7.0, 7.0, 9.0, 9.0]);
        // The kernel itself is left to the optimizer.
        assert_eq!(read(&backing, w)?, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        Ok(())
    }

    /// Input and kernel gradients of x -> identity -> linear(w) for an all-ones
    /// output gradient.
    fn linear_gradients(
        profiling: ProfilingSettings,
        input: &[f32],
        kernel: &[f32],
    ) -> anyhow::Result<(Vec<f32>, Vec<f32>)> {
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![2, 3]));
        let w = cg.create_weight_tensor(TensorShape::f32(shape![3, 2]));
        let h = cg.add_layer(
            ElementUnaryAttrs::new(ElementUnaryOpType::Identity, None),
            &[x],
            &[],
        )?[0];
        let y = cg.add_layer(LinearAttrs::new(2), &[h], &[w])?[0];
        let mut backing = backing_with(cg, profiling)?;
        backing.execute_init()?;
        write(&backing, x, input)?;
        write(&backing, w, kernel)?;
        backing.execute_forward()?;
        write_grad(&backing, y, &[1.0; 4])?;
        backing.execute_backward()?;
        Ok((read_grad(&backing, x)?, read_grad(&backing, w)?))
    }

    #[test]
    fn profiling_leaves_gradients_unchanged() -> anyhow::Result<()> {
        init_logger();
        let (input, kernel) = (random(6), random(6));
        let plain = linear_gradients(ProfilingSettings::disabled(), &input, &kernel)?;
        let profiled = linear_gradients(ProfilingSettings::new(1, 2), &input, &kernel)?;
        assert_eq!(plain, profiled);

        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![4]));
        let y = cg.add_layer(
            ElementUnaryAttrs::new(ElementUnaryOpType::Identity, None),
            &[x],
            &[],
        )?[0];
        let mut backing = backing_with(cg, ProfilingSettings::new(1, 2))?;
        backing.execute_init()?;
        write(&backing, x, &[1.0; 4])?;
        backing.execute_forward()?;
        write_grad(&backing, y, &[1.0; 4])?;
        let trace = backing.execute_backward()?;
        assert!(trace.total_elapsed_ms().is_some());
        assert_eq!(read_grad(&backing, x)?, vec![1.0; 4]);
        Ok(())
    }

    #[proptest]
    fn tensors_are_allocated_once(#[strategy(1..6usize)] depth: usize, preallocate: bool) {
        let mut cg = ComputationGraph::new();
        let x = cg.create_input_tensor(TensorShape::f32(shape![3, 2]));
        let mut t = x;
        for _ in 0..depth {
            t = cg
                .add_layer(ElementUnaryAttrs::new(ElementUnaryOpType::Tanh, None), &[t], &[])
                .unwrap()[0];
        }

        let allocator = Arc::new(LocalCpuAllocator::default());
        let mut allocated = TensorBackingMap::default();
        let external = allocator
            .allocate_tensor(&TensorShape::f32(shape![3, 2]))
            .unwrap();
        if preallocate {
            allocated.insert(x, external.clone());
        }
        let before = allocator.n_allocations();
        let backing = LocalTrainingBacking::new(
            allocator.clone(),
            cg,
            allocated,
            RuntimeArgConfig::default(),
        )
        .unwrap();

        // Every tensor gets one primal and one gradient buffer.
        let expected = 2 * (depth + 1) - usize::from(preallocate);
        assert_eq!(allocator.n_allocations() - before, expected);
        assert_eq!(
            backing.tensor_backing(x).unwrap().is_same_buffer(&external),
            preallocate
        );
    }

    #[test]
    fn missing_required_slot_fails_validation() -> anyhow::Result<()> {
        let input = SlotId::new(0);
        let output = SlotId::new(1);
        let scale = SlotId::new(2);
        let mut sig = OpTaskSignature::new(OpTaskType::Fwd);
        sig.add_input_slot(input);
        sig.add_output_slot(output);
        sig.add_arg_slot::<f32>(scale);

        let mut binding = OpTaskBinding::default();
        binding.bind(input, input_tensor(0))?;
        binding.bind(output, output_tensor(0))?;
        assert!(!is_invocation_valid(
            &sig,
            &TaskInvocation::new(TaskId::FlatFwd, binding.clone())
        ));

        let mut mistyped = binding.clone();
        mistyped.bind_arg(scale, 2usize)?;
        assert!(!is_invocation_valid(
            &sig,
            &TaskInvocation::new(TaskId::FlatFwd, mistyped)
        ));

        binding.bind_arg(scale, 2.0f32)?;
        assert!(is_invocation_valid(
            &sig,
            &TaskInvocation::new(TaskId::FlatFwd, binding)
        ));
        Ok(())
    }
}
