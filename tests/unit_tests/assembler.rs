use crate::unit_tests::fixtures::{
    compiled, compiled_with, expected_laplacian, ConstantKernel, FunctionalKernel, Interval, LaplaceKernel,
    LoadKernel, MassKernel,
};
use fenris_assembly::assembler::{execute_all, AssemblyOperation};
use fenris_assembly::bc::{BcValue, DirichletBC};
use fenris_assembly::config::MatType;
use fenris_assembly::form::{Form, KernelInfo};
use fenris_assembly::integral::IntegralKind;
use fenris_assembly::nalgebra::DVector;
use fenris_assembly::procedural::LEFT_MARKER;
use fenris_assembly::proptest::nodal_values;
use fenris_assembly::space::SpaceView;
use fenris_assembly::tensor::Tensor;
use fenris_assembly::{assemble, make_assembler, AssemblyError, AssemblyOptions};
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use proptest::prelude::*;
use std::sync::Arc;

fn laplace_form(interval: &Interval) -> Form<f64> {
    interval
        .bilinear()
        .with_kernel(compiled("cell", vec![0, 0], LaplaceKernel { block_size: 1 }))
}

#[test]
fn repeated_passes_give_identical_results() {
    let interval = Interval::new(6);
    let form = laplace_form(&interval).with_kernel(compiled("cell", vec![0, 0], MassKernel));
    let mut assembler = make_assembler(&form, None, None, &AssemblyOptions::default()).unwrap();
    assert_eq!(assembler.rank(), 2);
    let first = assembler.assemble().unwrap().as_matrix().unwrap().to_dense();
    let second = assembler.assemble().unwrap().as_matrix().unwrap().to_dense();
    assert_eq!(first, second);
    assert!(assembler.tensor().as_matrix().unwrap().is_assembled());
}

#[test]
fn prepared_loops_describe_each_kernel() {
    let interval = Interval::new(3);
    let form = laplace_form(&interval)
        .with_kernel(compiled("exterior_facet", vec![0, 0], ConstantKernel(1.0)))
        .with_kernel(compiled("interior_facet", vec![0, 0], ConstantKernel(1.0)));
    let assembler = make_assembler(&form, None, None, &AssemblyOptions::default()).unwrap();
    let loops = assembler.loops();
    assert_eq!(loops.len(), 3);
    assert_eq!(loops[0].kernel_name(), "laplace");
    assert_eq!(loops[0].integral_kind(), IntegralKind::Cell);
    assert_eq!(loops[0].iteration_set().len(), 3);
    assert_eq!(loops[1].integral_kind(), IntegralKind::ExteriorFacet);
    assert_eq!(loops[1].iteration_set().len(), 2);
    assert_eq!(loops[2].iteration_set().len(), 2);
    assert_eq!(loops[2].target_block(), vec![0, 0]);
}

#[test]
fn coefficient_updates_are_seen_by_later_passes() {
    let interval = Interval::new(4);
    let f = interval.function("f", DVector::from_element(5, 1.0));
    let form = interval
        .functional()
        .with_coefficient(f.clone())
        .with_kernel(compiled_with(
            KernelInfo::new("cell").with_coefficients(vec![0]),
            vec![],
            Arc::new(FunctionalKernel),
        ));
    let mut assembler = make_assembler(&form, None, None, &AssemblyOptions::default()).unwrap();
    let value = assembler.assemble().unwrap().as_scalar().unwrap();
    assert_scalar_eq!(value, 1.0, comp = abs, tol = 1e-12);

    f.write()[0].fill(3.0);
    let value = assembler.assemble().unwrap().as_scalar().unwrap();
    assert_scalar_eq!(value, 3.0, comp = abs, tol = 1e-12);
}

#[test]
fn boundary_conditions_can_be_swapped_between_passes() {
    let interval = Interval::new(4);
    let form = laplace_form(&interval);
    let view = SpaceView::whole(Arc::clone(&interval.space));
    let left = vec![DirichletBC::homogeneous(view.clone(), vec![0])];
    let right = vec![DirichletBC::homogeneous(view, vec![4])];

    let mut assembler = make_assembler(&form, None, Some(&left), &AssemblyOptions::default()).unwrap();
    let constrained = assembler.assemble().unwrap().as_matrix().unwrap().to_dense();
    assert_eq!(constrained[(0, 0)], 1.0);
    assert_eq!(constrained[(0, 1)], 0.0);

    assembler.set_bcs(right).unwrap();
    let swapped = assembler.assemble().unwrap().as_matrix().unwrap().to_dense();
    assert_scalar_eq!(swapped[(0, 0)], 4.0, comp = abs, tol = 1e-12);
    assert_eq!(swapped[(4, 4)], 1.0);
    assert_eq!(swapped[(3, 4)], 0.0);

    assembler.set_bcs(vec![]).unwrap();
    let unconstrained = assembler.assemble().unwrap().as_matrix().unwrap().to_dense();
    assert_matrix_eq!(unconstrained, expected_laplacian(4), comp = abs, tol = 1e-12);
}

#[test]
fn collected_operations_follow_pass_order() {
    let interval = Interval::new(3);
    let form = laplace_form(&interval).with_kernel(compiled("cell", vec![0, 0], MassKernel));
    let bcs = [DirichletBC::homogeneous(SpaceView::whole(Arc::clone(&interval.space)), vec![0])];
    let assembler = make_assembler(&form, None, Some(&bcs), &AssemblyOptions::default()).unwrap();
    let operations = assembler.collect().unwrap();
    assert_eq!(operations.len(), 5);
    assert!(matches!(operations[0], AssemblyOperation::Zero));
    assert!(matches!(operations[1], AssemblyOperation::Accumulate(_)));
    assert!(matches!(operations[2], AssemblyOperation::Accumulate(_)));
    assert!(matches!(&operations[3], AssemblyOperation::ApplyBcs(bcs) if bcs.len() == 1));
    assert!(matches!(operations[4], AssemblyOperation::Finalize));

    let without_bcs = make_assembler(&form, None, None, &AssemblyOptions::default())
        .unwrap()
        .collect()
        .unwrap();
    assert_eq!(without_bcs.len(), 4);
}

#[test]
fn replaying_collected_operations_matches_assemble() {
    let interval = Interval::new(5);
    let form = laplace_form(&interval).with_kernel(compiled("cell", vec![0, 0], MassKernel));
    let bcs = [DirichletBC::homogeneous(SpaceView::whole(Arc::clone(&interval.space)), vec![0, 5])];
    for mat_type in [MatType::Monolithic, MatType::Nested] {
        let options = AssemblyOptions::default().with_mat_type(mat_type);
        let expected = assemble(&form, None, Some(&bcs), &options).unwrap();

        let mut assembler = make_assembler(&form, None, Some(&bcs), &options).unwrap();
        let operations = assembler.collect().unwrap();
        // Replaying twice must not accumulate on top of the previous result
        execute_all(&operations, assembler.tensor_mut()).unwrap();
        execute_all(&operations, assembler.tensor_mut()).unwrap();
        let replayed = assembler.into_tensor();
        let replayed = replayed.as_matrix().unwrap();
        assert!(replayed.is_assembled());
        assert_eq!(replayed.to_dense(), expected.as_matrix().unwrap().to_dense());
    }
}

#[test]
fn collected_vector_operations_without_bcs() {
    let interval = Interval::new(4);
    let f = interval.function("f", DVector::from_element(5, 2.0));
    let form = interval
        .linear()
        .with_coefficient(f)
        .with_kernel(compiled_with(
            KernelInfo::new("cell").with_coefficients(vec![0]),
            vec![0],
            Arc::new(LoadKernel),
        ));
    let mut assembler = make_assembler(&form, None, None, &AssemblyOptions::default()).unwrap();
    let operations = assembler.collect().unwrap();
    execute_all(&operations, assembler.tensor_mut()).unwrap();
    let b = assembler.tensor().as_vector().unwrap().to_vector();
    assert_scalar_eq!(b.sum(), 2.0, comp = abs, tol = 1e-12);
}

#[test]
fn vector_assembler_keeps_boundary_conditions_off_the_tensor() {
    let interval = Interval::new(3);
    let load = interval
        .linear()
        .with_kernel(compiled("cell", vec![0], ConstantKernel(1.0)));
    let bcs = [DirichletBC::new(
        SpaceView::whole(Arc::clone(&interval.space)),
        BcValue::Constant(7.0),
        vec![3],
    )];
    let mut assembler = make_assembler(&load, None, Some(&bcs), &AssemblyOptions::default()).unwrap();
    assert_eq!(assembler.bcs().len(), 1);
    assert!(assembler.tensor().bcs().is_empty());
    for _ in 0..2 {
        let b = assembler.assemble().unwrap().as_vector().unwrap().to_vector();
        assert_eq!(b, DVector::from_vec(vec![1.0, 2.0, 2.0, 7.0]));
    }
}

#[test]
fn assemblers_can_be_moved_to_another_thread() {
    let interval = Interval::new(4);
    let form = laplace_form(&interval);
    let mut assembler = make_assembler(&form, None, None, &AssemblyOptions::default()).unwrap();
    let matrix = std::thread::spawn(move || assembler.assemble().unwrap().as_matrix().unwrap().to_dense())
        .join()
        .unwrap();
    assert_matrix_eq!(matrix, expected_laplacian(4), comp = abs, tol = 1e-12);
}

#[test]
fn collect_rejects_unsupported_configurations() {
    let interval = Interval::new(3);
    let view = SpaceView::whole(Arc::clone(&interval.space));

    let load = interval
        .linear()
        .with_kernel(compiled("cell", vec![0], ConstantKernel(1.0)));
    let bcs = [DirichletBC::new(view.clone(), BcValue::Constant(1.0), vec![0])];
    let assembler = make_assembler(&load, None, Some(&bcs), &AssemblyOptions::default()).unwrap();
    assert!(matches!(
        assembler.collect(),
        Err(AssemblyError::UnsupportedInCollectMode { .. })
    ));

    let form = laplace_form(&interval);
    let unresolved = [DirichletBC::on_boundary(
        view,
        BcValue::Constant(0.0),
        Arc::clone(&interval.topology),
        vec![LEFT_MARKER],
    )];
    let assembler = make_assembler(&form, None, Some(&unresolved), &AssemblyOptions::default()).unwrap();
    assert!(matches!(
        assembler.collect(),
        Err(AssemblyError::UnsupportedInCollectMode { .. })
    ));
    // Resolving the nodes first makes the condition collectable
    let resolved = [unresolved[0].resolve().unwrap()];
    let assembler = make_assembler(&form, None, Some(&resolved), &AssemblyOptions::default()).unwrap();
    assert!(assembler.collect().is_ok());

    let matfree = AssemblyOptions::default().with_mat_type(MatType::MatrixFree);
    let assembler = make_assembler(&form, None, None, &matfree).unwrap();
    assert!(matches!(assembler.collect(), Err(AssemblyError::InvalidOptions(_))));

    let inverse = AssemblyOptions::default().with_inverse(true);
    let mass = interval
        .bilinear()
        .with_kernel(compiled("cell", vec![0, 0], MassKernel));
    let assembler = make_assembler(&mass, None, None, &inverse).unwrap();
    assert!(matches!(assembler.collect(), Err(AssemblyError::InvalidOptions(_))));
}

#[test]
fn collect_rejects_ambiguous_mixed_boundary_conditions() {
    let interval = Interval::new(3);
    let mixed = interval.mixed_space();
    let form = Form::new(vec![Arc::clone(&mixed), Arc::clone(&mixed)], Arc::clone(&interval.domain))
        .with_kernel(compiled("cell", vec![0, 0], MassKernel));
    let bcs = [DirichletBC::homogeneous(SpaceView::whole(mixed), vec![0])];
    let mut assembler = make_assembler(&form, None, Some(&bcs), &AssemblyOptions::default()).unwrap();
    assert!(matches!(
        assembler.collect(),
        Err(AssemblyError::AmbiguousBoundaryCondition { num_blocks: 2, .. })
    ));
    assert!(matches!(
        assembler.assemble(),
        Err(AssemblyError::AmbiguousBoundaryCondition { .. })
    ));
}

#[test]
fn matrix_free_assembler_only_marks_operator_assembled() {
    let interval = Interval::new(3);
    let form = laplace_form(&interval);
    let options = AssemblyOptions::default().with_mat_type(MatType::MatrixFree);
    let mut assembler = make_assembler(&form, None, None, &options).unwrap();
    assert_eq!(assembler.options(), &options);
    assert!(!assembler.tensor().as_implicit().unwrap().is_assembled());
    assembler.assemble().unwrap();
    assert!(assembler.tensor().as_implicit().unwrap().is_assembled());
}

#[test]
fn scalar_operations_replay_from_zero() {
    let interval = Interval::new(4);
    let form = interval
        .functional()
        .with_kernel(compiled("cell", vec![], ConstantKernel(0.5)));
    let assembler = make_assembler(&form, None, None, &AssemblyOptions::default()).unwrap();
    let operations = assembler.collect().unwrap();
    let mut tensor = Tensor::Scalar(100.0);
    execute_all(&operations, &mut tensor).unwrap();
    assert_eq!(tensor.as_scalar(), Some(2.0));
}

proptest! {
    #[test]
    fn replayed_vector_assembly_tracks_coefficient(first in nodal_values(7), second in nodal_values(7)) {
        let interval = Interval::new(6);
        let f = interval.function("f", first);
        let form = interval
            .linear()
            .with_coefficient(f.clone())
            .with_kernel(compiled_with(
                KernelInfo::new("cell").with_coefficients(vec![0]),
                vec![0],
                Arc::new(LoadKernel),
            ));
        let mut assembler = make_assembler(&form, None, None, &AssemblyOptions::default()).unwrap();
        let operations = assembler.collect().unwrap();
        execute_all(&operations, assembler.tensor_mut()).unwrap();

        f.write()[0].copy_from(&second);
        execute_all(&operations, assembler.tensor_mut()).unwrap();
        let replayed = assembler.tensor().as_vector().unwrap().to_vector();

        let fresh = interval.function("g", second);
        let reference = interval
            .linear()
            .with_coefficient(fresh)
            .with_kernel(compiled_with(
                KernelInfo::new("cell").with_coefficients(vec![0]),
                vec![0],
                Arc::new(LoadKernel),
            ));
        let expected = assemble(&reference, None, None, &AssemblyOptions::default())
            .unwrap()
            .as_vector()
            .unwrap()
            .to_vector();
        prop_assert_eq!(replayed, expected);
    }
}
