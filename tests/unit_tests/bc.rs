use crate::unit_tests::fixtures::{
    compiled, expected_laplacian, ConstantKernel, ExtrudedInterval, Interval, LaplaceKernel,
};
use fenris_assembly::bc::{apply, apply_to_matrix, apply_to_vector, BcNodes, BcValue, DirichletBC};
use fenris_assembly::config::MatType;
use fenris_assembly::form::Form;
use fenris_assembly::nalgebra::{DMatrix, DVector};
use fenris_assembly::procedural::{LEFT_MARKER, RIGHT_MARKER};
use fenris_assembly::proptest::node_subset;
use fenris_assembly::space::{FunctionSpace, SpaceView};
use fenris_assembly::tensor::{BlockVector, ImplicitMatrix, Tensor};
use fenris_assembly::{assemble, AssemblyError, AssemblyOptions};
use matrixcompare::assert_matrix_eq;
use proptest::prelude::*;
use std::sync::Arc;

fn laplacian(interval: &Interval) -> Tensor<f64> {
    let form = interval
        .bilinear()
        .with_kernel(compiled("cell", vec![0, 0], LaplaceKernel { block_size: 1 }));
    assemble(&form, None, None, &AssemblyOptions::default()).unwrap()
}

fn constrained(mut matrix: DMatrix<f64>, dofs: &[usize]) -> DMatrix<f64> {
    for &dof in dofs {
        matrix.row_mut(dof).fill(0.0);
        matrix.column_mut(dof).fill(0.0);
        matrix[(dof, dof)] = 1.0;
    }
    matrix
}

#[test]
fn explicit_nodes_are_sorted_and_unique() {
    let interval = Interval::new(4);
    let bc = DirichletBC::<f64>::homogeneous(SpaceView::whole(Arc::clone(&interval.space)), vec![3, 0, 3]);
    assert!(bc.is_resolved());
    assert_eq!(bc.resolved_nodes().unwrap(), vec![0, 3]);
    assert_eq!(bc.constrained_dofs().unwrap(), vec![0, 3]);
}

#[test]
fn out_of_range_nodes_are_rejected() {
    let interval = Interval::new(2);
    let bc = DirichletBC::<f64>::homogeneous(SpaceView::whole(Arc::clone(&interval.space)), vec![3]);
    assert!(matches!(bc.resolved_nodes(), Err(AssemblyError::MapMismatch { .. })));
}

#[test]
fn boundary_markers_resolve_to_facet_nodes() {
    let interval = Interval::new(4);
    let view = SpaceView::whole(Arc::clone(&interval.space));
    let topology = Arc::clone(&interval.topology);
    let left = DirichletBC::on_boundary(view.clone(), BcValue::Constant(1.0), Arc::clone(&topology), vec![LEFT_MARKER]);
    assert!(!left.is_resolved());
    assert_eq!(left.resolved_nodes().unwrap(), vec![0]);

    let both = DirichletBC::on_boundary(view.clone(), BcValue::Constant(1.0), topology, vec![LEFT_MARKER, RIGHT_MARKER]);
    let resolved = both.resolve().unwrap();
    assert!(resolved.is_resolved());
    assert_eq!(resolved.nodes(), &BcNodes::Explicit(vec![0, 4]));
    assert_eq!(resolved.value(), &BcValue::Constant(1.0));
    assert_eq!(resolved.space(), &view);
}

#[test]
fn boundary_markers_on_extruded_mesh_resolve_to_whole_columns() {
    let mesh = ExtrudedInterval::new(2, 3);
    let view = SpaceView::whole(Arc::clone(&mesh.space));
    let bc = DirichletBC::<f64>::on_boundary(
        view,
        BcValue::Constant(0.0),
        Arc::clone(&mesh.topology),
        vec![RIGHT_MARKER],
    );
    let expected: Vec<_> = (0..=3).map(|level| mesh.node(2, level)).collect();
    assert_eq!(bc.resolved_nodes().unwrap(), expected);
}

#[test]
fn component_views_constrain_single_component() {
    let interval = Interval::new(2);
    let space = interval.vector_space("V", 3);
    let whole = DirichletBC::<f64>::homogeneous(SpaceView::whole(Arc::clone(&space)), vec![1]);
    assert_eq!(whole.constrained_dofs().unwrap(), vec![3, 4, 5]);
    let component = DirichletBC::<f64>::homogeneous(SpaceView::whole(space).component(2), vec![0, 1]);
    assert_eq!(component.constrained_dofs().unwrap(), vec![2, 5]);
}

#[test]
fn unindexed_mixed_space_is_ambiguous() {
    let interval = Interval::new(2);
    let mixed = interval.mixed_space();
    let bc = DirichletBC::<f64>::homogeneous(SpaceView::whole(Arc::clone(&mixed)), vec![0]);
    match bc.constrained_dofs() {
        Err(AssemblyError::AmbiguousBoundaryCondition { space, num_blocks }) => {
            assert_eq!(space, "W");
            assert_eq!(num_blocks, 2);
        }
        other => panic!("expected ambiguous boundary condition, got {other:?}"),
    }
    let mut vector = BlockVector::<f64>::zeros(&mixed);
    assert!(apply_to_vector(&mut vector, &[bc]).is_err());
}

#[test]
fn matrix_rows_and_columns_are_replaced_by_identity() {
    let interval = Interval::new(4);
    let mut tensor = laplacian(&interval);
    let bc = DirichletBC::homogeneous(SpaceView::whole(Arc::clone(&interval.space)), vec![0, 4]);
    apply(&mut tensor, &[bc]).unwrap();
    let expected = constrained(expected_laplacian(4), &[0, 4]);
    assert_matrix_eq!(tensor.as_matrix().unwrap().to_dense(), expected, comp = abs, tol = 1e-12);
}

#[test]
fn vector_entries_are_overwritten_with_values() {
    let interval = Interval::new(3);
    let mut vector = BlockVector::from_blocks(vec![DVector::from_element(4, 5.0)]);
    let view = SpaceView::whole(Arc::clone(&interval.space));
    let nodal = DVector::from_vec(vec![10.0, 20.0, 30.0, 40.0]);
    let bcs = [
        DirichletBC::new(view.clone(), BcValue::Constant(-1.0), vec![0]),
        DirichletBC::new(view, BcValue::Nodal(nodal), vec![2, 3]),
    ];
    apply_to_vector(&mut vector, &bcs).unwrap();
    assert_eq!(vector.to_vector(), DVector::from_vec(vec![-1.0, 5.0, 30.0, 40.0]));
}

#[test]
fn short_nodal_values_are_rejected() {
    let interval = Interval::new(3);
    let mut vector = BlockVector::<f64>::zeros(&interval.space);
    let view = SpaceView::whole(Arc::clone(&interval.space));
    let bc = DirichletBC::new(view, BcValue::Nodal(DVector::zeros(2)), vec![3]);
    assert!(matches!(
        apply_to_vector(&mut vector, &[bc]),
        Err(AssemblyError::InvalidTensorTarget { .. })
    ));
}

#[test]
fn mixed_boundary_conditions_only_touch_diagonal_block() {
    let interval = Interval::new(3);
    let mixed = interval.mixed_space();
    let mut form = Form::new(vec![Arc::clone(&mixed), Arc::clone(&mixed)], Arc::clone(&interval.domain));
    for i in 0..2 {
        for j in 0..2 {
            form = form.with_kernel(compiled("cell", vec![i, j], ConstantKernel(1.0)));
        }
    }
    for mat_type in [MatType::Monolithic, MatType::Nested] {
        let options = AssemblyOptions::default().with_mat_type(mat_type);
        let mut tensor = assemble(&form, None, None, &options).unwrap();
        let before = tensor.as_matrix().unwrap().clone();

        let bc = DirichletBC::homogeneous(SpaceView::sub(Arc::clone(&mixed), 1), vec![0]);
        apply(&mut tensor, &[bc]).unwrap();
        let after = tensor.as_matrix().unwrap();

        assert_eq!(after.block_to_dense(0, 0), before.block_to_dense(0, 0));
        assert_eq!(after.block_to_dense(0, 1), before.block_to_dense(0, 1));
        assert_eq!(after.block_to_dense(1, 0), before.block_to_dense(1, 0));
        let expected = constrained(before.block_to_dense(1, 1), &[0]);
        assert_eq!(after.block_to_dense(1, 1), expected);
    }
}

#[test]
fn scalar_and_implicit_tensors_ignore_boundary_conditions() {
    let interval = Interval::new(2);
    let bc = DirichletBC::homogeneous(SpaceView::whole(Arc::clone(&interval.space)), vec![0]);
    let mut scalar = Tensor::Scalar(1.5);
    apply(&mut scalar, &[bc.clone()]).unwrap();
    assert_eq!(scalar.as_scalar(), Some(1.5));

    let mut implicit = Tensor::Implicit(ImplicitMatrix::new("A", &interval.space, &interval.space));
    apply(&mut implicit, &[bc]).unwrap();
}

#[test]
fn boundary_conditions_on_missing_blocks_are_rejected() {
    let interval = Interval::new(2);
    let mut tensor = laplacian(&interval);
    let mixed = interval.mixed_space();
    let bc = DirichletBC::homogeneous(SpaceView::sub(mixed, 1), vec![0]);
    match &mut tensor {
        Tensor::Matrix(matrix) => assert!(matches!(
            apply_to_matrix(matrix, &[bc]),
            Err(AssemblyError::InvalidTensorTarget { .. })
        )),
        _ => panic!("expected a matrix"),
    }
}

proptest! {
    #[test]
    fn applying_boundary_conditions_is_idempotent(nodes in node_subset(7)) {
        let interval = Interval::new(6);
        let mut tensor = laplacian(&interval);
        let space: Arc<FunctionSpace> = Arc::clone(&interval.space);
        let bcs = [DirichletBC::homogeneous(SpaceView::whole(space), nodes.clone())];
        apply(&mut tensor, &bcs).unwrap();
        let once = tensor.as_matrix().unwrap().to_dense();
        apply(&mut tensor, &bcs).unwrap();
        let twice = tensor.as_matrix().unwrap().to_dense();
        prop_assert_eq!(&once, &twice);
        let expected = constrained(expected_laplacian(6), &nodes);
        prop_assert!((&once - &expected).norm() < 1e-9);
    }
}
