//! Integration tests for the residency planner.
//!
//! Every test runs one thread per mesh rank over an in-process world, so the collectives
//! are real blocking exchanges between ranks.

mod common;

use burn_dtensor::comm::recorder::{CollectiveRecord, RecordingCollective};
use burn_dtensor::comm::threaded::LocalWorld;
use burn_dtensor::sharding::PartitionSpec;
use burn_dtensor::{CollectiveError, DistributedError, ReshardOp, ResidencyPlanner};
use common::{arange, expected_shard, mesh, spec};
use ndarray::array;
use rstest::rstest;

#[test]
fn test_replicated_to_2d_split_gives_quadrants() {
    let mesh = mesh(&[2, 2]);
    let global = arange(&[4, 4]);
    let source = PartitionSpec::replicated(mesh.clone(), [4, 4]);
    let target = spec(&mesh, &[4, 4], &[(0, &[0]), (1, &[1])]);

    let shards = LocalWorld::run(4, |comm| {
        let planner = ResidencyPlanner::new(comm);
        planner.reshard(&global, &source, &target).unwrap()
    });

    assert_eq!(shards[0], array![[0, 1], [4, 5]].into_dyn());
    assert_eq!(shards[1], array![[2, 3], [6, 7]].into_dyn());
    assert_eq!(shards[2], array![[8, 9], [12, 13]].into_dyn());
    assert_eq!(shards[3], array![[10, 11], [14, 15]].into_dyn());
}

#[test]
fn test_2d_split_back_to_replicated_restores_matrix() {
    let mesh = mesh(&[2, 2]);
    let global = arange(&[4, 4]);
    let replicated = PartitionSpec::replicated(mesh.clone(), [4, 4]);
    let split = spec(&mesh, &[4, 4], &[(0, &[0]), (1, &[1])]);

    let results = LocalWorld::run(4, |comm| {
        let planner = ResidencyPlanner::new(comm);
        let local = planner.reshard(&global, &replicated, &split).unwrap();
        let restored = planner.reshard(&local, &split, &replicated).unwrap();
        let global_view = planner.to_global(&restored, &replicated).unwrap();
        (restored, global_view)
    });

    for (restored, global_view) in results {
        assert_eq!(restored, global);
        assert_eq!(global_view, global);
    }
}

#[test]
fn test_sharded_vector_to_replicated_is_one_all_gather() {
    let mesh = mesh(&[4]);
    let global = arange(&[8]);
    let source = spec(&mesh, &[8], &[(0, &[0])]);
    let target = PartitionSpec::replicated(mesh.clone(), [8]);

    let results = LocalWorld::run(4, |comm| {
        let planner = ResidencyPlanner::new(RecordingCollective::new(comm));
        let local = expected_shard(&global, &source, planner.rank());
        assert_eq!(local.len(), 2);

        let full = planner.reshard(&local, &source, &target).unwrap();
        (full, planner.collective().records())
    });

    for (full, records) in results {
        assert_eq!(full, global);
        assert_eq!(
            records,
            vec![CollectiveRecord::AllGather {
                ranks: vec![0, 1, 2, 3],
                dim: 0,
            }]
        );
    }
}

#[test]
fn test_axis_changing_dimension_is_one_all_to_all() {
    let mesh = mesh(&[2, 2]);
    let global = arange(&[4, 4]);
    let source = spec(&mesh, &[4, 4], &[(0, &[0])]);
    let target = spec(&mesh, &[4, 4], &[(1, &[0])]);

    let plan = ResidencyPlanner::new(LocalWorld::connect(1).remove(0))
        .plan(&source, &target)
        .unwrap();
    assert_eq!(
        plan.ops(),
        &[ReshardOp::AllToAll {
            axis: 0,
            gather_dim: 0,
            split_dim: 1,
        }]
    );

    let results = LocalWorld::run(4, |comm| {
        let planner = ResidencyPlanner::new(RecordingCollective::new(comm));
        let rank = planner.rank();
        let local = expected_shard(&global, &source, rank);

        let resharded = planner.reshard(&local, &source, &target).unwrap();

        assert_eq!(resharded, expected_shard(&global, &target, rank));
        planner.collective().records()
    });

    // Ranks 0 and 2 share column coordinate 0, ranks 1 and 3 share coordinate 1.
    for (rank, records) in results.into_iter().enumerate() {
        let column = rank % 2;
        assert_eq!(
            records,
            vec![CollectiveRecord::AllToAll {
                ranks: vec![column, column + 2],
                gather_dim: 0,
                split_dim: 1,
            }]
        );
    }
}

#[rstest]
#[case::replicated_to_2d(&[2, 2], &[4, 4], &[], &[(0, &[0][..]), (1, &[1])])]
#[case::axis_moves_dim(&[2, 2], &[4, 4], &[(0, &[0][..])], &[(1, &[0][..])])]
#[case::swapped_axes(&[2, 2], &[4, 4], &[(0, &[0][..]), (1, &[1])], &[(0, &[1][..]), (1, &[0])])]
#[case::multi_axis_split(&[2, 2], &[8, 4], &[(0, &[0, 1][..])], &[(0, &[0][..]), (1, &[1])])]
#[case::multi_axis_reorder(&[2, 2], &[8, 2], &[(0, &[0, 1][..])], &[(0, &[1, 0][..])])]
#[case::three_axes(&[2, 2, 2], &[4, 4, 4], &[(0, &[0][..]), (2, &[2])], &[(1, &[0][..]), (0, &[1])])]
#[case::uneven_mesh(&[2, 3], &[6, 6], &[(1, &[0, 1][..])], &[(0, &[1][..]), (1, &[0])])]
#[case::rank_3_tensor(&[2, 2], &[4, 4, 2], &[(0, &[1][..])], &[(2, &[0][..]), (1, &[1])])]
#[case::gather_only(&[4], &[8], &[(0, &[0][..])], &[])]
fn test_reshard_round_trip(
    #[case] mesh_shape: &[usize],
    #[case] shape: &[usize],
    #[case] source: &[(usize, &[usize])],
    #[case] target: &[(usize, &[usize])],
) {
    let mesh = mesh(mesh_shape);
    let global = arange(shape);
    let replicated = PartitionSpec::replicated(mesh.clone(), shape);
    let source = spec(&mesh, shape, source);
    let target = spec(&mesh, shape, target);

    LocalWorld::run(mesh.num_devices(), |comm| {
        let planner = ResidencyPlanner::new(comm);
        let rank = planner.rank();

        let local = planner.reshard(&global, &replicated, &source).unwrap();
        assert_eq!(local, expected_shard(&global, &source, rank));

        let resharded = planner.reshard(&local, &source, &target).unwrap();
        assert_eq!(resharded, expected_shard(&global, &target, rank));

        let back = planner.reshard(&resharded, &target, &source).unwrap();
        assert_eq!(back, local);

        assert_eq!(planner.to_global(&resharded, &target).unwrap(), global);
    });
}

#[test]
fn test_same_spec_is_a_no_op() {
    let mesh = mesh(&[2, 2]);
    let global = arange(&[4, 8]);
    let spec = spec(&mesh, &[4, 8], &[(1, &[1, 0])]);

    let results = LocalWorld::run(4, |comm| {
        let planner = ResidencyPlanner::new(RecordingCollective::new(comm));
        let local = expected_shard(&global, &spec, planner.rank());
        let same = planner.reshard(&local, &spec, &spec).unwrap();
        (local == same, planner.collective().records())
    });

    for (unchanged, records) in results {
        assert!(unchanged);
        assert!(records.is_empty());
    }
}

#[test]
fn test_incompatible_specs_fail_before_communicating() {
    let mesh = mesh(&[2]);
    let source = PartitionSpec::replicated(mesh.clone(), [4]);
    let target = spec(&mesh, &[8], &[(0, &[0])]);
    let planner = ResidencyPlanner::new(RecordingCollective::new(LocalWorld::connect(2).remove(0)));

    let err = planner.reshard(&arange(&[4]), &source, &target).unwrap_err();

    assert!(matches!(err, DistributedError::IncompatibleSpec(_)));
    assert!(planner.collective().records().is_empty());
}

#[test]
fn test_local_shape_must_match_source() {
    let mesh = mesh(&[2]);
    let source = spec(&mesh, &[4], &[(0, &[0])]);
    let target = PartitionSpec::replicated(mesh.clone(), [4]);
    let planner = ResidencyPlanner::new(RecordingCollective::new(LocalWorld::connect(2).remove(0)));

    let err = planner.reshard(&arange(&[4]), &source, &target).unwrap_err();

    assert_eq!(
        err,
        DistributedError::LocalShapeMismatch {
            expected: vec![2],
            got: vec![4],
        }
    );
    assert!(planner.collective().records().is_empty());
}

#[test]
fn test_lost_peer_is_a_collective_failure() {
    let mesh = mesh(&[2]);
    let source = spec(&mesh, &[4], &[(0, &[0])]);
    let target = PartitionSpec::replicated(mesh.clone(), [4]);
    let mut comms = LocalWorld::connect(2);
    drop(comms.pop());
    let planner = ResidencyPlanner::new(comms.remove(0));

    let err = planner
        .reshard(&array![0i64, 1].into_dyn(), &source, &target)
        .unwrap_err();

    assert_eq!(
        err,
        DistributedError::CollectiveFailure(CollectiveError::Disconnected { peer: 1 })
    );
}

#[test]
fn test_every_rank_derives_the_same_plan() {
    let mesh = mesh(&[2, 2, 2]);
    let source = spec(&mesh, &[8, 8], &[(0, &[2, 0])]);
    let target = spec(&mesh, &[8, 8], &[(1, &[0]), (0, &[1, 2])]);

    let plans = LocalWorld::run(8, |comm| {
        ResidencyPlanner::new(comm).plan(&source, &target).unwrap()
    });

    assert!(plans.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(!plans[0].is_empty());
}
