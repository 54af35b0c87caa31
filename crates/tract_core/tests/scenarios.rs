mod common;

use common::*;
use std::collections::HashSet;
use std::sync::Arc;
use tract_core::odf::{FiberOrientationResolver, PeakPolicy};
use tract_core::params::TrackingParameters;
use tract_core::recon::{reconstruct_field, OdfVolume};
use tract_core::roi::{RegionConstraintSet, RegionRole};
use tract_core::tessellation::Tessellation;
use tract_core::traits::Vec3;
use tract_core::tracking::canonicalize;
use tract_core::{TrackingOrchestrator, VolumeShape};

#[test]
fn straight_field_yields_one_full_length_line() {
    let field = straight_field(10);
    let roi = center_seed(&field);
    let params = TrackingParameters {
        center_seed: 1,
        ..fixed_params()
    };
    let mut orchestrator = TrackingOrchestrator::new(field, roi, params).expect("orchestrator");
    let collection = orchestrator.run(1).expect("run");

    assert_eq!(collection.len(), 1);
    let line = points(&collection.tracts()[0]);
    assert_eq!(line.len(), 10);
    for (i, p) in line.iter().enumerate() {
        assert_eq!(*p, Vec3::new(i as f32, 5.0, 5.0));
    }
}

#[test]
fn exclusion_region_bounds_or_rejects_the_trace() {
    let field = straight_field(10);
    let mut roi = center_seed(&field);
    let block: Vec<[i32; 3]> = (6..10)
        .flat_map(|x| (0..10).flat_map(move |y| (0..10).map(move |z| [x, y, z])))
        .collect();
    roi.set_region(RegionRole::Roa, "x beyond 5", &block, 1.0)
        .expect("roa");
    let params = TrackingParameters {
        center_seed: 1,
        stop_by_tract: 0,
        termination_count: 10,
        ..fixed_params()
    };
    let mut orchestrator = TrackingOrchestrator::new(field, roi, params).expect("orchestrator");
    let job = orchestrator.start(1).expect("job");
    while job.is_running() {
        std::thread::yield_now();
    }
    assert_eq!(job.seed_count(), 10);
    let collection = job.join().expect("join");
    for tract in collection.iter() {
        assert!(points(tract).iter().all(|p| p.x <= 5.0));
    }
    assert!(collection.is_empty());
    assert!(orchestrator.report().contains("An ROA was placed at x beyond 5."));
}

#[test]
fn two_orthogonal_lobes_resolve_to_two_peaks() {
    let tess = Tessellation::icosahedron(3).expect("tessellation");
    let (x, z) = (Vec3::x(), Vec3::z());
    let odf = gaussian_odf(&tess, &[x, z], 0.2, 0.4);
    let expected: HashSet<usize> = [tess.nearest_vertex(&x), tess.nearest_vertex(&z)]
        .into_iter()
        .collect();

    for policy in [PeakPolicy::LocalMaximum, PeakPolicy::ShapeResolving] {
        let resolver = FiberOrientationResolver::new(&tess, policy, 3).expect("resolver");
        let peaks = resolver.resolve(&odf).expect("peaks");
        assert_eq!(peaks.len(), 2, "{policy:?}");
        let found: HashSet<usize> = peaks.iter().map(|p| p.direction_index).collect();
        assert_eq!(found, expected, "{policy:?}");
        let (a, b) = (peaks[0].strength, peaks[1].strength);
        assert!(a >= b);
        assert!((a - b).abs() < 0.05 * a, "{policy:?}: {a} vs {b}");
    }
}

#[test]
fn seed_budget_counts_attempts_not_tracts() {
    let field = straight_field(10);
    let roi = RegionConstraintSet::new(field.shape());
    let params = TrackingParameters {
        stop_by_tract: 0,
        termination_count: 1000,
        ..fixed_params()
    };
    let mut orchestrator = TrackingOrchestrator::new(field, roi, params).expect("orchestrator");
    let job = orchestrator.start(4).expect("job");
    while job.is_running() {
        std::thread::yield_now();
    }
    let progress = job.progress();
    assert_eq!(progress.seed_count, 1000);
    assert!(progress.tract_count <= 1000);
    let collection = job.join().expect("join");
    assert_eq!(collection.len(), progress.tract_count);
}

#[test]
fn single_thread_runs_are_reproducible() {
    let run = || {
        let field = helix_field(12);
        let roi = RegionConstraintSet::new(field.shape());
        let params = TrackingParameters {
            threshold: 0.3,
            cull_cos_angle: 1.0,
            step_size: 0.0,
            min_length: 3.0,
            stop_by_tract: 0,
            termination_count: 200,
            ..fixed_params()
        };
        let mut orchestrator =
            TrackingOrchestrator::new(field, roi, params).expect("orchestrator");
        orchestrator.run(1).expect("run").into_tracts()
    };
    let first = run();
    let second = run();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn accepted_streamlines_are_canonical() {
    let field = helix_field(12);
    let roi = RegionConstraintSet::new(field.shape());
    let params = TrackingParameters {
        threshold: 0.3,
        min_length: 3.0,
        stop_by_tract: 0,
        termination_count: 100,
        ..fixed_params()
    };
    let mut orchestrator = TrackingOrchestrator::new(field, roi, params).expect("orchestrator");
    for tract in orchestrator.run(2).expect("run").into_tracts() {
        let mut again = tract.clone();
        canonicalize(&mut again);
        assert_eq!(again, tract);
    }
}

#[test]
fn reconstructed_field_can_be_tracked() {
    let tess = Tessellation::icosahedron(2).expect("tessellation");
    let shape = VolumeShape::new(8, 8, 8);
    let odf = gaussian_odf(&tess, &[Vec3::x()], 0.1, 0.3);
    let samples: Vec<f32> = (0..shape.size()).flat_map(|_| odf.iter().copied()).collect();
    let volume = OdfVolume::new(shape, [1.0; 3], tess.half_vertices_count(), samples)
        .expect("volume");
    let (field, _) =
        reconstruct_field(&volume, tess, PeakPolicy::LocalMaximum, 3).expect("reconstruction");
    let field = Arc::new(field);
    assert_eq!(field.shape(), shape);

    let roi = center_seed(&field);
    let params = TrackingParameters {
        center_seed: 1,
        ..fixed_params()
    };
    let mut orchestrator = TrackingOrchestrator::new(field, roi, params).expect("orchestrator");
    let collection = orchestrator.run(1).expect("run");
    assert_eq!(collection.len(), 1);
    let line = points(&collection.tracts()[0]);
    assert_eq!(line.len(), 8);
    for (i, p) in line.iter().enumerate() {
        assert!((p - Vec3::new(i as f32, 4.0, 4.0)).norm() < 1e-3, "{p:?}");
    }
}

#[test]
fn parameter_code_survives_a_round_trip() {
    let mut params = TrackingParameters {
        threshold: 0.125,
        step_size: 0.75,
        smooth_fraction: 0.2,
        min_length: 10.0,
        max_length: 120.0,
        termination_count: 5000,
        tracking_method: 1,
        initial_direction: 2,
        tip_iteration: 16,
        ..TrackingParameters::default()
    };
    params.set_turning_angle_degrees(45.0);
    let code = params.code();
    assert_eq!(TrackingParameters::from_code(&code).expect("decode"), params);
    assert_eq!(
        TrackingParameters::from_code(&TrackingParameters::default().code()).expect("decode"),
        TrackingParameters::default()
    );
}

#[test]
fn refine_reseeds_from_the_surviving_streamlines() {
    let field = straight_field(10);
    let roi = center_seed(&field);
    let params = TrackingParameters {
        center_seed: 1,
        stop_by_tract: 0,
        termination_count: 3,
        ..fixed_params()
    };
    let mut orchestrator = TrackingOrchestrator::new(field, roi, params).expect("orchestrator");
    let mut collection = orchestrator.run(1).expect("run");
    assert_eq!(collection.len(), 3);

    orchestrator.refine(&mut collection, 1, 2).expect("refine");
    assert_eq!(orchestrator.roi().seed_count(), 10);
    assert_eq!(collection.len(), 3);
    assert_eq!(collection.deleted_count(), 0);
    for tract in collection.iter() {
        let line = points(tract);
        assert_eq!(line.len(), 10);
        for (i, p) in line.iter().enumerate() {
            assert_eq!(*p, Vec3::new(i as f32, 5.0, 5.0));
        }
    }
}

#[test]
fn refine_fails_when_trimming_leaves_nothing() {
    let field = straight_field(10);
    let roi = center_seed(&field);
    let params = TrackingParameters {
        center_seed: 1,
        ..fixed_params()
    };
    let mut orchestrator = TrackingOrchestrator::new(field, roi, params).expect("orchestrator");
    let mut collection = orchestrator.run(1).expect("run");
    assert_eq!(collection.len(), 1);
    let err = orchestrator
        .refine(&mut collection, 1, 1)
        .expect_err("a lone streamline owns every voxel it visits");
    assert!(format!("{err}").contains("refinement left no streamline"));
    assert_eq!(orchestrator.roi().seed_count(), 1);
}

#[test]
fn pruning_keeps_mutually_supported_ends() {
    let field = straight_field(10);
    let mut roi = RegionConstraintSet::new(field.shape());
    roi.set_region(RegionRole::Seed, "two rows", &[[5, 2, 5], [5, 7, 5]], 1.0)
        .expect("seeds");
    let params = TrackingParameters {
        center_seed: 1,
        stop_by_tract: 0,
        termination_count: 4,
        tip_iteration: 2,
        ..fixed_params()
    };
    let mut orchestrator = TrackingOrchestrator::new(field, roi, params).expect("orchestrator");
    let mut collection = orchestrator.run(1).expect("run");
    assert_eq!(collection.len(), 4);
    assert_eq!(collection.deleted_count(), 0);

    // each row holds two identical streamlines whose ends support each other
    assert_eq!(orchestrator.apply_tip(&mut collection), 0);
    assert_eq!(collection.len(), 4);
}
