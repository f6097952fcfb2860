//! End-to-end solves on host-memory devices.

use approx::assert_abs_diff_eq;
use halopoisson::config::{
    BackendKind, ExchangePolicy, KernelVariant, Mode, SolverConfig, Tolerance, ToleranceSchedule,
};
use halopoisson::error::PoissonError;
use halopoisson::solver::cpu::CpuBackend;
use halopoisson::solver::{self, SolveStatus};

fn cpu(config: SolverConfig) -> SolverConfig {
    config.with_backend(BackendKind::Cpu)
}

#[test]
fn benchmark_runs_exactly_max_iter_without_checks() {
    let outcome = solver::solve(&cpu(SolverConfig::benchmark(50, 50, 2000))).unwrap();
    assert_eq!(outcome.iterations, 2000);
    assert_eq!(outcome.checks, 0);
    assert_eq!(outcome.status, SolveStatus::MaxIterReached);
    assert_eq!(outcome.final_diff, None);
    assert_eq!(outcome.tolerance, None);
    assert!(outcome.field.max_abs() > 0.0);
}

#[test]
fn worker_count_does_not_change_the_result() {
    let single = solver::solve(&cpu(SolverConfig::benchmark(64, 64, 300))).unwrap();
    for workers in [2, 4] {
        let split = solver::solve(&cpu(SolverConfig::benchmark(64, 64, 300).with_workers(workers))).unwrap();
        assert_eq!(split.workers, workers);
        assert_abs_diff_eq!(single.field.max_abs_diff(&split.field), 0.0, epsilon = 1e-12);
    }
}

#[test]
fn physics_mode_converges_below_scaled_tolerance() {
    let config = cpu(SolverConfig::physics(
        50,
        50,
        50_000,
        Tolerance::Scaled(ToleranceSchedule::new(1e-7, 50)),
    ))
    .with_workers(2);
    let outcome = solver::solve(&config).unwrap();
    assert!(outcome.converged(), "stopped with {:?}", outcome.status);
    assert_eq!(outcome.tolerance, Some(1e-7));
    assert!(outcome.final_diff.unwrap() < 1e-7);
    assert_eq!(outcome.iterations % config.check_interval, 0);
    assert_eq!(outcome.checks, outcome.iterations / config.check_interval);
    assert!(outcome.iterations < 50_000);
}

#[test]
fn single_worker_physics_converges_at_base_size() {
    let config = cpu(SolverConfig::physics(
        50,
        50,
        50_000,
        Tolerance::Scaled(ToleranceSchedule::new(1e-7, 50)),
    ));
    let outcome = solver::solve(&config).unwrap();
    assert_eq!(outcome.workers, 1);
    assert_eq!(outcome.status, SolveStatus::Converged);
    assert_eq!(outcome.tolerance, Some(1e-7));
    assert!(outcome.final_diff.unwrap() < 1e-7);
    assert!(outcome.iterations < 50_000);
}

#[test]
fn physics_mode_stops_at_budget_when_tolerance_is_out_of_reach() {
    let config = cpu(SolverConfig::physics(60, 60, 250, Tolerance::Absolute(1e-30)));
    let outcome = solver::solve(&config).unwrap();
    assert_eq!(outcome.status, SolveStatus::MaxIterReached);
    assert_eq!(outcome.iterations, 250);
    assert_eq!(outcome.checks, 2);
    assert!(outcome.final_diff.unwrap() >= 1e-30);
}

#[test]
fn larger_grids_get_tighter_tolerance() {
    let schedule = Tolerance::Scaled(ToleranceSchedule::default());
    let small = solver::solve(&cpu(SolverConfig::physics(50, 50, 100, schedule))).unwrap();
    let large = solver::solve(&cpu(SolverConfig::physics(100, 100, 100, schedule))).unwrap();
    assert!(large.tolerance.unwrap() < small.tolerance.unwrap());
    assert_abs_diff_eq!(large.tolerance.unwrap(), 2.5e-8, epsilon = 1e-20);
}

#[test]
fn outer_edges_stay_zero() {
    let outcome = solver::solve(&cpu(SolverConfig::benchmark(40, 60, 500).with_workers(3))).unwrap();
    assert!(outcome.field.edges_are_zero());
    assert_eq!(outcome.field.nx, 40);
    assert_eq!(outcome.field.ny, 60);
}

#[test]
fn host_staged_matches_direct_exchange() {
    let base = cpu(SolverConfig::benchmark(48, 96, 200).with_workers(3));
    let direct = solver::solve(&base.clone().with_exchange(ExchangePolicy::PreferPeer)).unwrap();
    let staged = solver::solve(&base.with_exchange(ExchangePolicy::HostStaged)).unwrap();
    assert_eq!(direct.peer_links, 2);
    assert_eq!(staged.peer_links, 0);
    assert_eq!(staged.staged_links, 2);
    assert!(direct.peer_rows > 0);
    assert_eq!(staged.peer_rows, 0);
    assert_eq!(direct.field, staged.field);
}

#[test]
fn isolated_device_falls_back_to_host_staging() {
    let config = cpu(SolverConfig::benchmark(32, 64, 50).with_workers(2));
    let outcome = solver::solve_with(&config, vec![CpuBackend::new(0), CpuBackend::isolated(1)]).unwrap();
    assert_eq!(outcome.peer_links, 0);
    assert_eq!(outcome.staged_links, 1);
    let reference = solver::solve(&config).unwrap();
    assert_eq!(outcome.field, reference.field);
}

#[test]
fn tiled_kernel_matches_reference_kernel() {
    let base = cpu(SolverConfig::benchmark(70, 54, 150).with_workers(2));
    let tiled = solver::solve(&base.clone().with_kernel(KernelVariant::Tiled)).unwrap();
    let reference = solver::solve(&base.with_kernel(KernelVariant::Reference)).unwrap();
    assert_abs_diff_eq!(tiled.field.max_abs_diff(&reference.field), 0.0, epsilon = 1e-12);
}

#[test]
fn zero_iteration_budget_returns_initial_field() {
    let mut config = cpu(SolverConfig::benchmark(20, 20, 0));
    config.mode = Mode::Physics;
    let outcome = solver::solve(&config).unwrap();
    assert_eq!(outcome.iterations, 0);
    assert_eq!(outcome.status, SolveStatus::MaxIterReached);
    assert_eq!(outcome.field.max_abs(), 0.0);
}

#[test]
fn configuration_errors_are_reported() {
    let cases = [
        SolverConfig::benchmark(2, 50, 10),
        SolverConfig::benchmark(50, 50, 10).with_workers(3),
        SolverConfig::benchmark(50, 50, 10).with_workers(0),
        SolverConfig::physics(50, 50, 10, Tolerance::Absolute(-1.0)),
        SolverConfig::physics(50, 50, 10, Tolerance::Scaled(ToleranceSchedule::new(1e-7, 0))),
    ];
    for config in cases {
        let result = solver::solve(&cpu(config.clone()));
        assert!(
            matches!(result, Err(PoissonError::Configuration(_))),
            "expected configuration error for {config:?}"
        );
    }
}

#[test]
fn device_count_must_match_workers() {
    let config = cpu(SolverConfig::benchmark(32, 32, 5).with_workers(2));
    let result = solver::solve_with(&config, vec![CpuBackend::new(0)]);
    assert!(matches!(result, Err(PoissonError::Configuration(_))));
}
