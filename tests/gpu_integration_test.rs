//! GPU solves compared against the host-memory devices.
//!
//! The GPU kernels run in f32, so fields are compared with a tolerance
//! relative to the field magnitude. Tests skip when no adapter is present.

use halopoisson::config::{BackendKind, KernelVariant, SolverConfig, Tolerance};
use halopoisson::solver::gpu::WgpuBackend;
use halopoisson::solver::{self, SolveStatus};

fn try_gpus(count: usize) -> Option<Vec<WgpuBackend>> {
    let adapters = WgpuBackend::adapter_count();
    if adapters == 0 {
        return None;
    }
    (0..count).map(|rank| WgpuBackend::new(rank % adapters).ok()).collect()
}

macro_rules! gpus_or_skip {
    ($count:expr) => {
        match try_gpus($count) {
            Some(gpus) => gpus,
            None => {
                eprintln!("Skipping: no GPU available");
                return;
            }
        }
    };
}

fn assert_fields_close(gpu: &solver::SolveOutcome, cpu: &solver::SolveOutcome) {
    let scale = cpu.field.max_abs().max(1e-12);
    let err = gpu.field.max_abs_diff(&cpu.field) / scale;
    assert!(err < 1e-3, "relative field error {err:.3e}");
}

#[test]
fn gpu_benchmark_matches_cpu() {
    let gpus = gpus_or_skip!(1);
    let config = SolverConfig::benchmark(64, 64, 200);
    let gpu = solver::solve_with(&config.clone().with_backend(BackendKind::Gpu), gpus).unwrap();
    let cpu = solver::solve(&config).unwrap();
    assert_eq!(gpu.iterations, 200);
    assert!(gpu.field.edges_are_zero());
    assert_fields_close(&gpu, &cpu);
}

#[test]
fn gpu_tiled_and_reference_kernels_agree() {
    let config = SolverConfig::benchmark(70, 54, 100);
    let tiled = solver::solve_with(&config.clone().with_kernel(KernelVariant::Tiled), gpus_or_skip!(1)).unwrap();
    let reference =
        solver::solve_with(&config.with_kernel(KernelVariant::Reference), gpus_or_skip!(1)).unwrap();
    assert_eq!(tiled.field, reference.field);
}

#[test]
fn gpu_two_workers_use_host_staging() {
    let gpus = gpus_or_skip!(2);
    let config = SolverConfig::benchmark(64, 128, 150).with_workers(2);
    let gpu = solver::solve_with(&config, gpus).unwrap();
    assert_eq!(gpu.peer_links, 0);
    assert_eq!(gpu.staged_links, 1);
    let cpu = solver::solve(&config).unwrap();
    assert_fields_close(&gpu, &cpu);
}

#[test]
fn gpu_physics_mode_converges() {
    let gpus = gpus_or_skip!(1);
    let config = SolverConfig::physics(50, 50, 50_000, Tolerance::Absolute(1e-5));
    let outcome = solver::solve_with(&config, gpus).unwrap();
    assert_eq!(outcome.status, SolveStatus::Converged);
    assert!(outcome.final_diff.unwrap() < 1e-5);
}
