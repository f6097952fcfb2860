//! WGSL compute shaders for the accelerator backend.
//!
//! Fields are f32 arrays of `rows x nx` in row-major order, matching the host
//! layout in `super::kernel`. All entry points share one `Params` uniform.

/// WGSL source containing every stencil-backend kernel.
///
/// Entry points:
/// - `stencil_reference`: one invocation per cell, operands read from global memory
/// - `stencil_tiled`: 16x16 workgroups staging a one-cell apron in workgroup memory
/// - `apply_boundary`: zero side columns and owned global edge rows
/// - `max_abs_diff`: per-workgroup partial maxima of `|a - b|` over owned rows
pub const STENCIL_SHADER_SOURCE: &str = r#"
struct Params {
    nx: u32,
    rows: u32,
    local_ny: u32,
    is_first: u32,
    is_last: u32,
    dx2: f32,
    dy2: f32,
    div_term: f32,
}

@group(0) @binding(0) var<storage, read_write> st_out: array<f32>;
@group(0) @binding(1) var<storage, read> st_in: array<f32>;
@group(0) @binding(2) var<storage, read> st_src: array<f32>;
@group(0) @binding(3) var<uniform> params: Params;

fn is_physical_row(i: u32) -> bool {
    return (params.is_first != 0u && i == 1u) || (params.is_last != 0u && i == params.local_ny);
}

fn updates_cell(i: u32, j: u32) -> bool {
    return j > 0u && j + 1u < params.nx && i >= 1u && i <= params.local_ny && !is_physical_row(i);
}

fn stencil_point(east: f32, west: f32, south: f32, north: f32, b: f32) -> f32 {
    return ((east + west) * params.dy2 + (south + north) * params.dx2 - b * params.dx2 * params.dy2)
        * params.div_term;
}

// --- reference stencil ---

@compute @workgroup_size(16, 16)
fn stencil_reference(@builtin(global_invocation_id) gid: vec3<u32>) {
    let j = gid.x;
    let i = gid.y;
    if i >= params.rows || j >= params.nx || !updates_cell(i, j) {
        return;
    }
    let nx = params.nx;
    let c = i * nx + j;
    st_out[c] = stencil_point(st_in[c + 1u], st_in[c - 1u], st_in[c + nx], st_in[c - nx], st_src[c]);
}

// --- tiled stencil ---

const TILE: u32 = 16u;

var<workgroup> tile: array<array<f32, 18>, 18>;

@compute @workgroup_size(16, 16)
fn stencil_tiled(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {
    let nx = params.nx;
    let rows = params.rows;
    let ix = gid.x;
    let iy = gid.y;
    let sx = lid.x + 1u;
    let sy = lid.y + 1u;
    let inside = ix < nx && iy < rows;
    let c = iy * nx + ix;

    var centre = 0.0;
    if inside {
        centre = st_in[c];
    }
    tile[sy][sx] = centre;

    if lid.x == 0u {
        var v = 0.0;
        if inside && ix > 0u {
            v = st_in[c - 1u];
        }
        tile[sy][0] = v;
    }
    if lid.x == TILE - 1u {
        var v = 0.0;
        if inside && ix + 1u < nx {
            v = st_in[c + 1u];
        }
        tile[sy][TILE + 1u] = v;
    }
    if lid.y == 0u {
        var v = 0.0;
        if inside && iy > 0u {
            v = st_in[c - nx];
        }
        tile[0][sx] = v;
    }
    if lid.y == TILE - 1u {
        var v = 0.0;
        if inside && iy + 1u < rows {
            v = st_in[c + nx];
        }
        tile[TILE + 1u][sx] = v;
    }

    workgroupBarrier();

    if inside && updates_cell(iy, ix) {
        st_out[c] = stencil_point(tile[sy][sx + 1u], tile[sy][sx - 1u], tile[sy + 1u][sx], tile[sy - 1u][sx], st_src[c]);
    }
}

// --- boundary conditions ---

@compute @workgroup_size(16, 16)
fn apply_boundary(@builtin(global_invocation_id) gid: vec3<u32>) {
    let j = gid.x;
    let i = gid.y;
    if j >= params.nx || i < 1u || i > params.local_ny {
        return;
    }
    if j == 0u || j + 1u == params.nx || is_physical_row(i) {
        st_out[i * params.nx + j] = 0.0;
    }
}

// --- convergence diff ---

const DIFF_WG_SIZE: u32 = 256u;
// Stands in for NaN, which max() may silently drop.
const DIVERGED: f32 = 3.40282347e+38;

@group(0) @binding(0) var<storage, read> diff_a: array<f32>;
@group(0) @binding(1) var<storage, read> diff_b: array<f32>;
@group(0) @binding(2) var<storage, read_write> diff_partials: array<f32>;

var<workgroup> diff_scratch: array<f32, 256>;

@compute @workgroup_size(256)
fn max_abs_diff(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let start = params.nx;
    let count = params.local_ny * params.nx;
    let stride = nwg.x * DIFF_WG_SIZE;

    var m = 0.0;
    for (var k = gid.x; k < count; k = k + stride) {
        var d = abs(diff_a[start + k] - diff_b[start + k]);
        if d != d {
            d = DIVERGED;
        }
        m = max(m, d);
    }
    diff_scratch[lid.x] = m;
    workgroupBarrier();

    var width = DIFF_WG_SIZE / 2u;
    while width > 0u {
        if lid.x < width {
            diff_scratch[lid.x] = max(diff_scratch[lid.x], diff_scratch[lid.x + width]);
        }
        workgroupBarrier();
        width = width / 2u;
    }

    if lid.x == 0u {
        diff_partials[wid.x] = diff_scratch[0];
    }
}
"#;
