//! WGSL source generation for the GPU kernels.
//!
//! Sources are specialised on the element type and workgroup size; the
//! result is compiled once per context through the kernel cache.

use super::KernelVariant;

/// How a binding slot is declared in the bind group layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding {
    Uniform,
    Read,
    ReadWrite,
}

use Binding::{Read, ReadWrite, Uniform};

/// Binding slots of each variant, in `@binding` order.
pub(crate) fn bindings(variant: KernelVariant) -> &'static [Binding] {
    match variant {
        KernelVariant::CsrSet | KernelVariant::CsrAdd => {
            &[Uniform, Read, Read, Read, Read, ReadWrite, Read]
        }
        KernelVariant::HellSet | KernelVariant::HellAdd => {
            &[Uniform, Read, Read, Read, Read, Read, Read, ReadWrite, Read]
        }
        KernelVariant::Gather => &[Uniform, Read, Read, ReadWrite],
        KernelVariant::Fill => &[Uniform, ReadWrite, Read],
    }
}

const HEADER: &str = r#"
alias real = $REAL;
const WG: u32 = $WGu;

struct Params {
    n: u32,
    width: u32,
    pad0: u32,
    pad1: u32,
};
"#;

const CSR: &str = r#"
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> row: array<u32>;
@group(0) @binding(2) var<storage, read> col: array<u32>;
@group(0) @binding(3) var<storage, read> val: array<real>;
@group(0) @binding(4) var<storage, read> x: array<real>;
@group(0) @binding(5) var<storage, read_write> y: array<real>;
@group(0) @binding(6) var<storage, read> scalars: array<real>;

@compute @workgroup_size(WG)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let n = params.n;
    let global_size = nwg.x * WG;
    let chunk_size = (n + global_size - 1u) / global_size;
    let chunk_start = min(n, gid.x * chunk_size);
    let chunk_end = min(n, chunk_start + chunk_size);
    let alpha = scalars[0];
    for (var i = chunk_start; i < chunk_end; i++) {
        var sum: real = 0.0;
        for (var j = row[i]; j < row[i + 1u]; j++) {
            sum += val[j] * x[col[j]];
        }
        $STORE
    }
}
"#;

const HELL: &str = r#"
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> ell_col: array<u32>;
@group(0) @binding(2) var<storage, read> ell_val: array<real>;
@group(0) @binding(3) var<storage, read> row: array<u32>;
@group(0) @binding(4) var<storage, read> col: array<u32>;
@group(0) @binding(5) var<storage, read> val: array<real>;
@group(0) @binding(6) var<storage, read> x: array<real>;
@group(0) @binding(7) var<storage, read_write> y: array<real>;
@group(0) @binding(8) var<storage, read> scalars: array<real>;

@compute @workgroup_size(WG)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let n = params.n;
    let global_size = nwg.x * WG;
    let chunk_size = (n + global_size - 1u) / global_size;
    let chunk_start = min(n, gid.x * chunk_size);
    let chunk_end = min(n, chunk_start + chunk_size);
    let alpha = scalars[0];
    for (var i = chunk_start; i < chunk_end; i++) {
        var sum: real = 0.0;
        for (var k = 0u; k < params.width; k++) {
            let c = ell_col[k * n + i];
            if (c != 0xffffffffu) {
                sum += ell_val[k * n + i] * x[c];
            }
        }
        for (var j = row[i]; j < row[i + 1u]; j++) {
            sum += val[j] * x[col[j]];
        }
        $STORE
    }
}
"#;

const GATHER: &str = r#"
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> vals: array<real>;
@group(0) @binding(2) var<storage, read> cols_to_send: array<u32>;
@group(0) @binding(3) var<storage, read_write> vals_to_send: array<real>;

@compute @workgroup_size(WG)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let global_size = nwg.x * WG;
    for (var i = gid.x; i < params.n; i += global_size) {
        vals_to_send[i] = vals[cols_to_send[i]];
    }
}
"#;

const FILL: &str = r#"
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read_write> y: array<real>;
@group(0) @binding(2) var<storage, read> scalars: array<real>;

@compute @workgroup_size(WG)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let global_size = nwg.x * WG;
    let value = scalars[0];
    for (var i = gid.x; i < params.n; i += global_size) {
        y[i] = value;
    }
}
"#;

const STORE_SET: &str = "y[i] = alpha * sum;";
const STORE_ADD: &str = "y[i] = y[i] + alpha * sum;";

/// Generates the shader source for `variant` on element type `real`.
pub(crate) fn source(variant: KernelVariant, real: &str, workgroup_size: u32) -> String {
    let body = match variant {
        KernelVariant::CsrSet | KernelVariant::CsrAdd => CSR,
        KernelVariant::HellSet | KernelVariant::HellAdd => HELL,
        KernelVariant::Gather => GATHER,
        KernelVariant::Fill => FILL,
    };
    let store = if variant.appends() { STORE_ADD } else { STORE_SET };

    let mut src = HEADER
        .replace("$REAL", real)
        .replace("$WG", &workgroup_size.to_string());
    src.push_str(&body.replace("$STORE", store));
    src
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_is_specialised() {
        let src = source(KernelVariant::CsrAdd, "f64", 128);
        assert!(src.contains("alias real = f64;"));
        assert!(src.contains("const WG: u32 = 128u;"));
        assert!(src.contains(STORE_ADD));
        assert!(!src.contains('$'));

        let src = source(KernelVariant::HellSet, "f32", 64);
        assert!(src.contains(STORE_SET));
        assert!(src.contains("ell_col"));
    }

    #[test]
    fn test_binding_counts_match_sources() {
        for variant in [
            KernelVariant::CsrSet,
            KernelVariant::HellAdd,
            KernelVariant::Gather,
            KernelVariant::Fill,
        ] {
            let src = source(variant, "f32", 64);
            assert_eq!(src.matches("@binding(").count(), bindings(variant).len());
        }
    }
}
