//! Tiled matrix-product kernel emitter.
//!
//! Layout: each work-group computes an `ml x nl` block of the result,
//! walking the shared dimension in `kl`-wide slabs. Within a group each
//! work item owns an `ms x ns` register tile. Operand slabs are staged in
//! local memory when the profile asks for it; otherwise loads go straight
//! to global memory through the same index macros.

use crate::core::expr::{ExprTree, ScalarType};
use crate::core::profile::GemmProfile;
use crate::emitter::{KernelDialect, KernelSource};
use crate::error::TuneError;

struct Dialect {
    kernel_qual: &'static str,
    global_ptr: &'static str,
    local_qual: &'static str,
    barrier: &'static str,
    group_row: &'static str,
    group_col: &'static str,
    local_row: &'static str,
    local_col: &'static str,
}

impl Dialect {
    fn for_target(target: KernelDialect) -> Self {
        match target {
            KernelDialect::OpenCl => Self {
                kernel_qual: "__kernel",
                global_ptr: "__global ",
                local_qual: "__local",
                barrier: "barrier(CLK_LOCAL_MEM_FENCE);",
                group_row: "get_group_id(0)",
                group_col: "get_group_id(1)",
                local_row: "get_local_id(0)",
                local_col: "get_local_id(1)",
            },
            KernelDialect::Cuda => Self {
                kernel_qual: "extern \"C\" __global__",
                global_ptr: "",
                local_qual: "__shared__",
                barrier: "__syncthreads();",
                group_row: "blockIdx.x",
                group_col: "blockIdx.y",
                local_row: "threadIdx.x",
                local_col: "threadIdx.y",
            },
        }
    }
}

/// Lowers `tree` to kernel source for the given profile.
///
/// Classification happens here: anything outside the supported
/// matrix-product family is rejected before any text is produced.
/// Output is a pure function of its inputs.
pub fn emit_gemm(
    tree: &ExprTree,
    profile: &GemmProfile,
    scalar: ScalarType,
    target: KernelDialect,
) -> Result<KernelSource, TuneError> {
    let variant = tree.gemm_variant()?;
    let d = Dialect::for_target(target);
    let ty = scalar.device_name();
    let (ml, kl, nl) = (profile.ml, profile.kl, profile.nl);
    let (ms, ks, ns) = (profile.ms, profile.ks, profile.ns);
    let local_rows = ml / ms;
    let local_cols = nl / ns;
    let wg = local_rows * local_cols;

    let name = format!("gemm_{}_{}", variant.name(), match scalar {
        ScalarType::F32 => "f32",
        ScalarType::F64 => "f64",
    });

    let header = match (target, scalar) {
        (KernelDialect::OpenCl, ScalarType::F64) => {
            "#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n"
        }
        _ => "",
    };

    // Index macros carry the layout; everything downstream is layout-blind.
    let lhs_at = if variant.lhs_transposed() {
        "#define LHS_AT(r, c) lhs[(c) * M + (r)]"
    } else {
        "#define LHS_AT(r, c) lhs[(r) * K + (c)]"
    };
    let rhs_at = if variant.rhs_transposed() {
        "#define RHS_AT(r, c) rhs[(c) * K + (r)]"
    } else {
        "#define RHS_AT(r, c) rhs[(r) * N + (c)]"
    };

    let mut local_decls = String::new();
    if profile.lhs_in_local {
        local_decls.push_str(&format!(
            "    {} {ty} lhs_tile[{}];\n",
            d.local_qual,
            ml * kl
        ));
    }
    if profile.rhs_in_local {
        local_decls.push_str(&format!(
            "    {} {ty} rhs_tile[{}];\n",
            d.local_qual,
            kl * nl
        ));
    }

    let staging = profile.lhs_in_local || profile.rhs_in_local;
    let tid_decl = if staging {
        format!("    const unsigned int tid = local_row * {local_cols} + local_col;\n")
    } else {
        String::new()
    };

    let mut stage = String::new();
    if profile.lhs_in_local {
        stage.push_str(&stage_loop(
            "lhs_tile",
            "LHS_AT(group_row + r, kb + c)",
            ml,
            kl,
            wg,
            profile.vector_width,
            !variant.lhs_transposed() && target == KernelDialect::OpenCl,
        ));
    }
    if profile.rhs_in_local {
        stage.push_str(&stage_loop(
            "rhs_tile",
            "RHS_AT(kb + r, group_col + c)",
            kl,
            nl,
            wg,
            profile.vector_width,
            !variant.rhs_transposed() && target == KernelDialect::OpenCl,
        ));
    }
    if staging {
        stage.push_str(&format!("        {}\n", d.barrier));
    }
    let post_barrier = if staging {
        format!("        {}\n", d.barrier)
    } else {
        String::new()
    };

    // Register-fragment loads. A non-staged operand is read straight from
    // global memory and can use vector loads when the fragment axis is the
    // contiguous one: a transposed lhs is contiguous along rows, a
    // non-transposed rhs along columns. Staged operands come out of the
    // local tile element-wise.
    let a_elem = if profile.lhs_in_local {
        format!("lhs_tile[(local_row * {ms} + i) * {kl} + kc]")
    } else {
        "LHS_AT(row + i, kb + kc)".to_string()
    };
    let a_contiguous = !profile.lhs_in_local && variant.lhs_transposed();
    let a_fill = fragment_fill("a_frag", "i", ms, &a_elem, a_contiguous, profile.vector_width, ty, target);

    let b_elem = if profile.rhs_in_local {
        format!("rhs_tile[kc * {nl} + local_col * {ns} + j]")
    } else {
        "RHS_AT(kb + kc, col + j)".to_string()
    };
    let b_contiguous = !profile.rhs_in_local && !variant.rhs_transposed();
    let b_fill = fragment_fill("b_frag", "j", ns, &b_elem, b_contiguous, profile.vector_width, ty, target);

    let unroll = if profile.unroll > 1 {
        format!("            #pragma unroll {}\n", profile.unroll)
    } else {
        String::new()
    };

    let text = format!(
        r#"{header}// {variant} matrix product, {ml}x{kl}x{nl} block, {ms}x{ns} per item
{lhs_at}
{rhs_at}
#define DST_AT(r, c) dst[(r) * N + (c)]

{kernel_qual} void {name}(
    {gp}{ty}* dst,
    {gp}const {ty}* lhs,
    {gp}const {ty}* rhs,
    const unsigned int M,
    const unsigned int N,
    const unsigned int K)
{{
{local_decls}    const unsigned int local_row = {lid0};
    const unsigned int local_col = {lid1};
    const unsigned int group_row = {gid0} * {ml};
    const unsigned int group_col = {gid1} * {nl};
    const unsigned int row = group_row + local_row * {ms};
    const unsigned int col = group_col + local_col * {ns};
{tid_decl}
    {ty} acc[{ms}][{ns}];
    for (unsigned int i = 0; i < {ms}; ++i)
        for (unsigned int j = 0; j < {ns}; ++j)
            acc[i][j] = ({ty})0;

    {ty} a_frag[{ms}];
    {ty} b_frag[{ns}];

    for (unsigned int kb = 0; kb < K; kb += {kl}) {{
{stage}        for (unsigned int kt = 0; kt < {kl}; kt += {ks}) {{
{unroll}            for (unsigned int kk = 0; kk < {ks}; ++kk) {{
                const unsigned int kc = kt + kk;
{a_fill}{b_fill}                for (unsigned int i = 0; i < {ms}; ++i)
                    for (unsigned int j = 0; j < {ns}; ++j)
                        acc[i][j] += a_frag[i] * b_frag[j];
            }}
        }}
{post_barrier}    }}

    for (unsigned int i = 0; i < {ms}; ++i)
        for (unsigned int j = 0; j < {ns}; ++j)
            DST_AT(row + i, col + j) = acc[i][j];
}}
"#,
        kernel_qual = d.kernel_qual,
        gp = d.global_ptr,
        lid0 = d.local_row,
        lid1 = d.local_col,
        gid0 = d.group_row,
        gid1 = d.group_col,
    );

    Ok(KernelSource {
        name,
        text,
        local_mem_bytes: profile.local_mem_bytes(scalar.size_of()),
        local_size: [local_rows as usize, local_cols as usize],
        sub_tile: [ms as usize, ns as usize],
    })
}

/// Fill of one register fragment for the current k index. Vector loads of
/// `w` elements when the source is contiguous along the fragment axis,
/// element-wise otherwise.
fn fragment_fill(
    frag: &str,
    idx: &str,
    count: u32,
    elem: &str,
    contiguous: bool,
    w: u32,
    ty: &str,
    target: KernelDialect,
) -> String {
    if contiguous && w > 1 && count % w == 0 {
        match target {
            KernelDialect::OpenCl => format!(
                "                for (unsigned int {idx} = 0; {idx} < {count}; {idx} += {w})\n\
                 \x20                   vstore{w}(vload{w}(0, &{elem}), 0, &{frag}[{idx}]);\n"
            ),
            KernelDialect::Cuda => format!(
                "                for (unsigned int {idx} = 0; {idx} < {count}; {idx} += {w})\n\
                 \x20                   *({ty}{w}*)&{frag}[{idx}] = *(const {ty}{w}*)&{elem};\n"
            ),
        }
    } else {
        format!(
            "                for (unsigned int {idx} = 0; {idx} < {count}; ++{idx})\n\
             \x20                   {frag}[{idx}] = {elem};\n"
        )
    }
}

/// Cooperative copy of a `rows x cols` slab into local memory. The whole
/// group strides over the slab; vector loads are used only when the slab's
/// fast axis is contiguous in global memory.
fn stage_loop(
    tile: &str,
    src: &str,
    rows: u32,
    cols: u32,
    wg: u32,
    vector_width: u32,
    contiguous: bool,
) -> String {
    let total = rows * cols;
    if contiguous && vector_width > 1 && cols % vector_width == 0 {
        let w = vector_width;
        format!(
            "        for (unsigned int idx = tid; idx < {n}; idx += {wg}) {{\n\
             \x20           const unsigned int r = (idx * {w}) / {cols};\n\
             \x20           const unsigned int c = (idx * {w}) % {cols};\n\
             \x20           vstore{w}(vload{w}(0, &{src}), 0, &{tile}[r * {cols} + c]);\n\
             \x20       }}\n",
            n = total / w,
        )
    } else {
        format!(
            "        for (unsigned int idx = tid; idx < {total}; idx += {wg}) {{\n\
             \x20           const unsigned int r = idx / {cols};\n\
             \x20           const unsigned int c = idx % {cols};\n\
             \x20           {tile}[idx] = {src};\n\
             \x20       }}\n"
        )
    }
}
