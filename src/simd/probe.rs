//! C sources compiled during dry-compile checks.
//!
//! Each probe is a tiny shared library. `probe_loader` opens it in a child
//! process and, when present, calls [`VEC_KERNEL_SYMBOL`] so that an
//! unsupported instruction traps there instead of in the caller.

/// Exported by the generic vector probe.
pub const VEC_KERNEL_SYMBOL: &str = "vecisa_chk_kernel";

const PRELUDE: &str = r#"#include <stdint.h>

#if defined(_WIN32)
#define VECISA_EXPORT __declspec(dllexport)
#else
#define VECISA_EXPORT __attribute__((visibility("default")))
#endif

#if defined(_MSC_VER)
#define VECISA_ALIGNED(n) __declspec(align(n))
#else
#define VECISA_ALIGNED(n) __attribute__((aligned(n)))
#endif
"#;

/// Generic vector kernel. The capability macro set at build time picks the body.
pub const VEC_KERNEL: &str = r#"
#if defined(CPU_CAPABILITY_AVX512) || defined(CPU_CAPABILITY_AVX2)
#include <immintrin.h>
#elif defined(CPU_CAPABILITY_NEON)
#include <arm_neon.h>
#elif defined(CPU_CAPABILITY_ZVECTOR)
#include <vecintrin.h>
#endif

VECISA_ALIGNED(64) static float in_out_ptr0[16] = {0.0f};

VECISA_EXPORT void vecisa_chk_kernel(void) {
#if defined(CPU_CAPABILITY_AVX512)
    __m512 tmp0 = _mm512_set1_ps(1.0f);
    __m512 tmp1 = _mm512_fmadd_ps(tmp0, tmp0, tmp0);
    _mm512_store_ps(in_out_ptr0, tmp1);
#elif defined(CPU_CAPABILITY_AVX2)
    __m256 tmp0 = _mm256_set1_ps(1.0f);
    __m256 tmp1 = _mm256_fmadd_ps(tmp0, tmp0, tmp0);
    _mm256_store_ps(in_out_ptr0, tmp1);
#elif defined(CPU_CAPABILITY_NEON)
    float32x4_t tmp0 = vdupq_n_f32(1.0f);
    float32x4_t tmp1 = vfmaq_f32(tmp0, tmp0, tmp0);
    vst1q_f32(in_out_ptr0, tmp1);
#elif defined(CPU_CAPABILITY_ZVECTOR)
    __vector float tmp0 = vec_splats(1.0f);
    __vector float tmp1 = vec_madd(tmp0, tmp0, tmp0);
    vec_xst(tmp1, 0, in_out_ptr0);
#endif
}
"#;

/// Tile configuration + dot-product kernel. Only compiled, never called:
/// executing it needs the tile state granted first.
pub const AMX_KERNEL: &str = r#"
#include <immintrin.h>

struct amx_tilecfg {
    uint8_t palette_id;
    uint8_t start_row;
    uint8_t reserved_0[14];
    uint16_t colsb[16];
    uint8_t rows[16];
};

VECISA_EXPORT void vecisa_amx_chk_kernel(void) {
    struct amx_tilecfg cfg = {0};
    _tile_loadconfig(&cfg);
    _tile_zero(0);
    _tile_dpbf16ps(0, 1, 2);
    _tile_dpbusd(0, 1, 2);
}
"#;

pub fn render(kernel: &str) -> String {
    let mut source = String::with_capacity(PRELUDE.len() + kernel.len());
    source.push_str(PRELUDE);
    source.push_str(kernel);
    source
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_matches_kernel() {
        assert!(VEC_KERNEL.contains(&format!("void {}(void)", VEC_KERNEL_SYMBOL)));
    }

    #[test]
    fn test_render_prepends_export_macro() {
        let source = render(AMX_KERNEL);
        let export = source.find("#define VECISA_EXPORT").unwrap();
        let usage = source.find("VECISA_EXPORT void").unwrap();
        assert!(export < usage);
    }
}
