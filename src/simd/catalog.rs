//! The closed set of vector ISAs we know how to generate code for.

use crate::core::hardware::Arch;
use crate::simd::descriptor::{ElementType, IsaDescriptor, IsaExtension, IsaSpec};
use crate::simd::probe;

const AVX512_FLAGS: &str = if cfg!(windows) {
    "/arch:AVX512"
} else {
    "-mavx512f -mavx512dq -mavx512vl -mavx512bw -mfma"
};

const AVX2_FLAGS: &str = if cfg!(windows) {
    "/arch:AVX2"
} else {
    "-mavx2 -mfma -mf16c"
};

const LANES_512: &[(ElementType, u32)] = &[
    (ElementType::Float, 16),
    (ElementType::BFloat16, 32),
    (ElementType::Float16, 32),
];

const LANES_256: &[(ElementType, u32)] = &[
    (ElementType::Float, 8),
    (ElementType::BFloat16, 16),
    (ElementType::Float16, 16),
];

pub static AVX512: IsaSpec = IsaSpec {
    name: "avx512",
    arch: Arch::X86_64,
    bit_width: 512,
    macros: &["CPU_CAPABILITY_AVX512"],
    arch_flags: AVX512_FLAGS,
    lanes: LANES_512,
    assume_usable: false,
};

pub static AVX2: IsaSpec = IsaSpec {
    name: "avx2",
    arch: Arch::X86_64,
    bit_width: 256,
    macros: &["CPU_CAPABILITY_AVX2"],
    arch_flags: AVX2_FLAGS,
    lanes: LANES_256,
    assume_usable: false,
};

// 256 rather than 128: the kernels pair two q-registers per vector.
pub static NEON: IsaSpec = IsaSpec {
    name: "asimd",
    arch: Arch::Aarch64,
    bit_width: 256,
    macros: &["CPU_CAPABILITY_NEON"],
    arch_flags: "",
    lanes: LANES_256,
    assume_usable: true,
};

// Apple builds of the runtime vectorize through Sleef at 256 bits.
pub static NEON_APPLE: IsaSpec = IsaSpec {
    name: "asimd",
    arch: Arch::Aarch64,
    bit_width: 256,
    macros: &["CPU_CAPABILITY_NEON", "AT_BUILD_ARM_VEC256_WITH_SLEEF"],
    arch_flags: "",
    lanes: LANES_256,
    assume_usable: true,
};

pub static ZVECTOR: IsaSpec = IsaSpec {
    name: "zvector",
    arch: Arch::S390x,
    bit_width: 256,
    macros: &[
        "CPU_CAPABILITY_ZVECTOR",
        "CPU_CAPABILITY=ZVECTOR",
        "HAVE_ZVECTOR_CPU_DEFINITION",
    ],
    arch_flags: "-mvx -mzvector",
    lanes: LANES_256,
    assume_usable: false,
};

pub static AMX_TILE: IsaExtension = IsaExtension {
    name: "amx_tile",
    macros: &[],
    arch_flags: "-mamx-tile -mamx-bf16 -mamx-int8",
    probe_kernel: probe::AMX_KERNEL,
    requires_runtime_enable: true,
};

pub static INVALID: IsaSpec = IsaSpec {
    name: "INVALID_VEC_ISA",
    arch: Arch::Other,
    bit_width: 0,
    macros: &[""],
    arch_flags: "",
    lanes: &[],
    assume_usable: false,
};

pub static VEC_AMX: IsaDescriptor = IsaDescriptor::extended(&AVX512, &AMX_TILE);
pub static VEC_AVX512: IsaDescriptor = IsaDescriptor::new(&AVX512);
pub static VEC_AVX2: IsaDescriptor = IsaDescriptor::new(&AVX2);
pub static VEC_NEON: IsaDescriptor = IsaDescriptor::new(&NEON);
pub static VEC_NEON_APPLE: IsaDescriptor = IsaDescriptor::new(&NEON_APPLE);
pub static VEC_ZVECTOR: IsaDescriptor = IsaDescriptor::new(&ZVECTOR);

/// Returned when nothing is usable. Never passes a usability check.
pub static INVALID_VEC_ISA: IsaDescriptor = IsaDescriptor::new(&INVALID);

/// Every known ISA, most capable first. Selection preference follows this order.
pub static SUPPORTED_VEC_ISA_LIST: [IsaDescriptor; 5] = [
    IsaDescriptor::extended(&AVX512, &AMX_TILE),
    IsaDescriptor::new(&AVX512),
    IsaDescriptor::new(&AVX2),
    IsaDescriptor::new(&NEON),
    IsaDescriptor::new(&ZVECTOR),
];

/// Catalog entries that apply to `arch`, in priority order.
pub fn candidates_for(arch: Arch) -> impl Iterator<Item = IsaDescriptor> {
    SUPPORTED_VEC_ISA_LIST
        .iter()
        .copied()
        .filter(move |isa| isa.arch() == arch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_most_capable_first() {
        let x86: Vec<String> = candidates_for(Arch::X86_64).map(|i| i.name()).collect();
        assert_eq!(x86, vec!["avx512 amx_tile", "avx512", "avx2"]);

        let widths: Vec<u32> = SUPPORTED_VEC_ISA_LIST.iter().map(|i| i.bit_width()).collect();
        assert!(widths.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_avx2_lanes() {
        assert_eq!(VEC_AVX2.bit_width(), 256);
        assert_eq!(VEC_AVX2.nelements(ElementType::Float), Some(8));
        assert_eq!(VEC_AVX2.nelements(ElementType::Float16), Some(16));
        assert_eq!(VEC_AVX512.nelements(ElementType::Float), Some(16));
    }

    #[test]
    fn test_arch_specific_singletons() {
        assert_eq!(candidates_for(Arch::Aarch64).collect::<Vec<_>>(), vec![VEC_NEON]);
        assert_eq!(candidates_for(Arch::S390x).collect::<Vec<_>>(), vec![VEC_ZVECTOR]);
        assert_eq!(candidates_for(Arch::Other).count(), 0);
        assert!(VEC_NEON.assume_usable());
        assert_eq!(VEC_ZVECTOR.macros().len(), 3);
    }

    #[test]
    fn test_apple_neon_adds_sleef_macro() {
        assert_eq!(VEC_NEON_APPLE, VEC_NEON);
        assert_eq!(
            VEC_NEON_APPLE.macros(),
            vec!["CPU_CAPABILITY_NEON", "AT_BUILD_ARM_VEC256_WITH_SLEEF"]
        );
        assert_eq!(VEC_NEON.macros(), vec!["CPU_CAPABILITY_NEON"]);
        assert_eq!(VEC_NEON_APPLE.bit_width(), VEC_NEON.bit_width());
    }
}
