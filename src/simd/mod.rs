pub mod catalog;
pub mod descriptor;
pub mod probe;

pub use catalog::{
    INVALID_VEC_ISA, SUPPORTED_VEC_ISA_LIST, VEC_AMX, VEC_AVX2, VEC_AVX512, VEC_NEON,
    VEC_NEON_APPLE, VEC_ZVECTOR,
};
pub use descriptor::{ElementType, IsaDescriptor};
