//! Vector ISA detection for native code generation.
//!
//! Works out which SIMD instruction set the running machine and the
//! installed C compiler can both handle, and picks exactly one of them.
//! See [`core::selector::IsaSelector`] for the decision and
//! [`pick_vec_isa`] for the process-wide cached answer.

pub mod config;
pub mod core;
pub mod simd;
pub mod storage;

pub use crate::config::SelectionConfig;
pub use crate::core::selector::{pick_vec_isa, IsaSelector};
pub use crate::simd::descriptor::{ElementType, IsaDescriptor};
