/// Raw host capability queries.
///
/// Everything above this trait is platform independent, so tests swap in a
/// fixed answer instead of the real CPU.
pub trait CpuQuery: Send + Sync {
    fn supports_avx2(&self) -> bool;

    /// AVX-512 foundation plus the DQ, VL and BW subsets the kernels use.
    fn supports_avx512(&self) -> bool;

    fn supports_amx_tile(&self) -> bool;

    /// Ask the OS for permission to use tile register state.
    /// Returns true once tiles may be executed by this process.
    fn init_amx(&self) -> bool;
}

/// Queries the CPU we are running on.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCpu;

impl CpuQuery for NativeCpu {
    fn supports_avx2(&self) -> bool {
        #[cfg(target_arch = "x86_64")]
        {
            is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    }

    fn supports_avx512(&self) -> bool {
        #[cfg(target_arch = "x86_64")]
        {
            is_x86_feature_detected!("avx512f")
                && is_x86_feature_detected!("avx512dq")
                && is_x86_feature_detected!("avx512vl")
                && is_x86_feature_detected!("avx512bw")
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    }

    fn supports_amx_tile(&self) -> bool {
        #[cfg(target_arch = "x86_64")]
        {
            amx_tile_cpuid()
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    }

    fn init_amx(&self) -> bool {
        if !self.supports_amx_tile() {
            return false;
        }
        request_tile_permission()
    }
}

/// CPUID.(EAX=7,ECX=0):EDX[24]
#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
fn amx_tile_cpuid() -> bool {
    use std::arch::x86_64::{__cpuid_count, __get_cpuid_max};

    let (max_leaf, _) = unsafe { __get_cpuid_max(0) };
    if max_leaf < 7 {
        return false;
    }
    let leaf7 = unsafe { __cpuid_count(7, 0) };
    leaf7.edx & (1 << 24) != 0
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn request_tile_permission() -> bool {
    const ARCH_GET_XCOMP_PERM: libc::c_long = 0x1022;
    const ARCH_REQ_XCOMP_PERM: libc::c_long = 0x1023;
    const XFEATURE_XTILEDATA: libc::c_long = 18;

    let rc = unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_REQ_XCOMP_PERM, XFEATURE_XTILEDATA) };
    if rc != 0 {
        tracing::debug!(
            "arch_prctl(ARCH_REQ_XCOMP_PERM) failed: {}",
            std::io::Error::last_os_error()
        );
        return false;
    }

    let mut bitmask: u64 = 0;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_arch_prctl,
            ARCH_GET_XCOMP_PERM,
            &mut bitmask as *mut u64,
        )
    };
    rc == 0 && bitmask & (1 << XFEATURE_XTILEDATA) != 0
}

// Other kernels grant tile state on first use.
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn request_tile_permission() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_queries_are_consistent() {
        let cpu = NativeCpu;
        // AVX-512 hardware always carries AVX2.
        if cpu.supports_avx512() {
            assert!(cpu.supports_avx2());
        }
        if !cpu.supports_amx_tile() {
            assert!(!cpu.init_amx());
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[test]
    fn test_non_x86_reports_nothing() {
        let cpu = NativeCpu;
        assert!(!cpu.supports_avx2());
        assert!(!cpu.supports_avx512());
        assert!(!cpu.supports_amx_tile());
    }
}
