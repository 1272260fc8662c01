use crate::config::SelectionConfig;
use crate::core::hardware::HostFeatureProbe;
use crate::core::verifier::DryCompileVerifier;
use crate::simd::catalog::{self, INVALID_VEC_ISA, VEC_AVX2, VEC_NEON_APPLE};
use crate::simd::descriptor::IsaDescriptor;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

/// Picks the vector ISA used for code generation.
///
/// Preference is catalog order (most capable first), narrowed by what the
/// host reports, what the compiler can build, and the configuration.
pub struct IsaSelector {
    host: HostFeatureProbe,
    verifier: DryCompileVerifier,
    config: SelectionConfig,
    usable: Mutex<HashMap<String, bool>>,
    valid: Mutex<Option<Vec<IsaDescriptor>>>,
}

impl IsaSelector {
    pub fn new(host: HostFeatureProbe, verifier: DryCompileVerifier, config: SelectionConfig) -> Self {
        Self {
            host,
            verifier,
            config,
            usable: Mutex::new(HashMap::new()),
            valid: Mutex::new(None),
        }
    }

    /// Real CPU, system compiler, default cache and environment config.
    pub fn native() -> Self {
        Self::new(
            HostFeatureProbe::native(),
            DryCompileVerifier::native(),
            SelectionConfig::from_env(),
        )
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    pub fn host(&self) -> &HostFeatureProbe {
        &self.host
    }

    pub fn verifier(&self) -> &DryCompileVerifier {
        &self.verifier
    }

    pub fn select(&self) -> IsaDescriptor {
        if self.config.fbcode {
            return VEC_AVX2;
        }

        let valid = self.valid_vec_isa_list();
        let picked = match (valid.first(), self.config.simdlen) {
            (None, _) => INVALID_VEC_ISA,
            (Some(first), None) => *first,
            (Some(_), Some(width)) => valid
                .iter()
                .find(|isa| isa.bit_width() == width)
                .copied()
                .unwrap_or(INVALID_VEC_ISA),
        };

        if picked.is_valid() {
            tracing::info!("selected vector ISA {} ({} bits)", picked, picked.bit_width());
        } else {
            tracing::info!(
                "no vector ISA available (valid: {:?}, simdlen: {:?})",
                valid.iter().map(|isa| isa.name()).collect::<Vec<_>>(),
                self.config.simdlen
            );
        }
        picked
    }

    /// ISAs that the host reports and that passed their usability check,
    /// in preference order. Computed once.
    pub fn valid_vec_isa_list(&self) -> Vec<IsaDescriptor> {
        let mut valid = self.valid.lock().unwrap_or_else(PoisonError::into_inner);
        valid.get_or_insert_with(|| self.scan()).clone()
    }

    /// Memoized usability of `isa`, honoring the configuration overrides.
    pub fn is_usable(&self, isa: &IsaDescriptor) -> bool {
        let name = isa.name();
        if let Some(&usable) = self.usable_memo().get(&name) {
            return usable;
        }
        let usable = self.check_usable(isa);
        self.usable_memo().insert(name, usable);
        usable
    }

    fn check_usable(&self, isa: &IsaDescriptor) -> bool {
        if !isa.is_valid() {
            return false;
        }

        let base_ok = if let Some(forced) = self.config.vec_isa_ok {
            forced
        } else if self.config.fbcode {
            true
        } else {
            self.verifier.verify(isa)
        };

        let Some(extension) = isa.extension() else {
            return base_ok;
        };
        // The runtime may have been built without tile support even when the
        // codegen compiler has it.
        if !base_ok || self.config.fbcode {
            return false;
        }
        let compiled = match (self.config.vec_isa_ok, isa.extension_probe_source()) {
            (Some(forced), _) => forced,
            (None, Some(source)) => self.verifier.check_build(isa, &source),
            (None, None) => true,
        };
        if !compiled {
            return false;
        }
        !extension.requires_runtime_enable || self.host.cpu().init_amx()
    }

    fn scan(&self) -> Vec<IsaDescriptor> {
        let platform = self.host.platform();
        let mut valid = Vec::new();

        if platform.is_apple_silicon() {
            valid.push(VEC_NEON_APPLE);
        }
        if !platform.scans_catalog() {
            return valid;
        }

        let features = self.host.detect();
        for isa in catalog::candidates_for(platform.arch) {
            if !features.has_all(&isa.feature_names()) {
                continue;
            }
            if isa.assume_usable() || self.is_usable(&isa) {
                valid.push(isa);
            }
        }
        valid
    }

    fn usable_memo(&self) -> std::sync::MutexGuard<'_, HashMap<String, bool>> {
        self.usable.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The ISA for this process: probed on first call, then cached.
pub fn pick_vec_isa() -> IsaDescriptor {
    static SELECTED: OnceLock<IsaDescriptor> = OnceLock::new();
    *SELECTED.get_or_init(|| IsaSelector::native().select())
}
