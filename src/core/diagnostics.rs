use crate::config::SelectionConfig;
use crate::core::hardware::{HostFeatures, Platform};
use crate::core::selector::IsaSelector;
use crate::simd::catalog::SUPPORTED_VEC_ISA_LIST;
use serde::Serialize;

/// Why a catalog entry was or was not picked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IsaStatus {
    Selected,
    Usable,
    /// Host reports it, but the dry compile or runtime enable failed.
    Unusable,
    /// Host does not report every feature the ISA needs.
    NotReported,
    OtherArch,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateReport {
    pub name: String,
    pub bit_width: u32,
    pub arch_flags: String,
    pub macros: Vec<&'static str>,
    pub status: IsaStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub platform: Platform,
    pub host_features: HostFeatures,
    pub compiler_version: String,
    pub config: SelectionConfig,
    pub selected: String,
    pub selected_bit_width: u32,
    pub candidates: Vec<CandidateReport>,
}

pub struct Diagnostics;

impl Diagnostics {
    /// Runs selection (probing as needed) and explains each catalog entry.
    pub fn report(selector: &IsaSelector) -> DetectionReport {
        let platform = selector.host().platform();
        let features = selector.host().detect();
        let selected = selector.select();
        let valid = selector.valid_vec_isa_list();

        let candidates = SUPPORTED_VEC_ISA_LIST
            .iter()
            .map(|isa| {
                let status = if *isa == selected {
                    IsaStatus::Selected
                } else if valid.contains(isa) {
                    IsaStatus::Usable
                } else if isa.arch() != platform.arch {
                    IsaStatus::OtherArch
                } else if !features.has_all(&isa.feature_names()) {
                    IsaStatus::NotReported
                } else {
                    IsaStatus::Unusable
                };
                CandidateReport {
                    name: isa.name(),
                    bit_width: isa.bit_width(),
                    arch_flags: isa.arch_flags(),
                    macros: isa.macros(),
                    status,
                }
            })
            .collect();

        DetectionReport {
            platform,
            host_features: features,
            compiler_version: selector.verifier().compiler_version().to_string(),
            config: selector.config().clone(),
            selected: selected.name(),
            selected_bit_width: selected.bit_width(),
            candidates,
        }
    }
}
