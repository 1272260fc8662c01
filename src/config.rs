use serde::{Deserialize, Serialize};

/// Forces usability of every probed ISA (`1`/`0`, `true`/`false`).
pub const ENV_VEC_ISA_OK: &str = "VECISA_OK";
/// Requested vector width in bits. Unset means "pick automatically".
pub const ENV_SIMDLEN: &str = "VECISA_SIMDLEN";
/// Trusted co-compiled mode: the codegen compiler is the one the runtime was built with.
pub const ENV_FBCODE: &str = "VECISA_FBCODE";

/// Override knobs consumed by the selector. Read-only once handed over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// When set, trusted as the result of every dry-compile check.
    pub vec_isa_ok: Option<bool>,
    /// Exact bit width to select. `None` picks the most capable valid ISA.
    pub simdlen: Option<u32>,
    /// Skip probing entirely and assume the 256-bit variant.
    pub fbcode: bool,
}

impl SelectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the recognized options from the process environment.
    /// Unparseable values are ignored with a warning rather than rejected.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn with_vec_isa_ok(mut self, ok: Option<bool>) -> Self {
        self.vec_isa_ok = ok;
        self
    }

    pub fn with_simdlen(mut self, simdlen: Option<u32>) -> Self {
        self.simdlen = simdlen;
        self
    }

    pub fn with_fbcode(mut self, fbcode: bool) -> Self {
        self.fbcode = fbcode;
        self
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vec_isa_ok = lookup(ENV_VEC_ISA_OK).and_then(|raw| {
            let parsed = parse_bool(&raw);
            if parsed.is_none() {
                tracing::warn!("ignoring {}={:?}: expected a boolean", ENV_VEC_ISA_OK, raw);
            }
            parsed
        });

        let simdlen = lookup(ENV_SIMDLEN).and_then(|raw| {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
                return None;
            }
            match trimmed.parse::<u32>() {
                Ok(width) => Some(width),
                Err(_) => {
                    tracing::warn!("ignoring {}={:?}: expected a bit width", ENV_SIMDLEN, raw);
                    None
                }
            }
        });

        let fbcode = lookup(ENV_FBCODE)
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(false);

        Self {
            vec_isa_ok,
            simdlen,
            fbcode,
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
