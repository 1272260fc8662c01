//! Loads a dry-compiled probe library and runs its vector kernel.
//!
//! Spawned by `SubprocessLoader` when `VECISA_PROBE_LOADER` points here:
//! exit code 0 means the probe is usable.
//! An illegal instruction kills this process, not the one choosing an ISA.

use libloading::{Library, Symbol};
use std::process::ExitCode;
use vecisa::simd::probe::VEC_KERNEL_SYMBOL;

fn program_name(args: &[String]) -> &str {
    args.first().map_or("probe_loader", String::as_str)
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <probe_library>", program_name(&args));
        return ExitCode::from(2);
    }

    let library = match unsafe { Library::new(&args[1]) } {
        Ok(library) => library,
        Err(e) => {
            eprintln!("failed to load {}: {}", args[1], e);
            return ExitCode::FAILURE;
        }
    };

    // Tile probes only export their own kernel; loading is the whole check for them.
    let kernel: Result<Symbol<unsafe extern "C" fn()>, _> =
        unsafe { library.get(VEC_KERNEL_SYMBOL.as_bytes()) };
    if let Ok(kernel) = kernel {
        unsafe { kernel() };
    }

    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_name_without_argv() {
        assert_eq!(program_name(&[]), "probe_loader");
        assert_eq!(program_name(&["/opt/bin/loader".to_string()]), "/opt/bin/loader");
    }
}
