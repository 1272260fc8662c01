use clap::Parser;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use sysinfo::System;
use vecisa::core::diagnostics::Diagnostics;
use vecisa::{IsaSelector, SelectionConfig};

/// Probe this machine and export why each vector ISA was or was not picked.
#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
struct Args {
    /// Write the JSON report here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Require an exact vector width in bits.
    #[arg(short, long)]
    simdlen: Option<u32>,

    /// Trust every dry compile without running it.
    #[arg(long)]
    force_ok: Option<bool>,

    /// Pretend the codegen compiler matches the runtime's.
    #[arg(long)]
    fbcode: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();

    let mut config = SelectionConfig::from_env();
    if args.simdlen.is_some() {
        config.simdlen = args.simdlen;
    }
    if args.force_ok.is_some() {
        config.vec_isa_ok = args.force_ok;
    }
    config.fbcode |= args.fbcode;

    let mut sys = System::new();
    sys.refresh_cpu();
    let cpu_brand = sys
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_default();
    eprintln!("CPU: {}", cpu_brand);

    let selector = IsaSelector::new(
        vecisa::core::hardware::HostFeatureProbe::native(),
        vecisa::core::verifier::DryCompileVerifier::native(),
        config,
    );
    let report = Diagnostics::report(&selector);

    let mut json = serde_json::to_value(&report)?;
    json["cpu_brand"] = serde_json::Value::String(cpu_brand);
    let json = serde_json::to_string_pretty(&json)?;

    match args.output {
        Some(path) => {
            let mut file = File::create(&path)?;
            file.write_all(json.as_bytes())?;
            eprintln!("Exported report to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
