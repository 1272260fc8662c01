use vecisa::core::hardware::{host_features, Platform};
use vecisa::{pick_vec_isa, ElementType};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    println!("=== Vector ISA Selection ===");

    let platform = Platform::current();
    println!("\n[1] Platform: {:?} / {:?}", platform.os, platform.arch);
    println!("    Host features: {:?}", host_features().short_names());

    println!("\n[2] Probing (first run compiles, later runs reuse the cache)...");
    let isa = pick_vec_isa();

    if !isa.is_valid() {
        println!("    No vector ISA available; generated code stays scalar.");
        return Ok(());
    }

    println!("    Selected: {} ({} bits)", isa, isa.bit_width());
    println!("    Macros: {:?}", isa.macros());
    println!("    Flags: {}", isa.arch_flags());
    for dtype in [ElementType::Float, ElementType::BFloat16, ElementType::Float16] {
        if let Some(n) = isa.nelements(dtype) {
            println!("    {:?} lanes: {}", dtype, n);
        }
    }

    println!("\n=== Done ===");
    Ok(())
}
