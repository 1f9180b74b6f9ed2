//! the dynamic-link runner: compile and run a main file against a
//! directory of library files, loading each library into its own segment
//! the first time a `call` into it fails to resolve.

use littlec::driver;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the main source file
    main_file: String,
    /// directory of library source files
    lib_dir: String,
    /// abort after this many executed instructions
    #[arg(long)]
    cycle_limit: Option<u64>,
}

fn main() {
    let args = Args::parse();

    let input = std::fs::read_to_string(&args.main_file).expect("file should be readable");

    let mut libraries = Vec::new();
    let entries = std::fs::read_dir(&args.lib_dir).expect("library directory should be readable");
    for entry in entries {
        let entry = entry.expect("library directory entry should be readable");
        let path = entry.path();
        if path.is_file() {
            let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
            let source = std::fs::read_to_string(&path).expect("library file should be readable");
            libraries.push((name, source));
        }
    }
    // deterministic load order regardless of directory iteration order
    libraries.sort();

    match driver::run_dynamic(&input, &libraries, args.cycle_limit) {
        Ok((result, linker)) => {
            println!("{}", result.output);
            println!("halted: {}", result.reason);
            println!("registers: {}", result.registers);
            println!("cycles: {}", result.cycles);
            for (unit, loaded) in linker.units() {
                let state = if loaded { "loaded" } else { "not loaded" };
                println!("library {unit}: {state}");
            }
            for (function, entry) in &linker.lib_map {
                println!("symbol {function}: segment {}", entry.segment);
            }
            if !result.success {
                std::process::exit(1);
            }
        }
        Err(errors) => {
            for error in errors {
                eprintln!("{error}");
            }
            std::process::exit(1);
        }
    }
}
