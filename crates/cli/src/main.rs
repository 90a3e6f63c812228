//! The `palladium` interpreter entry point.
//!
//! Argument handling is hand-rolled rather than `clap`-based: an exact
//! usage line and a fixed exit-code mapping are required, and `clap`'s
//! generated `--help`/usage text would fight that contract.

use pd_compiler::CompilerConfig;
use pd_core::Object;
use pd_runtime::Vm;
use std::fs;
use std::io;
use std::process;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("palladium=info".parse().unwrap()),
        )
        .with_writer(io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let mut script_path = None;
    let mut disassemble = false;
    let mut script_args = Vec::new();

    for arg in &mut args {
        if arg == "--disassemble" {
            disassemble = true;
        } else if script_path.is_none() {
            script_path = Some(arg);
        } else {
            script_args.push(arg);
        }
    }

    let Some(script_path) = script_path else {
        eprintln!("Usage: palladium [script]");
        process::exit(64);
    };

    let source = match fs::read_to_string(&script_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {script_path}: {e}");
            process::exit(74);
        }
    };

    let config = CompilerConfig::with_standard_library();
    let artifact = match pd_compiler::compile(&source, config) {
        Ok(artifact) => artifact,
        Err(errors) => {
            for error in &errors {
                eprintln!("{error}");
            }
            process::exit(65);
        }
    };

    if disassemble {
        let rendered = pd_runtime::debug::disassemble_chunk(&artifact.function.chunk, "script", &artifact.heap);
        print!("{rendered}");
    }

    let mut heap = artifact.heap;
    let global_tags = artifact.global_tags;
    let script = heap.alloc(Object::Function(artifact.function));
    let mut vm = Vm::new(heap, io::stdout());
    vm.load_global_tags(global_tags);
    vm.install_standard_library(&script_args);

    match vm.run(script) {
        Ok(()) => process::exit(0),
        Err(error) => {
            eprint!("{error}");
            process::exit(70);
        }
    }
}
