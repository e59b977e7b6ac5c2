//! `su`: a minimal driver that loads a compiled Saurus program, installs
//! the standard library, and runs it -- the embedding-API equivalent of
//! the original's `repl/main.c` and `scales/main.c` drivers, collapsed
//! into one non-interactive entry point.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use su_core::{Instruction, Prototype, ProtoId, Value};
use su_runtime::{diagnostics, loader, State};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Loads and runs a compiled Saurus (`.suc`) program.
#[derive(Parser, Debug)]
#[command(name = "su")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to a compiled program produced by the Saurus bytecode writer.
    program: PathBuf,

    /// Arguments passed through to the program as its argument vector.
    #[arg(trailing_var_arg = true)]
    script_args: Vec<String>,

    /// Operand stack capacity, matching `intern.h`'s `STACK_SIZE`.
    #[arg(long, default_value_t = su_runtime::DEFAULT_STACK_SIZE)]
    stack_size: usize,

    /// Maximum call nesting depth, matching `intern.h`'s `MAX_CALLS`.
    #[arg(long, default_value_t = su_runtime::DEFAULT_MAX_CALLS)]
    max_calls: usize,

    /// Live-object count above which an incremental GC cycle begins,
    /// matching `gc.c`'s `ALIVE_OBJECTS`.
    #[arg(long, default_value_t = su_core::gc::DEFAULT_ALIVE_OBJECTS)]
    gc_threshold: usize,

    /// Disassemble the loaded program instead of running it.
    #[arg(long)]
    dump: bool,

    /// Dump VM diagnostics (GC stats, call depth) to stderr after running.
    #[arg(long)]
    diagnostics: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    diagnostics::install_signal_handler();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "program failed");
            eprintln!("su: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), String> {
    let file = File::open(&args.program)
        .map_err(|e| format!("{}: {e}", args.program.display()))?;
    let mut reader = BufReader::new(file);

    let mut state = State::with_limits(args.stack_size, args.max_calls);
    state.heap.alive_threshold = args.gc_threshold;

    let root = loader::load(&mut reader, &mut state.heap.prototypes)
        .map_err(|e| format!("failed to load {}: {e}", args.program.display()))?;
    info!(path = %args.program.display(), "loaded program");

    if args.dump {
        dump_prototype(&state.heap.prototypes, root, 0);
        return Ok(());
    }

    state.lib_init().map_err(|e| e.to_string())?;
    state.load_root(root).map_err(|e| e.to_string())?;
    let closure = match state.get(-1).map_err(|e| e.to_string())? {
        Value::Function(id) => id,
        _ => unreachable!("load_root always pushes a Function"),
    };
    state.pop_n(1).map_err(|e| e.to_string())?;

    let argv: Vec<Value> = args
        .script_args
        .iter()
        .map(|a| {
            state.push_string(a.as_bytes()).map_err(|e| e.to_string())?;
            let v = state.get(-1).map_err(|e| e.to_string())?;
            state.pop_n(1).map_err(|e| e.to_string())?;
            Ok(v)
        })
        .collect::<Result<_, String>>()?;

    let result = state.run_program(closure, argv).map_err(|e| e.to_string());

    if args.diagnostics {
        diagnostics::dump_diagnostics();
    }

    result.map(|_| ())
}

/// Renders one level of the program's disassembly, matching `core.c`'s
/// `print_prototype` debug dump: instruction list, then constants, then
/// nested prototypes recursively under it.
fn dump_prototype(prototypes: &su_core::Arena<Prototype>, id: ProtoId, depth: usize) {
    let indent = "  ".repeat(depth);
    let proto = prototypes.get(id).expect("dangling prototype id");
    let name = if proto.name.is_empty() {
        "<anonymous>".to_string()
    } else {
        String::from_utf8_lossy(&proto.name).into_owned()
    };
    println!("{indent}prototype {name}:");
    for (pc, instr) in proto.instructions.iter().enumerate() {
        println!("{indent}  {pc:4}  {}", format_instruction(instr));
    }
    if !proto.constants.is_empty() {
        println!("{indent}  constants:");
        for (i, c) in proto.constants.iter().enumerate() {
            println!("{indent}    [{i}] {c:?}");
        }
    }
    for sub in &proto.sub_prototypes {
        dump_prototype(prototypes, *sub, depth + 1);
    }
}

fn format_instruction(instr: &Instruction) -> String {
    format!("{:?} a={} b={}", instr.op, instr.a, instr.b)
}
