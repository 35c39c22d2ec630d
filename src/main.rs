//! metatrace - run demo-interpreter programs under the meta-tracer
use metatrace::config::IrStages;
use metatrace::interp::{assemble, locations_for, Vm};
use metatrace::{MtConfig, MT};
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("metatrace v{}", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    metatrace [OPTIONS] <FILE>");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help                   Print this help message");
    eprintln!("    -V, --version                Print version information");
    eprintln!("    -t, --hot-threshold <N>      Visits before a loop is traced (default: 50)");
    eprintln!("    -s, --serialise-compilation  Compile traces on the interpreter thread");
    eprintln!("    -j, --print-jitstate         Print jit-state events to stderr");
    eprintln!("    --print-ir <STAGES>          Dump IR: pre-trace-ir,pre-optimization-ir");
    eprintln!("    --config <FILE>              Read settings from a TOML file");
    eprintln!("    --no-jit                     Interpret only");
    eprintln!("    -v                           Increase log verbosity (repeatable)");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    METATRACE_HOT_THRESHOLD, METATRACE_SERIALISE_COMPILATION,");
    eprintln!("    METATRACE_PRINT_JITSTATE, METATRACE_PRINT_IR, METATRACE_MAX_TRACE_LEN");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    metatrace loop.mt");
    eprintln!("    metatrace -t 0 -s -j loop.mt");
}

fn print_version() {
    println!("metatrace {}", VERSION);
}

struct Options {
    input: Option<PathBuf>,
    config: Option<PathBuf>,
    hot_threshold: Option<u32>,
    serialise: bool,
    print_jitstate: bool,
    print_ir: Option<IrStages>,
    no_jit: bool,
    verbosity: u8,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();

    let mut options = Options {
        input: None,
        config: None,
        hot_threshold: None,
        serialise: false,
        print_jitstate: false,
        print_ir: None,
        no_jit: false,
        verbosity: 0,
    };
    let mut i = 1;

    let value = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("Missing value after {}", flag))
    };

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-V" | "--version" => {
                print_version();
                process::exit(0);
            }
            "-t" | "--hot-threshold" => {
                i += 1;
                let v = value(i, "--hot-threshold")?;
                options.hot_threshold = Some(
                    v.parse()
                        .map_err(|_| format!("Invalid hot threshold: {}", v))?,
                );
            }
            "-s" | "--serialise-compilation" => options.serialise = true,
            "-j" | "--print-jitstate" => options.print_jitstate = true,
            "--print-ir" => {
                i += 1;
                let v = value(i, "--print-ir")?;
                options.print_ir = Some(IrStages::parse_list(&v).map_err(|e| e.to_string())?);
            }
            "--config" => {
                i += 1;
                options.config = Some(PathBuf::from(value(i, "--config")?));
            }
            "--no-jit" => options.no_jit = true,
            "-v" => options.verbosity = options.verbosity.saturating_add(1),
            "-vv" => options.verbosity = options.verbosity.saturating_add(2),
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg => {
                if options.input.is_some() {
                    return Err("Multiple input files specified".to_string());
                }
                options.input = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    Ok(options)
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

/// File settings, then environment, then command-line flags.
fn build_config(options: &Options) -> Result<MtConfig, String> {
    let mut config = match &options.config {
        Some(path) => MtConfig::load(path)
            .map_err(|e| format!("Failed to load '{}': {}", path.display(), e))?,
        None => MtConfig::default(),
    };
    config.merge_env().map_err(|e| e.to_string())?;
    if let Some(t) = options.hot_threshold {
        config.hot_threshold = t;
    }
    if options.serialise {
        config.synchronous_compile = true;
    }
    if options.print_jitstate {
        config.print_jitstate = true;
    }
    if let Some(stages) = options.print_ir {
        config.print_ir = stages;
    }
    Ok(config)
}

fn run(options: &Options) -> Result<i64, String> {
    let Some(input) = &options.input else {
        return Err("Missing input file".to_string());
    };
    let source = fs::read_to_string(input)
        .map_err(|e| format!("Failed to read file '{}': {}", input.display(), e))?;
    let program = assemble(&source).map_err(|e| format!("{}: {}", input.display(), e))?;
    let mut vm = Vm::new(&program, Box::new(io::stdout())).map_err(|e| e.to_string())?;

    if options.no_jit {
        return vm.run(None, &[], &[]).map_err(|e| e.to_string());
    }

    let config = build_config(options)?;
    info!(?config, file = %input.display(), "running");
    let mt = MT::new(config);
    let locs = locations_for(&mt, &program);
    let result = vm.run(Some(&mt), &locs, &[]).map_err(|e| e.to_string())?;
    info!(stats = ?mt.stats(), "finished");
    Ok(result)
}

fn main() {
    let options = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    init_logging(options.verbosity);

    if let Err(e) = run(&options) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
