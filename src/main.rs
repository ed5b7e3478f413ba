//! quicktrace CLI
//!
//! Runs bytecode programs on the reference interpreter with the trace JIT
//! attached, and inspects or converts program files.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use quicktrace::bytecode::{disassemble_program, Program};
use quicktrace::runtime::builtins;
use quicktrace::{demos, Interpreter, JitConfig, VERSION};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quicktrace")]
#[command(author, version, about = "A trace-based JIT for a YARV-style bytecode interpreter", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program file (.json, .qtb image or assembly text)
    Run {
        file: PathBuf,
        #[command(flatten)]
        jit: JitArgs,
    },

    /// Run a built-in workload; lists them without a name
    Demo {
        name: Option<String>,
        #[command(flatten)]
        jit: JitArgs,
    },

    /// Disassemble a program file or a built-in workload
    Disasm {
        /// File path or demo name
        input: String,
    },

    /// Convert a program to a binary image (or JSON with --json)
    Build {
        input: PathBuf,
        /// Output path
        #[arg(short, long)]
        output: PathBuf,
        /// Write JSON instead of a binary image
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct JitArgs {
    /// Interpret only
    #[arg(long)]
    no_jit: bool,

    /// JIT configuration file (JSON)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log the IR of every submitted trace
    #[arg(long)]
    dump_ir: bool,

    /// Print JIT statistics after the run
    #[arg(long)]
    stats: bool,

    /// Print statistics as JSON
    #[arg(long, requires = "stats")]
    json: bool,
}

impl JitArgs {
    fn config(&self) -> anyhow::Result<JitConfig> {
        let mut config = match &self.config {
            Some(path) => JitConfig::load(path)
                .with_context(|| format!("loading JIT configuration {}", path.display()))?,
            None => JitConfig::default(),
        };
        if self.no_jit {
            config.enabled = false;
        }
        if self.dump_ir {
            config.dump_ir = true;
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run { file, jit } => {
            let program = Program::load(&file).with_context(|| format!("loading {}", file.display()))?;
            run_program(&program, &jit)
        }
        Commands::Demo { name: None, .. } => {
            println!("quicktrace {} demos:", VERSION);
            for demo in demos::DEMOS {
                println!("  {:<10} {}", demo.name, demo.description);
            }
            Ok(())
        }
        Commands::Demo { name: Some(name), jit } => {
            let program = demos::find(&name)?.program()?;
            run_program(&program, &jit)
        }
        Commands::Disasm { input } => {
            let program = load_input(&input)?;
            print!("{}", disassemble_program(&program));
            Ok(())
        }
        Commands::Build { input, output, json } => build(&input, &output, json),
    }
}

/// Map `-v` counts to a filter unless `RUST_LOG` is set
fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_input(input: &str) -> anyhow::Result<Program> {
    if Path::new(input).exists() {
        return Program::load(input).with_context(|| format!("loading {}", input));
    }
    match demos::find(input) {
        Ok(demo) => Ok(demo.program()?),
        Err(_) => bail!("{} is neither a file nor a demo", input),
    }
}

fn run_program(program: &Program, args: &JitArgs) -> anyhow::Result<()> {
    let config = args.config()?;
    let mut interp = Interpreter::with_jit(config)?;
    interp.load(program)?;

    let start = Instant::now();
    let result = interp.run();
    let elapsed = start.elapsed();
    print!("{}", interp.take_output());
    let value = result.context("program raised")?;
    println!("=> {}", builtins::inspect(interp.machine(), &value));

    if args.stats {
        match interp.jit_stats() {
            Some(stats) if args.json => println!("{}", stats.to_json()?),
            Some(stats) => {
                eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
                eprintln!("JIT statistics ({:?})", elapsed);
                eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
                eprint!("{}", stats);
            }
            None => eprintln!("JIT disabled ({:?})", elapsed),
        }
    }
    Ok(())
}

fn build(input: &Path, output: &Path, json: bool) -> anyhow::Result<()> {
    let program = Program::load(input).with_context(|| format!("loading {}", input.display()))?;
    if json {
        fs::write(output, program.to_json_string()?)?;
    } else {
        fs::write(output, program.to_image()?)?;
    }
    eprintln!("wrote {}", output.display());
    Ok(())
}
