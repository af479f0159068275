//! `kiln`: compile and run bytecode functions through the JIT pipeline

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kiln_cli::commands::{batch, compile, config, dump, run};
use kiln_cli::{CliConfig, Overrides};
use kiln_jit::Mode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Bytecode-to-IR JIT compiler", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    jit: JitFlags,

    #[command(subcommand)]
    command: Commands,
}

/// Flags that override `kiln.toml`
#[derive(Args)]
struct JitFlags {
    /// Configuration file (default: ./kiln.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Compilation mode: object or integer
    #[arg(long, global = true)]
    mode: Option<Mode>,
    /// Fail instead of recompiling in object mode
    #[arg(long, global = true)]
    no_downgrade: bool,
    /// Skip the optimization passes
    #[arg(long, global = true)]
    no_optimize: bool,
    /// Skip IR verification
    #[arg(long, global = true)]
    no_verify: bool,
    /// Release the execution lock around calls into uncompiled code
    #[arg(long, global = true)]
    release_gil: bool,
    /// Batch worker threads
    #[arg(long, global = true)]
    workers: Option<usize>,
    /// Refuse functions longer than this many code units
    #[arg(long, global = true)]
    max_code_units: Option<usize>,
}

impl JitFlags {
    fn overrides(&self) -> Overrides {
        Overrides {
            mode: self.mode,
            no_downgrade: self.no_downgrade,
            no_optimize: self.no_optimize,
            no_verify: self.no_verify,
            release_gil: self.release_gil,
            workers: self.workers,
            max_code_units: self.max_code_units,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a code object and print a summary
    Compile {
        /// Code object (JSON)
        file: PathBuf,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the instructions, CFG or IR of a code object
    Dump {
        /// Code object (JSON)
        file: PathBuf,
        /// Stage to print
        #[arg(long, value_enum, default_value_t = dump::DumpStage::Ir)]
        stage: dump::DumpStage,
    },

    /// Compile and execute a code object on the portable backend
    Run {
        /// Code object (JSON)
        file: PathBuf,
        /// Integer arguments
        #[arg(allow_negative_numbers = true)]
        args: Vec<i64>,
        /// Maximum blocks plus ops evaluated per run
        #[arg(long)]
        step_limit: Option<usize>,
        /// Stop a generator after this many yields
        #[arg(long, default_value_t = run::DEFAULT_YIELD_LIMIT)]
        yield_limit: usize,
    },

    /// Compile many code objects in parallel
    Batch {
        /// Directories of `.json` code objects, or individual files
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

/// `RUST_LOG` overrides the default of `info` for the kiln crates and `warn` elsewhere
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,kiln=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    let mut settings = CliConfig::load(cli.jit.config.as_deref(), &cwd)?;
    cli.jit.overrides().apply(&mut settings.jit);

    let output = match cli.command {
        Commands::Compile { file, json } => {
            compile::execute(compile::CompileArgs { file: &file, json }, &settings.jit)?
        }
        Commands::Dump { file, stage } => {
            dump::execute(dump::DumpArgs { file: &file, stage }, &settings.jit)?
        }
        Commands::Run { file, args, step_limit, yield_limit } => {
            let run_args = run::RunArgs { file: &file, args: &args, step_limit, yield_limit };
            run::execute(run_args, &settings.jit)?
        }
        Commands::Batch { paths } => {
            batch::execute(batch::BatchArgs { paths: &paths }, &settings.jit)?
        }
        Commands::Config => config::execute(&settings)?,
    };
    print!("{}", output);
    Ok(())
}
