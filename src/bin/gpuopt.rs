//! Command-line driver for gpuopt.
//!
//! ```text
//! gpuopt optimize kernel.kir --passes remove-barriers,sync-elimination
//! gpuopt translate kernel.kir --level O2 --target amdil -o kernel.il --cfg
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use bumpalo::Bump;
use clap::{Args, Parser, Subcommand};
use gpuopt::optimizer::optimize_in;
use gpuopt::{
    parse_kernel, AllocationStrategy, Architecture, OptimizationLevel, PassMask, TranslationOptions,
    TranslationSession, Translator,
};

#[derive(Parser)]
#[command(name = "gpuopt", version, about = "GPU kernel optimizer and translator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a manual pass selection and print the optimized kernel
    Optimize {
        #[command(flatten)]
        common: CommonArgs,
        /// Passes to run, by name (comma separated) or as a bit mask
        #[arg(short, long, default_value = "none")]
        passes: PassMask,
    },
    /// Optimize at a level and lower to a target architecture
    Translate {
        #[command(flatten)]
        common: CommonArgs,
        /// Optimization level (canonical name or O0, O1, O2, O3, Os)
        #[arg(short, long, default_value = "NoOptimization")]
        level: OptimizationLevel,
        /// Target architecture (defaults to the kernel's own)
        #[arg(short, long)]
        target: Option<Architecture>,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Input kernel file
    input: PathBuf,
    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Physical register budget (default: the architecture's)
    #[arg(short, long)]
    registers: Option<u32>,
    /// Register allocation strategy
    #[arg(long, default_value = "linear-scan")]
    allocator: AllocationStrategy,
    /// Write the control-flow graph to <output>.dot, or stderr without --output
    #[arg(long)]
    cfg: bool,
    /// Print session statistics to stderr
    #[arg(long)]
    stats: bool,
}

impl CommonArgs {
    fn options(&self, passes: PassMask) -> TranslationOptions {
        TranslationOptions {
            input: Some(self.input.clone()),
            output: self.output.clone(),
            register_allocation: self.allocator,
            passes,
            register_count: self.registers,
            cfg: self.cfg,
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let arena = Bump::new();
    let session = TranslationSession::new(&arena);

    let (common, code, cfg) = match cli.command {
        Command::Optimize { common, passes } => {
            let kernel = read_kernel(&common.input)?;
            let optimized = optimize_in(&session, kernel, &common.options(passes))?;
            log::info!(
                "{} statements rewritten, {} spills",
                optimized.report.total_rewritten(),
                optimized.allocation.spills.len()
            );
            (common, optimized.kernel.to_string(), optimized.cfg)
        }
        Command::Translate { common, level, target } => {
            let kernel = read_kernel(&common.input)?;
            let source = kernel.arch();
            let translator = Translator::new(source, target.unwrap_or(source), level);
            let translated = translator.translate_in(&session, kernel, &common.options(PassMask::NONE))?;
            let code = translated.code()?.to_string();
            (common, code, translated.cfg().map(str::to_string))
        }
    };

    match &common.output {
        Some(path) => fs::write(path, &code)?,
        None => print!("{code}"),
    }
    if let Some(dot) = cfg {
        match &common.output {
            Some(path) => {
                let mut dot_path = path.clone().into_os_string();
                dot_path.push(".dot");
                fs::write(dot_path, dot)?;
            }
            None => eprint!("{dot}"),
        }
    }
    if common.stats {
        eprint!("{}", session.stats());
    }
    Ok(())
}

fn read_kernel(path: &Path) -> Result<gpuopt::Kernel, Box<dyn std::error::Error>> {
    let text = fs::read_to_string(path).map_err(|e| format!("reading {}: {e}", path.display()))?;
    Ok(parse_kernel(&text)?)
}
