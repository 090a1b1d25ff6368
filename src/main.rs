//! MBBS CPU - CLI Entry Point
//!
//! Commands:
//! - `mbbs-cpu run <image.json>` - Run a module image against a logging host
//! - `mbbs-cpu disasm <image.json>` - Disassemble the image's code segments

use clap::{Parser, Subcommand};
use mbbs_cpu::cpu::{ImportOrdinal, Memory, Registers};
use mbbs_cpu::{ExternalFunctions, ExternalMemory, HostError};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "mbbs-cpu")]
#[command(version = "0.1.0")]
#[command(about = "A 16-bit segmented x86 interpreter for legacy BBS module code")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a module image from its entry point
    Run {
        /// Path to the JSON image manifest
        image: String,
        /// Maximum number of instructions (overrides the manifest)
        #[arg(short, long)]
        max_steps: Option<u64>,
        /// Log every executed instruction
        #[arg(short, long)]
        trace: bool,
    },
    /// Disassemble code segments of a module image
    Disasm {
        /// Path to the JSON image manifest
        image: String,
        /// Only this segment ordinal
        #[arg(short, long)]
        segment: Option<u16>,
    },
}

/// Host that logs every import call and returns zero.
struct ConsoleHost;

impl ExternalFunctions for ConsoleHost {
    fn invoke(
        &mut self,
        regs: &mut Registers,
        _mem: &mut Memory,
        import: ImportOrdinal,
    ) -> Result<u16, HostError> {
        info!(
            module = import.module,
            function = import.function,
            sp = regs.sp,
            "import called"
        );
        Ok(0)
    }
}

impl ExternalMemory for ConsoleHost {
    fn read_word(&mut self, segment: u16, offset: u16) -> Result<u16, HostError> {
        warn!(segment, offset, "host memory read, returning 0");
        Ok(0)
    }
}

fn main() {
    let cli = Cli::parse();

    let level = match &cli.command {
        Commands::Run { trace: true, .. } => Level::TRACE,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            image,
            max_steps,
            trace: _,
        } => run_image(&image, max_steps),
        Commands::Disasm { image, segment } => disassemble_image(&image, segment),
    }
}

fn run_image(path: &str, max_steps: Option<u64>) {
    use mbbs_cpu::{load_image, Cpu, CpuError};

    let image = match load_image(path) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("❌ Failed to load image: {}", e);
            std::process::exit(1);
        }
    };

    let mut cpu = match Cpu::new(ConsoleHost, ConsoleHost) {
        Ok(cpu) => cpu.with_span(tracing::info_span!("module", image = path)),
        Err(e) => {
            eprintln!("❌ Failed to create context: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = image.boot(&mut cpu) {
        eprintln!("❌ Failed to load segments: {}", e);
        std::process::exit(1);
    }

    let budget = max_steps.unwrap_or(image.max_steps);
    println!(
        "Running {} from {:04X}:{:04X} ({} segments, budget {} steps)",
        path,
        image.entry.cs,
        image.entry.ip,
        image.segments.len(),
        budget
    );

    let result = cpu.run_limited(budget);

    println!();
    println!("━━━ Result ━━━");
    println!("Steps: {}", cpu.steps);
    println!("{:?}", cpu.regs);

    match result {
        Ok(_) => println!("Reached step budget ({}). Use --max-steps to change it.", budget),
        Err(e @ CpuError::UnsupportedInstruction { .. }) => {
            eprintln!("❌ Stopped: {}", e);
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("❌ CPU error at {:04X}:{:04X}: {}", cpu.regs.cs, cpu.regs.ip, e);
            std::process::exit(1);
        }
    }
}

fn disassemble_image(path: &str, only: Option<u16>) {
    use mbbs_cpu::{disassemble, load_image};

    let image = match load_image(path) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("❌ Failed to load image: {}", e);
            std::process::exit(1);
        }
    };

    let mut mem = Memory::new();
    if let Err(e) = image.install(&mut mem) {
        eprintln!("❌ Failed to load segments: {}", e);
        std::process::exit(1);
    }

    for ordinal in mem.segment_ordinals() {
        if only.map_or(false, |wanted| wanted != ordinal) {
            continue;
        }
        if let Some(segment) = mem.segment(ordinal).filter(|s| s.is_code()) {
            println!("{}", disassemble(segment));
        }
    }
}
