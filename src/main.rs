use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use qcache_sim::mem_hierarchy::error::MemSysResult;
use qcache_sim::mem_hierarchy::hierarchy::{HierarchyConfig, MemoryHierarchy};
use qcache_sim::mem_hierarchy::memory_device::MemoryDevice;
use qcache_sim::mem_hierarchy::tracer::Tracer;
use qcache_sim::trace_replay;

#[derive(Parser, Debug)]
#[command(name = "qcache-sim")]
#[command(about = "Replay a multi-core memory access trace through a simulated cache hierarchy", long_about = None)]
struct Args {
    /// JSON description of the cache levels
    #[arg(short, long)]
    config: PathBuf,

    /// Access trace with one `<core> <address> <R|W>` record per line (stdin if omitted)
    #[arg(short, long)]
    trace: Option<PathBuf>,

    /// Write every access reaching past the last cache level to this file
    #[arg(long)]
    trace_out: Option<PathBuf>,

    /// Override the number of cores from the configuration
    #[arg(long)]
    cores: Option<usize>,
}

fn run(args: Args) -> MemSysResult<()> {
    let mut config = HierarchyConfig::from_file(&args.config)?;
    if let Some(cores) = args.cores {
        config = config.with_cores(cores);
    }

    let tracer = match &args.trace_out {
        Some(path) => Some(Arc::new(Tracer::new(BufWriter::new(File::create(path)?)))),
        None => None,
    };
    let last_level = tracer.clone().map(|t| t as Arc<dyn MemoryDevice>);
    let hierarchy = MemoryHierarchy::build(&config, last_level)?;

    let input: Box<dyn BufRead> = match &args.trace {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(std::io::stdin().lock()),
    };
    let replayed = trace_replay::replay(&hierarchy, trace_replay::parse_trace(input))?;
    tracing::info!("Replayed {} accesses on {} core(s)", replayed, hierarchy.cores());

    hierarchy.finalize(&mut std::io::stdout().lock())?;
    if let Some(tracer) = tracer {
        tracer.flush()?;
    }
    Ok(())
}

fn main() -> ExitCode {
    fmt::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    tracing::info!("Initializing cache hierarchy simulator");

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
