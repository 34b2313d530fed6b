//! Command-line demonstration tool for the signal bus.
//!
//! Run one instance with `--create` to build the segments, then point any
//! number of further instances (producers, consumers, importers) at the
//! same paths:
//!
//! ```text
//! vsi-demo --create import demo.vss
//! vsi-demo fire 1 5 '42 km/h'
//! vsi-demo fetch 1 5 --wait
//! ```
//!
//! ## Exit codes
//!
//! - 0: success
//! - 1: the operation failed (status printed to stderr)

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vsi::{Vsi, VsiConfig};

#[derive(Parser, Debug)]
#[command(name = "vsi-demo")]
#[command(about = "Vehicle signal interface demonstration tool")]
struct Args {
    /// Create the segments instead of attaching to existing ones
    #[arg(long)]
    create: bool,

    /// Path of the user (payload) segment file
    #[arg(long, default_value = "/dev/shm/vsi-user")]
    user_path: PathBuf,

    /// Path of the system (index) segment file
    #[arg(long, default_value = "/dev/shm/vsi-sys")]
    sys_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import signal definitions from a VSS file
    Import { file: PathBuf },

    /// Publish one sample
    Fire {
        domain: u32,
        signal: u32,
        payload: String,
    },

    /// Fetch one sample (oldest first unless --newest)
    Fetch {
        domain: u32,
        signal: u32,
        /// Peek at the newest sample instead of consuming the oldest
        #[arg(long)]
        newest: bool,
        /// Block until a sample arrives
        #[arg(long)]
        wait: bool,
        /// Give up after this many milliseconds (implies --wait)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Drop all queued samples of one signal
    Flush { domain: u32, signal: u32 },

    /// Print allocator statistics
    Stats,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let args = Args::parse();
    let config = VsiConfig {
        user_path: args.user_path.clone(),
        sys_path: args.sys_path.clone(),
        ..VsiConfig::default()
    };

    let attached = if args.create {
        Vsi::create(&config)
    } else {
        Vsi::open(&config)
    };
    let bus = match attached {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("cannot attach to signal store: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&bus, &args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(bus: &Vsi, command: &Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Import { file } => {
            let summary = bus.vss_import(file)?;
            println!(
                "imported {} signals ({} skipped), version {}",
                summary.defined,
                summary.skipped,
                summary.version.as_deref().unwrap_or("unknown")
            );
        }
        Command::Fire {
            domain,
            signal,
            payload,
        } => {
            bus.fire_signal(*domain, *signal, payload.as_bytes())?;
        }
        Command::Fetch {
            domain,
            signal,
            newest,
            wait,
            timeout_ms,
        } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            let data = match (*newest, *wait || timeout.is_some()) {
                (false, false) => bus.get_oldest_signal(*domain, *signal)?,
                (false, true) => bus.get_oldest_signal_wait(*domain, *signal, timeout)?,
                (true, false) => bus.get_newest_signal(*domain, *signal)?,
                (true, true) => bus.get_newest_signal_wait(*domain, *signal, timeout)?,
            };
            match std::str::from_utf8(&data) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{data:?}"),
            }
        }
        Command::Flush { domain, signal } => {
            bus.flush_signal(*domain, *signal)?;
        }
        Command::Stats => {
            println!("{}", bus.alloc_stats());
        }
    }
    Ok(())
}
