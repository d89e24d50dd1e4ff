use clap::Parser;
use log::{error, info, warn, Level};
use simple_logger::init_with_level;

use iso_filter::{cli::Args, core::filter_isoforms};

fn main() {
    let start = std::time::Instant::now();
    if let Err(e) = init_with_level(Level::Info) {
        eprintln!("Could not initialize logger: {}", e);
    }

    let args: Args = Args::parse();
    info!("iso-filter v{}", config::VERSION);

    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build_global()
    {
        warn!("Could not configure thread pool: {}", e);
    }

    let summary = filter_isoforms(args.command).unwrap_or_else(|e| {
        error!("{}", e);
        std::process::exit(e.exit_code());
    });

    info!(
        "Filtered {} isoforms with the {} strategy: {} retained",
        summary.total, summary.strategy, summary.retained
    );

    let elapsed = start.elapsed();
    info!("Elapsed time: {:.3?}", elapsed);
}
