use anyhow::Result;
use lmtran::{runtime, trainers, Config, LandmarkSolver};
use log::info;

fn main() -> Result<()> {
    // Initialize logging
    lmtran::logging::init_logger();

    // Invalid flags exit here with clap's usage error
    let config = Config::parse_resolved();
    info!("{:#?}", config);

    config.dump(&config.config_out)?;
    runtime::init(config.seed, config.cpu)?;

    trainers::run(&config, || LandmarkSolver::new(&config))?;

    info!("Mode {:?} finished", config.mode);
    Ok(())
}
