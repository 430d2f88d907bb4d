pub mod align;
pub mod config;
pub mod data;
pub mod error;
pub mod models;
pub mod runtime;
pub mod trainers;

// Re-export common types
pub use config::{Config, Dataset, LossKind, Mode};
pub use data::{DataLoader, Loaders};
pub use error::{ConfigError, DataError};
pub use trainers::{LandmarkSolver, Solver};

pub mod logging {
    use log::LevelFilter;
    use env_logger::Builder;
    use std::io::Write;

    /// Install the process-wide logger. `RUST_LOG` overrides the default `info` level.
    pub fn init_logger() {
        let mut builder = Builder::new();
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info);
        if let Ok(spec) = std::env::var("RUST_LOG") {
            builder.parse_filters(&spec);
        }
        // A second call (tests, embedding) keeps the first logger
        let _ = builder.try_init();
    }
}
