mod report;

pub use report::{format_summary, report_summary};

use std::fs;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing::info;

use crate::config::{Args, Config};
use crate::coordinator::WorkerCoordinator;
use crate::io::{setup_output, write_summary};

pub struct VirialApplication {
    args: Args,
    config: Config,
}

impl VirialApplication {
    pub fn from_cli() -> Result<Self> {
        let args = Args::parse();
        let config = load_config(&args)?;
        Ok(Self { args, config })
    }

    pub fn new(args: Args, config: Config) -> Self {
        Self { args, config }
    }

    pub fn run(mut self) -> Result<()> {
        setup_output(self.args.output.as_deref(), self.args.verbose);
        info!("Reading configuration from: {}", self.args.config_file);

        self.config.apply_overrides(&self.args);
        self.config.validate().wrap_err("Invalid configuration")?;
        let params = self.config.to_run_params()?;
        info!("Run parameters:\n{:#?}", params);

        let coordinator = WorkerCoordinator::new(params).wrap_err("Unable to set up the run")?;
        let cancel = AtomicBool::new(false);
        let outcome = coordinator.run(&cancel)?;
        coordinator
            .publish(&outcome)
            .wrap_err("Unable to write bin statistics")?;
        if let Some(path) = &coordinator.params().summary_output {
            write_summary(path, &outcome.summary)
                .wrap_err_with(|| format!("Unable to write summary: {}", path.display()))?;
            info!("Summary written to {}", path.display());
        }

        report_summary(&outcome.summary);
        Ok(())
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let config_content = fs::read_to_string(&args.config_file)
        .wrap_err_with(|| format!("Unable to read configuration file: {}", args.config_file))?;

    let config = Config::from_yaml(&config_content).wrap_err("Failed to parse configuration file")?;

    Ok(config)
}
