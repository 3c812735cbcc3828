use std::fs::File;
use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;
use simplelog::ColorChoice;
use simplelog::CombinedLogger;
use simplelog::ConfigBuilder;
use simplelog::LevelPadding;
use simplelog::TermLogger;
use simplelog::TerminalMode;
use simplelog::WriteLogger;

use super::Comms;
use super::Simulation;
use crate::config::Override;
use crate::config::SimulationConfig;
use crate::error::Error;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "basis-function expansion N-body integrator")]
pub struct CommandLineOptions {
    /// `section/key:value` overrides applied to the parameter file.
    pub parameter_overrides: Vec<Override>,
    #[clap(long)]
    pub parameter_file_path: Option<PathBuf>,
    #[clap(short, parse(from_occurrences))]
    pub verbosity: usize,
    #[clap(long)]
    pub num_worker_threads: Option<usize>,
}

pub struct SimulationBuilder {
    pub parameter_file_path: Option<PathBuf>,
    pub verbosity: usize,
    pub num_worker_threads: Option<usize>,
    pub parameter_overrides: Vec<Override>,
    pub log: bool,
}

impl Default for SimulationBuilder {
    fn default() -> Self {
        Self {
            parameter_file_path: None,
            verbosity: 0,
            num_worker_threads: None,
            parameter_overrides: vec![],
            log: true,
        }
    }
}

impl SimulationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command_line_options(&mut self, opts: &CommandLineOptions) -> &mut Self {
        self.parameter_file_path = opts.parameter_file_path.clone();
        self.verbosity = opts.verbosity;
        self.num_worker_threads = opts.num_worker_threads;
        self.parameter_overrides = opts.parameter_overrides.clone();
        self
    }

    pub fn update_from_command_line_options(&mut self) -> &mut Self {
        self.with_command_line_options(&CommandLineOptions::parse())
    }

    pub fn log(&mut self, log: bool) -> &mut Self {
        self.log = log;
        self
    }

    /// Read the configuration, set up logging and construct the
    /// simulation on this rank's communicators.
    pub fn build(&self, comms: Comms) -> Result<Simulation, Error> {
        let mut config = match &self.parameter_file_path {
            Some(path) => SimulationConfig::from_file(path, &self.parameter_overrides)?,
            None => SimulationConfig::from_str("", &self.parameter_overrides)?,
        };
        if let Some(threads) = self.num_worker_threads {
            config.run.nthreads = threads;
        }
        if self.log {
            self.init_logging(&config, comms.rank().0, comms.size().0);
        }
        Simulation::new(&config, comms)
    }

    fn init_logging(&self, config: &SimulationConfig, rank: i32, num_ranks: usize) {
        let verbosity = config
            .logging
            .verbosity
            .map(|v| v.max(self.verbosity))
            .unwrap_or(self.verbosity);
        let level = match verbosity {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };
        let log_config = ConfigBuilder::default()
            .set_level_padding(LevelPadding::Right)
            .set_thread_level(LevelFilter::Off)
            .build();
        let padding = ((num_ranks as f64).log10().floor() as usize) + 1;
        let logfile = format!("logs/rank_{:0padding$}.log", rank, padding = padding);
        let result = if rank == 0 {
            let _ = std::fs::create_dir_all("logs");
            match File::create(&logfile) {
                Ok(file) => CombinedLogger::init(vec![
                    TermLogger::new(
                        level,
                        log_config.clone(),
                        TerminalMode::Mixed,
                        ColorChoice::Auto,
                    ),
                    WriteLogger::new(level, log_config, file),
                ]),
                Err(_) => TermLogger::init(
                    level,
                    log_config,
                    TerminalMode::Mixed,
                    ColorChoice::Auto,
                ),
            }
        } else if !config.logging.only_main_rank.unwrap_or(true) {
            match File::create(&logfile) {
                Ok(file) => WriteLogger::init(level, log_config, file),
                Err(_) => return,
            }
        } else {
            return;
        };
        // A second simulation in the same process keeps the first logger.
        let _ = result;
    }
}
