use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::error;

use crate::config::CtlConfig;

mod commands;
mod config;

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Opts {
    /// YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// libvirt connection URI, overrides the config file
    #[arg(short, long, global = true)]
    uri: Option<String>,

    #[clap(subcommand)]
    subcmd: commands::Command,
}

fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    let opts = Opts::parse();

    let mut config = CtlConfig::load(opts.config.as_deref())?;
    if let Some(uri) = opts.uri {
        config.uri = uri;
    }

    let cmd_result = match opts.subcmd {
        commands::Command::List(list) => commands::list::list(&config, list),
        commands::Command::Ids => commands::list::ids(&config),
        commands::Command::Params(params) => commands::params::params(&config, params),
        commands::Command::Stats(stats) => commands::stats::stats(&config, stats),
        commands::Command::Watch(watch) => commands::watch::watch(&config, watch),
    };

    if let Err(ref e) = cmd_result {
        error!("error in executing command: {:?}", e);
    }

    cmd_result
}
