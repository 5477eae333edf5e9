use clap::Parser;

use self::{list::List, params::Params, stats::Stats, watch::Watch};

pub mod list;
pub mod params;
pub mod stats;
pub mod watch;

#[derive(Parser, Debug)]
pub enum Command {
    /// List resource names
    List(List),

    /// List ids of running domains
    Ids,

    /// Show or change typed parameters
    Params(Params),

    /// Show host statistics
    Stats(Stats),

    /// Print domain events until interrupted
    Watch(Watch),
}

/// Print `value` as a YAML document.
pub fn print_yaml<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(value)?);
    Ok(())
}
