use anyhow::Result;
use clap::{Parser, ValueEnum};
use libvb::StatsTarget;

use super::print_yaml;
use crate::config::CtlConfig;

#[derive(Copy, Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum Source {
    Cpu,
    Memory,
}

#[derive(Parser, Debug)]
pub struct Stats {
    #[arg(value_enum)]
    source: Source,

    /// CPU number or NUMA cell, -1 for all of them
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
    index: i32,
}

pub fn stats(config: &CtlConfig, args: Stats) -> Result<()> {
    let binding = config.connect()?;
    let target = match args.source {
        Source::Cpu => StatsTarget::Cpu(args.index),
        Source::Memory => StatsTarget::Memory(args.index),
    };
    print_yaml(&binding.node_stats(target, config.flags)?)
}
