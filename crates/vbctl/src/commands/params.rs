use std::{fs, path::PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use libvb::{ParamTarget, ParameterSet};
use log::info;

use super::print_yaml;
use crate::config::CtlConfig;

#[derive(Copy, Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum Owner {
    Scheduler,
    Memory,
    Blkio,
    NodeMemory,
}

#[derive(Parser, Debug)]
pub struct Target {
    #[arg(value_enum)]
    owner: Owner,

    /// Domain the parameters belong to
    #[arg(short, long)]
    domain: Option<String>,

    /// Flags for the call, overrides the config file
    #[arg(long)]
    flags: Option<u32>,
}

impl Target {
    fn resolve(&self) -> Result<ParamTarget> {
        let domain = || match &self.domain {
            Some(domain) => Ok(domain.clone()),
            None => bail!("--domain is required for {:?} parameters", self.owner),
        };
        Ok(match self.owner {
            Owner::Scheduler => ParamTarget::Scheduler { domain: domain()? },
            Owner::Memory => ParamTarget::Memory { domain: domain()? },
            Owner::Blkio => ParamTarget::Blkio { domain: domain()? },
            Owner::NodeMemory => ParamTarget::NodeMemory,
        })
    }
}

#[derive(Subcommand, Debug)]
pub enum ParamsCmd {
    /// Print the current parameters
    Get(Target),

    /// Change parameters from a YAML map of names to values
    Set {
        #[command(flatten)]
        target: Target,

        #[arg(short, long)]
        file: PathBuf,
    },
}

#[derive(Parser, Debug)]
pub struct Params {
    #[command(subcommand)]
    cmd: ParamsCmd,
}

pub fn params(config: &CtlConfig, args: Params) -> Result<()> {
    let binding = config.connect()?;
    match args.cmd {
        ParamsCmd::Get(target) => {
            let flags = target.flags.unwrap_or(config.flags);
            print_yaml(&binding.parameters(&target.resolve()?, flags)?)
        }
        ParamsCmd::Set { target, file } => {
            let flags = target.flags.unwrap_or(config.flags);
            let input: ParameterSet = serde_yaml::from_str(&fs::read_to_string(file)?)?;
            let resolved = target.resolve()?;
            binding.set_parameters(&resolved, &input, flags)?;
            info!("updated {} of {}", input.len(), resolved);
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resolve_target() {
        let target = Target {
            owner: Owner::Blkio,
            domain: Some("vm0".to_string()),
            flags: None,
        };
        assert_eq!(
            target.resolve().unwrap(),
            ParamTarget::Blkio {
                domain: "vm0".to_string()
            }
        );

        let target = Target {
            owner: Owner::Scheduler,
            domain: None,
            flags: None,
        };
        assert!(target.resolve().is_err());

        let target = Target {
            owner: Owner::NodeMemory,
            domain: None,
            flags: Some(1),
        };
        assert_eq!(target.resolve().unwrap(), ParamTarget::NodeMemory);
    }
}
