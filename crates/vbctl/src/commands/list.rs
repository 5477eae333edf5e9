use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use libvb::{ResourceKind, Selector};

use super::print_yaml;
use crate::config::CtlConfig;

fn parse_kind(s: &str) -> Result<ResourceKind, String> {
    ResourceKind::from_str(s).map_err(|_| format!("unknown resource kind {s}"))
}

#[derive(Parser, Debug)]
pub struct List {
    /// domain, network, storage_pool, interface, node_device, secret, nw_filter, snapshot
    /// or snapshot_child
    #[arg(value_parser = parse_kind)]
    kind: ResourceKind,

    /// List defined (inactive) resources instead of active ones
    #[arg(long)]
    defined: bool,

    /// Node device capability
    #[arg(long)]
    capability: Option<String>,

    /// Domain owning the snapshots
    #[arg(short, long)]
    domain: Option<String>,

    /// Parent snapshot, for snapshot_child
    #[arg(short, long)]
    snapshot: Option<String>,
}

pub fn list(config: &CtlConfig, args: List) -> Result<()> {
    let binding = config.connect()?;

    if args.kind == ResourceKind::Domain && !args.defined {
        return print_yaml(&binding.list_domain_ids()?);
    }

    let mut selector = if args.defined {
        Selector::defined()
    } else {
        Selector::active()
    };
    if let Some(capability) = args.capability {
        selector = selector.with_capability(capability);
    }
    if let Some(domain) = args.domain {
        selector = selector.of_domain(domain);
    }
    if let Some(snapshot) = args.snapshot {
        selector = selector.of_snapshot(snapshot);
    }

    print_yaml(&binding.list_names(args.kind, &selector)?)
}

pub fn ids(config: &CtlConfig) -> Result<()> {
    let binding = config.connect()?;
    print_yaml(&binding.list_domain_ids()?)
}
