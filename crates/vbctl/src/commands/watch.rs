use std::{
    str::FromStr,
    sync::{atomic::AtomicBool, Arc},
};

use anyhow::Result;
use clap::Parser;
use libvb::{DomainEvent, DomainRef, EventKind, Handler, Opaque};
use log::{error, info};
use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};

use crate::config::CtlConfig;

fn parse_event(s: &str) -> Result<EventKind, String> {
    EventKind::from_str(s).map_err(|_| format!("unknown event kind {s}"))
}

#[derive(Parser, Debug)]
pub struct Watch {
    /// Event kinds to subscribe to, the config file's list when omitted
    #[arg(short, long, value_parser = parse_event, action = clap::ArgAction::Append)]
    event: Vec<EventKind>,

    /// Only events of this domain
    #[arg(short, long)]
    domain: Option<String>,
}

#[derive(Serialize)]
struct Record<'a> {
    domain: &'a str,
    id: Option<u32>,
    event: &'a DomainEvent,
}

fn emit(dom: &DomainRef, event: DomainEvent) {
    let record = Record {
        domain: &dom.name,
        id: dom.id,
        event: &event,
    };
    match serde_yaml::to_string(&record) {
        Ok(doc) => print!("---\n{}", doc),
        Err(e) => error!("failed to encode {} event: {}", event.kind(), e),
    }
}

fn printer(kind: EventKind) -> Handler {
    match kind {
        EventKind::Lifecycle => Handler::lifecycle(|_, dom, event, detail, _| {
            emit(dom, DomainEvent::Lifecycle { event, detail })
        }),
        EventKind::Reboot => Handler::reboot(|_, dom, _| emit(dom, DomainEvent::Reboot)),
        EventKind::RtcChange => Handler::rtc_change(|_, dom, utc_offset, _| {
            emit(dom, DomainEvent::RtcChange { utc_offset })
        }),
        EventKind::Watchdog => {
            Handler::watchdog(|_, dom, action, _| emit(dom, DomainEvent::Watchdog { action }))
        }
        EventKind::IoError => Handler::io_error(|_, dom, src_path, dev_alias, action, _| {
            emit(
                dom,
                DomainEvent::IoError {
                    src_path: src_path.to_string(),
                    dev_alias: dev_alias.to_string(),
                    action,
                },
            )
        }),
        EventKind::IoErrorReason => {
            Handler::io_error_reason(|_, dom, src_path, dev_alias, action, reason, _| {
                emit(
                    dom,
                    DomainEvent::IoErrorReason {
                        src_path: src_path.to_string(),
                        dev_alias: dev_alias.to_string(),
                        action,
                        reason: reason.to_string(),
                    },
                )
            })
        }
        EventKind::Graphics => Handler::graphics(
            |_, dom, phase, local, remote, auth_scheme, subject, _| {
                emit(
                    dom,
                    DomainEvent::Graphics {
                        phase,
                        local: local.clone(),
                        remote: remote.clone(),
                        auth_scheme: auth_scheme.to_string(),
                        subject: subject.to_vec(),
                    },
                )
            },
        ),
    }
}

pub fn watch(config: &CtlConfig, args: Watch) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;

    let binding = config.connect()?;
    let kinds = if args.event.is_empty() {
        config.events.clone()
    } else {
        args.event
    };

    for kind in kinds {
        let id =
            binding.register_event(kind, printer(kind), args.domain.as_deref(), Opaque::none())?;
        info!("watching {} events as {}", kind, id);
    }

    let result = libvm::run_event_loop(&stop);
    info!("stopping, deregistering {} handlers", binding.registered().len());
    binding.deregister_all()?;
    result
}
