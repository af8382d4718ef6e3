// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Command line front end for block migration: `send` streams a set of
//! disk images to a file or TCP peer, `recv` reconstructs them.

use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::Instant;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info, LevelFilter};
use thiserror::Error;

use blk_migration::{receiver, MigrationEngine};
use block::raw_sync::RawFileDisk;
use block::{BlockDevice, DeviceList};
use vm_migration::{LiveMigratable, MigrationParams, MigrationSource, MigrationStream};

#[derive(Error, Debug)]
enum Error {
    #[error("Invalid disk specification '{0}', expected name=path")]
    ParseDiskSpec(String),
    #[error("Failed to open disk image '{0}': {1}")]
    OpenDiskImage(String, #[source] std::io::Error),
    #[error("Failed creating block device: {0}")]
    CreateBlockDevice(#[source] block::Error),
    #[error("Failed to connect to '{0}': {1}")]
    Connect(String, #[source] std::io::Error),
    #[error("Failed to listen on '{0}': {1}")]
    Bind(String, #[source] std::io::Error),
    #[error("Migration failed: {0}")]
    Migration(#[source] vm_migration::MigratableError),
    #[error("Failed to apply the migration stream: {0}")]
    Load(#[source] blk_migration::Error),
    #[error("Failed to flush the migration stream: {0}")]
    StreamFlush(#[source] std::io::Error),
    #[error("Error setting up logger: {0}")]
    LoggerSetup(#[source] log::SetLoggerError),
}

struct Logger {
    output: Mutex<Box<dyn Write + Send>>,
    start: Instant,
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = Instant::now();
        let duration = now.duration_since(self.start);

        if record.file().is_some() && record.line().is_some() {
            writeln!(
                *(*(self.output.lock().unwrap())),
                "blockmig: {:.6?}: <{}> {}:{}:{} -- {}",
                duration,
                record.level(),
                record.target(),
                record.file().unwrap(),
                record.line().unwrap(),
                record.args()
            )
        } else {
            writeln!(
                *(*(self.output.lock().unwrap())),
                "blockmig: {:.6?}: <{}> {} -- {}",
                duration,
                record.level(),
                record.target(),
                record.args()
            )
        }
        .ok();
    }

    fn flush(&self) {}
}

fn create_app() -> Command {
    let disk_arg = Arg::new("disk")
        .long("disk")
        .help("Block device to migrate, as name=path")
        .num_args(1)
        .action(ArgAction::Append)
        .required(true);

    Command::new("blockmig")
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Live block device migration")
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Set the level of debugging output")
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("send")
                .about("Stream the disks to a peer")
                .arg(disk_arg.clone())
                .arg(
                    Arg::new("to")
                        .long("to")
                        .help("Destination: a file path or tcp:HOST:PORT")
                        .num_args(1)
                        .required(true),
                )
                .arg(
                    Arg::new("shared")
                        .long("shared")
                        .help("The base image is shared with the destination")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("sparse")
                        .long("sparse")
                        .help("Elide all-zero chunks during the bulk phase")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("downtime")
                        .long("downtime")
                        .help("Downtime budget in seconds for the convergence test")
                        .num_args(1)
                        .default_value("0.03"),
                )
                .arg(
                    Arg::new("bwidth")
                        .long("bwidth")
                        .help("Bytes transferred per iteration window, 0 for unlimited")
                        .num_args(1)
                        .default_value("0"),
                ),
        )
        .subcommand(
            Command::new("recv")
                .about("Reconstruct the disks from a peer's stream")
                .arg(disk_arg)
                .arg(
                    Arg::new("from")
                        .long("from")
                        .help("Source: a file path or tcp:BIND_ADDR:PORT")
                        .num_args(1)
                        .required(true),
                ),
        )
}

fn parse_disks(matches: &ArgMatches) -> Result<DeviceList, Error> {
    let mut list = DeviceList::new();
    for spec in matches.get_many::<String>("disk").unwrap() {
        let (name, path) = spec
            .split_once('=')
            .ok_or_else(|| Error::ParseDiskSpec(spec.clone()))?;
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::OpenDiskImage(path.to_string(), e))?;
        let device = BlockDevice::new(name, Box::new(RawFileDisk::new(file)), false)
            .map_err(Error::CreateBlockDevice)?;
        list.insert(device);
    }
    Ok(list)
}

fn open_sink(to: &str) -> Result<Box<dyn Write + Send>, Error> {
    if let Some(addr) = to.strip_prefix("tcp:") {
        let stream =
            TcpStream::connect(addr).map_err(|e| Error::Connect(addr.to_string(), e))?;
        Ok(Box::new(stream))
    } else {
        let file = File::create(to).map_err(|e| Error::OpenDiskImage(to.to_string(), e))?;
        Ok(Box::new(file))
    }
}

fn open_source(from: &str) -> Result<Box<dyn Read + Send>, Error> {
    if let Some(addr) = from.strip_prefix("tcp:") {
        let listener = TcpListener::bind(addr).map_err(|e| Error::Bind(addr.to_string(), e))?;
        let (stream, peer) = listener
            .accept()
            .map_err(|e| Error::Bind(addr.to_string(), e))?;
        info!("accepted migration connection from {peer}");
        Ok(Box::new(stream))
    } else {
        let file = File::open(from).map_err(|e| Error::OpenDiskImage(from.to_string(), e))?;
        Ok(Box::new(file))
    }
}

/// The sender-side driver: run the lifecycle until the engine converges,
/// then the final synchronous pass with the rate limit lifted.
fn run_send(matches: &ArgMatches) -> Result<(), Error> {
    let list = parse_disks(matches)?;
    let params = MigrationParams {
        blk: true,
        shared: matches.get_flag("shared"),
        sparse: matches.get_flag("sparse"),
        max_downtime: matches
            .get_one::<String>("downtime")
            .unwrap()
            .parse()
            .unwrap_or(MigrationParams::default().max_downtime),
    };
    let bwidth: u64 = matches
        .get_one::<String>("bwidth")
        .unwrap()
        .parse()
        .unwrap_or(0);

    let sink = open_sink(matches.get_one::<String>("to").unwrap())?;
    let mut f = MigrationStream::with_rate_limit(sink, bwidth);

    let mut engine = MigrationEngine::new(list);
    engine.set_params(&params);

    engine.setup(&mut f).map_err(Error::Migration)?;
    info!("block migration: {} bytes to transfer", engine.bytes_total());

    loop {
        f.replenish_rate_window();
        if engine.iterate(&mut f).map_err(Error::Migration)? {
            break;
        }
        f.flush().map_err(Error::StreamFlush)?;
    }

    // The guest would be paused here; wait out the pipeline and run the
    // final pass unthrottled.
    engine.drain_in_flight();
    f.set_rate_limit_window(0);
    engine.complete(&mut f).map_err(Error::Migration)?;
    f.flush().map_err(Error::StreamFlush)?;

    info!(
        "block migration: {} bytes on the wire",
        f.bytes_transferred()
    );
    Ok(())
}

/// The receiver-side driver: apply stream sections until the peer
/// closes the connection.
fn run_recv(matches: &ArgMatches) -> Result<(), Error> {
    let list = parse_disks(matches)?;
    let source = open_source(matches.get_one::<String>("from").unwrap())?;
    let mut f = MigrationSource::new(source);

    loop {
        match receiver::load(&list, &mut f) {
            Ok(()) => {}
            Err(blk_migration::Error::StreamRead(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                // The peer is done sending.
                return Ok(());
            }
            Err(e) => return Err(Error::Load(e)),
        }
    }
}

fn main() {
    let matches = create_app().get_matches();

    let log_level = match matches.get_count("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(e) = log::set_boxed_logger(Box::new(Logger {
        output: Mutex::new(Box::new(std::io::stderr())),
        start: Instant::now(),
    }))
    .map(|()| log::set_max_level(log_level))
    .map_err(Error::LoggerSetup)
    {
        eprintln!("blockmig: {e}");
        std::process::exit(1);
    }

    let result = match matches.subcommand() {
        Some(("send", sub)) => run_send(sub),
        Some(("recv", sub)) => run_recv(sub),
        _ => unreachable!(),
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let app = create_app();
        let matches = app
            .try_get_matches_from([
                "blockmig", "-v", "send", "--disk", "vda=/tmp/a.img", "--disk", "vdb=/tmp/b.img",
                "--to", "tcp:127.0.0.1:4444", "--sparse",
            ])
            .unwrap();
        assert_eq!(matches.get_count("v"), 1);
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "send");
        let disks: Vec<&String> = sub.get_many::<String>("disk").unwrap().collect();
        assert_eq!(disks.len(), 2);
        assert!(sub.get_flag("sparse"));
        assert!(!sub.get_flag("shared"));
        assert_eq!(sub.get_one::<String>("bwidth").unwrap(), "0");
    }

    #[test]
    fn test_cli_requires_subcommand() {
        create_app().try_get_matches_from(["blockmig"]).unwrap_err();
    }
}
