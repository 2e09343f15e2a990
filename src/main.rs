#[macro_use]
extern crate log;

mod mkfs;
mod vsfs;

use anyhow::{anyhow, Context};
use byte_unit::Byte;
use clap::{arg, Arg, ArgMatches, Command};
use std::process;
use vsfs::{fs::Vsfs, Error, ErrorKind, NAME_LEN};

fn main() {
    let matches = Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(arg!(-v --verbose ... "Log more detail (repeat for more)"))
        .arg(arg!(<image> "Location of the file system image"))
        .subcommand_required(true)
        .subcommand(
            Command::new("create")
                .about("Journal the creation of a file in the root directory")
                .arg(arg!(<name> "Name of the new file")),
        )
        .subcommand(
            Command::new("install")
                .about("Apply committed journal transactions and empty the journal"),
        )
        .subcommand(
            Command::new("status").about("Show journal usage and pending transactions"),
        )
        .subcommand(Command::new("ls").about("List the installed root directory"))
        .subcommand(
            Command::new("mkfs")
                .about("Create a new file system image")
                .arg(
                    Arg::new("journal-blocks")
                        .short('j')
                        .long("journal-blocks")
                        .takes_value(true)
                        .value_name("N")
                        .help("Journal size in blocks [default: 16]"),
                )
                .arg(
                    Arg::new("inodes")
                        .short('i')
                        .long("inodes")
                        .takes_value(true)
                        .value_name("N")
                        .help("Number of inodes [default: 64]"),
                )
                .arg(
                    Arg::new("data-blocks")
                        .short('d')
                        .long("data-blocks")
                        .takes_value(true)
                        .value_name("N")
                        .help("Data region size in blocks [default: 64]"),
                ),
        )
        .get_matches();

    init_logger(matches.occurrences_of("verbose"));

    if let Err(err) = run(&matches) {
        eprintln!("Error: {:#}", err);
        if let Some(hint) = hint(&err) {
            eprintln!("{}", hint);
        }
        process::exit(exit_code(&err));
    }
}

fn init_logger(verbosity: u64) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let image = matches
        .value_of("image")
        .ok_or_else(|| anyhow!("missing image path"))?;

    match matches.subcommand() {
        Some(("mkfs", matches)) => {
            let defaults = mkfs::Geometry::default();
            let geometry = mkfs::Geometry {
                journal_blocks: number(matches, "journal-blocks", defaults.journal_blocks)?,
                inode_count: number(matches, "inodes", defaults.inode_count)?,
                data_blocks: number(matches, "data-blocks", defaults.data_blocks)?,
            };

            let sb = mkfs::make(image, &geometry)
                .with_context(|| format!("Failed to create {}", image))?;
            println!(
                "Created {} ({}, {} blocks, journal {})",
                image,
                size(sb.total_blocks as u64 * sb.block_size as u64),
                sb.total_blocks,
                size(sb.journal_blocks() as u64 * sb.block_size as u64)
            );
        }
        Some(("create", matches)) => {
            let name = matches
                .value_of("name")
                .ok_or_else(|| anyhow!("missing file name"))?;
            let mut fs = open(image)?;
            let ino = fs
                .create(name)
                .with_context(|| format!("Failed to journal creation of '{}'", name))?;

            if name.len() >= NAME_LEN {
                warn!("name truncated to {} bytes", NAME_LEN - 1);
            }
            println!("Created journal entry for file '{}' (inode {})", name, ino);
        }
        Some(("install", _)) => {
            let mut fs = open(image)?;
            let summary = fs.install().context("Failed to apply journal")?;

            if summary.transactions == 0 && summary.discarded == 0 {
                println!("Journal is empty");
            } else {
                println!(
                    "Applied {} journaled transaction(s) ({} blocks)",
                    summary.transactions, summary.blocks
                );
            }
            if summary.discarded > 0 {
                println!(
                    "Discarded {} record(s) of an incomplete transaction",
                    summary.discarded
                );
            }
        }
        Some(("status", _)) => {
            let fs = open(image)?;
            let status = fs.status()?;

            println!(
                "journal:      {} of {} used",
                size(status.bytes_used as u64),
                size(status.capacity as u64)
            );
            println!(
                "pending:      {} transaction(s), {} block(s)",
                status.transactions, status.pending_blocks
            );
            println!("uncommitted:  {}", size(status.uncommitted_bytes as u64));
            println!(
                "inodes:       {} of {} allocated",
                status.inodes_allocated, status.inode_capacity
            );
        }
        Some(("ls", _)) => {
            let fs = open(image)?;
            for (ino, name) in fs.list()? {
                println!("{:>5}  {}", ino, name);
            }
        }
        _ => unreachable!("clap requires a subcommand"),
    }

    Ok(())
}

fn open(image: &str) -> anyhow::Result<Vsfs<vsfs::device::ImageFile>> {
    Vsfs::open_image(image).with_context(|| format!("Failed to open {}", image))
}

fn number(matches: &ArgMatches, name: &str, default: u32) -> anyhow::Result<u32> {
    match matches.value_of(name) {
        Some(value) => value
            .parse::<u32>()
            .with_context(|| format!("Invalid value for --{}: {}", name, value)),
        None => Ok(default),
    }
}

fn size(bytes: u64) -> String {
    Byte::from_bytes(bytes as _)
        .get_appropriate_unit(true)
        .to_string()
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<Error>().map_or(1, Error::exit_code)
}

fn hint(err: &anyhow::Error) -> Option<&'static str> {
    match err.downcast_ref::<Error>() {
        Some(Error::JournalFull { .. }) => Some("Run 'install' first to free journal space."),
        Some(err) if err.kind() == ErrorKind::Corruption => {
            Some("The journal was left untouched; transactions before the damaged record were applied.")
        }
        _ => None,
    }
}
