//! A command-line tool for programming flash and EEPROM parts through the
//! Flash Gordon bootloader.
//!
//! The chip sits in a socket on a small microcontroller board that speaks a
//! line-based text protocol over a serial port. This tool streams images to
//! it, reads the chip back, and erases it.

use std::{
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use indicatif::ProgressBar;
use log::{debug, error, info, trace};

use flash_gordon::{
    ChipType, Error, Event, Link, Observer, Programmer, SerialLink, TransferParams,
};

/// A tool for talking to the Flash Gordon chip programmer.
///
/// The programmer must be sitting at its "Enter Command" prompt. Anything it
/// printed before we connected is drained and ignored.
#[derive(Debug, Parser)]
#[clap(version)]
struct FlashTool {
    /// Serial port the programmer is attached to.
    #[clap(long, global = true, default_value = "/dev/ttyUSB0")]
    serial_port: String,
    #[clap(long, short, global = true, default_value_t = 57_600)]
    baud_rate: u32,
    /// How long the port may stay quiet, in milliseconds, before we decide
    /// the programmer has finished talking.
    #[clap(long, global = true, default_value_t = 500)]
    read_timeout: u64,
    /// Speak the protocol on stdin/stdout instead of a serial port.
    #[clap(long, global = true)]
    local: bool,
    /// The socket holds a 32-pin flash chip.
    #[clap(long = "32pin-flash", global = true)]
    flash_32pin: bool,
    /// The socket holds a 28-pin EEPROM.
    #[clap(long = "28pin-eeprom", global = true)]
    eeprom_28pin: bool,
    /// Address on the chip to start at.
    #[clap(long, global = true, default_value_t = 0, value_parser = parse_int::parse::<u32>)]
    base_addr: u32,
    #[clap(long, short('v'), global = true)]
    verbose: bool,

    #[clap(subcommand)]
    cmd: SubCmd,
}

#[derive(Debug, Parser)]
enum SubCmd {
    /// Writes a binary image to the chip.
    Upload {
        /// Image to write; "-" reads it from standard input.
        input_file: PathBuf,
    },
    /// Reads the chip back, saving the programmer's hex dump to a file.
    Dump {
        /// Output file. Replaced if it already exists.
        output_file: PathBuf,
        /// Number of bytes to dump.
        #[clap(long, default_value_t = 1024, value_parser = parse_int::parse::<u32>)]
        length: u32,
    },
    /// Erases the whole chip, or a single sector.
    Erase {
        /// Erase only this sector.
        #[clap(long, value_parser = parse_int::parse::<u32>)]
        sector: Option<u32>,
    },
}

/// An operation with its files already open, ready to go once the link is
/// up.
enum Job {
    Upload {
        chip: ChipType,
        source: Box<dyn Read>,
        size: Option<u64>,
    },
    Dump {
        output: File,
        path: PathBuf,
        length: u32,
    },
    Erase {
        sector: Option<u32>,
    },
}

fn main() -> Result<()> {
    let args = FlashTool::parse();

    env_logger::Builder::from_env(
        Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    // Everything that can be checked without the programmer gets checked
    // before we touch it.
    let job = prepare(&args)?;

    info!("Flash Gordon starting up");
    let params = TransferParams::default();
    if args.local {
        info!("using stdin/stdout");
        run(Link::local(), params, args.base_addr, job)
    } else {
        info!("serial port {} at {} baud", args.serial_port, args.baud_rate);
        let link = SerialLink::open_serial(
            &args.serial_port,
            args.baud_rate,
            Duration::from_millis(args.read_timeout),
        )
        .with_context(|| format!("can't connect to programmer on {}", args.serial_port))?;
        run(link, params, args.base_addr, job)
    }
}

fn prepare(args: &FlashTool) -> Result<Job> {
    Ok(match &args.cmd {
        SubCmd::Upload { input_file } => {
            let chip = ChipType::from_flags(args.flash_32pin, args.eeprom_28pin)?;
            let (source, size): (Box<dyn Read>, _) = if input_file == Path::new("-") {
                if args.local {
                    return Err(Error::Config(
                        "can't read the image from stdin while stdin is the link".into(),
                    )
                    .into());
                }
                (Box::new(io::stdin()) as Box<dyn Read>, None)
            } else {
                let file = File::open(input_file)
                    .with_context(|| format!("unable to open {}", input_file.display()))?;
                let size = file.metadata().ok().map(|m| m.len());
                (Box::new(file), size)
            };
            Job::Upload { chip, source, size }
        }
        SubCmd::Dump { output_file, length } => {
            let output = File::create(output_file)
                .with_context(|| format!("unable to create {}", output_file.display()))?;
            Job::Dump {
                output,
                path: output_file.clone(),
                length: *length,
            }
        }
        SubCmd::Erase { sector } => Job::Erase { sector: *sector },
    })
}

fn run<R: Read, W: Write>(
    link: Link<R, W>,
    params: TransferParams,
    base_addr: u32,
    job: Job,
) -> Result<()> {
    let mut programmer = Programmer::new(link, params);

    match job {
        Job::Upload { chip, source, size } => {
            info!("sending image as {chip:?} starting at {base_addr:#x}...");
            let bar = match size {
                Some(n) => ProgressBar::new(n),
                None => ProgressBar::new_spinner(),
            };
            let mut console = Console { bar: Some(bar.clone()) };
            match programmer.upload(chip, base_addr, source, &mut console) {
                Ok(summary) => {
                    bar.finish();
                    info!(
                        "completed sending {} bytes in {} records",
                        summary.bytes, summary.records,
                    );
                }
                Err(e) => {
                    bar.abandon();
                    return Err(reported(e)).context("upload failed");
                }
            }
        }
        Job::Dump { output, path, length } => {
            info!("dumping {length} bytes starting from {base_addr:#x}");
            let bar = ProgressBar::new_spinner();
            let mut sink = bar.wrap_write(output);
            let mut console = Console { bar: Some(bar.clone()) };
            let copied = programmer
                .dump(base_addr, length, &mut sink, &mut console)
                .map_err(reported)
                .with_context(|| format!("dump to {} failed", path.display()))?;
            bar.finish();
            info!("completed dump, {copied} bytes written to {}", path.display());
        }
        Job::Erase { sector: None } => {
            info!("performing chip erase");
            programmer.erase(&mut Console { bar: None })
                .map_err(reported)?;
            info!("completed erase");
        }
        Job::Erase { sector: Some(sector) } => {
            info!("performing sector erase for sector {sector}");
            programmer.erase_sector(sector, &mut Console { bar: None })
                .map_err(reported)?;
            info!("completed sector erase");
        }
    }

    Ok(())
}

/// Logs what the programmer said, if it was the programmer that failed.
fn reported(e: Error) -> Error {
    if let Some(reply) = e.device_reply() {
        error!("programmer said: {reply}");
    }
    e
}

/// Shows what the programmer is up to.
struct Console {
    bar: Option<ProgressBar>,
}

impl Console {
    fn say(&self, f: impl FnOnce()) {
        match &self.bar {
            Some(bar) => bar.suspend(f),
            None => f(),
        }
    }
}

impl Observer for Console {
    fn on_event(&mut self, event: &Event<'_>) {
        match event {
            Event::Reply(reply) => {
                let text = reply.text().trim();
                if !text.is_empty() && !reply.is_error() {
                    self.say(|| info!("programmer: {text}"));
                }
            }
            Event::Drained(drained) if drained.bytes > 0 => {
                self.say(|| debug!("{} bytes of output drained", drained.bytes));
            }
            Event::Command(cmd) => self.say(|| debug!("sent command {cmd:?}")),
            Event::Segment(segment) => self.say(|| debug!("now in segment {segment:#06x}")),
            Event::Record { kind, address, len } => {
                trace!("{kind:?} record, {len} bytes at {address:#06x}");
            }
            Event::Progress(bytes) => {
                if let Some(bar) = &self.bar {
                    bar.set_position(*bytes);
                }
            }
            Event::Drained(_) => (),
        }
    }
}
