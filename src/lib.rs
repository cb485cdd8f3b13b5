//! Host side of the Flash Gordon bootloader protocol: programs, dumps and
//! erases an external flash or EEPROM chip hanging off a microcontroller
//! that speaks a small text protocol over a serial link.
//!
//! Images go over the wire as Intel-HEX style records (see [`record`]), one
//! per line, each acknowledged by a line of device output. Any device line
//! containing "ERROR" ends the operation.

use std::{borrow::Cow, io::{self, ErrorKind, Read, Write}, time::Duration};

use log::{debug, info, warn};
use thiserror::Error;

pub mod link;
pub mod record;

pub use link::{Drained, Link, Reply, SerialLink};
pub use record::{encode_record, segment_record, RecordType, EOF_RECORD};

/// Protocol constants. The defaults match what the bootloader expects;
/// tests shrink the settle delay.
#[derive(Copy, Clone, Debug)]
pub struct TransferParams {
    /// Payload bytes per record. Kept small so each line fits the device's
    /// receive buffer.
    pub chunk_size: usize,
    /// Pause after each record line.
    pub settle: Duration,
    /// Highest in-segment offset before a new segment record is due.
    pub segment_limit: u32,
}

impl Default for TransferParams {
    fn default() -> Self {
        TransferParams {
            chunk_size: 32,
            settle: Duration::from_millis(10),
            segment_limit: 0xFFFF,
        }
    }
}

/// Which kind of part is in the programming socket.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChipType {
    Flash32Pin,
    Eeprom28Pin,
}

impl ChipType {
    /// Picks the chip type from the two mutually exclusive command-line
    /// switches.
    pub fn from_flags(flash_32pin: bool, eeprom_28pin: bool) -> Result<Self, Error> {
        match (flash_32pin, eeprom_28pin) {
            (true, false) => Ok(ChipType::Flash32Pin),
            (false, true) => Ok(ChipType::Eeprom28Pin),
            (true, true) => Err(Error::Config(
                "must choose either a flash chip or an EEPROM, not both".into(),
            )),
            (false, false) => Err(Error::Config(
                "must choose one of: 32pin-flash or 28pin-eeprom".into(),
            )),
        }
    }

    /// Character following `u` in the upload command.
    pub fn selector(self) -> u8 {
        match self {
            ChipType::Flash32Pin => b'f',
            ChipType::Eeprom28Pin => b'e',
        }
    }
}

/// Things that happen during an operation, for whoever is presenting it.
#[derive(Debug)]
pub enum Event<'a> {
    /// Stray or trailing output was drained.
    Drained(&'a Drained),
    Command(&'a str),
    Record {
        kind: RecordType,
        address: u16,
        len: usize,
    },
    /// Moved on to a new 64 KiB segment.
    Segment(u16),
    Reply(&'a Reply),
    /// Total payload bytes sent so far.
    Progress(u64),
}

pub trait Observer {
    fn on_event(&mut self, _event: &Event<'_>) {}
}

impl Observer for () {}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UploadSummary {
    pub bytes: u64,
    /// Data records sent.
    pub records: usize,
    /// Segment the last record landed in.
    pub segment: u16,
}

/// Where an upload is. Lives exactly as long as one call to
/// [`Programmer::upload`].
#[derive(Debug)]
struct TransferSession {
    /// Offset into the current segment, always below 64 KiB.
    address: u32,
    segment: u16,
    bytes_transferred: u64,
    records: usize,
    terminated: bool,
}

impl TransferSession {
    fn new(base_address: u32) -> Self {
        TransferSession {
            address: base_address & 0xFFFF,
            segment: (base_address >> 16) as u16,
            bytes_transferred: 0,
            records: 0,
            terminated: false,
        }
    }

    /// Moves past a chunk of `len` bytes. Returns the new segment number if
    /// that ran off the end of the current one.
    fn advance(&mut self, len: usize, segment_limit: u32) -> Result<Option<u16>, Error> {
        self.address += len as u32;
        self.bytes_transferred += len as u64;
        self.records += 1;

        if self.address > segment_limit {
            self.address -= segment_limit;
            self.segment = self.segment.checked_add(1)
                .ok_or(Error::AddressOverflow)?;
            Ok(Some(self.segment))
        } else {
            Ok(None)
        }
    }
}

pub struct Programmer<R, W> {
    link: Link<R, W>,
    params: TransferParams,
}

impl<R: Read, W: Write> Programmer<R, W> {
    pub fn new(link: Link<R, W>, params: TransferParams) -> Self {
        Programmer { link, params }
    }

    pub fn link(&self) -> &Link<R, W> {
        &self.link
    }

    /// Writes `source` to the chip, starting at `base_address`.
    ///
    /// The source is consumed and dropped before this returns, whether or
    /// not the upload worked.
    pub fn upload(
        &mut self,
        chip: ChipType,
        base_address: u32,
        mut source: impl Read,
        observer: &mut dyn Observer,
    ) -> Result<UploadSummary, Error> {
        context_scope(
            || {
                self.drain_stale(observer)?;

                let command = [b'u', chip.selector()];
                self.command(&command, observer)?;
                self.check_reply(observer)
                    .context("device refused upload command")?;

                let mut session = TransferSession::new(base_address);
                self.send_record(&segment_record(session.segment), observer)
                    .context("device refused starting address")?;

                let mut buf = vec![0; self.params.chunk_size];
                while !session.terminated {
                    let n = read_chunk(&mut source, &mut buf)
                        .map_err(Error::SourceRead)?;
                    // A short read means the source ran dry; whatever it did
                    // hand back still goes out below.
                    if n < buf.len() {
                        session.terminated = true;
                    }
                    if n == 0 {
                        break;
                    }

                    let address = session.address as u16;
                    observer.on_event(&Event::Record {
                        kind: RecordType::Data,
                        address,
                        len: n,
                    });
                    self.send_record(&encode_record(address, RecordType::Data, &buf[..n]), observer)
                        .with_context(|| format!(
                            "device refused data at {:04x}:{address:04x}",
                            session.segment,
                        ))?;

                    if let Some(segment) = session.advance(n, self.params.segment_limit)? {
                        debug!("crossing into segment {segment:#x}");
                        observer.on_event(&Event::Segment(segment));
                        self.send_record(&segment_record(segment), observer)
                            .with_context(|| format!("device refused segment {segment:#x}"))?;
                    }
                    observer.on_event(&Event::Progress(session.bytes_transferred));
                }

                self.link.write_line(EOF_RECORD, self.params.settle)?;
                self.check_reply(observer)
                    .context("device refused end of file")?;

                let trailing = self.link.drain()?;
                observer.on_event(&Event::Drained(&trailing));
                trailing.check()?;

                info!("sent {} bytes in {} records", session.bytes_transferred, session.records);
                Ok(UploadSummary {
                    bytes: session.bytes_transferred,
                    records: session.records,
                    segment: session.segment,
                })
            },
            || format!("failed to upload to address {base_address:#x}"),
        )
    }

    /// Asks the device for `length` bytes starting at `base_address` and
    /// copies whatever it sends back into `sink`, up to its next prompt. The
    /// device formats the dump; nothing here parses it.
    ///
    /// Returns the number of bytes copied.
    pub fn dump(
        &mut self,
        base_address: u32,
        length: u32,
        sink: &mut dyn Write,
        observer: &mut dyn Observer,
    ) -> Result<u64, Error> {
        context_scope(
            || {
                self.drain_stale(observer)?;

                let command = format!("d{base_address:08X}{length:08X}");
                self.command(command.as_bytes(), observer)?;

                let drained = self.link.drain_to(sink)?;
                observer.on_event(&Event::Drained(&drained));
                let drained = drained.check()?;
                if !drained.prompt_seen {
                    warn!("device went quiet before returning to its prompt");
                }
                Ok(drained.bytes)
            },
            || format!("failed to dump {length} bytes from address {base_address:#x}"),
        )
    }

    /// Erases the whole chip.
    pub fn erase(&mut self, observer: &mut dyn Observer) -> Result<(), Error> {
        context_scope(
            || {
                self.drain_stale(observer)?;
                self.command(b"e", observer)?;
                self.drain_checked(observer)
            },
            || "failed to erase chip",
        )
    }

    /// Erases one sector. The sector number follows the `s` command as a
    /// line of eight hex digits.
    pub fn erase_sector(&mut self, sector: u32, observer: &mut dyn Observer) -> Result<(), Error> {
        context_scope(
            || {
                self.drain_stale(observer)?;
                self.command(b"s", observer)?;
                self.link.write_line(&format!("{sector:08X}"), self.params.settle)?;
                self.drain_checked(observer)
            },
            || format!("failed to erase sector {sector}"),
        )
    }

    /// Clears out whatever the device said before we got here, like a boot
    /// banner, so it isn't taken as a reply.
    fn drain_stale(&mut self, observer: &mut dyn Observer) -> Result<(), Error> {
        let drained = self.link.drain()
            .context("draining stale device output")?;
        if let Some(e) = &drained.error {
            warn!("ignoring stale device error: {e}");
        }
        observer.on_event(&Event::Drained(&drained));
        Ok(())
    }

    fn drain_checked(&mut self, observer: &mut dyn Observer) -> Result<(), Error> {
        let drained = self.link.drain()?;
        observer.on_event(&Event::Drained(&drained));
        drained.check()?;
        Ok(())
    }

    fn command(&mut self, command: &[u8], observer: &mut dyn Observer) -> Result<(), Error> {
        let text = String::from_utf8_lossy(command);
        debug!("sending command {text:?}");
        observer.on_event(&Event::Command(&text));
        self.link.write_command(command)
            .with_context(|| format!("failed to transmit command {text:?}"))
    }

    fn send_record(&mut self, line: &str, observer: &mut dyn Observer) -> Result<(), Error> {
        self.link.write_line(line, self.params.settle)?;
        self.check_reply(observer)?;
        Ok(())
    }

    fn check_reply(&mut self, observer: &mut dyn Observer) -> Result<String, Error> {
        let reply = self.link.read_reply()?;
        observer.on_event(&Event::Reply(&reply));
        reply.check()
    }
}

/// Fills `buf` from `source`, stopping early only at end of input.
fn read_chunk(source: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("device reported: {0}")]
    Device(String),
    #[error("I/O error on link")]
    Io(#[from] std::io::Error),
    #[error("serial port configuration error")]
    Ser(#[from] serialport::Error),
    #[error("failed to read from upload source")]
    SourceRead(#[source] std::io::Error),
    #[error("{0}")]
    Config(Cow<'static, str>),
    #[error("image runs past the end of the 32-bit address space")]
    AddressOverflow,

    #[error("{0}")]
    Context(Cow<'static, str>, #[source] Box<Self>),
}

impl Error {
    /// The device's own words, if this came from an "ERROR" line.
    pub fn device_reply(&self) -> Option<&str> {
        match self {
            Error::Device(text) => Some(text),
            Error::Context(_, inner) => inner.device_reply(),
            _ => None,
        }
    }
}

pub trait OurContext {
    type Ok;
    fn context(self, info: impl Into<Cow<'static, str>>) -> Result<Self::Ok, Error>;
    fn with_context<M>(self, f: impl FnOnce() -> M) -> Result<Self::Ok, Error>
        where M: Into<Cow<'static, str>>;
}

impl<T, E> OurContext for Result<T, E>
    where E: Into<Error>,
{
    type Ok = T;

    fn context(self, info: impl Into<Cow<'static, str>>) -> Result<T, Error> {
        self.map_err(|e| Error::Context(info.into(), Box::new(e.into())))
    }

    fn with_context<M>(self, f: impl FnOnce() -> M) -> Result<T, Error>
        where M: Into<Cow<'static, str>>
    {
        self.map_err(|e| Error::Context(f().into(), Box::new(e.into())))
    }
}

fn context_scope<T, C>(
    body: impl FnOnce() -> Result<T, Error>,
    context_provider: impl FnOnce() -> C,
) -> Result<T, Error>
    where C: Into<Cow<'static, str>>,
{
    body().with_context(context_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::{decode, Decoded};

    fn fast() -> TransferParams {
        TransferParams {
            settle: Duration::ZERO,
            ..TransferParams::default()
        }
    }

    fn programmer(device_says: &[u8]) -> Programmer<&[u8], Vec<u8>> {
        Programmer::new(Link::new(device_says, Vec::new()), fast())
    }

    fn sent(p: &Programmer<&[u8], Vec<u8>>) -> String {
        String::from_utf8(p.link().output().clone()).unwrap()
    }

    /// Decodes every record line the host sent.
    fn records(wire: &str) -> Vec<Decoded> {
        wire.lines()
            .filter_map(|l| l.find(':').map(|i| &l[i..]))
            .map(decode)
            .collect()
    }

    #[derive(Default)]
    struct Recorder {
        segments: Vec<u16>,
        replies: Vec<String>,
        progress: Vec<u64>,
    }

    impl Observer for Recorder {
        fn on_event(&mut self, event: &Event<'_>) {
            match event {
                Event::Segment(s) => self.segments.push(*s),
                Event::Reply(r) => self.replies.push(r.text().to_string()),
                Event::Progress(n) => self.progress.push(*n),
                _ => (),
            }
        }
    }

    const BEOWULF: &str = "The folk-kings\u{2019} former fame we have heard of,\
        How princes displayed then their prowess-in-battle.";

    #[test]
    fn upload_sends_expected_wire_text() {
        let mut p = programmer(b"Enter Command:");
        let summary = p.upload(ChipType::Flash32Pin, 0, BEOWULF.as_bytes(), &mut ()).unwrap();

        assert_eq!(sent(&p), concat!(
            "\n",
            "uf",
            ":020000040000FA\n",
            ":2000000054686520666F6C6B2D6B696E6773E2809920666F726D65722066616D652077654F\n",
            ":200020002068617665206865617264206F662C486F77207072696E63657320646973706C39\n",
            ":2000400061796564207468656E2074686569722070726F776573732D696E2D626174746C77\n",
            ":02006000652E0B\n",
            ":00000001FF\n",
            "\n",
        ));
        assert_eq!(summary, UploadSummary { bytes: 98, records: 4, segment: 0 });
    }

    #[test]
    fn upload_eeprom_selector() {
        let mut p = programmer(b"");
        p.upload(ChipType::Eeprom28Pin, 0, &b"x"[..], &mut ()).unwrap();
        assert!(sent(&p).starts_with("\nue:"));
    }

    #[test]
    fn upload_exact_multiple_of_chunk() {
        let image = vec![0xA5; 96];
        let mut p = programmer(b"");
        let summary = p.upload(ChipType::Flash32Pin, 0, &image[..], &mut ()).unwrap();

        let recs = records(&sent(&p));
        let kinds: Vec<_> = recs.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, [
            RecordType::ExtendedLinearAddress,
            RecordType::Data,
            RecordType::Data,
            RecordType::Data,
            RecordType::EndOfFile,
        ]);
        let addresses: Vec<_> = recs[1..4].iter().map(|r| r.address).collect();
        assert_eq!(addresses, [0, 32, 64]);
        assert!(recs[1..4].iter().all(|r| r.payload.len() == 32));
        assert_eq!(summary.bytes, 96);
        assert_eq!(summary.records, 3);
    }

    #[test]
    fn upload_sends_short_tail_once() {
        let image: Vec<u8> = (0..=70).collect();
        let mut p = programmer(b"");
        p.upload(ChipType::Flash32Pin, 0, &image[..], &mut ()).unwrap();

        let payload: Vec<u8> = records(&sent(&p))
            .into_iter()
            .filter(|r| r.kind == RecordType::Data)
            .flat_map(|r| r.payload)
            .collect();
        assert_eq!(payload, image);
    }

    #[test]
    fn upload_of_empty_source() {
        let mut p = programmer(b"");
        let summary = p.upload(ChipType::Flash32Pin, 0, io::empty(), &mut ()).unwrap();
        assert_eq!(sent(&p), "\nuf:020000040000FA\n:00000001FF\n\n");
        assert_eq!(summary.bytes, 0);
    }

    #[test]
    fn upload_from_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0x11; 40]).unwrap();
        io::Seek::rewind(&mut file).unwrap();

        let mut p = programmer(b"");
        let summary = p.upload(ChipType::Flash32Pin, 0, file, &mut ()).unwrap();
        assert_eq!(summary.bytes, 40);
        assert_eq!(summary.records, 2);
    }

    #[test]
    fn upload_crosses_segment() {
        let image = vec![0x5A; 0x10000 + 64];
        let mut p = programmer(b"");
        let mut recorder = Recorder::default();
        let summary = p.upload(ChipType::Flash32Pin, 0, &image[..], &mut recorder).unwrap();

        let recs = records(&sent(&p));
        let segments: Vec<_> = recs.iter()
            .enumerate()
            .filter(|(_, r)| r.kind == RecordType::ExtendedLinearAddress)
            .map(|(i, r)| (i, r.payload.clone()))
            .collect();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], (0, vec![0, 0]));

        let (at, payload) = &segments[1];
        let at = *at;
        assert_eq!(payload, &[0, 1]);
        assert_eq!(recs[at - 1].address, 0xFFE0);
        assert_eq!(recs[at + 1].kind, RecordType::Data);
        assert_eq!(recs[at + 1].address, (0x10000u32 - 0xFFFF) as u16);
        assert_eq!(recs[at + 2].address, (0x10000u32 - 0xFFFF + 32) as u16);

        assert_eq!(recorder.segments, [1]);
        assert_eq!(summary.segment, 1);
        assert_eq!(summary.bytes, image.len() as u64);
        assert_eq!(recorder.progress.last(), Some(&(image.len() as u64)));
    }

    #[test]
    fn upload_honors_base_address() {
        let mut p = programmer(b"");
        p.upload(ChipType::Flash32Pin, 0x0002_0100, &[1, 2, 3][..], &mut ()).unwrap();
        let recs = records(&sent(&p));
        assert_eq!(recs[0].payload, [0x00, 0x02]);
        assert_eq!(recs[1].address, 0x0100);
        assert_eq!(recs[1].payload, [1, 2, 3]);
    }

    #[test]
    fn upload_stops_at_first_error_reply() {
        let device = b"Enter Command\nOK\nOK\nERROR: checksum mismatch\nOK\n";
        let mut p = programmer(device);
        let mut recorder = Recorder::default();
        let err = p.upload(ChipType::Flash32Pin, 0, &[0u8; 200][..], &mut recorder).unwrap_err();

        assert_eq!(err.device_reply(), Some("ERROR: checksum mismatch"));
        let recs = records(&sent(&p));
        // Starting segment, the accepted data record and the rejected one.
        assert_eq!(recs.len(), 3);
        assert!(recs.iter().all(|r| r.kind != RecordType::EndOfFile));
        assert_eq!(recorder.replies.last().map(String::as_str), Some("ERROR: checksum mismatch"));
    }

    #[test]
    fn upload_refused_at_chip_select() {
        let mut p = programmer(b"Enter Command: ERROR unknown chip\n");
        let err = p.upload(ChipType::Eeprom28Pin, 0, &[0u8; 10][..], &mut ()).unwrap_err();
        assert_eq!(err.device_reply(), Some(": ERROR unknown chip"));
        assert_eq!(sent(&p), "\nue");
    }

    #[test]
    fn upload_reports_source_failure() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(ErrorKind::Other, "disk on fire"))
            }
        }

        let mut p = programmer(b"");
        let err = p.upload(ChipType::Flash32Pin, 0, Broken, &mut ()).unwrap_err();
        let Error::Context(_, inner) = err else { panic!("expected context") };
        assert!(matches!(*inner, Error::SourceRead(_)));
        assert!(!sent(&p).contains(EOF_RECORD));
    }

    #[test]
    fn upload_fails_on_trailing_error() {
        let mut p = programmer(b"Enter Command\nOK\nOK\nOK\nERROR: verify failed\nEnter Command:");
        let err = p.upload(ChipType::Flash32Pin, 0, &[1u8; 4][..], &mut ()).unwrap_err();
        assert_eq!(err.device_reply(), Some("ERROR: verify failed"));
    }

    #[test]
    fn dump_copies_device_output() {
        let body = "00000000: FF FF FF FF 00 11 22 33\r\n00000008: 44 55 66 77 88 99 AA BB\r\n";
        let device = format!("boot banner\r\nEnter Command{body}Enter Command: ");
        let mut p = programmer(device.as_bytes());
        let mut out = Vec::new();
        let copied = p.dump(0, 1024, &mut out, &mut ()).unwrap();

        assert_eq!(sent(&p), "\nd0000000000000400\n");
        assert_eq!(out, body.as_bytes());
        assert_eq!(copied, body.len() as u64);
    }

    #[test]
    fn dump_command_encodes_address_and_length() {
        let mut p = programmer(b"");
        p.dump(0x0001_2345, 0xABCD, &mut io::sink(), &mut ()).unwrap();
        assert_eq!(sent(&p), "\nd000123450000ABCD\n");
    }

    #[test]
    fn dump_surfaces_device_error() {
        let mut p = programmer(b"Enter Command\nERROR: address out of range\nEnter Command");
        let mut out = Vec::new();
        let err = p.dump(0xFFFF_FFF0, 0x100, &mut out, &mut ()).unwrap_err();
        assert_eq!(err.device_reply(), Some("ERROR: address out of range"));
    }

    #[test]
    fn erase_sends_single_command() {
        let mut p = programmer(b"Enter Command: \nErasing...\nDone\nEnter Command:");
        p.erase(&mut ()).unwrap();
        assert_eq!(sent(&p), "\ne\n");
    }

    #[test]
    fn erase_fails_on_error() {
        let mut p = programmer(b"Enter Command\nERROR: write protected\nEnter Command");
        let err = p.erase(&mut ()).unwrap_err();
        assert_eq!(err.device_reply(), Some("ERROR: write protected"));
        assert_eq!(err.to_string(), "failed to erase chip");
    }

    #[test]
    fn stale_error_before_erase_is_ignored() {
        let mut p = programmer(b"ERROR: left over\nEnter Command\nDone\n");
        p.erase(&mut ()).unwrap();
    }

    #[test]
    fn sector_erase_sends_sector() {
        let mut p = programmer(b"Enter Command\nSector erased\nEnter Command");
        p.erase_sector(10, &mut ()).unwrap();
        assert_eq!(sent(&p), "\ns0000000A\n\n");
    }

    #[test]
    fn sector_erase_fails_on_error() {
        let mut p = programmer(b"Enter Command\nERROR: bad sector\n");
        let err = p.erase_sector(999, &mut ()).unwrap_err();
        assert_eq!(err.device_reply(), Some("ERROR: bad sector"));
        assert_eq!(err.to_string(), "failed to erase sector 999");
    }

    #[test]
    fn chip_type_flags() {
        assert_eq!(ChipType::from_flags(true, false).unwrap(), ChipType::Flash32Pin);
        assert_eq!(ChipType::from_flags(false, true).unwrap(), ChipType::Eeprom28Pin);
        assert!(matches!(ChipType::from_flags(true, true), Err(Error::Config(_))));
        assert!(matches!(ChipType::from_flags(false, false), Err(Error::Config(_))));
    }

    #[test]
    fn session_wraps_past_segment_limit() {
        let mut s = TransferSession::new(0xFFE0);
        assert_eq!(s.advance(31, 0xFFFF).unwrap(), None);
        assert_eq!(s.address, 0xFFFF);
        assert_eq!(s.advance(1, 0xFFFF).unwrap(), Some(1));
        assert_eq!(s.address, 1);
        assert_eq!(s.segment, 1);

        let mut s = TransferSession::new(0xFFFF_FFF0);
        assert!(matches!(s.advance(32, 0xFFFF), Err(Error::AddressOverflow)));
    }
}
