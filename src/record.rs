//! Intel-HEX style record encoding.
//!
//! The bootloader accepts one record per line:
//!
//! ```text
//! :BBAAAATTPP...PPCC
//! ```
//!
//! where `BB` is the payload length, `AAAA` the big-endian 16-bit offset into
//! the current segment, `TT` the record type, `PP...` the payload and `CC` the
//! two's complement checksum of everything before it.

use std::fmt;

/// The end-of-file record never varies.
pub const EOF_RECORD: &str = ":00000001FF";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedSegmentAddress = 0x02,
    ExtendedLinearAddress = 0x04,
}

impl RecordType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::EndOfFile),
            0x02 => Some(Self::ExtendedSegmentAddress),
            0x04 => Some(Self::ExtendedLinearAddress),
            _ => None,
        }
    }
}

/// A single record, borrowed from the chunk it describes. Records are built,
/// formatted and thrown away; nothing holds on to them.
#[derive(Copy, Clone, Debug)]
pub struct Record<'a> {
    address: u16,
    kind: RecordType,
    payload: &'a [u8],
}

impl<'a> Record<'a> {
    pub fn new(address: u16, kind: RecordType, payload: &'a [u8]) -> Self {
        assert!(payload.len() <= 255, "record payload can't exceed 255 bytes");
        Record { address, kind, payload }
    }

    pub fn byte_count(&self) -> u8 {
        self.payload.len() as u8
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn kind(&self) -> RecordType {
        self.kind
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    fn header(&self) -> [u8; 4] {
        let [hi, lo] = self.address.to_be_bytes();
        [self.byte_count(), hi, lo, self.kind as u8]
    }

    pub fn checksum(&self) -> u8 {
        checksum_for(self.header().iter().chain(self.payload))
    }
}

impl fmt::Display for Record<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ":{}{}{:02X}",
            hex::encode_upper(self.header()),
            hex::encode_upper(self.payload),
            self.checksum(),
        )
    }
}

/// Two's complement of the byte sum, i.e. `(sum ^ 0xFF) + 1` truncated to
/// eight bits.
pub fn checksum_for<'b>(bytes: impl IntoIterator<Item = &'b u8>) -> u8 {
    let sum = bytes.into_iter().fold(0_u8, |sum, byte| sum.wrapping_add(*byte));
    (sum ^ 0xFF).wrapping_add(1)
}

/// Formats one record line, without the line terminator.
///
/// End-of-file records ignore `address` and `payload` and always produce
/// [`EOF_RECORD`].
pub fn encode_record(address: u16, kind: RecordType, payload: &[u8]) -> String {
    match kind {
        RecordType::EndOfFile => EOF_RECORD.to_string(),
        _ => Record::new(address, kind, payload).to_string(),
    }
}

/// Extended linear address record announcing the upper 16 bits of the
/// address for the records that follow.
pub fn segment_record(segment: u16) -> String {
    encode_record(0, RecordType::ExtendedLinearAddress, &segment.to_be_bytes())
}
