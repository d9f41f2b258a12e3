//! Request body generation and signing.
//!
//! Payload formats belong to the encoder; this module only provides the
//! bounded writer the encoder streams into. The writer feeds every byte to an
//! HMAC-SHA256 as it is produced, so the signature is ready the moment the
//! body is.

use core::fmt;
use core::time::Duration;

use heapless::{String, Vec};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::adv_table::{AdvRecord, MAX_PAYLOAD_LEN};
use crate::telemetry::MetricsSnapshot;

type HmacSha256 = Hmac<Sha256>;

/// Longest HMAC key accepted for a target.
pub const MAX_KEY_LEN: usize = 64;

/// Lower-case hex HMAC-SHA256 digest.
pub type Signature = String<64>;

/// Per-target signing key. Empty means "do not sign".
pub type HmacKey = Vec<u8, MAX_KEY_LEN>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncodeError {
    /// The body did not fit into the request buffer.
    BufferFull,
    /// The encoder rejected a record.
    Format,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::BufferFull => f.write_str("request body exceeds buffer"),
            EncodeError::Format => f.write_str("record could not be encoded"),
        }
    }
}

/// Bounded body writer with an optional running signature.
pub struct BodyWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
    mac: Option<HmacSha256>,
}

impl<'a> BodyWriter<'a> {
    /// Writer that signs with `key`, or does not sign when `key` is empty.
    #[must_use]
    pub fn new(buf: &'a mut [u8], key: &[u8]) -> Self {
        let mac = if key.is_empty() {
            None
        } else {
            // HMAC accepts keys of any length.
            HmacSha256::new_from_slice(key).ok()
        };
        Self { buf, len: 0, mac }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        let end = self.len + bytes.len();
        let dst = self.buf.get_mut(self.len..end).ok_or(EncodeError::BufferFull)?;
        dst.copy_from_slice(bytes);
        if let Some(mac) = self.mac.as_mut() {
            mac.update(bytes);
        }
        self.len = end;
        Ok(())
    }

    /// Writes `bytes` as lower-case hex.
    pub fn write_hex(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        for &byte in bytes {
            self.write_bytes(&hex_pair(byte))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Body length and signature, if a key was supplied.
    #[must_use]
    pub fn finish(self) -> (usize, Option<Signature>) {
        let signature = self.mac.map(|mac| {
            let digest = mac.finalize().into_bytes();
            let mut hex = Signature::new();
            for &byte in digest.as_slice() {
                let [hi, lo] = hex_pair(byte);
                // 32 digest bytes fill the 64 character signature exactly.
                let _ = hex.push(char::from(hi));
                let _ = hex.push(char::from(lo));
            }
            hex
        });
        (self.len, signature)
    }
}

impl fmt::Write for BodyWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

fn hex_pair(byte: u8) -> [u8; 2] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    [DIGITS[usize::from(byte >> 4)], DIGITS[usize::from(byte & 0x0F)]]
}

/// Envelope fields of an advertisement upload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AdvHeader {
    pub nonce: u32,
    /// Upload time in seconds: wall clock when `use_timestamps`, otherwise time since boot.
    pub timestamp: u64,
    pub use_timestamps: bool,
}

/// Envelope fields of a statistics upload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatisticsReport {
    pub nonce: u32,
    pub uptime: Duration,
    pub metrics: MetricsSnapshot,
}

/// Turns records into request bodies. The wire format is owned by the implementor.
pub trait PayloadEncoder {
    fn encode_advertisements(
        &mut self,
        header: &AdvHeader,
        records: &[AdvRecord],
        out: &mut BodyWriter<'_>,
    ) -> Result<(), EncodeError>;

    fn encode_statistics(
        &mut self,
        report: &StatisticsReport,
        records: &[AdvRecord],
        out: &mut BodyWriter<'_>,
    ) -> Result<(), EncodeError>;

    /// Body of one message-bus publish.
    fn encode_bus_record(
        &mut self,
        record: &AdvRecord,
        out: &mut BodyWriter<'_>,
    ) -> Result<(), EncodeError>;
}

/// Compact line-oriented encoder.
///
/// ```text
/// adv nonce=<n> ts=<t>
/// <MAC> <timestamp> <rssi> <hex payload>
/// ```
#[derive(Copy, Clone, Debug, Default)]
pub struct LineEncoder;

const U16_DIGITS: usize = 5;
const U32_DIGITS: usize = 10;
const U64_DIGITS: usize = 20;
/// `-128`
const I8_DIGITS: usize = 4;
/// `AA:BB:CC:DD:EE:FF`
const MAC_TEXT_LEN: usize = 17;

impl LineEncoder {
    const ADV_HEADER_MAX: usize = "adv nonce= ts=\n".len() + U32_DIGITS + U64_DIGITS;
    const ADV_LINE_MAX: usize = MAC_TEXT_LEN + U64_DIGITS + I8_DIGITS + 2 * MAX_PAYLOAD_LEN + 4;
    const STATS_HEADER_MAX: usize =
        "stats nonce= uptime= disconnects= self_reboots= ext_hw_resets= lost_acks=\n".len()
            + 5 * U32_DIGITS
            + U64_DIGITS;
    const STATS_LINE_MAX: usize = MAC_TEXT_LEN + I8_DIGITS + U16_DIGITS + 3;

    /// Upper bound on any body this encoder produces for `records` records.
    ///
    /// Request buffers sized with this never fail to encode a full store.
    #[must_use]
    pub const fn max_body_len(records: usize) -> usize {
        let adv = Self::ADV_HEADER_MAX + records * Self::ADV_LINE_MAX;
        let stats = Self::STATS_HEADER_MAX + records * Self::STATS_LINE_MAX;
        if adv > stats { adv } else { stats }
    }

    fn record_line(record: &AdvRecord, out: &mut BodyWriter<'_>) -> Result<(), EncodeError> {
        use fmt::Write as _;

        write!(out, "{} {} {} ", record.mac, record.timestamp, record.rssi)
            .map_err(|_| EncodeError::BufferFull)?;
        out.write_hex(record.payload())
    }
}

impl PayloadEncoder for LineEncoder {
    fn encode_advertisements(
        &mut self,
        header: &AdvHeader,
        records: &[AdvRecord],
        out: &mut BodyWriter<'_>,
    ) -> Result<(), EncodeError> {
        use fmt::Write as _;

        let clock = if header.use_timestamps { "ts" } else { "up" };
        writeln!(out, "adv nonce={} {clock}={}", header.nonce, header.timestamp)
            .map_err(|_| EncodeError::BufferFull)?;
        for record in records {
            Self::record_line(record, out)?;
            out.write_bytes(b"\n")?;
        }
        Ok(())
    }

    fn encode_statistics(
        &mut self,
        report: &StatisticsReport,
        records: &[AdvRecord],
        out: &mut BodyWriter<'_>,
    ) -> Result<(), EncodeError> {
        use fmt::Write as _;

        let m = &report.metrics;
        writeln!(
            out,
            "stats nonce={} uptime={} disconnects={} self_reboots={} ext_hw_resets={} lost_acks={}",
            report.nonce,
            report.uptime.as_secs(),
            m.network_disconnects,
            m.coprocessor_self_reboots,
            m.coprocessor_ext_hw_resets,
            m.lost_acks,
        )
        .map_err(|_| EncodeError::BufferFull)?;
        for record in records {
            writeln!(out, "{} {} {}", record.mac, record.rssi, record.samples_counter)
                .map_err(|_| EncodeError::BufferFull)?;
        }
        Ok(())
    }

    fn encode_bus_record(
        &mut self,
        record: &AdvRecord,
        out: &mut BodyWriter<'_>,
    ) -> Result<(), EncodeError> {
        Self::record_line(record, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv_table::MacAddress;

    #[test]
    fn unsigned_writer_reports_no_signature() {
        let mut buf = [0u8; 16];
        let mut out = BodyWriter::new(&mut buf, &[]);
        out.write_bytes(b"abc").expect("fits");
        assert_eq!(out.as_bytes(), b"abc");
        assert_eq!(out.finish(), (3, None));
    }

    #[test]
    fn signature_matches_rfc4231_case_2() {
        let mut buf = [0u8; 64];
        let mut out = BodyWriter::new(&mut buf, b"Jefe");
        out.write_bytes(b"what do ya want ").expect("fits");
        out.write_bytes(b"for nothing?").expect("fits");

        let (len, signature) = out.finish();
        assert_eq!(len, 28);
        assert_eq!(
            signature.as_deref(),
            Some("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
        );
    }

    #[test]
    fn overflowing_write_is_rejected_without_partial_data() {
        let mut buf = [0u8; 4];
        let mut out = BodyWriter::new(&mut buf, &[]);
        out.write_bytes(b"abc").expect("fits");
        assert_eq!(out.write_bytes(b"de"), Err(EncodeError::BufferFull));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn line_encoder_lists_every_record() {
        let records = [
            AdvRecord::new(MacAddress::new([1, 2, 3, 4, 5, 6]), 7, -40, &[0xAB]).expect("valid"),
            AdvRecord::new(MacAddress::new([6, 5, 4, 3, 2, 1]), 8, -41, &[0x01, 0x02])
                .expect("valid"),
        ];
        let header = AdvHeader {
            nonce: 5,
            timestamp: 99,
            use_timestamps: true,
        };
        let mut buf = [0u8; 256];
        let mut out = BodyWriter::new(&mut buf, &[]);
        LineEncoder
            .encode_advertisements(&header, &records, &mut out)
            .expect("fits");

        let text = core::str::from_utf8(out.as_bytes()).expect("utf8");
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("adv nonce=5 ts=99"));
        assert_eq!(lines.next(), Some("01:02:03:04:05:06 7 -40 ab"));
        assert_eq!(lines.next(), Some("06:05:04:03:02:01 8 -41 0102"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn worst_case_records_fit_the_advertised_bound() {
        let mut record = AdvRecord::new(
            MacAddress::new([0xFF; 6]),
            u64::MAX,
            i8::MIN,
            &[0xEE; MAX_PAYLOAD_LEN],
        )
        .expect("valid");
        record.samples_counter = u16::MAX;
        let records = [record; 3];
        let header = AdvHeader {
            nonce: u32::MAX,
            timestamp: u64::MAX,
            use_timestamps: true,
        };

        let mut buf = [0u8; LineEncoder::max_body_len(3)];
        let mut out = BodyWriter::new(&mut buf, &[]);
        LineEncoder
            .encode_advertisements(&header, &records, &mut out)
            .expect("advertisements fit");
        assert_eq!(out.len(), LineEncoder::max_body_len(3));

        let report = StatisticsReport {
            nonce: u32::MAX,
            uptime: Duration::from_secs(u64::MAX),
            metrics: MetricsSnapshot {
                coprocessor_self_reboots: u32::MAX,
                coprocessor_ext_hw_resets: u32::MAX,
                lost_acks: u32::MAX,
                network_disconnects: u32::MAX,
                low_memory_events: u32::MAX,
                adv_received: u32::MAX,
            },
        };
        let mut buf = [0u8; LineEncoder::max_body_len(3)];
        let mut out = BodyWriter::new(&mut buf, &[]);
        LineEncoder
            .encode_statistics(&report, &records, &mut out)
            .expect("statistics fit");
    }
}
