//! Serial framing used between the gateway and the radio coprocessor.
//!
//! ```text
//! STX | LEN | CMD | PARAMS[LEN-1] | CRC16 (LE) | ETX
//! ```
//!
//! `LEN` counts `CMD` plus the parameters. The CRC (CCITT, init `0xFFFF`)
//! covers `LEN`, `CMD` and `PARAMS`.

use core::fmt;

use crc::{CRC_16_IBM_3740, Crc};
use heapless::Vec;
use winnow::binary::{i8 as signed_byte, le_u16, u8 as byte};
use winnow::combinator::eof;
use winnow::prelude::*;
use winnow::token::{rest, take};

use crate::adv_table::{AdvRecord, MAX_PAYLOAD_LEN, MacAddress, RecordError};
use crate::config::{FilterConfig, ScanConfig};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Bytes surrounding the `LEN` counted section: STX, LEN, CRC (2) and ETX.
pub const FRAME_OVERHEAD: usize = 5;

/// Largest frame either side may send.
pub const MAX_FRAME_LEN: usize = 48;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Owned, encoded frame.
pub type Frame = Vec<u8, MAX_FRAME_LEN>;

/// Command opcodes.
pub mod opcode {
    pub const ADV_REPORT: u8 = 0x10;
    pub const SET_ALL: u8 = 0x0F;
    pub const ACK: u8 = 0x12;
    pub const LED_CTRL: u8 = 0x1A;
    pub const REBOOTED: u8 = 0x1C;
}

/// Commands the gateway issues and expects to be acknowledged.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandId {
    SetAll,
    LedCtrl,
}

impl CommandId {
    #[must_use]
    pub const fn opcode(self) -> u8 {
        match self {
            CommandId::SetAll => opcode::SET_ALL,
            CommandId::LedCtrl => opcode::LED_CTRL,
        }
    }

    #[must_use]
    pub const fn from_opcode(code: u8) -> Option<Self> {
        match code {
            opcode::SET_ALL => Some(CommandId::SetAll),
            opcode::LED_CTRL => Some(CommandId::LedCtrl),
            _ => None,
        }
    }
}

/// Parameter block of `SET_ALL`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetAllParams {
    pub company_id: u16,
    pub use_filtering: bool,
    pub coded_phy: bool,
    pub phy_2mbit: bool,
    pub phy_1mbit: bool,
    pub channel_37: bool,
    pub channel_38: bool,
    pub channel_39: bool,
    pub max_adv_len: u8,
}

impl SetAllParams {
    #[must_use]
    pub fn from_config(scan: &ScanConfig, filter: &FilterConfig) -> Self {
        Self {
            company_id: filter.company_id,
            use_filtering: filter.use_filtering,
            coded_phy: scan.coded_phy,
            phy_2mbit: scan.phy_2mbit,
            phy_1mbit: scan.phy_1mbit,
            channel_37: scan.channel_37,
            channel_38: scan.channel_38,
            channel_39: scan.channel_39,
            max_adv_len: u8::try_from(MAX_PAYLOAD_LEN).unwrap_or(u8::MAX),
        }
    }
}

/// Gateway to coprocessor request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    SetAll(SetAllParams),
    LedCtrl { interval_ms: u16 },
}

impl Request {
    #[must_use]
    pub const fn command(&self) -> CommandId {
        match self {
            Request::SetAll(_) => CommandId::SetAll,
            Request::LedCtrl { .. } => CommandId::LedCtrl,
        }
    }

    /// Encodes the request as a complete frame.
    #[must_use]
    pub fn encode(&self) -> Frame {
        match self {
            Request::SetAll(params) => {
                let [lo, hi] = params.company_id.to_le_bytes();
                encode_frame(
                    opcode::SET_ALL,
                    &[
                        lo,
                        hi,
                        u8::from(params.use_filtering),
                        u8::from(params.coded_phy),
                        u8::from(params.phy_2mbit),
                        u8::from(params.phy_1mbit),
                        u8::from(params.channel_37),
                        u8::from(params.channel_38),
                        u8::from(params.channel_39),
                        params.max_adv_len,
                    ],
                )
            }
            Request::LedCtrl { interval_ms } => {
                encode_frame(opcode::LED_CTRL, &interval_ms.to_le_bytes())
            }
        }
    }
}

/// Advertisement reported by the coprocessor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdvReport {
    pub mac: MacAddress,
    pub rssi: i8,
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

impl AdvReport {
    /// Stamps the report and turns it into a store record.
    pub fn into_record(self, timestamp: u64) -> Result<AdvRecord, RecordError> {
        AdvRecord::new(self.mac, timestamp, self.rssi, &self.payload)
    }
}

/// Acknowledgement of a previously issued command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ack {
    /// Raw opcode being acknowledged.
    pub opcode: u8,
    pub ok: bool,
}

/// Coprocessor to gateway message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Inbound {
    Ack(Ack),
    AdvReport(AdvReport),
    Rebooted,
}

/// Framing and decoding failures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    Truncated,
    MissingStx,
    MissingEtx,
    Oversize { len: usize },
    Checksum { expected: u16, found: u16 },
    UnknownOpcode(u8),
    Malformed(u8),
    PayloadTooLong { len: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated => f.write_str("truncated frame"),
            FrameError::MissingStx => f.write_str("frame does not start with STX"),
            FrameError::MissingEtx => f.write_str("frame does not end with ETX"),
            FrameError::Oversize { len } => write!(f, "frame length {len} exceeds {MAX_FRAME_LEN}"),
            FrameError::Checksum { expected, found } => {
                write!(f, "crc mismatch: expected {expected:#06x}, found {found:#06x}")
            }
            FrameError::UnknownOpcode(code) => write!(f, "unknown opcode {code:#04x}"),
            FrameError::Malformed(code) => write!(f, "malformed parameters for opcode {code:#04x}"),
            FrameError::PayloadTooLong { len } => {
                write!(f, "advertisement payload of {len} bytes")
            }
        }
    }
}

/// CRC used by the framing layer.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Builds a frame around `params`. Parameters that do not fit are truncated.
#[must_use]
pub fn encode_frame(opcode: u8, params: &[u8]) -> Frame {
    let params = &params[..params.len().min(MAX_FRAME_LEN - FRAME_OVERHEAD - 1)];
    let mut frame = Frame::new();
    // Every push below stays within MAX_FRAME_LEN by the truncation above.
    let _ = frame.push(STX);
    let _ = frame.push(u8::try_from(params.len() + 1).unwrap_or(u8::MAX));
    let _ = frame.push(opcode);
    let _ = frame.extend_from_slice(params);
    let crc = checksum(&frame[1..]);
    let _ = frame.extend_from_slice(&crc.to_le_bytes());
    let _ = frame.push(ETX);
    frame
}

/// Validates the envelope of a complete frame and returns `(opcode, params)`.
pub fn split_frame(frame: &[u8]) -> Result<(u8, &[u8]), FrameError> {
    let (&first, rest) = frame.split_first().ok_or(FrameError::Truncated)?;
    if first != STX {
        return Err(FrameError::MissingStx);
    }
    let (&len, _) = rest.split_first().ok_or(FrameError::Truncated)?;
    let total = usize::from(len) + FRAME_OVERHEAD;
    if total > MAX_FRAME_LEN {
        return Err(FrameError::Oversize { len: total });
    }
    if len == 0 || frame.len() < total {
        return Err(FrameError::Truncated);
    }
    if frame[total - 1] != ETX {
        return Err(FrameError::MissingEtx);
    }

    let counted = &frame[1..total - 3];
    let found = u16::from_le_bytes([frame[total - 3], frame[total - 2]]);
    let expected = checksum(counted);
    if expected != found {
        return Err(FrameError::Checksum { expected, found });
    }

    Ok((counted[1], &counted[2..]))
}

/// Decodes a complete frame sent by the coprocessor.
pub fn decode_inbound(frame: &[u8]) -> Result<Inbound, FrameError> {
    let (code, mut params) = split_frame(frame)?;
    let malformed = |_| FrameError::Malformed(code);
    match code {
        opcode::ACK => ack.parse_next(&mut params).map_err(malformed),
        opcode::REBOOTED => eof
            .value(Inbound::Rebooted)
            .parse_next(&mut params)
            .map_err(malformed),
        opcode::ADV_REPORT => {
            let (mac, rssi, payload) = adv_fields.parse_next(&mut params).map_err(malformed)?;
            if payload.is_empty() {
                return Err(FrameError::Malformed(code));
            }
            let payload = Vec::from_slice(payload)
                .map_err(|_| FrameError::PayloadTooLong { len: payload.len() })?;
            Ok(Inbound::AdvReport(AdvReport { mac, rssi, payload }))
        }
        other => Err(FrameError::UnknownOpcode(other)),
    }
}

/// Decodes a complete frame sent by the gateway.
pub fn decode_request(frame: &[u8]) -> Result<Request, FrameError> {
    let (code, mut params) = split_frame(frame)?;
    let parsed = match code {
        opcode::SET_ALL => set_all.parse_next(&mut params),
        opcode::LED_CTRL => (le_u16, eof)
            .map(|(interval_ms, _)| Request::LedCtrl { interval_ms })
            .parse_next(&mut params),
        other => return Err(FrameError::UnknownOpcode(other)),
    };
    parsed.map_err(|_| FrameError::Malformed(code))
}

fn ack(input: &mut &[u8]) -> ModalResult<Inbound> {
    (byte, byte, eof)
        .map(|(opcode, status, _)| {
            Inbound::Ack(Ack {
                opcode,
                ok: status == 0,
            })
        })
        .parse_next(input)
}

fn adv_fields<'i>(input: &mut &'i [u8]) -> ModalResult<(MacAddress, i8, &'i [u8])> {
    let mac = take(6usize).parse_next(input)?;
    let rssi = signed_byte.parse_next(input)?;
    let payload = rest.parse_next(input)?;

    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(mac);
    Ok((MacAddress::new(bytes), rssi, payload))
}

fn flag(input: &mut &[u8]) -> ModalResult<bool> {
    byte.map(|value| value != 0).parse_next(input)
}

fn set_all(input: &mut &[u8]) -> ModalResult<Request> {
    let company_id = le_u16.parse_next(input)?;
    let (use_filtering, coded_phy, phy_2mbit, phy_1mbit) =
        (flag, flag, flag, flag).parse_next(input)?;
    let (channel_37, channel_38, channel_39) = (flag, flag, flag).parse_next(input)?;
    let max_adv_len = byte.parse_next(input)?;
    eof.parse_next(input)?;

    Ok(Request::SetAll(SetAllParams {
        company_id,
        use_filtering,
        coded_phy,
        phy_2mbit,
        phy_1mbit,
        channel_37,
        channel_38,
        channel_39,
        max_adv_len,
    }))
}

/// Incremental decoder for the coprocessor byte stream.
///
/// Bytes before an STX are discarded. A frame that fails validation is
/// dropped and decoding resumes at the next STX inside it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8, MAX_FRAME_LEN>,
}

impl FrameDecoder {
    #[must_use]
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feeds one byte, returning a result whenever a frame completes or is rejected.
    pub fn push(&mut self, byte: u8) -> Option<Result<Inbound, FrameError>> {
        if self.buf.is_empty() && byte != STX {
            return None;
        }
        if self.buf.push(byte).is_err() {
            self.resync();
            return Some(Err(FrameError::Oversize { len: MAX_FRAME_LEN + 1 }));
        }

        let &len = self.buf.get(1)?;
        let total = usize::from(len) + FRAME_OVERHEAD;
        if total > MAX_FRAME_LEN || len == 0 {
            self.resync();
            return Some(Err(FrameError::Oversize { len: total }));
        }
        if self.buf.len() < total {
            return None;
        }

        let result = decode_inbound(&self.buf);
        if result.is_ok() {
            self.buf.clear();
        } else {
            self.resync();
        }
        Some(result)
    }

    /// Number of buffered bytes of a partial frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn resync(&mut self) {
        let next = self.buf.iter().skip(1).position(|&b| b == STX);
        match next {
            Some(offset) => {
                let start = offset + 1;
                let mut tail = Vec::new();
                let _ = tail.extend_from_slice(&self.buf[start..]);
                self.buf = tail;
            }
            None => self.buf.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut FrameDecoder, bytes: &[u8]) -> Option<Result<Inbound, FrameError>> {
        let mut last = None;
        for &b in bytes {
            if let Some(result) = decoder.push(b) {
                last = Some(result);
            }
        }
        last
    }

    #[test]
    fn checksum_matches_ccitt_reference() {
        assert_eq!(checksum(b"123456789"), 0x29B1);
    }

    #[test]
    fn led_ctrl_frame_layout() {
        let frame = Request::LedCtrl { interval_ms: 1500 }.encode();
        assert_eq!(frame[0], STX);
        assert_eq!(frame[1], 3);
        assert_eq!(frame[2], opcode::LED_CTRL);
        assert_eq!(&frame[3..5], &1500u16.to_le_bytes());
        assert_eq!(frame[frame.len() - 1], ETX);
        assert_eq!(frame.len(), 3 + FRAME_OVERHEAD);
    }

    #[test]
    fn set_all_request_decodes_back() {
        let params = SetAllParams::from_config(&ScanConfig::DEFAULT, &FilterConfig::DEFAULT);
        let request = Request::SetAll(params);
        let frame = request.encode();
        assert_eq!(decode_request(&frame), Ok(request));
        assert_eq!(frame[1], 11);
    }

    #[test]
    fn decodes_ack_and_reboot() {
        let ack = encode_frame(opcode::ACK, &[opcode::SET_ALL, 0]);
        assert_eq!(
            decode_inbound(&ack),
            Ok(Inbound::Ack(Ack {
                opcode: opcode::SET_ALL,
                ok: true
            }))
        );

        let rebooted = encode_frame(opcode::REBOOTED, &[]);
        assert_eq!(decode_inbound(&rebooted), Ok(Inbound::Rebooted));
    }

    #[test]
    fn decodes_advertisement_report() {
        let mut params = Vec::<u8, 16>::new();
        params
            .extend_from_slice(&[1, 2, 3, 4, 5, 6, 0xC4, 0x99, 0x04, 0x05])
            .expect("fits");
        let frame = encode_frame(opcode::ADV_REPORT, &params);

        match decode_inbound(&frame) {
            Ok(Inbound::AdvReport(report)) => {
                assert_eq!(report.mac, MacAddress::new([1, 2, 3, 4, 5, 6]));
                assert_eq!(report.rssi, -60);
                assert_eq!(report.payload.as_slice(), &[0x99, 0x04, 0x05]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let mut frame = Request::LedCtrl { interval_ms: 0 }.encode();
        frame[3] ^= 0xFF;
        assert!(matches!(
            split_frame(&frame),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn rejects_ack_with_trailing_bytes() {
        let frame = encode_frame(opcode::ACK, &[opcode::LED_CTRL, 0, 9]);
        assert_eq!(
            decode_inbound(&frame),
            Err(FrameError::Malformed(opcode::ACK))
        );
    }

    #[test]
    fn decoder_skips_noise_before_stx() {
        let mut decoder = FrameDecoder::new();
        let frame = encode_frame(opcode::REBOOTED, &[]);
        let mut stream = Vec::<u8, 32>::new();
        stream.extend_from_slice(&[0xFF, 0x00, 0x55]).expect("fits");
        stream.extend_from_slice(&frame).expect("fits");

        assert_eq!(feed(&mut decoder, &stream), Some(Ok(Inbound::Rebooted)));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_resynchronises_after_bad_frame() {
        let mut decoder = FrameDecoder::new();
        let mut broken = encode_frame(opcode::ACK, &[opcode::SET_ALL, 0]);
        let last = broken.len() - 1;
        broken[last] = 0x00;
        assert!(matches!(
            feed(&mut decoder, &broken),
            Some(Err(FrameError::MissingEtx))
        ));

        let good = encode_frame(opcode::ACK, &[opcode::LED_CTRL, 1]);
        assert_eq!(
            feed(&mut decoder, &good),
            Some(Ok(Inbound::Ack(Ack {
                opcode: opcode::LED_CTRL,
                ok: false
            })))
        );
    }
}
