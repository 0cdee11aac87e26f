//! The fixed 16-byte packet header (spec §3).

use packed_struct::prelude::*;

use crate::error::WipError;

/// The only version this implementation speaks.
pub const SUPPORTED_VERSION: u8 = 1;

pub const HEADER_LEN: usize = 16;

/// Raw bit layout of the header, msb0-numbered across the 16-byte block,
/// matching spec §3's bit table exactly. Sub-byte fields are packed into
/// the smallest container type that holds them; goatns does the same for
/// its own non-byte-aligned fields (e.g. `LocRecord::size` in bits 9..16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PackedStruct)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "16", endian = "msb")]
pub struct RawHeader {
    #[packed_field(bits = "0..=3")]
    pub version: u8,
    #[packed_field(bits = "4..=15")]
    pub packet_id: u16,
    #[packed_field(bits = "16..=18")]
    pub packet_type: u8,
    #[packed_field(bits = "19")]
    pub weather_flag: bool,
    #[packed_field(bits = "20")]
    pub temperature_flag: bool,
    #[packed_field(bits = "21")]
    pub pop_flag: bool,
    #[packed_field(bits = "22")]
    pub alert_flag: bool,
    #[packed_field(bits = "23")]
    pub disaster_flag: bool,
    #[packed_field(bits = "24")]
    pub ex_flag: bool,
    #[packed_field(bits = "25..=26")]
    pub reserved_a: u8,
    #[packed_field(bits = "27..=29")]
    pub day: u8,
    #[packed_field(bits = "30..=31")]
    pub reserved_b: u8,
    #[packed_field(bits = "32..=95")]
    pub timestamp: u64,
    #[packed_field(bits = "96..=115")]
    pub area_code: u32,
    #[packed_field(bits = "116..=127")]
    pub checksum: u16,
}

/// The closed set of packet variants a peer can send, spec §3's `type`
/// field. Modeled as a plain enum with a fallible conversion rather than a
/// `packed_struct` primitive-enum field so an unrecognized value can carry
/// the offending byte into [`WipError::UnknownPacketType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    LocationRequest = 0,
    LocationResponse = 1,
    QueryRequest = 2,
    QueryResponse = 3,
    ReportRequest = 4,
    ReportResponse = 5,
    ErrorResponse = 7,
}

impl TryFrom<u8> for PacketType {
    type Error = WipError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::LocationRequest),
            1 => Ok(PacketType::LocationResponse),
            2 => Ok(PacketType::QueryRequest),
            3 => Ok(PacketType::QueryResponse),
            4 => Ok(PacketType::ReportRequest),
            5 => Ok(PacketType::ReportResponse),
            7 => Ok(PacketType::ErrorResponse),
            other => Err(WipError::UnknownPacketType(other)),
        }
    }
}

/// Request-side flags describing which body fields the sender wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestFlags {
    pub weather: bool,
    pub temperature: bool,
    pub pop: bool,
    pub alert: bool,
    pub disaster: bool,
}

/// The validated, high-level view of a packet header. This is the type the
/// rest of the codec and the servers operate on; [`RawHeader`] only exists
/// to drive `packed_struct`'s bit (de)serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_id: u16,
    pub packet_type: PacketType,
    pub flags: RequestFlags,
    pub ex_flag: bool,
    pub day: u8,
    pub timestamp: u64,
    pub area_code: u32,
}

impl Header {
    /// Decodes and validates a 16-byte header. Returns the header plus its
    /// carried checksum value (callers that already have the full body
    /// bytes use the checksum alongside [`super::checksum::verify`]).
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<(Header, u16), WipError> {
        let raw = RawHeader::unpack(bytes)
            .map_err(|e| WipError::MalformedHeader(e.to_string()))?;

        if raw.version != SUPPORTED_VERSION {
            return Err(WipError::UnsupportedVersion(raw.version));
        }
        if raw.reserved_a != 0 || raw.reserved_b != 0 {
            return Err(WipError::MalformedHeader(
                "reserved bits must be zero".to_string(),
            ));
        }
        if raw.day > 6 {
            return Err(WipError::InvalidValue(format!(
                "day {} outside 0..=6",
                raw.day
            )));
        }
        if raw.area_code > 0x000F_FFFF {
            return Err(WipError::InvalidValue("area_code exceeds 20 bits".into()));
        }

        let packet_type = PacketType::try_from(raw.packet_type)?;

        let header = Header {
            packet_id: raw.packet_id,
            packet_type,
            flags: RequestFlags {
                weather: raw.weather_flag,
                temperature: raw.temperature_flag,
                pop: raw.pop_flag,
                alert: raw.alert_flag,
                disaster: raw.disaster_flag,
            },
            ex_flag: raw.ex_flag,
            day: raw.day,
            timestamp: raw.timestamp,
            area_code: raw.area_code,
        };
        Ok((header, raw.checksum))
    }

    /// Packs this header into 16 bytes with a freshly computed checksum.
    pub fn encode(&self) -> Result<[u8; HEADER_LEN], WipError> {
        let mut raw = RawHeader {
            version: SUPPORTED_VERSION,
            packet_id: self.packet_id & 0x0FFF,
            packet_type: self.packet_type as u8,
            weather_flag: self.flags.weather,
            temperature_flag: self.flags.temperature,
            pop_flag: self.flags.pop,
            alert_flag: self.flags.alert,
            disaster_flag: self.flags.disaster,
            ex_flag: self.ex_flag,
            reserved_a: 0,
            day: self.day,
            reserved_b: 0,
            timestamp: self.timestamp,
            area_code: self.area_code & 0x000F_FFFF,
            checksum: 0,
        };
        let zeroed = raw
            .pack()
            .map_err(|e| WipError::PackingError(e.to_string()))?;
        raw.checksum = super::checksum::compute(&zeroed);
        raw.pack().map_err(|e| WipError::PackingError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header {
            packet_id: 0x234,
            packet_type: PacketType::QueryRequest,
            flags: RequestFlags {
                weather: true,
                temperature: true,
                pop: true,
                alert: false,
                disaster: false,
            },
            ex_flag: false,
            day: 0,
            timestamp: 1_700_000_000,
            area_code: 130010,
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let header = sample();
        let bytes = header.encode().expect("encode");
        let (decoded, checksum) = Header::decode(&bytes).expect("decode");
        assert_eq!(decoded, header);
        assert!(super::super::checksum::verify(&bytes, checksum));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = (2 << 4) | (bytes[0] & 0x0F);
        match Header::decode(&bytes) {
            Err(WipError::UnsupportedVersion(2)) => {}
            other => panic!("expected UnsupportedVersion(2), got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let mut bytes = sample().encode().unwrap();
        // type occupies bits 16..=18, the top 3 bits of byte 2.
        bytes[2] = (bytes[2] & 0x1F) | (6 << 5);
        match Header::decode(&bytes) {
            Err(WipError::UnknownPacketType(6)) => {}
            other => panic!("expected UnknownPacketType(6), got {other:?}"),
        }
    }

    #[test]
    fn rejects_day_out_of_range() {
        let mut header = sample();
        header.day = 6;
        let bytes = header.encode().unwrap();
        assert!(Header::decode(&bytes).is_ok());

        // day occupies bits 27..=29; force it to 7 directly in the raw bytes.
        let mut raw = RawHeader::unpack(&bytes).unwrap();
        raw.day = 7;
        let tampered = raw.pack().unwrap();
        match Header::decode(&tampered) {
            Err(WipError::InvalidValue(_)) => {}
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn area_code_boundaries_round_trip() {
        for area_code in [0u32, 0x000F_FFFF] {
            let mut header = sample();
            header.area_code = area_code;
            let bytes = header.encode().unwrap();
            let (decoded, _) = Header::decode(&bytes).unwrap();
            assert_eq!(decoded.area_code, area_code);
        }
    }
}
