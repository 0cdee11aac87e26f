//! Binary packet codec (spec §3, §4.1). Encodes and decodes whole
//! datagrams: the fixed header, the type-dependent response body, and the
//! optional extended-field TLV block.

pub mod auth;
pub mod checksum;
pub mod extended;
pub mod header;

use std::collections::HashSet;

pub use extended::{ExtendedField, ExtendedFieldPolicy};
pub use header::{Header, PacketType, RequestFlags};

use crate::error::WipError;

/// Maximum UDP payload this implementation will accept or emit (spec §6).
pub const MAX_DATAGRAM_LEN: usize = 2048;

/// Response-body length implied by a packet's type. `ReportRequest`
/// carries the same weather_code/temperature/pop layout as the response
/// types (spec §4.6 merges these straight into `CachedArea`); the other
/// two request types carry no fixed body of their own, since everything
/// they need travels in extended fields or the header (coordinates,
/// area code).
fn body_len(packet_type: PacketType) -> usize {
    match packet_type {
        PacketType::LocationResponse
        | PacketType::QueryResponse
        | PacketType::ReportResponse
        | PacketType::ReportRequest => 4,
        PacketType::ErrorResponse => 1,
        PacketType::LocationRequest | PacketType::QueryRequest => 0,
    }
}

/// The basic weather body carried by Location/Query/Report responses:
/// weather_code (u16), temperature (wire-offset i8), precipitation
/// probability (0..100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseBody {
    pub weather_code: u16,
    /// Signed Celsius. Converted to/from the wire's `+100` offset byte.
    pub temperature: i8,
    pub precipitation_prob: u8,
}

/// Wire offset applied to `temperature` so the byte stays unsigned (spec
/// §4.5 point 5 and §9's resolution of the "raw two's complement" vs.
/// offset-binary ambiguity in the original source: offset-binary wins).
const TEMPERATURE_WIRE_OFFSET: i16 = 100;

impl ResponseBody {
    pub fn to_bytes(self) -> [u8; 4] {
        let [hi, lo] = self.weather_code.to_be_bytes();
        let wire_temp = (self.temperature as i16 + TEMPERATURE_WIRE_OFFSET) as u8;
        [hi, lo, wire_temp, self.precipitation_prob]
    }

    pub fn from_bytes(bytes: &[u8; 4]) -> ResponseBody {
        let weather_code = u16::from_be_bytes([bytes[0], bytes[1]]);
        let temperature = (bytes[2] as i16 - TEMPERATURE_WIRE_OFFSET) as i8;
        ResponseBody {
            weather_code,
            temperature,
            precipitation_prob: bytes[3],
        }
    }
}

/// A fully decoded packet: validated header, type-appropriate body bytes,
/// and any extended-field records.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub body: Vec<u8>,
    pub extended: Vec<ExtendedField>,
}

impl Packet {
    pub fn response_body(&self) -> Result<ResponseBody, WipError> {
        let bytes: [u8; 4] = self.body.as_slice().try_into().map_err(|_| {
            WipError::MalformedHeader(format!(
                "expected a 4-byte response body, got {}",
                self.body.len()
            ))
        })?;
        Ok(ResponseBody::from_bytes(&bytes))
    }

    pub fn error_code(&self) -> Result<u8, WipError> {
        self.body.first().copied().ok_or_else(|| {
            WipError::MalformedHeader("error response carried no body byte".to_string())
        })
    }
}

/// Decodes a full UDP datagram into a [`Packet`]. Enforces the max
/// datagram size, header checksum, the type-implied body length, and the
/// "at most one record per extended-field type id" invariant (spec §3).
pub fn decode(datagram: &[u8]) -> Result<Packet, WipError> {
    if datagram.len() > MAX_DATAGRAM_LEN {
        return Err(WipError::InvalidValue(format!(
            "datagram of {} bytes exceeds the {} byte limit",
            datagram.len(),
            MAX_DATAGRAM_LEN
        )));
    }
    if datagram.len() < header::HEADER_LEN {
        return Err(WipError::MalformedHeader(format!(
            "datagram of {} bytes is shorter than the {}-byte header",
            datagram.len(),
            header::HEADER_LEN
        )));
    }

    let header_bytes: [u8; header::HEADER_LEN] = datagram[..header::HEADER_LEN].try_into().unwrap();
    let (header, carried_checksum) = Header::decode(&header_bytes)?;
    if !checksum::verify(&header_bytes, carried_checksum) {
        return Err(WipError::ChecksumMismatch);
    }

    let rest = &datagram[header::HEADER_LEN..];
    let blen = body_len(header.packet_type);
    if rest.len() < blen {
        return Err(WipError::MalformedHeader(format!(
            "expected a {blen}-byte body for {:?}, found {} bytes",
            header.packet_type,
            rest.len()
        )));
    }
    let body = rest[..blen].to_vec();
    let ext_bytes = &rest[blen..];

    let extended = if header.ex_flag {
        extended::decode(ext_bytes, ExtendedFieldPolicy::DropUnknown)?
    } else {
        if !ext_bytes.is_empty() {
            return Err(WipError::MalformedHeader(
                "trailing bytes after body with ex_flag unset".to_string(),
            ));
        }
        Vec::new()
    };

    let mut seen = HashSet::new();
    for field in &extended {
        if !matches!(field, ExtendedField::Unknown { .. }) {
            let discriminant = std::mem::discriminant(field);
            if !seen.insert(discriminant) {
                return Err(WipError::MalformedHeader(
                    "more than one record of the same extended-field type".to_string(),
                ));
            }
        }
    }

    Ok(Packet {
        header,
        body,
        extended,
    })
}

/// Encodes a [`Packet`] back to wire bytes.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, WipError> {
    let expected_blen = body_len(packet.header.packet_type);
    if packet.body.len() != expected_blen {
        return Err(WipError::ServerError(format!(
            "packet type {:?} requires a {expected_blen}-byte body, got {}",
            packet.header.packet_type,
            packet.body.len()
        )));
    }

    let mut out = Vec::with_capacity(header::HEADER_LEN + packet.body.len());
    out.extend_from_slice(&packet.header.encode()?);
    out.extend_from_slice(&packet.body);
    if packet.header.ex_flag {
        out.extend_from_slice(&extended::encode(&packet.extended)?);
    }

    if out.len() > MAX_DATAGRAM_LEN {
        return Err(WipError::InvalidValue(format!(
            "encoded packet of {} bytes exceeds the {} byte limit",
            out.len(),
            MAX_DATAGRAM_LEN
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_header(packet_type: PacketType, ex_flag: bool) -> Header {
        Header {
            packet_id: 0x123,
            packet_type,
            flags: RequestFlags {
                weather: true,
                temperature: true,
                pop: true,
                alert: false,
                disaster: false,
            },
            ex_flag,
            day: 0,
            timestamp: 1_700_000_000,
            area_code: 130010,
        }
    }

    #[test]
    fn round_trips_a_query_response_with_body_and_no_extended_fields() {
        let packet = Packet {
            header: base_header(PacketType::QueryResponse, false),
            body: ResponseBody {
                weather_code: 100,
                temperature: 25,
                precipitation_prob: 30,
            }
            .to_bytes()
            .to_vec(),
            extended: vec![],
        };
        let bytes = encode(&packet).expect("encode");
        assert_eq!(&bytes[16..20], &[0x00, 0x64, 0x7D, 0x1E]);
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn round_trips_a_location_request_with_coordinates() {
        let packet = Packet {
            header: base_header(PacketType::LocationRequest, true),
            body: vec![],
            extended: vec![ExtendedField::Latitude(35.6895), ExtendedField::Longitude(139.6917)],
        };
        let bytes = encode(&packet).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn rejects_datagrams_over_the_size_limit() {
        let oversized = vec![0u8; MAX_DATAGRAM_LEN + 1];
        match decode(&oversized) {
            Err(WipError::InvalidValue(_)) => {}
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_extended_field_types() {
        let mut header = base_header(PacketType::LocationRequest, true);
        header.ex_flag = true;
        let dup_bytes = extended::encode(&[
            ExtendedField::Latitude(1.0),
            ExtendedField::Latitude(2.0),
        ])
        .unwrap();
        let mut datagram = header.encode().unwrap().to_vec();
        datagram.extend_from_slice(&dup_bytes);
        match decode(&datagram) {
            Err(WipError::MalformedHeader(_)) => {}
            other => panic!("expected MalformedHeader, got {other:?}"),
        }
    }

    #[test]
    fn ex_flag_with_zero_records_decodes_to_an_empty_vec() {
        let header = base_header(PacketType::LocationRequest, true);
        let datagram = header.encode().unwrap().to_vec();
        let decoded = decode(&datagram).expect("decode");
        assert!(decoded.extended.is_empty());
    }

    #[test]
    fn checksum_tamper_is_detected() {
        let packet = Packet {
            header: base_header(PacketType::QueryRequest, false),
            body: vec![],
            extended: vec![],
        };
        let mut bytes = encode(&packet).unwrap();
        bytes[0] ^= 0xFF;
        match decode(&bytes) {
            Err(WipError::ChecksumMismatch) | Err(WipError::UnsupportedVersion(_)) => {}
            other => panic!("expected a header-tamper error, got {other:?}"),
        }
    }
}
