//! Extended-field TLV block (spec §3 "Extended-field block", §4.1).

use crate::error::WipError;

/// Maximum bytes a single record's value may occupy (10-bit length field).
pub const MAX_RECORD_VALUE_LEN: usize = 1023;

#[derive(Debug, Clone, PartialEq)]
pub enum ExtendedField {
    Alert(Vec<String>),
    Disaster(Vec<String>),
    Latitude(f32),
    Longitude(f32),
    Source(String),
    AuthHash([u8; 32]),
    Landmarks(Vec<String>),
    ErrorMessage(String),
    /// A record whose type id this implementation doesn't recognize.
    /// Preserved only when the caller opts into
    /// [`ExtendedFieldPolicy::PreserveUnknown`]; dropped by default.
    Unknown { id: u8, bytes: Vec<u8> },
}

impl ExtendedField {
    fn type_id(&self) -> u8 {
        match self {
            ExtendedField::Alert(_) => 1,
            ExtendedField::Disaster(_) => 2,
            ExtendedField::Latitude(_) => 3,
            ExtendedField::Longitude(_) => 4,
            ExtendedField::Source(_) => 5,
            ExtendedField::AuthHash(_) => 6,
            ExtendedField::Landmarks(_) => 7,
            ExtendedField::ErrorMessage(_) => 8,
            ExtendedField::Unknown { id, .. } => *id,
        }
    }

    fn value_bytes(&self) -> Result<Vec<u8>, WipError> {
        let bytes = match self {
            ExtendedField::Alert(items) | ExtendedField::Disaster(items) => {
                serde_json::to_vec(items)?
            }
            ExtendedField::Landmarks(items) => serde_json::to_vec(items)?,
            ExtendedField::Latitude(v) | ExtendedField::Longitude(v) => v.to_be_bytes().to_vec(),
            ExtendedField::Source(s) | ExtendedField::ErrorMessage(s) => s.as_bytes().to_vec(),
            ExtendedField::AuthHash(digest) => digest.to_vec(),
            ExtendedField::Unknown { bytes, .. } => bytes.clone(),
        };
        if bytes.len() > MAX_RECORD_VALUE_LEN {
            return Err(WipError::InvalidValue(format!(
                "extended field value of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_RECORD_VALUE_LEN
            )));
        }
        Ok(bytes)
    }

    fn from_type_and_bytes(id: u8, bytes: &[u8]) -> Result<ExtendedField, WipError> {
        Ok(match id {
            1 => ExtendedField::Alert(serde_json::from_slice(bytes)?),
            2 => ExtendedField::Disaster(serde_json::from_slice(bytes)?),
            3 => ExtendedField::Latitude(read_f32(bytes)?),
            4 => ExtendedField::Longitude(read_f32(bytes)?),
            5 => ExtendedField::Source(std::str::from_utf8(bytes)?.to_string()),
            6 => ExtendedField::AuthHash(read_auth_hash(bytes)?),
            7 => ExtendedField::Landmarks(serde_json::from_slice(bytes)?),
            8 => ExtendedField::ErrorMessage(std::str::from_utf8(bytes)?.to_string()),
            other => ExtendedField::Unknown {
                id: other,
                bytes: bytes.to_vec(),
            },
        })
    }
}

fn read_f32(bytes: &[u8]) -> Result<f32, WipError> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| WipError::InvalidValue("expected a 4-byte float".into()))?;
    Ok(f32::from_be_bytes(array))
}

fn read_auth_hash(bytes: &[u8]) -> Result<[u8; 32], WipError> {
    bytes
        .try_into()
        .map_err(|_| WipError::InvalidValue("auth_hash must be exactly 32 bytes".into()))
}

/// Whether a record of a type id this codec doesn't recognize is kept
/// (tagged as `Unknown`) or silently dropped on decode. Spec §4.1's
/// documented default is skip-and-drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtendedFieldPolicy {
    #[default]
    DropUnknown,
    PreserveUnknown,
}

/// Decodes a contiguous TLV block. Unknown type ids are dropped or kept
/// per `policy`; every other record type that fails to parse its value
/// (bad UTF-8, bad JSON, wrong fixed-width size) is a hard decode error
/// since a malformed record generally indicates a bit-offset framing bug
/// rather than a forward-compat addition the core can skip past.
pub fn decode(bytes: &[u8], policy: ExtendedFieldPolicy) -> Result<Vec<ExtendedField>, WipError> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while bytes.len() - offset >= 2 {
        let header = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        let length = (header >> 6) as usize;
        let type_id = (header & 0x3F) as u8;
        offset += 2;

        if length > bytes.len() - offset {
            return Err(WipError::ExtendedOverflow(format!(
                "record type {type_id} declares length {length} but only {} bytes remain",
                bytes.len() - offset
            )));
        }
        let value = &bytes[offset..offset + length];
        let field = ExtendedField::from_type_and_bytes(type_id, value)?;
        offset += length;

        if matches!(field, ExtendedField::Unknown { .. }) && policy == ExtendedFieldPolicy::DropUnknown {
            continue;
        }
        out.push(field);
    }
    Ok(out)
}

/// Encodes a sequence of records back into the TLV wire form. Does not
/// enforce "at most one record per type id" (spec §3 invariant) — that's
/// validated by callers assembling a whole packet, where the sequence's
/// provenance (one field slot per concept) is known.
pub fn encode(fields: &[ExtendedField]) -> Result<Vec<u8>, WipError> {
    let mut out = Vec::new();
    for field in fields {
        let value = field.value_bytes()?;
        let header = ((value.len() as u16) << 6) | (field.type_id() as u16 & 0x3F);
        out.extend_from_slice(&header.to_be_bytes());
        out.extend_from_slice(&value);
    }
    Ok(out)
}
