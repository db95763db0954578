//! Init data utilities.
//!
//! Media frameworks hand the CDM a concatenated blob of PSSH boxes covering
//! every DRM system in the stream. Only the first record matching this
//! system's id matters for license requests.

use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

use crate::error::{Error, Result};

/// System id this engine answers for.
pub const SYSTEM_ID: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);

/// Key system string accepted by the engine.
pub const KEY_SYSTEM: &str = "com.widevine.alpha";

/// Extract the inner payload of the first PSSH record matching [`SYSTEM_ID`]
/// from a concatenated multi-PSSH blob.
///
/// Records are framed as 4-byte big-endian size, the literal `pssh` fourcc,
/// a version/flags word, and a 16-byte system id. Version 1 records carry a
/// key-id table between the system id and the payload. Records for other
/// systems are skipped; data that is not a PSSH box at all is rejected.
pub fn extract_system_pssh(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(Error::InvalidInitData("Data must not be empty".to_string()));
    }

    let mut offset = 0;
    while offset + 8 <= data.len() {
        let size = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
        if &data[offset + 4..offset + 8] != b"pssh" {
            return Err(Error::InvalidInitData("Not a PSSH box".to_string()));
        }
        if size < 8 || offset + size > data.len() {
            return Err(Error::InvalidInitData(
                "PSSH size exceeds data length".to_string(),
            ));
        }

        match parse_record(&data[offset..offset + size])? {
            Some(payload) => return Ok(payload),
            None => offset += size,
        }
    }

    Err(Error::InvalidInitData(
        "No PSSH record for this system".to_string(),
    ))
}

/// Parse one framed record; `None` when the system id does not match.
fn parse_record(record: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut offset = 8;
    if record.len() < offset + 4 + 16 {
        return Err(Error::InvalidInitData("PSSH header incomplete".to_string()));
    }

    let version = record[offset];
    offset += 4;

    let system_id = Uuid::from_slice(&record[offset..offset + 16])
        .map_err(|_| Error::InvalidInitData("Invalid system ID".to_string()))?;
    offset += 16;

    if version == 1 {
        if record.len() < offset + 4 {
            return Err(Error::InvalidInitData("Missing KID count".to_string()));
        }
        let kid_count = BigEndian::read_u32(&record[offset..offset + 4]) as usize;
        offset += 4 + kid_count * 16;
        if record.len() < offset {
            return Err(Error::InvalidInitData("Missing KIDs".to_string()));
        }
    }

    if record.len() < offset + 4 {
        return Err(Error::InvalidInitData(
            "Missing init data length".to_string(),
        ));
    }
    let data_size = BigEndian::read_u32(&record[offset..offset + 4]) as usize;
    offset += 4;
    if record.len() < offset + data_size {
        return Err(Error::InvalidInitData("Missing init data".to_string()));
    }

    if system_id != SYSTEM_ID {
        return Ok(None);
    }
    Ok(Some(record[offset..offset + data_size].to_vec()))
}

/// Build a v0 PSSH box around a payload.
pub fn build_pssh_box(system_id: Uuid, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 24);
    body.extend_from_slice(&[0u8; 4]);
    body.extend_from_slice(system_id.as_bytes());
    body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    body.extend_from_slice(payload);

    let size = (body.len() + 8) as u32;
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(b"pssh");
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const OTHER_SYSTEM: Uuid = Uuid::from_u128(0x9a04f07998404286ab92e65be0885f95);

    #[test]
    fn extracts_payload_from_single_box() {
        let boxed = build_pssh_box(SYSTEM_ID, b"payload-bytes");
        let payload = extract_system_pssh(&boxed).expect("extract");
        assert_eq!(payload, b"payload-bytes");
    }

    #[test]
    fn skips_foreign_system_records() {
        let mut blob = build_pssh_box(OTHER_SYSTEM, b"foreign");
        blob.extend_from_slice(&build_pssh_box(SYSTEM_ID, b"ours"));
        let payload = extract_system_pssh(&blob).expect("extract");
        assert_eq!(payload, b"ours");
    }

    #[test]
    fn first_matching_record_wins() {
        let mut blob = build_pssh_box(SYSTEM_ID, b"first");
        blob.extend_from_slice(&build_pssh_box(SYSTEM_ID, b"second"));
        let payload = extract_system_pssh(&blob).expect("extract");
        assert_eq!(payload, b"first");
    }

    #[test]
    fn rejects_non_pssh_data() {
        assert!(extract_system_pssh(b"garbage-data").is_err());
        assert!(extract_system_pssh(b"").is_err());
    }

    #[test]
    fn rejects_truncated_box() {
        let boxed = build_pssh_box(SYSTEM_ID, b"payload");
        assert!(extract_system_pssh(&boxed[..boxed.len() - 4]).is_err());
    }

    #[test]
    fn no_matching_record_is_error() {
        let blob = build_pssh_box(OTHER_SYSTEM, b"foreign");
        assert!(extract_system_pssh(&blob).is_err());
    }
}
