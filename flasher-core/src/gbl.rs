//! GBL (Gecko Bootloader) image container: parse, validate, and expose the
//! tagged record stream described in §4.1.

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ImageError};
use crate::firmware::FirmwareImageType;
use crate::version::Version;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const TAG_HEADER_V3: u32 = 0x03A6_17EB;
const TAG_APPLICATION: u32 = 0xF40A_0AF4;
const TAG_BOOTLOADER: u32 = 0xF509_09F5;
const TAG_METADATA: u32 = 0xF608_08F6;
const TAG_PROG: u32 = 0xFE01_01FE;
const TAG_SE_UPGRADE: u32 = 0x5EA6_17EB;
const TAG_ERASEPROG: u32 = 0xFD03_03FD;
const TAG_END: u32 = 0xFC04_04FC;

/// A recognized (or vendor/forward-compatible) GBL record tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    HeaderV3,
    Application,
    Bootloader,
    Metadata,
    Prog,
    SeUpgrade,
    EraseProg,
    End,
    /// A tag not in the recognized set. The original NabuCasa tooling is
    /// lenient about these — they are preserved, not rejected, so long as
    /// the structural invariants (HEADER_V3 first, END last, CRC valid)
    /// hold.
    Unknown(u32),
}

impl Tag {
    fn from_u32(raw: u32) -> Tag {
        match raw {
            TAG_HEADER_V3 => Tag::HeaderV3,
            TAG_APPLICATION => Tag::Application,
            TAG_BOOTLOADER => Tag::Bootloader,
            TAG_METADATA => Tag::Metadata,
            TAG_PROG => Tag::Prog,
            TAG_SE_UPGRADE => Tag::SeUpgrade,
            TAG_ERASEPROG => Tag::EraseProg,
            TAG_END => Tag::End,
            other => Tag::Unknown(other),
        }
    }

    /// Priority bucket used to enforce the non-decreasing tag-order
    /// invariant. Unknown tags are exempt (see [`Tag::Unknown`]).
    fn priority(self) -> Option<u32> {
        match self {
            Tag::HeaderV3 => Some(0),
            Tag::Bootloader => Some(10),
            Tag::Application => Some(10),
            Tag::Metadata => Some(20),
            Tag::SeUpgrade => Some(30),
            Tag::Prog | Tag::EraseProg => Some(40),
            Tag::End => Some(100),
            Tag::Unknown(_) => None,
        }
    }
}

struct Record {
    tag: Tag,
    payload: std::ops::Range<usize>,
}

/// A parsed, validated GBL image. Immutable once constructed; the owning
/// buffer is kept alongside the record index so [`GblImage::serialized_bytes`]
/// can hand back the exact bytes that were parsed.
pub struct GblImage {
    buffer: Vec<u8>,
    records: Vec<Record>,
}

impl GblImage {
    /// Parses and validates a GBL image per §4.1. Rejects malformed
    /// structure (`ImageError::MalformedGbl`) and CRC-32 mismatches
    /// (`ImageError::ChecksumMismatch`).
    pub fn parse(bytes: &[u8]) -> Result<GblImage, Error> {
        let mut records = Vec::new();
        let mut offset = 0usize;
        let mut last_priority = 0u32;
        let mut end_record_end: Option<usize> = None;

        while offset < bytes.len() {
            if bytes.len() - offset < 8 {
                return Err(malformed("truncated record header"));
            }
            let raw_tag = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
            let len = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap()) as usize;
            let tag = Tag::from_u32(raw_tag);

            if records.is_empty() && tag != Tag::HeaderV3 {
                return Err(malformed("first record is not HEADER_V3"));
            }

            let payload_start = offset + 8;
            if bytes.len() - payload_start < len {
                return Err(malformed("record payload overruns buffer"));
            }
            let payload_end = payload_start + len;

            if let Some(priority) = tag.priority() {
                if priority < last_priority {
                    return Err(malformed("records are not in non-decreasing tag order"));
                }
                last_priority = priority;
            }

            records.push(Record {
                tag,
                payload: payload_start..payload_end,
            });

            if tag == Tag::End {
                if len != 4 {
                    return Err(malformed("END record payload is not a 4-byte CRC"));
                }
                end_record_end = Some(payload_end);
                break;
            }

            offset = payload_end;
        }

        let end_record_end = end_record_end.ok_or_else(|| malformed("no END record present"))?;
        if end_record_end != bytes.len() {
            return Err(malformed("trailing bytes after END record"));
        }

        let crc_region_end = end_record_end - 4;
        let stored_crc =
            u32::from_le_bytes(bytes[crc_region_end..end_record_end].try_into().unwrap());
        let computed_crc = CRC32.checksum(&bytes[0..crc_region_end]);
        if stored_crc != computed_crc {
            return Err(ImageError::ChecksumMismatch.into());
        }

        Ok(GblImage {
            buffer: bytes.to_vec(),
            records,
        })
    }

    /// Iterates the record stream in file order.
    pub fn tags(&self) -> impl Iterator<Item = (Tag, &[u8])> {
        self.records
            .iter()
            .map(move |r| (r.tag, &self.buffer[r.payload.clone()]))
    }

    /// Returns the original bytes this image was parsed from.
    pub fn serialized_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Parses the NabuCasa metadata JSON document out of the first
    /// `METADATA` record, if any.
    pub fn get_metadata(&self) -> Option<NabuCasaMetadata> {
        self.tags()
            .filter(|(tag, _)| *tag == Tag::Metadata)
            .find_map(|(_, payload)| parse_metadata_payload(payload))
    }

    /// The firmware personality this image targets, per its metadata.
    pub fn firmware_type(&self) -> Result<FirmwareImageType, Error> {
        let meta = self.get_metadata().ok_or(ImageError::MissingMetadata)?;
        meta.fw_type
            .parse()
            .map_err(|e| Error::ImageInvalid(ImageError::MalformedGbl(e)))
    }

    /// The version this image carries, per its metadata's `sdk_version`.
    pub fn version(&self) -> Result<Version, Error> {
        let meta = self.get_metadata().ok_or(ImageError::MissingMetadata)?;
        Version::parse(&meta.sdk_version).ok_or_else(|| {
            Error::ImageInvalid(ImageError::MalformedGbl(format!(
                "metadata sdk_version '{}' is not a parseable version",
                meta.sdk_version
            )))
        })
    }
}

fn malformed(msg: &str) -> Error {
    Error::ImageInvalid(ImageError::MalformedGbl(msg.to_string()))
}

/// NabuCasa's vendor metadata record, carried as JSON inside a `METADATA`
/// tag's payload (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NabuCasaMetadata {
    pub sdk_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ezsp_version: Option<String>,
    pub fw_type: String,
    pub metadata_version: u32,
    pub baudrate: u32,
}

/// A `METADATA` payload may carry other vendor data ahead of the JSON
/// document; we take the first valid JSON object found, matching the
/// leniency of the original tooling.
fn parse_metadata_payload(payload: &[u8]) -> Option<NabuCasaMetadata> {
    let text = std::str::from_utf8(payload).ok()?;
    if let Ok(meta) = serde_json::from_str::<NabuCasaMetadata>(text) {
        return Some(meta);
    }
    let start = text.find('{')?;
    serde_json::from_str(&text[start..]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le32(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    fn build_gbl(metadata_json: Option<&str>) -> Vec<u8> {
        let mut buf = Vec::new();

        // HEADER_V3: 8-byte payload (version + flags), contents don't matter here.
        buf.extend_from_slice(&le32(TAG_HEADER_V3));
        buf.extend_from_slice(&le32(8));
        buf.extend_from_slice(&[0u8; 8]);

        if let Some(json) = metadata_json {
            buf.extend_from_slice(&le32(TAG_METADATA));
            buf.extend_from_slice(&le32(json.len() as u32));
            buf.extend_from_slice(json.as_bytes());
        }

        // END header (crc filled in after).
        buf.extend_from_slice(&le32(TAG_END));
        buf.extend_from_slice(&le32(4));
        let crc_region_end = buf.len();
        let crc = CRC32.checksum(&buf[..crc_region_end]);
        buf.extend_from_slice(&crc.to_le_bytes());

        buf
    }

    #[test]
    fn parses_minimal_valid_image() {
        let bytes = build_gbl(None);
        let image = GblImage::parse(&bytes).unwrap();
        assert_eq!(image.tags().count(), 2);
        assert!(image.get_metadata().is_none());
    }

    #[test]
    fn round_trips_through_serialized_bytes() {
        let bytes = build_gbl(None);
        let image = GblImage::parse(&bytes).unwrap();
        let reparsed = GblImage::parse(image.serialized_bytes()).unwrap();
        assert_eq!(
            image.tags().map(|(t, p)| (t, p.to_vec())).collect::<Vec<_>>(),
            reparsed.tags().map(|(t, p)| (t, p.to_vec())).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn rejects_checksum_mismatch() {
        let mut bytes = build_gbl(None);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = GblImage::parse(&bytes).unwrap_err();
        assert!(matches!(err, Error::ImageInvalid(ImageError::ChecksumMismatch)));
    }

    #[test]
    fn rejects_missing_header() {
        let mut bytes = build_gbl(None);
        bytes[0] ^= 0xFF; // corrupt the HEADER_V3 tag itself
        let err = GblImage::parse(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::ImageInvalid(ImageError::MalformedGbl(_)) | Error::ImageInvalid(ImageError::ChecksumMismatch)
        ));
    }

    #[test]
    fn parses_nabucasa_metadata() {
        let json = r#"{"sdk_version":"7.1.3.0","ezsp_version":"13","fw_type":"NCP_UART_HW","metadata_version":1,"baudrate":115200}"#;
        let bytes = build_gbl(Some(json));
        let image = GblImage::parse(&bytes).unwrap();
        let meta = image.get_metadata().unwrap();
        assert_eq!(meta.sdk_version, "7.1.3.0");
        assert_eq!(image.firmware_type().unwrap(), FirmwareImageType::NcpUartHw);
        assert_eq!(image.version().unwrap(), Version::parse("7.1.3.0").unwrap());
    }

    #[test]
    fn missing_metadata_is_reported() {
        let bytes = build_gbl(None);
        let image = GblImage::parse(&bytes).unwrap();
        assert!(matches!(
            image.firmware_type().unwrap_err(),
            Error::ImageInvalid(ImageError::MissingMetadata)
        ));
    }
}
