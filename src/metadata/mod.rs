//! Setup-payload composite metadata: the typed records the admission
//! pipeline reads before a connection is allowed near the directory.
//!
//! Only two mime kinds matter to the registry core: the application
//! descriptor and the bearer token. Entries under any other mime are
//! carried opaquely so downstream layers can still reach them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Mime string for the application descriptor payload.
pub const APPLICATION_MIME: &str = "message/x.rsocket.application+json";
/// Mime string for the bearer-token payload.
pub const BEARER_TOKEN_MIME: &str = "message/x.rsocket.authentication.bearer.v0";

/// Reserved descriptor keys populated from the authenticated principal.
/// Values supplied by the client under these keys are discarded.
pub const ORGS_KEY: &str = "_orgs";
pub const ROLES_KEY: &str = "_roles";
pub const SERVICE_ACCOUNTS_KEY: &str = "_serviceAccounts";

/// Metadata kinds the admission pipeline recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MimeKind {
    /// `message/x.rsocket.application+json`
    Application,
    /// `message/x.rsocket.authentication.bearer.v0`
    BearerToken,
}

impl MimeKind {
    pub fn mime(self) -> &'static str {
        match self {
            Self::Application => APPLICATION_MIME,
            Self::BearerToken => BEARER_TOKEN_MIME,
        }
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("truncated composite metadata entry for {mime}")]
    Truncated { mime: String },
    #[error("composite metadata mime is not valid UTF-8")]
    MimeNotUtf8,
    #[error("composite metadata mime exceeds 128 bytes: {mime}")]
    MimeTooLong { mime: String },
    #[error("malformed {mime} payload: {detail}")]
    InvalidPayload { mime: String, detail: String },
}

impl MetadataError {
    /// Framing errors reject as a parse failure; payload errors surface
    /// as unexpected failures because framing already passed.
    pub fn is_framing(&self) -> bool {
        !matches!(self, Self::InvalidPayload { .. })
    }
}

/// The transport-agnostic view of an RSocket setup frame: opaque data
/// plus the composite metadata the pipeline decodes.
#[derive(Debug, Clone, Default)]
pub struct SetupPayload {
    pub metadata: Bytes,
    pub data: Bytes,
}

impl SetupPayload {
    pub fn new(metadata: Bytes, data: Bytes) -> Self {
        Self { metadata, data }
    }
}

/// Decoded composite metadata: ordered entries of (mime, payload).
///
/// Wire layout per entry: one header byte, then payload length as a
/// 24-bit big-endian integer, then the payload. A clear high bit means
/// the header byte is `len(mime) - 1` followed by the ASCII mime
/// string; a set high bit is a well-known mime id, which this core has
/// no registry for and carries under a synthetic `well-known/<id>`
/// name.
#[derive(Debug, Clone, Default)]
pub struct CompositeMetadata {
    entries: Vec<(String, Bytes)>,
}

impl CompositeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(buf: impl Into<Bytes>) -> Result<Self, MetadataError> {
        let mut buf: Bytes = buf.into();
        let mut entries = Vec::new();
        while buf.has_remaining() {
            let head = buf.get_u8();
            let mime = if head & 0x80 != 0 {
                format!("well-known/{}", head & 0x7f)
            } else {
                let mime_len = (head as usize) + 1;
                if buf.remaining() < mime_len {
                    return Err(MetadataError::Truncated {
                        mime: String::from("<mime>"),
                    });
                }
                let raw = buf.copy_to_bytes(mime_len);
                std::str::from_utf8(&raw)
                    .map_err(|_| MetadataError::MimeNotUtf8)?
                    .to_string()
            };
            if buf.remaining() < 3 {
                return Err(MetadataError::Truncated { mime });
            }
            let len = ((buf.get_u8() as usize) << 16)
                | ((buf.get_u8() as usize) << 8)
                | (buf.get_u8() as usize);
            if buf.remaining() < len {
                return Err(MetadataError::Truncated { mime });
            }
            let payload = buf.copy_to_bytes(len);
            entries.push((mime, payload));
        }
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Result<Bytes, MetadataError> {
        let mut out = BytesMut::new();
        for (mime, payload) in &self.entries {
            if mime.is_empty() || mime.len() > 128 {
                return Err(MetadataError::MimeTooLong { mime: mime.clone() });
            }
            out.put_u8((mime.len() - 1) as u8);
            out.put_slice(mime.as_bytes());
            out.put_u8((payload.len() >> 16) as u8);
            out.put_u8((payload.len() >> 8) as u8);
            out.put_u8(payload.len() as u8);
            out.put_slice(payload);
        }
        Ok(out.freeze())
    }

    pub fn push(&mut self, mime: impl Into<String>, payload: impl Into<Bytes>) {
        self.entries.push((mime.into(), payload.into()));
    }

    pub fn contains(&self, kind: MimeKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn get(&self, kind: MimeKind) -> Option<&Bytes> {
        let mime = kind.mime();
        self.entries
            .iter()
            .find(|(entry_mime, _)| entry_mime == mime)
            .map(|(_, payload)| payload)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-app descriptor supplied in setup metadata. Immutable once the
/// admission pipeline has stamped `id`, `connected_at`, and the
/// reserved principal keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// Instance id derived by the admission pipeline; client-supplied
    /// values are overwritten.
    #[serde(default)]
    pub id: i32,
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, rename = "connectedAt")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AppDescriptor {
    pub fn decode(payload: &[u8]) -> Result<Self, MetadataError> {
        serde_json::from_slice(payload).map_err(|err| MetadataError::InvalidPayload {
            mime: APPLICATION_MIME.to_string(),
            detail: err.to_string(),
        })
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }
}

/// Bearer token carried under the authentication mime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn decode(payload: &[u8]) -> Result<Self, MetadataError> {
        let token = std::str::from_utf8(payload).map_err(|err| MetadataError::InvalidPayload {
            mime: BEARER_TOKEN_MIME.to_string(),
            detail: err.to_string(),
        })?;
        Ok(Self(token.to_string()))
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    pub fn into_token(self) -> String {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> AppDescriptor {
        AppDescriptor {
            id: 0,
            uuid: "0123456789abcdef0123456789abcdef".into(),
            name: "svc-a".into(),
            ip: "10.0.0.1".into(),
            connected_at: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn composite_round_trip_preserves_entries() {
        let mut composite = CompositeMetadata::new();
        composite.push(APPLICATION_MIME, descriptor().encode());
        composite.push(BEARER_TOKEN_MIME, Bytes::from_static(b"token-1"));
        let decoded = CompositeMetadata::decode(composite.encode().unwrap()).unwrap();
        assert!(decoded.contains(MimeKind::Application));
        assert!(decoded.contains(MimeKind::BearerToken));
        let token = BearerToken::decode(decoded.get(MimeKind::BearerToken).unwrap()).unwrap();
        assert_eq!(token.token(), "token-1");
    }

    #[test]
    fn truncated_entry_names_the_offending_mime() {
        let mut composite = CompositeMetadata::new();
        composite.push(APPLICATION_MIME, Bytes::from_static(b"{}"));
        let encoded = composite.encode().unwrap();
        let cut = encoded.slice(0..encoded.len() - 1);
        let err = CompositeMetadata::decode(cut).unwrap_err();
        match err {
            MetadataError::Truncated { mime } => assert_eq!(mime, APPLICATION_MIME),
            other => panic!("unexpected error: {other}"),
        }
        assert!(MetadataError::Truncated {
            mime: String::new()
        }
        .is_framing());
    }

    #[test]
    fn well_known_entries_are_carried_opaquely() {
        // header byte with high bit set: well-known id 5, empty payload
        let raw = Bytes::from_static(&[0x85, 0, 0, 0]);
        let decoded = CompositeMetadata::decode(raw).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(!decoded.contains(MimeKind::Application));
    }

    #[test]
    fn descriptor_decode_rejects_bad_json() {
        let err = AppDescriptor::decode(b"not json").unwrap_err();
        assert!(!err.is_framing());
    }

    #[test]
    fn descriptor_json_uses_camel_case_timestamps() {
        let mut desc = descriptor();
        desc.connected_at = Some(Utc::now());
        let json = serde_json::to_value(&desc).unwrap();
        assert!(json.get("connectedAt").is_some());
        let back = AppDescriptor::decode(&desc.encode()).unwrap();
        assert_eq!(back.uuid, desc.uuid);
    }
}
