// Wire format for fingerprint requests and replies.
// Numan Thabit 2026

use std::convert::TryFrom;

use thiserror::Error;

/// Length of a content fingerprint in bytes.
pub const DIGEST_LEN: usize = 64;

/// Number of shingles carried by a similarity request.
pub const SHINGLE_COUNT: usize = 32;

/// Encoded size of the shingle vector.
pub const SHINGLES_LEN: usize = SHINGLE_COUNT * 8;

/// Fixed size of the basic request frame.
pub const BASIC_CMD_LEN: usize = 75;

/// Fixed size of a request frame carrying shingles.
pub const SHINGLE_CMD_LEN: usize = BASIC_CMD_LEN + SHINGLES_LEN;

/// Largest datagram the server accepts; anything bigger is truncated
/// by the receive buffer and fails length validation.
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// Magic prefix announcing an encrypted request frame.
pub const ENCRYPTED_MAGIC: [u8; 8] = *b"numihash";

/// Recipient key identifier length (full public key).
pub const KEY_ID_LEN: usize = 32;

/// Ephemeral public key length.
pub const PUBKEY_LEN: usize = 32;

/// AEAD nonce length (XChaCha20-Poly1305).
pub const NONCE_LEN: usize = 24;

/// AEAD tag length.
pub const MAC_LEN: usize = 16;

/// Total size of the encrypted-request header.
pub const ENCRYPTED_HDR_LEN: usize =
    ENCRYPTED_MAGIC.len() + KEY_ID_LEN + PUBKEY_LEN + NONCE_LEN + MAC_LEN;

/// Size of the legacy reply payload.
pub const REPLY_V1_LEN: usize = 16;

/// Size of the current-epoch reply payload (v1 + timestamp).
pub const REPLY_LEN: usize = REPLY_V1_LEN + 8;

/// Size of the {nonce, mac} header prepended to encrypted replies.
pub const REPLY_ENC_HDR_LEN: usize = NONCE_LEN + MAC_LEN;

/// Opaque 64-byte content fingerprint.
pub type Digest = [u8; DIGEST_LEN];

/// Shingle vector accompanying similarity requests.
pub type Shingles = [u64; SHINGLE_COUNT];

/// Client command carried in a request frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Membership / similarity lookup.
    Check = 0,
    /// Insert or refresh an entry.
    Write = 1,
    /// Remove an entry.
    Delete = 2,
    /// Query the stored-entry count.
    Stat = 3,
    /// Extend the lifetime of an existing entry.
    Refresh = 4,
}

impl Command {
    /// True for commands that mutate the store.
    pub fn is_write(self) -> bool {
        matches!(self, Command::Write | Command::Delete | Command::Refresh)
    }
}

impl TryFrom<u8> for Command {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Check),
            1 => Ok(Command::Write),
            2 => Ok(Command::Delete),
            3 => Ok(Command::Stat),
            4 => Ok(Command::Refresh),
            other => Err(WireError::BadCommand(other)),
        }
    }
}

/// Wire-protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Epoch {
    /// Version 3: exact-size frames, no extensions.
    Legacy,
    /// Version 4: trailing extensions allowed.
    Current,
}

/// Number of recognized epochs (used for per-epoch counters).
pub const EPOCH_COUNT: usize = 2;

impl Epoch {
    /// Stable index for per-epoch counter arrays.
    pub fn index(self) -> usize {
        match self {
            Epoch::Legacy => 0,
            Epoch::Current => 1,
        }
    }

    /// Wire version byte for this epoch.
    pub fn version(self) -> u8 {
        match self {
            Epoch::Legacy => 3,
            Epoch::Current => 4,
        }
    }
}

/// Wire-level error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than required.
    #[error("truncated frame: expected at least {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    /// Legacy frames must match the expected size exactly.
    #[error("frame length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Unrecognized protocol version.
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    /// Unrecognized command byte.
    #[error("unknown command {0}")]
    BadCommand(u8),

    /// Shingle count must be zero or [`SHINGLE_COUNT`].
    #[error("invalid shingles count {0}")]
    BadShinglesCount(u8),

    /// Malformed trailing extension block.
    #[error("invalid extension block: {0}")]
    BadExtension(&'static str),

    /// Encrypted frame with no usable recipient key.
    #[error("encrypted request cannot be processed")]
    UnknownEncryption,
}

/// Decoded request fields, identical across epochs.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Requested operation.
    pub cmd: Command,
    /// Client-chosen category tag.
    pub flag: u32,
    /// Correlation cookie echoed back in the reply.
    pub tag: u32,
    /// Content fingerprint.
    pub digest: Digest,
    /// Present only on similarity requests.
    pub shingles: Option<Shingles>,
}

/// Source-attribution extension kinds.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    /// Originating domain, length-prefixed.
    SourceDomain = 1,
    /// Originating IPv4 address (4 bytes).
    SourceIp4 = 2,
    /// Originating IPv6 address (16 bytes).
    SourceIp6 = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExtensionRecord {
    kind: ExtensionKind,
    start: u32,
    len: u32,
}

/// Parsed extension block: an ordered record table over one
/// contiguous payload arena.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extensions {
    records: Vec<ExtensionRecord>,
    arena: Vec<u8>,
}

impl Extensions {
    /// True when no extensions were present.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of extension records, in wire order.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Iterates records in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (ExtensionKind, &[u8])> {
        self.records.iter().map(move |rec| {
            let start = rec.start as usize;
            let end = start + rec.len as usize;
            (rec.kind, &self.arena[start..end])
        })
    }
}

/// Parses a trailing extension block.
///
/// Two passes: the first validates lengths and counts bytes without
/// allocating, the second copies payloads into a single arena.
pub fn parse_extensions(buf: &[u8]) -> Result<Extensions, WireError> {
    let mut arena_len = 0usize;
    let mut n_records = 0usize;
    let mut pos = 0usize;

    while pos < buf.len() {
        let kind = buf[pos];
        pos += 1;
        match kind {
            k if k == ExtensionKind::SourceDomain as u8 => {
                let Some(&dom_len) = buf.get(pos) else {
                    return Err(WireError::BadExtension("domain length missing"));
                };
                pos += 1;
                if buf.len() - pos < dom_len as usize {
                    return Err(WireError::BadExtension("domain payload truncated"));
                }
                arena_len += dom_len as usize;
                pos += dom_len as usize;
            }
            k if k == ExtensionKind::SourceIp4 as u8 => {
                if buf.len() - pos < 4 {
                    return Err(WireError::BadExtension("ipv4 payload truncated"));
                }
                arena_len += 4;
                pos += 4;
            }
            k if k == ExtensionKind::SourceIp6 as u8 => {
                if buf.len() - pos < 16 {
                    return Err(WireError::BadExtension("ipv6 payload truncated"));
                }
                arena_len += 16;
                pos += 16;
            }
            _ => return Err(WireError::BadExtension("unknown extension kind")),
        }
        n_records += 1;
    }

    let mut extensions = Extensions {
        records: Vec::with_capacity(n_records),
        arena: Vec::with_capacity(arena_len),
    };

    let mut pos = 0usize;
    while pos < buf.len() {
        let kind = buf[pos];
        pos += 1;
        let (kind, payload_len) = match kind {
            k if k == ExtensionKind::SourceDomain as u8 => {
                let dom_len = buf[pos] as usize;
                pos += 1;
                (ExtensionKind::SourceDomain, dom_len)
            }
            k if k == ExtensionKind::SourceIp4 as u8 => (ExtensionKind::SourceIp4, 4),
            _ => (ExtensionKind::SourceIp6, 16),
        };

        let start = extensions.arena.len() as u32;
        extensions
            .arena
            .extend_from_slice(&buf[pos..pos + payload_len]);
        extensions.records.push(ExtensionRecord {
            kind,
            start,
            len: payload_len as u32,
        });
        pos += payload_len;
    }

    Ok(extensions)
}

/// Serializes an extension block (wire order preserved).
pub fn encode_extensions(extensions: &Extensions) -> Vec<u8> {
    let mut out = Vec::with_capacity(extensions.arena.len() + extensions.records.len() * 2);
    for (kind, payload) in extensions.iter() {
        out.push(kind as u8);
        if kind == ExtensionKind::SourceDomain {
            out.push(payload.len() as u8);
        }
        out.extend_from_slice(payload);
    }
    out
}

/// A fully decoded (plaintext) request frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRequest {
    /// Epoch derived from the version byte and frame size.
    pub epoch: Epoch,
    /// Decoded fixed fields.
    pub request: Request,
    /// Trailing extensions (current epoch only, possibly empty).
    pub extensions: Extensions,
}

/// Parses a plaintext request frame and validates its epoch.
pub fn parse_request(buf: &[u8]) -> Result<DecodedRequest, WireError> {
    if buf.len() < BASIC_CMD_LEN {
        return Err(WireError::TruncatedFrame {
            expected: BASIC_CMD_LEN,
            actual: buf.len(),
        });
    }

    let version = buf[0];
    let cmd = Command::try_from(buf[1])?;
    let shingles_count = buf[2];
    let flag = u32::from_le_bytes(buf[3..7].try_into().unwrap());
    let tag = u32::from_le_bytes(buf[7..11].try_into().unwrap());
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&buf[11..BASIC_CMD_LEN]);

    let expected = match shingles_count {
        0 => BASIC_CMD_LEN,
        c if c as usize == SHINGLE_COUNT => SHINGLE_CMD_LEN,
        other => return Err(WireError::BadShinglesCount(other)),
    };

    let epoch = match version {
        3 => {
            if buf.len() != expected {
                return Err(WireError::LengthMismatch {
                    expected,
                    actual: buf.len(),
                });
            }
            Epoch::Legacy
        }
        4 => {
            if buf.len() < expected {
                return Err(WireError::TruncatedFrame {
                    expected,
                    actual: buf.len(),
                });
            }
            Epoch::Current
        }
        other => return Err(WireError::BadVersion(other)),
    };

    let shingles = if shingles_count == 0 {
        None
    } else {
        let mut sgl = [0u64; SHINGLE_COUNT];
        for (i, chunk) in buf[BASIC_CMD_LEN..SHINGLE_CMD_LEN]
            .chunks_exact(8)
            .enumerate()
        {
            sgl[i] = u64::from_le_bytes(chunk.try_into().unwrap());
        }
        Some(sgl)
    };

    let extensions = if epoch == Epoch::Current && buf.len() > expected {
        parse_extensions(&buf[expected..])?
    } else {
        Extensions::default()
    };

    Ok(DecodedRequest {
        epoch,
        request: Request {
            cmd,
            flag,
            tag,
            digest,
            shingles,
        },
        extensions,
    })
}

/// Serializes a request frame for the given epoch.
pub fn encode_request(req: &Request, epoch: Epoch, extensions: &Extensions) -> Vec<u8> {
    let base = if req.shingles.is_some() {
        SHINGLE_CMD_LEN
    } else {
        BASIC_CMD_LEN
    };
    let mut out = Vec::with_capacity(base + extensions.arena.len());
    out.push(epoch.version());
    out.push(req.cmd as u8);
    out.push(if req.shingles.is_some() {
        SHINGLE_COUNT as u8
    } else {
        0
    });
    out.extend_from_slice(&req.flag.to_le_bytes());
    out.extend_from_slice(&req.tag.to_le_bytes());
    out.extend_from_slice(&req.digest);
    if let Some(sgl) = &req.shingles {
        for value in sgl {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    if epoch == Epoch::Current && !extensions.is_empty() {
        out.extend_from_slice(&encode_extensions(extensions));
    }
    out
}

/// Reply fields as carried on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reply {
    /// Correlation cookie copied from the request.
    pub tag: u32,
    /// Match confidence: 0.0 miss, 1.0 exact, fractions for shingles.
    pub prob: f32,
    /// Category flag of the matched entry.
    pub flag: u32,
    /// Status: 0 ok, 403 rejected, 401 skipped, 500 malformed.
    pub value: i32,
    /// Entry timestamp; current epoch only.
    pub ts: u64,
}

impl Reply {
    /// Blanks the freshness-revealing fields, keeping the tag.
    pub fn censor_delay(&mut self) {
        self.ts = 0;
        self.prob = 0.0;
        self.value = 0;
    }

    /// Blanks the whole reply body, keeping the tag.
    pub fn censor_forbidden(&mut self) {
        self.ts = 0;
        self.prob = 0.0;
        self.value = 0;
        self.flag = 0;
    }
}

/// Encoded reply size for an epoch.
pub fn reply_len(epoch: Epoch) -> usize {
    match epoch {
        Epoch::Legacy => REPLY_V1_LEN,
        Epoch::Current => REPLY_LEN,
    }
}

/// Serializes a reply for the given epoch.
///
/// Legacy replies carry only the 16-byte v1 payload; emitting the
/// right size matters because encrypted legacy replies authenticate
/// the smaller payload.
pub fn encode_reply(reply: &Reply, epoch: Epoch) -> Vec<u8> {
    let mut out = Vec::with_capacity(reply_len(epoch));
    out.extend_from_slice(&reply.tag.to_le_bytes());
    out.extend_from_slice(&reply.prob.to_le_bytes());
    out.extend_from_slice(&reply.flag.to_le_bytes());
    out.extend_from_slice(&reply.value.to_le_bytes());
    if epoch == Epoch::Current {
        out.extend_from_slice(&reply.ts.to_le_bytes());
    }
    out
}

/// Parses a reply frame of the given epoch.
pub fn parse_reply(buf: &[u8], epoch: Epoch) -> Result<Reply, WireError> {
    let expected = reply_len(epoch);
    if buf.len() < expected {
        return Err(WireError::TruncatedFrame {
            expected,
            actual: buf.len(),
        });
    }
    Ok(Reply {
        tag: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        prob: f32::from_le_bytes(buf[4..8].try_into().unwrap()),
        flag: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        value: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
        ts: if epoch == Epoch::Current {
            u64::from_le_bytes(buf[16..24].try_into().unwrap())
        } else {
            0
        },
    })
}

/// Header of an encrypted request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedHeader {
    /// Recipient key identifier (full public key bytes).
    pub key_id: [u8; KEY_ID_LEN],
    /// Sender's ephemeral public key.
    pub pubkey: [u8; PUBKEY_LEN],
    /// AEAD nonce.
    pub nonce: [u8; NONCE_LEN],
    /// AEAD tag over the ciphertext.
    pub mac: [u8; MAC_LEN],
}

/// True when the datagram announces the encrypted framing.
pub fn is_encrypted(buf: &[u8]) -> bool {
    buf.len() >= ENCRYPTED_HDR_LEN && buf[..ENCRYPTED_MAGIC.len()] == ENCRYPTED_MAGIC
}

/// Splits an encrypted datagram into its header and ciphertext body.
pub fn split_encrypted(buf: &[u8]) -> Result<(EncryptedHeader, &[u8]), WireError> {
    if buf.len() < ENCRYPTED_HDR_LEN {
        return Err(WireError::TruncatedFrame {
            expected: ENCRYPTED_HDR_LEN,
            actual: buf.len(),
        });
    }

    let mut pos = ENCRYPTED_MAGIC.len();
    let mut key_id = [0u8; KEY_ID_LEN];
    key_id.copy_from_slice(&buf[pos..pos + KEY_ID_LEN]);
    pos += KEY_ID_LEN;
    let mut pubkey = [0u8; PUBKEY_LEN];
    pubkey.copy_from_slice(&buf[pos..pos + PUBKEY_LEN]);
    pos += PUBKEY_LEN;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&buf[pos..pos + NONCE_LEN]);
    pos += NONCE_LEN;
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&buf[pos..pos + MAC_LEN]);
    pos += MAC_LEN;

    Ok((
        EncryptedHeader {
            key_id,
            pubkey,
            nonce,
            mac,
        },
        &buf[pos..],
    ))
}

/// Serializes an encrypted-request header followed by the ciphertext.
pub fn encode_encrypted(header: &EncryptedHeader, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENCRYPTED_HDR_LEN + ciphertext.len());
    out.extend_from_slice(&ENCRYPTED_MAGIC);
    out.extend_from_slice(&header.key_id);
    out.extend_from_slice(&header.pubkey);
    out.extend_from_slice(&header.nonce);
    out.extend_from_slice(&header.mac);
    out.extend_from_slice(ciphertext);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_request(shingles: bool) -> Request {
        Request {
            cmd: Command::Check,
            flag: 7,
            tag: 0xAABBCCDD,
            digest: [0x5A; DIGEST_LEN],
            shingles: shingles.then(|| std::array::from_fn(|i| i as u64 * 3)),
        }
    }

    #[test]
    fn basic_round_trip() {
        let req = sample_request(false);
        let bytes = encode_request(&req, Epoch::Current, &Extensions::default());
        assert_eq!(bytes.len(), BASIC_CMD_LEN);
        let decoded = parse_request(&bytes).unwrap();
        assert_eq!(decoded.epoch, Epoch::Current);
        assert_eq!(decoded.request, req);
        assert!(decoded.extensions.is_empty());
    }

    #[test]
    fn shingle_round_trip() {
        let req = sample_request(true);
        let bytes = encode_request(&req, Epoch::Legacy, &Extensions::default());
        assert_eq!(bytes.len(), SHINGLE_CMD_LEN);
        let decoded = parse_request(&bytes).unwrap();
        assert_eq!(decoded.epoch, Epoch::Legacy);
        assert_eq!(decoded.request, req);
    }

    #[test]
    fn legacy_size_must_be_exact() {
        let req = sample_request(true);
        let mut bytes = encode_request(&req, Epoch::Legacy, &Extensions::default());
        assert!(parse_request(&bytes).is_ok());

        bytes.push(0);
        assert!(matches!(
            parse_request(&bytes),
            Err(WireError::LengthMismatch { .. })
        ));

        bytes.truncate(SHINGLE_CMD_LEN - 2);
        assert!(parse_request(&bytes).is_err());
    }

    #[test]
    fn current_epoch_accepts_trailing_extensions() {
        let req = sample_request(false);
        let mut bytes = encode_request(&req, Epoch::Current, &Extensions::default());
        bytes.push(ExtensionKind::SourceIp4 as u8);
        bytes.extend_from_slice(&[127, 0, 0, 1]);
        bytes.push(ExtensionKind::SourceDomain as u8);
        bytes.push(11);
        bytes.extend_from_slice(b"example.org");

        let decoded = parse_request(&bytes).unwrap();
        let records: Vec<_> = decoded.extensions.iter().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (ExtensionKind::SourceIp4, &[127, 0, 0, 1][..]));
        assert_eq!(
            records[1],
            (ExtensionKind::SourceDomain, &b"example.org"[..])
        );
    }

    #[test]
    fn zero_length_domain_is_legal() {
        let ext = parse_extensions(&[ExtensionKind::SourceDomain as u8, 0]).unwrap();
        let records: Vec<_> = ext.iter().collect();
        assert_eq!(records, vec![(ExtensionKind::SourceDomain, &[][..])]);
    }

    #[test]
    fn overrunning_extension_rejects_whole_frame() {
        let req = sample_request(false);
        let mut bytes = encode_request(&req, Epoch::Current, &Extensions::default());
        bytes.push(ExtensionKind::SourceDomain as u8);
        bytes.push(32);
        bytes.extend_from_slice(b"short");
        assert!(matches!(
            parse_request(&bytes),
            Err(WireError::BadExtension(_))
        ));
    }

    #[test]
    fn unknown_extension_kind_rejected() {
        assert!(parse_extensions(&[0x7F, 1, 2]).is_err());
    }

    #[test]
    fn bad_shingles_count_rejected() {
        let req = sample_request(false);
        let mut bytes = encode_request(&req, Epoch::Current, &Extensions::default());
        bytes[2] = 5;
        assert_eq!(parse_request(&bytes), Err(WireError::BadShinglesCount(5)));
    }

    #[test]
    fn reply_sizes_per_epoch() {
        let reply = Reply {
            tag: 1,
            prob: 0.5,
            flag: 2,
            value: 0,
            ts: 12345,
        };
        assert_eq!(encode_reply(&reply, Epoch::Legacy).len(), REPLY_V1_LEN);
        let full = encode_reply(&reply, Epoch::Current);
        assert_eq!(full.len(), REPLY_LEN);
        assert_eq!(parse_reply(&full, Epoch::Current).unwrap(), reply);

        let legacy = parse_reply(&encode_reply(&reply, Epoch::Legacy), Epoch::Legacy).unwrap();
        assert_eq!(legacy.ts, 0);
        assert_eq!(legacy.tag, reply.tag);
    }

    #[test]
    fn encrypted_header_split() {
        let header = EncryptedHeader {
            key_id: [1; KEY_ID_LEN],
            pubkey: [2; PUBKEY_LEN],
            nonce: [3; NONCE_LEN],
            mac: [4; MAC_LEN],
        };
        let frame = encode_encrypted(&header, b"ciphertext");
        assert!(is_encrypted(&frame));
        let (parsed, body) = split_encrypted(&frame).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(body, b"ciphertext");
    }

    proptest! {
        #[test]
        fn request_round_trip(
            cmd in 0u8..=4,
            flag in any::<u32>(),
            tag in any::<u32>(),
            digest in prop::array::uniform32(any::<u8>()),
            shingles in prop::option::of(prop::collection::vec(any::<u64>(), SHINGLE_COUNT)),
            domains in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..24), 0..4),
        ) {
            let mut full_digest = [0u8; DIGEST_LEN];
            full_digest[..32].copy_from_slice(&digest);

            let req = Request {
                cmd: Command::try_from(cmd).unwrap(),
                flag,
                tag,
                digest: full_digest,
                shingles: shingles.map(|v| {
                    let mut sgl = [0u64; SHINGLE_COUNT];
                    sgl.copy_from_slice(&v);
                    sgl
                }),
            };

            let mut ext_bytes = Vec::new();
            for dom in &domains {
                ext_bytes.push(ExtensionKind::SourceDomain as u8);
                ext_bytes.push(dom.len() as u8);
                ext_bytes.extend_from_slice(dom);
            }
            let extensions = parse_extensions(&ext_bytes).unwrap();

            let bytes = encode_request(&req, Epoch::Current, &extensions);
            let decoded = parse_request(&bytes).unwrap();
            prop_assert_eq!(decoded.request, req);
            prop_assert_eq!(decoded.extensions, extensions);
        }
    }
}
