use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use dashmap::DashMap;
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use rand::RngCore;
use std::io::Read;
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::FabricError;
use crate::message::envelope::Envelope;
use crate::message::flags::MessageFlags;
use crate::message::types::{MessageType, TypeTag};

const MAGIC: [u8; 4] = *b"MFAB";
const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub max_body_size: usize,
    pub shared_key: Option<[u8; 32]>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_body_size: 16 * 1024 * 1024,
            shared_key: None,
        }
    }
}

/// Maintains the type registry and performs envelope <-> byte-buffer
/// conversion, including optional gzip compression and AES-256-GCM
/// encryption (the fabric's pluggable codec slot; see DESIGN.md for why
/// this deviates from the historical AES-CBC wire note).
pub struct MessageCodec {
    config: CodecConfig,
    names: DashMap<TypeTag, &'static str>,
}

impl MessageCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            names: DashMap::new(),
        }
    }

    pub fn register<T: MessageType>(&self) {
        self.names.insert(T::TYPE_TAG, T::TYPE_NAME);
    }

    pub fn type_name(&self, tag: TypeTag) -> Option<String> {
        self.names.get(&tag).map(|n| n.to_string())
    }

    pub fn encode_body<T: MessageType>(&self, msg: &T) -> Result<Vec<u8>, FabricError> {
        bincode::serde::encode_to_vec(msg, bincode::config::standard()).map_err(FabricError::from)
    }

    pub fn decode_body<T: MessageType>(&self, bytes: &[u8]) -> Result<T, FabricError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(v, _)| v)
            .map_err(FabricError::from)
    }

    /// Serializes `env` into the wire header + body format (§6.2).
    pub fn encode_envelope(&self, env: &Envelope) -> Result<Vec<u8>, FabricError> {
        let mut body = env.body.clone();

        if env.flags.contains(MessageFlags::COMPRESSED) {
            body = gzip_compress(&body)?;
        }
        if env.flags.contains(MessageFlags::ENCRYPTED) {
            let key = self
                .config
                .shared_key
                .ok_or_else(|| FabricError::Codec("encrypted envelope but no shared key configured".into()))?;
            body = aes_encrypt(&key, &body)?;
        }

        if body.len() > self.config.max_body_size {
            return Err(FabricError::Codec(format!(
                "body of {} bytes exceeds configured maximum of {}",
                body.len(),
                self.config.max_body_size
            )));
        }

        let from_bytes = env.from_ep.to_string().into_bytes();
        let to_bytes = env.to_ep.to_string().into_bytes();

        let mut out = Vec::with_capacity(64 + from_bytes.len() + to_bytes.len() + body.len());
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&env.flags.0.to_le_bytes());
        out.extend_from_slice(&env.type_tag.0);
        out.extend_from_slice(env.session_id.as_bytes());
        out.push(env.hop_count);
        out.push(env.ttl);
        out.extend_from_slice(&env.expire_time.unwrap_or(0).to_le_bytes());
        out.extend_from_slice(&(from_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(&from_bytes);
        out.extend_from_slice(&(to_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(&to_bytes);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);

        Ok(out)
    }

    /// Deserializes a wire buffer into an [`Envelope`]. Rejection codes are
    /// surfaced as `FabricError::Codec`, never a panic — callers trace and
    /// drop the message.
    pub fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope, FabricError> {
        let mut r = Reader::new(bytes);

        let magic = r.take(4)?;
        if magic != MAGIC {
            return Err(FabricError::Codec("bad magic".into()));
        }
        let version = r.u8()?;
        if version != VERSION {
            return Err(FabricError::Codec(format!("unsupported version {version}")));
        }
        let flags = MessageFlags(r.u16le()?);
        let mut tag = [0u8; 4];
        tag.copy_from_slice(r.take(4)?);
        let type_tag = TypeTag(tag);
        let session_id = Uuid::from_slice(r.take(16)?).map_err(|e| FabricError::Codec(e.to_string()))?;
        let hop_count = r.u8()?;
        let ttl = r.u8()?;
        let expire_raw = r.i64le()?;
        let expire_time = if expire_raw == 0 { None } else { Some(expire_raw) };

        let from_len = r.u16le()? as usize;
        let from_bytes = r.take(from_len)?.to_vec();
        let to_len = r.u16le()? as usize;
        let to_bytes = r.take(to_len)?.to_vec();

        let body_len = r.u32le()? as usize;
        if body_len > self.config.max_body_size {
            return Err(FabricError::Codec(format!(
                "body of {body_len} bytes exceeds configured maximum of {}",
                self.config.max_body_size
            )));
        }
        let mut body = r.take(body_len)?.to_vec();

        if flags.contains(MessageFlags::ENCRYPTED) {
            let key = self
                .config
                .shared_key
                .ok_or_else(|| FabricError::Codec("encrypted envelope but no shared key configured".into()))?;
            body = aes_decrypt(&key, &body)?;
        }
        if flags.contains(MessageFlags::COMPRESSED) {
            body = gzip_decompress(&body)?;
        }

        let from_ep = Endpoint::parse(
            std::str::from_utf8(&from_bytes).map_err(|e| FabricError::Codec(e.to_string()))?,
        )?;
        let to_ep = Endpoint::parse(
            std::str::from_utf8(&to_bytes).map_err(|e| FabricError::Codec(e.to_string()))?,
        )?;

        Ok(Envelope {
            type_tag,
            flags,
            from_ep,
            to_ep,
            session_id,
            hop_count,
            ttl,
            expire_time,
            body,
        })
    }
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, FabricError> {
    let mut encoder = GzEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).map_err(FabricError::from)?;
    Ok(out)
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, FabricError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(FabricError::from)?;
    Ok(out)
}

fn aes_encrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, FabricError> {
    let cipher = Aes256Gcm::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|e| FabricError::Codec(format!("encryption failed: {e}")))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aes_decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, FabricError> {
    if data.len() < NONCE_LEN {
        return Err(FabricError::Codec("ciphertext shorter than nonce prefix".into()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| FabricError::Codec(format!("decryption failed: {e}")))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FabricError> {
        if self.pos + n > self.buf.len() {
            return Err(FabricError::Codec("truncated envelope".into()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, FabricError> {
        Ok(self.take(1)?[0])
    }

    fn u16le(&mut self) -> Result<u16, FabricError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32le(&mut self) -> Result<u32, FabricError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64le(&mut self) -> Result<i64, FabricError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope::new(
            TypeTag::new(*b"TEST"),
            Endpoint::parse("physical://root1/hubA/leaf1").unwrap(),
            Endpoint::parse("logical://svc/billing").unwrap(),
            b"hello".to_vec(),
        )
    }

    #[test]
    fn round_trips_plain_envelope() {
        let codec = MessageCodec::new(CodecConfig::default());
        let env = sample_envelope();
        let bytes = codec.encode_envelope(&env).unwrap();
        let decoded = codec.decode_envelope(&bytes).unwrap();
        assert_eq!(decoded.body, env.body);
        assert_eq!(decoded.type_tag, env.type_tag);
        assert!(decoded.from_ep.equals(&env.from_ep));
    }

    #[test]
    fn round_trips_compressed_and_encrypted() {
        let mut config = CodecConfig::default();
        config.shared_key = Some([7u8; 32]);
        let codec = MessageCodec::new(config);
        let mut env = sample_envelope();
        env.flags = MessageFlags::COMPRESSED | MessageFlags::ENCRYPTED;
        env.body = vec![42u8; 4096];
        let bytes = codec.encode_envelope(&env).unwrap();
        let decoded = codec.decode_envelope(&bytes).unwrap();
        assert_eq!(decoded.body, env.body);
    }

    #[test]
    fn rejects_bad_magic() {
        let codec = MessageCodec::new(CodecConfig::default());
        assert!(codec.decode_envelope(b"nope").is_err());
    }

    #[test]
    fn rejects_oversized_body() {
        let mut config = CodecConfig::default();
        config.max_body_size = 4;
        let codec = MessageCodec::new(config);
        let env = sample_envelope();
        assert!(codec.encode_envelope(&env).is_err());
    }
}
