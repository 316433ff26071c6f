//! Framing of the `sess` hash field.
//!
//! The field carries the epoch the record was written under, the secure token
//! and the session data:
//!
//! ```text
//! 0x01 | epoch_len: u16 BE | epoch | token_len: u32 BE | token | session_data
//! ```
//!
//! Lengths are explicit, so session data may contain any byte.

use forkstate_core::SecureToken;

use crate::version::Epoch;

const FORMAT_V1: u8 = 0x01;

/// Decoded content of a `sess` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessEnvelope {
    pub epoch: Epoch,
    pub secure_token: SecureToken,
    pub session_data: Vec<u8>,
}

impl SessEnvelope {
    pub fn new(epoch: Epoch, secure_token: SecureToken, session_data: Vec<u8>) -> Self {
        Self {
            epoch,
            secure_token,
            session_data,
        }
    }

    /// Frame the envelope.
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        encode_parts(&self.epoch, &self.secure_token, &self.session_data)
    }

    /// Parse a framed envelope; the error describes what is wrong with it.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut reader = Reader { bytes, pos: 0 };

        let marker = reader.take(1)?[0];
        if marker != FORMAT_V1 {
            return Err(format!("unknown envelope format 0x{:02x}", marker));
        }

        let epoch_len = u16::from_be_bytes(reader.array::<2>()?) as usize;
        let epoch = utf8(reader.take(epoch_len)?, "epoch")?;

        let token_len = u32::from_be_bytes(reader.array::<4>()?) as usize;
        let token = utf8(reader.take(token_len)?, "secure token")?;

        Ok(Self {
            epoch: Epoch::new(epoch),
            secure_token: SecureToken::new(token),
            session_data: reader.rest().to_vec(),
        })
    }
}

/// Frame the parts without building an owned envelope first.
///
/// Fails when the epoch or the token does not fit its length prefix.
pub fn encode_parts(
    epoch: &Epoch,
    secure_token: &SecureToken,
    session_data: &[u8],
) -> Result<Vec<u8>, String> {
    let epoch = epoch.as_str().as_bytes();
    let token = secure_token.as_bytes();
    let epoch_len = u16::try_from(epoch.len())
        .map_err(|_| format!("epoch of {} bytes exceeds {} bytes", epoch.len(), u16::MAX))?;
    let token_len = u32::try_from(token.len())
        .map_err(|_| format!("secure token of {} bytes exceeds {} bytes", token.len(), u32::MAX))?;

    let mut out = Vec::with_capacity(1 + 2 + epoch.len() + 4 + token.len() + session_data.len());
    out.push(FORMAT_V1);
    out.extend_from_slice(&epoch_len.to_be_bytes());
    out.extend_from_slice(epoch);
    out.extend_from_slice(&token_len.to_be_bytes());
    out.extend_from_slice(token);
    out.extend_from_slice(session_data);
    Ok(out)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                format!(
                    "truncated envelope: need {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.bytes.len()
                )
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

fn utf8(bytes: &[u8], what: &str) -> Result<String, String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| format!("{} is not valid UTF-8", what))
}
