//! The handshake `Option` record: always JSON, always written first,
//! before either side switches to the negotiated codec.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{DEFAULT_CODEC, MAGIC_NUMBER};
use crate::Error;

fn zero_duration() -> Duration {
    Duration::from_secs(0)
}

fn default_codec_name() -> String {
    DEFAULT_CODEC.to_string()
}

/// Handshake record. `connect_timeout` / `handle_timeout` of zero mean
/// "no limit" (spec.md §3). A missing `codec` field defaults to
/// [`DEFAULT_CODEC`] (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub magic: u64,
    #[serde(default = "default_codec_name")]
    pub codec: String,
    #[serde(default = "zero_duration", with = "duration_millis")]
    pub connect_timeout: Duration,
    #[serde(default = "zero_duration", with = "duration_millis")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            magic: MAGIC_NUMBER,
            codec: DEFAULT_CODEC.to_string(),
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::from_secs(0),
        }
    }
}

impl Options {
    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.magic != MAGIC_NUMBER {
            return Err(Error::Handshake(format!(
                "invalid magic number {:#x}",
                self.magic
            )));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Writes the handshake record as a single JSON object, with no additional
/// framing — the receiver scans for the matching closing brace itself
/// (see [`read_json_object`]). This mirrors how the reference
/// implementation's streaming JSON decoder finds the end of the value
/// without a length prefix.
pub async fn write_options<W: AsyncWrite + Unpin>(
    writer: &mut W,
    options: &Options,
) -> Result<(), Error> {
    let bytes = serde_json::to_vec(options)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_options<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Options, Error> {
    let bytes = read_json_object(reader).await?;
    let options: Options = serde_json::from_slice(&bytes)?;
    options.validate()?;
    Ok(options)
}

/// Reads exactly one top-level JSON object from `reader`, byte by byte,
/// tracking brace nesting depth and string/escape state so that trailing
/// bytes (the first byte of the subsequent codec stream) are left
/// untouched in the reader. Returns an `Io` error with `UnexpectedEof`
/// kind if the stream ends before the object is closed.
pub async fn read_json_object<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut started = false;

    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended before handshake Option was complete",
            )));
        }
        let b = byte[0];

        if !started {
            if b.is_ascii_whitespace() {
                continue;
            }
            if b != b'{' {
                return Err(Error::Handshake(
                    "handshake Option must be a JSON object".into(),
                ));
            }
            started = true;
            depth = 1;
            out.push(b);
            continue;
        }

        out.push(b);

        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(out);
                }
            }
            _ => {}
        }
    }
}
