use std::{
    fmt,
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const OPEN_MAGIC: &[u8; 5] = b"<UVM>";
const CLOSE_MAGIC: &[u8; 6] = b"</UVM>";

/// Size of an encoded registration frame.
pub const FRAME_LEN: usize = 35;
/// Size of either response.
pub const RESPONSE_LEN: usize = 13;
pub const CLIENT_ID_LEN: usize = 16;

const RESPONSE_OK: &[u8; RESPONSE_LEN] = b"<UVM>OK</UVM>";
const RESPONSE_EX: &[u8; RESPONSE_LEN] = b"<UVM>EX</UVM>";

// Field offsets inside the frame.
const IP_AT: usize = 5;
const PORT_AT: usize = 9;
const ID_AT: usize = 13;
const CLOSE_AT: usize = 29;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {0} of {FRAME_LEN} bytes")]
    TooShort(usize),
    #[error("bad open magic")]
    BadOpenMagic,
    #[error("bad close magic")]
    BadCloseMagic,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("timed out waiting for peer")]
    Timeout,
    #[error("unexpected response {0:?}")]
    BadResponse(Vec<u8>),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientIdError {
    #[error("client id {0:?} is longer than {CLIENT_ID_LEN} bytes")]
    TooLong(String),
    #[error("client id {0:?} is not ASCII")]
    NotAscii(String),
}

/// Fixed 16-byte client identifier carried in every registration frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId([u8; CLIENT_ID_LEN]);

impl ClientId {
    /// Left-pads `s` with `'0'` to exactly 16 bytes.
    pub fn parse(s: &str) -> Result<Self, ClientIdError> {
        if !s.is_ascii() {
            return Err(ClientIdError::NotAscii(s.to_string()));
        }
        if s.len() > CLIENT_ID_LEN {
            return Err(ClientIdError::TooLong(s.to_string()));
        }
        let mut out = [b'0'; CLIENT_ID_LEN];
        out[CLIENT_ID_LEN - s.len()..].copy_from_slice(s.as_bytes());
        Ok(Self(out))
    }

    pub fn from_bytes(b: [u8; CLIENT_ID_LEN]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({self})")
    }
}

impl serde::Serialize for ClientId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// A decoded registration request.
///
/// The port is kept as the raw signed wire value so that every well-formed frame
/// survives a decode/encode cycle; use [`RegistrationToken::target_addr`] to get a
/// bindable address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationToken {
    pub ip: Ipv4Addr,
    pub port: i32,
    pub client_id: ClientId,
}

impl RegistrationToken {
    pub fn new(target: SocketAddrV4, client_id: ClientId) -> Self {
        Self {
            ip: *target.ip(),
            port: i32::from(target.port()),
            client_id,
        }
    }

    /// `None` when the wire port is outside `0..=65535`.
    pub fn target_addr(&self) -> Option<SocketAddrV4> {
        let port = u16::try_from(self.port).ok()?;
        Some(SocketAddrV4::new(self.ip, port))
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        out[..IP_AT].copy_from_slice(OPEN_MAGIC);
        out[IP_AT..PORT_AT].copy_from_slice(&self.ip.octets());
        out[PORT_AT..ID_AT].copy_from_slice(&self.port.to_le_bytes());
        out[ID_AT..CLOSE_AT].copy_from_slice(self.client_id.as_bytes());
        out[CLOSE_AT..].copy_from_slice(CLOSE_MAGIC);
        out
    }

    /// Decodes the first [`FRAME_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_LEN {
            check_prefix(buf)?;
            return Err(FrameError::TooShort(buf.len()));
        }
        let buf = &buf[..FRAME_LEN];
        if &buf[..IP_AT] != OPEN_MAGIC {
            return Err(FrameError::BadOpenMagic);
        }
        if &buf[CLOSE_AT..] != CLOSE_MAGIC {
            return Err(FrameError::BadCloseMagic);
        }

        let mut ip = [0u8; 4];
        ip.copy_from_slice(&buf[IP_AT..PORT_AT]);
        let mut port = [0u8; 4];
        port.copy_from_slice(&buf[PORT_AT..ID_AT]);
        let mut id = [0u8; CLIENT_ID_LEN];
        id.copy_from_slice(&buf[ID_AT..CLOSE_AT]);

        Ok(Self {
            ip: Ipv4Addr::from(ip),
            port: i32::from_le_bytes(port),
            client_id: ClientId::from_bytes(id),
        })
    }
}

/// Rejects a partially received frame once its bytes can no longer form a valid one.
///
/// Only the magics constrain the content, so this checks the open magic for any
/// prefix and the close magic for whatever part of it has arrived.
pub fn check_prefix(partial: &[u8]) -> Result<(), FrameError> {
    let open = partial.len().min(IP_AT);
    if partial[..open] != OPEN_MAGIC[..open] {
        return Err(FrameError::BadOpenMagic);
    }
    if partial.len() > CLOSE_AT {
        let end = partial.len().min(FRAME_LEN);
        if partial[CLOSE_AT..end] != CLOSE_MAGIC[..end - CLOSE_AT] {
            return Err(FrameError::BadCloseMagic);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Registration accepted and an external connection is now paired.
    Ok,
    /// Target address already registered; back off before retrying.
    PortInUse,
}

impl Response {
    pub fn as_bytes(&self) -> &'static [u8; RESPONSE_LEN] {
        match self {
            Response::Ok => RESPONSE_OK,
            Response::PortInUse => RESPONSE_EX,
        }
    }

    pub fn parse(b: &[u8]) -> Option<Self> {
        if b == RESPONSE_OK {
            Some(Response::Ok)
        } else if b == RESPONSE_EX {
            Some(Response::PortInUse)
        } else {
            None
        }
    }
}

pub async fn write_registration<W: AsyncWrite + Unpin>(
    w: &mut W,
    token: &RegistrationToken,
) -> Result<(), ProtocolError> {
    w.write_all(&token.encode()).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one registration frame, failing fast on a bad prefix.
pub async fn read_registration<R: AsyncRead + Unpin>(
    r: &mut R,
    timeout: Duration,
) -> Result<RegistrationToken, ProtocolError> {
    let read = async {
        let mut buf = [0u8; FRAME_LEN];
        let mut filled = 0;
        while filled < FRAME_LEN {
            let n = r.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(FrameError::TooShort(filled).into());
            }
            filled += n;
            check_prefix(&buf[..filled])?;
        }
        Ok(RegistrationToken::decode(&buf)?)
    };

    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    resp: Response,
) -> Result<(), ProtocolError> {
    w.write_all(resp.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Waits for the relay's answer. Silence, a short read, or unknown bytes are failures.
pub async fn read_response<R: AsyncRead + Unpin>(
    r: &mut R,
    timeout: Duration,
) -> Result<Response, ProtocolError> {
    let read = async {
        let mut buf = [0u8; RESPONSE_LEN];
        let mut filled = 0;
        while filled < RESPONSE_LEN {
            let n = r.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(ProtocolError::BadResponse(buf[..filled].to_vec()));
            }
            filled += n;
        }
        Response::parse(&buf).ok_or_else(|| ProtocolError::BadResponse(buf.to_vec()))
    };

    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}
