use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u8 = 0;
const CMD_PROXY_PROTOCOL: u8 = 0x00;
const CMD_HANDSHAKE: u8 = 0x01;

/// Frame bodies are length-prefixed with a u16, so this is the hard cap.
pub const MAX_BODY_BYTES: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported frame version {0}")]
    BadVersion(u8),
    #[error("invalid {0} cmd")]
    InvalidCmd(&'static str),
    #[error("frame body too large: {0}")]
    BodyTooLarge(usize),
    #[error("empty datagram")]
    EmptyDatagram,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// First frame on a tunnel connection, agent -> gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReq {
    #[serde(rename = "ClientID")]
    pub client_id: String,
}

/// Routing header, first frame on every substream, gateway -> agent.
///
/// Identifies the public endpoint a connection arrived on and the backend
/// the agent must dial. Not related to HAProxy's PROXY protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyProtocol {
    #[serde(rename = "ClientID")]
    pub client_id: String,
    pub public_protocol: String,
    #[serde(rename = "PublicIP")]
    pub public_ip: String,
    pub public_port: u16,
    pub internal_protocol: String,
    #[serde(rename = "InternalIP")]
    pub internal_ip: String,
    pub internal_port: u16,
}

impl ProxyProtocol {
    pub fn internal_addr(&self) -> String {
        format!("{}:{}", self.internal_ip, self.internal_port)
    }
}

pub async fn write_handshake<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &HandshakeReq,
) -> Result<(), ProtocolError> {
    write_frame(w, CMD_HANDSHAKE, &serde_json::to_vec(req)?).await
}

pub async fn read_handshake<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<HandshakeReq, ProtocolError> {
    let body = read_frame(r, CMD_HANDSHAKE, "handshake").await?;
    Ok(serde_json::from_slice(&body)?)
}

pub async fn write_proxy_protocol<W: AsyncWrite + Unpin>(
    w: &mut W,
    pp: &ProxyProtocol,
) -> Result<(), ProtocolError> {
    write_frame(w, CMD_PROXY_PROTOCOL, &serde_json::to_vec(pp)?).await
}

pub async fn read_proxy_protocol<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ProxyProtocol, ProtocolError> {
    let body = read_frame(r, CMD_PROXY_PROTOCOL, "pp").await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    cmd: u8,
    body: &[u8],
) -> Result<(), ProtocolError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(ProtocolError::BodyTooLarge(body.len()));
    }

    let mut hdr = [0u8; 4];
    hdr[0] = VERSION;
    hdr[1] = cmd;
    hdr[2..4].copy_from_slice(&(body.len() as u16).to_be_bytes());

    w.write_all(&hdr).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one frame, insisting on `expect_cmd`. On a bad version or cmd no
/// more than the 4-byte header has been consumed.
async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    expect_cmd: u8,
    what: &'static str,
) -> Result<Vec<u8>, ProtocolError> {
    let mut hdr = [0u8; 4];
    r.read_exact(&mut hdr).await?;

    if hdr[0] != VERSION {
        return Err(ProtocolError::BadVersion(hdr[0]));
    }
    if hdr[1] != expect_cmd {
        return Err(ProtocolError::InvalidCmd(what));
    }

    let body_len = u16::from_be_bytes([hdr[2], hdr[3]]) as usize;
    let mut body = vec![0u8; body_len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pp() -> ProxyProtocol {
        ProxyProtocol {
            client_id: "c1".into(),
            public_protocol: "tcp".into(),
            public_ip: "127.0.0.1".into(),
            public_port: 20001,
            internal_protocol: "tcp".into(),
            internal_ip: "127.0.0.1".into(),
            internal_port: 7001,
        }
    }

    #[tokio::test]
    async fn handshake_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let req = HandshakeReq {
            client_id: "c1".into(),
        };
        let w = {
            let req = req.clone();
            tokio::spawn(async move { write_handshake(&mut a, &req).await })
        };
        let got = read_handshake(&mut b).await.unwrap();
        w.await.unwrap().unwrap();

        assert_eq!(got, req);
    }

    #[tokio::test]
    async fn proxy_protocol_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let pp = sample_pp();
        let w = {
            let pp = pp.clone();
            tokio::spawn(async move { write_proxy_protocol(&mut a, &pp).await })
        };
        let got = read_proxy_protocol(&mut b).await.unwrap();
        w.await.unwrap().unwrap();

        assert_eq!(got, pp);
    }

    #[test]
    fn body_uses_original_json_keys() {
        let v = serde_json::to_value(sample_pp()).unwrap();
        let obj = v.as_object().unwrap();
        for key in [
            "ClientID",
            "PublicProtocol",
            "PublicIP",
            "PublicPort",
            "InternalProtocol",
            "InternalIP",
            "InternalPort",
        ] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(v["PublicPort"], serde_json::json!(20001));
    }

    #[tokio::test]
    async fn mismatched_cmd_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let pp = sample_pp();
            write_proxy_protocol(&mut a, &pp).await.unwrap();
        });

        let err = read_handshake(&mut b).await.unwrap_err();
        match err {
            ProtocolError::InvalidCmd(what) => assert_eq!(what, "handshake"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_version_is_rejected_reading_only_the_header() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            // version 9, then trailing bytes that must stay unread.
            a.write_all(&[9, CMD_HANDSHAKE, 0, 2]).await.unwrap();
            a.write_all(b"{}AFTER").await.unwrap();
        });

        let err = read_handshake(&mut b).await.unwrap_err();
        match err {
            ProtocolError::BadVersion(9) => {}
            other => panic!("unexpected error: {other:?}"),
        }

        // Everything past the header is still in the pipe.
        let mut rest = vec![0u8; 7];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"{}AFTER");
    }

    #[tokio::test]
    async fn truncated_body_is_a_framing_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut hdr = [0u8; 4];
            hdr[0] = VERSION;
            hdr[1] = CMD_HANDSHAKE;
            hdr[2..4].copy_from_slice(&100u16.to_be_bytes());
            a.write_all(&hdr).await.unwrap();
            a.write_all(b"short").await.unwrap();
            // Closing the pipe cuts the body off.
        });

        let err = read_handshake(&mut b).await.unwrap_err();
        match err {
            ProtocolError::Io(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_writing() {
        let (mut a, _b) = tokio::io::duplex(64);
        let body = vec![0u8; MAX_BODY_BYTES + 1];
        let err = write_frame(&mut a, CMD_HANDSHAKE, &body).await.unwrap_err();
        match err {
            ProtocolError::BodyTooLarge(n) => assert_eq!(n, MAX_BODY_BYTES + 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
