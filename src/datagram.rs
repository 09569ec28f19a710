use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::ProtocolError;

/// Datagram framing over a tunnel substream.
///
/// Each datagram is encoded as `u16be len` + `payload`, `len > 0`. The
/// substream is byte-oriented; without the prefix two datagrams written
/// back to back would coalesce into one read on the far side, so the
/// framing is what carries datagram boundaries end-to-end.
pub struct DatagramConn<RW> {
    inner: RW,
}

/// Largest encodable payload; a u16 length prefix can say no more.
pub const MAX_DATAGRAM_BYTES: usize = u16::MAX as usize;

impl<RW> DatagramConn<RW> {
    pub fn new(inner: RW) -> Self {
        Self { inner }
    }
}

impl<RW> DatagramConn<RW>
where
    RW: AsyncRead + Unpin,
{
    pub async fn read_datagram(&mut self, out: &mut [u8]) -> Result<usize, ProtocolError> {
        let n = self.inner.read_u16().await? as usize;
        if n == 0 {
            return Err(ProtocolError::EmptyDatagram);
        }
        if n > out.len() {
            // Drain to keep the stream aligned.
            let mut drain = vec![0u8; n];
            self.inner.read_exact(&mut drain).await?;
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "short buffer",
            )));
        }
        self.inner.read_exact(&mut out[..n]).await?;
        Ok(n)
    }
}

impl<RW> DatagramConn<RW>
where
    RW: AsyncWrite + Unpin,
{
    pub async fn write_datagram(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::EmptyDatagram);
        }
        if payload.len() > MAX_DATAGRAM_BYTES {
            return Err(ProtocolError::BodyTooLarge(payload.len()));
        }
        self.inner.write_u16(payload.len() as u16).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_datagrams_keep_their_boundaries() {
        let (a, b) = tokio::io::duplex(8 * 1024);
        let mut w = DatagramConn::new(a);
        let mut r = DatagramConn::new(b);

        let first = vec![0xAA; 1000];
        let second = vec![0xBB; 1000];
        w.write_datagram(&first).await.unwrap();
        w.write_datagram(&second).await.unwrap();

        let mut buf = vec![0u8; 64 * 1024];
        let n = r.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &first[..]);
        let n = r.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &second[..]);
    }

    #[tokio::test]
    async fn empty_datagram_is_invalid_both_ways() {
        let (mut a, b) = tokio::io::duplex(64);

        match DatagramConn::new(&mut a).write_datagram(&[]).await.unwrap_err() {
            ProtocolError::EmptyDatagram => {}
            other => panic!("unexpected error: {other:?}"),
        }

        a.write_u16(0).await.unwrap();
        let mut r = DatagramConn::new(b);
        let mut buf = [0u8; 16];
        match r.read_datagram(&mut buf).await.unwrap_err() {
            ProtocolError::EmptyDatagram => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_buffer_drains_and_stays_aligned() {
        let (a, b) = tokio::io::duplex(8 * 1024);
        let mut w = DatagramConn::new(a);
        let mut r = DatagramConn::new(b);

        w.write_datagram(&[1u8; 100]).await.unwrap();
        w.write_datagram(b"next").await.unwrap();

        let mut small = [0u8; 10];
        match r.read_datagram(&mut small).await.unwrap_err() {
            ProtocolError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::InvalidInput),
            other => panic!("unexpected error: {other:?}"),
        }

        // The next datagram decodes cleanly after the drain.
        let mut buf = [0u8; 16];
        let n = r.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"next");
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let (a, _b) = tokio::io::duplex(64);
        let mut w = DatagramConn::new(a);
        let payload = vec![0u8; MAX_DATAGRAM_BYTES + 1];
        match w.write_datagram(&payload).await.unwrap_err() {
            ProtocolError::BodyTooLarge(n) => assert_eq!(n, MAX_DATAGRAM_BYTES + 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
