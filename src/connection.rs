//! Per-connection transport state: buffers, peer credentials and the
//! cached authorization decision (spec §3 `Connection`).

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::authz::Decision;
use crate::error::ProtocolError;
use crate::peer_cred::PeerCred;
use crate::wire;

/// Per-wakeup read size. Preserved literally from the original even though
/// it reads as an unintentional rate limit (spec §9 open question 1).
const READ_CHUNK: usize = 1024;

pub struct Connection {
    pub stream: UnixStream,
    pub peer: PeerCred,
    pub is_first_connection: bool,
    pub authorization: Decision,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
}

impl Connection {
    pub fn new(stream: UnixStream, peer: PeerCred, is_first_connection: bool) -> Self {
        Connection {
            stream,
            peer,
            is_first_connection,
            authorization: Decision::Pending,
            in_buf: Vec::new(),
            out_buf: Vec::new(),
        }
    }

    pub async fn read_chunk(&mut self) -> std::io::Result<usize> {
        let mut buf = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut buf).await?;
        self.in_buf.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    /// Pull one complete frame's payload off the front of the inbound
    /// buffer, if present. An oversized declared length is an error the
    /// caller must treat as "close this connection" without consuming
    /// anything further (spec §8 invariant 6).
    pub fn take_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match wire::take_frame(&self.in_buf)? {
            Some((payload, consumed)) => {
                let payload = payload.to_vec();
                self.in_buf.drain(..consumed);
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    pub fn queue_response(&mut self, payload: Vec<u8>) {
        self.out_buf.extend(wire::frame(payload));
    }

    pub fn has_pending_output(&self) -> bool {
        !self.out_buf.is_empty()
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        if !self.out_buf.is_empty() {
            self.stream.write_all(&self.out_buf).await?;
            self.out_buf.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, WriteBytesExt};

    fn peer() -> PeerCred {
        PeerCred {
            uid: 0,
            gid: 0,
            pid: 1,
            start_time: 0,
            exe_path: None,
            argv: None,
        }
    }

    /// Scenario 6 (spec §8 invariant 6): a declared frame length over the
    /// cap must surface as an error from a real socket read, not just from
    /// `wire::take_frame` in isolation.
    #[tokio::test]
    async fn oversized_declared_length_is_rejected() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(a, peer(), true);

        let mut header = Vec::new();
        header.write_u32::<BigEndian>((wire::MAX_FRAME_LEN + 1) as u32).unwrap();
        let mut writer = b;
        writer.write_all(&header).await.unwrap();
        writer.write_all(&[0u8; 16]).await.unwrap();

        conn.read_chunk().await.unwrap();
        assert!(matches!(conn.take_frame(), Err(ProtocolError::FrameTooLarge(n)) if n == wire::MAX_FRAME_LEN + 1));
    }
}
