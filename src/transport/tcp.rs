//! TCP transport with NetBIOS session framing.

use super::SmbTransport;
use crate::error::{Error, Result};
use crate::netbios::{NetBiosHeader, NetBiosMessage, NetBiosMessageType};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// TCP transport for the SMB protocol
pub struct TcpTransport {
    stream: Option<TcpStream>,
    read_buffer: BytesMut,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// Create a TCP transport from an accepted stream
    pub fn from_stream(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();

        Self {
            stream: Some(stream),
            read_buffer: BytesMut::with_capacity(65536),
            local_addr,
            remote_addr,
        }
    }

    /// Local socket address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Peer socket address
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Answer a NetBIOS session request on port 139 with a positive response.
    pub async fn accept_netbios_session(&mut self) -> Result<()> {
        let (msg_type, _payload) = self.receive_frame().await?;
        if msg_type != NetBiosMessageType::SessionRequest {
            return Err(Error::Protocol(format!(
                "expected session request, got {:?}",
                msg_type
            )));
        }
        let response = NetBiosMessage::positive_response()?;
        self.send_raw(&response.to_bytes()).await
    }

    /// Receive one frame, returning its type and payload. Keepalives are
    /// consumed here and never surfaced.
    async fn receive_frame(&mut self) -> Result<(NetBiosMessageType, Vec<u8>)> {
        loop {
            while self.read_buffer.len() < NetBiosHeader::SIZE {
                self.read_more().await?;
            }

            let header = NetBiosHeader::parse(&self.read_buffer)?;
            let total = NetBiosHeader::SIZE + header.length as usize;
            while self.read_buffer.len() < total {
                self.read_more().await?;
            }

            let frame = self.read_buffer.split_to(total);
            if header.message_type == NetBiosMessageType::Keepalive {
                continue;
            }
            return Ok((header.message_type, frame[NetBiosHeader::SIZE..].to_vec()));
        }
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        match self.stream {
            Some(ref mut stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
                Ok(())
            }
            None => Err(Error::ConnectionClosed),
        }
    }

    async fn read_more(&mut self) -> Result<usize> {
        match self.stream {
            Some(ref mut stream) => {
                let mut temp = [0u8; 8192];
                let n = stream.read(&mut temp).await?;
                if n == 0 {
                    return Err(Error::ConnectionClosed);
                }
                self.read_buffer.put_slice(&temp[..n]);
                Ok(n)
            }
            None => Err(Error::ConnectionClosed),
        }
    }
}

#[async_trait]
impl SmbTransport for TcpTransport {
    async fn send_message(&mut self, data: Bytes) -> Result<()> {
        let msg = NetBiosMessage::session_message(data.to_vec())?;
        self.send_raw(&msg.to_bytes()).await
    }

    async fn receive_message(&mut self) -> Result<Vec<u8>> {
        let (msg_type, payload) = self.receive_frame().await?;
        if msg_type != NetBiosMessageType::SessionMessage {
            return Err(Error::Protocol(format!(
                "unexpected NetBIOS message type {:?}",
                msg_type
            )));
        }
        Ok(payload)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        self.read_buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_framed_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = TcpTransport::from_stream(stream);
            let msg = transport.receive_message().await.unwrap();
            transport.send_message(Bytes::from(msg)).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut transport = TcpTransport::from_stream(stream);
        transport
            .send_message(Bytes::from_static(b"ping"))
            .await
            .unwrap();
        let echoed = transport.receive_message().await.unwrap();
        assert_eq!(echoed, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = TcpTransport::from_stream(stream);
            transport.receive_message().await.unwrap()
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // keepalive, then a real message
        stream.write_all(&[0x85, 0, 0, 0]).await.unwrap();
        stream.write_all(&[0x00, 0, 0, 2, b'o', b'k']).await.unwrap();
        stream.flush().await.unwrap();

        let msg = server.await.unwrap();
        assert_eq!(msg, b"ok");
    }
}
