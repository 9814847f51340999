//! Reconnecting line-JSON endpoint
//!
//! One endpoint maintains the TCP link to one collaborator daemon. Frames
//! go out as single JSON lines; inbound lines are decoded and forwarded.
//! The link is re-dialed with a fixed delay whenever it drops, and a frame
//! whose write failed is carried across the reconnect instead of lost.

use crate::config::EndpointConfig;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub struct Endpoint {
    service: &'static str,
    config: EndpointConfig,
}

impl Endpoint {
    pub fn new(service: &'static str, config: EndpointConfig) -> Self {
        Self { service, config }
    }

    /// Drive the link until the outgoing channel closes. `Out` frames are
    /// taken from `outgoing`, decoded `In` frames land on `inbound`.
    pub async fn run<Out, In>(self, mut outgoing: mpsc::Receiver<Out>, inbound: mpsc::Sender<In>)
    where
        Out: Serialize + Send + 'static,
        In: DeserializeOwned + Send + 'static,
    {
        let delay = Duration::from_secs(self.config.reconnect_delay_secs.max(1));
        // A line whose write failed, resent first thing after reconnect
        let mut carry: Option<String> = None;
        let mut first_attempt = true;

        loop {
            if !first_attempt {
                crate::metrics::record_bus_reconnect(self.service);
                sleep(delay).await;
            }
            first_attempt = false;

            let stream = match TcpStream::connect(&self.config.address).await {
                Ok(stream) => {
                    info!("Connected to {} at {}", self.service, self.config.address);
                    stream
                }
                Err(e) => {
                    warn!(
                        "Failed to connect to {} at {}: {}",
                        self.service, self.config.address, e
                    );
                    continue;
                }
            };

            let (read_half, write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let mut writer = BufWriter::new(write_half);

            if let Some(line) = carry.take() {
                debug!("Resending carried frame to {}", self.service);
                if let Err(e) = Self::write_line(&mut writer, &line).await {
                    warn!("Carried frame to {} failed again: {}", self.service, e);
                    carry = Some(line);
                    continue;
                }
            }

            loop {
                tokio::select! {
                    maybe = outgoing.recv() => {
                        let frame = match maybe {
                            Some(frame) => frame,
                            None => {
                                debug!("Outgoing channel to {} closed", self.service);
                                return;
                            }
                        };
                        let line = match serde_json::to_string(&frame) {
                            Ok(line) => line,
                            Err(e) => {
                                error!("Undecodable outbound frame for {}: {}", self.service, e);
                                continue;
                            }
                        };
                        if let Err(e) = Self::write_line(&mut writer, &line).await {
                            warn!("Write to {} failed: {}", self.service, e);
                            carry = Some(line);
                            break;
                        }
                    }
                    maybe = lines.next_line() => {
                        match maybe {
                            Ok(Some(line)) => {
                                if line.trim().is_empty() {
                                    continue;
                                }
                                match serde_json::from_str::<In>(&line) {
                                    Ok(frame) => {
                                        if inbound.send(frame).await.is_err() {
                                            debug!("Inbound channel from {} closed", self.service);
                                            return;
                                        }
                                    }
                                    Err(e) => {
                                        warn!("{} sent an undecodable frame: {}", self.service, e);
                                    }
                                }
                            }
                            Ok(None) => {
                                warn!("{} closed the connection", self.service);
                                break;
                            }
                            Err(e) => {
                                warn!("Read from {} failed: {}", self.service, e);
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn write_line(
        writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>,
        line: &str,
    ) -> std::io::Result<()> {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Frame {
        seq: u32,
        text: String,
    }

    fn config(address: String) -> EndpointConfig {
        EndpointConfig {
            address,
            reconnect_delay_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_round_trip_over_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let (out_tx, out_rx) = mpsc::channel::<Frame>(8);
        let (in_tx, mut in_rx) = mpsc::channel::<Frame>(8);
        tokio::spawn(Endpoint::new("testd", config(address)).run(out_rx, in_tx));

        let (mut socket, _) = listener.accept().await.unwrap();

        out_tx
            .send(Frame {
                seq: 1,
                text: "hello".to_string(),
            })
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = socket.read(&mut buf).await.unwrap();
        let received = String::from_utf8_lossy(&buf[..n]);
        assert!(received.ends_with('\n'));
        let decoded: Frame = serde_json::from_str(received.trim()).unwrap();
        assert_eq!(decoded.seq, 1);

        socket
            .write_all(b"{\"seq\":2,\"text\":\"world\"}\n")
            .await
            .unwrap();
        let inbound = in_rx.recv().await.unwrap();
        assert_eq!(
            inbound,
            Frame {
                seq: 2,
                text: "world".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_reconnects_after_the_service_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let (_out_tx, out_rx) = mpsc::channel::<Frame>(8);
        let (in_tx, mut in_rx) = mpsc::channel::<Frame>(8);
        tokio::spawn(Endpoint::new("testd", config(address)).run(out_rx, in_tx));

        // First connection is dropped straight away.
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);

        // The endpoint dials again; the second connection works.
        let (mut socket, _) = listener.accept().await.unwrap();
        socket
            .write_all(b"{\"seq\":7,\"text\":\"again\"}\n")
            .await
            .unwrap();
        let inbound = in_rx.recv().await.unwrap();
        assert_eq!(inbound.seq, 7);
    }

    #[tokio::test]
    async fn test_undecodable_inbound_line_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let (_out_tx, out_rx) = mpsc::channel::<Frame>(8);
        let (in_tx, mut in_rx) = mpsc::channel::<Frame>(8);
        tokio::spawn(Endpoint::new("testd", config(address)).run(out_rx, in_tx));

        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"not json at all\n").await.unwrap();
        socket
            .write_all(b"{\"seq\":3,\"text\":\"ok\"}\n")
            .await
            .unwrap();

        let inbound = in_rx.recv().await.unwrap();
        assert_eq!(inbound.seq, 3);
    }
}
