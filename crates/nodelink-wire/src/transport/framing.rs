//! Length-prefixed framing shared by the stream transports.
//!
//! Message streams carry a sequence of frames (4-byte big-endian length +
//! JSON). A data stream carries one [`DataHeader`] frame followed by exactly
//! `header.length` raw bytes.

use crate::channel::{cancelled, download_path, CancelSignal, DataHeader, InboundSink};
use crate::error::{WireError, WireResult};
use crate::message::{decode_length, decode_message, encode_frame, WireMessage, MAX_MESSAGE_SIZE};
use dashmap::DashMap;
use nodelink_types::EndpointId;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Write a framed message to a stream.
pub async fn write_message<W>(writer: &mut W, msg: &WireMessage) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame body. EOF before the header maps to `ConnectionClosed`.
async fn read_frame<R>(reader: &mut R) -> WireResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Read a framed message from a stream.
pub async fn read_message<R>(reader: &mut R) -> WireResult<WireMessage>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(reader).await?;
    Ok(decode_message(&body)?)
}

/// Feed every message of an inbound stream to `sink` until the peer hangs up.
pub(crate) async fn serve_messages<R>(mut reader: R, sink: Arc<dyn InboundSink>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_message(&mut reader).await {
            Ok(message) => sink.message_received(message),
            Err(WireError::ConnectionClosed) => return,
            Err(e) => {
                debug!(error = %e, "Inbound message stream ended");
                return;
            }
        }
    }
}

/// Stream `header` and then the file at `path`, unless cancelled first.
pub(crate) async fn write_data<W>(
    writer: &mut W,
    header: &DataHeader,
    path: &Path,
    cancel: CancelSignal,
) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    let transfer = async {
        let mut file = tokio::fs::File::open(path).await?;
        writer.write_all(&encode_frame(header)?).await?;
        let copied = tokio::io::copy(&mut (&mut file).take(header.length), writer).await?;
        if copied != header.length {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("file shrank during transfer: {copied} of {} bytes", header.length),
            )));
        }
        writer.flush().await?;
        Ok(())
    };

    tokio::select! {
        result = transfer => result,
        _ = cancelled(cancel) => Err(WireError::TransferCancelled),
    }
}

/// Receive one data transfer into `dir` and hand it to `sink`.
pub(crate) async fn receive_data<R>(mut reader: R, dir: PathBuf, sink: Arc<dyn InboundSink>)
where
    R: AsyncRead + Unpin,
{
    match read_data(&mut reader, &dir, sink.as_ref()).await {
        Ok((header, path)) => sink.data_received(header, path),
        Err(e) => warn!(error = %e, "Inbound data transfer failed"),
    }
}

async fn read_data<R>(
    reader: &mut R,
    dir: &Path,
    sink: &dyn InboundSink,
) -> WireResult<(DataHeader, PathBuf)>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(reader).await?;
    let header: DataHeader = serde_json::from_slice(&body)?;
    if !sink.accepts_data(&header) {
        return Err(WireError::DataRefused(header.sender));
    }
    tokio::fs::create_dir_all(dir).await?;
    let path = download_path(dir, &header);
    let mut file = tokio::fs::File::create(&path).await?;
    let copied = tokio::io::copy(&mut reader.take(header.length), &mut file).await?;
    file.flush().await?;
    if copied != header.length {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(WireError::ConnectionClosed);
    }
    Ok((header, path))
}

/// Outbound message streams cached per remote endpoint.
///
/// A failed write drops the cached stream so the next attempt reconnects.
pub(crate) struct OutboundConnections<W> {
    streams: DashMap<EndpointId, Arc<Mutex<W>>>,
}

impl<W> OutboundConnections<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }

    /// Write `msg` on the cached stream for `endpoint`, connecting first if needed.
    pub(crate) async fn send<C, Fut>(
        &self,
        endpoint: &EndpointId,
        msg: &WireMessage,
        connect: C,
    ) -> WireResult<()>
    where
        C: FnOnce() -> Fut,
        Fut: Future<Output = WireResult<W>>,
    {
        let existing = self.streams.get(endpoint).map(|s| Arc::clone(s.value()));
        let stream = match existing {
            Some(stream) => stream,
            None => {
                let stream = Arc::new(Mutex::new(connect().await?));
                self.streams.insert(endpoint.clone(), Arc::clone(&stream));
                stream
            }
        };

        let result = {
            let mut writer = stream.lock().await;
            write_message(&mut *writer, msg).await
        };
        if result.is_err() {
            self.streams
                .remove_if(endpoint, |_, cached| Arc::ptr_eq(cached, &stream));
        }
        result
    }

    pub(crate) fn remove(&self, endpoint: &EndpointId) {
        self.streams.remove(endpoint);
    }

    pub(crate) fn clear(&self) {
        self.streams.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::never_cancelled;
    use crate::message::WireMessageKind;
    use nodelink_types::MessageId;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CollectingSink {
        messages: StdMutex<Vec<WireMessage>>,
        data: StdMutex<Vec<(DataHeader, PathBuf)>>,
    }

    impl InboundSink for CollectingSink {
        fn message_received(&self, message: WireMessage) {
            self.messages.lock().unwrap().push(message);
        }

        fn data_received(&self, header: DataHeader, path: PathBuf) {
            self.data.lock().unwrap().push((header, path));
        }
    }

    #[tokio::test]
    async fn test_message_frames_over_duplex() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let sink = Arc::new(CollectingSink::default());
        let serve = tokio::spawn(serve_messages(server, sink.clone()));

        let sender = EndpointId::new("alpha");
        for _ in 0..3 {
            let msg = WireMessage::new(sender.clone(), WireMessageKind::Success);
            write_message(&mut client, &msg).await.unwrap();
        }
        drop(client);
        serve.await.unwrap();

        let messages = sink.messages.lock().unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.sender == sender));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_clean_eof_is_connection_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_data_transfer_round_trip() {
        let source_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("payload.bin");
        let bytes: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &bytes).unwrap();

        let header = DataHeader {
            sender: EndpointId::new("alpha"),
            id: MessageId::new(),
            in_response_to: MessageId::NONE,
            file_name: "payload.bin".to_string(),
            length: bytes.len() as u64,
        };

        let (mut client, server) = tokio::io::duplex(4096);
        let sink = Arc::new(CollectingSink::default());
        let receive = tokio::spawn(receive_data(
            server,
            target_dir.path().to_path_buf(),
            sink.clone(),
        ));
        write_data(&mut client, &header, &source, never_cancelled())
            .await
            .unwrap();
        drop(client);
        receive.await.unwrap();

        let data = sink.data.lock().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].0, header);
        assert_eq!(std::fs::read(&data[0].1).unwrap(), bytes);
    }

    struct RefusingSink(CollectingSink);

    impl InboundSink for RefusingSink {
        fn message_received(&self, message: WireMessage) {
            self.0.message_received(message);
        }

        fn accepts_data(&self, _header: &DataHeader) -> bool {
            false
        }

        fn data_received(&self, header: DataHeader, path: PathBuf) {
            self.0.data_received(header, path);
        }
    }

    #[tokio::test]
    async fn test_refused_transfer_writes_nothing() {
        let target_dir = tempfile::tempdir().unwrap();
        let downloads = target_dir.path().join("downloads");
        let header = DataHeader {
            sender: EndpointId::new("stranger"),
            id: MessageId::new(),
            in_response_to: MessageId::NONE,
            file_name: "flood.bin".to_string(),
            length: 1 << 40,
        };

        let (mut client, server) = tokio::io::duplex(4096);
        let sink = Arc::new(RefusingSink(CollectingSink::default()));
        let receive = tokio::spawn(receive_data(server, downloads.clone(), sink.clone()));
        client.write_all(&encode_frame(&header).unwrap()).await.unwrap();
        // The receiver hangs up after the header, so later writes may fail.
        let _ = client.write_all(&[0u8; 1024]).await;
        receive.await.unwrap();

        assert!(sink.0.data.lock().unwrap().is_empty());
        assert!(!downloads.exists());
    }

    #[tokio::test]
    async fn test_cancelled_transfer_stops() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("big.bin");
        std::fs::write(&source, vec![0u8; 256 * 1024]).unwrap();
        let header = DataHeader {
            sender: EndpointId::new("alpha"),
            id: MessageId::new(),
            in_response_to: MessageId::NONE,
            file_name: "big.bin".to_string(),
            length: 256 * 1024,
        };

        // Nobody reads the other end, so the write blocks until cancelled.
        let (mut client, _server) = tokio::io::duplex(1024);
        let (tx, rx) = tokio::sync::watch::channel(false);
        let transfer = tokio::spawn(async move {
            write_data(&mut client, &header, &source, rx).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let result = transfer.await.unwrap();
        assert!(matches!(result, Err(WireError::TransferCancelled)));
    }

    #[tokio::test]
    async fn test_failed_write_evicts_cached_stream() {
        let connections: OutboundConnections<tokio::io::DuplexStream> = OutboundConnections::new();
        let endpoint = EndpointId::new("beta");
        let msg = WireMessage::new(EndpointId::new("alpha"), WireMessageKind::Success);

        let (client, server) = tokio::io::duplex(1024);
        connections
            .send(&endpoint, &msg, || async move { Ok(client) })
            .await
            .unwrap();
        assert_eq!(connections.len(), 1);

        drop(server);
        let result = connections
            .send(&endpoint, &msg, || async { unreachable!("stream is cached") })
            .await;
        assert!(result.is_err());
        assert_eq!(connections.len(), 0);
    }
}
