//! TCP and TLS channels driven by the shared [`IoEngine`].

use std::any::Any;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::client::TlsStream;

use super::engine::{EngineLease, IoEngine};
use super::tls;
use super::write_queue::{Submitted, WriteQueue, WriteRequest};
use super::{NetworkChannel, NetworkListener, NetworkService};
use crate::endpoint::Endpoint;
use crate::error::{ClientError, Result};
use crate::promise::{resolve, Promise};
use crate::settings::TransportSettings;

const READ_BUFFER_SIZE: usize = 8192;

enum IoStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_flush(cx),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens plain TCP channels for `amqp://` endpoints and TLS channels for
/// `amqps://` ones.
pub struct TcpNetworkService {
    settings: TransportSettings,
    engine: Arc<IoEngine>,
}

impl TcpNetworkService {
    /// Service running on the process-wide engine.
    pub fn new(settings: TransportSettings) -> Self {
        Self::with_engine(settings, IoEngine::shared())
    }

    pub fn with_engine(settings: TransportSettings, engine: Arc<IoEngine>) -> Self {
        Self { settings, engine }
    }
}

impl Default for TcpNetworkService {
    fn default() -> Self {
        Self::new(TransportSettings::default())
    }
}

impl NetworkService for TcpNetworkService {
    fn connect(
        &self,
        endpoint: &Endpoint,
        listener: Arc<dyn NetworkListener>,
        promise: Box<dyn Promise<Arc<dyn NetworkChannel>>>,
    ) {
        let lease = match self.engine.acquire(self.settings.io_threads) {
            Ok(lease) => lease,
            Err(e) => {
                resolve(promise.as_ref(), Err(e));
                return;
            }
        };
        let handle = lease.handle().clone();
        let endpoint = endpoint.clone();
        let settings = self.settings.clone();

        handle.spawn(async move {
            let stream = match open_stream(&endpoint, settings.connect_timeout()).await {
                Ok(stream) => stream,
                Err(e) => {
                    log::debug!("Connect to {} failed: {}", endpoint, e);
                    resolve(promise.as_ref(), Err(e));
                    drop(lease);
                    return;
                }
            };
            log::debug!("Connected to {}", endpoint);

            let (source, sink) = tokio::io::split(stream);
            let (commands, command_rx) = mpsc::unbounded_channel();
            let (stop_reader, stop_rx) = watch::channel(false);
            let channel = Arc::new(TcpChannel {
                peer: endpoint.to_string(),
                writes: Mutex::new(WriteQueue::new(
                    settings.write_low_water_mark,
                    settings.write_high_water_mark,
                )),
                commands,
                stop_reader,
                state: Mutex::new(ChannelState::Open),
                listener,
                context: Mutex::new(None),
                lease: Mutex::new(Some(lease)),
            });

            // The owner learns of the channel before any read is delivered.
            resolve(promise.as_ref(), Ok(Arc::clone(&channel) as Arc<dyn NetworkChannel>));

            tokio::spawn(run_writer(Arc::clone(&channel), sink, command_rx));
            tokio::spawn(run_reader(channel, source, stop_rx));
        });
    }
}

async fn open_stream(endpoint: &Endpoint, timeout: Duration) -> Result<IoStream> {
    let tcp = tokio::time::timeout(timeout, TcpStream::connect((endpoint.host(), endpoint.port())))
        .await
        .map_err(|_| ClientError::Network(format!("Connection to {} timed out", endpoint)))?
        .map_err(|e| ClientError::Network(format!("Connection to {} failed: {}", endpoint, e)))?;
    tcp.set_nodelay(true)?;

    if !endpoint.use_tls() {
        return Ok(IoStream::Plain(tcp));
    }

    let connector = tls::connector(endpoint)?;
    let server_name = tls::server_name(endpoint)?;
    let stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ClientError::Network(format!("TLS handshake with {} timed out", endpoint)))?
        .map_err(|e| {
            // rustls reports certificate and protocol failures as InvalidData.
            if e.kind() == io::ErrorKind::InvalidData {
                ClientError::Security(format!("TLS handshake with {} failed: {}", endpoint, e))
            } else {
                ClientError::Network(format!("TLS handshake with {} failed: {}", endpoint, e))
            }
        })?;
    Ok(IoStream::Tls(Box::new(stream)))
}

enum WriterCommand {
    Write(WriteRequest),
    Shutdown,
}

enum ChannelState {
    Open,
    /// Closed locally, waiting for the writer to finish.
    Closing(Vec<Box<dyn Promise<()>>>),
    Closed,
}

struct TcpChannel {
    peer: String,
    writes: Mutex<WriteQueue>,
    commands: mpsc::UnboundedSender<WriterCommand>,
    stop_reader: watch::Sender<bool>,
    state: Mutex<ChannelState>,
    listener: Arc<dyn NetworkListener>,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    lease: Mutex<Option<EngineLease>>,
}

impl TcpChannel {
    fn dispatch(&self, request: WriteRequest) {
        if let Err(mpsc::error::SendError(WriterCommand::Write(request))) =
            self.commands.send(WriterCommand::Write(request))
        {
            fail_write(request, &self.peer);
        }
    }

    fn deliver(self: &Arc<Self>, data: Bytes) {
        if self.is_open() {
            let me: Arc<dyn NetworkChannel> = self.clone();
            self.listener.on_read(&me, data);
        }
    }

    /// The connection ended without a local close. Notifies the listener
    /// unless the channel had already left the open state.
    fn terminate(self: &Arc<Self>, error: Option<ClientError>) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, ChannelState::Open) {
                return;
            }
            *state = ChannelState::Closed;
        }
        let _ = self.stop_reader.send(true);
        let _ = self.commands.send(WriterCommand::Shutdown);

        let me: Arc<dyn NetworkChannel> = self.clone();
        match error {
            Some(e) => {
                log::debug!("Channel to {} failed: {}", self.peer, e);
                self.listener.on_error(&me, e);
            }
            None => {
                log::debug!("Channel to {} closed by peer", self.peer);
                self.listener.on_close(&me);
            }
        }
    }

    /// Runs once the writer has stopped.
    fn finish_close(self: &Arc<Self>) {
        let (waiters, notify) = match std::mem::replace(&mut *self.state.lock(), ChannelState::Closed) {
            ChannelState::Closing(waiters) => (waiters, true),
            ChannelState::Open => (Vec::new(), true),
            ChannelState::Closed => (Vec::new(), false),
        };

        let parked = self.writes.lock().close();
        for request in parked {
            fail_write(request, &self.peer);
        }
        for waiter in waiters {
            resolve(waiter.as_ref(), Ok(()));
        }
        if notify {
            log::debug!("Channel to {} closed", self.peer);
            let me: Arc<dyn NetworkChannel> = self.clone();
            self.listener.on_close(&me);
        }

        // Last, as this may stop the runtime running this task.
        let lease = self.lease.lock().take();
        drop(lease);
    }
}

fn fail_write(request: WriteRequest, peer: &str) {
    resolve(
        request.promise.as_ref(),
        Err(ClientError::Network(format!("Channel to {} is closed", peer))),
    );
}

impl NetworkChannel for TcpChannel {
    fn write(&self, data: Bytes, promise: Box<dyn Promise<bool>>) {
        if !self.is_open() {
            resolve(
                promise.as_ref(),
                Err(ClientError::State(format!("Channel to {} is closed", self.peer))),
            );
            return;
        }
        let submitted = self.writes.lock().submit(WriteRequest { data, promise });
        match submitted {
            Submitted::Start(request) => self.dispatch(request),
            Submitted::Parked => {}
            Submitted::Closed(request) => resolve(
                request.promise.as_ref(),
                Err(ClientError::State(format!("Channel to {} is closed", self.peer))),
            ),
        }
    }

    fn close(&self, promise: Option<Box<dyn Promise<()>>>) {
        let mut state = self.state.lock();
        if let ChannelState::Closing(waiters) = &mut *state {
            waiters.extend(promise);
            return;
        }
        if matches!(*state, ChannelState::Closed) {
            drop(state);
            if let Some(promise) = promise {
                resolve(promise.as_ref(), Ok(()));
            }
            return;
        }

        *state = ChannelState::Closing(promise.into_iter().collect());
        drop(state);
        let _ = self.stop_reader.send(true);
        if self.commands.send(WriterCommand::Shutdown).is_err() {
            log::warn!("Writer for {} already stopped", self.peer);
        }
    }

    fn set_context(&self, context: Arc<dyn Any + Send + Sync>) {
        *self.context.lock() = Some(context);
    }

    fn context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.context.lock().clone()
    }

    fn is_open(&self) -> bool {
        matches!(*self.state.lock(), ChannelState::Open)
    }
}

async fn run_writer(
    channel: Arc<TcpChannel>,
    mut sink: WriteHalf<IoStream>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Write(request) => {
                let written: io::Result<()> = async {
                    sink.write_all(&request.data).await?;
                    sink.flush().await
                }
                .await;

                match written {
                    Ok(()) => {
                        let done = channel.writes.lock().complete(request.data.len());
                        resolve(request.promise.as_ref(), Ok(!done.backlog));
                        if let Some(next) = done.next {
                            channel.dispatch(next);
                        }
                    }
                    Err(e) => {
                        let error = ClientError::Network(format!("Write to {} failed: {}", channel.peer, e));
                        resolve(request.promise.as_ref(), Err(error.clone()));
                        channel.terminate(Some(error));
                        break;
                    }
                }
            }
            WriterCommand::Shutdown => {
                if let Err(e) = sink.shutdown().await {
                    log::debug!("Shutdown of {} failed: {}", channel.peer, e);
                }
                break;
            }
        }
    }

    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let WriterCommand::Write(request) = command {
            fail_write(request, &channel.peer);
        }
    }
    channel.finish_close();
}

async fn run_reader(channel: Arc<TcpChannel>, mut source: ReadHalf<IoStream>, mut stop: watch::Receiver<bool>) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            read = source.read_buf(&mut buf) => match read {
                Ok(0) => {
                    channel.terminate(None);
                    break;
                }
                Ok(_) => {
                    channel.deliver(buf.split().freeze());
                    buf.reserve(READ_BUFFER_SIZE);
                }
                Err(e) => {
                    channel.terminate(Some(ClientError::Network(format!(
                        "Read from {} failed: {}",
                        channel.peer, e
                    ))));
                    break;
                }
            }
        }
    }
}
