use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::{Framed, FramedParts};
use futures::{stream::{SplitSink, SplitStream}, SinkExt, StreamExt};
use crate::block::{BlockData, BlockRequest, RequestQueue};
use super::{*, handshake::*, message::*, state::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;
type MessageStream = SplitStream<Framed<TcpStream, MessageCodec>>;

// Whether the command loop keeps running after a command.
enum Flow {
    Continue,
    Stop,
}

pub struct PeerSession {

    // The peer's IP address.
    address: SocketAddr,

    // Read-only swarm state shared by all sessions.
    ctx: Arc<SessionContext>,

    // Single consumer of every command; all state changes happen in order.
    cmd_rx: PeerRx,

    // Weak: only the caller's handle, the reader task and in-flight timers
    // hold the channel open, never the session itself.
    cmd_tx: WeakPeerTx,

    // Downloaded blocks and the final disconnect notification.
    event_tx: EventTx,

    // Requests accepted but not yet on the wire.
    queue: RequestQueue,

    // Requests on the wire awaiting a piece.
    pending: RequestQueue,

    state: SessionState,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<SessionContext>) -> (PeerSession, PeerTx, EventRx) {

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            PeerSession {
                address,
                ctx,
                cmd_rx,
                cmd_tx: cmd_tx.downgrade(),
                event_tx,
                queue: RequestQueue::new(),
                pending: RequestQueue::new(),
                state: SessionState::default(),
            },
            cmd_tx,
            event_rx,
        )
    }

    // Runs the connection to completion. Always emits a final Disconnected
    // event and returns every unfulfilled request to the picker.
    pub async fn start(&mut self) {
        let reason = match self.run().await {
            Ok(()) => PeerError::ConnectionClosed,
            Err(e) => {
                tracing::error!("session error: {}", e);
                e
            },
        };
        self.teardown(reason);
    }

    async fn run(&mut self) -> Result<()> {

        let timeout = self.ctx.config.handshake_timeout;
        let stream = time::timeout(timeout, TcpStream::connect(self.address))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;
        tracing::trace!("outbound connection successful");

        let mut socket = Framed::new(stream, HandshakeCodec);
        self.exchange_handshake(&mut socket).await?;

        // Re-frame without dropping bytes a fast peer sent after its handshake.
        let old = socket.into_parts();
        let mut parts = FramedParts::new(old.io, MessageCodec);
        parts.read_buf = old.read_buf;
        let socket = Framed::from_parts(parts);

        self.process(socket).await
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>) -> Result<()> {

        let timeout = self.ctx.config.handshake_timeout;
        let handshake = Handshake::new(self.ctx.info_hash, self.ctx.client_id);

        tracing::info!("send handshake");
        time::timeout(timeout, socket.send(handshake))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;

        tracing::trace!("waiting for handshake");
        match time::timeout(timeout, socket.next()).await {
            Err(_) => Err(PeerError::HandshakeTimeout),
            Ok(None) => Err(PeerError::NoHandshake),
            Ok(Some(Err(e))) => Err(e),
            Ok(Some(Ok(handshake))) => {
                // The codec already validated the protocol string.
                if handshake.info_hash != self.ctx.info_hash {
                    return Err(PeerError::IncorrectInfoHash);
                }
                tracing::info!("handshake successful, peer connected");
                Ok(())
            },
        }
    }

    async fn process(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        let (mut sink, stream) = socket.split();

        // The reader task turns inbound frames into commands so that this
        // task remains the only place state changes.
        let Some(reader_tx) = self.cmd_tx.upgrade() else {
            return Err(PeerError::ChannelClosed);
        };
        let reader = tokio::spawn(Self::read_messages(stream, reader_tx));
        self.schedule(PeerCommand::SendKeepAlive, self.ctx.config.keepalive_interval);

        let result = loop {
            let Some(cmd) = self.cmd_rx.recv().await else {
                // Every command source is gone: the caller's handle, the
                // reader and any in-flight timers. A closing socket is a
                // different failure and arrives as SocketClosed instead.
                break Err(PeerError::ChannelClosed);
            };
            match self.handle_command(&mut sink, cmd).await {
                Ok(Flow::Continue) => {},
                Ok(Flow::Stop) => break Ok(()),
                Err(e) => break Err(e),
            }
            self.state.last_message_at = Instant::now();
        };

        reader.abort();
        result
    }

    async fn read_messages(mut stream: MessageStream, cmd_tx: PeerTx) {
        loop {
            let cmd = match stream.next().await {
                Some(Ok(msg)) => PeerCommand::PeerMessage(msg),
                Some(Err(e)) => {
                    cmd_tx.send(PeerCommand::SocketClosed(e)).ok();
                    return;
                },
                None => {
                    cmd_tx.send(PeerCommand::SocketClosed(PeerError::ConnectionClosed)).ok();
                    return;
                },
            };
            if cmd_tx.send(cmd).is_err() {
                return;
            }
        }
    }

    async fn handle_command(&mut self, sink: &mut MessageSink, cmd: PeerCommand) -> Result<Flow> {
        match cmd {

            PeerCommand::PeerMessage(msg) => self.handle_msg(sink, msg).await?,

            PeerCommand::Download(request) => {
                // Set semantics: a request already in flight is not queued twice.
                if !self.queue.contains(&request) && !self.pending.contains(&request) {
                    self.queue.push(request);
                    self.promote(sink).await?;
                }
            },

            PeerCommand::Interested => self.declare_interest(sink).await?,

            PeerCommand::SendKeepAlive => {
                if self.state.last_message_at.elapsed() > self.ctx.config.keepalive_interval {
                    self.send_message(sink, Message::KeepAlive).await?;
                }
                self.schedule(PeerCommand::SendKeepAlive, self.ctx.config.keepalive_interval);
            },

            PeerCommand::CheckRequest(request) => {
                if self.queue.contains(&request) || self.pending.contains(&request) {
                    return Err(PeerError::PeerDoesNotRespond(request));
                }
            },

            PeerCommand::CheckUnchoke => {
                if !self.state.unchoke_received {
                    return Err(PeerError::UnchokeTimeout);
                }
            },

            PeerCommand::SocketClosed(e) => return Err(e),

            PeerCommand::Shutdown => {
                tracing::info!("session shutdown");
                return Ok(Flow::Stop);
            },
        }

        Ok(Flow::Continue)
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("read: {}", msg);

        match msg {

            Message::KeepAlive => {},

            Message::Choke => self.state.peer_choking = true,

            Message::Unchoke => {
                self.state.peer_choking = false;
                self.state.unchoke_received = true;
                self.promote(sink).await?;
            },

            Message::Interested => self.state.peer_interested = true,

            Message::NotInterested => self.state.peer_interested = false,

            Message::Bitfield(bitfield) => self.state.peer_bitfield = Some(bitfield),

            Message::Have { idx } => self.state.set_have(idx),

            Message::Piece(block) => self.handle_piece(sink, block).await?,

            // Download-only client: we serve no requests and ignore the rest.
            Message::Request(_)
            | Message::Cancel(_)
            | Message::Port { .. }
            | Message::Unknown { .. } => {},

        }

        Ok(())
    }

    async fn handle_piece(&mut self, sink: &mut MessageSink, block: BlockData) -> Result<()> {

        let request: BlockRequest = block.request();
        if !self.pending.remove(&request) {
            return Err(PeerError::UnexpectedPiece(request));
        }

        self.event_tx.send(Event::Downloaded(request, block.data)).ok();
        self.promote(sink).await
    }

    // Move one request from the queue onto the wire, declaring interest on
    // the way. While choked nothing is transmitted; queued requests wait for
    // the unchoke.
    async fn promote(&mut self, sink: &mut MessageSink) -> Result<()> {

        self.declare_interest(sink).await?;

        if self.state.peer_choking {
            return Ok(());
        }

        if let Some(request) = self.queue.pop() {
            self.pending.push(request);
            self.send_message(sink, Message::Request(request)).await?;
            self.schedule(PeerCommand::CheckRequest(request), self.ctx.config.request_timeout);
        }

        Ok(())
    }

    async fn declare_interest(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.state.am_interested {
            return Ok(());
        }
        self.send_message(sink, Message::Interested).await?;
        self.state.am_interested = true;
        if !self.state.unchoke_received {
            self.schedule(PeerCommand::CheckUnchoke, self.ctx.config.unchoke_timeout);
        }
        Ok(())
    }

    // Logs a message and sends it to the peer.
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("send: {}", msg);
        sink.send(msg).await
    }

    // Enqueue a command after a delay. The timer holds only a weak sender
    // while it sleeps; a tick that outlives the session is discarded.
    fn schedule(&self, cmd: PeerCommand, delay: time::Duration) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(cmd_tx) = cmd_tx.upgrade() {
                cmd_tx.send(cmd).ok();
            }
        });
    }

    // Hand every unfulfilled request back to the picker so other peers can
    // take them, then notify the consumer.
    fn teardown(&mut self, reason: PeerError) {
        for request in self.queue.drain() {
            self.ctx.picker.unpick(request);
        }
        for request in self.pending.drain() {
            self.ctx.picker.unpick(request);
        }
        self.event_tx.send(Event::Disconnected(reason)).ok();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use parking_lot::Mutex;
    use tokio::net::{TcpListener, TcpStream};
    use crate::{picker::PiecePicker, Bitfield, Config};
    use super::*;

    // Records unpicked requests so tests can assert on teardown behaviour.
    #[derive(Default)]
    struct RecordingPicker {
        unpicked: Mutex<Vec<BlockRequest>>,
    }

    impl PiecePicker for RecordingPicker {
        fn pick(&self, _availability: &Bitfield, _peer: SocketAddr) -> Option<BlockRequest> {
            None
        }
        fn complete(&self, _request: BlockRequest, _data: Vec<u8>) {}
        fn unpick(&self, request: BlockRequest) {
            self.unpicked.lock().push(request);
        }
    }

    const INFO_HASH: [u8; 20] = [0x21; 20];

    fn test_ctx(picker: Arc<RecordingPicker>) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            info_hash: INFO_HASH,
            client_id: *b"-RT0010-000000000000",
            picker,
            config: Config {
                handshake_timeout: Duration::from_millis(500),
                request_timeout: Duration::from_millis(200),
                unchoke_timeout: Duration::from_millis(200),
                keepalive_interval: Duration::from_millis(100),
                ..Config::default()
            },
        })
    }

    // Accept one connection, answer the handshake and return the framed
    // message transport of the remote end.
    async fn accept_peer(listener: TcpListener, info_hash: [u8; 20]) -> Framed<TcpStream, MessageCodec> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = Framed::new(stream, HandshakeCodec);
        let handshake = socket.next().await.unwrap().unwrap();
        assert_eq!(handshake.protocol, PROTOCOL);
        assert_eq!(handshake.info_hash, INFO_HASH);
        socket.send(Handshake::new(info_hash, [0xee; 20])).await.unwrap();
        Framed::new(socket.into_inner(), MessageCodec)
    }

    async fn connect_pair() -> (PeerHandle, Framed<TcpStream, MessageCodec>, Arc<RecordingPicker>) {
        let picker = Arc::new(RecordingPicker::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let remote = tokio::spawn(accept_peer(listener, INFO_HASH));
        let handle = PeerHandle::connect(address, test_ctx(picker.clone()));
        (handle, remote.await.unwrap(), picker)
    }

    fn block(piece_idx: u32, len: usize) -> BlockData {
        BlockData { piece_idx, offset: 0, data: vec![0xaa; len] }
    }

    const R1: BlockRequest = BlockRequest { piece_idx: 3, offset: 0, len: 8 };

    #[tokio::test]
    async fn test_handshake_rejects_wrong_info_hash() {
        let picker = Arc::new(RecordingPicker::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let remote = tokio::spawn(accept_peer(listener, [0x42; 20]));

        let mut handle = PeerHandle::connect(address, test_ctx(picker));
        match handle.events.recv().await {
            Some(Event::Disconnected(PeerError::IncorrectInfoHash)) => {},
            other => panic!("expected IncorrectInfoHash, got {:?}", other),
        }
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn test_download_after_unchoke() {
        let (handle, mut remote, _) = connect_pair().await;

        handle.peer_tx.send(PeerCommand::Download(R1)).unwrap();

        // Interest is declared as soon as a download is queued.
        assert_eq!(remote.next().await.unwrap().unwrap(), Message::Interested);

        // Nothing travels until the unchoke.
        remote.send(Message::Unchoke).await.unwrap();
        assert_eq!(remote.next().await.unwrap().unwrap(), Message::Request(R1));
    }

    #[tokio::test]
    async fn test_piece_completes_request() {
        let (mut handle, mut remote, _) = connect_pair().await;

        handle.peer_tx.send(PeerCommand::Download(R1)).unwrap();
        assert_eq!(remote.next().await.unwrap().unwrap(), Message::Interested);
        remote.send(Message::Unchoke).await.unwrap();
        assert_eq!(remote.next().await.unwrap().unwrap(), Message::Request(R1));

        remote.send(Message::Piece(block(3, 8))).await.unwrap();
        match handle.events.recv().await {
            Some(Event::Downloaded(request, data)) => {
                assert_eq!(request, R1);
                assert_eq!(data, vec![0xaa; 8]);
            },
            other => panic!("expected Downloaded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_download_sends_one_request() {
        let (_handle, mut remote, _) = {
            let (handle, remote, picker) = connect_pair().await;
            handle.peer_tx.send(PeerCommand::Download(R1)).unwrap();
            handle.peer_tx.send(PeerCommand::Download(R1)).unwrap();
            (handle, remote, picker)
        };

        assert_eq!(remote.next().await.unwrap().unwrap(), Message::Interested);
        remote.send(Message::Unchoke).await.unwrap();
        assert_eq!(remote.next().await.unwrap().unwrap(), Message::Request(R1));

        // Only keep-alives from here on; a second request frame would arrive
        // well within the window.
        let deadline = time::Instant::now() + Duration::from_millis(150);
        loop {
            match time::timeout_at(deadline, remote.next()).await {
                Err(_) => break,
                Ok(Some(Ok(Message::KeepAlive))) => {},
                Ok(frame) => panic!("unexpected frame: {:?}", frame.map(|f| f.map(|m| m.to_string()))),
            }
        }
    }

    #[tokio::test]
    async fn test_unexpected_piece_disconnects() {
        let (mut handle, mut remote, _) = connect_pair().await;

        remote.send(Message::Piece(block(7, 4))).await.unwrap();
        match handle.events.recv().await {
            Some(Event::Disconnected(PeerError::UnexpectedPiece(r))) => {
                assert_eq!(r, BlockRequest { piece_idx: 7, offset: 0, len: 4 });
            },
            other => panic!("expected UnexpectedPiece, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_timeout_disconnects_and_unpicks() {
        let (mut handle, mut remote, picker) = connect_pair().await;

        handle.peer_tx.send(PeerCommand::Download(R1)).unwrap();
        assert_eq!(remote.next().await.unwrap().unwrap(), Message::Interested);
        remote.send(Message::Unchoke).await.unwrap();
        assert_eq!(remote.next().await.unwrap().unwrap(), Message::Request(R1));

        // Never answer the request.
        match handle.events.recv().await {
            Some(Event::Disconnected(PeerError::PeerDoesNotRespond(r))) => assert_eq!(r, R1),
            other => panic!("expected PeerDoesNotRespond, got {:?}", other),
        }
        assert_eq!(*picker.unpicked.lock(), vec![R1]);
    }

    #[tokio::test]
    async fn test_unchoke_timeout_disconnects() {
        let (mut handle, _remote, picker) = connect_pair().await;

        handle.peer_tx.send(PeerCommand::Download(R1)).unwrap();
        match handle.events.recv().await {
            Some(Event::Disconnected(PeerError::UnchokeTimeout)) => {},
            other => panic!("expected UnchokeTimeout, got {:?}", other),
        }
        // The queued request goes back to the picker.
        assert_eq!(*picker.unpicked.lock(), vec![R1]);
    }

    #[tokio::test]
    async fn test_keepalive_sent_when_idle() {
        let (_handle, mut remote, _) = connect_pair().await;

        match time::timeout(Duration::from_millis(500), remote.next()).await {
            Ok(Some(Ok(Message::KeepAlive))) => {},
            other => panic!("expected KeepAlive, got {:?}", other.map(|f| f.map(|r| r.map(|m| m.to_string())))),
        }
    }

    #[tokio::test]
    async fn test_shutdown_emits_disconnected() {
        let (mut handle, _remote, _) = connect_pair().await;

        handle.peer_tx.send(PeerCommand::Shutdown).unwrap();
        match handle.events.recv().await {
            Some(Event::Disconnected(PeerError::ConnectionClosed)) => {},
            other => panic!("expected ConnectionClosed, got {:?}", other),
        }
    }
}
