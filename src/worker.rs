//! Per-connection worker task.
//!
//! One worker owns all mutable connection state: the outgoing queue with
//! its per-message encoder states, the reassembly tables, the reply
//! bindings, and the transport's send side. Commands from handles and
//! events from the transport both arrive over channels, so every mutation
//! is serialized here.
//!
//! # Scheduling
//!
//! While the outgoing queue has sendable messages the worker runs passes:
//! each pass emits at most one frame per message, urgent messages first in
//! insertion order, then the rest in insertion order. A large message
//! therefore never monopolizes the transport. Between passes the worker
//! drains its channels so inbound frames and newly enqueued messages are
//! picked up promptly; with nothing to send it parks on both channels.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{MessageAssembly, MessageEncoder};
use crate::connection::{Command, Connection, ConnectionState};
use crate::error::{BlipError, Result};
use crate::flow::{AckTracker, SendWindow};
use crate::listener::{ConnectionListener, ReplyListener};
use crate::message::Message;
use crate::protocol::{flags, read_varint, write_varint, FrameHeader, MessageType, MAX_FRAME_SIZE};
use crate::transport::{TransportCommand, TransportEvent, TransportLink};

struct Outgoing {
    encoder: MessageEncoder,
    kind: MessageType,
    urgent: bool,
    window: SendWindow,
}

struct InboundRequest {
    assembly: MessageAssembly,
    acks: AckTracker,
}

struct PendingReplyEntry {
    assembly: MessageAssembly,
    acks: AckTracker,
    listener: Option<Box<dyn ReplyListener>>,
    complete: Option<oneshot::Sender<Message>>,
}

enum Shutdown {
    Local,
    Remote(Option<String>),
    Fault(BlipError),
}

pub(crate) struct Worker {
    conn: Connection,
    commands: mpsc::UnboundedReceiver<Command>,
    transport_tx: mpsc::Sender<TransportCommand>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    listener: Box<dyn ConnectionListener>,
    out_queue: VecDeque<Outgoing>,
    in_requests: HashMap<u32, InboundRequest>,
    pending_replies: HashMap<u32, PendingReplyEntry>,
    completed_requests: HashSet<u32>,
}

impl Worker {
    pub(crate) fn new(
        conn: Connection,
        commands: mpsc::UnboundedReceiver<Command>,
        transport: TransportLink,
        listener: Box<dyn ConnectionListener>,
    ) -> Self {
        Self {
            conn,
            commands,
            transport_tx: transport.commands,
            transport_rx: transport.events,
            listener,
            out_queue: VecDeque::new(),
            in_requests: HashMap::new(),
            pending_replies: HashMap::new(),
            completed_requests: HashSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let shutdown = match self.drive().await {
            Ok(shutdown) => shutdown,
            Err(error) => {
                tracing::error!(conn = %self.conn.id(), %error, "fatal protocol error");
                Shutdown::Fault(error)
            }
        };
        self.shutdown(shutdown).await;
    }

    async fn drive(&mut self) -> Result<Shutdown> {
        loop {
            if self.can_send() {
                if let Some(shutdown) = self.drain_ready_commands() {
                    return Ok(shutdown);
                }
                if let Some(shutdown) = self.drain_ready_events().await? {
                    return Ok(shutdown);
                }
                self.pump_pass().await?;
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    command = self.commands.recv() => match command {
                        Some(command) => {
                            if let Some(shutdown) = self.handle_command(command) {
                                return Ok(shutdown);
                            }
                        }
                        None => return Ok(Shutdown::Local),
                    },
                    event = self.transport_rx.recv() => match event {
                        Some(event) => {
                            if let Some(shutdown) = self.handle_event(event).await? {
                                return Ok(shutdown);
                            }
                        }
                        None => return Ok(Shutdown::Remote(Some("transport driver gone".to_owned()))),
                    },
                }
            }
        }
    }

    fn can_send(&self) -> bool {
        self.out_queue
            .iter()
            .any(|outgoing| !outgoing.window.is_stalled())
    }

    fn drain_ready_commands(&mut self) -> Option<Shutdown> {
        while let Ok(command) = self.commands.try_recv() {
            if let Some(shutdown) = self.handle_command(command) {
                return Some(shutdown);
            }
        }
        None
    }

    async fn drain_ready_events(&mut self) -> Result<Option<Shutdown>> {
        while let Ok(event) = self.transport_rx.try_recv() {
            if let Some(shutdown) = self.handle_event(event).await? {
                return Ok(Some(shutdown));
            }
        }
        Ok(None)
    }

    fn handle_command(&mut self, command: Command) -> Option<Shutdown> {
        match command {
            Command::Enqueue { message, reply } => {
                self.enqueue(message, reply);
                None
            }
            Command::SetListener(listener) => {
                self.listener = listener;
                None
            }
            Command::Close => Some(Shutdown::Local),
        }
    }

    fn enqueue(&mut self, mut message: Message, reply: Option<oneshot::Sender<Message>>) {
        let listener = message.take_reply_listener();
        let encoder = match MessageEncoder::new(
            message.number(),
            message.flags(),
            message.properties(),
            message.body().clone(),
        ) {
            Ok(encoder) => encoder,
            Err(error) => {
                // dropping `reply` resolves the placeholder with ConnectionClosed
                tracing::warn!(conn = %self.conn.id(), %error, "dropping unencodable message");
                return;
            }
        };

        let kind = message.message_type();
        if kind == MessageType::Msg && !message.is_no_reply() {
            self.pending_replies.insert(
                message.number(),
                PendingReplyEntry {
                    assembly: MessageAssembly::new(message.number()),
                    acks: AckTracker::default(),
                    listener,
                    complete: reply,
                },
            );
        }

        tracing::debug!(conn = %self.conn.id(), number = message.number(), "message enqueued");
        self.out_queue.push_back(Outgoing {
            encoder,
            kind,
            urgent: message.is_urgent(),
            window: SendWindow::default(),
        });
    }

    async fn handle_event(&mut self, event: TransportEvent) -> Result<Option<Shutdown>> {
        match event {
            TransportEvent::Binary(frame) => {
                self.on_frame(frame).await?;
                Ok(None)
            }
            TransportEvent::Text => Err(BlipError::TextMessageReceived),
            TransportEvent::Closed { reason } => Ok(Some(Shutdown::Remote(reason))),
            TransportEvent::Error(error) => Err(BlipError::Transport(error)),
        }
    }

    // One scheduler pass: a frame per sendable message, urgent first.
    async fn pump_pass(&mut self) -> Result<()> {
        let mut order: Vec<usize> = Vec::with_capacity(self.out_queue.len());
        order.extend((0..self.out_queue.len()).filter(|&i| self.out_queue[i].urgent));
        order.extend((0..self.out_queue.len()).filter(|&i| !self.out_queue[i].urgent));

        for index in order {
            let frame = {
                let outgoing = &mut self.out_queue[index];
                if outgoing.window.is_stalled() {
                    continue;
                }
                match outgoing.encoder.next_frame(MAX_FRAME_SIZE)? {
                    Some(frame) => {
                        outgoing.window.record_sent(frame.body_len);
                        if !frame.more_coming {
                            tracing::debug!(
                                conn = %self.conn.id(),
                                number = outgoing.encoder.number(),
                                "message fully framed"
                            );
                        }
                        frame
                    }
                    None => continue,
                }
            };
            self.send_frame(frame.bytes).await?;
        }

        self.out_queue.retain(|outgoing| !outgoing.encoder.is_finished());
        Ok(())
    }

    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.transport_tx
            .send(TransportCommand::Send(frame))
            .await
            .map_err(|_| BlipError::Transport("transport driver gone".to_owned()))
    }

    async fn send_ack(&self, kind: MessageType, number: u32, total: u64) -> Result<()> {
        let mut frame = BytesMut::new();
        FrameHeader::new(number, kind as u8 | flags::URGENT | flags::NOREPLY).encode(&mut frame);
        write_varint(&mut frame, total.min(u64::from(u32::MAX)) as u32);
        tracing::debug!(conn = %self.conn.id(), number, total, "sending ack");
        self.send_frame(frame.freeze()).await
    }

    async fn on_frame(&mut self, frame: Bytes) -> Result<()> {
        if frame.is_empty() {
            return Err(BlipError::EmptyFrame);
        }
        let mut payload = frame;
        let header = FrameHeader::decode(&mut payload)?;
        match header.message_type()? {
            MessageType::Msg => self.on_request_frame(header, payload).await,
            MessageType::Rpy | MessageType::Err => self.on_reply_frame(header, payload).await,
            kind => self.on_ack_frame(kind, header, payload),
        }
    }

    async fn on_request_frame(&mut self, header: FrameHeader, payload: Bytes) -> Result<()> {
        let number = header.number;
        match self.in_requests.get_mut(&number) {
            Some(entry) => entry.assembly.read_next_frame(header.flags, payload)?,
            None => {
                if self.completed_requests.contains(&number) {
                    return Err(BlipError::DuplicateMessageNumber(number));
                }
                let mut entry = InboundRequest {
                    assembly: MessageAssembly::new(number),
                    acks: AckTracker::default(),
                };
                entry.assembly.read_first_frame(header.flags, payload)?;
                self.in_requests.insert(number, entry);
            }
        }

        let (complete, ack_due) = {
            let entry = self.in_requests.get_mut(&number).expect("entry present");
            if entry.assembly.is_complete() {
                (true, None)
            } else {
                (false, entry.acks.note_total(entry.assembly.received_bytes()))
            }
        };

        if complete {
            let entry = self.in_requests.remove(&number).expect("entry present");
            self.completed_requests.insert(number);
            let message = self.into_message(number, entry.assembly);
            tracing::debug!(conn = %self.conn.id(), number, "request complete");
            self.listener.on_request(&self.conn, message);
        } else if let Some(total) = ack_due {
            self.send_ack(MessageType::AckMsg, number, total).await?;
        }
        Ok(())
    }

    async fn on_reply_frame(&mut self, header: FrameHeader, payload: Bytes) -> Result<()> {
        let number = header.number;
        let (complete, ack_due) = {
            let Some(entry) = self.pending_replies.get_mut(&number) else {
                tracing::warn!(conn = %self.conn.id(), number, "reply for unknown request, dropping");
                return Ok(());
            };
            if entry.assembly.has_header() {
                entry.assembly.read_next_frame(header.flags, payload)?;
            } else {
                entry.assembly.read_first_frame(header.flags, payload)?;
            }
            if entry.assembly.is_complete() {
                (true, None)
            } else {
                (false, entry.acks.note_total(entry.assembly.received_bytes()))
            }
        };

        if complete {
            let entry = self.pending_replies.remove(&number).expect("entry present");
            let message = self.into_message(number, entry.assembly);
            tracing::debug!(conn = %self.conn.id(), number, "reply complete");
            if let Some(listener) = entry.listener {
                listener.on_completed(message.clone());
            }
            if let Some(complete_tx) = entry.complete {
                let _ = complete_tx.send(message.clone());
            }
            if message.is_error() {
                self.listener.on_error(&self.conn, message);
            } else {
                self.listener.on_response(&self.conn, message);
            }
        } else if let Some(total) = ack_due {
            self.send_ack(MessageType::AckRpy, number, total).await?;
        }
        Ok(())
    }

    fn on_ack_frame(&mut self, kind: MessageType, header: FrameHeader, mut payload: Bytes) -> Result<()> {
        let total = u64::from(read_varint(&mut payload)?);
        let target = self
            .out_queue
            .iter_mut()
            .find(|outgoing| {
                outgoing.encoder.number() == header.number
                    && outgoing.kind.ack_type() == Some(kind)
            });
        match target {
            Some(outgoing) => {
                outgoing.window.record_ack(total);
                tracing::debug!(conn = %self.conn.id(), number = header.number, total, "ack received");
            }
            None => {
                tracing::debug!(conn = %self.conn.id(), number = header.number, "ack for unknown message, ignoring");
            }
        }
        Ok(())
    }

    fn into_message(&self, number: u32, assembly: MessageAssembly) -> Message {
        let (message_flags, properties, body) = assembly.into_parts();
        Message::incoming(self.conn.make_ref(), number, message_flags, properties, body)
    }

    async fn shutdown(&mut self, shutdown: Shutdown) {
        self.conn.set_state(ConnectionState::Closing);
        let cause = match &shutdown {
            Shutdown::Local => "connection closed locally".to_owned(),
            Shutdown::Remote(Some(reason)) => format!("transport closed: {reason}"),
            Shutdown::Remote(None) => "transport closed".to_owned(),
            Shutdown::Fault(error) => format!("connection failed: {error}"),
        };

        // only a local close leaves the transport healthy enough to flush
        if matches!(shutdown, Shutdown::Local) {
            self.drain_urgent().await;
        }

        let _ = self.transport_tx.send(TransportCommand::Close).await;

        for (number, entry) in std::mem::take(&mut self.pending_replies) {
            if let Some(listener) = entry.listener {
                listener.on_completed(Message::closed_error(self.conn.make_ref(), number, &cause));
            }
            // dropping entry.complete resolves PendingReply with ConnectionClosed
        }

        // partial incoming messages vanish without callbacks
        self.in_requests.clear();
        self.completed_requests.clear();
        self.out_queue.clear();

        self.conn.set_state(ConnectionState::Closed);
        tracing::debug!(conn = %self.conn.id(), %cause, "connection closed");
    }

    // Finish urgent messages that already put frames on the wire.
    async fn drain_urgent(&mut self) {
        for outgoing in self.out_queue.iter_mut() {
            if !(outgoing.urgent && outgoing.encoder.has_started()) {
                continue;
            }
            loop {
                match outgoing.encoder.next_frame(MAX_FRAME_SIZE) {
                    Ok(Some(frame)) => {
                        if self
                            .transport_tx
                            .send(TransportCommand::Send(frame.bytes))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
}
