//! Front-end endpoint: logs into the leader, relays chat text, and accepts
//! the reconnection of a newly elected leader on its listen port.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::chat::valid_name;
use crate::protocol::{
    recv_packet, send_packet, MessageRecord, Payload, RawPacket, RecordKind,
};
use crate::utils::{tcp_bind_with_retry, tcp_connect_with_retry, ChatError};

use futures::future;

use serde::Deserialize;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct FrontEndConfig {
    /// Interval of keep-alives sent to the serving replica.
    pub keep_alive_interval_ms: u64,

    /// Connection retries when reaching the first server.
    pub connect_retries: u8,
}

#[allow(clippy::derivable_impls)]
impl Default for FrontEndConfig {
    fn default() -> Self {
        FrontEndConfig {
            keep_alive_interval_ms: 1_000,
            connect_retries: 3,
        }
    }
}

/// Something the serving replica told this front-end.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum FrontEndEvent {
    /// Chat message, join/leave notice or server notice.
    Message(MessageRecord),

    /// Login refused, with the reason.
    Refused(String),

    /// A new leader took this front-end over from the given address.
    Reconnected(SocketAddr),
}

/// One logged-in front-end.
pub struct FrontEnd {
    /// Logging prefix.
    me: String,

    user: String,
    group: String,
    listen_addr: SocketAddr,

    /// Write half of the current server connection; swapped on reconnect.
    writer: Arc<Mutex<OwnedWriteHalf>>,

    rx_event: mpsc::UnboundedReceiver<FrontEndEvent>,

    tx_stop: watch::Sender<bool>,
    reader_handle: JoinHandle<()>,
    keep_alive_handle: JoinHandle<()>,
}

impl FrontEnd {
    /// Binds the reconnect listener on `listen_port`, connects to `server`
    /// and logs `user` into `group`.
    pub async fn connect(
        server: SocketAddr,
        listen_port: u16,
        user: &str,
        group: &str,
        config_str: Option<&str>,
    ) -> Result<Self, ChatError> {
        let me = format!("fe:{}", user);
        let config = parsed_config!(config_str => FrontEndConfig;
                                    keep_alive_interval_ms,
                                    connect_retries)?;
        if config.keep_alive_interval_ms == 0 {
            return logged_err!(me; "invalid config.keep_alive_interval_ms '{}'",
                                   config.keep_alive_interval_ms);
        }
        if !valid_name(user) || !valid_name(group) {
            return logged_err!(me; "invalid user or group name '{}' / '{}'",
                                   user, group);
        }

        let bind_addr: SocketAddr = format!("0.0.0.0:{}", listen_port).parse()?;
        let listener = tcp_bind_with_retry(bind_addr, config.connect_retries).await?;
        let listen_addr = listener.local_addr()?;

        let stream = tcp_connect_with_retry(server, config.connect_retries).await?;
        let (reader, mut writer) = stream.into_split();
        send_packet(
            &mut writer,
            &Payload::Command(MessageRecord::login(user, group, listen_addr.port())),
        )
        .await?;
        pf_info!(me; "logging into {} at {}", group, server);

        let writer = Arc::new(Mutex::new(writer));
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let (tx_stop, rx_stop) = watch::channel(false);

        let reader_handle = tokio::spawn(Self::reader_task(
            me.clone(),
            listener,
            reader,
            writer.clone(),
            tx_event,
            rx_stop.clone(),
        ));
        let keep_alive_handle = tokio::spawn(Self::keep_alive_task(
            me.clone(),
            Duration::from_millis(config.keep_alive_interval_ms),
            writer.clone(),
            rx_stop,
        ));

        Ok(FrontEnd {
            me,
            user: user.into(),
            group: group.into(),
            listen_addr,
            writer,
            rx_event,
            tx_stop,
            reader_handle,
            keep_alive_handle,
        })
    }

    /// Receives one packet if a connection is held; pends forever otherwise.
    async fn recv_current(
        reader: &mut Option<OwnedReadHalf>,
    ) -> Result<Option<RawPacket>, ChatError> {
        match reader {
            Some(reader) => recv_packet(reader).await,
            None => future::pending().await,
        }
    }

    /// Reader task loop: turns inbound packets into events and swaps in the
    /// connection of a new leader whenever one arrives on the listener.
    async fn reader_task(
        me: String,
        listener: TcpListener,
        reader: OwnedReadHalf,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        tx_event: mpsc::UnboundedSender<FrontEndEvent>,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "reader task started");
        let mut reader = Some(reader);
        // previous connection stays open until replaced again, so a former
        // leader that is still alive sees no disconnect
        let mut _parked: Option<(Option<OwnedReadHalf>, OwnedWriteHalf)> = None;

        loop {
            let event = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let (new_reader, new_writer) = stream.into_split();
                        let old_writer =
                            std::mem::replace(&mut *writer.lock().await, new_writer);
                        _parked = Some((reader.replace(new_reader), old_writer));
                        pf_info!(me; "taken over by leader at {}", addr);
                        FrontEndEvent::Reconnected(addr)
                    }
                    Err(e) => {
                        pf_warn!(me; "error accepting reconnection: {}", e);
                        continue;
                    }
                },

                received = Self::recv_current(&mut reader) => match received {
                    Ok(Some(packet)) => match packet.payload() {
                        Ok(Payload::Data(record))
                        | Ok(Payload::ServerMessage(record)) => {
                            FrontEndEvent::Message(record)
                        }
                        Ok(Payload::Command(record)) => {
                            FrontEndEvent::Refused(record.text)
                        }
                        Ok(Payload::KeepAlive) => continue,
                        Ok(other) => {
                            pf_debug!(me; "ignoring {:?} from server",
                                          other.packet_type());
                            continue;
                        }
                        Err(e) => {
                            pf_warn!(me; "malformed packet from server: {}", e);
                            continue;
                        }
                    },
                    Ok(None) => {
                        pf_info!(me; "server closed the connection");
                        reader = None;
                        continue;
                    }
                    Err(e) => {
                        pf_warn!(me; "error receiving from server: {}", e);
                        reader = None;
                        continue;
                    }
                },

                _ = rx_stop.changed() => break,
            };

            if tx_event.send(event).is_err() {
                break;
            }
        }

        pf_debug!(me; "reader task exited");
    }

    /// Keep-alive task loop: one KEEP_ALIVE per interval on whatever
    /// connection is current.
    async fn keep_alive_task(
        me: String,
        period: Duration,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut writer = writer.lock().await;
                    if let Err(e) = send_packet(&mut *writer, &Payload::KeepAlive).await {
                        pf_trace!(me; "keep-alive failed: {}", e);
                    }
                },

                _ = rx_stop.changed() => break,
            }
        }
    }

    /// Sends one line of chat text to the group.
    pub async fn send_message(&self, text: &str) -> Result<(), ChatError> {
        let record = MessageRecord::new(self.user.clone(), RecordKind::User, text);
        let mut writer = self.writer.lock().await;
        send_packet(&mut *writer, &Payload::Data(record)).await
    }

    /// Waits for the next event from the server side.
    pub async fn recv_event(&mut self) -> Result<FrontEndEvent, ChatError> {
        match self.rx_event.recv().await {
            Some(event) => Ok(event),
            None => logged_err!(self.me; "event channel closed"),
        }
    }

    /// Leaves the chat: stops both tasks and drops the connection, which the
    /// serving replica takes as a disconnect.
    pub async fn leave(self) -> Result<(), ChatError> {
        self.tx_stop.send_replace(true);
        self.reader_handle.await?;
        self.keep_alive_handle.await?;
        pf_info!(self.me; "left {}", self.group);
        Ok(())
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Address of the reconnect listener.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}
