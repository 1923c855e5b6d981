//! Command and poll transport to the board's I2C proxy
//!
//! The proxy listens on two ports. The command socket carries one request
//! line and one response line at a time; the poll socket carries unsolicited
//! `{id}: values` pushes for every registered poll.
//!
//! # Threading
//!
//! ```text
//!  caller threads ──► command lock ──► command socket ──► proxy
//!                                                           │
//!  poll callbacks ◄── i2c-poll-dispatch ◄── poll socket ◄───┘
//! ```
//!
//! - Commands are serialized by the command lock so a request and its
//!   response are never interleaved with another command.
//! - One dispatch thread per channel, started in [`I2cChannel::new`] and
//!   stopped in [`I2cChannel::dispose`]. It idles on a condvar while the
//!   channel is not connected.
//! - Lock order is command link, then connection state. The dispatch thread
//!   only ever takes the connection state lock.
//! - Each connect bumps a generation counter. When the poll stream ends the
//!   dispatch thread disconnects only its own generation, so a late EOF from
//!   an old socket never tears down a newer connection.

use super::dispatch;
use super::line_framer::LineFramer;
use super::poll::{PollEvent, PollId, PollRegistration, PollRegistry, PollRequest, UserData};
use super::protocol::{self, Request};
use crate::error::{Error, Result};
use crate::notify::{Notifier, PropertyChanged};
use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Source name used for channel notifications
pub const CHANNEL_SOURCE: &str = "i2c-channel";

/// Default command/poll socket buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 4000;

/// Where and how to reach the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    pub host: String,
    pub command_port: u16,
    pub poll_port: u16,
    pub connect_timeout: Duration,
    /// Send/receive timeout on the command socket, send timeout on the poll socket
    pub io_timeout: Duration,
    pub command_buffer_size: usize,
    pub poll_buffer_size: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            command_port: 0,
            poll_port: 0,
            connect_timeout: Duration::from_secs(3),
            io_timeout: Duration::from_secs(5),
            command_buffer_size: DEFAULT_BUFFER_SIZE,
            poll_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ChannelSettings {
    /// Settings for `host:command_port`, polls on `command_port + 1`
    pub fn new(host: impl Into<String>, command_port: u16) -> Self {
        Self {
            host: host.into(),
            command_port,
            poll_port: command_port.wrapping_add(1),
            ..Self::default()
        }
    }

    /// Host and both ports are set
    pub fn is_complete(&self) -> bool {
        self.validate().is_ok()
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("proxy host not set".into()));
        }
        if self.command_port == 0 || self.poll_port == 0 {
            return Err(Error::Config(format!(
                "proxy ports not set (command {}, poll {})",
                self.command_port, self.poll_port
            )));
        }
        Ok(())
    }
}

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Command socket plus the framer reading its responses
struct CommandLink {
    writer: TcpStream,
    reader: LineFramer<TcpStream>,
}

impl CommandLink {
    fn send_line(&mut self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        let mut sent = 0;
        while sent < bytes.len() {
            match self.writer.write(&bytes[sent..]) {
                Ok(0) => return Err(Error::Protocol("connection closed while sending".into())),
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn exchange(&mut self, line: &str) -> Result<String> {
        self.send_line(line)?;
        match self.reader.read_line()? {
            Some(response) => Ok(protocol::trim_line_ending(&response).to_string()),
            None => Err(Error::Protocol("connection closed by proxy".into())),
        }
    }

    fn close(self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

/// State guarded by the connection lock
struct Connection {
    state: ChannelState,
    generation: u64,
    /// Poll framer waiting to be picked up by the dispatch thread
    poll_reader: Option<LineFramer<TcpStream>>,
    /// Handle used to unblock and close the poll socket
    poll_stream: Option<TcpStream>,
}

/// State shared between the channel handle and its dispatch thread
pub(crate) struct ChannelShared {
    settings: Mutex<ChannelSettings>,
    command: Mutex<Option<CommandLink>>,
    connection: Mutex<Connection>,
    wake: Condvar,
    pub(crate) registry: PollRegistry,
    notifier: Notifier,
    pub(crate) shutdown: AtomicBool,
}

impl ChannelShared {
    pub(crate) fn state(&self) -> ChannelState {
        self.connection.lock().state
    }

    fn publish(&self, state: ChannelState) {
        self.notifier.publish(CHANNEL_SOURCE, "State", state);
    }

    /// Block until a poll reader for a live connection is available.
    ///
    /// Returns `None` when the channel is shutting down.
    pub(crate) fn wait_for_poll_reader(
        &self,
        idle: Duration,
    ) -> Option<(u64, LineFramer<TcpStream>)> {
        let mut conn = self.connection.lock();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            if conn.state == ChannelState::Connected
                && let Some(reader) = conn.poll_reader.take()
            {
                return Some((conn.generation, reader));
            }
            self.wake.wait_for(&mut conn, idle);
        }
    }

    /// Disconnect only if `generation` is still the live connection
    pub(crate) fn disconnect_generation(&self, generation: u64) {
        let mut command = self.command.lock();
        if self.connection.lock().generation != generation {
            log::debug!(
                "Ignoring stale disconnect for connection generation {}",
                generation
            );
            return;
        }
        if let Err(e) = self.disconnect_locked(&mut command) {
            log::warn!("Disconnect after poll stream loss failed: {}", e);
        }
    }

    fn connect(&self) -> Result<bool> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("channel disposed".into()));
        }
        let settings = self.settings.lock().clone();
        settings.validate()?;

        let mut command = self.command.lock();
        {
            let mut conn = self.connection.lock();
            if conn.state != ChannelState::Disconnected {
                return Err(Error::InvalidState(format!(
                    "connect while {}",
                    conn.state
                )));
            }
            conn.state = ChannelState::Connecting;
        }
        self.publish(ChannelState::Connecting);

        let (link, poll_stream) = match open_links(&settings) {
            Ok(links) => links,
            Err(e) => {
                log::warn!(
                    "Couldn't connect to {}:{}/{}: {}",
                    settings.host,
                    settings.command_port,
                    settings.poll_port,
                    e
                );
                self.connection.lock().state = ChannelState::Disconnected;
                self.publish(ChannelState::Disconnected);
                return Ok(false);
            }
        };

        let poll_handle = match poll_stream.try_clone() {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("Couldn't clone poll socket: {}", e);
                link.close();
                let _ = poll_stream.shutdown(Shutdown::Both);
                self.connection.lock().state = ChannelState::Disconnected;
                self.publish(ChannelState::Disconnected);
                return Ok(false);
            }
        };

        *command = Some(link);
        {
            let mut conn = self.connection.lock();
            conn.generation += 1;
            conn.poll_reader = Some(LineFramer::new(poll_stream, settings.poll_buffer_size));
            conn.poll_stream = Some(poll_handle);
            conn.state = ChannelState::Connected;
            self.wake.notify_all();
        }
        log::info!(
            "Connected to I2C proxy at {} (command {}, poll {})",
            settings.host,
            settings.command_port,
            settings.poll_port
        );
        self.publish(ChannelState::Connected);
        Ok(true)
    }

    fn disconnect_locked(&self, command: &mut Option<CommandLink>) -> Result<()> {
        let poll_stream = {
            let mut conn = self.connection.lock();
            match conn.state {
                ChannelState::Disconnected | ChannelState::Disconnecting => return Ok(()),
                ChannelState::Connecting => {
                    return Err(Error::InvalidState("disconnect while connecting".into()));
                }
                ChannelState::Connected => {}
            }
            conn.state = ChannelState::Disconnecting;
            conn.poll_reader = None;
            conn.poll_stream.take()
        };
        self.publish(ChannelState::Disconnecting);

        if let Some(link) = command.take() {
            link.close();
        }
        if let Some(stream) = poll_stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.registry.clear();

        self.connection.lock().state = ChannelState::Disconnected;
        log::info!("Disconnected from I2C proxy");
        self.publish(ChannelState::Disconnected);
        Ok(())
    }

    fn transact_locked(&self, command: &mut Option<CommandLink>, request: Request) -> Result<String> {
        if self.state() != ChannelState::Connected {
            return Err(Error::NotConnected);
        }
        let Some(link) = command.as_mut() else {
            return Err(Error::NotConnected);
        };

        let line = request.to_string();
        log::trace!("> {}", line);
        match link.exchange(&line) {
            Ok(response) => {
                log::trace!("< {}", response);
                Ok(response)
            }
            Err(e) => {
                log::warn!("'{}' failed, dropping connection: {}", line, e);
                let _ = self.disconnect_locked(command);
                Err(Error::Protocol(format!("'{line}' failed: {e}")))
            }
        }
    }

    fn transact(&self, request: Request) -> Result<String> {
        let mut command = self.command.lock();
        self.transact_locked(&mut command, request)
    }
}

fn open_stream(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(ErrorKind::NotFound, format!("no address for {host}"))
    }))
}

fn non_zero(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

fn open_links(settings: &ChannelSettings) -> Result<(CommandLink, TcpStream)> {
    log::debug!(
        "Opening command socket to {}:{}",
        settings.host,
        settings.command_port
    );
    let command = open_stream(&settings.host, settings.command_port, settings.connect_timeout)?;
    command.set_nodelay(true)?;
    command.set_read_timeout(non_zero(settings.io_timeout))?;
    command.set_write_timeout(non_zero(settings.io_timeout))?;

    log::debug!(
        "Opening poll socket to {}:{}",
        settings.host,
        settings.poll_port
    );
    let poll = match open_stream(&settings.host, settings.poll_port, settings.connect_timeout) {
        Ok(poll) => poll,
        Err(e) => {
            let _ = command.shutdown(Shutdown::Both);
            return Err(e.into());
        }
    };
    // Polls may be slow to arrive, so only sends time out
    poll.set_write_timeout(non_zero(settings.io_timeout))?;

    let reader = LineFramer::new(command.try_clone()?, settings.command_buffer_size);
    Ok((
        CommandLink {
            writer: command,
            reader,
        },
        poll,
    ))
}

/// Client side of the I2C proxy protocol.
///
/// Owns the command and poll sockets, the poll registry and the dispatch
/// thread. Share it between components with `Arc`.
pub struct I2cChannel {
    shared: Arc<ChannelShared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl I2cChannel {
    /// Create a disconnected channel and start its dispatch thread
    pub fn new(settings: ChannelSettings) -> Result<Self> {
        Self::with_notifier(settings, Notifier::new())
    }

    /// Like [`new`](Self::new), publishing state changes through `notifier`
    pub fn with_notifier(settings: ChannelSettings, notifier: Notifier) -> Result<Self> {
        let shared = Arc::new(ChannelShared {
            settings: Mutex::new(settings),
            command: Mutex::new(None),
            connection: Mutex::new(Connection {
                state: ChannelState::Disconnected,
                generation: 0,
                poll_reader: None,
                poll_stream: None,
            }),
            wake: Condvar::new(),
            registry: PollRegistry::new(),
            notifier,
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let dispatcher = thread::Builder::new()
            .name("i2c-poll-dispatch".to_string())
            .spawn(move || dispatch::run(thread_shared))?;

        Ok(Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn settings(&self) -> ChannelSettings {
        self.shared.settings.lock().clone()
    }

    /// Change the proxy endpoint used by the next `connect`
    pub fn set_endpoint(&self, host: impl Into<String>, command_port: u16, poll_port: u16) {
        let mut settings = self.shared.settings.lock();
        settings.host = host.into();
        settings.command_port = command_port;
        settings.poll_port = poll_port;
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn notifier(&self) -> Notifier {
        self.shared.notifier.clone()
    }

    /// Receive channel state changes
    pub fn subscribe(&self) -> Receiver<PropertyChanged> {
        self.shared.notifier.subscribe()
    }

    /// Open both sockets.
    ///
    /// Returns `Ok(false)` if either socket cannot be opened. Missing host or
    /// ports are [`Error::Config`]; connecting while not disconnected is
    /// [`Error::InvalidState`].
    pub fn connect(&self) -> Result<bool> {
        self.shared.connect()
    }

    /// Close both sockets and forget every poll registration
    pub fn disconnect(&self) -> Result<()> {
        let mut command = self.shared.command.lock();
        self.shared.disconnect_locked(&mut command)
    }

    /// `true` iff the proxy answered `OK` to `ping`
    pub fn ping(&self) -> bool {
        match self.shared.transact(Request::Ping) {
            Ok(response) => protocol::parse_ok(&response).is_ok(),
            Err(e) => {
                log::debug!("Ping failed: {}", e);
                false
            }
        }
    }

    /// Write one register
    pub fn set(&self, address: u8, register: u8, value: u8) -> Result<()> {
        let response = self.shared.transact(Request::Set {
            address,
            register,
            value,
        })?;
        protocol::parse_ok(&response)
    }

    /// Read one register
    pub fn get(&self, address: u8, register: u8) -> Result<u8> {
        let response = self.shared.transact(Request::Get { address, register })?;
        protocol::parse_byte(&response)
    }

    /// Read `count` consecutive registers
    pub fn get_many(&self, address: u8, register: u8, count: usize) -> Result<Vec<u8>> {
        protocol::validate_count(count)?;
        let response = self.shared.transact(Request::GetMany {
            address,
            register,
            count,
        })?;
        protocol::parse_bytes(&response, count)
    }

    /// Ask the proxy to poll registers and route the pushes to `callback`
    pub fn add_poll<F>(
        &self,
        request: PollRequest,
        user_data: Option<UserData>,
        callback: F,
    ) -> Result<PollId>
    where
        F: Fn(&PollEvent) + Send + Sync + 'static,
    {
        protocol::validate_count(request.count)?;
        let mut command = self.shared.command.lock();
        let response = self.shared.transact_locked(
            &mut command,
            Request::AddPoll {
                delay_ms: request.delay_ms,
                address: request.address,
                register: request.register,
                count: request.count,
            },
        )?;
        let id = protocol::parse_poll_id(&response)?;

        self.shared.registry.insert(PollRegistration {
            id,
            request,
            user_data,
            callback: Arc::new(callback),
        });
        log::debug!(
            "Poll {} added: every {} ms, address {:#04x}, register {:#04x} x{}",
            id,
            request.delay_ms,
            request.address,
            request.register,
            request.count
        );
        Ok(id)
    }

    /// Stop a poll on the proxy, then forget it locally
    pub fn remove_poll(&self, id: PollId) -> Result<()> {
        let mut command = self.shared.command.lock();
        let response = self
            .shared
            .transact_locked(&mut command, Request::RemovePoll { id })?;
        protocol::parse_ok(&response)?;
        self.shared.registry.remove(id);
        log::debug!("Poll {} removed", id);
        Ok(())
    }

    pub fn poll_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_polling(&self, id: PollId) -> bool {
        self.shared.registry.contains(id)
    }

    /// Stop the dispatch thread and close the connection. Idempotent.
    pub fn dispose(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let conn = self.shared.connection.lock();
            if let Some(stream) = conn.poll_stream.as_ref() {
                let _ = stream.shutdown(Shutdown::Read);
            }
            self.shared.wake.notify_all();
        }

        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.thread().id() == thread::current().id() {
                log::debug!("Dispose called from a poll callback, not joining dispatcher");
            } else if handle.join().is_err() {
                log::error!("Poll dispatch thread panicked");
            }
        }

        if let Err(e) = self.disconnect() {
            log::warn!("Disconnect during dispose failed: {}", e);
        }
        log::debug!("I2C channel disposed");
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.shared.connection.lock().generation
    }
}

impl Drop for I2cChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}
