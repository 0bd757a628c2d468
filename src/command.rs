//! Connection state machines.
//!
//! Every multi step exchange with the peer (handshake, mtu discovery, disconnect) is a
//! [`NetCommand`] driven by a [`CommandQueue`]: the front command is updated on every
//! transmission step and sees every internal packet received, until it reports success
//! or failure. Its outcome reaches the initiating code through a [`CommandHandle`].

mod connect;
mod disconnect;
mod mtu;

pub(crate) use connect::{handshake_packet, read_handshake};
pub use connect::ConnectCommand;
pub use disconnect::DisconnectCommand;
pub(crate) use mtu::answer_probe;
pub use mtu::MtuCommand;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::client::Client;
use crate::config::NetConfig;
use crate::crypto::{CryptoError, CryptoFactory};
use crate::protocol::ProtocolPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Running,
    Success,
    Failure,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command timed out")]
    Timeout,
    #[error("handshake rejected: the peer speaks another protocol or version")]
    HandshakeMismatch,
    #[error("crypto handshake failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("malformed answer from the peer")]
    Malformed,
    #[error("command was dropped before completing")]
    Cancelled,
}

pub type CommandResult<T> = Result<T, CommandError>;

/// Produce-once result of a command.
///
/// Can be polled as a [`Future`], checked with [`CommandHandle::try_result`] from a game
/// loop, or waited on with [`CommandHandle::wait`] when the endpoint is driven by other
/// threads (see [`spawn`](crate::spawn)).
pub struct CommandHandle<T> {
    receiver: oneshot::Receiver<CommandResult<T>>,
}

impl<T> CommandHandle<T> {
    /// Returns the result once the command completed. `None` while it is still running.
    pub fn try_result(&mut self) -> Option<CommandResult<T>> {
        match self.receiver.try_recv() {
            Ok(result) => result,
            Err(oneshot::Canceled) => Some(Err(CommandError::Cancelled)),
        }
    }
    /// Blocks until the command completed. Never call this from the thread that drives
    /// the endpoint.
    pub fn wait(self) -> CommandResult<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for CommandHandle<T> {
    type Output = CommandResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CommandError::Cancelled)))
    }
}

/// The sending half of a [`CommandHandle`]. Dropping it unresolved cancels the handle.
pub struct Completer<T> {
    sender: Option<oneshot::Sender<CommandResult<T>>>,
}

impl<T> Completer<T> {
    pub fn complete(&mut self, result: CommandResult<T>) {
        if let Some(sender) = self.sender.take() {
            // the caller may have dropped its handle
            let _ = sender.send(result);
        }
    }
    pub fn is_completed(&self) -> bool {
        self.sender.is_none()
    }
}

pub fn promise<T>() -> (Completer<T>, CommandHandle<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        Completer {
            sender: Some(sender),
        },
        CommandHandle { receiver },
    )
}

/// A per-command timeout, advanced by update deltas.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    elapsed: f64,
    limit: f64,
}

impl Deadline {
    pub fn new(limit: f64) -> Self {
        Self {
            elapsed: 0.0,
            limit,
        }
    }
    pub fn reset(&mut self) {
        self.elapsed = 0.0;
    }
    pub fn reset_with(&mut self, limit: f64) {
        self.elapsed = 0.0;
        self.limit = limit;
    }
    /// Advances the deadline, returns true once it is exceeded.
    pub fn tick(&mut self, delta: f64) -> bool {
        self.elapsed += delta;
        self.elapsed > self.limit
    }
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }
}

/// What a command may touch while it runs.
pub struct CommandContext<'a> {
    pub client: &'a mut Client,
    pub cfg: &'a NetConfig,
    pub crypto: Option<&'a CryptoFactory>,
    pub time: f64,
}

pub trait NetCommand: Send {
    fn name(&self) -> &'static str;
    fn deadline(&mut self) -> &mut Deadline;
    /// Advances the command. Called on every tick while its deadline holds.
    fn update(&mut self, ctx: &mut CommandContext<'_>) -> CommandStatus;
    /// Offers an internal packet to the command. Returns whether it was consumed.
    fn on_receive(&mut self, ctx: &mut CommandContext<'_>, packet: &ProtocolPacket) -> bool;
    /// Resolves the command's handle with an error.
    fn fail(&mut self, error: CommandError);
    /// Called instead of [`NetCommand::update`] once the deadline is exceeded. Commands
    /// that retry override it and keep running.
    fn timeout(&mut self, _ctx: &mut CommandContext<'_>) -> CommandStatus {
        self.fail(CommandError::Timeout);
        CommandStatus::Failure
    }
}

/// Runs one tick of `command`.
pub fn drive(
    command: &mut dyn NetCommand,
    ctx: &mut CommandContext<'_>,
    delta: f64,
) -> CommandStatus {
    if command.deadline().tick(delta) {
        log::debug!("command {} timed out", command.name());
        command.timeout(ctx)
    } else {
        command.update(ctx)
    }
}

/// Commands run one at a time, in submission order.
#[derive(Default)]
pub struct CommandQueue {
    commands: VecDeque<Box<dyn NetCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&mut self, command: Box<dyn NetCommand>) {
        self.commands.push_back(command);
    }
    pub fn len(&self) -> usize {
        self.commands.len()
    }
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
    /// Drops every command, cancelling their handles.
    pub fn clear(&mut self) {
        self.commands.clear();
    }
    pub fn front_name(&self) -> Option<&'static str> {
        self.commands.front().map(|command| command.name())
    }

    pub fn update(&mut self, ctx: &mut CommandContext<'_>, delta: f64) {
        let Some(command) = self.commands.front_mut() else {
            return;
        };
        let status = drive(command.as_mut(), ctx, delta);
        if status != CommandStatus::Running {
            log::debug!("command {} finished with {:?}", command.name(), status);
            self.commands.pop_front();
        }
    }

    pub fn on_receive(&mut self, ctx: &mut CommandContext<'_>, packet: &ProtocolPacket) -> bool {
        match self.commands.front_mut() {
            Some(command) => command.on_receive(ctx, packet),
            None => false,
        }
    }
}
