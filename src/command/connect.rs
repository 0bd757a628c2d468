use super::{
    drive, promise, CommandContext, CommandError, CommandHandle, CommandStatus, Completer,
    Deadline, MtuCommand, NetCommand,
};
use crate::client::ClientStatus;
use crate::consts::HANDSHAKE_MAGIC;
use crate::crypto::Role;
use crate::packet::Packet;
use crate::protocol::{InternalId, ProtocolPacket};

/// Handshake packet announcing `version`.
pub(crate) fn handshake_packet(version: &str) -> ProtocolPacket {
    let mut packet = Packet::new();
    packet.append(HANDSHAKE_MAGIC).write(&version.to_string());
    ProtocolPacket::internal(InternalId::Handshake, packet)
}

/// Version announced by a handshake packet, `None` if it isn't one of ours.
pub(crate) fn read_handshake(packet: &ProtocolPacket) -> Option<String> {
    let mut payload = packet.packet().clone();
    let magic = payload.read_bytes(HANDSHAKE_MAGIC.len())?;
    if magic != HANDSHAKE_MAGIC {
        return None;
    }
    payload.read::<String>()
}

enum Stage {
    TransmitHandshake,
    WaitingHandshake,
    DealingWithMtu(MtuCommand),
    WaitingServerFinalMtu,
    CryptHandshake,
    CryptWaiting,
    Connected,
    Failed,
}

/// Client side connection establishment.
///
/// Handshake, mtu discovery, mtu announcement, optional crypto handshake. Every stage has
/// the handshake timeout to complete; the client is marked [`ClientStatus::TimedOut`] if
/// one of them runs out.
pub struct ConnectCommand {
    stage: Stage,
    deadline: Deadline,
    completer: Completer<()>,
}

impl ConnectCommand {
    pub fn new(handshake_timeout: f64) -> (Self, CommandHandle<()>) {
        let (completer, handle) = promise();
        let command = Self {
            stage: Stage::TransmitHandshake,
            deadline: Deadline::new(handshake_timeout),
            completer,
        };
        (command, handle)
    }

    fn enter(&mut self, stage: Stage, ctx: &CommandContext<'_>) {
        self.stage = stage;
        self.deadline.reset_with(ctx.cfg.handshake_timeout);
    }
}

impl NetCommand for ConnectCommand {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn deadline(&mut self) -> &mut Deadline {
        &mut self.deadline
    }

    fn update(&mut self, ctx: &mut CommandContext<'_>) -> CommandStatus {
        match &mut self.stage {
            Stage::TransmitHandshake => {
                ctx.client.set_status(ClientStatus::Handshaking);
                ctx.client.push_packet(handshake_packet(&ctx.cfg.version));
                self.enter(Stage::WaitingHandshake, ctx);
                CommandStatus::Running
            }
            Stage::DealingWithMtu(mtu) => {
                // the own deadline is reset on every tick, so its elapsed time is this
                // tick's delta
                let delta = self.deadline.elapsed();
                self.deadline.reset();
                match drive(mtu, ctx, delta) {
                    CommandStatus::Running => CommandStatus::Running,
                    CommandStatus::Success => {
                        let Some(size) = mtu.discovered() else {
                            self.fail(CommandError::Malformed);
                            return CommandStatus::Failure;
                        };
                        ctx.client.set_mtu(size);
                        let mut packet = Packet::new();
                        packet.write(&size);
                        ctx.client
                            .push_packet(ProtocolPacket::internal(InternalId::MtuFinal, packet));
                        self.enter(Stage::WaitingServerFinalMtu, ctx);
                        CommandStatus::Running
                    }
                    CommandStatus::Failure => self.timeout(ctx),
                }
            }
            Stage::CryptHandshake => match ctx.client.advance_crypto(None) {
                Ok(_) => {
                    self.enter(Stage::CryptWaiting, ctx);
                    CommandStatus::Running
                }
                Err(e) => {
                    log::warn!("crypto handshake with {} failed: {e}", ctx.client.identity());
                    ctx.client.set_status(ClientStatus::Disconnected);
                    self.fail(CommandError::Crypto(e));
                    CommandStatus::Failure
                }
            },
            Stage::CryptWaiting => {
                // the last record must be out before the connection counts as established
                if ctx.client.is_crypto_finished() && ctx.client.queue_len() == 0 {
                    self.enter(Stage::Connected, ctx);
                    return self.update(ctx);
                }
                CommandStatus::Running
            }
            Stage::Connected => {
                ctx.client.reset_counters();
                ctx.client.set_status(ClientStatus::Connected);
                log::info!(
                    "connected to {} with mtu {}",
                    ctx.client.identity(),
                    ctx.client.mtu()
                );
                self.completer.complete(Ok(()));
                CommandStatus::Success
            }
            Stage::Failed => CommandStatus::Failure,
            Stage::WaitingHandshake | Stage::WaitingServerFinalMtu => CommandStatus::Running,
        }
    }

    fn on_receive(&mut self, ctx: &mut CommandContext<'_>, packet: &ProtocolPacket) -> bool {
        if let Stage::DealingWithMtu(mtu) = &mut self.stage {
            return mtu.on_receive(ctx, packet);
        }
        let id = packet.internal_id();
        match self.stage {
            Stage::WaitingHandshake if id == Some(InternalId::Handshake) => {
                match read_handshake(packet) {
                    Some(version) if version == ctx.cfg.version => {
                        log::debug!("handshake accepted by {}", ctx.client.identity());
                        let mtu = MtuCommand::nested(ctx.cfg.handshake_timeout);
                        self.enter(Stage::DealingWithMtu(mtu), ctx);
                    }
                    other => {
                        log::warn!(
                            "handshake rejected by {}: expected {:?}, got {:?}",
                            ctx.client.identity(),
                            ctx.cfg.version,
                            other
                        );
                        ctx.client.set_status(ClientStatus::Disconnected);
                        self.fail(CommandError::HandshakeMismatch);
                        self.stage = Stage::Failed;
                    }
                }
                true
            }
            Stage::WaitingServerFinalMtu if id == Some(InternalId::MtuFinalResponse) => {
                match ctx.crypto {
                    Some(factory) => {
                        ctx.client.set_crypto(factory(Role::Initiator));
                        ctx.client.set_status(ClientStatus::Authenticating);
                        self.enter(Stage::CryptHandshake, ctx);
                    }
                    None => self.enter(Stage::Connected, ctx),
                }
                true
            }
            Stage::CryptWaiting if id == Some(InternalId::CryptHandshake) => {
                if let Err(e) = ctx.client.advance_crypto(Some(packet.packet().data())) {
                    log::warn!("crypto handshake with {} failed: {e}", ctx.client.identity());
                    ctx.client.set_status(ClientStatus::Disconnected);
                    self.fail(CommandError::Crypto(e));
                    self.stage = Stage::Failed;
                }
                true
            }
            _ => false,
        }
    }

    fn fail(&mut self, error: CommandError) {
        self.completer.complete(Err(error));
    }

    fn timeout(&mut self, ctx: &mut CommandContext<'_>) -> CommandStatus {
        ctx.client.set_status(ClientStatus::TimedOut);
        self.fail(CommandError::Timeout);
        CommandStatus::Failure
    }
}
