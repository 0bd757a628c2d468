use super::{
    promise, CommandContext, CommandError, CommandHandle, CommandStatus, Completer, Deadline,
    NetCommand,
};
use crate::client::Client;
use crate::consts::{HEADER_SIZE, MIN_MTU};
use crate::packet::Packet;
use crate::protocol::{HeaderFlags, InternalId, ProtocolPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Asking,
    WaitingResponse,
    Discover,
    Waiting,
    Done,
}

/// Binary search for the largest datagram that reaches the peer.
///
/// The peer is first asked for its own maximum, then probes are sent between [`MIN_MTU`]
/// and the smaller of both maximums. A probe that is
/// answered raises the lower bound, a probe that times out lowers the upper bound.
pub struct MtuCommand {
    stage: Stage,
    deadline: Deadline,
    low: u16,
    high: u16,
    candidate: u16,
    tries: u32,
    announce: bool,
    result: Option<u16>,
    completer: Option<Completer<u16>>,
}

impl MtuCommand {
    /// Standalone discovery: applies the result to the client and tells the peer.
    pub fn new(handshake_timeout: f64) -> (Self, CommandHandle<u16>) {
        let (completer, handle) = promise();
        let mut command = Self::nested(handshake_timeout);
        command.announce = true;
        command.completer = Some(completer);
        (command, handle)
    }

    /// Discovery driven by another command, which reads [`MtuCommand::discovered`].
    pub fn nested(handshake_timeout: f64) -> Self {
        Self {
            stage: Stage::Asking,
            deadline: Deadline::new(handshake_timeout),
            low: MIN_MTU,
            high: MIN_MTU,
            candidate: MIN_MTU,
            tries: 0,
            announce: false,
            result: None,
            completer: None,
        }
    }

    pub fn discovered(&self) -> Option<u16> {
        self.result
    }

    fn probe(candidate: u16) -> ProtocolPacket {
        let mut packet = Packet::with_capacity(candidate as usize - HEADER_SIZE);
        packet.write(&candidate);
        packet.append(&vec![0u8; candidate as usize - HEADER_SIZE - 2]);
        ProtocolPacket::internal(InternalId::MtuTest, packet)
            .with_flags(HeaderFlags::DO_NOT_FRAGMENT)
    }

    fn next(&mut self, ctx: &CommandContext<'_>) {
        if self.low >= self.high || self.tries >= ctx.cfg.mtu_max_tries {
            log::debug!(
                "mtu discovery with {} settled on {} after {} probes",
                ctx.client.identity(),
                self.low,
                self.tries
            );
            self.result = Some(self.low);
            self.stage = Stage::Done;
        } else {
            self.candidate = ((self.low as u32 + self.high as u32 + 1) / 2) as u16;
            self.stage = Stage::Discover;
        }
    }
}

/// Answers the peer side of an mtu discovery. Returns false if `packet` isn't part of one.
pub(crate) fn answer_probe(client: &mut Client, packet: &ProtocolPacket, max_mtu: u16) -> bool {
    let mut reply = Packet::new();
    let id = match packet.internal_id() {
        Some(InternalId::AskMtu) => {
            reply.write(&max_mtu);
            InternalId::AskMtuResponse
        }
        Some(InternalId::MtuTest) => {
            reply.write(&((HEADER_SIZE + packet.packet().len()) as u16));
            InternalId::MtuTestResponse
        }
        Some(InternalId::MtuFinal) => {
            let mut payload = packet.packet().clone();
            match payload.read_checked::<u16>(|mtu| *mtu >= MIN_MTU) {
                Some(mtu) => client.set_mtu(mtu.min(max_mtu)),
                None => {
                    log::trace!("client {} announced an invalid mtu", client.identity());
                    return true;
                }
            }
            InternalId::MtuFinalResponse
        }
        _ => return false,
    };
    client.push_packet(ProtocolPacket::internal(id, reply));
    true
}

impl NetCommand for MtuCommand {
    fn name(&self) -> &'static str {
        "mtu"
    }

    fn deadline(&mut self) -> &mut Deadline {
        &mut self.deadline
    }

    fn update(&mut self, ctx: &mut CommandContext<'_>) -> CommandStatus {
        match self.stage {
            Stage::Asking => {
                ctx.client
                    .push_packet(ProtocolPacket::internal(InternalId::AskMtu, Packet::new()));
                self.stage = Stage::WaitingResponse;
                self.deadline.reset_with(ctx.cfg.handshake_timeout);
                CommandStatus::Running
            }
            Stage::Discover => {
                self.tries += 1;
                log::trace!("probing mtu {} with {}", self.candidate, ctx.client.identity());
                ctx.client.push_packet(Self::probe(self.candidate));
                self.stage = Stage::Waiting;
                self.deadline.reset_with(ctx.cfg.mtu_try_timeout);
                CommandStatus::Running
            }
            Stage::WaitingResponse | Stage::Waiting => CommandStatus::Running,
            Stage::Done => {
                let mtu = self.result.unwrap_or(MIN_MTU);
                if self.announce {
                    ctx.client.set_mtu(mtu);
                    let mut packet = Packet::new();
                    packet.write(&mtu);
                    ctx.client
                        .push_packet(ProtocolPacket::internal(InternalId::MtuFinal, packet));
                }
                if let Some(completer) = self.completer.as_mut() {
                    completer.complete(Ok(mtu));
                }
                CommandStatus::Success
            }
        }
    }

    fn on_receive(&mut self, ctx: &mut CommandContext<'_>, packet: &ProtocolPacket) -> bool {
        match (self.stage, packet.internal_id()) {
            (Stage::WaitingResponse, Some(InternalId::AskMtuResponse)) => {
                let mut payload = packet.packet().clone();
                let Some(peer_max) = payload.read::<u16>() else {
                    return false;
                };
                self.low = MIN_MTU;
                self.high = ctx.cfg.max_mtu.min(peer_max).max(MIN_MTU);
                self.candidate = self.high;
                log::debug!(
                    "peer {} accepts up to {}, probing between {} and {}",
                    ctx.client.identity(),
                    peer_max,
                    self.low,
                    self.high
                );
                if self.low >= self.high {
                    self.result = Some(self.low);
                    self.stage = Stage::Done;
                } else {
                    self.stage = Stage::Discover;
                }
                true
            }
            (Stage::Waiting, Some(InternalId::MtuTestResponse)) => {
                let mut payload = packet.packet().clone();
                match payload.read::<u16>() {
                    Some(size) if size == self.candidate => {
                        self.low = self.candidate;
                        self.next(ctx);
                    }
                    // late answer to an older probe
                    _ => {}
                }
                true
            }
            _ => false,
        }
    }

    fn fail(&mut self, error: CommandError) {
        if let Some(completer) = self.completer.as_mut() {
            completer.complete(Err(error));
        }
    }

    fn timeout(&mut self, ctx: &mut CommandContext<'_>) -> CommandStatus {
        if self.stage != Stage::Waiting {
            self.fail(CommandError::Timeout);
            return CommandStatus::Failure;
        }
        self.high = self.candidate - 1;
        self.next(ctx);
        self.deadline.reset();
        CommandStatus::Running
    }
}
