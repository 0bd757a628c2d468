use super::{
    promise, CommandContext, CommandError, CommandHandle, CommandStatus, Completer, Deadline,
    NetCommand,
};
use crate::client::ClientStatus;
use crate::packet::Packet;
use crate::protocol::{InternalId, ProtocolPacket};

/// Sends a disconnect notice and waits for it to leave.
///
/// The notice isn't acknowledged: the command succeeds once the client sent it, or when
/// the deadline runs out, in which case the client is simply marked disconnected.
pub struct DisconnectCommand {
    sent: bool,
    deadline: Deadline,
    completer: Completer<()>,
}

impl DisconnectCommand {
    pub fn new(handshake_timeout: f64) -> (Self, CommandHandle<()>) {
        let (completer, handle) = promise();
        let command = Self {
            sent: false,
            deadline: Deadline::new(handshake_timeout),
            completer,
        };
        (command, handle)
    }
}

impl NetCommand for DisconnectCommand {
    fn name(&self) -> &'static str {
        "disconnect"
    }

    fn deadline(&mut self) -> &mut Deadline {
        &mut self.deadline
    }

    fn update(&mut self, ctx: &mut CommandContext<'_>) -> CommandStatus {
        let status = ctx.client.status();
        if status <= ClientStatus::Disconnected {
            self.completer.complete(Ok(()));
            return CommandStatus::Success;
        }
        if !self.sent {
            ctx.client.clear_queue();
            ctx.client
                .push_packet(ProtocolPacket::internal(InternalId::Disconnect, Packet::new()));
            ctx.client.set_status(ClientStatus::Disconnecting);
            self.sent = true;
        }
        CommandStatus::Running
    }

    fn on_receive(&mut self, _ctx: &mut CommandContext<'_>, _packet: &ProtocolPacket) -> bool {
        false
    }

    fn fail(&mut self, error: CommandError) {
        self.completer.complete(Err(error));
    }

    fn timeout(&mut self, ctx: &mut CommandContext<'_>) -> CommandStatus {
        ctx.client.set_status(ClientStatus::Disconnected);
        self.completer.complete(Ok(()));
        CommandStatus::Success
    }
}
