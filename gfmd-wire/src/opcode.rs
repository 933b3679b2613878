//! Opcodes carried in a request frame's payload (design §6).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    SwitchGfmdChannel = 1,
    JournalReadyToRecv = 2,
    JournalSend = 3,
    RemotePeerAlloc = 4,
    RemotePeerFree = 5,
    RemoteRpc = 6,
}

impl Opcode {
    #[must_use]
    pub const fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::SwitchGfmdChannel),
            2 => Some(Self::JournalReadyToRecv),
            3 => Some(Self::JournalSend),
            4 => Some(Self::RemotePeerAlloc),
            5 => Some(Self::RemotePeerFree),
            6 => Some(Self::RemoteRpc),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_opcode() {
        for op in [
            Opcode::SwitchGfmdChannel,
            Opcode::JournalReadyToRecv,
            Opcode::JournalSend,
            Opcode::RemotePeerAlloc,
            Opcode::RemotePeerFree,
            Opcode::RemoteRpc,
        ] {
            assert_eq!(Opcode::from_i32(op as i32), Some(op));
        }
    }
}
