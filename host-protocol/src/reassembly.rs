// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::packet::Packet;
use heapless::Vec;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReassemblyError {
    /// A fragment's type differs from the first fragment's
    UnexpectedType { expected: u8, got: u8 },
    /// A fragment broke the countdown of `remaining`
    UnexpectedFragment { expected: u8, got: u8 },
    /// The message does not fit the buffer
    Overflow,
    /// The last fragment has already been received
    Complete,
}

/// Collects the data of one multi-fragment message (Error, ReadResponse) on the host side.
///
/// The first fragment contributes its payload after `offset` (its type-specific header),
/// later fragments their whole payload. The countdown in `remaining` must be strict.
#[derive(Debug)]
pub struct Reassembly<const N: usize> {
    offset: usize,
    kind: Option<u8>,
    next: Option<u8>,
    done: bool,
    data: Vec<u8, N>,
}

impl<const N: usize> Reassembly<N> {
    pub const fn new(offset: usize) -> Self {
        Self {
            offset,
            kind: None,
            next: None,
            done: false,
            data: Vec::new(),
        }
    }

    /// Feed the next fragment. Returns `true` once the last fragment has been taken.
    pub fn push(&mut self, packet: &Packet) -> Result<bool, ReassemblyError> {
        if self.done {
            return Err(ReassemblyError::Complete);
        }
        let bytes = match (self.kind, self.next) {
            (None, _) => {
                self.kind = Some(packet.kind);
                &packet.payload[self.offset.min(packet.payload.len())..]
            }
            (Some(kind), Some(next)) => {
                if packet.kind != kind {
                    return Err(ReassemblyError::UnexpectedType {
                        expected: kind,
                        got: packet.kind,
                    });
                }
                if packet.remaining != next {
                    return Err(ReassemblyError::UnexpectedFragment {
                        expected: next,
                        got: packet.remaining,
                    });
                }
                &packet.payload[..]
            }
            (Some(_), None) => return Err(ReassemblyError::Complete),
        };
        self.data
            .extend_from_slice(bytes)
            .map_err(|_| ReassemblyError::Overflow)?;
        self.next = packet.remaining.checked_sub(1);
        self.done = packet.remaining == 0;
        Ok(self.done)
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Everything collected so far, including the zero padding of the last fragment.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PacketType;

    fn fragment(kind: PacketType, remaining: u8, fill: u8) -> Packet {
        let mut packet = Packet::new(1, kind);
        packet.remaining = remaining;
        packet.payload = [fill; 32];
        packet
    }

    #[test]
    fn collects_in_order() {
        let mut message = Reassembly::<128>::new(4);
        assert_eq!(message.push(&fragment(PacketType::Error, 2, 1)), Ok(false));
        assert_eq!(message.push(&fragment(PacketType::Error, 1, 2)), Ok(false));
        assert_eq!(message.push(&fragment(PacketType::Error, 0, 3)), Ok(true));
        assert!(message.is_complete());
        assert_eq!(message.data().len(), 28 + 32 + 32);
        assert!(message.data()[..28].iter().all(|&b| b == 1));
        assert!(message.data()[60..].iter().all(|&b| b == 3));
        assert_eq!(
            message.push(&fragment(PacketType::Error, 0, 4)),
            Err(ReassemblyError::Complete)
        );
    }

    #[test]
    fn rejects_broken_countdown() {
        let mut message = Reassembly::<128>::new(0);
        message.push(&fragment(PacketType::ReadResponse, 2, 0)).unwrap();
        assert_eq!(
            message.push(&fragment(PacketType::ReadResponse, 0, 0)),
            Err(ReassemblyError::UnexpectedFragment { expected: 1, got: 0 })
        );
        assert_eq!(
            message.push(&fragment(PacketType::Error, 1, 0)),
            Err(ReassemblyError::UnexpectedType {
                expected: PacketType::ReadResponse as u8,
                got: PacketType::Error as u8,
            })
        );
    }

    #[test]
    fn overflow() {
        let mut message = Reassembly::<40>::new(0);
        message.push(&fragment(PacketType::Error, 1, 0)).unwrap();
        assert_eq!(
            message.push(&fragment(PacketType::Error, 0, 0)),
            Err(ReassemblyError::Overflow)
        );
    }
}
