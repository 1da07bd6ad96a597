// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::Error;
use crate::pool::{Mailbox, PacketBox};
use heapless::Vec;
use host_protocol::{fragments_for, PacketType, PACKET_DATA_LEN};

/// Send `data` as one message of `kind`, starting at `offset` in the payload of `first`,
/// which already carries the type's header and the message id.
///
/// Every packet is acquired before anything is queued, so the host never sees a partial
/// message. On exhaustion all of them, `first` included, go back to the pool.
pub fn packetise<'p, const N: usize>(
    mailbox: &Mailbox<'p, N>,
    first: PacketBox<'p, N>,
    offset: usize,
    kind: PacketType,
    data: &[u8],
) -> Result<(), Error> {
    let total = fragments_for(offset, data.len());
    if total > N {
        return Err(Error::PoolExhausted);
    }

    let id = first.id;
    let mut packets: Vec<PacketBox<'p, N>, N> = Vec::new();
    packets.push(first).map_err(|_| Error::PoolExhausted)?;
    while packets.len() < total {
        let packet = mailbox.alloc().ok_or(Error::PoolExhausted)?;
        packets.push(packet).map_err(|_| Error::PoolExhausted)?;
    }

    let mut rest = data;
    for (index, packet) in packets.iter_mut().enumerate() {
        let start = if index == 0 { offset } else { 0 };
        let take = rest.len().min(PACKET_DATA_LEN - start);
        packet.payload[start..start + take].copy_from_slice(&rest[..take]);
        rest = &rest[take..];

        packet.id = id;
        packet.set_type(kind);
        // `total` is at most `N`, well inside a u8 for any pool this runs with.
        packet.remaining = (total - 1 - index) as u8;
    }

    for packet in packets {
        mailbox.send(packet);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PacketPool;
    use host_protocol::{Reassembly, ReassemblyError};

    #[test]
    fn fragments_count_down_and_reassemble() {
        let pool = PacketPool::<8>::new();
        let (mailbox, mut port) = pool.split().unwrap();
        let data: std::vec::Vec<u8> = (0..100).collect();

        let mut first = mailbox.alloc().unwrap();
        first.id = 0x21;
        first.payload[..4].copy_from_slice(&[0xAA; 4]);
        packetise(&mailbox, first, 4, PacketType::ReadResponse, &data).unwrap();

        let mut message = Reassembly::<128>::new(4);
        let mut remaining = std::vec::Vec::new();
        while let Some(packet) = port.next_outgoing() {
            assert_eq!(packet.id, 0x21);
            assert_eq!(packet.packet_type(), Ok(PacketType::ReadResponse));
            remaining.push(packet.remaining);
            if remaining.len() == 1 {
                assert_eq!(packet.payload[..4], [0xAA; 4]);
            }
            message.push(&packet).unwrap();
        }
        assert_eq!(remaining, [3, 2, 1, 0]);
        assert!(message.is_complete());
        assert_eq!(message.data()[..100], data[..]);
        // Padding of the last fragment is zero.
        assert!(message.data()[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn single_fragment() {
        let pool = PacketPool::<2>::new();
        let (mailbox, mut port) = pool.split().unwrap();

        let first = mailbox.alloc().unwrap();
        packetise(&mailbox, first, 4, PacketType::Error, b"CRC Error.\0").unwrap();

        let packet = port.next_outgoing().unwrap();
        assert_eq!(packet.remaining, 0);
        assert_eq!(&packet.payload[4..15], b"CRC Error.\0");
        assert!(port.next_outgoing().is_none());

        let mut message = Reassembly::<64>::new(4);
        assert_eq!(message.push(&packet), Ok(true));
        assert_eq!(message.push(&packet), Err(ReassemblyError::Complete));
    }

    #[test]
    fn nothing_is_sent_without_enough_packets() {
        let pool = PacketPool::<4>::new();
        let (mailbox, mut port) = pool.split().unwrap();
        let _held = mailbox.alloc().unwrap();

        let first = mailbox.alloc().unwrap();
        // Needs four packets, only three are left including `first`.
        let result = packetise(&mailbox, first, 0, PacketType::ReadResponse, &[0x55; 128]);
        assert_eq!(result, Err(Error::PoolExhausted));
        assert!(port.next_outgoing().is_none());
        assert_eq!(mailbox.census().free, Some(3));
    }
}
