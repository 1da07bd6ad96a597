// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bootloader protocol: one request per received packet, except Write which may span
//! several. Replies reuse the request's packet where they can.


use crate::error::Error;
use crate::hal::{le_words, plausible_stack_pointer, Crc32, NorFlash};
use crate::pool::{Mailbox, PacketBox};
use crate::stream::packetise;
use consts::{DEFAULT_APP_ADDR, FLASH_BASE, FLASH_PAGE, MAX_TRANSFER, PACKET_POOL_SIZE};
use core::mem;
use heapless::Vec;
use host_protocol::{
    fragments_for, AckPayload, BlockHeader, ErasePayload, ErrorHeader, Flags, GoPayload, Packet, PacketType,
    QueryParameter, QueryPayload, QueryResponsePayload, ReadRequestPayload, Request, SyncPayload, PACKET_DATA_LEN,
};
use serde::Serialize;

/// What the caller has to do after a packet has been handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    Continue,
    /// Start the image at this address
    Jump(u32),
    /// Reset the microcontroller, once queued replies have gone out
    Reset,
}

/// A Write whose fragments are still arriving.
struct PendingWrite {
    /// Id of the first fragment, used for the reply.
    id: u8,
    header: BlockHeader,
    /// `remaining` of the last fragment taken.
    remaining: u8,
    data: Vec<u8, MAX_TRANSFER>,
}

enum WriteSession {
    Idle,
    Receiving(PendingWrite),
}

enum Progress {
    More(PendingWrite),
    Complete(PendingWrite),
}

impl PendingWrite {
    /// Validate a Write's first fragment and take its data.
    fn begin(packet: &Packet, header: BlockHeader, capacity: usize) -> Result<Progress, Error> {
        let len = header.len as usize;
        if len > MAX_TRANSFER {
            return Err(Error::WriteTooLong);
        }
        if fragments_for(BlockHeader::LEN, len) - 1 != usize::from(packet.remaining) {
            debug!(
                "write of {} bytes needs {} fragments, got {}",
                len,
                fragments_for(BlockHeader::LEN, len),
                packet.remaining as usize + 1
            );
            return Err(Error::UnexpectedFragments(PacketType::Write));
        }
        if header.address % 4 != 0 || header.len % 4 != 0 {
            return Err(Error::WriteMisaligned);
        }
        if flash_offset(capacity, header.address, header.len).is_none() {
            return Err(Error::WriteOutOfRange);
        }

        let mut pending = Self {
            id: packet.id,
            header,
            remaining: packet.remaining,
            data: Vec::new(),
        };
        let take = len.min(PACKET_DATA_LEN - BlockHeader::LEN);
        pending.append(&packet.payload[BlockHeader::LEN..BlockHeader::LEN + take])?;
        pending.progress()
    }

    /// Take a continuation fragment.
    fn extend(mut self, packet: &Packet) -> Result<Progress, Error> {
        if self.remaining.checked_sub(1) != Some(packet.remaining) {
            return Err(Error::FragmentMismatch);
        }
        self.remaining = packet.remaining;
        let take = (self.header.len as usize - self.data.len()).min(PACKET_DATA_LEN);
        self.append(&packet.payload[..take])?;
        self.progress()
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.data.extend_from_slice(bytes).map_err(|_| Error::WriteTooLong)
    }

    fn progress(self) -> Result<Progress, Error> {
        if self.remaining > 0 {
            Ok(Progress::More(self))
        } else if self.data.len() != self.header.len as usize {
            Err(Error::WriteIncomplete)
        } else {
            Ok(Progress::Complete(self))
        }
    }
}

/// Offset from the start of flash of `[address, address + len)`, if the whole range is
/// inside a flash of `capacity` bytes.
fn flash_offset(capacity: usize, address: u32, len: u32) -> Option<u32> {
    let offset = address.checked_sub(FLASH_BASE)?;
    let end = offset.checked_add(len)?;
    (end as usize <= capacity).then_some(offset)
}

fn check_single(packet: &Packet, kind: PacketType) -> Result<(), Error> {
    match packet.remaining {
        0 => Ok(()),
        _ => Err(Error::UnexpectedFragments(kind)),
    }
}

pub struct Engine<'p, F, C, const N: usize = PACKET_POOL_SIZE> {
    mailbox: Mailbox<'p, N>,
    flash: F,
    crc: C,
    session: WriteSession,
}

impl<'p, F, C, const N: usize> Engine<'p, F, C, N>
where
    F: NorFlash,
    C: Crc32,
{
    pub fn new(mailbox: Mailbox<'p, N>, flash: F, crc: C) -> Self {
        Self {
            mailbox,
            flash,
            crc,
            session: WriteSession::Idle,
        }
    }

    pub fn mailbox(&self) -> &Mailbox<'p, N> {
        &self.mailbox
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Whether a multi-fragment Write is in progress.
    pub fn is_writing(&self) -> bool {
        matches!(self.session, WriteSession::Receiving(_))
    }

    /// Handle the next received packet, if there is one.
    pub fn poll(&mut self) -> Option<Action> {
        let packet = self.mailbox.receive()?;
        Some(self.handle(packet))
    }

    pub fn handle(&mut self, packet: PacketBox<'p, N>) -> Action {
        if packet.flags().contains(Flags::CRC_ERROR) {
            if self.is_writing() {
                warn!("transport CRC error, dropping write");
            }
            self.session = WriteSession::Idle;
            let id = packet.id;
            self.fail(packet, id, Error::TransportCrc);
            return Action::Continue;
        }

        if let WriteSession::Receiving(pending) = &self.session {
            match packet.packet_type() {
                Ok(PacketType::Write) => return self.write(packet),
                Ok(PacketType::Empty) => return Action::Continue,
                _ => {
                    let id = pending.id;
                    self.session = WriteSession::Idle;
                    self.report(id, Error::WriteInterrupted);
                }
            }
        }

        self.dispatch(packet)
    }

    fn dispatch(&mut self, packet: PacketBox<'p, N>) -> Action {
        let id = packet.id;
        let request = match Request::parse(&packet) {
            Ok(request) => request,
            Err(_) => {
                self.fail(packet, id, Error::MalformedPayload);
                return Action::Continue;
            }
        };

        match request {
            Request::Empty => {}
            Request::Sync(_) => self.sync(packet),
            Request::Erase(payload) => self.erase(packet, payload),
            Request::Write(_) => return self.write(packet),
            Request::ReadRequest(payload) => self.read(packet, payload),
            Request::Go(payload) => return self.go(packet, payload),
            Request::Query(payload) => self.query(packet, payload),
            Request::Reset => {
                info!("reset requested");
                return Action::Reset;
            }
            Request::Unexpected(kind) => {
                debug!("{:?} is not a request", kind);
                self.fail(packet, id, Error::UnknownType);
            }
            Request::Unknown(kind) => {
                debug!("unknown packet type {:#x}", kind);
                self.fail(packet, id, Error::UnknownType);
            }
        }
        Action::Continue
    }

    fn sync(&mut self, packet: PacketBox<'p, N>) {
        let id = packet.id;
        match check_single(&packet, PacketType::Sync) {
            Ok(()) => self.reply(packet, 0, PacketType::Sync, &SyncPayload::new(0, 0)),
            Err(error) => self.fail(packet, id, error),
        }
    }

    fn erase(&mut self, packet: PacketBox<'p, N>, payload: ErasePayload) {
        let id = packet.id;
        match self.erase_page(&packet, payload.address) {
            Ok(()) => self.reply(packet, id, PacketType::Ack, &AckPayload::new(id)),
            Err(error) => self.fail(packet, id, error),
        }
    }

    fn erase_page(&mut self, packet: &Packet, address: u32) -> Result<(), Error> {
        check_single(packet, PacketType::Erase)?;
        info!("erase page at {:#x}", address);
        if address % FLASH_PAGE != 0 {
            return Err(Error::EraseMisaligned);
        }
        let offset = flash_offset(self.flash.capacity(), address, FLASH_PAGE).ok_or(Error::EraseOutOfRange)?;
        self.flash
            .erase(offset, offset + FLASH_PAGE)
            .map_err(|_| Error::EraseFailed)
    }

    /// Take one Write fragment, first or continuation.
    fn write(&mut self, packet: PacketBox<'p, N>) -> Action {
        let capacity = self.flash.capacity();
        let (id, step) = match mem::replace(&mut self.session, WriteSession::Idle) {
            WriteSession::Idle => {
                let step = match packet.decode::<BlockHeader>() {
                    Ok(header) => PendingWrite::begin(&packet, header, capacity),
                    Err(error) => Err(error.into()),
                };
                (packet.id, step)
            }
            WriteSession::Receiving(pending) => (pending.id, pending.extend(&packet)),
        };

        match step {
            Ok(Progress::More(pending)) => {
                trace!("write {}: {} fragments to go", pending.id, pending.remaining);
                self.session = WriteSession::Receiving(pending);
            }
            Ok(Progress::Complete(pending)) => match self.commit(&pending) {
                Ok(()) => self.reply(packet, id, PacketType::Ack, &AckPayload::new(id)),
                Err(error) => self.fail(packet, id, error),
            },
            Err(error) => self.fail(packet, id, error),
        }
        Action::Continue
    }

    /// Check a complete Write against its CRC and program it.
    fn commit(&mut self, pending: &PendingWrite) -> Result<(), Error> {
        let header = &pending.header;
        let crc = self.crc.block_crc32(le_words(&pending.data));
        if crc != header.crc {
            debug!("write crc {:#x}, expected {:#x}", crc, header.crc);
            return Err(Error::WriteIntegrity);
        }

        info!("write {} bytes at {:#x}", header.len, header.address);
        let offset = flash_offset(self.flash.capacity(), header.address, header.len).ok_or(Error::WriteOutOfRange)?;
        for (word, bytes) in (offset..).step_by(4).zip(pending.data.chunks_exact(4)) {
            self.flash.write(word, bytes).map_err(|_| Error::ProgramFailed)?;
        }
        Ok(())
    }

    fn read(&mut self, mut packet: PacketBox<'p, N>, request: ReadRequestPayload) {
        let id = packet.id;
        let mut data = [0; MAX_TRANSFER];
        let header = match self.read_block(&packet, request, &mut data) {
            Ok(header) => header,
            Err(error) => return self.fail(packet, id, error),
        };

        packet.clear();
        packet.id = id;
        if packet.encode(&header).is_err() {
            return self.fail(packet, id, Error::MalformedPayload);
        }
        let data = &data[..header.len as usize];
        if let Err(error) = packetise(&self.mailbox, packet, BlockHeader::LEN, PacketType::ReadResponse, data) {
            warn!("read response dropped: {}", error);
            self.report(id, error);
        }
    }

    fn read_block(
        &mut self,
        packet: &Packet,
        request: ReadRequestPayload,
        data: &mut [u8; MAX_TRANSFER],
    ) -> Result<BlockHeader, Error> {
        check_single(packet, PacketType::ReadRequest)?;
        info!("read {} bytes at {:#x}", request.len, request.address);
        if request.address % 4 != 0 {
            return Err(Error::ReadMisalignedAddress);
        }
        if request.len % 4 != 0 {
            return Err(Error::ReadMisalignedLength);
        }
        if request.len as usize > MAX_TRANSFER {
            return Err(Error::ReadTooLong);
        }
        let offset =
            flash_offset(self.flash.capacity(), request.address, request.len).ok_or(Error::ReadOutOfRange)?;

        let data = &mut data[..request.len as usize];
        self.flash.read(offset, data).map_err(|_| Error::ReadFailed)?;
        Ok(BlockHeader {
            address: request.address,
            len: request.len,
            crc: self.crc.block_crc32(le_words(data)),
        })
    }

    fn go(&mut self, packet: PacketBox<'p, N>, payload: GoPayload) -> Action {
        let id = packet.id;
        if let Err(error) = check_single(&packet, PacketType::Go) {
            self.fail(packet, id, error);
            return Action::Continue;
        }

        if self.image_is_plausible(payload.address) {
            info!("jumping to {:#x}", payload.address);
            Action::Jump(payload.address)
        } else {
            // The host learns why before the reset, the app loop lets the reply drain.
            self.fail(packet, id, Error::DubiousJumpTarget);
            Action::Reset
        }
    }

    fn query(&mut self, packet: PacketBox<'p, N>, payload: QueryPayload) {
        let id = packet.id;
        if let Err(error) = check_single(&packet, PacketType::Query) {
            return self.fail(packet, id, error);
        }

        let value = match QueryParameter::try_from(payload.parameter) {
            Ok(QueryParameter::MaxTransfer) => MAX_TRANSFER as u32,
            Ok(QueryParameter::DefaultAppAddress) => DEFAULT_APP_ADDR,
            Err(parameter) => {
                debug!("unknown query {}", parameter);
                return self.fail(packet, id, Error::UnknownQuery);
            }
        };
        let response = QueryResponsePayload {
            parameter: payload.parameter,
            value,
        };
        self.reply(packet, id, PacketType::QueryResponse, &response);
    }

    /// Whether the vector table at `address` starts with a stack pointer into SRAM.
    pub fn image_is_plausible(&mut self, address: u32) -> bool {
        let Some(offset) = flash_offset(self.flash.capacity(), address, 4) else {
            return false;
        };
        let mut word = [0; 4];
        if address % 4 != 0 || self.flash.read(offset, &mut word).is_err() {
            return false;
        }
        plausible_stack_pointer(u32::from_le_bytes(word))
    }

    /// Turn `packet` into a single-frame reply and queue it.
    fn reply<T: Serialize>(&mut self, mut packet: PacketBox<'p, N>, id: u8, kind: PacketType, payload: &T) {
        packet.clear();
        packet.id = id;
        packet.set_type(kind);
        match packet.encode(payload) {
            Ok(_) => self.mailbox.send(packet),
            Err(_) => error!("{:?} reply does not fit a frame", kind),
        }
    }

    /// Turn `packet` into an Error message for request `id` and queue it.
    fn fail(&mut self, mut packet: PacketBox<'p, N>, id: u8, error: Error) {
        warn!("request {} failed ({:?}): {}", id, error.class(), error);

        packet.clear();
        packet.id = id;
        if packet.encode(&ErrorHeader::new(id)).is_err() {
            return;
        }
        let mut text: Vec<u8, 64> = Vec::new();
        let message = error.message().as_bytes();
        let fits = text.extend_from_slice(message).is_ok() && text.push(0).is_ok();
        if !fits {
            error!("error text too long");
            return;
        }
        if let Err(error) = packetise(&self.mailbox, packet, ErrorHeader::LEN, PacketType::Error, &text) {
            warn!("error reply dropped: {}", error);
        }
    }

    /// Report `error` for request `id` in a freshly allocated packet.
    fn report(&mut self, id: u8, error: Error) {
        match self.mailbox.alloc() {
            Some(packet) => self.fail(packet, id, error),
            None => warn!("no packet to report {} for request {}", error, id),
        }
    }
}
