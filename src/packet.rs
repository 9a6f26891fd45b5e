/*
 * Linux userspace tool to manage TCG Opal self-encrypting ATA drives
 *
 * (C) Copyright 2016 Jethro G. Beekman
 *
 * This program is free software; you can redistribute it and/or modify it
 * under the terms of the GNU General Public License as published by the Free
 * Software Foundation; either version 2 of the License, or (at your option)
 * any later version.
 */

//! The triple-nested ComPacket/Packet/SubPacket envelope wrapping every
//! datum byte-stream on the wire. All header fields are big-endian; each
//! `length` covers that header's contents, excluding the header itself.

use byteorder::{BigEndian, ByteOrder};

use crate::ata::ATA_BLOCK_SIZE;
use crate::error::{Error, Result};

// reserved(4) com_id(2) com_id_ext(2) outstanding(4) min_transfer(4) length(4)
pub const COM_HDR_LEN: usize = 20;
// tper_session_id(4) host_session_id(4) seq(4) reserved(2) ack_type(2) ack(4) length(4)
pub const PKT_HDR_LEN: usize = 24;
// reserved(6) kind(2) length(4)
pub const SUB_HDR_LEN: usize = 12;
/// Combined size of the three headers.
pub const ENVELOPE_LEN: usize = COM_HDR_LEN + PKT_HDR_LEN + SUB_HDR_LEN;

fn pad_to(value: usize, mult: usize) -> usize {
	(value + mult - 1) / mult * mult
}

/// Wrap an encoded datum stream for transmission. The SubPacket payload is
/// padded to a 4 byte boundary, the whole transfer to a block boundary.
pub fn wrap(payload: &[u8], com_id: u16, tper_session_id: u32, host_session_id: u32) -> Vec<u8> {
	let sub_len = payload.len();
	let pkt_len = pad_to(sub_len + SUB_HDR_LEN, 4);
	let com_len = pkt_len + PKT_HDR_LEN;
	let total = pad_to(com_len + COM_HDR_LEN, ATA_BLOCK_SIZE);

	let mut buf = vec![0u8; total];
	BigEndian::write_u16(&mut buf[4..6], com_id);
	BigEndian::write_u32(&mut buf[16..20], com_len as u32);
	BigEndian::write_u32(&mut buf[20..24], tper_session_id);
	BigEndian::write_u32(&mut buf[24..28], host_session_id);
	BigEndian::write_u32(&mut buf[40..44], pkt_len as u32);
	BigEndian::write_u32(&mut buf[52..56], sub_len as u32);
	buf[ENVELOPE_LEN..ENVELOPE_LEN + sub_len].copy_from_slice(payload);
	buf
}

/// Unpack one received block. `Ok(None)` means the drive reported a zero
/// length ComPacket, i.e. the response is not ready yet.
pub fn unwrap(block: &[u8], com_id: u16) -> Result<Option<&[u8]>> {
	if block.len() < ENVELOPE_LEN {
		return Err(Error::EnvelopeMismatch("response shorter than headers"));
	}
	if BigEndian::read_u16(&block[4..6]) != com_id {
		return Err(Error::EnvelopeMismatch("ComID echo mismatch"));
	}

	let com_len = BigEndian::read_u32(&block[16..20]) as usize;
	if com_len == 0 {
		// Drive is still working on the response
		return Ok(None);
	}
	if com_len <= PKT_HDR_LEN + SUB_HDR_LEN {
		return Err(Error::EnvelopeMismatch("ComPacket length inconsistent"));
	}

	let sub_len = BigEndian::read_u32(&block[52..56]) as usize;
	if ENVELOPE_LEN + sub_len > block.len() {
		return Err(Error::EnvelopeMismatch("SubPacket length exceeds transfer"));
	}
	Ok(Some(&block[ENVELOPE_LEN..ENVELOPE_LEN + sub_len]))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_layout() {
		let frame = wrap(&[0xfa], 0x07fe, 0x11223344, 0x55667788);
		// ComID at offset 4, big-endian
		assert_eq!(&frame[4..6], [0x07, 0xfe]);
		// ComPacket length: padded SubPacket (12 + 1 -> 16) plus Packet header
		assert_eq!(&frame[16..20], [0x00, 0x00, 0x00, 0x28]);
		// Session IDs, TPer first
		assert_eq!(&frame[20..24], [0x11, 0x22, 0x33, 0x44]);
		assert_eq!(&frame[24..28], [0x55, 0x66, 0x77, 0x88]);
		// Packet length
		assert_eq!(&frame[40..44], [0x00, 0x00, 0x00, 0x10]);
		// SubPacket length is the unpadded payload length
		assert_eq!(&frame[52..56], [0x00, 0x00, 0x00, 0x01]);
		assert_eq!(frame[56], 0xfa);
	}

	#[test]
	fn total_length_law() {
		// total = pad512(com_hdr + pad4(sub_hdr + payload) + pkt_hdr)
		assert_eq!(wrap(&[], 1, 0, 0).len(), 512);
		assert_eq!(wrap(&[0; 456], 1, 0, 0).len(), 512);
		assert_eq!(wrap(&[0; 457], 1, 0, 0).len(), 1024);
		assert_eq!(wrap(&[0; 4000], 1, 0, 0).len(), 4096);
	}

	#[test]
	fn unwrap_roundtrip() {
		let frame = wrap(&[0x01, 0x02, 0x03], 0x1234, 0, 0);
		let payload = unwrap(&frame, 0x1234).unwrap().unwrap();
		assert_eq!(payload, [0x01, 0x02, 0x03]);
	}

	#[test]
	fn unwrap_not_ready() {
		let mut block = vec![0u8; 512];
		BigEndian::write_u16(&mut block[4..6], 0x1234);
		assert!(unwrap(&block, 0x1234).unwrap().is_none());
	}

	#[test]
	fn unwrap_comid_mismatch() {
		let frame = wrap(&[0x01], 0x1234, 0, 0);
		assert!(matches!(
			unwrap(&frame, 0x4321),
			Err(Error::EnvelopeMismatch(_))
		));
	}

	#[test]
	fn unwrap_bad_sub_length() {
		let mut frame = wrap(&[0x01], 0x1234, 0, 0);
		BigEndian::write_u32(&mut frame[52..56], 4096);
		assert!(matches!(
			unwrap(&frame, 0x1234),
			Err(Error::EnvelopeMismatch(_))
		));
	}
}
