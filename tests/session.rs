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

//! Full protocol engine tests against a scripted in-memory TPer.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};

use opal_ata_security::datum::MethodStatus;
use opal_ata_security::drive::Drive;
use opal_ata_security::uid::{features, methods, ADMIN_SP, LOCKING_SP, MBR_TABLE, SESSION_MGR};
use opal_ata_security::{packet, Atom, Datum, Error, Transport};

const COMID: u16 = 0x07fe;

#[derive(Default)]
struct Shared {
	replies: VecDeque<Vec<u8>>,
	sent: Vec<(u8, u16, Vec<u8>)>,
}

/// Scripted drive: every IF-RECV pops the next canned reply, every IF-SEND
/// is recorded for inspection.
#[derive(Clone, Default)]
struct FakeTper(Rc<RefCell<Shared>>);

impl FakeTper {
	fn push_reply(&self, reply: Vec<u8>) {
		self.0.borrow_mut().replies.push_back(reply);
	}

	fn sent(&self) -> Vec<(u8, u16, Vec<u8>)> {
		self.0.borrow().sent.clone()
	}
}

impl Transport for FakeTper {
	fn if_send(&mut self, protocol: u8, comid: u16, data: &[u8], _bcount: u8) -> opal_ata_security::Result<()> {
		self.0.borrow_mut().sent.push((protocol, comid, data.to_vec()));
		Ok(())
	}

	fn if_recv(&mut self, _protocol: u8, _comid: u16, data: &mut [u8], _bcount: u8) -> opal_ata_security::Result<()> {
		let reply = self
			.0
			.borrow_mut()
			.replies
			.pop_front()
			.ok_or(Error::AtaStatus)?;
		data.fill(0);
		let n = reply.len().min(data.len());
		data[..n].copy_from_slice(&reply[..n]);
		Ok(())
	}
}

fn atom_bytes(atom: &Atom) -> Vec<u8> {
	let mut buf = vec![0u8; atom.encoded_size()];
	atom.encode(&mut buf);
	buf
}

fn protocol_block(protocols: &[u8]) -> Vec<u8> {
	let mut block = vec![0u8; 512];
	BigEndian::write_u16(&mut block[6..8], protocols.len() as u16);
	block[8..8 + protocols.len()].copy_from_slice(protocols);
	block
}

fn feature(code: u16, body: &[u8]) -> Vec<u8> {
	let mut buf = vec![0u8; 4];
	BigEndian::write_u16(&mut buf[0..2], code);
	buf[2] = 0x10;
	buf[3] = body.len() as u8;
	buf.extend_from_slice(body);
	buf
}

fn opal1_body(base_com_id: u16) -> [u8; 5] {
	let mut body = [0u8; 5];
	BigEndian::write_u16(&mut body[0..2], base_com_id);
	BigEndian::write_u16(&mut body[2..4], 1);
	body
}

fn opal2_body(base_com_id: u16, admins: u16, users: u16) -> [u8; 11] {
	let mut body = [0u8; 11];
	BigEndian::write_u16(&mut body[0..2], base_com_id);
	BigEndian::write_u16(&mut body[2..4], 1);
	BigEndian::write_u16(&mut body[5..7], admins);
	BigEndian::write_u16(&mut body[7..9], users);
	body
}

fn geometry_body(lowest_align: u64) -> [u8; 28] {
	let mut body = [0u8; 28];
	BigEndian::write_u32(&mut body[8..12], 4096);
	BigEndian::write_u64(&mut body[20..28], lowest_align);
	body
}

fn level0_block(feats: &[Vec<u8>]) -> Vec<u8> {
	let mut block = vec![0u8; 512];
	let mut offset = 48;
	for feat in feats {
		block[offset..offset + feat.len()].copy_from_slice(feat);
		offset += feat.len();
	}
	BigEndian::write_u32(&mut block[0..4], (offset - 4) as u32);
	BigEndian::write_u16(&mut block[6..8], 1);
	block
}

fn comid_reset_ok() -> Vec<u8> {
	let mut block = vec![0u8; 512];
	BigEndian::write_u16(&mut block[0..2], COMID);
	BigEndian::write_u16(&mut block[10..12], 4);
	block
}

fn properties_reply(comid: u16, max_com_pkt_size: u64) -> Vec<u8> {
	let props = Datum::List(vec![
		Datum::named(
			Atom::bytes(b"MaxComPacketSize".to_vec()),
			Atom::uint(max_com_pkt_size),
		),
		Datum::named(Atom::bytes(b"MaxPackets".to_vec()), Atom::uint(1)),
	]);
	let reply = Datum::method(SESSION_MGR, methods::PROPERTIES, vec![props]);
	packet::wrap(&reply.to_vec().unwrap(), comid, 0, 0)
}

fn sync_session_reply(host_id: u64, tper_id: u64) -> Vec<u8> {
	let reply = Datum::method(
		SESSION_MGR,
		methods::SYNC_SESSION,
		vec![Atom::uint(host_id).into(), Atom::uint(tper_id).into()],
	);
	packet::wrap(&reply.to_vec().unwrap(), COMID, 0, 0)
}

/// A reply as sent within a session: result items, then the status trailer.
fn in_session_reply(results: &[Datum], status: u8) -> Vec<u8> {
	let mut buf = Vec::new();
	for r in results {
		buf.extend(r.to_vec().unwrap());
	}
	buf.extend([0xf9, 0xf0, status, 0x00, 0x00, 0xf1]);
	packet::wrap(&buf, COMID, 0x1001, 0x2002)
}

/// A session manager reply flagging a non-zero status.
fn call_reply_status(object: u64, method: u64, status: u8) -> Vec<u8> {
	let mut buf = vec![0xf8];
	buf.extend(atom_bytes(&Atom::uid(object)));
	buf.extend(atom_bytes(&Atom::uid(method)));
	buf.extend([0xf0, 0xf1, 0xf9, 0xf0, status, 0x00, 0x00, 0xf1]);
	packet::wrap(&buf, COMID, 0, 0)
}

fn not_ready_block() -> Vec<u8> {
	let mut block = vec![0u8; 512];
	BigEndian::write_u16(&mut block[4..6], COMID);
	block
}

/// Script the full attach conversation and hand back the drive.
fn attach(max_com_pkt_size: u64) -> (Drive<FakeTper>, FakeTper) {
	let dev = FakeTper::default();
	dev.push_reply(protocol_block(&[0x00, 0x01, 0xef]));
	dev.push_reply(level0_block(&[
		feature(features::TPER, &[0x01]),
		feature(features::LOCKING, &[0x03]),
		feature(features::GEOMETRY, &geometry_body(8)),
		feature(features::OPAL2, &opal2_body(COMID, 4, 8)),
	]));
	dev.push_reply(comid_reset_ok());
	dev.push_reply(properties_reply(COMID, max_com_pkt_size));
	let drive = Drive::with_transport(dev.clone()).unwrap();
	(drive, dev)
}

fn login(drive: &mut Drive<FakeTper>, dev: &FakeTper) {
	dev.push_reply(sync_session_reply(0x77, 0x1001));
	drive
		.login(LOCKING_SP, opal_ata_security::uid::ADMIN_BASE + 1, b"pass")
		.unwrap();
}

/// Session IDs embedded in an outgoing frame's Packet header.
fn frame_session_ids(frame: &[u8]) -> (u32, u32) {
	(
		BigEndian::read_u32(&frame[20..24]),
		BigEndian::read_u32(&frame[24..28]),
	)
}

fn frame_payload(frame: &[u8]) -> &[u8] {
	let len = BigEndian::read_u32(&frame[52..56]) as usize;
	&frame[56..56 + len]
}

#[test]
fn attach_negotiates_capabilities() {
	let (drive, dev) = attach(16384);
	assert!(drive.has_opal2());
	assert!(!drive.has_opal1());
	assert_eq!(drive.com_id(), COMID);
	assert_eq!(drive.lba_align(), 8);
	assert_eq!(drive.max_admins(), 4);
	assert_eq!(drive.max_users(), 8);
	assert_eq!(drive.max_com_pkt_size(), 16384);

	let sent = dev.sent();
	// ComID stack reset went out on protocol 2 with the request code
	let (proto, comid, ref reset) = sent[0];
	assert_eq!((proto, comid), (2, COMID));
	assert_eq!(&reset[0..2], &COMID.to_be_bytes());
	assert_eq!(&reset[4..8], [0x00, 0x00, 0x00, 0x02]);
	// Properties went out on protocol 1 with zeroed session IDs
	let (proto, _, ref frame) = sent[1];
	assert_eq!(proto, 1);
	assert_eq!(frame_session_ids(frame), (0, 0));
}

#[test]
fn attach_requires_opal_protocol() {
	let dev = FakeTper::default();
	dev.push_reply(protocol_block(&[0x00, 0xef]));
	assert!(matches!(
		Drive::with_transport(dev),
		Err(Error::NotOpal)
	));
}

#[test]
fn attach_opal1_forces_alignment() {
	let dev = FakeTper::default();
	dev.push_reply(protocol_block(&[0x01]));
	dev.push_reply(level0_block(&[
		feature(features::GEOMETRY, &geometry_body(8)),
		feature(features::OPAL1, &opal1_body(0x0001)),
	]));
	// No ComID reset on Opal 1.0 drives
	dev.push_reply(properties_reply(0x0001, 2048));
	let drive = Drive::with_transport(dev.clone()).unwrap();
	assert!(drive.has_opal1());
	assert!(!drive.has_opal2());
	assert_eq!(drive.com_id(), 0x0001);
	assert_eq!(drive.lba_align(), 1);
	assert!(dev.sent().iter().all(|&(proto, ..)| proto != 2));
}

#[test]
fn opal2_wins_regardless_of_order() {
	let dev = FakeTper::default();
	dev.push_reply(protocol_block(&[0x01]));
	// Opal 2.0 listed before Opal 1.0 and before geometry
	dev.push_reply(level0_block(&[
		feature(features::OPAL2, &opal2_body(COMID, 4, 8)),
		feature(features::OPAL1, &opal1_body(0x0001)),
		feature(features::GEOMETRY, &geometry_body(8)),
	]));
	dev.push_reply(comid_reset_ok());
	dev.push_reply(properties_reply(COMID, 16384));
	let drive = Drive::with_transport(dev).unwrap();
	assert_eq!(drive.com_id(), COMID);
	assert_eq!(drive.lba_align(), 8);
}

#[test]
fn attach_without_ssc_fails() {
	let dev = FakeTper::default();
	dev.push_reply(protocol_block(&[0x01]));
	dev.push_reply(level0_block(&[feature(features::TPER, &[0x01])]));
	assert!(matches!(
		Drive::with_transport(dev),
		Err(Error::Discovery(_))
	));
}

#[test]
fn session_ids_placed_by_invoking_uid() {
	let (mut drive, dev) = attach(16384);
	login(&mut drive, &dev);

	dev.push_reply(in_session_reply(&[], 0x00));
	drive.table_set(MBR_TABLE, 2, Atom::uint(1)).unwrap();

	let sent = dev.sent();
	// StartSession is a session manager call: both IDs zero
	let start = &sent[sent.len() - 2].2;
	assert_eq!(frame_session_ids(start), (0, 0));
	// The Set call runs inside the session
	let set = &sent[sent.len() - 1].2;
	assert_eq!(frame_session_ids(set), (0x1001, 0x77));
}

#[test]
fn session_required_without_login() {
	let (mut drive, dev) = attach(16384);
	let frames_before = dev.sent().len();
	assert!(matches!(
		drive.table_set(MBR_TABLE, 2, Atom::uint(1)),
		Err(Error::SessionRequired)
	));
	assert_eq!(dev.sent().len(), frames_before);
}

#[test]
fn table_get_extracts_cell() {
	let (mut drive, dev) = attach(16384);
	login(&mut drive, &dev);

	let row = Datum::List(vec![Datum::named(
		Atom::uint(3),
		Atom::bytes(b"MSIDPIN0".to_vec()),
	)]);
	dev.push_reply(in_session_reply(&[row], 0x00));
	let pin = drive.default_pin().unwrap();
	assert_eq!(pin, b"MSIDPIN0");
}

#[test]
fn receive_polls_until_ready() {
	let (mut drive, dev) = attach(16384);
	dev.push_reply(not_ready_block());
	dev.push_reply(not_ready_block());
	dev.push_reply(sync_session_reply(0x77, 0x1001));
	drive.login_anon(ADMIN_SP).unwrap();
}

#[test]
fn receive_gives_up_after_budget() {
	let (mut drive, dev) = attach(16384);
	for _ in 0..500 {
		dev.push_reply(not_ready_block());
	}
	assert!(matches!(drive.login_anon(ADMIN_SP), Err(Error::Timeout)));
}

#[test]
fn comid_echo_checked() {
	let (mut drive, dev) = attach(16384);
	let reply = sync_session_reply(0x77, 0x1001);
	let mut wrong = reply.clone();
	BigEndian::write_u16(&mut wrong[4..6], COMID + 1);
	dev.push_reply(wrong);
	assert!(matches!(
		drive.login_anon(ADMIN_SP),
		Err(Error::EnvelopeMismatch(_))
	));
}

#[test]
fn method_failure_surfaces_status() {
	let (mut drive, dev) = attach(16384);
	dev.push_reply(call_reply_status(SESSION_MGR, methods::SYNC_SESSION, 0x01));
	assert!(matches!(
		drive.login(LOCKING_SP, opal_ata_security::uid::ADMIN_BASE + 1, b"bad"),
		Err(Error::MethodFailed(MethodStatus::NotAuthorized))
	));
}

#[test]
fn mbr_write_is_chunked() {
	let (mut drive, dev) = attach(8192);
	login(&mut drive, &dev);
	let frames_before = dev.sent().len();

	for _ in 0..3 {
		dev.push_reply(in_session_reply(&[], 0x00));
	}
	let image = vec![0xa5u8; 10000];
	drive.table_set_bin(MBR_TABLE, 0, &image).unwrap();

	let sent = dev.sent();
	let writes = &sent[frames_before..];
	assert_eq!(writes.len(), 3);

	let mut expected_offset = 0u64;
	let mut total = 0usize;
	for (i, &(_, _, ref frame)) in writes.iter().enumerate() {
		assert!(frame.len() <= 8192);
		let (call, _) = Datum::decode(frame_payload(frame)).unwrap();
		let call = call.method_call().unwrap();
		assert_eq!(call.method_uid, methods::SET);
		let offset = call.args[0].named_value().unwrap().atom().unwrap().get_uint().unwrap();
		let bytes = call.args[1].named_value().unwrap().atom().unwrap().get_bytes().unwrap().len();
		assert_eq!(offset, expected_offset);
		if i + 1 < writes.len() {
			// Every chunk but the last is a 4 KiB multiple
			assert_eq!(bytes % 4096, 0);
		}
		expected_offset += bytes as u64;
		total += bytes;
	}
	assert_eq!(total, image.len());
}

#[test]
fn oversize_envelope_rejected() {
	let (mut drive, dev) = attach(2048);
	login(&mut drive, &dev);
	let frames_before = dev.sent().len();

	// Binary writes cannot even fit one 4 KiB chunk under this ceiling
	assert!(matches!(
		drive.table_set_bin(MBR_TABLE, 0, &[0u8; 4096]),
		Err(Error::EnvelopeOversize { .. })
	));
	// Neither can an oversized scalar write
	assert!(matches!(
		drive.table_set(MBR_TABLE, 2, Atom::bytes(vec![0u8; 4096])),
		Err(Error::EnvelopeOversize { .. })
	));
	assert_eq!(dev.sent().len(), frames_before);
}

#[test]
fn io_failure_collapses_session() {
	let (mut drive, dev) = attach(16384);
	login(&mut drive, &dev);
	// Garbled reply: a reserved token where a datum should be
	dev.push_reply(packet::wrap(&[0xfe], COMID, 0x1001, 0x77));
	assert!(matches!(
		drive.table_set(MBR_TABLE, 2, Atom::uint(1)),
		Err(Error::Decode(_))
	));
	assert!(matches!(
		drive.table_set(MBR_TABLE, 2, Atom::uint(1)),
		Err(Error::SessionRequired)
	));
}

#[test]
fn logout_sends_end_session() {
	let (mut drive, dev) = attach(16384);
	login(&mut drive, &dev);
	dev.push_reply(packet::wrap(&[0xfa], COMID, 0x1001, 0x77));
	drive.logout();

	let sent = dev.sent();
	let (_, _, ref frame) = sent[sent.len() - 1];
	assert_eq!(frame_payload(frame), [0xfa]);
	assert_eq!(frame_session_ids(frame), (0x1001, 0x77));

	// Session is gone now
	assert!(matches!(
		drive.table_set(MBR_TABLE, 2, Atom::uint(1)),
		Err(Error::SessionRequired)
	));
}

#[test]
fn revert_clears_session_even_on_silence() {
	let (mut drive, dev) = attach(16384);
	login(&mut drive, &dev);
	for _ in 0..500 {
		dev.push_reply(not_ready_block());
	}
	// The drive never answers the Revert; that is not an error
	drive.admin_sp_revert().unwrap();
	assert!(matches!(
		drive.table_set(MBR_TABLE, 2, Atom::uint(1)),
		Err(Error::SessionRequired)
	));
}

#[test]
fn drop_attempts_end_session() {
	let (mut drive, dev) = attach(16384);
	login(&mut drive, &dev);
	dev.push_reply(packet::wrap(&[0xfa], COMID, 0x1001, 0x77));
	let frames_before = dev.sent().len();
	drop(drive);
	let sent = dev.sent();
	assert_eq!(sent.len(), frames_before + 1);
	assert_eq!(frame_payload(&sent[sent.len() - 1].2), [0xfa]);
}
