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

//! High level interface to a TCG Opal drive: attach-time discovery, the
//! session lifecycle, and table access.

use std::cmp;
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::ata::{AtaDrive, IdentifyDevice, Transport, ATA_BLOCK_SIZE};
use crate::atom::Atom;
use crate::datum::{self, Datum, MethodStatus};
use crate::discovery::{self, LockingFlags, Protocol};
use crate::error::{Error, Result};
use crate::packet;
use crate::uid::{methods, ADMIN_SP, C_PIN_MSID, SESSION_MGR};

/// The drive legitimately answers "not ready yet"; poll every 10 ms for up
/// to 5 seconds before giving up.
const RECV_POLL: Duration = Duration::from_millis(10);
const RECV_RETRIES: usize = 500;

/// Envelope headers plus worst-case method framing around a binary write.
const BIN_XFER_OVERHEAD: usize = 1024;

/// The block count field of IF-SEND is a single byte.
const MAX_FRAME: usize = 255 * ATA_BLOCK_SIZE;

/// An attached Opal drive. Holds at most one session; the session IDs are
/// owned here and zeroed whenever no session exists.
pub struct Drive<T: Transport> {
	dev: T,
	tper_session_id: u64,
	host_session_id: u64,
	has_opal1: bool,
	has_opal2: bool,
	com_id: u16,
	lba_align: u64,
	max_com_pkt_size: u32,
	admin_count: u16,
	user_count: u16,
	locking: Option<LockingFlags>,
}

impl Drive<AtaDrive> {
	/// Attach to the drive at the given path (eg `/dev/sdb`).
	pub fn open(path: &str) -> Result<Drive<AtaDrive>> {
		Drive::with_transport(AtaDrive::open(path)?)
	}

	/// IDENTIFY DEVICE data captured at attach.
	pub fn identity(&self) -> &IdentifyDevice {
		self.dev.identify()
	}
}

impl<T: Transport> Drive<T> {
	/// Run the attach sequence over an already open transport: TPM probe,
	/// Level 0 discovery, ComID stack reset where supported, then the
	/// Level 1 properties exchange.
	pub fn with_transport(dev: T) -> Result<Drive<T>> {
		let mut drive = Drive {
			dev,
			tper_session_id: 0,
			host_session_id: 0,
			has_opal1: false,
			has_opal2: false,
			com_id: 0,
			lba_align: 1,
			max_com_pkt_size: u32::MAX,
			admin_count: 0,
			user_count: 0,
			locking: None,
		};

		drive.probe_tpm()?;
		drive.probe_level0()?;
		// If we can, make sure we're starting from a blank slate
		if drive.has_opal2 {
			drive.reset_comid()?;
		}
		drive.probe_level1()?;
		Ok(drive)
	}

	pub fn has_opal1(&self) -> bool {
		self.has_opal1
	}

	pub fn has_opal2(&self) -> bool {
		self.has_opal2
	}

	pub fn com_id(&self) -> u16 {
		self.com_id
	}

	pub fn lba_align(&self) -> u64 {
		self.lba_align
	}

	pub fn max_com_pkt_size(&self) -> u32 {
		self.max_com_pkt_size
	}

	pub fn max_admins(&self) -> u16 {
		self.admin_count
	}

	pub fn max_users(&self) -> u16 {
		self.user_count
	}

	/// Locking feature state as reported by Level 0 discovery.
	pub fn locking_state(&self) -> Option<LockingFlags> {
		self.locking
	}

	/// Start an anonymous session with the given SP.
	pub fn login_anon(&mut self, sp_uid: u64) -> Result<()> {
		self.logout();
		self.start_session(vec![
			Atom::uint(host_session_nonce()).into(),
			Atom::uid(sp_uid).into(),
			Atom::uint(1).into(), // read/write session
		])?;
		debug!(
			"anonymous session {:x}:{:x} started",
			self.tper_session_id, self.host_session_id
		);
		Ok(())
	}

	/// Start an authenticated session with the given SP, signing on as
	/// `auth_uid` with the supplied credential.
	pub fn login(&mut self, sp_uid: u64, auth_uid: u64, pin: &[u8]) -> Result<()> {
		self.logout();
		self.start_session(vec![
			Atom::uint(host_session_nonce()).into(),
			Atom::uid(sp_uid).into(),
			Atom::uint(1).into(), // read/write session
			// Host challenge
			Datum::named(Atom::uint(0), Atom::bytes(pin.to_vec())),
			// Host signing authority
			Datum::named(Atom::uint(3), Atom::uid(auth_uid)),
		])?;
		debug!(
			"authorized session {:x}:{:x} started",
			self.tper_session_id, self.host_session_id
		);
		Ok(())
	}

	fn start_session(&mut self, args: Vec<Datum>) -> Result<()> {
		let reply = self.call(&Datum::method(SESSION_MGR, methods::START_SESSION, args))?;
		let results = reply.results()?;
		if results.len() < 2 {
			return Err(Error::DatumType("a SyncSession reply"));
		}
		self.host_session_id = results[0].atom()?.get_uint()?;
		self.tper_session_id = results[1].atom()?.get_uint()?;
		Ok(())
	}

	/// End any session in progress. The drive may legitimately not answer
	/// on some teardown paths, so all errors are swallowed here.
	pub fn logout(&mut self) {
		if self.tper_session_id != 0 {
			debug!(
				"stopping session {:x}:{:x}",
				self.tper_session_id, self.host_session_id
			);
			let _ = self.sendrecv(&Datum::EndSession);
			self.tper_session_id = 0;
			self.host_session_id = 0;
		}
	}

	/// Query one column of the specified table row.
	pub fn table_get(&mut self, tbl_uid: u64, tbl_col: u64) -> Result<Atom> {
		let call = Datum::method(
			tbl_uid,
			methods::GET,
			vec![Datum::List(vec![
				// Starting and ending column
				Datum::named(Atom::uint(3), Atom::uint(tbl_col)),
				Datum::named(Atom::uint(4), Atom::uint(tbl_col)),
			])],
		);
		let reply = self.call(&call)?;
		let results = reply.results()?;
		let row = results
			.first()
			.ok_or(Error::DatumType("a Get result"))?
			.list()?;
		let cell = row.first().ok_or(Error::DatumType("a populated row"))?;
		Ok(cell.named_value()?.atom()?.clone())
	}

	/// Query a whole table row: the list of named columns the drive chose
	/// to return.
	pub fn table_get_row(&mut self, tbl_uid: u64) -> Result<Datum> {
		let call = Datum::method(tbl_uid, methods::GET, vec![Datum::List(vec![])]);
		let reply = self.call(&call)?;
		let results = reply.results()?;
		results
			.first()
			.cloned()
			.ok_or(Error::DatumType("a Get result"))
	}

	/// Set one column of the specified table row.
	pub fn table_set(&mut self, tbl_uid: u64, tbl_col: u64, val: Atom) -> Result<()> {
		let call = Datum::method(
			tbl_uid,
			methods::SET,
			vec![Datum::named(
				// Values
				Atom::uint(1),
				Datum::List(vec![Datum::named(Atom::uint(tbl_col), val)]),
			)],
		);
		self.call(&call)?;
		Ok(())
	}

	/// Write a binary table region, eg the MBR shadow image. Writes are
	/// chunked in 4 KiB multiples so each transmission fits the drive's
	/// ComPacket ceiling; the final chunk carries the remainder.
	pub fn table_set_bin(&mut self, tbl_uid: u64, offset: u64, data: &[u8]) -> Result<()> {
		let ceiling = cmp::min(self.max_com_pkt_size as usize, MAX_FRAME);
		let chunk = ceiling.saturating_sub(BIN_XFER_OVERHEAD) & !0xfff;
		if chunk == 0 {
			return Err(Error::EnvelopeOversize {
				size: 0x1000 + BIN_XFER_OVERHEAD,
				max: self.max_com_pkt_size,
			});
		}

		let mut pos = offset;
		for piece in data.chunks(chunk) {
			let call = Datum::method(
				tbl_uid,
				methods::SET,
				vec![
					// Where
					Datum::named(Atom::uint(0), Atom::uint(pos)),
					// Values
					Datum::named(Atom::uint(1), Atom::bytes(piece.to_vec())),
				],
			);
			self.call(&call)?;
			pos += piece.len() as u64;
		}
		Ok(())
	}

	/// Retrieve the factory default PIN from C_PIN_MSID.
	pub fn default_pin(&mut self) -> Result<Vec<u8>> {
		Ok(self.table_get(C_PIN_MSID, 3)?.get_bytes()?.to_vec())
	}

	/// Revert the Admin SP to factory state, cryptographically erasing the
	/// drive. The TPer tears the session down unilaterally, so the session
	/// IDs are zeroed without a graceful EndSession, and a silent drive is
	/// not an error here.
	pub fn admin_sp_revert(&mut self) -> Result<()> {
		let call = Datum::method(ADMIN_SP, methods::REVERT, vec![]);
		let res = self.sendrecv(&call);
		self.tper_session_id = 0;
		self.host_session_id = 0;
		match res {
			Ok((_, MethodStatus::Success)) => Ok(()),
			Ok((_, status)) => Err(Error::MethodFailed(status)),
			Err(Error::Timeout) => Ok(()),
			Err(e) => Err(e),
		}
	}

	/// Invoke an arbitrary method and return the reply payload.
	pub fn invoke(&mut self, object_uid: u64, method_uid: u64, args: Vec<Datum>) -> Result<Datum> {
		self.call(&Datum::method(object_uid, method_uid, args))
	}

	/// One full exchange with status checking.
	fn call(&mut self, data: &Datum) -> Result<Datum> {
		let (reply, status) = self.sendrecv(data)?;
		if status != MethodStatus::Success {
			return Err(Error::MethodFailed(status));
		}
		Ok(reply)
	}

	fn sendrecv(&mut self, data: &Datum) -> Result<(Datum, MethodStatus)> {
		let res = self.send(data).and_then(|()| self.recv());
		// A broken exchange orphans any open session; there is nothing
		// left to tear down gracefully.
		if let Err(ref e) = res {
			if io_failure(e) {
				self.tper_session_id = 0;
				self.host_session_id = 0;
			}
		}
		res
	}

	fn send(&mut self, data: &Datum) -> Result<()> {
		trace!("opal tx: {:?}", data);

		// Method calls to the session manager don't need a session; all
		// others require one and carry the live IDs.
		let session_mgr = matches!(data, Datum::Method(call) if call.object_uid == SESSION_MGR);
		let (tper_id, host_id) = if session_mgr {
			(0, 0)
		} else if self.host_session_id == 0 {
			return Err(Error::SessionRequired);
		} else {
			(self.tper_session_id as u32, self.host_session_id as u32)
		};

		let payload = data.to_vec()?;
		let frame = packet::wrap(&payload, self.com_id, tper_id, host_id);
		let ceiling = cmp::min(self.max_com_pkt_size as usize, MAX_FRAME);
		if frame.len() > ceiling {
			return Err(Error::EnvelopeOversize {
				size: frame.len(),
				max: self.max_com_pkt_size,
			});
		}

		let blocks = (frame.len() / ATA_BLOCK_SIZE) as u8;
		self.dev.if_send(1, self.com_id, &frame, blocks)
	}

	fn recv(&mut self) -> Result<(Datum, MethodStatus)> {
		let mut block = [0u8; ATA_BLOCK_SIZE];
		for _ in 0..RECV_RETRIES {
			self.dev.if_recv(1, self.com_id, &mut block, 1)?;
			if let Some(payload) = packet::unwrap(&block, self.com_id)? {
				let (reply, status) = datum::decode_response(payload)?;
				trace!("opal rx: {:?} (status {:?})", reply, status);
				return Ok((reply, status));
			}
			thread::sleep(RECV_POLL);
		}
		Err(Error::Timeout)
	}

	/// Probe available TPM security protocols; 0x01 carries TCG Opal.
	fn probe_tpm(&mut self) -> Result<()> {
		debug!("probe TPM security protocols");
		let mut block = [0u8; ATA_BLOCK_SIZE];
		self.dev.if_recv(0, 0, &mut block, 1)?;

		let mut has_opal = false;
		for &id in discovery::parse_protocol_list(&block)? {
			let proto = Protocol::from(id);
			debug!("  ({:#04x}) {}", id, proto.name());
			if proto == Protocol::Tcg(0x01) {
				has_opal = true;
			}
		}
		if !has_opal {
			return Err(Error::NotOpal);
		}
		Ok(())
	}

	/// Level 0 discovery tells us what flavor of Opal the drive speaks.
	/// Features are collected before any is applied: Opal 2.0 wins the
	/// ComID regardless of descriptor order, and only a drive stuck on
	/// Opal 1.0 has its LBA alignment forced back to 1.
	fn probe_level0(&mut self) -> Result<()> {
		debug!("establish level 0 comms - discovery");
		let mut block = [0u8; ATA_BLOCK_SIZE];
		self.dev.if_recv(1, 1, &mut block, 1)?;
		let feats = discovery::parse_level0(&block)?;

		if let Some(geo) = feats.geometry {
			debug!("  geometry: lowest align {}", geo.lowest_align);
			self.lba_align = geo.lowest_align;
		}
		if let Some(v1) = feats.opal1 {
			debug!("  Opal SSC 1.0: base ComID {:#x}", v1.base_com_id);
			self.has_opal1 = true;
			self.com_id = v1.base_com_id;
		}
		if let Some(v2) = feats.opal2 {
			debug!(
				"  Opal SSC 2.0: base ComID {:#x}, {} admins, {} users",
				v2.base_com_id, v2.admin_count, v2.user_count
			);
			self.has_opal2 = true;
			self.com_id = v2.base_com_id;
			self.admin_count = v2.admin_count;
			self.user_count = v2.user_count;
		}
		if self.has_opal1 && !self.has_opal2 {
			// Opal 1.0 doesn't work on large sector drives
			self.lba_align = 1;
		}
		if let Some(locking) = feats.locking {
			debug!("  locking: {:?}", locking);
			self.locking = Some(locking);
		}

		if !self.has_opal1 && !self.has_opal2 {
			return Err(Error::Discovery("no Opal SSC feature descriptor"));
		}
		Ok(())
	}

	/// Knock the ComID protocol stack back to a known state.
	fn reset_comid(&mut self) -> Result<()> {
		debug!("reset ComID {:#x}", self.com_id);
		let req = discovery::comid_reset_request(self.com_id);
		self.dev.if_send(2, self.com_id, &req, 1)?;
		let mut block = [0u8; ATA_BLOCK_SIZE];
		self.dev.if_recv(2, self.com_id, &mut block, 1)?;
		discovery::parse_comid_reset(&block)
	}

	/// Level 1: exchange host properties. The one we need is the maximum
	/// ComPacket size the drive will accept.
	fn probe_level1(&mut self) -> Result<()> {
		debug!("establish level 1 comms - host properties");
		let reply = self.call(&Datum::method(SESSION_MGR, methods::PROPERTIES, vec![]))?;
		let results = reply.results()?;

		if let Some(props) = results.first() {
			for prop in props.list()? {
				let (name, value) = match prop {
					Datum::Named { name, value } => (name, value),
					_ => continue,
				};
				let (name, value) = match (name.get_bytes(), value.atom().and_then(|a| a.get_uint())) {
					(Ok(n), Ok(v)) => (n, v),
					_ => continue,
				};
				trace!("  property {} = {}", String::from_utf8_lossy(name), value);
				if name == b"MaxComPacketSize" {
					self.max_com_pkt_size = value as u32;
					debug!(
						"  max ComPacket size is {} ({} blocks)",
						value,
						value / ATA_BLOCK_SIZE as u64
					);
				}
			}
		}
		Ok(())
	}
}

impl<T: Transport> Drop for Drive<T> {
	fn drop(&mut self) {
		self.logout();
	}
}

/// Hosts may pick any nonzero session ID; the process ID is unique enough.
fn host_session_nonce() -> u64 {
	std::process::id() as u64 | 1
}

/// Errors that mean the exchange itself broke, as opposed to local
/// precondition failures caught before any I/O happened.
fn io_failure(e: &Error) -> bool {
	matches!(
		e,
		Error::Io(_)
			| Error::Ioctl(_)
			| Error::AtaStatus
			| Error::Timeout
			| Error::EnvelopeMismatch(_)
			| Error::Decode(_)
	)
}
