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

//! IF-SEND/IF-RECV over the Linux SG_IO pass-through, plus the ATA
//! IDENTIFY DEVICE probe run once at attach.

use std::fs::{File, OpenOptions};
use std::mem;
use std::os::raw::c_void;
use std::os::unix::io::{AsRawFd, RawFd};

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::error::{Error, Result};

/// All security payloads travel in whole 512 byte blocks.
pub const ATA_BLOCK_SIZE: usize = 512;

/// Block-level interface to a drive's security endpoints. Both calls
/// operate on whole 512 byte blocks; `bcount` is the block count.
pub trait Transport {
	/// ATA TRUSTED SEND, carrying `data` to the drive TPM.
	fn if_send(&mut self, protocol: u8, comid: u16, data: &[u8], bcount: u8) -> Result<()>;

	/// ATA TRUSTED RECEIVE, filling `data` from the drive TPM.
	fn if_recv(&mut self, protocol: u8, comid: u16, data: &mut [u8], bcount: u8) -> Result<()>;
}

const CMD_TRUSTED_RECEIVE: u8 = 0x5c;
const CMD_TRUSTED_SEND: u8 = 0x5e;
const CMD_IDENTIFY_DEVICE: u8 = 0xec;

/// ATA IDENTIFY DEVICE response.
pub struct IdentifyDevice([u8; ATA_BLOCK_SIZE]);

impl From<[u8; ATA_BLOCK_SIZE]> for IdentifyDevice {
	fn from(array: [u8; ATA_BLOCK_SIZE]) -> Self {
		IdentifyDevice(array)
	}
}

impl IdentifyDevice {
	fn word(&self, idx: usize) -> u16 {
		LittleEndian::read_u16(&self.0[idx * 2..idx * 2 + 2])
	}

	/// ATA strings pack two characters per word, high byte first.
	fn string(&self, words: std::ops::Range<usize>) -> String {
		let mut out = String::new();
		for idx in words {
			let word = self.word(idx);
			for c in [(word >> 8) as u8, word as u8] {
				if c == 0x00 {
					return out.trim().to_string();
				}
				out.push(c as char);
			}
		}
		out.trim().to_string()
	}

	pub fn serial(&self) -> String {
		self.string(10..20)
	}

	pub fn firmware(&self) -> String {
		self.string(23..27)
	}

	pub fn model(&self) -> String {
		self.string(27..47)
	}

	/// Word 48 carries the Trusted Computing fingerprint.
	pub fn trusted_computing(&self) -> bool {
		self.word(48) & 0xc000 == 0x4000
	}

	/// ATA major version bits, word 80. Anything below ATA8 predates the
	/// TPM reporting bit.
	pub fn supports_ata8(&self) -> bool {
		let major = self.word(80);
		major != 0xffff && major & !0x00ff != 0
	}
}

/// A drive reachable through the SCSI/ATA translation layer (eg /dev/sdX),
/// exclusively owned from open to drop.
pub struct AtaDrive {
	file: File,
	identify: IdentifyDevice,
}

impl AtaDrive {
	/// Open the device node, probe IDENTIFY DEVICE, and verify the drive
	/// reports a TPM at all.
	pub fn open(path: &str) -> Result<AtaDrive> {
		// First, verify libata isn't misconfigured
		check_libata()?;

		debug!("opening {}", path);
		let file = OpenOptions::new().read(true).write(true).open(path)?;

		debug!("probe ATA identify");
		let mut buf = [0u8; ATA_BLOCK_SIZE];
		ata_exec(
			file.as_raw_fd(),
			Ata12Cmd { command: CMD_IDENTIFY_DEVICE, ..Default::default() },
			sgio::SG_DXFER_FROM_DEV,
			buf.as_mut_ptr() as *mut c_void,
			ATA_BLOCK_SIZE as u32,
			1,
		)?;
		let identify = IdentifyDevice::from(buf);

		if !identify.supports_ata8() {
			// Too old to report TPM presence
			return Err(Error::NotOpal);
		}
		if !identify.trusted_computing() {
			return Err(Error::NotOpal);
		}
		debug!(
			"found TPM fingerprint on {} (serial {}, firmware {})",
			identify.model(),
			identify.serial(),
			identify.firmware()
		);

		Ok(AtaDrive { file, identify })
	}

	pub fn identify(&self) -> &IdentifyDevice {
		&self.identify
	}
}

impl Transport for AtaDrive {
	fn if_send(&mut self, protocol: u8, comid: u16, data: &[u8], bcount: u8) -> Result<()> {
		ata_exec(
			self.file.as_raw_fd(),
			Ata12Cmd {
				feature: protocol,
				count: bcount,
				lba_mid: comid as u8,
				lba_high: (comid >> 8) as u8,
				command: CMD_TRUSTED_SEND,
				..Default::default()
			},
			sgio::SG_DXFER_TO_DEV,
			data.as_ptr() as *mut c_void,
			bcount as u32 * ATA_BLOCK_SIZE as u32,
			5,
		)
	}

	fn if_recv(&mut self, protocol: u8, comid: u16, data: &mut [u8], bcount: u8) -> Result<()> {
		ata_exec(
			self.file.as_raw_fd(),
			Ata12Cmd {
				feature: protocol,
				count: bcount,
				lba_mid: comid as u8,
				lba_high: (comid >> 8) as u8,
				command: CMD_TRUSTED_RECEIVE,
				..Default::default()
			},
			sgio::SG_DXFER_FROM_DEV,
			data.as_mut_ptr() as *mut c_void,
			bcount as u32 * ATA_BLOCK_SIZE as u32,
			5,
		)
	}
}

/// Check libata (Linux ATA layer) for misconfiguration. Best effort, /sys
/// may not be mounted.
fn check_libata() -> Result<()> {
	if let Ok(value) = std::fs::read_to_string("/sys/module/libata/parameters/allow_tpm") {
		if value.trim_start().starts_with('0') {
			return Err(Error::TpmBlocked);
		}
	}
	Ok(())
}

/// ATA command register block, bytes 3..10 of the ATA-12 pass-through CDB.
#[derive(Default, Clone, Copy)]
struct Ata12Cmd {
	feature: u8,
	count: u8,
	lba_low: u8,
	lba_mid: u8,
	lba_high: u8,
	device: u8,
	command: u8,
}

/// Execute an ATA-12 command through the SCSI/ATA translation layer using
/// the SG_IO ioctl.
fn ata_exec(
	fd: RawFd,
	cmd: Ata12Cmd,
	dir: i32,
	data: *mut c_void,
	dxfer_len: u32,
	wait_secs: u32,
) -> Result<()> {
	let mut cdb = [0u8; 12];
	let mut sense = [0u8; 32];

	// Byte 0: ATA-12 pass through
	cdb[0] = 0xa1;
	// Byte 1: ATA protocol, byte 2: check condition, blocks, direction
	match dir {
		sgio::SG_DXFER_NONE => {
			cdb[1] = 3 << 1; // ATA no data
			cdb[2] = 0x20;
		}
		sgio::SG_DXFER_FROM_DEV => {
			cdb[1] = 4 << 1; // ATA PIO-in
			cdb[2] = 0x2e;
		}
		sgio::SG_DXFER_TO_DEV => {
			cdb[1] = 5 << 1; // ATA PIO-out
			cdb[2] = 0x26;
		}
		_ => unreachable!("invalid ATA direction"),
	}
	cdb[3] = cmd.feature;
	cdb[4] = cmd.count;
	cdb[5] = cmd.lba_low;
	cdb[6] = cmd.lba_mid;
	cdb[7] = cmd.lba_high;
	cdb[8] = cmd.device;
	cdb[9] = cmd.command;

	let mut sg: sgio::SgIoHdr = unsafe { mem::zeroed() };
	sg.interface_id = 'S' as i32;
	sg.cmdp = cdb.as_mut_ptr();
	sg.cmd_len = cdb.len() as u8;
	sg.dxferp = data;
	sg.dxfer_len = dxfer_len;
	sg.dxfer_direction = dir;
	sg.sbp = sense.as_mut_ptr();
	sg.mx_sb_len = sense.len() as u8;
	sg.timeout = wait_secs * 1000;

	unsafe {
		sgio::sg_io(fd, &mut sg)?;
	}

	// Expect a descriptor-format ATA status return with no error bits
	if sense[0] != 0x72 || sense[7] != 0x0e || sense[8] != 0x09 || sense[9] != 0x0c
		|| sense[10] != 0x00
	{
		return Err(Error::AtaStatus);
	}
	Ok(())
}

mod sgio {
	use std::os::raw::{c_int, c_uchar, c_uint, c_ushort, c_void};

	pub const SG_DXFER_NONE: c_int = -1;
	pub const SG_DXFER_TO_DEV: c_int = -2;
	pub const SG_DXFER_FROM_DEV: c_int = -3;

	// struct sg_io_hdr from scsi/sg.h
	#[repr(C)]
	pub struct SgIoHdr {
		pub interface_id: c_int,
		pub dxfer_direction: c_int,
		pub cmd_len: c_uchar,
		pub mx_sb_len: c_uchar,
		pub iovec_count: c_ushort,
		pub dxfer_len: c_uint,
		pub dxferp: *mut c_void,
		pub cmdp: *mut c_uchar,
		pub sbp: *mut c_uchar,
		pub timeout: c_uint,
		pub flags: c_uint,
		pub pack_id: c_int,
		pub usr_ptr: *mut c_void,
		pub status: c_uchar,
		pub masked_status: c_uchar,
		pub msg_status: c_uchar,
		pub sb_len_wr: c_uchar,
		pub host_status: c_ushort,
		pub driver_status: c_ushort,
		pub resid: c_int,
		pub duration: c_uint,
		pub info: c_uint,
	}

	nix::ioctl_readwrite_bad!(sg_io, 0x2285, SgIoHdr);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn identify_with_strings() -> IdentifyDevice {
		let mut raw = [0u8; ATA_BLOCK_SIZE];
		// Model at words 27..47, two swapped characters per word
		let model = b"Example Drive 9000  ";
		for (i, pair) in model.chunks(2).enumerate() {
			raw[(27 + i) * 2] = pair[1];
			raw[(27 + i) * 2 + 1] = pair[0];
		}
		let serial = b"S3RI4L  ";
		for (i, pair) in serial.chunks(2).enumerate() {
			raw[(10 + i) * 2] = pair[1];
			raw[(10 + i) * 2 + 1] = pair[0];
		}
		// Word 48: trusted computing supported
		LittleEndian::write_u16(&mut raw[48 * 2..48 * 2 + 2], 0x4001);
		// Word 80: ATA8 major version
		LittleEndian::write_u16(&mut raw[80 * 2..80 * 2 + 2], 0x01f0);
		IdentifyDevice::from(raw)
	}

	#[test]
	fn identify_strings_unswap() {
		let id = identify_with_strings();
		assert_eq!(id.model(), "Example Drive 9000");
		assert_eq!(id.serial(), "S3RI4L");
	}

	#[test]
	fn identify_capability_words() {
		let id = identify_with_strings();
		assert!(id.trusted_computing());
		assert!(id.supports_ata8());

		let blank = IdentifyDevice::from([0u8; ATA_BLOCK_SIZE]);
		assert!(!blank.trusted_computing());
		assert!(!blank.supports_ata8());
	}
}
