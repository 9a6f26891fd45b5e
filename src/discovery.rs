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

//! Parsers for the discovery phases: the security protocol list from the
//! TPM probe, the Level 0 feature descriptors, and ComID management.

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::uid::features;

/// Security protocols a drive can list in the TPM probe.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Protocol {
	Info,                        // 0x00
	Tcg(u8),                     // 0x01 ... 0x06
	CbCs,                        // 0x07
	TapeDataEncryption,          // 0x20
	DataEncryptionConfiguration, // 0x21
	SaCreationCapabilities,      // 0x40
	IkeV2Scsi,                   // 0x41
	Nvme,                        // 0xea
	JedecUniversalFlashStorage,  // 0xec
	SdCardTrustedFlash,          // 0xed
	Ieee1667,                    // 0xee
	AtaSecurity,                 // 0xef
	Vendor(u8),                  // 0xf0 ... 0xff
	Other(u8),
}

impl From<u8> for Protocol {
	fn from(prot: u8) -> Protocol {
		use self::Protocol::*;
		match prot {
			0x00 => Info,
			0x01..=0x06 => Tcg(prot),
			0x07 => CbCs,
			0x20 => TapeDataEncryption,
			0x21 => DataEncryptionConfiguration,
			0x40 => SaCreationCapabilities,
			0x41 => IkeV2Scsi,
			0xea => Nvme,
			0xec => JedecUniversalFlashStorage,
			0xed => SdCardTrustedFlash,
			0xee => Ieee1667,
			0xef => AtaSecurity,
			0xf0..=0xff => Vendor(prot),
			_ => Other(prot),
		}
	}
}

impl Protocol {
	pub fn name(&self) -> &'static str {
		use self::Protocol::*;
		match *self {
			Info => "Security Protocol Discovery",
			Tcg(_) => "TCG Opal",
			CbCs => "CbCS",
			TapeDataEncryption => "Tape Data Encryption",
			DataEncryptionConfiguration => "Data Encryption Configuration",
			SaCreationCapabilities => "SA Creation Capabilities",
			IkeV2Scsi => "IKEv2-SCSI",
			Nvme => "NVMe",
			JedecUniversalFlashStorage => "JEDEC UFS",
			SdCardTrustedFlash => "SD Card TrustedFlash",
			Ieee1667 => "IEEE P1667",
			AtaSecurity => "ATA Security",
			Vendor(_) => "Vendor Specific",
			Other(_) => "Reserved",
		}
	}
}

/// Extract the protocol ID list from a security protocol 0 response:
/// six reserved bytes, a big-endian count, then one byte per protocol.
pub fn parse_protocol_list(block: &[u8]) -> Result<&[u8]> {
	if block.len() < 8 {
		return Err(Error::Discovery("protocol list shorter than header"));
	}
	let count = BigEndian::read_u16(&block[6..8]) as usize;
	if 8 + count > block.len() {
		return Err(Error::Discovery("protocol list truncated"));
	}
	Ok(&block[8..8 + count])
}

bitflags! {
	/// Capability byte of the TPer feature descriptor.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct TperFlags: u8 {
		const SYNC        = 0x01;
		const ASYNC       = 0x02;
		const ACK_NAK     = 0x04;
		const BUFFER_MGMT = 0x08;
		const STREAMING   = 0x10;
		const COMID_MGMT  = 0x40;
	}
}

bitflags! {
	/// State byte of the Locking feature descriptor.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct LockingFlags: u8 {
		const SUPPORTED        = 0x01;
		const ENABLED          = 0x02;
		const LOCKED           = 0x04;
		const MEDIA_ENCRYPTION = 0x08;
		const MBR_ENABLED      = 0x10;
		const MBR_DONE         = 0x20;
	}
}

/// Geometry reporting feature.
#[derive(Debug, Clone, Copy, Default)]
pub struct Geometry {
	pub align_required: bool,
	pub lba_size: u32,
	pub align_granularity: u64,
	pub lowest_align: u64,
}

/// Opal SSC 1.0 feature.
#[derive(Debug, Clone, Copy)]
pub struct SscV1 {
	pub base_com_id: u16,
	pub com_id_count: u16,
	pub range_crossing: bool,
}

/// Opal SSC 2.0 feature.
#[derive(Debug, Clone, Copy)]
pub struct SscV2 {
	pub base_com_id: u16,
	pub com_id_count: u16,
	pub range_crossing: bool,
	pub admin_count: u16,
	pub user_count: u16,
	pub initial_pin: u8,
	pub revert_pin: u8,
}

/// Single user mode feature.
#[derive(Debug, Clone, Copy)]
pub struct SingleUser {
	pub object_count: u32,
	pub policy: u8,
}

/// Additional DataStore tables feature.
#[derive(Debug, Clone, Copy)]
pub struct DataStore {
	pub max_tables: u16,
	pub max_size: u32,
	pub alignment: u32,
}

/// Everything a Level 0 discovery response can tell us. Collected in full
/// before any field is applied, so descriptor order cannot matter.
#[derive(Debug, Default)]
pub struct FeatureSet {
	pub tper: Option<TperFlags>,
	pub locking: Option<LockingFlags>,
	pub geometry: Option<Geometry>,
	pub opal1: Option<SscV1>,
	pub single_user: Option<SingleUser>,
	pub datastore: Option<DataStore>,
	pub opal2: Option<SscV2>,
}

pub const LEVEL0_HDR_LEN: usize = 48;
const FEAT_HDR_LEN: usize = 4;

/// Walk a Level 0 discovery response: 48 byte header, then feature
/// descriptors of `(code, version, length)` followed by `length` bytes.
/// Unknown codes are skipped.
pub fn parse_level0(data: &[u8]) -> Result<FeatureSet> {
	if data.len() < LEVEL0_HDR_LEN {
		return Err(Error::Discovery("level 0 response shorter than header"));
	}
	let total = 4 + BigEndian::read_u32(&data[0..4]) as usize;
	let major = BigEndian::read_u16(&data[4..6]);
	let minor = BigEndian::read_u16(&data[6..8]);
	if major != 0 || minor != 1 {
		return Err(Error::Discovery("unexpected level 0 revision"));
	}
	if total > data.len() {
		return Err(Error::Discovery("level 0 length exceeds transfer"));
	}

	let mut feats = FeatureSet::default();
	let mut offset = LEVEL0_HDR_LEN;
	while offset + FEAT_HDR_LEN <= total {
		let code = BigEndian::read_u16(&data[offset..offset + 2]);
		let len = data[offset + 3] as usize;
		let start = offset + FEAT_HDR_LEN;
		if start + len > total {
			return Err(Error::Discovery("feature descriptor truncated"));
		}
		let body = &data[start..start + len];

		match code {
			features::TPER => {
				feats.tper = Some(TperFlags::from_bits_truncate(feat_u8(body, 0)?));
			}
			features::LOCKING => {
				feats.locking = Some(LockingFlags::from_bits_truncate(feat_u8(body, 0)?));
			}
			features::GEOMETRY => {
				if body.len() < 28 {
					return Err(Error::Discovery("geometry feature too short"));
				}
				feats.geometry = Some(Geometry {
					align_required: body[0] & 0x01 != 0,
					lba_size: BigEndian::read_u32(&body[8..12]),
					align_granularity: BigEndian::read_u64(&body[12..20]),
					lowest_align: BigEndian::read_u64(&body[20..28]),
				});
			}
			features::OPAL1 => {
				if body.len() < 5 {
					return Err(Error::Discovery("Opal 1.0 feature too short"));
				}
				feats.opal1 = Some(SscV1 {
					base_com_id: BigEndian::read_u16(&body[0..2]),
					com_id_count: BigEndian::read_u16(&body[2..4]),
					range_crossing: body[4] & 0x01 != 0,
				});
			}
			features::SINGLE_USER => {
				if body.len() < 5 {
					return Err(Error::Discovery("single user feature too short"));
				}
				feats.single_user = Some(SingleUser {
					object_count: BigEndian::read_u32(&body[0..4]),
					policy: body[4],
				});
			}
			features::DATASTORE => {
				if body.len() < 12 {
					return Err(Error::Discovery("DataStore feature too short"));
				}
				feats.datastore = Some(DataStore {
					max_tables: BigEndian::read_u16(&body[2..4]),
					max_size: BigEndian::read_u32(&body[4..8]),
					alignment: BigEndian::read_u32(&body[8..12]),
				});
			}
			features::OPAL2 => {
				if body.len() < 11 {
					return Err(Error::Discovery("Opal 2.0 feature too short"));
				}
				feats.opal2 = Some(SscV2 {
					base_com_id: BigEndian::read_u16(&body[0..2]),
					com_id_count: BigEndian::read_u16(&body[2..4]),
					range_crossing: body[4] & 0x01 != 0,
					admin_count: BigEndian::read_u16(&body[5..7]),
					user_count: BigEndian::read_u16(&body[7..9]),
					initial_pin: body[9],
					revert_pin: body[10],
				});
			}
			_ => {} // SSCs, vendor specific, reserved
		}

		offset = start + len;
	}
	Ok(feats)
}

fn feat_u8(body: &[u8], idx: usize) -> Result<u8> {
	body.get(idx)
		.copied()
		.ok_or(Error::Discovery("feature descriptor too short"))
}

/// ComID management request code for a protocol stack reset.
pub const STACK_RESET: u32 = 0x02;

/// Build a ComID stack reset request block.
pub fn comid_reset_request(com_id: u16) -> Vec<u8> {
	let mut block = vec![0u8; crate::ata::ATA_BLOCK_SIZE];
	BigEndian::write_u16(&mut block[0..2], com_id);
	BigEndian::write_u32(&mut block[4..8], STACK_RESET);
	block
}

/// Check a ComID stack reset response: four bytes of available data, all
/// zero, mean the reset went through.
pub fn parse_comid_reset(block: &[u8]) -> Result<()> {
	if block.len() < 16 {
		return Err(Error::Discovery("ComID reset response truncated"));
	}
	let avail = BigEndian::read_u16(&block[10..12]);
	let failed = BigEndian::read_u32(&block[12..16]);
	if avail != 4 || failed != 0 {
		return Err(Error::Discovery("cannot reset ComID"));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn feature(code: u16, body: &[u8]) -> Vec<u8> {
		let mut buf = vec![0u8; 4];
		BigEndian::write_u16(&mut buf[0..2], code);
		buf[2] = 0x10; // version 1
		buf[3] = body.len() as u8;
		buf.extend_from_slice(body);
		buf
	}

	fn level0_block(feats: &[Vec<u8>]) -> Vec<u8> {
		let mut block = vec![0u8; 512];
		let mut offset = LEVEL0_HDR_LEN;
		for feat in feats {
			block[offset..offset + feat.len()].copy_from_slice(feat);
			offset += feat.len();
		}
		BigEndian::write_u32(&mut block[0..4], (offset - 4) as u32);
		BigEndian::write_u16(&mut block[6..8], 1); // minor = 1
		block
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

	#[test]
	fn parses_opal2_and_geometry() {
		let block = level0_block(&[
			feature(features::TPER, &[0x01]),
			feature(features::LOCKING, &[0x07]),
			feature(features::GEOMETRY, &geometry_body(8)),
			feature(features::OPAL2, &opal2_body(0x07fe, 4, 8)),
		]);
		let feats = parse_level0(&block).unwrap();
		assert!(feats.tper.unwrap().contains(TperFlags::SYNC));
		let locking = feats.locking.unwrap();
		assert!(locking.contains(LockingFlags::LOCKED));
		assert!(!locking.contains(LockingFlags::MBR_DONE));
		assert_eq!(feats.geometry.unwrap().lowest_align, 8);
		let opal2 = feats.opal2.unwrap();
		assert_eq!(opal2.base_com_id, 0x07fe);
		assert_eq!(opal2.admin_count, 4);
		assert_eq!(opal2.user_count, 8);
		assert!(feats.opal1.is_none());
	}

	#[test]
	fn unknown_features_skipped() {
		let block = level0_block(&[
			feature(0x1000, &[0xde, 0xad]),
			feature(features::OPAL2, &opal2_body(0x07fe, 4, 8)),
			feature(0xc001, &[0xbe, 0xef]),
		]);
		let feats = parse_level0(&block).unwrap();
		assert!(feats.opal2.is_some());
	}

	#[test]
	fn bad_revision_rejected() {
		let mut block = level0_block(&[]);
		BigEndian::write_u16(&mut block[6..8], 2);
		assert!(matches!(parse_level0(&block), Err(Error::Discovery(_))));
	}

	#[test]
	fn truncated_descriptor_rejected() {
		let mut block = level0_block(&[feature(features::TPER, &[0x01])]);
		// Claim a descriptor running past the reported total
		block[LEVEL0_HDR_LEN + 3] = 0xff;
		assert!(matches!(parse_level0(&block), Err(Error::Discovery(_))));
	}

	#[test]
	fn short_response_rejected() {
		assert!(parse_level0(&[0u8; 16]).is_err());
	}

	#[test]
	fn protocol_list() {
		let mut block = vec![0u8; 512];
		BigEndian::write_u16(&mut block[6..8], 3);
		block[8..11].copy_from_slice(&[0x00, 0x01, 0xef]);
		let list = parse_protocol_list(&block).unwrap();
		assert_eq!(list, [0x00, 0x01, 0xef]);
		assert_eq!(Protocol::from(list[1]), Protocol::Tcg(1));
		assert_eq!(Protocol::from(0xef), Protocol::AtaSecurity);
		assert_eq!(Protocol::from(0xf2), Protocol::Vendor(0xf2));
	}

	#[test]
	fn comid_reset_roundtrip() {
		let req = comid_reset_request(0x07fe);
		assert_eq!(&req[0..2], [0x07, 0xfe]);
		assert_eq!(&req[4..8], [0x00, 0x00, 0x00, 0x02]);

		let mut resp = vec![0u8; 512];
		BigEndian::write_u16(&mut resp[10..12], 4);
		assert!(parse_comid_reset(&resp).is_ok());

		BigEndian::write_u32(&mut resp[12..16], 1);
		assert!(parse_comid_reset(&resp).is_err());

		let zeroed = vec![0u8; 512];
		assert!(parse_comid_reset(&zeroed).is_err());
	}
}
