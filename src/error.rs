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

//! Error types shared across the crate.

use thiserror::Error;

use crate::datum::MethodStatus;

/// Main error type for all Opal operations.
#[derive(Debug, Error)]
pub enum Error {
	/// Drive lacks the TCG Opal security protocol or the TPM fingerprint.
	#[error("drive does not support TCG Opal")]
	NotOpal,

	/// Level 0 discovery or ComID management returned something unusable.
	#[error("discovery failed: {0}")]
	Discovery(&'static str),

	/// Linux libata layer is configured to reject TPM commands.
	#[error("libata blocks TPM calls (boot with libata.allow_tpm=1)")]
	TpmBlocked,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// The SG_IO ioctl itself failed.
	#[error("SG_IO ioctl failed: {0}")]
	Ioctl(#[from] nix::Error),

	/// The ATA command completed with bad sense data.
	#[error("ATA command failed (bad sense data)")]
	AtaStatus,

	/// Outgoing ComPacket would exceed the drive's negotiated ceiling.
	#[error("ComPacket of {size} bytes exceeds drive maximum of {max}")]
	EnvelopeOversize { size: usize, max: u32 },

	/// ComID echo wrong or header lengths inconsistent.
	#[error("malformed drive response: {0}")]
	EnvelopeMismatch(&'static str),

	/// Receive polling budget exhausted.
	#[error("timed out waiting for drive response")]
	Timeout,

	/// Malformed atom or datum in a drive response.
	#[error("{0}")]
	Decode(#[from] DecodeError),

	/// Byte sequence too large for any atom encoding.
	#[error("{0} byte payload too large for atom encoding")]
	AtomOversize(usize),

	/// Attempt to encode a datum still under construction.
	#[error("cannot encode unset datum")]
	UnsetDatum,

	/// Non-zero status on a method call.
	#[error("method failed: {0:?}")]
	MethodFailed(MethodStatus),

	/// Non-session-manager call attempted with no session open.
	#[error("no session open")]
	SessionRequired,

	/// Atom is not an 8 byte short binary atom.
	#[error("atom is not a valid UID")]
	InvalidUid,

	/// Atom holds a different type than requested.
	#[error("atom is not {0}")]
	AtomType(&'static str),

	/// Datum holds a different variant than requested.
	#[error("datum is not {0}")]
	DatumType(&'static str),
}

/// Decode failure, carrying the byte offset where parsing stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decode error at offset {offset}: {reason}")]
pub struct DecodeError {
	pub offset: usize,
	pub reason: &'static str,
}

impl DecodeError {
	pub(crate) fn new(offset: usize, reason: &'static str) -> DecodeError {
		DecodeError { offset, reason }
	}

	/// Shift the reported offset when the failure came from a subslice.
	pub(crate) fn shift(mut self, base: usize) -> DecodeError {
		self.offset += base;
		self
	}
}

pub type Result<T> = std::result::Result<T, Error>;
