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

//! TCG Opal data items: atoms plus the aggregate types built from them with
//! sequence and control tokens, such as named pairs, lists and method calls.

use std::result::Result as StdResult;

use crate::atom::Atom;
use crate::error::{DecodeError, Error, Result};

// Sequence tokens
pub const TOK_START_LIST: u8 = 0xf0;
pub const TOK_END_LIST: u8 = 0xf1;
pub const TOK_START_NAME: u8 = 0xf2;
pub const TOK_END_NAME: u8 = 0xf3;

// Control tokens
pub const TOK_CALL: u8 = 0xf8;
pub const TOK_END_OF_DATA: u8 = 0xf9;
pub const TOK_END_SESSION: u8 = 0xfa;
pub const TOK_START_TRANS: u8 = 0xfb;
pub const TOK_END_TRANS: u8 = 0xfc;

/// Status codes trailing every method response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodStatus {
	Success,             // 0x00
	NotAuthorized,       // 0x01
	SpBusy,              // 0x03
	SpFailed,            // 0x04
	SpDisabled,          // 0x05
	SpFrozen,            // 0x06
	NoSessionsAvailable, // 0x07
	UniquenessConflict,  // 0x08
	InsufficientSpace,   // 0x09
	InsufficientRows,    // 0x0a
	InvalidParameter,    // 0x0c
	TperMalfunction,     // 0x0f
	TransactionFailure,  // 0x10
	ResponseOverflow,    // 0x11
	AuthorityLockedOut,  // 0x12
	Unknown(u8),
}

impl From<u8> for MethodStatus {
	fn from(status: u8) -> MethodStatus {
		use self::MethodStatus::*;
		match status {
			0x00 => Success,
			0x01 => NotAuthorized,
			0x03 => SpBusy,
			0x04 => SpFailed,
			0x05 => SpDisabled,
			0x06 => SpFrozen,
			0x07 => NoSessionsAvailable,
			0x08 => UniquenessConflict,
			0x09 => InsufficientSpace,
			0x0a => InsufficientRows,
			0x0c => InvalidParameter,
			0x0f => TperMalfunction,
			0x10 => TransactionFailure,
			0x11 => ResponseOverflow,
			0x12 => AuthorityLockedOut,
			status => Unknown(status),
		}
	}
}

/// A method invocation, or on receive the drive's reply to one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
	pub object_uid: u64,
	pub method_uid: u64,
	pub args: Vec<Datum>,
	pub status: MethodStatus,
}

/// A possibly aggregate item of the Opal data stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Datum {
	/// Placeholder prior to construction. Cannot be encoded.
	#[default]
	Unset,
	Atom(Atom),
	/// Key/value pair
	Named { name: Atom, value: Box<Datum> },
	/// List, possibly empty
	List(Vec<Datum>),
	Method(MethodCall),
	/// End of session indicator
	EndSession,
}

impl From<Atom> for Datum {
	fn from(atom: Atom) -> Datum {
		Datum::Atom(atom)
	}
}

impl Datum {
	pub fn named(name: Atom, value: impl Into<Datum>) -> Datum {
		Datum::Named { name, value: Box::new(value.into()) }
	}

	pub fn method(object_uid: u64, method_uid: u64, args: Vec<Datum>) -> Datum {
		Datum::Method(MethodCall {
			object_uid,
			method_uid,
			args,
			status: MethodStatus::Success,
		})
	}

	pub fn atom(&self) -> Result<&Atom> {
		match self {
			Datum::Atom(a) => Ok(a),
			_ => Err(Error::DatumType("an atom")),
		}
	}

	pub fn list(&self) -> Result<&[Datum]> {
		match self {
			Datum::List(items) => Ok(items),
			_ => Err(Error::DatumType("a list")),
		}
	}

	pub fn name(&self) -> Result<&Atom> {
		match self {
			Datum::Named { name, .. } => Ok(name),
			_ => Err(Error::DatumType("a named pair")),
		}
	}

	pub fn named_value(&self) -> Result<&Datum> {
		match self {
			Datum::Named { value, .. } => Ok(value),
			_ => Err(Error::DatumType("a named pair")),
		}
	}

	pub fn method_call(&self) -> Result<&MethodCall> {
		match self {
			Datum::Method(call) => Ok(call),
			_ => Err(Error::DatumType("a method call")),
		}
	}

	/// Result items of a drive reply: the argument list of a method-call
	/// reply, or the bare list the drive returns within a session.
	pub fn results(&self) -> Result<&[Datum]> {
		match self {
			Datum::Method(call) => Ok(&call.args),
			Datum::List(items) => Ok(items),
			_ => Err(Error::DatumType("a result list")),
		}
	}

	/// Byte count of the datum when encoded.
	pub fn encoded_size(&self) -> usize {
		match self {
			Datum::Unset => 0,
			Datum::Atom(a) => a.encoded_size(),
			Datum::Named { name, value } => 2 + name.encoded_size() + value.encoded_size(),
			Datum::List(items) => 2 + items.iter().map(Datum::encoded_size).sum::<usize>(),
			Datum::Method(call) => {
				let args: usize = call.args.iter().map(Datum::encoded_size).sum();
				// CALL, two UIDs, bracketed args, END_OF_DATA, status list
				1 + 9 + 9 + 2 + args + 1 + 5
			}
			Datum::EndSession => 1,
		}
	}

	/// Encode into a buffer of at least `encoded_size()` bytes.
	pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
		let mut i = 0;
		match self {
			Datum::Unset => return Err(Error::UnsetDatum),
			Datum::Atom(a) => {
				a.check_encodable()?;
				i += a.encode(&mut out[i..]);
			}
			Datum::Named { name, value } => {
				name.check_encodable()?;
				out[i] = TOK_START_NAME;
				i += 1;
				i += name.encode(&mut out[i..]);
				i += value.encode(&mut out[i..])?;
				out[i] = TOK_END_NAME;
				i += 1;
			}
			Datum::List(items) => {
				out[i] = TOK_START_LIST;
				i += 1;
				for item in items {
					i += item.encode(&mut out[i..])?;
				}
				out[i] = TOK_END_LIST;
				i += 1;
			}
			Datum::Method(call) => {
				out[i] = TOK_CALL;
				i += 1;
				i += Atom::uid(call.object_uid).encode(&mut out[i..]);
				i += Atom::uid(call.method_uid).encode(&mut out[i..]);
				out[i] = TOK_START_LIST;
				i += 1;
				for arg in &call.args {
					i += arg.encode(&mut out[i..])?;
				}
				// Expected status and two reserved zeroes
				out[i..i + 7].copy_from_slice(&[
					TOK_END_LIST,
					TOK_END_OF_DATA,
					TOK_START_LIST,
					0x00,
					0x00,
					0x00,
					TOK_END_LIST,
				]);
				i += 7;
			}
			Datum::EndSession => {
				out[i] = TOK_END_SESSION;
				i += 1;
			}
		}
		Ok(i)
	}

	/// Encode into a freshly allocated buffer.
	pub fn to_vec(&self) -> Result<Vec<u8>> {
		let mut buf = vec![0u8; self.encoded_size()];
		let n = self.encode(&mut buf)?;
		buf.truncate(n);
		Ok(buf)
	}

	/// Decode one datum, returning it and the bytes consumed.
	pub fn decode(buf: &[u8]) -> StdResult<(Datum, usize), DecodeError> {
		let b0 = *buf.first().ok_or_else(|| DecodeError::new(0, "datum encoding too short"))?;
		match b0 {
			TOK_START_LIST => {
				let (items, used) = Datum::decode_vector(&buf[1..]).map_err(|e| e.shift(1))?;
				expect_tok(buf, 1 + used, TOK_END_LIST)?;
				Ok((Datum::List(items), used + 2))
			}
			TOK_START_NAME => {
				let mut i = 1;
				let (name, used) = Atom::decode(&buf[i..]).map_err(|e| e.shift(i))?;
				i += used;
				let (value, used) = Datum::decode(&buf[i..]).map_err(|e| e.shift(i))?;
				i += used;
				expect_tok(buf, i, TOK_END_NAME)?;
				Ok((Datum::named(name, value), i + 1))
			}
			TOK_CALL => {
				let mut i = 1;
				let (invoking, used) = Atom::decode(&buf[i..]).map_err(|e| e.shift(i))?;
				let object_uid = invoking
					.get_uid()
					.map_err(|_| DecodeError::new(i, "invoking UID is not a UID atom"))?;
				i += used;
				let (method, used) = Atom::decode(&buf[i..]).map_err(|e| e.shift(i))?;
				let method_uid = method
					.get_uid()
					.map_err(|_| DecodeError::new(i, "method UID is not a UID atom"))?;
				i += used;
				expect_tok(buf, i, TOK_START_LIST)?;
				i += 1;
				let (args, used) = Datum::decode_vector(&buf[i..]).map_err(|e| e.shift(i))?;
				i += used;
				expect_tok(buf, i, TOK_END_LIST)?;
				i += 1;
				let (status, used) = decode_status_trailer(&buf[i..]).map_err(|e| e.shift(i))?;
				i += used;
				Ok((
					Datum::Method(MethodCall { object_uid, method_uid, args, status }),
					i,
				))
			}
			TOK_END_SESSION => Ok((Datum::EndSession, 1)),
			_ => {
				let (atom, used) = Atom::decode(buf)?;
				Ok((Datum::Atom(atom), used))
			}
		}
	}

	/// Decode data items until the buffer runs out or a closing token is
	/// next. The closing token (and anything after it, such as the status
	/// list of a method reply) is intentionally left unconsumed.
	pub fn decode_vector(buf: &[u8]) -> StdResult<(Vec<Datum>, usize), DecodeError> {
		let mut items = Vec::new();
		let mut i = 0;
		while let Some(&next) = buf.get(i) {
			if next == TOK_END_LIST || next == TOK_END_OF_DATA {
				break;
			}
			let (item, used) = Datum::decode(&buf[i..]).map_err(|e| e.shift(i))?;
			items.push(item);
			i += used;
		}
		Ok((items, i))
	}
}

/// Parse the `END_OF_DATA START_LIST status 0 0 END_LIST` trailer closing
/// every method reply.
pub fn decode_status_trailer(buf: &[u8]) -> StdResult<(MethodStatus, usize), DecodeError> {
	expect_tok(buf, 0, TOK_END_OF_DATA)?;
	expect_tok(buf, 1, TOK_START_LIST)?;
	let mut i = 2;
	let mut status = MethodStatus::Success;
	for n in 0..3 {
		let (atom, used) = Atom::decode(&buf[i..]).map_err(|e| e.shift(i))?;
		let value = atom
			.get_uint()
			.map_err(|_| DecodeError::new(i, "method status is not an integer"))?;
		if n == 0 {
			status = MethodStatus::from(value as u8);
		}
		i += used;
	}
	expect_tok(buf, i, TOK_END_LIST)?;
	Ok((status, i + 1))
}

/// Split a drive reply into its payload and trailing method status. Method
/// call replies carry their own trailer; bare in-session replies are a
/// result list followed by the status trailer.
pub fn decode_response(buf: &[u8]) -> StdResult<(Datum, MethodStatus), DecodeError> {
	match buf.first() {
		Some(&TOK_CALL) => {
			let (datum, _) = Datum::decode(buf)?;
			let status = match datum {
				Datum::Method(ref call) => call.status,
				_ => unreachable!("CALL token decodes to a method"),
			};
			Ok((datum, status))
		}
		Some(&TOK_END_SESSION) => Ok((Datum::EndSession, MethodStatus::Success)),
		_ => {
			let (items, used) = Datum::decode_vector(buf)?;
			let (status, _) = decode_status_trailer(&buf[used..]).map_err(|e| e.shift(used))?;
			Ok((Datum::List(items), status))
		}
	}
}

fn expect_tok(buf: &[u8], idx: usize, tok: u8) -> StdResult<(), DecodeError> {
	match buf.get(idx) {
		Some(&b) if b == tok => Ok(()),
		Some(_) => Err(DecodeError::new(idx, "unexpected token")),
		None => Err(DecodeError::new(idx, "datum encoding too short")),
	}
}
