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

//! Host-side library speaking TCG Opal to self-encrypting ATA drives:
//! credential based unlock, locking range administration, MBR shadow
//! control and cryptographic erase.
//!
//! The crate is layered the way the protocol is:
//!
//! - [`atom`]: the four atom encodings of the Opal data stream
//! - [`datum`]: aggregate items (named pairs, lists, method calls)
//! - [`packet`]: the ComPacket/Packet/SubPacket envelope
//! - [`ata`]: IF-SEND/IF-RECV over the Linux SG_IO pass-through
//! - [`discovery`]: Level 0/1 discovery and ComID management
//! - [`drive`]: session lifecycle and table access
//! - [`uid`]: well-known object and method UIDs
//!
//! All cryptography happens on the drive; the host side is plumbing. A
//! [`drive::Drive`] owns its transport and at most one session, and is
//! strictly synchronous: receives poll the drive's "not ready" answer at
//! 10 ms intervals with a 5 second budget.

pub mod ata;
pub mod atom;
pub mod datum;
pub mod discovery;
pub mod drive;
pub mod error;
pub mod packet;
pub mod uid;

pub use ata::{AtaDrive, Transport};
pub use atom::Atom;
pub use datum::{Datum, MethodCall, MethodStatus};
pub use drive::Drive;
pub use error::{DecodeError, Error, Result};
