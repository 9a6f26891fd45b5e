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

use std::fs::File;
use std::io::{self, IsTerminal, Read};
use std::os::unix::fs::FileTypeExt;

use serde::Deserialize;

use opal_ata_security::datum::MethodStatus;
use opal_ata_security::drive::Drive;
use opal_ata_security::uid::{
	ADMIN_BASE, ADMIN_SP, C_PIN_ADMIN_BASE, C_PIN_USER_BASE, LBA_RANGE_GLOBAL, LOCKING_SP,
	MBR_CONTROL, SID, USER_BASE,
};
use opal_ata_security::{AtaDrive, Atom, Error, Result};

const USAGE: &str = "
Usage:
	opal-ata-security query <dev>
	opal-ata-security unlock [--user=<user>] [--pin-file=<file>|--tries=<num>] <dev>
	opal-ata-security lock [--user=<user>] [--pin-file=<file>] <dev>
	opal-ata-security set-pin [--user=<user>] [--pin-file=<file>] <dev>
	opal-ata-security wipe [--msid|--pin-file=<file>] <dev>
	opal-ata-security --help

Options:
	-u <user>, --user=<user>       Locking SP authority, adminN or userN [default: admin1]
	-i <file>, --pin-file=<file>   Read the PIN from <file> instead of stdin
	-t <num>, --tries=<num>        When reading from stdin, try unlocking <num> times
	--msid                         Authenticate with the drive's factory MSID PIN
";

#[derive(Deserialize, Debug)]
struct Args {
	cmd_query: bool,
	cmd_unlock: bool,
	cmd_lock: bool,
	cmd_set_pin: bool,
	cmd_wipe: bool,
	arg_dev: String,
	flag_user: String,
	flag_pin_file: Option<String>,
	flag_tries: Option<u8>,
	flag_msid: bool,
}

/// Locking SP authorities come in two patterns, adminN and userN. Returns
/// the authority UID and the matching C_PIN row.
fn lookup_user(user: &str) -> Result<(u64, u64)> {
	let (bases, num) = if let Some(num) = user.strip_prefix("admin") {
		((ADMIN_BASE, C_PIN_ADMIN_BASE), num)
	} else if let Some(num) = user.strip_prefix("user") {
		((USER_BASE, C_PIN_USER_BASE), num)
	} else {
		return Err(Error::InvalidUid);
	};
	let num: u64 = num.parse().map_err(|_| Error::InvalidUid)?;
	if num == 0 {
		return Err(Error::InvalidUid);
	}
	Ok((bases.0 + num, bases.1 + num))
}

fn read_pin_err(
	src: Option<&str>,
	drive: &Drive<AtaDrive>,
	confirm: bool,
) -> io::Result<Vec<u8>> {
	if let Some(src) = src {
		let mut buf = vec![];
		File::open(src)?.read_to_end(&mut buf)?;
		trim_newline(&mut buf);
		return Ok(buf);
	}

	if io::stdin().is_terminal() {
		loop {
			eprint!(
				"Please enter PIN for {} {}:",
				drive.identity().model(),
				drive.identity().serial()
			);
			let pin1 = rpassword::read_password()?;
			if pin1.is_empty() {
				continue;
			}
			if confirm {
				eprint!("Enter PIN again:");
				let pin2 = rpassword::read_password()?;
				if pin1 != pin2 {
					eprintln!("PINs don't match!");
					continue;
				}
			}
			return Ok(pin1.into_bytes());
		}
	} else {
		let mut buf = vec![];
		io::stdin().read_to_end(&mut buf)?;
		trim_newline(&mut buf);
		Ok(buf)
	}
}

fn trim_newline(buf: &mut Vec<u8>) {
	while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
		buf.pop();
	}
}

fn read_pin(src: Option<&str>, drive: &Drive<AtaDrive>, confirm: bool) -> Vec<u8> {
	match read_pin_err(src, drive, confirm) {
		Err(e) => {
			eprintln!("Error trying to read PIN: {}", e);
			std::process::exit(1);
		}
		Ok(v) => v,
	}
}

fn query(drive: &mut Drive<AtaDrive>) {
	println!("model: {}", drive.identity().model());
	println!("serial: {}", drive.identity().serial());
	println!("firmware: {}", drive.identity().firmware());
	println!("opal 1.0: {}", if drive.has_opal1() { "yes" } else { "no" });
	println!("opal 2.0: {}", if drive.has_opal2() { "yes" } else { "no" });
	println!("base comid: {:#06x}", drive.com_id());
	println!("lba alignment: {}", drive.lba_align());
	println!("max compacket: {} bytes", drive.max_com_pkt_size());
	println!("locking sp admins: {}", drive.max_admins());
	println!("locking sp users: {}", drive.max_users());
	if let Some(locking) = drive.locking_state() {
		use opal_ata_security::discovery::LockingFlags;
		println!(
			"locking: supported {} enabled {} locked {}",
			locking.contains(LockingFlags::SUPPORTED) as u8,
			locking.contains(LockingFlags::ENABLED) as u8,
			locking.contains(LockingFlags::LOCKED) as u8,
		);
		println!(
			"mbr shadow: enabled {} done {}",
			locking.contains(LockingFlags::MBR_ENABLED) as u8,
			locking.contains(LockingFlags::MBR_DONE) as u8,
		);
	}

	// The factory PIN is readable anonymously; show it like the drive
	// label would
	match drive
		.login_anon(ADMIN_SP)
		.and_then(|()| drive.default_pin())
	{
		Ok(pin) => println!("msid pin: {}", String::from_utf8_lossy(&pin)),
		Err(e) => eprintln!("Unable to read MSID PIN: {}", e),
	}
	drive.logout();
}

fn unlock(drive: &mut Drive<AtaDrive>, auth_uid: u64, pin: &[u8]) -> Result<()> {
	drive.login(LOCKING_SP, auth_uid, pin)?;
	// We are "Done"(2) with the MBR shadow (1 -> hide it)
	drive.table_set(MBR_CONTROL, 2, Atom::uint(1))?;
	// Clear "Read Lock"(7) and "Write Lock"(8) on the global range
	drive.table_set(LBA_RANGE_GLOBAL, 7, Atom::uint(0))?;
	drive.table_set(LBA_RANGE_GLOBAL, 8, Atom::uint(0))?;
	drive.logout();
	Ok(())
}

fn lock(drive: &mut Drive<AtaDrive>, auth_uid: u64, pin: &[u8]) -> Result<()> {
	drive.login(LOCKING_SP, auth_uid, pin)?;
	drive.table_set(LBA_RANGE_GLOBAL, 7, Atom::uint(1))?;
	drive.table_set(LBA_RANGE_GLOBAL, 8, Atom::uint(1))?;
	// Re-arm the MBR shadow for the next boot
	drive.table_set(MBR_CONTROL, 2, Atom::uint(0))?;
	drive.logout();
	Ok(())
}

fn set_pin(drive: &mut Drive<AtaDrive>, auth_uid: u64, c_pin_uid: u64, args: &Args) -> Result<()> {
	let old = read_pin(args.flag_pin_file.as_deref(), drive, false);
	drive.login(LOCKING_SP, auth_uid, &old)?;
	eprintln!("Enter the new PIN.");
	let new = read_pin(None, drive, true);
	// PIN lives in column 3 of the credential row
	drive.table_set(c_pin_uid, 3, Atom::bytes(new))?;
	drive.logout();
	Ok(())
}

fn wipe(drive: &mut Drive<AtaDrive>, args: &Args) -> Result<()> {
	let pin = if args.flag_msid {
		drive.login_anon(ADMIN_SP)?;
		drive.default_pin()?
	} else {
		read_pin(args.flag_pin_file.as_deref(), drive, false)
	};
	drive.login(ADMIN_SP, SID, &pin)?;
	drive.admin_sp_revert()
}

fn main() {
	env_logger::init();

	let args: Args = docopt::Docopt::new(USAGE)
		.and_then(|d| d.argv(std::env::args()).deserialize())
		.unwrap_or_else(|e| e.exit());

	match std::fs::metadata(&args.arg_dev) {
		Err(e) => {
			eprintln!("Unable to stat {}: {}", args.arg_dev, e);
			return;
		}
		Ok(ref m) if !m.file_type().is_block_device() => {
			eprintln!("{} is not a block device", args.arg_dev);
			return;
		}
		Ok(_) => {}
	}

	let mut drive = match Drive::open(&args.arg_dev) {
		Err(e) => {
			eprintln!("Unable to attach to {}: {}", args.arg_dev, e);
			return;
		}
		Ok(drive) => drive,
	};

	if args.cmd_query {
		query(&mut drive);
		return;
	}

	let (auth_uid, c_pin_uid) = match lookup_user(&args.flag_user) {
		Err(_) => {
			eprintln!("Illegal Locking SP user {:?}", args.flag_user);
			return;
		}
		Ok(uids) => uids,
	};

	let result = if args.cmd_unlock {
		// The library never retries credentials; looping on a rejected
		// PIN is this layer's job.
		let tries = match (&args.flag_pin_file, args.flag_tries) {
			(Some(_), _) => 1,
			(None, Some(0)) => return,
			(None, tries) => tries.unwrap_or(1),
		};
		let mut result = Ok(());
		for attempt in 0..tries {
			let pin = read_pin(args.flag_pin_file.as_deref(), &drive, false);
			eprintln!("Performing unlock...");
			result = unlock(&mut drive, auth_uid, &pin);
			match &result {
				Err(Error::MethodFailed(MethodStatus::NotAuthorized)) if attempt + 1 < tries => {
					eprintln!("Not authorized, try again.");
				}
				_ => break,
			}
		}
		result
	} else if args.cmd_lock {
		let pin = read_pin(args.flag_pin_file.as_deref(), &drive, false);
		eprintln!("Performing lock...");
		lock(&mut drive, auth_uid, &pin)
	} else if args.cmd_set_pin {
		eprintln!("Performing PIN change...");
		set_pin(&mut drive, auth_uid, c_pin_uid, &args)
	} else if args.cmd_wipe {
		eprintln!("Performing Admin SP revert (cryptographic erase)...");
		wipe(&mut drive, &args)
	} else {
		unreachable!()
	};

	if let Err(e) = result {
		eprintln!("There was an error executing the command: {}", e);
	} else {
		eprintln!("Success!");
	}
}
