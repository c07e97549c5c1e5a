//! The USTAR filesystem: a tar-format archive presented through vnodes.
//!
//! An inode is the index of a 512 byte header record within the archive;
//! resolving a path is a linear scan over the headers. The layer supports
//! every operation except creating new entries, which the format cannot
//! express without rewriting the archive.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use num_enum::TryFromPrimitive;

use crate::drivers::blk::BlockDevice;
use crate::error::{KernelError, Result};
use crate::fs::{AccessPermission, DirectoryEntry, FileAttr, NodeKind, Vnode};

/// Size of one archive record.
pub const BLOCK_SIZE: usize = 512;

const HDR_FILENAME: usize = 0;
const HDR_FILENAME_LEN: usize = 100;
const HDR_MODE: usize = 100;
const HDR_UID: usize = 108;
const HDR_GID: usize = 116;
const HDR_SIZE: usize = 124;
const HDR_MTIME: usize = 136;
const HDR_TYPEFLAG: usize = 156;
const HDR_MAGIC: usize = 257;
const HDR_OWNER: usize = 265;
const HDR_GROUP: usize = 297;

/// Magic at offset 257 of every header record.
const USTAR_MAGIC: &[u8; 6] = b"ustar ";

/// Entry type tags of the USTAR format.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
#[allow(dead_code)]
pub enum TypeFlag {
	Normal = b'0',
	HardLink = b'1',
	SymLink = b'2',
	CharDevice = b'3',
	BlockDevice = b'4',
	Directory = b'5',
	Fifo = b'6',
	ContiguousFile = b'7',
}

/// One 512 byte header record.
struct HeaderBlock([u8; BLOCK_SIZE]);

impl HeaderBlock {
	const fn empty() -> Self {
		Self([0; BLOCK_SIZE])
	}

	fn magic_ok(&self) -> bool {
		&self.0[HDR_MAGIC..HDR_MAGIC + USTAR_MAGIC.len()] == USTAR_MAGIC
	}

	/// A zeroed first filename byte marks a deleted entry.
	fn is_deleted(&self) -> bool {
		self.0[HDR_FILENAME] == 0
	}

	fn filename(&self) -> &str {
		let field = &self.0[HDR_FILENAME..HDR_FILENAME + HDR_FILENAME_LEN];
		let len = field.iter().position(|&b| b == 0).unwrap_or(HDR_FILENAME_LEN);
		core::str::from_utf8(&field[..len]).unwrap_or("")
	}

	fn set_filename(&mut self, name: &str) -> Result<()> {
		if name.len() > HDR_FILENAME_LEN {
			return Err(KernelError::NameTooLong);
		}

		let field = &mut self.0[HDR_FILENAME..HDR_FILENAME + HDR_FILENAME_LEN];
		field.fill(0);
		field[..name.len()].copy_from_slice(name.as_bytes());
		Ok(())
	}

	fn clear_filename(&mut self) {
		self.0[HDR_FILENAME..HDR_FILENAME + HDR_FILENAME_LEN].fill(0);
	}

	fn size(&self) -> usize {
		oct2uint(&self.0[HDR_SIZE..HDR_SIZE + 12]) as usize
	}

	fn set_size(&mut self, size: usize) {
		uint2oct(&mut self.0[HDR_SIZE..HDR_SIZE + 12], size as u64);
	}

	fn mode(&self) -> u64 {
		oct2uint(&self.0[HDR_MODE..HDR_MODE + 8])
	}

	fn uid(&self) -> u64 {
		oct2uint(&self.0[HDR_UID..HDR_UID + 8])
	}

	fn gid(&self) -> u64 {
		oct2uint(&self.0[HDR_GID..HDR_GID + 8])
	}

	fn mtime(&self) -> u64 {
		oct2uint(&self.0[HDR_MTIME..HDR_MTIME + 12])
	}

	fn set_mtime(&mut self, mtime: u64) {
		uint2oct(&mut self.0[HDR_MTIME..HDR_MTIME + 12], mtime);
	}

	fn owner(&self) -> &str {
		read_string_field(&self.0[HDR_OWNER..HDR_OWNER + 32])
	}

	fn group(&self) -> &str {
		read_string_field(&self.0[HDR_GROUP..HDR_GROUP + 32])
	}

	fn kind(&self) -> Option<NodeKind> {
		// A NUL tag is the pre-POSIX spelling of a regular file.
		match self.0[HDR_TYPEFLAG] {
			0 => Some(NodeKind::File),
			tag => match TypeFlag::try_from(tag).ok()? {
				TypeFlag::Normal | TypeFlag::ContiguousFile => Some(NodeKind::File),
				TypeFlag::HardLink => Some(NodeKind::HardLink),
				TypeFlag::SymLink => Some(NodeKind::SymLink),
				TypeFlag::Directory => Some(NodeKind::Directory),
				_ => None,
			},
		}
	}

	/// Distance to the next header in 512 byte records: one for the header
	/// itself plus the data rounded up.
	fn stride(&self) -> usize {
		1 + self.size().div_ceil(BLOCK_SIZE)
	}
}

fn read_string_field(field: &[u8]) -> &str {
	let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
	core::str::from_utf8(&field[..len]).unwrap_or("")
}

/// Strip the leading slash callers use for absolute paths; archive members
/// are stored without one.
fn normalize(path: &str) -> &str {
	path.strip_prefix('/').unwrap_or(path)
}

/// Strip the trailing slash directory entries are stored with.
fn trim_slash(name: &str) -> &str {
	name.strip_suffix('/').unwrap_or(name)
}

fn names_match(member: &str, wanted: &str) -> bool {
	trim_slash(member) == trim_slash(wanted)
}

/// Parent path of a normalized name, `None` for top-level entries.
fn parent_of(name: &str) -> Option<&str> {
	trim_slash(name).rsplit_once('/').map(|(parent, _)| parent)
}

fn basename(name: &str) -> &str {
	let name = trim_slash(name);
	name.rsplit_once('/').map_or(name, |(_, base)| base)
}

/// The slice of a block device holding the archive.
struct Partition {
	device: Arc<dyn BlockDevice>,
	/// First device block of the archive.
	first_block: usize,
}

/// A mounted USTAR archive.
pub struct Ustar {
	partition: Partition,
}

impl Ustar {
	/// Mount the archive starting at `first_block` of `device`.
	///
	/// The device block size must be a divisor or a multiple of the 512
	/// byte record size; anything else fails with [`KernelError::Align`].
	/// The first record must carry the USTAR magic.
	pub fn mount(device: Arc<dyn BlockDevice>, first_block: usize) -> Result<Self> {
		let device_block_size = device.block_size();
		if device_block_size == 0
			|| (BLOCK_SIZE % device_block_size != 0 && device_block_size % BLOCK_SIZE != 0)
		{
			return Err(KernelError::Align);
		}

		let filesystem = Self {
			partition: Partition {
				device,
				first_block,
			},
		};

		// Probing the first header also validates the partition type.
		filesystem.read_header(0)?;
		Ok(filesystem)
	}

	/// Unmount the archive, pushing everything down to the medium.
	pub fn umount(self) -> Result<()> {
		self.partition.device.flush_blocks(self.partition.first_block, 0, 0)
	}

	/// Translate an archive record index plus byte offset into a device
	/// access.
	fn device_position(&self, record: usize, offset: usize) -> (usize, usize) {
		let byte = record * BLOCK_SIZE + offset;
		let device_block_size = self.partition.device.block_size();

		(
			self.partition.first_block + byte / device_block_size,
			byte % device_block_size,
		)
	}

	fn read_archive(&self, record: usize, buffer: &mut [u8], byte_count: usize, offset: usize) -> Result<()> {
		let (block_id, first_block_offset) = self.device_position(record, offset);
		self.partition
			.device
			.read_blocks(block_id, buffer, byte_count, first_block_offset)
	}

	fn write_archive(&self, record: usize, buffer: &[u8], byte_count: usize, offset: usize) -> Result<()> {
		let (block_id, first_block_offset) = self.device_position(record, offset);
		self.partition
			.device
			.write_blocks(block_id, buffer, byte_count, first_block_offset)?;
		self.partition
			.device
			.flush_blocks(block_id, byte_count, first_block_offset)
	}

	/// Read and validate the header record at `inode`.
	fn read_header(&self, inode: usize) -> Result<HeaderBlock> {
		let mut header = HeaderBlock::empty();
		self.read_archive(inode, &mut header.0, BLOCK_SIZE, 0)?;

		if !header.magic_ok() {
			return Err(KernelError::WrongPartitionType);
		}

		Ok(header)
	}

	fn write_header(&self, inode: usize, header: &HeaderBlock) -> Result<()> {
		self.write_archive(inode, &header.0, BLOCK_SIZE, 0)
	}

	/// Walk the archive headers. Terminates at the first record without
	/// the magic (the zero padding at the end of every tar archive) or at
	/// the end of the device.
	fn entries(&self) -> Result<Vec<(usize, HeaderBlock)>> {
		let mut entries = Vec::new();
		let mut inode = 0;

		loop {
			let mut header = HeaderBlock::empty();
			if self.read_archive(inode, &mut header.0, BLOCK_SIZE, 0).is_err() {
				break;
			}
			if !header.magic_ok() {
				break;
			}

			let stride = header.stride();
			if !header.is_deleted() {
				entries.push((inode, header));
			}

			inode += stride;
		}

		Ok(entries)
	}

	/// Resolve a path to its header. Deleted slots are skipped; running
	/// into the archive padding means the file does not exist.
	fn find(&self, path: &str) -> Result<(usize, HeaderBlock)> {
		let wanted = normalize(path);
		let mut inode = 0;

		loop {
			let mut header = HeaderBlock::empty();
			if self.read_archive(inode, &mut header.0, BLOCK_SIZE, 0).is_err() {
				return Err(KernelError::FileNotFound);
			}
			if !header.magic_ok() {
				return Err(KernelError::FileNotFound);
			}

			if !header.is_deleted() && names_match(header.filename(), wanted) {
				return Ok((inode, header));
			}

			inode += header.stride();
		}
	}

	/// Open the file at `path` and hand its vnode to the caller.
	pub fn open(&self, path: &str) -> Result<Vnode> {
		let (inode, header) = self.find(path)?;
		let kind = header.kind().ok_or(KernelError::NotSupported)?;
		let member = header.filename();

		Ok(Vnode {
			path: trim_slash(member).to_string(),
			name: basename(member).to_string(),
			kind,
			mode: AccessPermission::from_bits_truncate(header.mode() as u32),
			uid: header.uid(),
			gid: header.gid(),
			owner: header.owner().to_string(),
			group: header.group().to_string(),
			size: header.size(),
			mtime: header.mtime(),
			inode,
			cursor: 0,
		})
	}

	/// Close a vnode. Nothing is cached, so this only ends the ownership.
	pub fn close(&self, _vnode: Vnode) {}

	/// Read from the vnode's cursor. Short reads happen only at the end of
	/// the file; reading past it returns 0.
	pub fn read(&self, vnode: &mut Vnode, buffer: &mut [u8]) -> Result<usize> {
		if vnode.kind != NodeKind::File {
			return Err(KernelError::FileNotFound);
		}

		if vnode.cursor >= vnode.size {
			return Ok(0);
		}

		let size = buffer.len().min(vnode.size - vnode.cursor);
		let first_record = vnode.inode + 1 + vnode.cursor / BLOCK_SIZE;
		let offset = vnode.cursor % BLOCK_SIZE;

		// Pull in whole records; the tail of a tar file is always padded
		// out to the record size.
		let records = (offset + size).div_ceil(BLOCK_SIZE);
		let mut scratch = vec![0u8; records * BLOCK_SIZE];
		self.read_archive(first_record, &mut scratch, records * BLOCK_SIZE, 0)?;

		buffer[..size].copy_from_slice(&scratch[offset..offset + size]);
		vnode.cursor += size;
		Ok(size)
	}

	/// Write at the vnode's cursor. The archive has no extent map, so the
	/// file cannot grow; writes past the end are clamped.
	pub fn write(&self, vnode: &mut Vnode, buffer: &[u8]) -> Result<usize> {
		if vnode.kind != NodeKind::File {
			return Err(KernelError::FileNotFound);
		}

		if vnode.cursor >= vnode.size {
			return Ok(0);
		}

		let size = buffer.len().min(vnode.size - vnode.cursor);
		let first_record = vnode.inode + 1 + vnode.cursor / BLOCK_SIZE;
		let offset = vnode.cursor % BLOCK_SIZE;

		self.write_archive(first_record, &buffer[..size], size, offset)?;

		// Any successful write refreshes the modification time.
		let mtime = crate::time::get_uptime_ms() / 1000;
		let mut header = self.read_header(vnode.inode)?;
		header.set_mtime(mtime);
		self.write_header(vnode.inode, &header)?;
		vnode.mtime = mtime;

		vnode.cursor += size;
		Ok(size)
	}

	/// Shrink the file at `path` to `new_size` bytes. Growing is refused,
	/// tar has no room for it.
	pub fn truncate(&self, path: &str, new_size: usize) -> Result<()> {
		let (inode, mut header) = self.find(path)?;

		if header.kind() != Some(NodeKind::File) {
			return Err(KernelError::FileNotFound);
		}

		if new_size > header.size() {
			return Err(KernelError::UnauthorizedAction);
		}

		header.set_size(new_size);
		self.write_header(inode, &header)
	}

	/// Remove the entry at `path`. Directories must be empty.
	pub fn remove(&self, path: &str) -> Result<()> {
		let (inode, mut header) = self.find(path)?;

		if header.kind() == Some(NodeKind::Directory) {
			let mut prefix = trim_slash(header.filename()).to_string();
			prefix.push('/');

			let occupied = self
				.entries()?
				.iter()
				.any(|(other, h)| *other != inode && h.filename().starts_with(prefix.as_str()));
			if occupied {
				return Err(KernelError::DirNotEmpty);
			}
		}

		header.clear_filename();
		self.write_header(inode, &header)
	}

	/// Rename the entry at `path` to `new_path`. Renaming a directory
	/// rewrites every member below it, from a snapshot taken up front so
	/// that no entry can be visited twice.
	pub fn rename(&self, path: &str, new_path: &str) -> Result<()> {
		let old_name = trim_slash(normalize(path));
		let new_name = trim_slash(normalize(new_path));

		if new_name.is_empty() || new_name.len() > HDR_FILENAME_LEN {
			return Err(KernelError::NameTooLong);
		}

		// The new location must sit below an existing directory.
		if let Some(parent) = parent_of(new_name) {
			let (_, parent_header) = self.find(parent)?;
			if parent_header.kind() != Some(NodeKind::Directory) {
				return Err(KernelError::FileNotFound);
			}
		}

		let (inode, mut header) = self.find(path)?;

		if header.kind() == Some(NodeKind::Directory) {
			// Renaming a tree into itself would chase its own rewrites.
			if new_name.len() > old_name.len()
				&& new_name.as_bytes()[..old_name.len()] == *old_name.as_bytes()
				&& new_name.as_bytes()[old_name.len()] == b'/'
			{
				return Err(KernelError::UnauthorizedAction);
			}

			let mut old_prefix = old_name.to_string();
			old_prefix.push('/');

			// Snapshot, then verify every new name fits before touching
			// anything.
			let entries = self.entries()?;
			let mut renames: Vec<(usize, String)> = Vec::new();

			for (member_inode, member_header) in &entries {
				let member = member_header.filename();

				let renamed = if names_match(member, old_name) {
					let mut renamed = new_name.to_string();
					if member.ends_with('/') {
						renamed.push('/');
					}
					renamed
				} else if let Some(rest) = member.strip_prefix(old_prefix.as_str()) {
					let mut renamed = new_name.to_string();
					renamed.push('/');
					renamed.push_str(rest);
					renamed
				} else {
					continue;
				};

				if renamed.len() > HDR_FILENAME_LEN {
					return Err(KernelError::NameTooLong);
				}

				renames.push((*member_inode, renamed));
			}

			for (member_inode, renamed) in renames {
				let mut member_header = self.read_header(member_inode)?;
				member_header.set_filename(&renamed)?;
				self.write_header(member_inode, &member_header)?;
			}

			Ok(())
		} else {
			header.set_filename(new_name)?;
			self.write_header(inode, &header)
		}
	}

	/// List the entries directly below `path`.
	pub fn readdir(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
		let target = trim_slash(normalize(path));

		if !target.is_empty() {
			let (_, header) = self.find(path)?;
			if header.kind() != Some(NodeKind::Directory) {
				return Err(KernelError::FileNotFound);
			}
		}

		let mut prefix = target.to_string();
		if !prefix.is_empty() {
			prefix.push('/');
		}

		let mut listing = Vec::new();
		for (_, header) in self.entries()? {
			let member = trim_slash(header.filename());

			if let Some(rest) = member.strip_prefix(prefix.as_str())
				&& !rest.is_empty()
				&& !rest.contains('/')
			{
				listing.push(DirectoryEntry::new(rest.to_string()));
			}
		}

		Ok(listing)
	}

	/// Metadata of the entry at `path`.
	pub fn stat(&self, path: &str) -> Result<FileAttr> {
		let (inode, header) = self.find(path)?;

		Ok(FileAttr {
			inode,
			kind: header.kind().ok_or(KernelError::NotSupported)?,
			mode: AccessPermission::from_bits_truncate(header.mode() as u32),
			uid: header.uid(),
			gid: header.gid(),
			size: header.size(),
			mtime: header.mtime(),
		})
	}
}

/// Parse a NUL- or space-terminated octal ASCII field.
fn oct2uint(field: &[u8]) -> u64 {
	let mut value = 0;

	for &byte in field {
		match byte {
			b' ' if value == 0 => continue,
			b'0'..=b'7' => value = value * 8 + u64::from(byte - b'0'),
			_ => break,
		}
	}

	value
}

/// Write `value` right-aligned, zero-padded and NUL-terminated.
fn uint2oct(field: &mut [u8], mut value: u64) {
	let Some((terminator, digits)) = field.split_last_mut() else {
		return;
	};
	*terminator = 0;

	for slot in digits.iter_mut().rev() {
		*slot = b'0' + (value % 8) as u8;
		value /= 8;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::drivers::blk::memdisk::MemDisk;

	/// Build a single archive header the way `tar` would.
	fn make_header(name: &str, size: usize, typeflag: u8) -> [u8; BLOCK_SIZE] {
		let mut header = [0u8; BLOCK_SIZE];

		header[..name.len()].copy_from_slice(name.as_bytes());
		uint2oct(&mut header[HDR_MODE..HDR_MODE + 8], 0o644);
		uint2oct(&mut header[HDR_UID..HDR_UID + 8], 1000);
		uint2oct(&mut header[HDR_GID..HDR_GID + 8], 100);
		uint2oct(&mut header[HDR_SIZE..HDR_SIZE + 12], size as u64);
		uint2oct(&mut header[HDR_MTIME..HDR_MTIME + 12], 1_700_000_000);
		header[HDR_TYPEFLAG] = typeflag;
		header[HDR_MAGIC..HDR_MAGIC + 6].copy_from_slice(USTAR_MAGIC);
		header[263] = b'0';
		header[264] = b'0';
		header[HDR_OWNER..HDR_OWNER + 4].copy_from_slice(b"root");
		header[HDR_GROUP..HDR_GROUP + 4].copy_from_slice(b"root");

		// The checksum is computed with its own field set to spaces.
		header[148..156].copy_from_slice(b"        ");
		let sum: u64 = header.iter().map(|&b| u64::from(b)).sum();
		uint2oct(&mut header[148..155], sum);

		header
	}

	fn push_member(archive: &mut Vec<u8>, name: &str, data: &[u8], typeflag: u8) {
		archive.extend_from_slice(&make_header(name, data.len(), typeflag));
		archive.extend_from_slice(data);
		archive.resize(archive.len().next_multiple_of(BLOCK_SIZE), 0);
	}

	/// A small tree: a README, a directory with two files and a nested
	/// directory.
	fn build_archive() -> Vec<u8> {
		let mut archive = Vec::new();

		push_member(&mut archive, "readme", b"Hello, World!\n", b'0');
		push_member(&mut archive, "docs/", &[], b'5');
		push_member(&mut archive, "docs/a.txt", b"alpha", b'0');
		push_member(
			&mut archive,
			"docs/big.bin",
			&(0..2000u32).flat_map(u32::to_le_bytes).collect::<Vec<u8>>(),
			b'0',
		);
		push_member(&mut archive, "docs/sub/", &[], b'5');
		push_member(&mut archive, "docs/sub/b.txt", b"beta", b'0');
		push_member(&mut archive, "empty/", &[], b'5');

		// Two records of zero padding terminate the archive.
		archive.resize(archive.len() + 2 * BLOCK_SIZE, 0);
		archive
	}

	fn mount(device_block_size: usize) -> Ustar {
		let device = MemDisk::from_image(device_block_size, build_archive());
		Ustar::mount(Arc::new(device), 0).unwrap()
	}

	#[test]
	fn octal_codecs_round_trip() {
		assert_eq!(oct2uint(b"0000644\0"), 0o644);
		assert_eq!(oct2uint(b"   644\0 "), 0o644);
		assert_eq!(oct2uint(b"\0"), 0);

		let mut field = [0u8; 12];
		uint2oct(&mut field, 0o644);
		assert_eq!(&field, b"00000000644\0");
		assert_eq!(oct2uint(&field), 0o644);
	}

	#[test]
	fn mount_rejects_unrelated_block_sizes() {
		let device = MemDisk::from_image(300, build_archive());
		assert!(matches!(
			Ustar::mount(Arc::new(device), 0),
			Err(KernelError::Align)
		));
	}

	#[test]
	fn mount_rejects_missing_magic() {
		let device = MemDisk::from_image(512, vec![0u8; 4096]);
		assert!(matches!(
			Ustar::mount(Arc::new(device), 0),
			Err(KernelError::WrongPartitionType)
		));
	}

	#[test]
	fn read_whole_file() {
		for device_block_size in [256, 512, 1024] {
			let fs = mount(device_block_size);
			let mut vnode = fs.open("/readme").unwrap();

			assert_eq!(vnode.kind(), NodeKind::File);
			assert_eq!(vnode.size(), 14);

			let mut buffer = [0u8; 32];
			let actual_size = fs.read(&mut vnode, &mut buffer).unwrap();
			assert_eq!(actual_size, 14);
			assert_eq!(&buffer[..14], b"Hello, World!\n");

			// The cursor sits at the end now; further reads return 0, and
			// seeking beyond the end is refused.
			assert_eq!(fs.read(&mut vnode, &mut buffer).unwrap(), 0);
			assert_eq!(vnode.seek(15), Err(KernelError::OutOfRange));
			fs.close(vnode);
		}
	}

	#[test]
	fn read_spans_record_boundaries() {
		let fs = mount(512);
		let mut vnode = fs.open("docs/big.bin").unwrap();
		let expected: Vec<u8> = (0..2000u32).flat_map(u32::to_le_bytes).collect();

		vnode.seek(500).unwrap();
		let mut buffer = vec![0u8; 1024];
		assert_eq!(fs.read(&mut vnode, &mut buffer).unwrap(), 1024);
		assert_eq!(&buffer[..], &expected[500..1524]);
	}

	#[test]
	fn read_directory_fails() {
		let fs = mount(512);
		let mut vnode = fs.open("docs").unwrap();
		let mut buffer = [0u8; 8];

		assert_eq!(
			fs.read(&mut vnode, &mut buffer),
			Err(KernelError::FileNotFound)
		);
	}

	#[test]
	fn write_and_read_back() {
		let fs = mount(512);

		let mut vnode = fs.open("docs/a.txt").unwrap();
		assert_eq!(fs.write(&mut vnode, b"delta").unwrap(), 5);

		let mut vnode = fs.open("docs/a.txt").unwrap();
		let mut buffer = [0u8; 8];
		assert_eq!(fs.read(&mut vnode, &mut buffer).unwrap(), 5);
		assert_eq!(&buffer[..5], b"delta");
	}

	#[test]
	fn write_cannot_grow_files() {
		let fs = mount(512);
		let mut vnode = fs.open("docs/a.txt").unwrap();

		// Five byte file: anything longer is clamped.
		assert_eq!(fs.write(&mut vnode, b"overlong").unwrap(), 5);
		assert_eq!(fs.write(&mut vnode, b"more").unwrap(), 0);
	}

	#[test]
	fn unaligned_write_leaves_neighbors_alone() {
		let fs = mount(1024);
		let expected: Vec<u8> = (0..2000u32).flat_map(u32::to_le_bytes).collect();

		let mut vnode = fs.open("docs/big.bin").unwrap();
		vnode.seek(1000).unwrap();
		assert_eq!(fs.write(&mut vnode, b"XYZ").unwrap(), 3);

		let mut vnode = fs.open("docs/big.bin").unwrap();
		let mut buffer = vec![0u8; vnode.size()];
		assert_eq!(fs.read(&mut vnode, &mut buffer).unwrap(), expected.len());
		assert_eq!(&buffer[..1000], &expected[..1000]);
		assert_eq!(&buffer[1000..1003], b"XYZ");
		assert_eq!(&buffer[1003..], &expected[1003..]);
	}

	#[test]
	fn write_updates_mtime() {
		let fs = mount(512);
		let before = fs.stat("docs/a.txt").unwrap().mtime;

		let mut vnode = fs.open("docs/a.txt").unwrap();
		fs.write(&mut vnode, b"x").unwrap();

		let after = fs.stat("docs/a.txt").unwrap().mtime;
		assert_ne!(before, after);
	}

	#[test]
	fn truncate_shrinks_but_never_grows() {
		let fs = mount(512);

		assert_eq!(
			fs.truncate("docs/a.txt", 100),
			Err(KernelError::UnauthorizedAction)
		);

		fs.truncate("docs/a.txt", 2).unwrap();
		let mut vnode = fs.open("docs/a.txt").unwrap();
		assert_eq!(vnode.size(), 2);

		let mut buffer = [0u8; 8];
		assert_eq!(fs.read(&mut vnode, &mut buffer).unwrap(), 2);
		assert_eq!(&buffer[..2], b"al");
	}

	#[test]
	fn remove_file_and_miss_it() {
		let fs = mount(512);

		fs.remove("docs/a.txt").unwrap();
		assert_eq!(fs.open("docs/a.txt").err(), Some(KernelError::FileNotFound));

		// The neighbors survive the removal.
		assert!(fs.open("docs/big.bin").is_ok());
		assert!(fs.open("readme").is_ok());
	}

	#[test]
	fn remove_refuses_populated_directories() {
		let fs = mount(512);

		assert_eq!(fs.remove("docs"), Err(KernelError::DirNotEmpty));
		assert!(fs.remove("empty").is_ok());
	}

	#[test]
	fn rename_file() {
		let fs = mount(512);

		fs.rename("/readme", "/manual").unwrap();
		assert!(fs.open("/readme").is_err());

		let mut vnode = fs.open("/manual").unwrap();
		let mut buffer = [0u8; 16];
		assert_eq!(fs.read(&mut vnode, &mut buffer).unwrap(), 14);
		assert_eq!(&buffer[..14], b"Hello, World!\n");
	}

	#[test]
	fn rename_into_missing_directory_fails() {
		let fs = mount(512);

		assert_eq!(
			fs.rename("readme", "nowhere/readme"),
			Err(KernelError::FileNotFound)
		);
		// A file is not a directory either.
		assert_eq!(
			fs.rename("docs/a.txt", "readme/a.txt"),
			Err(KernelError::FileNotFound)
		);
	}

	#[test]
	fn rename_directory_moves_the_tree() {
		let fs = mount(512);

		fs.rename("/docs/", "/empty/docs").unwrap();

		assert!(fs.open("/docs/a.txt").is_err());
		assert!(fs.open("/empty/docs/a.txt").is_ok());
		assert!(fs.open("/empty/docs/sub/b.txt").is_ok());
		assert_eq!(fs.stat("/empty/docs").unwrap().kind, NodeKind::Directory);
	}

	#[test]
	fn rename_directory_into_itself_is_rejected() {
		let fs = mount(512);

		assert_eq!(
			fs.rename("docs", "docs/inner"),
			Err(KernelError::UnauthorizedAction)
		);
	}

	#[test]
	fn readdir_lists_direct_members_only() {
		let fs = mount(512);

		let names: Vec<String> = fs
			.readdir("docs")
			.unwrap()
			.into_iter()
			.map(|entry| entry.name)
			.collect();
		assert_eq!(names, ["a.txt", "big.bin", "sub"]);

		let root: Vec<String> = fs
			.readdir("/")
			.unwrap()
			.into_iter()
			.map(|entry| entry.name)
			.collect();
		assert_eq!(root, ["readme", "docs", "empty"]);

		assert_eq!(fs.readdir("missing").err(), Some(KernelError::FileNotFound));
	}

	#[test]
	fn stat_reports_the_header() {
		let fs = mount(512);
		let attr = fs.stat("docs/a.txt").unwrap();

		assert_eq!(attr.kind, NodeKind::File);
		assert_eq!(attr.size, 5);
		assert_eq!(attr.uid, 1000);
		assert_eq!(attr.gid, 100);
		assert_eq!(attr.mtime, 1_700_000_000);
	}
}
