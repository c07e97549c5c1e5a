//! The filesystem layer.
//!
//! Files live in a USTAR archive on top of a block device; open files are
//! represented by [`Vnode`] handles owned by their opener. The mounted
//! partition in turn owns the device handle.

pub mod ustar;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hermit_sync::OnceCell;

use self::ustar::Ustar;
use crate::drivers::blk::ramdisk::RamDisk;
use crate::env;
use crate::error::{KernelError, Result};

bitflags! {
	/// POSIX access rights of a file.
	#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
	pub struct AccessPermission: u32 {
		const S_IRUSR = 0o400;
		const S_IWUSR = 0o200;
		const S_IXUSR = 0o100;
		const S_IRGRP = 0o040;
		const S_IWGRP = 0o020;
		const S_IXGRP = 0o010;
		const S_IROTH = 0o004;
		const S_IWOTH = 0o002;
		const S_IXOTH = 0o001;
		const S_ISUID = 0o4000;
		const S_ISGID = 0o2000;
		const S_ISVTX = 0o1000;
	}
}

/// What kind of entry a vnode refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
	File,
	HardLink,
	SymLink,
	Directory,
}

/// Everything `stat` reports about an entry.
#[derive(Debug, Clone)]
pub struct FileAttr {
	/// Header block index inside the archive.
	pub inode: usize,
	pub kind: NodeKind,
	pub mode: AccessPermission,
	pub uid: u64,
	pub gid: u64,
	pub size: usize,
	/// Modification time in seconds.
	pub mtime: u64,
}

/// A single entry reported by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
	pub name: String,
}

impl DirectoryEntry {
	pub fn new(name: String) -> Self {
		Self { name }
	}
}

/// An open file.
///
/// The handle keeps the resolved metadata and the cursor; it stays valid
/// until closed, even if the entry is renamed or removed underneath.
#[derive(Debug)]
pub struct Vnode {
	/// The path the file was opened with, normalized.
	path: String,
	/// Short name, i.e. the last path component.
	name: String,
	kind: NodeKind,
	mode: AccessPermission,
	uid: u64,
	gid: u64,
	owner: String,
	group: String,
	size: usize,
	mtime: u64,
	/// Header block index inside the archive.
	inode: usize,
	/// Read/write position in bytes.
	cursor: usize,
}

impl Vnode {
	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn kind(&self) -> NodeKind {
		self.kind
	}

	pub fn mode(&self) -> AccessPermission {
		self.mode
	}

	pub fn uid(&self) -> u64 {
		self.uid
	}

	pub fn gid(&self) -> u64 {
		self.gid
	}

	pub fn owner(&self) -> &str {
		&self.owner
	}

	pub fn group(&self) -> &str {
		&self.group
	}

	pub fn size(&self) -> usize {
		self.size
	}

	pub fn mtime(&self) -> u64 {
		self.mtime
	}

	pub fn cursor(&self) -> usize {
		self.cursor
	}

	/// Position the cursor. Positions beyond the end of the file are
	/// rejected, tar files cannot grow.
	pub fn seek(&mut self, position: usize) -> Result<()> {
		if position > self.size {
			return Err(KernelError::OutOfRange);
		}

		self.cursor = position;
		Ok(())
	}
}

static FILESYSTEM: OnceCell<Ustar> = OnceCell::new();

/// Mount the linked RAM-disk image as the root filesystem.
pub(crate) fn init() -> Result<()> {
	let region = env::initrd().ok_or(KernelError::FileNotFound)?;
	let device = Arc::new(RamDisk::new(region)?);
	let filesystem = Ustar::mount(device, 0)?;

	FILESYSTEM
		.set(filesystem)
		.map_err(|_| KernelError::MappingAlreadyExists)?;

	info!("Mounted USTAR filesystem from the RAM disk");
	Ok(())
}

fn filesystem() -> Result<&'static Ustar> {
	FILESYSTEM.get().ok_or(KernelError::FileNotFound)
}

/// Open a file and return its vnode.
pub fn open(path: &str) -> Result<Vnode> {
	filesystem()?.open(path)
}

/// Give up a vnode.
pub fn close(vnode: Vnode) {
	if let Ok(filesystem) = filesystem() {
		filesystem.close(vnode);
	}
}

/// Read from the vnode's cursor into `buffer`. Returns the number of bytes
/// actually read; at the end of the file that is 0.
pub fn read(vnode: &mut Vnode, buffer: &mut [u8]) -> Result<usize> {
	filesystem()?.read(vnode, buffer)
}

/// Write `buffer` at the vnode's cursor. Files cannot grow, the write is
/// clamped at the end of the file.
pub fn write(vnode: &mut Vnode, buffer: &[u8]) -> Result<usize> {
	filesystem()?.write(vnode, buffer)
}

/// Shrink a file to `new_size` bytes.
pub fn truncate(path: &str, new_size: usize) -> Result<()> {
	filesystem()?.truncate(path, new_size)
}

/// Rename a file or a whole directory tree.
pub fn rename(path: &str, new_path: &str) -> Result<()> {
	filesystem()?.rename(path, new_path)
}

/// Remove a file or an empty directory.
pub fn remove(path: &str) -> Result<()> {
	filesystem()?.remove(path)
}

/// All entries directly below `path`.
pub fn readdir(path: &str) -> Result<Vec<DirectoryEntry>> {
	filesystem()?.readdir(path)
}

/// Metadata of the entry at `path`.
pub fn stat(path: &str) -> Result<FileAttr> {
	filesystem()?.stat(path)
}
