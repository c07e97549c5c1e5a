//! A heap-backed block device with a configurable block size.
//!
//! Serves as scratch storage and lets the filesystem tests exercise every
//! alignment regime without hardware.

use alloc::vec;
use alloc::vec::Vec;

use hermit_sync::RwSpinLock;

use crate::drivers::blk::BlockDevice;
use crate::error::{KernelError, Result};

pub struct MemDisk {
	data: RwSpinLock<Vec<u8>>,
	block_size: usize,
}

impl MemDisk {
	pub fn new(block_size: usize, block_count: usize) -> Self {
		Self {
			data: RwSpinLock::new(vec![0; block_size * block_count]),
			block_size,
		}
	}

	/// Take over an existing image. The length is rounded down to whole
	/// blocks.
	pub fn from_image(block_size: usize, mut image: Vec<u8>) -> Self {
		image.truncate(image.len() - image.len() % block_size);
		Self {
			data: RwSpinLock::new(image),
			block_size,
		}
	}

	fn range(
		&self,
		block_id: usize,
		byte_count: usize,
		first_block_offset: usize,
	) -> Result<core::ops::Range<usize>> {
		if first_block_offset >= self.block_size {
			return Err(KernelError::OutOfBound);
		}

		let start = block_id
			.checked_mul(self.block_size)
			.and_then(|offset| offset.checked_add(first_block_offset))
			.ok_or(KernelError::OutOfBound)?;
		let end = start.checked_add(byte_count).ok_or(KernelError::OutOfBound)?;

		if end > self.data.read().len() {
			return Err(KernelError::OutOfBound);
		}

		Ok(start..end)
	}
}

impl BlockDevice for MemDisk {
	fn block_size(&self) -> usize {
		self.block_size
	}

	fn block_count(&self) -> usize {
		self.data.read().len() / self.block_size
	}

	fn read_blocks(
		&self,
		block_id: usize,
		buffer: &mut [u8],
		byte_count: usize,
		first_block_offset: usize,
	) -> Result<()> {
		let range = self.range(block_id, byte_count, first_block_offset)?;
		buffer[..byte_count].copy_from_slice(&self.data.read()[range]);
		Ok(())
	}

	fn write_blocks(
		&self,
		block_id: usize,
		buffer: &[u8],
		byte_count: usize,
		first_block_offset: usize,
	) -> Result<()> {
		let range = self.range(block_id, byte_count, first_block_offset)?;
		self.data.write()[range].copy_from_slice(&buffer[..byte_count]);
		Ok(())
	}

	fn flush_blocks(
		&self,
		block_id: usize,
		byte_count: usize,
		first_block_offset: usize,
	) -> Result<()> {
		self.range(block_id, byte_count, first_block_offset)?;
		Ok(())
	}
}
