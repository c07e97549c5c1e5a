//! Block device on top of the RAM-disk image linked into the kernel.
//!
//! The image starts with a 512 byte master block: an eight byte magic, the
//! image size as a little-endian `u32` and zero padding. The payload
//! follows as 512 byte blocks.

use hermit_sync::RwSpinLock;

use crate::drivers::blk::BlockDevice;
use crate::error::{KernelError, Result};

/// ASCII `"UTKINIRD"`, i.e. the little-endian integer 0x4452494e494b5455.
const RAMDISK_MAGIC: &[u8; 8] = b"UTKINIRD";

/// Size of the master block at the start of the image.
const MASTER_BLOCK_SIZE: usize = 512;

const RAMDISK_BLOCK_SIZE: usize = 512;

/// A block device backed by a memory region that outlives the kernel.
pub struct RamDisk {
	data: RwSpinLock<&'static mut [u8]>,
	payload_len: usize,
}

impl RamDisk {
	/// Validate the master block and take over the region.
	pub fn new(region: &'static mut [u8]) -> Result<Self> {
		if region.len() < MASTER_BLOCK_SIZE {
			return Err(KernelError::OutOfBound);
		}

		if &region[..RAMDISK_MAGIC.len()] != RAMDISK_MAGIC {
			return Err(KernelError::WrongPartitionType);
		}

		let image_size = u32::from_le_bytes(region[8..12].try_into().unwrap()) as usize;
		let payload_len = image_size.saturating_sub(MASTER_BLOCK_SIZE);

		if image_size > region.len() {
			return Err(KernelError::OutOfBound);
		}

		info!("RAM disk of {} KiB at {:p}", image_size >> 10, region.as_ptr());

		Ok(Self {
			data: RwSpinLock::new(region),
			payload_len,
		})
	}

	/// Translate a block access into a byte range behind the master block.
	fn range(&self, block_id: usize, byte_count: usize, first_block_offset: usize) -> Result<core::ops::Range<usize>> {
		if first_block_offset >= RAMDISK_BLOCK_SIZE {
			return Err(KernelError::OutOfBound);
		}

		let start = block_id
			.checked_mul(RAMDISK_BLOCK_SIZE)
			.and_then(|offset| offset.checked_add(first_block_offset))
			.ok_or(KernelError::OutOfBound)?;
		let end = start.checked_add(byte_count).ok_or(KernelError::OutOfBound)?;

		if end > self.payload_len {
			return Err(KernelError::OutOfBound);
		}

		Ok(MASTER_BLOCK_SIZE + start..MASTER_BLOCK_SIZE + end)
	}
}

impl BlockDevice for RamDisk {
	fn block_size(&self) -> usize {
		RAMDISK_BLOCK_SIZE
	}

	fn block_count(&self) -> usize {
		self.payload_len / RAMDISK_BLOCK_SIZE
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
		// Memory is the medium; only the bounds contract remains.
		self.range(block_id, byte_count, first_block_offset)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use alloc::vec;

	use super::*;

	fn image(payload: &[u8]) -> &'static mut [u8] {
		let mut image = vec![0u8; MASTER_BLOCK_SIZE + payload.len()];
		image[..8].copy_from_slice(RAMDISK_MAGIC);
		image[8..12].copy_from_slice(&((MASTER_BLOCK_SIZE + payload.len()) as u32).to_le_bytes());
		image[MASTER_BLOCK_SIZE..].copy_from_slice(payload);
		vec::Vec::leak(image)
	}

	#[test]
	fn master_block_is_validated() {
		let disk = RamDisk::new(image(&[0u8; 1024])).unwrap();
		assert_eq!(disk.block_size(), 512);
		assert_eq!(disk.block_count(), 2);

		let broken = vec::Vec::leak(vec![0u8; 2048]);
		assert!(matches!(
			RamDisk::new(broken),
			Err(KernelError::WrongPartitionType)
		));
	}

	#[test]
	fn size_field_must_fit_the_region() {
		let region = image(&[0u8; 512]);
		// Claim more bytes than the region holds.
		region[8..12].copy_from_slice(&4096u32.to_le_bytes());
		assert!(matches!(RamDisk::new(region), Err(KernelError::OutOfBound)));
	}

	#[test]
	fn accesses_are_bounds_checked() {
		let mut payload = [0u8; 1024];
		payload[512] = 0xaa;
		let disk = RamDisk::new(image(&payload)).unwrap();

		let mut buffer = [0u8; 4];
		disk.read_blocks(1, &mut buffer, 4, 0).unwrap();
		assert_eq!(buffer[0], 0xaa);

		// Offsets must stay inside the first block, the range inside the
		// payload.
		assert!(disk.read_blocks(0, &mut buffer, 4, 512).is_err());
		assert!(disk.read_blocks(2, &mut buffer, 1, 0).is_err());
		assert!(disk.flush_blocks(1, 512, 0).is_ok());

		disk.write_blocks(0, &[1, 2, 3, 4], 4, 508).unwrap();
		disk.read_blocks(0, &mut buffer, 4, 508).unwrap();
		assert_eq!(buffer, [1, 2, 3, 4]);
	}
}
