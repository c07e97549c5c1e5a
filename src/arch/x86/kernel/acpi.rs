//! Minimal ACPI support: locating the RSDP, walking the RSDT and keeping
//! the Multiple APIC Description Table for CPU enumeration.
//!
//! The boot protocol guarantees an identity mapping for the BIOS areas, so
//! the tables are read in place.

#![allow(dead_code)]

use core::{mem, slice, str};

use hermit_sync::OnceCell;

use crate::arch::x86::mm::PhysAddr;
use crate::error::{KernelError, Result};

/// Memory at this physical address is supposed to contain a pointer to the
/// Extended BIOS Data Area (EBDA).
const EBDA_PTR_LOCATION: PhysAddr = PhysAddr::new(0x40e);
/// Minimum physical address where a valid EBDA must be located.
const EBDA_MINIMUM_ADDRESS: usize = 0x400;
/// The size of the EBDA window that is searched for an ACPI RSDP.
const EBDA_WINDOW_SIZE: usize = 1024;
/// The lower bound of the other address range, where the ACPI RSDP could be located.
const RSDP_SEARCH_ADDRESS_LOW: usize = 0xe_0000;
/// The upper bound of the other address range, where the ACPI RSDP could be located.
const RSDP_SEARCH_ADDRESS_HIGH: usize = 0xf_ffff;
/// Length in bytes of the structure over which the ACPI 1.0 checksum is calculated.
const RSDP_CHECKSUM_LENGTH: usize = 20;

/// The "Root System Description Pointer" providing the RSDT location.
#[repr(C, packed)]
struct AcpiRsdp {
	signature: [u8; 8],
	checksum: u8,
	oem_id: [u8; 6],
	revision: u8,
	rsdt_physical_address: u32,
}

impl AcpiRsdp {
	fn oem_id(&self) -> &str {
		str::from_utf8(&self.oem_id).unwrap_or("(invalid)")
	}
}

/// The header of (almost) every ACPI table.
#[repr(C, packed)]
struct AcpiSdtHeader {
	signature: [u8; 4],
	length: u32,
	revision: u8,
	checksum: u8,
	oem_id: [u8; 6],
	oem_table_id: [u8; 8],
	oem_revision: u32,
	creator_id: u32,
	creator_revision: u32,
}

impl AcpiSdtHeader {
	fn signature(&self) -> &str {
		str::from_utf8(&self.signature).unwrap_or("(invalid)")
	}
}

/// A validated, identity-mapped ACPI table.
pub struct AcpiTable {
	header: &'static AcpiSdtHeader,
}

impl AcpiTable {
	/// Interpret the table at `physical_address` and verify its checksum.
	fn map(physical_address: PhysAddr) -> Result<Self> {
		let header = unsafe { &*(physical_address.as_usize() as *const AcpiSdtHeader) };

		verify_checksum(physical_address.as_usize(), header.length as usize)?;
		Ok(Self { header })
	}

	pub fn header_start_address(&self) -> usize {
		core::ptr::from_ref(self.header).addr()
	}

	pub fn table_start_address(&self) -> usize {
		self.header_start_address() + mem::size_of::<AcpiSdtHeader>()
	}

	pub fn table_end_address(&self) -> usize {
		self.header_start_address() + self.header.length as usize
	}
}

/// The MADT, preserved for the APIC layer.
static MADT: OnceCell<AcpiTable> = OnceCell::new();

/// Sum all bytes of the given region; a valid ACPI structure sums to zero.
fn verify_checksum(start_address: usize, length: usize) -> Result<()> {
	let slice = unsafe { slice::from_raw_parts(start_address as *const u8, length) };
	let checksum = slice
		.iter()
		.fold(0u8, |checksum, byte| checksum.wrapping_add(*byte));

	if checksum == 0 {
		Ok(())
	} else {
		Err(KernelError::CheckSumFailed)
	}
}

fn search_rsdp_in_range(range: core::ops::Range<usize>) -> Option<&'static AcpiRsdp> {
	// The RSDP is always aligned to a 16 byte boundary.
	for address in range.step_by(16) {
		let rsdp = unsafe { &*(address as *const AcpiRsdp) };
		if &rsdp.signature != b"RSD PTR " {
			continue;
		}

		if verify_checksum(address, RSDP_CHECKSUM_LENGTH).is_ok() {
			return Some(rsdp);
		}
	}

	None
}

fn detect_rsdp() -> Result<&'static AcpiRsdp> {
	// Check the EBDA window first.
	let ebda_ptr = unsafe { *(EBDA_PTR_LOCATION.as_usize() as *const u16) };
	let ebda_address = (ebda_ptr as usize) << 4;

	if ebda_address > EBDA_MINIMUM_ADDRESS
		&& let Some(rsdp) = search_rsdp_in_range(ebda_address..ebda_address + EBDA_WINDOW_SIZE)
	{
		return Ok(rsdp);
	}

	search_rsdp_in_range(RSDP_SEARCH_ADDRESS_LOW..RSDP_SEARCH_ADDRESS_HIGH)
		.ok_or(KernelError::AcpiUnsupported)
}

/// Locate the ACPI tables and preserve the ones the kernel consumes.
#[cfg(target_os = "none")]
pub fn init() -> Result<()> {
	let rsdp = detect_rsdp()?;
	info!(
		"Found ACPI revision {} tables of \"{}\"",
		rsdp.revision,
		rsdp.oem_id()
	);

	// Walk the RSDT. Its entries are 32-bit physical table addresses.
	let rsdt = AcpiTable::map(PhysAddr::new(rsdp.rsdt_physical_address as usize))?;
	let entries = (rsdt.table_end_address() - rsdt.table_start_address()) / mem::size_of::<u32>();

	for i in 0..entries {
		let entry_address = rsdt.table_start_address() + i * mem::size_of::<u32>();
		let table_address = unsafe { *(entry_address as *const u32) } as usize;
		let table = match AcpiTable::map(PhysAddr::new(table_address)) {
			Ok(table) => table,
			Err(_) => {
				warn!("Skipping ACPI table with invalid checksum at {table_address:#x}");
				continue;
			}
		};

		debug!("Found ACPI table {}", table.header.signature());
		if table.header.signature() == "APIC" {
			MADT.set(table).ok();
		}
	}

	if MADT.get().is_some() {
		Ok(())
	} else {
		Err(KernelError::AcpiUnsupported)
	}
}

#[cfg(not(target_os = "none"))]
pub fn init() -> Result<()> {
	Err(KernelError::AcpiUnsupported)
}

/// The Multiple APIC Description Table, if ACPI has been initialized.
pub fn get_madt() -> Result<&'static AcpiTable> {
	MADT.get().ok_or(KernelError::AcpiNotInitialized)
}
