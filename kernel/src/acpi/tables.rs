//! Raw ACPI table layouts and validation helpers

/// Root System Description Pointer (ACPI 1.0, 20 bytes)
#[repr(C, packed)]
pub struct Rsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt_address: u32,
}

/// Extended RSDP (ACPI 2.0+)
#[repr(C, packed)]
pub struct Xsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt_address: u32,
    pub length: u32,
    pub xsdt_address: u64,
    pub extended_checksum: u8,
    pub _reserved: [u8; 3],
}

/// Common System Description Table header
#[repr(C, packed)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

/// Generic Address Structure
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct GenericAddress {
    pub address_space_id: u8,
    pub register_bit_width: u8,
    pub register_bit_offset: u8,
    pub access_size: u8,
    pub address: u64,
}

/// GAS address space ids used by the kernel
pub const GAS_SYSTEM_MEMORY: u8 = 0;
pub const GAS_SYSTEM_IO: u8 = 1;

/// Byte-sum a memory range; a valid ACPI structure sums to zero
pub fn checksum_ok(addr: u64, length: usize) -> bool {
    let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, length) };
    bytes_sum_zero(bytes)
}

/// Byte-sum check over a slice
pub fn bytes_sum_zero(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
}

/// Validate an SDT in place: signature match, sane length, checksum zero
pub fn sdt_valid(addr: u64, expected_signature: &[u8; 4]) -> bool {
    let header = unsafe { &*(addr as *const SdtHeader) };
    if &header.signature != expected_signature {
        return false;
    }
    let length = unsafe { core::ptr::read_unaligned(core::ptr::addr_of!(header.length)) };
    if (length as usize) < core::mem::size_of::<SdtHeader>() {
        return false;
    }
    checksum_ok(addr, length as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sum_accepts() {
        let mut bytes = [1u8, 2, 3, 0];
        let sum: u8 = bytes[..3].iter().fold(0, |a, &b| a.wrapping_add(b));
        bytes[3] = 0u8.wrapping_sub(sum);
        assert!(bytes_sum_zero(&bytes));
    }

    #[test]
    fn nonzero_sum_rejects() {
        assert!(!bytes_sum_zero(&[1, 2, 3, 4]));
    }
}
