//! ACPI table discovery: RSDP, RSDT, MADT.
//!
//! Only what CPU and interrupt-controller bring-up needs. The tables are
//! read once, early, while physical memory is identity-addressed; after
//! [`discover`] returns, nothing refers to firmware memory again.

use crate::error::{KernelError, KernelResult};
#[cfg(target_arch = "x86")]
use crate::layout;

/// "RSD PTR ", the RSDP anchor, always on a 16-byte boundary.
pub const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
/// MADT signature inside the RSDT.
pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// Size of the ACPI 1.0 RSDP structure covered by its checksum.
pub const RSDP_V1_LEN: usize = 20;

/// Byte offset of the RSDT address inside the RSDP.
const RSDP_RSDT_ADDR_OFFSET: usize = 16;

/// System Description Table header, common to RSDT and MADT.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oemid: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

pub const SDT_HEADER_LEN: usize = core::mem::size_of::<SdtHeader>();

/// MADT record types this kernel consumes.
const MADT_TYPE_LAPIC: u8 = 0;
const MADT_TYPE_IOAPIC: u8 = 1;

/// One processor as described by its MADT local-APIC record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MadtLocalApic {
    pub acpi_processor_id: u8,
    pub apic_id: u8,
    pub flags: u32,
}

/// The (first) I/O APIC record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MadtIoApic {
    pub id: u8,
    pub address: u32,
    pub gsi_base: u32,
}

/// Everything bring-up keeps from the MADT.
#[derive(Debug, Clone, Copy)]
pub struct MadtInfo {
    /// Local APIC MMIO base for every CPU.
    pub lapic_addr: u32,
    pub cpus: [Option<MadtLocalApic>; crate::config::MAX_CPUS],
    pub cpu_count: usize,
    pub ioapic: Option<MadtIoApic>,
    /// Total I/O APIC records seen (only the first is programmed).
    pub ioapic_count: usize,
}

/// 8-bit checksum: the byte sum of a valid table is 0 mod 256.
pub fn checksum_8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Scan `region` (whose first byte sits at physical `region_base`) for a
/// valid RSDP on 16-byte boundaries. Candidates whose checksum does not
/// hold are skipped and the scan continues.
pub fn find_rsdp_in(region: &[u8], region_base: u32) -> Option<u32> {
    let mut offset = 0;
    while offset + RSDP_V1_LEN <= region.len() {
        let candidate = &region[offset..];
        if candidate[..8] == RSDP_SIGNATURE[..]
            && checksum_8(&candidate[..RSDP_V1_LEN]) == 0
        {
            return Some(region_base + offset as u32);
        }
        offset += 16;
    }
    None
}

/// Pull the RSDT physical address out of a validated RSDP.
pub fn rsdp_rsdt_addr(rsdp: &[u8]) -> u32 {
    u32::from_le_bytes(
        rsdp[RSDP_RSDT_ADDR_OFFSET..RSDP_RSDT_ADDR_OFFSET + 4]
            .try_into()
            .expect("RSDP is at least 20 bytes"),
    )
}

/// Parse a complete MADT (header included) into [`MadtInfo`].
///
/// Record order is preserved: the first processor record is the boot CPU.
/// Processors beyond `MAX_CPUS` are counted but not recorded; I/O APIC
/// records after the first are counted only.
pub fn parse_madt(table: &[u8]) -> KernelResult<MadtInfo> {
    if table.len() < SDT_HEADER_LEN + 8 {
        return Err(KernelError::NotPresent { device: "madt" });
    }

    let lapic_addr = u32::from_le_bytes(
        table[SDT_HEADER_LEN..SDT_HEADER_LEN + 4]
            .try_into()
            .expect("bounds checked above"),
    );

    let mut info = MadtInfo {
        lapic_addr,
        cpus: [None; crate::config::MAX_CPUS],
        cpu_count: 0,
        ioapic: None,
        ioapic_count: 0,
    };

    // Records start after the header, the LAPIC address, and the flags
    // word; each is prefixed by (type, length).
    let mut offset = SDT_HEADER_LEN + 8;
    while offset + 2 <= table.len() {
        let kind = table[offset];
        let len = table[offset + 1] as usize;
        if len < 2 || offset + len > table.len() {
            break;
        }
        let body = &table[offset..offset + len];
        match kind {
            MADT_TYPE_LAPIC if len >= 8 => {
                if info.cpu_count < info.cpus.len() {
                    info.cpus[info.cpu_count] = Some(MadtLocalApic {
                        acpi_processor_id: body[2],
                        apic_id: body[3],
                        flags: u32::from_le_bytes(body[4..8].try_into().expect("len checked")),
                    });
                }
                info.cpu_count += 1;
            }
            MADT_TYPE_IOAPIC if len >= 12 => {
                let record = MadtIoApic {
                    id: body[2],
                    address: u32::from_le_bytes(body[4..8].try_into().expect("len checked")),
                    gsi_base: u32::from_le_bytes(body[8..12].try_into().expect("len checked")),
                };
                if info.ioapic.is_none() {
                    info.ioapic = Some(record);
                }
                info.ioapic_count += 1;
            }
            _ => {}
        }
        offset += len;
    }

    if info.cpu_count == 0 {
        return Err(KernelError::NotPresent { device: "madt cpus" });
    }
    Ok(info)
}

// ---------------------------------------------------------------------------
// Firmware scanning (identity-addressed physical memory)
// ---------------------------------------------------------------------------

/// Locate the RSDP: first the EBDA (segment pointer at BIOS_DATA_ADDR +
/// 0x0E, first KiB), then the upper BIOS ROM.
#[cfg(target_arch = "x86")]
pub fn find_rsdp() -> Option<u32> {
    // SAFETY: the BIOS data area and ROM regions are identity-addressed
    // and always readable this early.
    unsafe {
        let ebda_segment =
            core::ptr::read_volatile((layout::BIOS_DATA_ADDR as usize + 0x0E) as *const u16);
        let ebda = (ebda_segment as u32) << 4;
        if ebda != 0 {
            let region = core::slice::from_raw_parts(ebda as usize as *const u8, 1024);
            if let Some(found) = find_rsdp_in(region, ebda) {
                return Some(found);
            }
        }

        let len = (layout::MAIN_BIOS_END - layout::MAIN_BIOS_START) as usize;
        let region =
            core::slice::from_raw_parts(layout::MAIN_BIOS_START as usize as *const u8, len);
        find_rsdp_in(region, layout::MAIN_BIOS_START)
    }
}

/// Borrow a whole SDT (header + payload) at a physical address.
///
/// # Safety
///
/// `addr` must point at a well-formed SDT in identity-addressed memory.
#[cfg(target_arch = "x86")]
unsafe fn sdt_at(addr: u32) -> &'static [u8] {
    // SAFETY: caller contract; the header's length field covers the table.
    unsafe {
        let header = &*(addr as usize as *const SdtHeader);
        core::slice::from_raw_parts(addr as usize as *const u8, header.length as usize)
    }
}

/// Walk the RSDT's pointer array for the table with `signature`.
#[cfg(target_arch = "x86")]
fn find_sdt(rsdt_addr: u32, signature: &[u8; 4]) -> Option<u32> {
    // SAFETY: the RSDP gave us the RSDT address; firmware tables sit in
    // identity-addressed memory.
    let rsdt = unsafe { sdt_at(rsdt_addr) };
    let mut offset = SDT_HEADER_LEN;
    while offset + 4 <= rsdt.len() {
        let ptr = u32::from_le_bytes(rsdt[offset..offset + 4].try_into().expect("in bounds"));
        // SAFETY: each RSDT pointer names another firmware table.
        let table = unsafe { sdt_at(ptr) };
        if table[..4] == signature[..] {
            return Some(ptr);
        }
        offset += 4;
    }
    None
}

/// Find and parse the MADT. The APIC is required hardware: callers treat
/// failure as fatal.
#[cfg(target_arch = "x86")]
pub fn discover() -> KernelResult<MadtInfo> {
    let rsdp_addr = find_rsdp().ok_or(KernelError::NotPresent { device: "rsdp" })?;
    // SAFETY: find_rsdp validated the structure at this address.
    let rsdp =
        unsafe { core::slice::from_raw_parts(rsdp_addr as usize as *const u8, RSDP_V1_LEN) };
    let rsdt_addr = rsdp_rsdt_addr(rsdp);

    let madt_addr = find_sdt(rsdt_addr, MADT_SIGNATURE)
        .ok_or(KernelError::NotPresent { device: "madt" })?;
    // SAFETY: find_sdt returned a table whose header length bounds it.
    let madt = unsafe { sdt_at(madt_addr) };
    parse_madt(madt)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn make_rsdp(rsdt_addr: u32, corrupt: bool) -> [u8; RSDP_V1_LEN] {
        let mut rsdp = [0u8; RSDP_V1_LEN];
        rsdp[..8].copy_from_slice(RSDP_SIGNATURE);
        rsdp[9..15].copy_from_slice(b"FERROX");
        rsdp[15] = 0; // revision: ACPI 1.0
        rsdp[16..20].copy_from_slice(&rsdt_addr.to_le_bytes());
        let sum = checksum_8(&rsdp);
        rsdp[8] = 0u8.wrapping_sub(sum);
        if corrupt {
            rsdp[8] = rsdp[8].wrapping_add(1);
        }
        rsdp
    }

    #[test]
    fn checksum_folds_to_zero_on_valid_tables() {
        let rsdp = make_rsdp(0x1234_5678, false);
        assert_eq!(checksum_8(&rsdp), 0);
        let bad = make_rsdp(0x1234_5678, true);
        assert_ne!(checksum_8(&bad), 0);
    }

    #[test]
    fn scan_skips_bad_checksum_candidates() {
        // Region with a corrupt candidate at +16 and a valid one at +64.
        let mut region = vec![0u8; 128];
        region[16..36].copy_from_slice(&make_rsdp(0xAAAA_0000, true));
        region[64..84].copy_from_slice(&make_rsdp(0xBBBB_0000, false));

        let found = find_rsdp_in(&region, 0xE_0000).expect("valid candidate found");
        assert_eq!(found, 0xE_0000 + 64);
    }

    #[test]
    fn scan_reports_nothing_on_a_clean_region() {
        let region = vec![0u8; 256];
        assert_eq!(find_rsdp_in(&region, 0), None);
    }

    #[test]
    fn rsdt_address_is_read_from_the_rsdp() {
        let rsdp = make_rsdp(0x0BAD_CAFE, false);
        assert_eq!(rsdp_rsdt_addr(&rsdp), 0x0BAD_CAFE);
    }

    fn make_madt(records: &[&[u8]]) -> Vec<u8> {
        let mut table = vec![0u8; SDT_HEADER_LEN];
        table[..4].copy_from_slice(MADT_SIGNATURE);
        table.extend_from_slice(&0xFEE0_0000u32.to_le_bytes()); // LAPIC base
        table.extend_from_slice(&1u32.to_le_bytes()); // flags: PC-AT compat
        for r in records {
            table.extend_from_slice(r);
        }
        let len = table.len() as u32;
        table[4..8].copy_from_slice(&len.to_le_bytes());
        table
    }

    fn lapic_record(pid: u8, apic_id: u8) -> Vec<u8> {
        let mut r = vec![0u8, 8, pid, apic_id];
        r.extend_from_slice(&1u32.to_le_bytes()); // enabled
        r
    }

    fn ioapic_record(id: u8, addr: u32, gsi: u32) -> Vec<u8> {
        let mut r = vec![1u8, 12, id, 0];
        r.extend_from_slice(&addr.to_le_bytes());
        r.extend_from_slice(&gsi.to_le_bytes());
        r
    }

    #[test]
    fn madt_walk_records_cpus_in_order_and_the_first_ioapic() {
        let iso = [2u8, 10, 0, 0, 0, 0, 0, 0, 0, 0]; // override: skipped
        let table = make_madt(&[
            &lapic_record(0, 0),
            &iso,
            &lapic_record(1, 1),
            &ioapic_record(2, 0xFEC0_0000, 0),
            &ioapic_record(3, 0xFEC1_0000, 24),
        ]);

        let info = parse_madt(&table).expect("well-formed MADT");
        assert_eq!(info.lapic_addr, 0xFEE0_0000);
        assert_eq!(info.cpu_count, 2);
        assert_eq!(
            info.cpus[0].expect("boot cpu").apic_id,
            0,
            "first record is the boot CPU"
        );
        assert_eq!(info.cpus[1].expect("second cpu").apic_id, 1);
        assert_eq!(
            info.ioapic.expect("first ioapic recorded").address,
            0xFEC0_0000
        );
        assert_eq!(info.ioapic_count, 2);
    }

    #[test]
    fn madt_with_no_processors_is_an_error() {
        let table = make_madt(&[&ioapic_record(1, 0xFEC0_0000, 0)]);
        assert!(parse_madt(&table).is_err());
    }

    #[test]
    fn processors_beyond_the_cap_are_counted_not_recorded() {
        let mut records = Vec::new();
        for i in 0..12u8 {
            records.push(lapic_record(i, i));
        }
        let refs: Vec<&[u8]> = records.iter().map(|r| r.as_slice()).collect();
        let table = make_madt(&refs);
        let info = parse_madt(&table).expect("parse");
        assert_eq!(info.cpu_count, 12);
        assert_eq!(info.cpus.iter().flatten().count(), crate::config::MAX_CPUS);
    }
}
