//! Per-node flash, UICR registers and snapshot persistence.
//!
//! Flash is a plain byte image that erases to 0xFF. The UICR customer words
//! carry the factory settings a real device is provisioned with. Snapshots
//! concatenate all node images behind a fixed header so a simulation can be
//! restarted against the exact same persisted state.

use thiserror::Error;

/// First UICR customer word when factory settings are present.
pub const UICR_SETTINGS_MAGIC_WORD: u32 = 0xF07700;

/// Magic word marking a valid bootloader settings page.
pub const BOOTLOADER_MAGIC_NUMBER: u32 = 0xF077_1234;

/// Number of UICR customer words modeled.
pub const UICR_CUSTOMER_WORDS: usize = 32;

/// Flash page size of the modeled chipset.
pub const FLASH_PAGE_SIZE: usize = 4096;

/// Snapshot format version.
pub const FLASH_FILE_VERSION: u32 = 1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FlashError {
    #[error("snapshot header mismatch, ignoring savefile")]
    CorruptOrOutdatedSavefile,
    #[error("write outside the flash image")]
    OutOfBounds,
}

// UICR customer word layout.
const UICR_MAGIC: usize = 0;
const UICR_BOARD_TYPE: usize = 1;
const UICR_SERIAL_INDEX: usize = 2;
const UICR_NODE_KEY: usize = 3; // 4 words
const UICR_NETWORK_ID: usize = 7;
const UICR_NODE_ID: usize = 8;
const UICR_DEVICE_TYPE: usize = 9;

/// One node's non-volatile state.
pub struct Flash {
    image: Vec<u8>,
    uicr: [u32; UICR_CUSTOMER_WORDS],
    /// Pending asynchronous flash operations. Resolved by the step driver.
    pub pending_async_operations: u32,
}

impl Flash {
    pub fn new(size: usize) -> Flash {
        Flash {
            image: vec![0xFF; size],
            uicr: [0xFFFF_FFFF; UICR_CUSTOMER_WORDS],
            pending_async_operations: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.image.len()
    }

    /// Factory provisioning: magic word, board type, serial index and a node
    /// key derived from the serial index.
    pub fn seed_uicr(&mut self, serial_index: u32, board_type: u32) {
        self.uicr = [0xFFFF_FFFF; UICR_CUSTOMER_WORDS];
        self.uicr[UICR_MAGIC] = UICR_SETTINGS_MAGIC_WORD;
        self.uicr[UICR_BOARD_TYPE] = board_type;
        self.uicr[UICR_SERIAL_INDEX] = serial_index;
        for i in 0..4 {
            self.uicr[UICR_NODE_KEY + i] = serial_index.wrapping_mul(0x9E37_79B9).wrapping_add(i as u32);
        }
    }

    pub fn uicr_magic_present(&self) -> bool {
        self.uicr[UICR_MAGIC] == UICR_SETTINGS_MAGIC_WORD
    }

    pub fn serial_index(&self) -> u32 {
        self.uicr[UICR_SERIAL_INDEX]
    }

    pub fn node_key(&self) -> [u8; 16] {
        let mut key = [0u8; 16];
        for i in 0..4 {
            key[i * 4..i * 4 + 4].copy_from_slice(&self.uicr[UICR_NODE_KEY + i].to_le_bytes());
        }
        key
    }

    pub fn set_uicr_identity(&mut self, network_id: u16, node_id: u16, device_type: u8) {
        self.uicr[UICR_NETWORK_ID] = network_id as u32;
        self.uicr[UICR_NODE_ID] = node_id as u32;
        self.uicr[UICR_DEVICE_TYPE] = device_type as u32;
    }

    pub fn uicr_network_id(&self) -> Option<u16> {
        match self.uicr[UICR_NETWORK_ID] {
            0xFFFF_FFFF => None,
            v => Some(v as u16),
        }
    }

    pub fn uicr_node_id(&self) -> Option<u16> {
        match self.uicr[UICR_NODE_ID] {
            0xFFFF_FFFF => None,
            v => Some(v as u16),
        }
    }

    pub fn read(&self, addr: usize, len: usize) -> Option<&[u8]> {
        self.image.get(addr..addr + len)
    }

    /// Flash writes can only clear bits. The sim mirrors that so firmware
    /// bugs that skip the erase show up in tests.
    pub fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), FlashError> {
        let slice = self
            .image
            .get_mut(addr..addr + data.len())
            .ok_or(FlashError::OutOfBounds)?;
        for (dst, src) in slice.iter_mut().zip(data) {
            *dst &= *src;
        }
        Ok(())
    }

    pub fn erase_page(&mut self, page_address: usize) -> Result<(), FlashError> {
        let start = page_address - (page_address % FLASH_PAGE_SIZE);
        let slice = self
            .image
            .get_mut(start..start + FLASH_PAGE_SIZE)
            .ok_or(FlashError::OutOfBounds)?;
        slice.fill(0xFF);
        Ok(())
    }

    /// Wipes the whole image back to erased state.
    pub fn mass_erase(&mut self) {
        self.image.fill(0xFF);
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn load_image(&mut self, data: &[u8]) {
        self.image.copy_from_slice(data);
    }

    /// Marks the bootloader settings page as present after boot.
    pub fn place_bootloader_settings_marker(&mut self) -> Result<(), FlashError> {
        let addr = self.image.len() - FLASH_PAGE_SIZE;
        self.erase_page(addr)?;
        self.write(addr, &BOOTLOADER_MAGIC_NUMBER.to_le_bytes())
    }

    pub fn bootloader_settings_present(&self) -> bool {
        let addr = self.image.len() - FLASH_PAGE_SIZE;
        self.read(addr, 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) == BOOTLOADER_MAGIC_NUMBER)
            .unwrap_or(false)
    }

    fn settings_page_address(&self) -> usize {
        self.image.len() - 2 * FLASH_PAGE_SIZE
    }

    /// Persists the node configuration record. This is what makes enrollment
    /// survive snapshot round-trips.
    pub fn write_settings_record(&mut self, record: &SettingsRecord) -> Result<(), FlashError> {
        let addr = self.settings_page_address();
        self.erase_page(addr)?;
        self.write(addr, &record.encode())
    }

    pub fn read_settings_record(&self) -> Option<SettingsRecord> {
        let data = self.read(self.settings_page_address(), SettingsRecord::SIZE)?;
        SettingsRecord::decode(data)
    }
}

/// Persisted node configuration, stored in its own flash page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsRecord {
    pub network_id: u16,
    pub node_id: u16,
    pub device_type: u8,
    pub number_of_enrolled_devices: u16,
}

/// Marks a valid settings record.
pub const SETTINGS_MAGIC_NUMBER: u32 = 0xF012_F134;

impl SettingsRecord {
    pub const SIZE: usize = 12;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&SETTINGS_MAGIC_NUMBER.to_le_bytes());
        out[4..6].copy_from_slice(&self.network_id.to_le_bytes());
        out[6..8].copy_from_slice(&self.node_id.to_le_bytes());
        out[8] = self.device_type;
        out[9..11].copy_from_slice(&self.number_of_enrolled_devices.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<SettingsRecord> {
        if data.len() < Self::SIZE {
            return None;
        }
        if u32::from_le_bytes([data[0], data[1], data[2], data[3]]) != SETTINGS_MAGIC_NUMBER {
            return None;
        }
        Some(SettingsRecord {
            network_id: u16::from_le_bytes([data[4], data[5]]),
            node_id: u16::from_le_bytes([data[6], data[7]]),
            device_type: data[8],
            number_of_enrolled_devices: u16::from_le_bytes([data[9], data[10]]),
        })
    }
}

// =============================================================================
// SNAPSHOT FILE FORMAT
// =============================================================================

/// `FlashFileHeader` of the persisted snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashFileHeader {
    pub version: u32,
    pub size_of_header: u32,
    pub flash_size: u32,
    pub amount_of_nodes: u32,
}

impl FlashFileHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..8].copy_from_slice(&self.size_of_header.to_le_bytes());
        out[8..12].copy_from_slice(&self.flash_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.amount_of_nodes.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<FlashFileHeader> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(FlashFileHeader {
            version: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            size_of_header: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            flash_size: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            amount_of_nodes: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
        })
    }
}

/// Serializes all node images in node-index order behind the header.
pub fn store_flash_snapshot(images: &[&[u8]]) -> Vec<u8> {
    let flash_size = images.first().map(|i| i.len()).unwrap_or(0);
    let header = FlashFileHeader {
        version: FLASH_FILE_VERSION,
        size_of_header: FlashFileHeader::SIZE as u32,
        flash_size: flash_size as u32,
        amount_of_nodes: images.len() as u32,
    };
    let mut out = Vec::with_capacity(FlashFileHeader::SIZE + flash_size * images.len());
    out.extend_from_slice(&header.encode());
    for image in images {
        out.extend_from_slice(image);
    }
    out
}

/// Validates and splits a snapshot. Rejects on any header or length mismatch;
/// the caller keeps the file untouched in that case.
pub fn load_flash_snapshot(
    data: &[u8],
    expected_flash_size: usize,
    expected_nodes: usize,
) -> Result<Vec<&[u8]>, FlashError> {
    let header = FlashFileHeader::decode(data).ok_or(FlashError::CorruptOrOutdatedSavefile)?;
    if header.version != FLASH_FILE_VERSION
        || header.size_of_header != FlashFileHeader::SIZE as u32
        || header.flash_size != expected_flash_size as u32
        || header.amount_of_nodes != expected_nodes as u32
    {
        return Err(FlashError::CorruptOrOutdatedSavefile);
    }
    let expected_total = FlashFileHeader::SIZE + expected_flash_size * expected_nodes;
    if data.len() != expected_total {
        return Err(FlashError::CorruptOrOutdatedSavefile);
    }
    Ok(data[FlashFileHeader::SIZE..]
        .chunks(expected_flash_size)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_erases_to_ff_and_writes_and_bits() {
        let mut f = Flash::new(FLASH_PAGE_SIZE * 2);
        assert_eq!(f.read(0, 4).unwrap(), &[0xFF; 4]);
        f.write(0, &[0x0F, 0xF0, 0xAA, 0x55]).unwrap();
        assert_eq!(f.read(0, 4).unwrap(), &[0x0F, 0xF0, 0xAA, 0x55]);
        // A second write can only clear bits.
        f.write(0, &[0xF0, 0xF0, 0xFF, 0x00]).unwrap();
        assert_eq!(f.read(0, 4).unwrap(), &[0x00, 0xF0, 0xAA, 0x00]);
        f.erase_page(0).unwrap();
        assert_eq!(f.read(0, 4).unwrap(), &[0xFF; 4]);
    }

    #[test]
    fn out_of_bounds_write_fails() {
        let mut f = Flash::new(FLASH_PAGE_SIZE);
        assert_eq!(f.write(FLASH_PAGE_SIZE - 1, &[0, 0]), Err(FlashError::OutOfBounds));
    }

    #[test]
    fn uicr_provisioning() {
        let mut f = Flash::new(FLASH_PAGE_SIZE);
        assert!(!f.uicr_magic_present());
        f.seed_uicr(2673001, 4);
        assert!(f.uicr_magic_present());
        assert_eq!(f.serial_index(), 2673001);
        let k1 = f.node_key();
        f.seed_uicr(2673002, 4);
        assert_ne!(f.node_key(), k1);
    }

    #[test]
    fn bootloader_marker() {
        let mut f = Flash::new(FLASH_PAGE_SIZE * 4);
        assert!(!f.bootloader_settings_present());
        f.place_bootloader_settings_marker().unwrap();
        assert!(f.bootloader_settings_present());
    }

    #[test]
    fn settings_record_roundtrip() {
        let mut f = Flash::new(FLASH_PAGE_SIZE * 4);
        assert!(f.read_settings_record().is_none());
        let record = SettingsRecord {
            network_id: 10,
            node_id: 7,
            device_type: 3,
            number_of_enrolled_devices: 12,
        };
        f.write_settings_record(&record).unwrap();
        assert_eq!(f.read_settings_record(), Some(record));
        // The record lives in the image, so snapshots carry it.
        let file = store_flash_snapshot(&[f.image()]);
        let images = load_flash_snapshot(&file, f.size(), 1).unwrap();
        let mut restored = Flash::new(FLASH_PAGE_SIZE * 4);
        restored.load_image(images[0]);
        assert_eq!(restored.read_settings_record(), Some(record));
    }

    #[test]
    fn snapshot_roundtrip() {
        let a = vec![1u8; 64];
        let b = vec![2u8; 64];
        let file = store_flash_snapshot(&[&a, &b]);
        let images = load_flash_snapshot(&file, 64, 2).unwrap();
        assert_eq!(images[0], &a[..]);
        assert_eq!(images[1], &b[..]);
    }

    #[test]
    fn snapshot_rejects_mismatches() {
        let a = vec![1u8; 64];
        let file = store_flash_snapshot(&[&a]);
        assert!(load_flash_snapshot(&file, 32, 1).is_err());
        assert!(load_flash_snapshot(&file, 64, 2).is_err());
        let mut truncated = file.clone();
        truncated.pop();
        assert!(load_flash_snapshot(&truncated, 64, 1).is_err());
        let mut wrong_version = file.clone();
        wrong_version[0] = 9;
        assert!(load_flash_snapshot(&wrong_version, 64, 1).is_err());
    }
}
