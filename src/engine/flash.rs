//! ESP32-S3 Flash Layout
//! Static region table for the 16MB Waveshare Touch-LCD-7 configuration

/// Total addressable flash on the device.
pub const FLASH_SIZE: u32 = 16 * 1024 * 1024;

/// Chip identifier passed to the flashing tool.
pub const CHIP: &str = "esp32s3";

/// Device identifier recorded in backup metadata.
pub const DEVICE: &str = "ESP32-S3-Touch-LCD-7";

/// Name of the best-effort whole-flash dump file inside a backup folder.
pub const FULL_DUMP_FILE: &str = "full_flash_16MB.bin";

/// One fixed slice of device flash holding a firmware component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    pub name: &'static str,
    pub offset: u32,
    pub size: u32,
}

impl FlashRegion {
    /// First address past the end of the region.
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// Flash regions in physical-layout (offset-ascending) order.
///
/// Both backup capture and restore replay iterate this table front to back;
/// later steps assume region files were produced in this exact order.
pub const FLASH_REGIONS: [FlashRegion; 7] = [
    FlashRegion { name: "bootloader", offset: 0x0, size: 0x8000 },
    FlashRegion { name: "partitions", offset: 0x8000, size: 0x1000 },
    FlashRegion { name: "nvs", offset: 0x9000, size: 0x5000 },
    FlashRegion { name: "otadata", offset: 0xE000, size: 0x2000 },
    FlashRegion { name: "app0", offset: 0x10000, size: 0x3F0000 },
    FlashRegion { name: "app1", offset: 0x400000, size: 0x3F0000 },
    FlashRegion { name: "spiffs", offset: 0x7F0000, size: 0x10000 },
];

/// Offset of the main application image (PlatformIO upload layout).
pub const APP_OFFSET: u32 = 0x10000;
