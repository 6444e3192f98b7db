//! ATA PIO driver
//!
//! LBA28 sector I/O on the primary channel, polled status, no DMA. The
//! FAT32 volume lives on the slave drive. The driver only has to honor
//! the `BlockDevice` contract the filesystem expects.

use alloc::string::String;

use x86_64::instructions::port::Port;

use crate::{error::FsError, fs::blockdev::BlockDevice};

const ATA_PRIMARY_IO: u16 = 0x1F0;
const ATA_PRIMARY_CTRL: u16 = 0x3F6;

const SECTOR_SIZE: usize = 512;

// Status register bits
const STATUS_ERR: u8 = 0x01;
const STATUS_DRQ: u8 = 0x08;
const STATUS_DF: u8 = 0x20;
const STATUS_BSY: u8 = 0x80;

// Commands
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;
const CMD_IDENTIFY: u8 = 0xEC;

/// Register offsets from the I/O base.
const REG_DATA: u16 = 0;
const REG_SECTOR_COUNT: u16 = 2;
const REG_LBA_LOW: u16 = 3;
const REG_LBA_MID: u16 = 4;
const REG_LBA_HIGH: u16 = 5;
const REG_DRIVE: u16 = 6;
const REG_COMMAND: u16 = 7;

const POLL_LIMIT: u32 = 1_000_000;

/// One ATA drive on the primary channel.
pub struct AtaDrive {
    name: String,
    io_base: u16,
    ctrl_base: u16,
    slave: bool,
    sectors: u64,
}

impl AtaDrive {
    /// The secondary (slave) drive of the primary channel, where the
    /// FAT32 volume is expected.
    pub fn primary_slave() -> Self {
        Self {
            name: String::from("ata0-slave"),
            io_base: ATA_PRIMARY_IO,
            ctrl_base: ATA_PRIMARY_CTRL,
            slave: true,
            sectors: 0,
        }
    }

    pub fn primary_master() -> Self {
        Self {
            name: String::from("ata0-master"),
            io_base: ATA_PRIMARY_IO,
            ctrl_base: ATA_PRIMARY_CTRL,
            slave: false,
            sectors: 0,
        }
    }

    fn read_status(&mut self) -> u8 {
        let mut port: Port<u8> = Port::new(self.io_base + REG_COMMAND);
        // SAFETY: reading the ATA status register has no side effect
        // beyond clearing the interrupt condition, which polled PIO wants.
        unsafe { port.read() }
    }

    fn write_reg(&mut self, offset: u16, value: u8) {
        let mut port: Port<u8> = Port::new(self.io_base + offset);
        // SAFETY: offset names a register of the primary ATA channel and
        // the value follows the command protocol.
        unsafe { port.write(value) }
    }

    fn wait_not_busy(&mut self) -> Result<(), FsError> {
        for _ in 0..POLL_LIMIT {
            let status = self.read_status();
            if status & STATUS_BSY == 0 {
                return Ok(());
            }
        }
        Err(FsError::IoError)
    }

    fn wait_data_request(&mut self) -> Result<(), FsError> {
        for _ in 0..POLL_LIMIT {
            let status = self.read_status();
            if status & (STATUS_ERR | STATUS_DF) != 0 {
                return Err(FsError::IoError);
            }
            if status & STATUS_BSY == 0 && status & STATUS_DRQ != 0 {
                return Ok(());
            }
        }
        Err(FsError::IoError)
    }

    /// Select the drive and program an LBA28 address + sector count.
    fn setup_transfer(&mut self, lba: u32, count: u8) -> Result<(), FsError> {
        if lba >= 1 << 28 {
            return Err(FsError::IoError);
        }
        self.wait_not_busy()?;
        let select = if self.slave { 0xF0 } else { 0xE0 };
        self.write_reg(REG_DRIVE, select | ((lba >> 24) as u8 & 0x0F));
        self.write_reg(REG_SECTOR_COUNT, count);
        self.write_reg(REG_LBA_LOW, lba as u8);
        self.write_reg(REG_LBA_MID, (lba >> 8) as u8);
        self.write_reg(REG_LBA_HIGH, (lba >> 16) as u8);
        Ok(())
    }

    fn read_sector(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), FsError> {
        self.setup_transfer(lba, 1)?;
        self.write_reg(REG_COMMAND, CMD_READ_SECTORS);
        self.wait_data_request()?;
        let mut data: Port<u16> = Port::new(self.io_base + REG_DATA);
        for chunk in buf.chunks_exact_mut(2) {
            // SAFETY: DRQ is set, so the drive has a sector ready in its
            // data register.
            let word = unsafe { data.read() };
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    fn write_sector(&mut self, lba: u32, buf: &[u8]) -> Result<(), FsError> {
        self.setup_transfer(lba, 1)?;
        self.write_reg(REG_COMMAND, CMD_WRITE_SECTORS);
        self.wait_data_request()?;
        let mut data: Port<u16> = Port::new(self.io_base + REG_DATA);
        for chunk in buf.chunks_exact(2) {
            let word = u16::from_le_bytes([chunk[0], chunk[1]]);
            // SAFETY: DRQ is set, so the drive expects sector data.
            unsafe { data.write(word) };
        }
        self.write_reg(REG_COMMAND, CMD_CACHE_FLUSH);
        self.wait_not_busy()
    }

    /// IDENTIFY the drive; returns an error when no device responds.
    pub fn identify(&mut self) -> Result<(), FsError> {
        self.wait_not_busy()?;
        let select = if self.slave { 0xB0 } else { 0xA0 };
        self.write_reg(REG_DRIVE, select);
        self.write_reg(REG_SECTOR_COUNT, 0);
        self.write_reg(REG_LBA_LOW, 0);
        self.write_reg(REG_LBA_MID, 0);
        self.write_reg(REG_LBA_HIGH, 0);
        self.write_reg(REG_COMMAND, CMD_IDENTIFY);

        if self.read_status() == 0 {
            return Err(FsError::IoError); // no device
        }
        self.wait_data_request()?;

        let mut data: Port<u16> = Port::new(self.io_base + REG_DATA);
        let mut identify = [0u16; 256];
        for word in identify.iter_mut() {
            // SAFETY: DRQ is set; IDENTIFY data is 256 words.
            *word = unsafe { data.read() };
        }
        // Words 60-61: total addressable LBA28 sectors
        self.sectors = identify[60] as u64 | ((identify[61] as u64) << 16);
        println!("[ATA] {} ready, {} sectors", self.name, self.sectors);

        // Disable interrupts from this channel; the driver polls.
        let mut ctrl: Port<u8> = Port::new(self.ctrl_base);
        // SAFETY: setting nIEN in the device control register.
        unsafe { ctrl.write(0x02) };
        Ok(())
    }
}

impl BlockDevice for AtaDrive {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn block_count(&self) -> u64 {
        self.sectors
    }

    fn read_blocks(&mut self, start_block: u64, buffer: &mut [u8]) -> Result<(), FsError> {
        if buffer.len() % SECTOR_SIZE != 0 {
            return Err(FsError::IoError);
        }
        for (i, chunk) in buffer.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.read_sector((start_block + i as u64) as u32, chunk)?;
        }
        Ok(())
    }

    fn write_blocks(&mut self, start_block: u64, buffer: &[u8]) -> Result<(), FsError> {
        if buffer.len() % SECTOR_SIZE != 0 {
            return Err(FsError::IoError);
        }
        for (i, chunk) in buffer.chunks_exact(SECTOR_SIZE).enumerate() {
            self.write_sector((start_block + i as u64) as u32, chunk)?;
        }
        Ok(())
    }
}
