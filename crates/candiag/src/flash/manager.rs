//! Flash programming over UDS
//!
//! A run enters the programming session, unlocks security access when a key
//! is configured, then writes every block with
//! RequestDownload (0x34) / TransferData (0x36) / RequestTransferExit (0x37).
//! With `verify_after_write` each block is read back through RequestUpload
//! (0x35) and compared byte for byte.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::block::{calculate_checksum, FlashBlock};
use super::error::FlashError;
use super::file::FlashFile;
use super::region::{self, FlashRegion};
use crate::config::FlashConfig;
use crate::uds::{routine_id, xor_key, RoutineControlType, SessionType, UdsClient, UdsError};

/// `[addressAndLengthFormat]` prefix of the erase routine option record
const ERASE_ADDRESS_AND_LENGTH_FORMAT: u8 = 0x44;

/// One progress notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashProgress {
    pub operation: &'static str,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

impl FlashProgress {
    pub fn new(
        operation: &'static str,
        current: usize,
        total: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            current,
            total,
            message: message.into(),
        }
    }
}

impl fmt::Display for FlashProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}/{}] {}",
            self.operation, self.current, self.total, self.message
        )
    }
}

/// Counters for the most recent programming run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlashStatistics {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_blocks: usize,
    pub blocks_written: usize,
    pub blocks_verified: usize,
    pub blocks_failed: usize,
    pub total_bytes: usize,
    pub bytes_written: usize,
    pub checksum_errors: usize,
    pub timeout_errors: usize,
}

impl FlashStatistics {
    /// Elapsed time of the run, up to now while it is still going
    pub fn duration(&self) -> Duration {
        let Some(start) = self.start_time else {
            return Duration::ZERO;
        };
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - start).to_std().unwrap_or(Duration::ZERO)
    }

    /// Bytes written per second
    pub fn average_speed(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs > 0.0 {
            self.bytes_written as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for FlashStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} blocks, {}/{} bytes written, {} verified, {} failed, {:.2}s ({:.0} B/s)",
            self.blocks_written,
            self.total_blocks,
            self.bytes_written,
            self.total_bytes,
            self.blocks_verified,
            self.blocks_failed,
            self.duration().as_secs_f64(),
            self.average_speed()
        )
    }
}

/// TransferData block sequence counter
///
/// Wraps to `wrap` after 0xFF.
struct BlockCounter {
    next: u8,
    wrap: u8,
}

impl BlockCounter {
    fn new(start: u8, wrap: u8) -> Self {
        Self { next: start, wrap }
    }

    fn advance(&mut self) -> u8 {
        let current = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == 0 && self.wrap > 0 {
            self.next = self.wrap;
        }
        current
    }
}

/// Drives firmware programming on one ECU
pub struct FlashManager {
    uds: Arc<UdsClient>,
    config: FlashConfig,
    stats: Mutex<FlashStatistics>,
}

impl FlashManager {
    pub fn new(uds: Arc<UdsClient>, config: FlashConfig) -> Self {
        Self {
            uds,
            config,
            stats: Mutex::new(FlashStatistics::default()),
        }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    pub fn statistics(&self) -> FlashStatistics {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = FlashStatistics::default();
    }

    /// Whether `address` may be written; any address may when no regions
    /// are configured
    pub fn validate_address(&self, address: u32) -> bool {
        self.config.regions.is_empty() || region::validate_address(address, &self.config.regions)
    }

    /// Configured memory regions; empty means any address is accepted
    pub fn regions(&self) -> &[FlashRegion] {
        &self.config.regions
    }

    pub fn find_region_for_address(&self, address: u32) -> Option<&FlashRegion> {
        region::find_region_for_address(address, &self.config.regions)
    }

    // =========================================================================
    // Session / Security
    // =========================================================================

    pub fn is_in_bootloader_mode(&self) -> bool {
        self.uds.current_session() == SessionType::Programming
    }

    /// Switch the ECU to the programming session
    ///
    /// A refusal or an unanswered request is `BootloaderEntryFailed`.
    pub async fn enter_bootloader_mode(&self) -> Result<(), FlashError> {
        match self.uds.start_session(SessionType::Programming).await {
            Ok(true) => {
                info!("Entered programming session");
                Ok(())
            }
            Ok(false) => {
                error!(error = ?self.uds.last_error(), "Programming session refused");
                Err(FlashError::BootloaderEntryFailed)
            }
            Err(UdsError::Timeout(after)) => {
                error!(?after, "Programming session request not answered");
                Err(FlashError::BootloaderEntryFailed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Back to the default session
    pub async fn exit_bootloader_mode(&self) -> Result<bool, FlashError> {
        Ok(self.uds.start_session(SessionType::Default).await?)
    }

    /// Unlock the configured security level; skipped without a key
    ///
    /// The configured key is the shared secret: the ECU expects
    /// `seed ^ secret`.
    pub async fn unlock_security(&self) -> Result<(), FlashError> {
        let secret = self.config.security_key_bytes()?;
        if secret.is_empty() {
            debug!("No security key configured, skipping security access");
            return Ok(());
        }
        let level = self.config.security_level;
        let unlocked = self
            .uds
            .unlock_security_access_with(level, |seed| xor_key(seed, &secret))
            .await?;
        if !unlocked {
            error!(level, error = ?self.uds.last_error(), "Security access denied");
            return Err(FlashError::SecurityAccessDenied(level));
        }
        Ok(())
    }

    // =========================================================================
    // Programming
    // =========================================================================

    pub async fn program_flash(&self, file: &FlashFile) -> Result<(), FlashError> {
        self.program_flash_with_progress(file, |_| {}).await
    }

    /// Program every block of `file`, reporting progress per block
    ///
    /// The whole run is bounded by the configured flash timeout. Statistics
    /// are reset at the start and remain readable after a failure.
    pub async fn program_flash_with_progress<F>(
        &self,
        file: &FlashFile,
        mut progress: F,
    ) -> Result<(), FlashError>
    where
        F: FnMut(&FlashProgress) + Send,
    {
        if !file.validate() {
            return Err(FlashError::InvalidFile(
                "image is empty or has overlapping blocks".to_string(),
            ));
        }

        *self.stats.lock() = FlashStatistics {
            start_time: Some(Utc::now()),
            total_blocks: file.blocks().len(),
            total_bytes: file.total_size(),
            ..Default::default()
        };
        info!(%file, "Starting flash programming");

        let limit = self.config.timeout();
        let result = match tokio::time::timeout(limit, self.run_programming(file, &mut progress))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(FlashError::Timeout(limit)),
        };

        let mut stats = self.stats.lock();
        stats.end_time = Some(Utc::now());
        match &result {
            Ok(()) => info!(stats = %*stats, "Flash programming completed"),
            Err(e) => error!(error = %e, stats = %*stats, "Flash programming failed"),
        }
        result
    }

    async fn run_programming<F>(&self, file: &FlashFile, progress: &mut F) -> Result<(), FlashError>
    where
        F: FnMut(&FlashProgress) + Send,
    {
        self.check_layout(file)?;
        self.enter_bootloader_mode().await?;
        self.unlock_security().await?;

        let total = file.blocks().len();
        let mut counter = BlockCounter::new(
            self.config.block_counter_start,
            self.config.block_counter_wrap,
        );
        for (index, block) in file.blocks().iter().enumerate() {
            progress(&FlashProgress::new(
                "Programming",
                index,
                total,
                format!("Block {}", index + 1),
            ));
            if let Err(e) = self.program_block(block, &mut counter).await {
                self.stats.lock().blocks_failed += 1;
                return Err(e);
            }
            let mut stats = self.stats.lock();
            stats.blocks_written += 1;
            stats.bytes_written += block.len();
        }

        if self.config.verify_after_write {
            self.verify_blocks(file.blocks(), progress).await?;
        }

        progress(&FlashProgress::new(
            "Complete",
            1,
            1,
            "Programming completed successfully",
        ));
        Ok(())
    }

    fn check_layout(&self, file: &FlashFile) -> Result<(), FlashError> {
        if self.config.regions.is_empty() {
            return Ok(());
        }
        for block in file.blocks() {
            match self.find_region_for_address(block.address) {
                None => {
                    return Err(FlashError::InvalidAddress {
                        address: block.address,
                    })
                }
                Some(region) if region.protected => {
                    return Err(FlashError::RegionProtected {
                        name: region.name.clone(),
                        address: block.address,
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn program_block(
        &self,
        block: &FlashBlock,
        counter: &mut BlockCounter,
    ) -> Result<(), FlashError> {
        let address = block.address;
        let size = block_size_u32(block)?;
        debug!(block = %block, "Programming block");

        if self.config.erase_before_write {
            self.erase_range(address, size).await?;
        }

        let max_block_length = self
            .uds
            .request_download(address, size)
            .await
            .map_err(|e| self.transfer_error(address, e))?
            .ok_or_else(|| self.programming_failed(address, "RequestDownload rejected"))?;

        // The ECU's limit includes the SID and the sequence counter
        let chunk_size = match max_block_length {
            0..=2 => self.config.block_size,
            limit => self.config.block_size.min(limit as usize - 2),
        }
        .max(1);

        for chunk in block.data.chunks(chunk_size) {
            let sequence = counter.advance();
            let accepted = self
                .uds
                .transfer_data(sequence, chunk)
                .await
                .map_err(|e| self.transfer_error(address, e))?;
            if !accepted {
                return Err(self.programming_failed(address, "TransferData rejected"));
            }
        }

        let exited = self
            .uds
            .request_transfer_exit()
            .await
            .map_err(|e| self.transfer_error(address, e))?;
        if !exited {
            return Err(self.programming_failed(address, "RequestTransferExit rejected"));
        }
        debug!(
            address = format!("0x{:08X}", address),
            bytes = block.len(),
            crc32 = format!("0x{:08X}", block.checksum),
            "Block written"
        );
        Ok(())
    }

    fn programming_failed(&self, address: u32, step: &str) -> FlashError {
        let reason = match self.uds.last_error() {
            Some(info) => format!("{}: {}", step, info.description),
            None => step.to_string(),
        };
        warn!(address = format!("0x{:08X}", address), %reason, "Block programming failed");
        FlashError::ProgrammingFailed { address, reason }
    }

    fn transfer_error(&self, address: u32, source: UdsError) -> FlashError {
        if matches!(source, UdsError::Timeout(_)) {
            self.stats.lock().timeout_errors += 1;
        }
        FlashError::Transfer { address, source }
    }

    async fn erase_range(&self, address: u32, size: u32) -> Result<(), FlashError> {
        let mut option = Vec::with_capacity(9);
        option.push(ERASE_ADDRESS_AND_LENGTH_FORMAT);
        option.extend_from_slice(&address.to_be_bytes());
        option.extend_from_slice(&size.to_be_bytes());

        let accepted = self
            .uds
            .routine_accepted(RoutineControlType::Start, routine_id::ERASE_MEMORY, &option)
            .await
            .map_err(|e| self.transfer_error(address, e))?;
        if !accepted {
            warn!(address = format!("0x{:08X}", address), size, "Erase rejected");
            return Err(FlashError::EraseFailed { address });
        }
        debug!(address = format!("0x{:08X}", address), size, "Memory erased");
        Ok(())
    }

    /// Erase a whole configured region
    pub async fn erase_flash(&self, region: &FlashRegion) -> Result<(), FlashError> {
        if region.protected {
            return Err(FlashError::RegionProtected {
                name: region.name.clone(),
                address: region.start_address,
            });
        }
        let size = u32::try_from(region.size()).map_err(|_| FlashError::EraseFailed {
            address: region.start_address,
        })?;
        info!(%region, "Erasing region");
        self.erase_range(region.start_address, size).await
    }

    // =========================================================================
    // Read back / Verification
    // =========================================================================

    /// Read back every block of `file` and compare it with the image
    pub async fn verify_flash(&self, file: &FlashFile) -> Result<(), FlashError> {
        self.verify_blocks(file.blocks(), &mut |_: &FlashProgress| {})
            .await
    }

    async fn verify_blocks<F>(&self, blocks: &[FlashBlock], progress: &mut F) -> Result<(), FlashError>
    where
        F: FnMut(&FlashProgress) + Send,
    {
        let total = blocks.len();
        for (index, block) in blocks.iter().enumerate() {
            progress(&FlashProgress::new(
                "Verifying",
                index,
                total,
                format!("Block {} at 0x{:08X}", index + 1, block.address),
            ));
            let size = block_size_u32(block)?;
            let read = self.read_memory(block.address, size).await?;

            if let Some(offset) = first_mismatch(&block.data, &read) {
                let address = block.address.wrapping_add(offset as u32);
                let mut stats = self.stats.lock();
                stats.checksum_errors += 1;
                stats.blocks_failed += 1;
                error!(
                    address = format!("0x{:08X}", address),
                    expected_crc = format!("0x{:08X}", block.checksum),
                    actual_crc = format!("0x{:08X}", calculate_checksum(&read)),
                    "Verification mismatch"
                );
                return Err(FlashError::VerificationFailed { address });
            }
            self.stats.lock().blocks_verified += 1;
        }
        info!(blocks = total, "Verification passed");
        Ok(())
    }

    /// Contents of a configured region
    pub async fn read_flash(&self, region: &FlashRegion) -> Result<Vec<u8>, FlashError> {
        self.read_flash_with_progress(region, |_| {}).await
    }

    pub async fn read_flash_with_progress<F>(
        &self,
        region: &FlashRegion,
        progress: F,
    ) -> Result<Vec<u8>, FlashError>
    where
        F: FnMut(&FlashProgress),
    {
        let size = u32::try_from(region.size()).map_err(|_| FlashError::ReadFailed {
            address: region.start_address,
            reason: "region larger than 4 GiB".to_string(),
        })?;
        self.read_memory_with_progress(region.start_address, size, progress)
            .await
    }

    /// Upload `size` bytes from `address`
    ///
    /// Each upload uses its own sequence counter starting at the configured
    /// start value.
    pub async fn read_memory(&self, address: u32, size: u32) -> Result<Vec<u8>, FlashError> {
        self.read_memory_with_progress(address, size, |_| {}).await
    }

    /// Like [`read_memory`](Self::read_memory), reporting `Reading` progress
    /// in bytes after every TransferData block
    pub async fn read_memory_with_progress<F>(
        &self,
        address: u32,
        size: u32,
        mut progress: F,
    ) -> Result<Vec<u8>, FlashError>
    where
        F: FnMut(&FlashProgress),
    {
        let read_failed = |step: &str| FlashError::ReadFailed {
            address,
            reason: match self.uds.last_error() {
                Some(info) => format!("{}: {}", step, info.description),
                None => step.to_string(),
            },
        };

        self.uds
            .request_upload(address, size)
            .await
            .map_err(|e| self.transfer_error(address, e))?
            .ok_or_else(|| read_failed("RequestUpload rejected"))?;

        let mut counter = BlockCounter::new(
            self.config.block_counter_start,
            self.config.block_counter_wrap,
        );
        let mut data = Vec::with_capacity(size as usize);
        while data.len() < size as usize {
            let chunk = self
                .uds
                .transfer_data_upload(counter.advance())
                .await
                .map_err(|e| self.transfer_error(address, e))?
                .ok_or_else(|| read_failed("TransferData rejected"))?;
            if chunk.is_empty() {
                return Err(FlashError::ReadFailed {
                    address,
                    reason: format!("ECU stopped after {} of {} bytes", data.len(), size),
                });
            }
            data.extend_from_slice(&chunk);
            let done = data.len().min(size as usize);
            progress(&FlashProgress::new(
                "Reading",
                done,
                size as usize,
                format!("0x{:08X}", u64::from(address) + done as u64),
            ));
        }

        let exited = self
            .uds
            .request_transfer_exit()
            .await
            .map_err(|e| self.transfer_error(address, e))?;
        if !exited {
            return Err(read_failed("RequestTransferExit rejected"));
        }
        data.truncate(size as usize);
        Ok(data)
    }
}

fn block_size_u32(block: &FlashBlock) -> Result<u32, FlashError> {
    u32::try_from(block.len()).map_err(|_| FlashError::InvalidFile(format!(
        "block at 0x{:08X} exceeds 4 GiB",
        block.address
    )))
}

fn first_mismatch(expected: &[u8], actual: &[u8]) -> Option<usize> {
    expected
        .iter()
        .zip(actual)
        .position(|(a, b)| a != b)
        .or_else(|| (expected.len() != actual.len()).then(|| expected.len().min(actual.len())))
}
