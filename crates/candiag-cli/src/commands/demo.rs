//! Demo command - a full diagnostic and flash session against the simulated ECU

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use candiag::flash::FlashBlock;
use candiag::uds::{standard_did, xor_key};
use candiag::{
    DiagConfig, FlashFile, FlashFileFormat, FlashManager, FlashProgress, ResetType, SessionType,
};
use indicatif::{ProgressBar, ProgressStyle};

use super::SimVehicle;
use crate::output::{DataRow, DtcRow, OutputContext};

/// Default image programmed when no file is given
const DEMO_IMAGE_ADDRESS: u32 = 0x0000_4000;
const DEMO_IMAGE_SIZE: usize = 4096;

pub async fn demo(
    config: &DiagConfig,
    image: Option<&Path>,
    clear_dtcs: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let vehicle = SimVehicle::new(config)?;
    let uds = &vehicle.uds;

    // Identification
    ctx.heading("Identification");
    if !uds.start_session(SessionType::ExtendedDiagnostic).await? {
        bail!("Extended session refused: {}", last_error(&vehicle));
    }
    let dids = [
        ("VIN", standard_did::VIN),
        ("Software version", standard_did::ECU_SOFTWARE_VERSION),
        ("Serial number", standard_did::ECU_SERIAL_NUMBER),
        ("Spare part number", standard_did::SPARE_PART_NUMBER),
    ];
    let mut rows = Vec::with_capacity(dids.len());
    for (name, did) in dids {
        let data = uds.read_data_by_identifier(did).await?;
        rows.push(DataRow {
            parameter: format!("{} (0x{:04X})", name, did),
            value: String::from_utf8_lossy(&data).into_owned(),
            raw: hex::encode(&data),
        });
    }
    ctx.print(&rows);

    let secret = vehicle.secret.clone();
    if !uds
        .unlock_security_access_with(0x01, |seed| xor_key(seed, &secret))
        .await?
    {
        bail!("Security access failed: {}", last_error(&vehicle));
    }
    ctx.success("Security access granted");

    // Trouble codes
    ctx.heading("UDS trouble codes");
    let rows: Vec<DtcRow> = uds
        .read_dtc_information(candiag::uds::dtc::sub_function::REPORT_DTC_BY_STATUS_MASK, 0xFF)
        .await?
        .into_iter()
        .map(|info| {
            let dtc = info.to_dtc();
            DtcRow {
                code: dtc.code,
                raw: format!("0x{:06X}", info.dtc_number),
                category: format!("{:?}", info.category()),
                status: format!("0x{:02X}", dtc.status_bits),
            }
        })
        .collect();
    ctx.print(&rows);

    ctx.heading("OBD-II live data");
    let supported: Vec<u8> = vehicle
        .obd
        .get_supported_pids()
        .await?
        .into_iter()
        .filter(|pid| pid % 0x20 != 0)
        .collect();
    let rows: Vec<DataRow> = vehicle
        .obd
        .read_multiple_parameters(&supported)
        .await
        .into_iter()
        .map(|p| DataRow {
            parameter: p.description.clone(),
            value: p.formatted_value(),
            raw: hex::encode(&p.raw_data),
        })
        .collect();
    ctx.print(&rows);

    ctx.heading("OBD-II stored codes");
    let rows: Vec<DtcRow> = vehicle
        .obd
        .read_stored_dtcs()
        .await?
        .into_iter()
        .map(|dtc| DtcRow {
            raw: dtc
                .raw()
                .map(|raw| format!("0x{:04X}", raw))
                .unwrap_or_default(),
            category: dtc
                .category()
                .map(|c| format!("{:?}", c))
                .unwrap_or_else(|| "-".to_string()),
            status: "stored".to_string(),
            code: dtc.code,
        })
        .collect();
    ctx.print(&rows);

    if clear_dtcs {
        let cleared = vehicle.obd.clear_dtcs().await?
            && uds
                .clear_diagnostic_information(candiag::uds::dtc_group::ALL)
                .await?;
        if cleared {
            ctx.success("Trouble codes cleared");
        } else {
            ctx.warn("Clearing trouble codes was refused");
        }
    }

    // Flash
    ctx.heading("Flash programming");
    let file = match image {
        Some(path) => FlashFile::load_from_file(path)
            .with_context(|| format!("Failed to parse firmware file: {}", path.display()))?,
        None => demo_image(),
    };
    ctx.info(&file.to_string());

    let mut flash_config = config.flash.clone();
    if flash_config.security_key.is_none() {
        flash_config.security_key = Some(hex::encode(&vehicle.secret));
    }
    let manager = FlashManager::new(uds.clone(), flash_config);

    let steps = if manager.config().verify_after_write {
        file.blocks().len() * 2
    } else {
        file.blocks().len()
    };
    let pb = if ctx.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(steps as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .map_err(|e| anyhow!("Invalid progress template: {}", e))?
            .progress_chars("=>-"),
    );

    let blocks = file.blocks().len();
    let bar = pb.clone();
    let result = manager
        .program_flash_with_progress(&file, move |progress: &FlashProgress| {
            let position = match progress.operation {
                "Verifying" => blocks + progress.current,
                "Complete" => steps,
                _ => progress.current,
            };
            bar.set_position(position as u64);
            bar.set_message(format!("{} {}", progress.operation, progress.message));
        })
        .await;

    match result {
        Ok(()) => pb.finish_with_message("Complete!"),
        Err(e) => {
            pb.abandon_with_message("Flash failed!");
            return Err(e).context("Flash programming failed");
        }
    }

    let stats = manager.statistics();
    ctx.print_kv(&[
        ("blocks written", format!("{}/{}", stats.blocks_written, stats.total_blocks)),
        ("blocks verified", stats.blocks_verified.to_string()),
        ("bytes written", format!("{}/{}", stats.bytes_written, stats.total_bytes)),
        ("duration", format!("{:.3}s", stats.duration().as_secs_f64())),
        ("throughput", format!("{:.0} B/s", stats.average_speed())),
    ]);

    manager.exit_bootloader_mode().await?;
    uds.reset_ecu(ResetType::Hard).await?;

    let uds_stats = uds.statistics();
    ctx.success(&format!(
        "Session complete: {} UDS request(s), {} negative, {} timeout(s)",
        uds_stats.requests_sent, uds_stats.negative_responses, uds_stats.timeouts
    ));
    Ok(())
}

fn last_error(vehicle: &SimVehicle) -> String {
    vehicle
        .uds
        .last_error()
        .map(|e| e.description)
        .unwrap_or_else(|| "no response".to_string())
}

/// Counting pattern, one block
fn demo_image() -> FlashFile {
    let data = (0..DEMO_IMAGE_SIZE).map(|i| (i % 251) as u8).collect();
    FlashFile::from_blocks(
        FlashFileFormat::Binary,
        vec![FlashBlock::new(DEMO_IMAGE_ADDRESS, data)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;

    #[test]
    fn test_demo_image_is_valid() {
        let file = demo_image();
        assert!(file.validate());
        assert_eq!(file.total_size(), DEMO_IMAGE_SIZE);
        assert_eq!(file.address_range().0, DEMO_IMAGE_ADDRESS);
    }

    #[tokio::test]
    async fn test_demo_runs_against_simulator() {
        let ctx = OutputContext::new(OutputFormat::Json, true, true);
        demo(&DiagConfig::default(), None, true, &ctx).await.unwrap();
    }
}
