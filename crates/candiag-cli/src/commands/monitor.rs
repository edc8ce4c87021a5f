//! Monitor command - poll live OBD-II values from the simulated ECU

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use candiag::{DiagConfig, Parameter};

use super::SimVehicle;
use crate::output::{escape_csv, OutputContext, OutputFormat};

pub async fn monitor(
    config: &DiagConfig,
    pids: Vec<u8>,
    rate: u32,
    count: Option<usize>,
    ctx: &OutputContext,
) -> Result<()> {
    let vehicle = SimVehicle::new(config)?;
    let interval = Duration::from_millis(1000 / u64::from(rate.max(1)));

    ctx.info(&format!(
        "Monitoring {} parameter(s) every {:?}",
        pids.len(),
        interval
    ));
    ctx.info("Press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl+C handler")?;

    if ctx.format == OutputFormat::Csv {
        println!("timestamp,pid,name,value,unit");
    }

    let batches = Arc::new(AtomicUsize::new(0));
    let seen = batches.clone();
    let format = ctx.format;
    vehicle
        .obd
        .start_monitoring(pids, interval, move |batch| {
            seen.fetch_add(1, Ordering::SeqCst);
            print_batch(&batch, format);
        })?;

    while running.load(Ordering::SeqCst) {
        if count.is_some_and(|limit| batches.load(Ordering::SeqCst) >= limit) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    vehicle.obd.stop_monitoring().await;
    let stats = vehicle.obd.statistics();
    ctx.success(&format!(
        "Stopped after {} batch(es), {} request(s), {} timeout(s)",
        batches.load(Ordering::SeqCst),
        stats.requests_sent,
        stats.timeouts
    ));
    Ok(())
}

fn print_batch(batch: &[Parameter], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let line: Vec<String> = batch
                .iter()
                .map(|p| format!("{}={}", p.name, p.formatted_value()))
                .collect();
            println!("{}", line.join("  "));
        }
        OutputFormat::Json => {
            if let Ok(line) = serde_json::to_string(batch) {
                println!("{}", line);
            }
        }
        OutputFormat::Csv => {
            for p in batch {
                println!(
                    "{},{},{},{},{}",
                    p.timestamp.to_rfc3339(),
                    p.pid,
                    escape_csv(&p.name),
                    p.value,
                    escape_csv(&p.unit)
                );
            }
        }
    }
}
