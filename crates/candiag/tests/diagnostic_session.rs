//! End-to-end diagnostic sessions against the simulated ECU
//!
//! Run with: cargo test --test diagnostic_session

use std::sync::Arc;
use std::time::Duration;

use candiag::flash::FlashBlock;
use candiag::obd::pid;
use candiag::uds::{dtc_group, standard_did, xor_key};
use candiag::{
    CanConfig, DiagConfig, DiagnosticMessage, FlashConfig, FlashFile, FlashFileFormat,
    FlashManager, MockTransport, NegativeResponseCode, ObdClient, ObdConfig, SessionType,
    SimConfig, SimulatedEcu, UdsClient, UdsConfig, WorkerPool,
};
use pretty_assertions::assert_eq;
use tokio::sync::oneshot;

struct Vehicle {
    ecu: Arc<SimulatedEcu>,
    transport: Arc<MockTransport>,
    uds: Arc<UdsClient>,
    obd: Arc<ObdClient>,
}

fn vehicle() -> Vehicle {
    let transport = Arc::new(MockTransport::new(&CanConfig::default()));
    let ecu = Arc::new(SimulatedEcu::new(SimConfig::default()));
    transport.add_responder(ecu.clone());
    let uds = Arc::new(UdsClient::new(
        UdsConfig {
            timeout_ms: 200,
            ..Default::default()
        },
        transport.clone(),
    ));
    let obd = Arc::new(ObdClient::new(
        ObdConfig {
            timeout_ms: 200,
            ..Default::default()
        },
        transport.clone(),
    ));
    Vehicle {
        ecu,
        transport,
        uds,
        obd,
    }
}

// =============================================================================
// UDS
// =============================================================================

#[tokio::test]
async fn test_uds_session_security_and_data() {
    let v = vehicle();
    let secret = v.ecu.config().security_secret.clone();

    assert!(v.uds.start_session(SessionType::ExtendedDiagnostic).await.unwrap());
    assert_eq!(v.uds.current_session(), SessionType::ExtendedDiagnostic);

    let vin = v
        .uds
        .read_data_by_identifier(standard_did::VIN)
        .await
        .unwrap();
    assert_eq!(vin, b"1HGBH41JXMN109186".to_vec());

    // Writes need security access
    let denied = v
        .uds
        .write_data_by_identifier(standard_did::SPARE_PART_NUMBER, b"NEW-PART")
        .await
        .unwrap();
    assert!(!denied);
    assert_eq!(
        v.uds.last_error().map(|e| e.code),
        Some(NegativeResponseCode::SecurityAccessDenied)
    );

    let unlocked = v
        .uds
        .unlock_security_access_with(0x01, |seed| xor_key(seed, &secret))
        .await
        .unwrap();
    assert!(unlocked);
    assert!(v.ecu.is_unlocked());

    assert!(v
        .uds
        .write_data_by_identifier(standard_did::SPARE_PART_NUMBER, b"NEW-PART")
        .await
        .unwrap());
    assert_eq!(
        v.ecu.did(standard_did::SPARE_PART_NUMBER),
        Some(b"NEW-PART".to_vec())
    );
    assert!(v.uds.last_error().is_none());

    // A second unlock sees the zero seed
    assert!(v
        .uds
        .unlock_security_access(0x01, &[0xDE, 0xAD])
        .await
        .unwrap());
}

#[tokio::test]
async fn test_uds_dtc_read_and_clear() {
    let v = vehicle();

    let confirmed = v.uds.read_confirmed_dtcs().await.unwrap();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].dtc_number, 0x00AB00);

    let pending = v.uds.read_pending_dtcs().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].dtc_number, 0x012C00);

    let snapshot = v
        .uds
        .read_dtc_snapshot(confirmed[0].dtc_number, 0x01)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.snapshot_data, vec![0x01, 0x01, 0xF4, 0x0D, 0x32]);
    let extended = v
        .uds
        .read_dtc_extended_data(confirmed[0].dtc_number, 0xFF)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(extended.extended_data, vec![0x01, 0x03]);

    assert!(v
        .uds
        .clear_diagnostic_information(dtc_group::ALL)
        .await
        .unwrap());
    assert_eq!(v.ecu.dtc_count(), 0);
    assert!(v.uds.read_confirmed_dtcs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_uds_unknown_did_sets_last_error() {
    let v = vehicle();
    let data = v.uds.read_data_by_identifier(0x1234).await.unwrap();
    assert!(data.is_empty());
    assert_eq!(
        v.uds.last_error().map(|e| e.code),
        Some(NegativeResponseCode::RequestOutOfRange)
    );

    let stats = v.uds.statistics();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.negative_responses, 1);
}

#[tokio::test]
async fn test_uds_silent_ecu_times_out() {
    let v = vehicle();
    v.ecu.set_silent(true);
    let err = v.uds.tester_present(false).await.unwrap_err();
    assert!(candiag::Error::from(err).is_timeout());
    assert_eq!(v.uds.statistics().timeouts, 1);
}

#[tokio::test]
async fn test_send_request_async_on_pool() {
    let v = vehicle();
    let pool = WorkerPool::new(&Default::default());
    let (tx, rx) = oneshot::channel();

    v.uds
        .send_request_async(
            &pool,
            DiagnosticMessage::request(0x22, vec![0xF1, 0x89]),
            move |result| {
                let _ = tx.send(result);
            },
        )
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(response.is_positive());
    assert_eq!(&response.data[2..], b"1.0.0");

    pool.shutdown().await;
    assert!(pool.is_shut_down());
}

// =============================================================================
// OBD-II
// =============================================================================

#[tokio::test]
async fn test_obd_live_data() {
    let v = vehicle();

    let supported = v.obd.get_supported_pids().await.unwrap();
    assert!(supported.contains(&pid::ENGINE_RPM));
    assert!(supported.contains(&pid::FUEL_TANK_LEVEL));
    assert!(v.obd.is_pid_supported(pid::VEHICLE_SPEED).await.unwrap());
    assert!(!v.obd.is_pid_supported(0x0A).await.unwrap());

    assert_eq!(v.obd.engine_rpm().await.unwrap(), 850.0);
    assert_eq!(v.obd.vehicle_speed().await.unwrap(), 50.0);
    assert_eq!(v.obd.coolant_temperature().await.unwrap(), 50.0);

    let batch = v
        .obd
        .read_multiple_parameters(&[pid::ENGINE_RPM, 0x0A, pid::VEHICLE_SPEED])
        .await;
    let pids: Vec<u8> = batch.iter().map(|p| p.pid).collect();
    assert_eq!(pids, vec![pid::ENGINE_RPM, pid::VEHICLE_SPEED]);
}

#[tokio::test]
async fn test_obd_dtcs_and_vehicle_info() {
    let v = vehicle();

    let stored: Vec<String> = v
        .obd
        .read_stored_dtcs()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.code)
        .collect();
    assert_eq!(stored, vec!["P0171", "P0300"]);

    let pending = v.obd.read_pending_dtcs().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].pending);

    assert!(v.obd.clear_dtcs().await.unwrap());
    assert!(v.obd.read_stored_dtcs().await.unwrap().is_empty());
    assert_eq!(v.obd.read_permanent_dtcs().await.unwrap().len(), 1);

    assert_eq!(v.obd.get_vin().await.unwrap(), "1HGBH41JXMN109186");
    assert_eq!(v.obd.get_ecu_name().await.unwrap(), "ECM-EngineControl");
}

#[tokio::test]
async fn test_obd_monitoring_delivers_batches() {
    let v = vehicle();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    v.obd
        .start_monitoring(
            vec![pid::ENGINE_RPM],
            Duration::from_millis(10),
            move |batch| {
                let _ = tx.send(batch);
            },
        )
        .unwrap();
    assert!(v.obd.is_monitoring());

    for _ in 0..2 {
        let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].value, 850.0);
    }

    assert!(v.obd.stop_monitoring().await);
    assert!(!v.obd.is_monitoring());
    assert!(!v.obd.stop_monitoring().await);
}

// =============================================================================
// Flash
// =============================================================================

const IMAGE_HEX: &str = "\
:10100000000102030405060708090A0B0C0D0E0F68
:041010001011121396
:00000001FF
";

#[tokio::test]
async fn test_flash_intel_hex_image() {
    let v = vehicle();
    let file = FlashFile::parse(IMAGE_HEX.as_bytes(), FlashFileFormat::IntelHex).unwrap();
    assert_eq!(file.total_size(), 20);

    let secret = hex::encode(&v.ecu.config().security_secret);
    let manager = FlashManager::new(
        v.uds.clone(),
        FlashConfig {
            block_size: 8,
            security_key: Some(secret),
            ..Default::default()
        },
    );

    manager.program_flash(&file).await.unwrap();
    assert_eq!(v.ecu.memory(0x1000, 20), (0..20u8).collect::<Vec<_>>());

    let stats = manager.statistics();
    assert_eq!(stats.blocks_written, 1);
    assert_eq!(stats.blocks_verified, 1);
    assert_eq!(stats.bytes_written, 20);

    // 0x34, three 0x36 chunks, 0x37 in the download phase
    let transfers = v
        .transport
        .sent_frames()
        .iter()
        .filter(|f| f.payload.first() == Some(&0x36) && f.payload.len() > 2)
        .count();
    assert_eq!(transfers, 3);
}

#[tokio::test]
async fn test_flash_image_from_file() {
    let v = vehicle();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.bin");
    std::fs::write(&path, [0xAA; 16]).unwrap();

    let file = FlashFile::load_from_file(&path).unwrap();
    assert_eq!(file.format(), FlashFileFormat::Binary);

    let manager = FlashManager::new(
        v.uds.clone(),
        FlashConfig {
            security_key: Some(hex::encode(&v.ecu.config().security_secret)),
            ..Default::default()
        },
    );
    manager.program_flash(&file).await.unwrap();
    manager.verify_flash(&file).await.unwrap();
    assert_eq!(v.ecu.memory(0, 16), vec![0xAA; 16]);
}

#[tokio::test]
async fn test_flash_read_memory_back() {
    let v = vehicle();
    v.ecu.write_memory(0x8000, &[9, 8, 7, 6]);
    let manager = FlashManager::new(v.uds.clone(), FlashConfig::default());
    // Sim requires an unlocked programming session for uploads
    v.uds.start_session(SessionType::Programming).await.unwrap();
    let secret = v.ecu.config().security_secret.clone();
    v.uds
        .unlock_security_access_with(0x01, |seed| xor_key(seed, &secret))
        .await
        .unwrap();

    let data = manager.read_memory(0x8000, 4).await.unwrap();
    assert_eq!(data, vec![9, 8, 7, 6]);

    let image = FlashFile::from_blocks(
        FlashFileFormat::Binary,
        vec![FlashBlock::new(0x8000, vec![9, 8, 7, 6])],
    );
    manager.verify_flash(&image).await.unwrap();
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_config_file_drives_clients() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("candiag.toml");
    std::fs::write(
        &path,
        r#"
[uds]
request_id = 0x7E1
response_id = 0x7E9
timeout_ms = 500

[flash]
block_size = 256
security_key = "a55a3cc3"
"#,
    )
    .unwrap();

    let config = DiagConfig::load(&path).unwrap();
    assert_eq!(config.uds.request_id, 0x7E1);
    assert_eq!(config.uds.timeout(), Duration::from_millis(500));
    assert_eq!(config.flash.block_size, 256);
    assert_eq!(
        config.flash.security_key_bytes().unwrap(),
        vec![0xA5, 0x5A, 0x3C, 0xC3]
    );
    assert_eq!(config.obd.request_id, 0x7DF);
}
