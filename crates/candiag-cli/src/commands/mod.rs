//! Command implementations for candiag

pub mod demo;
pub mod dtc;
pub mod inspect;
pub mod monitor;
pub mod pids;

pub use demo::demo;
pub use dtc::{decode as dtc_decode, encode as dtc_encode};
pub use inspect::inspect;
pub use monitor::monitor;
pub use pids::pids;

use std::sync::Arc;

use anyhow::Result;
use candiag::{DiagConfig, MockTransport, ObdClient, SimConfig, SimulatedEcu, UdsClient};

/// UDS and OBD-II clients talking to a simulated ECU over a mock bus
///
/// The transport keeps the ECU alive as its responder.
pub struct SimVehicle {
    pub uds: Arc<UdsClient>,
    pub obd: Arc<ObdClient>,
    /// XOR secret shared by the ECU and the tester
    pub secret: Vec<u8>,
}

impl SimVehicle {
    /// The ECU answers on the ids the configured clients use
    pub fn new(config: &DiagConfig) -> Result<Self> {
        let mut secret = config.flash.security_key_bytes()?;
        if secret.is_empty() {
            secret = SimConfig::default().security_secret;
        }

        let transport = Arc::new(MockTransport::new(&config.can));
        let ecu = Arc::new(SimulatedEcu::new(SimConfig {
            request_id: config.uds.request_id,
            response_id: config.uds.response_id,
            obd_request_id: config.obd.request_id,
            extended_ids: config.uds.extended_ids,
            security_secret: secret.clone(),
            block_counter_start: config.flash.block_counter_start,
            block_counter_wrap: config.flash.block_counter_wrap,
            ..Default::default()
        }));
        transport.add_responder(ecu);

        let uds = Arc::new(UdsClient::new(config.uds.clone(), transport.clone()));
        let obd = Arc::new(ObdClient::new(config.obd.clone(), transport));
        Ok(Self {
            uds,
            obd,
            secret,
        })
    }
}
