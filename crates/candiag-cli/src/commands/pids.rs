//! Pids command - the mode 01 parameter table

use candiag::obd::{pid_to_string, PID_TABLE};

use crate::output::{OutputContext, PidRow};

pub fn pids(with_units_only: bool, ctx: &OutputContext) {
    let rows: Vec<PidRow> = PID_TABLE
        .iter()
        .filter(|info| !with_units_only || !info.unit.is_empty())
        .map(|info| PidRow {
            pid: pid_to_string(info.pid),
            name: info.name.to_string(),
            description: info.description.to_string(),
            unit: info.unit.to_string(),
        })
        .collect();
    ctx.print(&rows);
}
