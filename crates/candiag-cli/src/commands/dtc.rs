//! DTC command - convert between raw values and five character codes

use anyhow::{anyhow, Context, Result};
use candiag::{encode_dtc, Dtc};

use crate::output::{DtcRow, OutputContext};

fn row(raw: u16) -> DtcRow {
    let dtc = Dtc::from_raw(raw);
    DtcRow {
        code: dtc.code.clone(),
        raw: format!("0x{:04X}", raw),
        category: dtc
            .category()
            .map(|c| format!("{:?}", c))
            .unwrap_or_else(|| "-".to_string()),
        status: if dtc.is_emissions_related() {
            "emissions".to_string()
        } else {
            "-".to_string()
        },
    }
}

/// Parse `0x0171`, `0171` or `369`
fn parse_raw(value: &str) -> Result<u16> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None if value.len() == 4 => u16::from_str_radix(value, 16),
        None => value.parse(),
    };
    parsed.with_context(|| format!("Invalid raw DTC value: {}", value))
}

/// Raw two-byte values to codes
pub fn decode(values: &[String], ctx: &OutputContext) -> Result<()> {
    let rows = values
        .iter()
        .map(|v| parse_raw(v).map(row))
        .collect::<Result<Vec<_>>>()?;
    ctx.print(&rows);
    Ok(())
}

/// Codes such as `P0171` to raw values
pub fn encode(codes: &[String], ctx: &OutputContext) -> Result<()> {
    let rows = codes
        .iter()
        .map(|code| {
            encode_dtc(code)
                .map(row)
                .ok_or_else(|| anyhow!("Invalid DTC code: {}", code))
        })
        .collect::<Result<Vec<_>>>()?;
    ctx.print(&rows);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0x0171", 0x0171)]
    #[case("0171", 0x0171)]
    #[case("369", 369)]
    #[case("0XC100", 0xC100)]
    fn test_parse_raw(#[case] input: &str, #[case] expected: u16) {
        assert_eq!(parse_raw(input).unwrap(), expected);
    }

    #[test]
    fn test_parse_raw_rejects_garbage() {
        assert!(parse_raw("P0171").is_err());
    }

    #[test]
    fn test_row() {
        let r = row(0x00AB);
        assert_eq!(r.code, "P0171");
        assert_eq!(r.raw, "0x00AB");
        assert_eq!(r.category, "Powertrain");

        let r = row(0xC064);
        assert_eq!(r.code, "U0100");
        assert_eq!(r.category, "Network");
        assert_eq!(r.status, "-");
    }

    #[test]
    fn test_encode_uses_decimal_number() {
        assert_eq!(encode_dtc("P2748").map(row).unwrap().raw, "0x0ABC");
    }
}
