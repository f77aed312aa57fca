//! Inbound results (`ORU^R01`) and message header metadata.

use crate::segment::{parse_segments, Segment};
use crate::{Hl7Error, Hl7Result};
use serde::Serialize;

/// Sender metadata read from the MSH segment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MshInfo {
    /// MSH-3, empty when blank.
    pub sending_application: String,
    /// MSH-4, empty when blank.
    pub sending_facility: String,
    /// MSH-9 as transmitted (`ORU^R01`).
    pub message_type: Option<String>,
    /// MSH-10.
    pub control_id: Option<String>,
    /// MSH-12.
    pub version: Option<String>,
}

/// One OBX observation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub test_code: String,
    pub test_name: Option<String>,
    pub value: Option<String>,
    pub units: Option<String>,
    /// OBX-2 (`NM`, `ST`, `CE`, ...).
    pub value_type: Option<String>,
}

/// Domain-independent view of an `ORU^R01` result message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OruR01 {
    pub msh: MshInfo,
    pub patient_id: Option<String>,
    pub placer_order_number: Option<String>,
    pub filler_order_number: Option<String>,
    pub service_id: Option<String>,
    pub observations: Vec<Observation>,
}

/// Parse an `ORU^R01` result message.
///
/// Extracts PID-3 (patient id), ORC-2/ORC-3 (placer/filler order numbers, falling back to
/// OBR-2/OBR-3), OBR-4 (service id, falling back to its text component) and one
/// [`Observation`] per OBX segment. OBX segments without a test identifier are skipped.
///
/// # Errors
///
/// Returns [`Hl7Error::Parse`] if `message` is blank or has no MSH segment.
pub fn parse_oru_r01(message: &str) -> Hl7Result<OruR01> {
    if message.trim().is_empty() {
        return Err(Hl7Error::Parse("ORU^R01 message is empty".into()));
    }

    let segments = parse_segments(message);
    let msh = find(&segments, "MSH")
        .ok_or_else(|| Hl7Error::Parse("ORU^R01 message has no MSH segment".into()))?;

    let pid = find(&segments, "PID");
    let orc = find(&segments, "ORC");
    let obr = find(&segments, "OBR");

    let from_orc_or_obr = |number: usize| {
        orc.and_then(|s| s.component(number, 1))
            .or_else(|| obr.and_then(|s| s.component(number, 1)))
            .map(str::to_string)
    };

    let observations = segments
        .iter()
        .filter(|s| s.name() == "OBX")
        .filter_map(observation)
        .collect();

    Ok(OruR01 {
        msh: msh_info(msh),
        patient_id: pid.and_then(|s| s.component(3, 1)).map(str::to_string),
        placer_order_number: from_orc_or_obr(2),
        filler_order_number: from_orc_or_obr(3),
        service_id: obr
            .and_then(|s| s.component(4, 1).or_else(|| s.component(4, 2)))
            .map(str::to_string),
        observations,
    })
}

/// Read sender metadata from a message's MSH segment.
///
/// # Errors
///
/// Returns [`Hl7Error::Parse`] if `message` is blank or has no MSH segment.
pub fn extract_msh_info(message: &str) -> Hl7Result<MshInfo> {
    if message.trim().is_empty() {
        return Err(Hl7Error::Parse("message is empty".into()));
    }
    let segments = parse_segments(message);
    find(&segments, "MSH")
        .map(msh_info)
        .ok_or_else(|| Hl7Error::Parse("message has no MSH segment".into()))
}

fn find<'a>(segments: &'a [Segment], name: &str) -> Option<&'a Segment> {
    segments.iter().find(|s| s.name() == name)
}

fn msh_info(msh: &Segment) -> MshInfo {
    MshInfo {
        sending_application: msh.field(3).unwrap_or_default().to_string(),
        sending_facility: msh.field(4).unwrap_or_default().to_string(),
        message_type: msh.field(9).map(str::to_string),
        control_id: msh.field(10).map(str::to_string),
        version: msh.field(12).map(str::to_string),
    }
}

fn observation(obx: &Segment) -> Option<Observation> {
    // OBX-3 is CE: identifier^text^coding system. Some instruments send ASTM-style ^^^CODE.
    let test_code = obx.component(3, 1).or_else(|| obx.component(3, 4))?;
    Some(Observation {
        test_code: test_code.to_string(),
        test_name: obx.component(3, 2).map(str::to_string),
        value: obx.field(5).map(str::to_string),
        units: obx.component(6, 1).map(str::to_string),
        value_type: obx.field(2).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORU: &str = "MSH|^~\\&|MINDRAY|LAB1|OpenELIS|LAB|20250127143000||ORU^R01|MSG0001|P|2.5.1\r\
PID|1||PAT123^^^MRN||Doe^Jane\r\
ORC|RE|PLC001|FIL001\r\
OBR|1|PLC001|FIL001|CBC^Complete Blood Count\r\
OBX|1|NM|WBC^White Blood Cells||7.2|10*3/uL^^UCUM|4.0-11.0|N\r\
OBX|2|NM|^^^HGB||13.5|g/dL\r\
OBX|3|ST|||no code\r";

    #[test]
    fn test_parse_oru_r01_extracts_identifiers() {
        let oru = parse_oru_r01(ORU).unwrap();
        assert_eq!(oru.patient_id.as_deref(), Some("PAT123"));
        assert_eq!(oru.placer_order_number.as_deref(), Some("PLC001"));
        assert_eq!(oru.filler_order_number.as_deref(), Some("FIL001"));
        assert_eq!(oru.service_id.as_deref(), Some("CBC"));
        assert_eq!(oru.msh.sending_application, "MINDRAY");
    }

    #[test]
    fn test_parse_oru_r01_observations() {
        let oru = parse_oru_r01(ORU).unwrap();
        assert_eq!(oru.observations.len(), 2);

        let wbc = &oru.observations[0];
        assert_eq!(wbc.test_code, "WBC");
        assert_eq!(wbc.test_name.as_deref(), Some("White Blood Cells"));
        assert_eq!(wbc.value.as_deref(), Some("7.2"));
        assert_eq!(wbc.units.as_deref(), Some("10*3/uL"));
        assert_eq!(wbc.value_type.as_deref(), Some("NM"));

        assert_eq!(oru.observations[1].test_code, "HGB");
    }

    #[test]
    fn test_orc_numbers_fall_back_to_obr() {
        let msg = "MSH|^~\\&|A|B\rOBR|1|P9|F9|^Glucose";
        let oru = parse_oru_r01(msg).unwrap();
        assert_eq!(oru.placer_order_number.as_deref(), Some("P9"));
        assert_eq!(oru.filler_order_number.as_deref(), Some("F9"));
        assert_eq!(oru.service_id.as_deref(), Some("Glucose"));
    }

    #[test]
    fn test_parse_oru_r01_empty_fails() {
        assert!(matches!(parse_oru_r01(""), Err(Hl7Error::Parse(_))));
        assert!(matches!(parse_oru_r01("  \n"), Err(Hl7Error::Parse(_))));
    }

    #[test]
    fn test_parse_oru_r01_without_msh_fails() {
        assert!(parse_oru_r01("PID|1||X").is_err());
    }

    #[test]
    fn test_extract_msh_info() {
        let info = extract_msh_info(ORU).unwrap();
        assert_eq!(info.sending_application, "MINDRAY");
        assert_eq!(info.sending_facility, "LAB1");
        assert_eq!(info.message_type.as_deref(), Some("ORU^R01"));
        assert_eq!(info.control_id.as_deref(), Some("MSG0001"));
        assert_eq!(info.version.as_deref(), Some("2.5.1"));
    }

    #[test]
    fn test_extract_msh_info_blank_fields_are_empty() {
        let info = extract_msh_info("MSH|^~\\&|||").unwrap();
        assert_eq!(info.sending_application, "");
        assert_eq!(info.sending_facility, "");
    }
}
