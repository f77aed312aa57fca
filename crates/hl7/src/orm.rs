//! Outbound orders (`ORM^O01`).
//!
//! Segment order is fixed: `MSH`, `PID`, then one `ORC`/`OBR` pair per order item. Output is a
//! pure function of the request: the message time and control id are part of the request, so
//! the same request always renders the same bytes.

use crate::segment::EncodingCharacters;
use crate::{Hl7Error, Hl7Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;

const SENDING_APPLICATION: &str = "OpenELIS";
const SENDING_FACILITY: &str = "LAB";
const DEFAULT_RECEIVING_APPLICATION: &str = "ANALYZER";
const DEFAULT_RECEIVING_FACILITY: &str = "LAB";
const HL7_VERSION: &str = "2.5.1";
const OBR_RESULT_STATUS_FIELD: usize = 25;

/// One test ordered on the analyzer.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OrderItem {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Everything needed to render an `ORM^O01` message.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OrderRequest {
    pub message_control_id: String,
    pub message_time: NaiveDateTime,
    #[serde(default)]
    pub receiving_application: Option<String>,
    #[serde(default)]
    pub receiving_facility: Option<String>,
    pub patient_id: String,
    #[serde(default)]
    pub patient_last_name: Option<String>,
    #[serde(default)]
    pub patient_first_name: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Option<String>,
    pub placer_order_number: String,
    #[serde(default)]
    pub filler_order_number: Option<String>,
    pub items: Vec<OrderItem>,
}

/// Render an outbound `ORM^O01` order message with CR segment terminators.
///
/// # Arguments
///
/// * `request` - The order to render. `None` is accepted so callers holding an optional request
///   get a uniform generation error instead of a partial message.
///
/// # Errors
///
/// Returns [`Hl7Error::Generation`] if the request is absent, has a blank control id, patient id
/// or placer order number, has no items, or has an item with a blank code.
pub fn generate_orm_o01(request: Option<&OrderRequest>) -> Hl7Result<String> {
    let request =
        request.ok_or_else(|| Hl7Error::Generation("order request is required".into()))?;
    validate(request)?;

    let enc = EncodingCharacters::default();
    let esc = |value: &str| enc.escape(value.trim());
    let opt = |value: &Option<String>| value.as_deref().map(esc).unwrap_or_default();

    let receiving_application = request
        .receiving_application
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(DEFAULT_RECEIVING_APPLICATION);
    let receiving_facility = request
        .receiving_facility
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(DEFAULT_RECEIVING_FACILITY);

    let mut segments = Vec::with_capacity(2 + request.items.len() * 2);

    segments.push(format!(
        "MSH|^~\\&|{}|{}|{}|{}|{}||ORM^O01|{}|P|{}",
        SENDING_APPLICATION,
        SENDING_FACILITY,
        esc(receiving_application),
        esc(receiving_facility),
        request.message_time.format("%Y%m%d%H%M%S"),
        esc(&request.message_control_id),
        HL7_VERSION
    ));

    segments.push(format!(
        "PID|1||{}||{}^{}||{}|{}",
        esc(&request.patient_id),
        opt(&request.patient_last_name),
        opt(&request.patient_first_name),
        request
            .date_of_birth
            .map(|d| d.format("%Y%m%d").to_string())
            .unwrap_or_default(),
        opt(&request.gender),
    ));

    let placer = esc(&request.placer_order_number);
    let filler = opt(&request.filler_order_number);

    for (index, item) in request.items.iter().enumerate() {
        segments.push(format!("ORC|NW|{placer}|{filler}"));

        let mut obr = vec![String::new(); OBR_RESULT_STATUS_FIELD + 1];
        obr[0] = "OBR".into();
        obr[1] = (index + 1).to_string();
        obr[2] = placer.clone();
        obr[3] = filler.clone();
        obr[4] = format!("{}^{}", esc(&item.code), opt(&item.name));
        obr[OBR_RESULT_STATUS_FIELD] = "R".into();
        segments.push(obr.join("|"));
    }

    let mut message = segments.join("\r");
    message.push('\r');
    Ok(message)
}

fn validate(request: &OrderRequest) -> Hl7Result<()> {
    let required = [
        ("message control id", request.message_control_id.as_str()),
        ("patient id", request.patient_id.as_str()),
        ("placer order number", request.placer_order_number.as_str()),
    ];
    if let Some((name, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
        return Err(Hl7Error::Generation(format!("{name} is required")));
    }
    if request.items.is_empty() {
        return Err(Hl7Error::Generation(
            "order must contain at least one item".into(),
        ));
    }
    if request.items.iter().any(|item| item.code.trim().is_empty()) {
        return Err(Hl7Error::Generation("order item code is required".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oru::extract_msh_info;
    use crate::segment::{parse_segments, to_segment_lines};

    fn request() -> OrderRequest {
        OrderRequest {
            message_control_id: "CTRL42".into(),
            message_time: NaiveDate::from_ymd_opt(2025, 1, 27)
                .unwrap()
                .and_hms_opt(14, 30, 0)
                .unwrap(),
            receiving_application: None,
            receiving_facility: Some("CHEM".into()),
            patient_id: "PAT123".into(),
            patient_last_name: Some("Doe".into()),
            patient_first_name: Some("Jane".into()),
            date_of_birth: NaiveDate::from_ymd_opt(1980, 5, 17),
            gender: Some("F".into()),
            placer_order_number: "PLC001".into(),
            filler_order_number: Some("FIL001".into()),
            items: vec![
                OrderItem {
                    code: "GLU".into(),
                    name: Some("Glucose".into()),
                },
                OrderItem {
                    code: "CHOL".into(),
                    name: None,
                },
            ],
        }
    }

    #[test]
    fn test_generate_segment_order() {
        let message = generate_orm_o01(Some(&request())).unwrap();
        let names: Vec<String> = to_segment_lines(&message)
            .iter()
            .map(|l| l.split('|').next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, vec!["MSH", "PID", "ORC", "OBR", "ORC", "OBR"]);
    }

    #[test]
    fn test_generate_msh_fields() {
        let message = generate_orm_o01(Some(&request())).unwrap();
        let first = to_segment_lines(&message)[0].clone();
        assert_eq!(
            first,
            "MSH|^~\\&|OpenELIS|LAB|ANALYZER|CHEM|20250127143000||ORM^O01|CTRL42|P|2.5.1"
        );
        let info = extract_msh_info(&message).unwrap();
        assert_eq!(info.sending_application, "OpenELIS");
    }

    #[test]
    fn test_generate_pid_and_obr_fields() {
        let message = generate_orm_o01(Some(&request())).unwrap();
        let segments = parse_segments(&message);
        let pid = &segments[1];
        assert_eq!(pid.component(3, 1), Some("PAT123"));
        assert_eq!(pid.component(5, 1), Some("Doe"));
        assert_eq!(pid.component(5, 2), Some("Jane"));
        assert_eq!(pid.field(7), Some("19800517"));
        assert_eq!(pid.field(8), Some("F"));

        let obr = &segments[3];
        assert_eq!(obr.field(1), Some("1"));
        assert_eq!(obr.field(2), Some("PLC001"));
        assert_eq!(obr.component(4, 1), Some("GLU"));
        assert_eq!(obr.component(4, 2), Some("Glucose"));
        assert_eq!(obr.field(25), Some("R"));
        assert_eq!(segments[5].field(1), Some("2"));
    }

    #[test]
    fn test_generate_is_deterministic() {
        let a = generate_orm_o01(Some(&request())).unwrap();
        let b = generate_orm_o01(Some(&request())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_generate_none_fails() {
        assert!(matches!(generate_orm_o01(None), Err(Hl7Error::Generation(_))));
    }

    #[test]
    fn test_generate_without_items_fails() {
        let mut req = request();
        req.items.clear();
        assert!(matches!(
            generate_orm_o01(Some(&req)),
            Err(Hl7Error::Generation(_))
        ));
    }

    #[test]
    fn test_generate_blank_patient_fails() {
        let mut req = request();
        req.patient_id = " ".into();
        let err = generate_orm_o01(Some(&req)).unwrap_err();
        assert!(err.to_string().contains("patient id"));
    }

    #[test]
    fn test_generate_escapes_delimiters() {
        let mut req = request();
        req.patient_last_name = Some("O|Brien".into());
        let message = generate_orm_o01(Some(&req)).unwrap();
        assert!(message.contains("O\\F\\Brien^Jane"));
    }
}
