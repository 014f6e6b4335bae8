use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Outcome of one recognition request. Every request produces exactly one of
/// these, success or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    pub success: bool,
    /// Best guess for the bill total.
    pub extracted_amount: Option<Decimal>,
    /// Every candidate amount found, largest first, no duplicates.
    pub possible_amounts: Vec<Decimal>,
    pub raw_text: Option<String>,
    pub error_message: Option<String>,
}

impl OcrResult {
    pub fn recognized(
        raw_text: impl Into<String>,
        possible_amounts: Vec<Decimal>,
        extracted_amount: Option<Decimal>,
    ) -> Self {
        Self {
            success: true,
            extracted_amount,
            possible_amounts,
            raw_text: Some(raw_text.into()),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            extracted_amount: None,
            possible_amounts: Vec::new(),
            raw_text: None,
            error_message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_carries_only_the_message() {
        let r = OcrResult::failed("OCR cancelled");
        assert!(!r.success);
        assert_eq!(r.error_message.as_deref(), Some("OCR cancelled"));
        assert!(r.extracted_amount.is_none());
        assert!(r.possible_amounts.is_empty());
        assert!(r.raw_text.is_none());
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let r = OcrResult::recognized("TONG 510.000", vec![Decimal::from(510_000)], Some(Decimal::from(510_000)));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("extractedAmount").is_some());
        assert!(json.get("possibleAmounts").is_some());
        assert_eq!(json["rawText"], "TONG 510.000");
        assert!(json["errorMessage"].is_null());
    }
}
