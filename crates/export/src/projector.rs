//! Projection of typed table cells into plain JSON values.
//!
//! The legacy persistence serialized nested saga members (lists, child
//! objects, pre-serialized strings) into string columns. Projection turns
//! each [`CellValue`] into the JSON value the document store should hold,
//! re-inflating embedded JSON where a string cell plainly carries some.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::table::CellValue;

static ARRAY_SHAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^\[.*\]$").unwrap());
static OBJECT_SHAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^\{.*\}$").unwrap());
static QUOTED_SHAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?s)^".*"$"#).unwrap());

/// Turns typed cells into document store JSON.
///
/// String cells whose whole content is shaped like a JSON array or object
/// are parsed and embedded as structured JSON. Cells shaped like a quoted
/// JSON string are unwrapped the same way unless
/// [`sniff_quoted_strings`](ValueProjector::new) is turned off, for tables
/// whose string columns legitimately start and end with a double quote.
#[derive(Debug, Clone)]
pub struct ValueProjector {
    sniff_quoted_strings: bool,
}

impl Default for ValueProjector {
    fn default() -> Self {
        Self {
            sniff_quoted_strings: true,
        }
    }
}

impl ValueProjector {
    pub fn new(sniff_quoted_strings: bool) -> Self {
        Self {
            sniff_quoted_strings,
        }
    }

    /// Projects one cell into the value written to the saga document.
    ///
    /// Never fails: a string that looks like embedded JSON but does not
    /// parse is kept verbatim, and a non-finite double falls back to its
    /// decimal rendering since JSON has no representation for it.
    pub fn project(&self, value: &CellValue) -> Value {
        match value {
            CellValue::String(text) => self.project_string(text),
            CellValue::Binary(bytes) => Value::String(STANDARD.encode(bytes)),
            CellValue::Boolean(flag) => Value::Bool(*flag),
            CellValue::Timestamp(at) => Value::String(at.to_rfc3339()),
            CellValue::Double(number) => serde_json::Number::from_f64(*number)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(number.to_string())),
            CellValue::Guid(id) => Value::String(id.to_string()),
            CellValue::Int32(number) => Value::Number((*number).into()),
            CellValue::Int64(number) => Value::Number((*number).into()),
        }
    }

    fn project_string(&self, text: &str) -> Value {
        let looks_structured = ARRAY_SHAPE.is_match(text) || OBJECT_SHAPE.is_match(text);
        let looks_quoted = self.sniff_quoted_strings && QUOTED_SHAPE.is_match(text);
        if looks_structured || looks_quoted {
            match serde_json::from_str::<Value>(text) {
                Ok(parsed) => return parsed,
                Err(error) => {
                    debug!(%error, "cell shaped like embedded json did not parse, keeping raw string");
                }
            }
        }
        Value::String(text.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn embedded_arrays_and_objects_are_inflated() {
        let projector = ValueProjector::default();

        let projected = projector.project(&CellValue::String("[1,2,3]".into()));
        assert_eq!(projected, json!([1, 2, 3]));

        let projected = projector.project(&CellValue::String(r#"{"Count": 2}"#.into()));
        assert_eq!(projected, json!({"Count": 2}));
    }

    #[test]
    fn multiline_embedded_json_still_matches() {
        let projector = ValueProjector::default();
        let projected = projector.project(&CellValue::String("{\n  \"Count\": 2\n}".into()));
        assert_eq!(projected, json!({"Count": 2}));
    }

    #[test]
    fn malformed_embedded_json_stays_a_string() {
        let projector = ValueProjector::default();
        let projected = projector.project(&CellValue::String("[not, valid".into()));
        assert_eq!(projected, json!("[not, valid"));

        let projected = projector.project(&CellValue::String("[broken]".into()));
        assert_eq!(projected, json!("[broken]"));

        // Array-shaped, whitespace and all, but not JSON.
        let projected = projector.project(&CellValue::String("[ Garbage ]".into()));
        assert_eq!(projected, json!("[ Garbage ]"));
    }

    #[test]
    fn quoted_strings_unwrap_when_sniffing_is_on() {
        let projector = ValueProjector::default();
        let projected = projector.project(&CellValue::String(r#""hello""#.into()));
        assert_eq!(projected, json!("hello"));
    }

    #[test]
    fn quoted_strings_survive_when_sniffing_is_off() {
        let projector = ValueProjector::new(false);
        let projected = projector.project(&CellValue::String(r#""hello""#.into()));
        assert_eq!(projected, json!(r#""hello""#));
    }

    #[test]
    fn plain_strings_pass_through() {
        let projector = ValueProjector::default();
        let projected = projector.project(&CellValue::String("order accepted".into()));
        assert_eq!(projected, json!("order accepted"));
    }

    #[test]
    fn scalar_cells_project_to_their_json_counterparts() {
        let projector = ValueProjector::default();

        assert_eq!(projector.project(&CellValue::Boolean(false)), json!(false));
        assert_eq!(projector.project(&CellValue::Int32(7)), json!(7));
        assert_eq!(projector.project(&CellValue::Int64(-9)), json!(-9));
        assert_eq!(projector.project(&CellValue::Double(1.5)), json!(1.5));

        let id = Uuid::parse_str("a3413eda-fb98-46c1-a44e-89da9efada16").unwrap();
        assert_eq!(
            projector.project(&CellValue::Guid(id)),
            json!("a3413eda-fb98-46c1-a44e-89da9efada16")
        );
    }

    #[test]
    fn non_finite_doubles_fall_back_to_text() {
        let projector = ValueProjector::default();
        assert_eq!(projector.project(&CellValue::Double(f64::NAN)), json!("NaN"));
    }

    #[test]
    fn binary_cells_project_as_base64_text() {
        let projector = ValueProjector::default();
        assert_eq!(
            projector.project(&CellValue::Binary(vec![1, 2, 3])),
            json!("AQID")
        );
    }

    #[test]
    fn timestamps_project_as_rfc3339_text() {
        let projector = ValueProjector::default();
        let parsed = DateTime::parse_from_rfc3339("2023-05-17T09:30:00+00:00").unwrap();
        assert_eq!(
            projector.project(&CellValue::Timestamp(parsed)),
            json!("2023-05-17T09:30:00+00:00")
        );
    }
}
