use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisionResult {
    Same,
    Different,
}

pub trait ComparisionMode {
    fn compare(&self, expected: &Value, actual: &Value) -> ComparisionResult;
}

/// Deep value equality. No coercion: `5` and `5.0` or `"5"` are different.
pub struct StrictCompare;

impl ComparisionMode for StrictCompare {
    fn compare(&self, expected: &Value, actual: &Value) -> ComparisionResult {
        if expected == actual {
            ComparisionResult::Same
        } else {
            ComparisionResult::Different
        }
    }
}

/// Printed output against an expected transcript: surrounding blank lines
/// and trailing spaces on each line do not count.
pub struct LineCompare;

impl ComparisionMode for LineCompare {
    fn compare(&self, expected: &Value, actual: &Value) -> ComparisionResult {
        let str1 = render_text(expected);
        let str2 = render_text(actual);

        let str1: Vec<&str> = str1.trim().split('\n').map(|f| f.trim_end()).collect();
        let str2: Vec<&str> = str2.trim().split('\n').map(|f| f.trim_end()).collect();

        if str1 == str2 {
            ComparisionResult::Same
        } else {
            ComparisionResult::Different
        }
    }
}

/// Strings as they are, everything else as JSON text.
pub fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.replace("\r\n", "\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_has_no_coercion() {
        let cmp = StrictCompare;
        assert_eq!(cmp.compare(&json!(5), &json!(5)), ComparisionResult::Same);
        assert_eq!(cmp.compare(&json!(5), &json!(5.0)), ComparisionResult::Different);
        assert_eq!(cmp.compare(&json!(5), &json!("5")), ComparisionResult::Different);
    }

    #[test]
    fn strict_is_deep() {
        let cmp = StrictCompare;
        assert_eq!(
            cmp.compare(&json!({"a": [1, 2], "b": null}), &json!({"b": null, "a": [1, 2]})),
            ComparisionResult::Same
        );
        assert_eq!(
            cmp.compare(&json!([1, [2, 3]]), &json!([1, [3, 2]])),
            ComparisionResult::Different
        );
    }

    #[test]
    fn line_ignores_trailing_space() {
        let cmp = LineCompare;
        assert_eq!(
            cmp.compare(&json!("1\n2\n"), &json!("1  \r\n2\n\n")),
            ComparisionResult::Same
        );
        assert_eq!(
            cmp.compare(&json!("1\n2"), &json!("1\n 2")),
            ComparisionResult::Different
        );
    }

    #[test]
    fn line_renders_numbers() {
        assert_eq!(
            LineCompare.compare(&json!(42), &json!("42\n")),
            ComparisionResult::Same
        );
    }
}
