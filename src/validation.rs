//! Validation Engine.
//!
//! A pure function of the field schema and the submitted data. Errors are
//! collected and returned; raising `ValidationFailed` is left to the caller.
use crate::schema::{FieldDefinition, FieldType};
use crate::types::{FieldValue, Record};
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub header_errors: Vec<FieldError>,
    pub line_errors: Vec<FieldError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.header_errors.is_empty() && self.line_errors.is_empty()
    }

    /// Header errors first, then line errors, each in evaluation order.
    pub fn into_errors(self) -> Vec<FieldError> {
        let mut errors = self.header_errors;
        errors.extend(self.line_errors);
        errors
    }
}

/// Checks header fields against `header` and line-item fields against every line.
/// Line errors are reported under `lines[i].<fieldKey>` with a zero-based `i`.
pub fn validate(fields: &[FieldDefinition], header: &Record, lines: &[Record]) -> ValidationReport {
    let mut report = ValidationReport::default();

    for field in fields.iter().filter(|f| !f.is_line_item) {
        if let Some(message) = check_value(field, header.get(&field.field_key)) {
            report
                .header_errors
                .push(FieldError::new(field.field_key.clone(), message));
        }
    }

    for (i, line) in lines.iter().enumerate() {
        for field in fields.iter().filter(|f| f.is_line_item) {
            if let Some(message) = check_value(field, line.get(&field.field_key)) {
                report.line_errors.push(FieldError::new(
                    format!("lines[{i}].{}", field.field_key),
                    format!("Line {}: {message}", i + 1),
                ));
            }
        }
    }

    report
}

/// Fills absent keys with the field's `default_value`.
pub fn apply_defaults(fields: &[FieldDefinition], header: &mut Record, lines: &mut [Record]) {
    for field in fields {
        let Some(default) = &field.default_value else {
            continue;
        };
        if field.is_line_item {
            for line in lines.iter_mut() {
                line.entry(field.field_key.clone())
                    .or_insert_with(|| default.clone());
            }
        } else {
            header
                .entry(field.field_key.clone())
                .or_insert_with(|| default.clone());
        }
    }
}

/// Rewrites values into the representation of their declared type, e.g.
/// `Text("12")` on a number field becomes `Number(12.0)`. Values that do not
/// coerce are left as they are; run [`validate`] first.
pub fn coerce(fields: &[FieldDefinition], header: &mut Record, lines: &mut [Record]) {
    for field in fields {
        if field.is_line_item {
            for line in lines.iter_mut() {
                coerce_entry(field, line);
            }
        } else {
            coerce_entry(field, header);
        }
    }
}

fn coerce_entry(field: &FieldDefinition, record: &mut Record) {
    let Some(value) = record.get_mut(&field.field_key) else {
        return;
    };
    if value.is_blank() {
        return;
    }
    let coerced = match field.field_type {
        FieldType::Number => value.as_number().map(FieldValue::Number),
        FieldType::Date => value.as_date().map(FieldValue::Date),
        FieldType::Checkbox => value.as_bool().map(FieldValue::Bool),
        _ => None,
    };
    if let Some(coerced) = coerced {
        *value = coerced;
    }
}

fn check_value(field: &FieldDefinition, value: Option<&FieldValue>) -> Option<String> {
    let label = &field.label;
    let rules = field.validation_rules.as_value();

    let value = match value {
        Some(v) if !v.is_blank() => v,
        _ if field.requires_value() => return Some(format!("{label} is required")),
        _ => return None,
    };

    match &field.field_type {
        FieldType::Number => {
            let Some(n) = value.as_number().filter(|n| n.is_finite()) else {
                return Some(format!("{label} must be a number"));
            };
            if let Some(rules) = rules {
                if let Some(min) = rules.min.filter(|min| n < *min) {
                    return Some(rule_message(rules.message.as_deref(), || {
                        format!("{label} must be at least {min}")
                    }));
                }
                if let Some(max) = rules.max.filter(|max| n > *max) {
                    return Some(rule_message(rules.message.as_deref(), || {
                        format!("{label} must be at most {max}")
                    }));
                }
            }
        }
        FieldType::Date => {
            if value.as_date().is_none() {
                return Some(format!("{label} must be a valid date"));
            }
        }
        FieldType::Checkbox => {
            if value.as_bool().is_none() {
                return Some(format!("{label} must be true or false"));
            }
        }
        FieldType::Select => {
            if let Some(allowed) = field.option_values() {
                let chosen = display_text(value);
                if !allowed.iter().any(|v| *v == chosen) {
                    return Some(format!("{label} must be one of: {}", allowed.join(", ")));
                }
            }
        }
        FieldType::Text | FieldType::Textarea | FieldType::File | FieldType::Custom(_) => {}
    }

    let pattern = rules.and_then(|r| r.pattern.as_deref())?;
    let text = value.as_text()?;
    match Regex::new(pattern) {
        Ok(re) if re.is_match(text) => None,
        Ok(_) => Some(rule_message(
            rules.and_then(|r| r.message.as_deref()),
            || format!("{label} has an invalid format"),
        )),
        Err(_) => Some(format!("{label} has an unusable validation pattern")),
    }
}

fn rule_message(custom: Option<&str>, generated: impl FnOnce() -> String) -> String {
    custom.map(str::to_string).unwrap_or_else(generated)
}

fn display_text(value: &FieldValue) -> String {
    match value {
        FieldValue::Text(s) => s.trim().to_string(),
        FieldValue::Number(n) => n.to_string(),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Date(ts) => ts.to_datetime_utc().to_rfc3339(),
        FieldValue::File(file) => file.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SelectOption, ValidationRules};
    use crate::types::Setting;

    fn field(key: &str, field_type: FieldType) -> FieldDefinition {
        FieldDefinition {
            id: format!("field_{key}"),
            document_type_id: "doctype_t".into(),
            field_key: key.into(),
            label: key.to_uppercase(),
            field_type,
            options: Setting::Null,
            is_required: false,
            show_in_grid: false,
            show_in_form: true,
            section_name: None,
            sort_order: 0,
            validation_rules: Setting::Null,
            default_value: None,
            col_span: 2,
            is_line_item: false,
            is_read_only: false,
            conditional_display: Setting::Null,
            placeholder: None,
            help_text: None,
        }
    }

    fn required(mut f: FieldDefinition) -> FieldDefinition {
        f.is_required = true;
        f
    }

    fn line(mut f: FieldDefinition) -> FieldDefinition {
        f.is_line_item = true;
        f
    }

    fn record(pairs: &[(&str, FieldValue)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn required_rejects_missing_and_blank() {
        let fields = vec![required(field("title", FieldType::Text))];

        let missing = validate(&fields, &Record::new(), &[]);
        assert_eq!(missing.header_errors, vec![FieldError::new("title", "TITLE is required")]);

        let blank = validate(&fields, &record(&[("title", FieldValue::text("  "))]), &[]);
        assert_eq!(blank.header_errors.len(), 1);

        let ok = validate(&fields, &record(&[("title", FieldValue::text("Pump"))]), &[]);
        assert!(ok.is_valid());
    }

    #[test]
    fn required_checkbox_accepts_explicit_false() {
        let fields = vec![required(field("agreed", FieldType::Checkbox))];

        assert!(validate(&fields, &record(&[("agreed", FieldValue::Bool(false))]), &[]).is_valid());
        assert!(!validate(&fields, &Record::new(), &[]).is_valid());
    }

    #[test]
    fn optional_fields_skip_type_checks_when_empty() {
        let fields = vec![field("qty", FieldType::Number)];
        assert!(validate(&fields, &record(&[("qty", FieldValue::text(""))]), &[]).is_valid());
    }

    #[test]
    fn type_checks_numbers_dates_and_selects() {
        let mut status = field("priority", FieldType::Select);
        status.options = Setting::Value(vec![
            SelectOption::new("low", "Low"),
            SelectOption::new("high", "High"),
        ]);
        let fields = vec![
            field("qty", FieldType::Number),
            field("due", FieldType::Date),
            status,
        ];

        let report = validate(
            &fields,
            &record(&[
                ("qty", FieldValue::text("many")),
                ("due", FieldValue::text("tomorrow")),
                ("priority", FieldValue::text("urgent")),
            ]),
            &[],
        );

        let messages: Vec<_> = report.header_errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "QTY must be a number",
                "DUE must be a valid date",
                "PRIORITY must be one of: low, high",
            ]
        );

        let ok = validate(
            &fields,
            &record(&[
                ("qty", FieldValue::text("4")),
                ("due", FieldValue::text("2024-06-01")),
                ("priority", FieldValue::text("high")),
            ]),
            &[],
        );
        assert!(ok.is_valid());
    }

    #[test]
    fn select_without_options_accepts_anything() {
        let fields = vec![field("kind", FieldType::Select)];
        assert!(validate(&fields, &record(&[("kind", FieldValue::text("x"))]), &[]).is_valid());
    }

    #[test]
    fn numeric_bounds_and_custom_message() {
        let mut qty = field("qty", FieldType::Number);
        qty.validation_rules = Setting::Value(ValidationRules {
            min: Some(1.0),
            max: Some(10.0),
            ..ValidationRules::default()
        });
        let mut cost = field("cost", FieldType::Number);
        cost.validation_rules = Setting::Value(ValidationRules {
            min: Some(0.0),
            message: Some("Cost cannot be negative".into()),
            ..ValidationRules::default()
        });
        let fields = vec![qty, cost];

        let report = validate(
            &fields,
            &record(&[("qty", FieldValue::Number(11.0)), ("cost", FieldValue::Number(-1.0))]),
            &[],
        );
        assert_eq!(report.header_errors[0].message, "QTY must be at most 10");
        assert_eq!(report.header_errors[1].message, "Cost cannot be negative");
    }

    #[test]
    fn pattern_applies_to_text() {
        let mut code = field("code", FieldType::Text);
        code.validation_rules = Setting::Value(ValidationRules {
            pattern: Some("^[A-Z]{3}-\\d+$".into()),
            ..ValidationRules::default()
        });
        let fields = vec![code];

        assert!(validate(&fields, &record(&[("code", FieldValue::text("ABC-12"))]), &[]).is_valid());
        let bad = validate(&fields, &record(&[("code", FieldValue::text("abc"))]), &[]);
        assert_eq!(bad.header_errors[0].message, "CODE has an invalid format");
    }

    #[test]
    fn line_errors_use_indexed_paths() {
        let fields = vec![
            required(field("title", FieldType::Text)),
            required(line(field("qty", FieldType::Number))),
        ];
        let lines = vec![
            record(&[("qty", FieldValue::Number(1.0))]),
            record(&[]),
            record(&[("qty", FieldValue::text("x"))]),
        ];

        let report = validate(&fields, &record(&[("title", FieldValue::text("t"))]), &lines);
        assert!(report.header_errors.is_empty());
        assert_eq!(
            report.line_errors,
            vec![
                FieldError::new("lines[1].qty", "Line 2: QTY is required"),
                FieldError::new("lines[2].qty", "Line 3: QTY must be a number"),
            ]
        );
    }

    #[test]
    fn header_fields_ignore_lines_and_vice_versa() {
        let fields = vec![required(line(field("qty", FieldType::Number)))];
        assert!(validate(&fields, &Record::new(), &[]).is_valid());
    }

    #[test]
    fn into_errors_puts_header_first() {
        let report = ValidationReport {
            header_errors: vec![FieldError::new("a", "A")],
            line_errors: vec![FieldError::new("lines[0].b", "B")],
        };
        let fields: Vec<_> = report.into_errors().into_iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["a", "lines[0].b"]);
    }

    #[test]
    fn defaults_and_coercion() {
        let mut qty = line(field("qty", FieldType::Number));
        qty.default_value = Some(FieldValue::Number(1.0));
        let mut urgent = field("urgent", FieldType::Checkbox);
        urgent.default_value = Some(FieldValue::Bool(false));
        let fields = vec![qty, urgent, field("due", FieldType::Date)];

        let mut header = record(&[("due", FieldValue::text("2024-01-31"))]);
        let mut lines = vec![record(&[]), record(&[("qty", FieldValue::text("3"))])];

        apply_defaults(&fields, &mut header, &mut lines);
        coerce(&fields, &mut header, &mut lines);

        assert_eq!(header["urgent"], FieldValue::Bool(false));
        assert!(matches!(header["due"], FieldValue::Date(_)));
        assert_eq!(lines[0]["qty"], FieldValue::Number(1.0));
        assert_eq!(lines[1]["qty"], FieldValue::Number(3.0));
    }
}
