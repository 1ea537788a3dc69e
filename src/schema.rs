//! Field Schema Store: the ordered field definitions of each document type.
//!
//! All fields of a type live under a single key (`type_id → Vec<FieldDefinition>`)
//! so that adding, removing and reordering fields is one atomic write. A
//! `field_id → type_id` index resolves individual fields.
use crate::error::{Result, WorkflowError};
use crate::registry;
use crate::store::{Store, TxResult, tx_decode, tx_encode};
use crate::types::{FieldValue, Json, Setting};
use crate::utils;
use crate::validation::FieldError;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionalTree, abort};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum FieldType {
    #[n(0)]
    Text,
    #[n(1)]
    Textarea,
    #[n(2)]
    Number,
    #[n(3)]
    Select,
    #[n(4)]
    Checkbox,
    #[n(5)]
    Date,
    #[n(6)]
    File,
    /// Any other widget kind. Only the `required` and `pattern` rules apply.
    #[n(7)]
    Custom(#[n(0)] String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::Text => "text",
            FieldType::Textarea => "textarea",
            FieldType::Number => "number",
            FieldType::Select => "select",
            FieldType::Checkbox => "checkbox",
            FieldType::Date => "date",
            FieldType::File => "file",
            FieldType::Custom(kind) => kind,
        }
    }
}

impl FromStr for FieldType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "text" => FieldType::Text,
            "textarea" => FieldType::Textarea,
            "number" => FieldType::Number,
            "select" => FieldType::Select,
            "checkbox" => FieldType::Checkbox,
            "date" => FieldType::Date,
            "file" => FieldType::File,
            other => FieldType::Custom(other.to_string()),
        })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct SelectOption {
    #[n(0)]
    pub value: String,
    #[n(1)]
    pub label: String,
}

impl SelectOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// The fixed rule kinds a field may carry on top of its declared type.
#[derive(Debug, Clone, PartialEq, Default, minicbor::Encode, minicbor::Decode)]
pub struct ValidationRules {
    #[n(0)]
    pub required: Option<bool>,
    #[n(1)]
    pub min: Option<f64>,
    #[n(2)]
    pub max: Option<f64>,
    #[n(3)]
    pub pattern: Option<String>,
    /// Replaces the generated message for bound and pattern failures.
    #[n(4)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct FieldDefinition {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub document_type_id: String,
    #[n(2)]
    pub field_key: String,
    #[n(3)]
    pub label: String,
    #[n(4)]
    pub field_type: FieldType,
    #[n(5)]
    pub options: Setting<Vec<SelectOption>>,
    #[n(6)]
    pub is_required: bool,
    #[n(7)]
    pub show_in_grid: bool,
    #[n(8)]
    pub show_in_form: bool,
    #[n(9)]
    pub section_name: Option<String>,
    #[n(10)]
    pub sort_order: u32,
    #[n(11)]
    pub validation_rules: Setting<ValidationRules>,
    #[n(12)]
    pub default_value: Option<FieldValue>,
    #[n(13)]
    pub col_span: u8,
    #[n(14)]
    pub is_line_item: bool,
    #[n(15)]
    pub is_read_only: bool,
    #[n(16)]
    pub conditional_display: Setting<Json>,
    #[n(17)]
    pub placeholder: Option<String>,
    #[n(18)]
    pub help_text: Option<String>,
}

impl FieldDefinition {
    /// `is_required` or a `required` validation rule.
    pub fn requires_value(&self) -> bool {
        self.is_required
            || self
                .validation_rules
                .as_value()
                .and_then(|r| r.required)
                .unwrap_or(false)
    }

    pub fn option_values(&self) -> Option<Vec<&str>> {
        self.options
            .as_value()
            .map(|opts| opts.iter().map(|o| o.value.as_str()).collect())
    }
}

/// Input for [`FieldSchemaStore::add`]. Unsupplied attributes take their defaults.
#[derive(Debug, Clone, Default)]
pub struct NewField {
    pub field_key: String,
    pub label: String,
    pub field_type: Option<FieldType>,
    pub options: Setting<Vec<SelectOption>>,
    pub is_required: Option<bool>,
    pub show_in_grid: Option<bool>,
    pub show_in_form: Option<bool>,
    pub section_name: Option<String>,
    pub sort_order: Option<u32>,
    pub validation_rules: Setting<ValidationRules>,
    pub default_value: Option<FieldValue>,
    pub col_span: Option<u8>,
    pub is_line_item: Option<bool>,
    pub is_read_only: Option<bool>,
    pub conditional_display: Setting<Json>,
    pub placeholder: Option<String>,
    pub help_text: Option<String>,
}

impl NewField {
    pub fn new(field_key: &str, label: &str, field_type: FieldType) -> Self {
        Self {
            field_key: field_key.to_string(),
            label: label.to_string(),
            field_type: Some(field_type),
            ..Self::default()
        }
    }
    pub fn set_required(mut self, required: bool) -> Self {
        self.is_required = Some(required);
        self
    }
    pub fn set_line_item(mut self, line_item: bool) -> Self {
        self.is_line_item = Some(line_item);
        self
    }
    pub fn set_options(mut self, options: &[(&str, &str)]) -> Self {
        self.options = Setting::Value(
            options
                .iter()
                .map(|(value, label)| SelectOption::new(*value, *label))
                .collect(),
        );
        self
    }
    pub fn set_rules(mut self, rules: ValidationRules) -> Self {
        self.validation_rules = Setting::Value(rules);
        self
    }
    pub fn set_sort_order(mut self, sort_order: u32) -> Self {
        self.sort_order = Some(sort_order);
        self
    }
    pub fn set_default_value(mut self, value: FieldValue) -> Self {
        self.default_value = Some(value);
        self
    }
    pub fn set_section(mut self, section: &str) -> Self {
        self.section_name = Some(section.to_string());
        self
    }
    pub fn set_show_in_grid(mut self, show: bool) -> Self {
        self.show_in_grid = Some(show);
        self
    }
    pub fn set_read_only(mut self, read_only: bool) -> Self {
        self.is_read_only = Some(read_only);
        self
    }
    pub fn set_col_span(mut self, col_span: u8) -> Self {
        self.col_span = Some(col_span);
        self
    }

    fn check(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.field_key.trim().is_empty() {
            errors.push(FieldError::new("fieldKey", "Field key is required"));
        }
        if self.label.trim().is_empty() {
            errors.push(FieldError::new("label", "Label is required"));
        }
        match errors.is_empty() {
            true => Ok(()),
            false => Err(WorkflowError::validation(errors)),
        }
    }
}

/// Partial field update. `None`/`Setting::Unset` leave the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct FieldPatch {
    pub field_key: Option<String>,
    pub label: Option<String>,
    pub field_type: Option<FieldType>,
    pub options: Setting<Vec<SelectOption>>,
    pub is_required: Option<bool>,
    pub show_in_grid: Option<bool>,
    pub show_in_form: Option<bool>,
    pub section_name: Setting<String>,
    pub sort_order: Option<u32>,
    pub validation_rules: Setting<ValidationRules>,
    pub default_value: Setting<FieldValue>,
    pub col_span: Option<u8>,
    pub is_line_item: Option<bool>,
    pub is_read_only: Option<bool>,
    pub conditional_display: Setting<Json>,
    pub placeholder: Setting<String>,
    pub help_text: Setting<String>,
}

impl FieldPatch {
    fn apply(self, field: &mut FieldDefinition) {
        if let Some(key) = self.field_key {
            field.field_key = key;
        }
        if let Some(label) = self.label {
            field.label = label;
        }
        if let Some(field_type) = self.field_type {
            field.field_type = field_type;
        }
        field.options = self.options.patch(field.options.clone());
        if let Some(v) = self.is_required {
            field.is_required = v;
        }
        if let Some(v) = self.show_in_grid {
            field.show_in_grid = v;
        }
        if let Some(v) = self.show_in_form {
            field.show_in_form = v;
        }
        field.section_name = self.section_name.patch_option(field.section_name.take());
        if let Some(v) = self.sort_order {
            field.sort_order = v;
        }
        field.validation_rules = self.validation_rules.patch(field.validation_rules.clone());
        field.default_value = self.default_value.patch_option(field.default_value.take());
        if let Some(v) = self.col_span {
            field.col_span = v;
        }
        if let Some(v) = self.is_line_item {
            field.is_line_item = v;
        }
        if let Some(v) = self.is_read_only {
            field.is_read_only = v;
        }
        field.conditional_display = self
            .conditional_display
            .patch(field.conditional_display.clone());
        field.placeholder = self.placeholder.patch_option(field.placeholder.take());
        field.help_text = self.help_text.patch_option(field.help_text.take());
    }
}

#[derive(Clone)]
pub struct FieldSchemaStore {
    store: Store,
}

impl FieldSchemaStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Fields of a type ordered by `sort_order` ascending.
    pub fn fields(&self, type_id: &str) -> Result<Vec<FieldDefinition>> {
        let mut fields = self.store.load_fields(type_id)?;
        sort_fields(&mut fields);
        Ok(fields)
    }

    pub fn field_count(&self, type_id: &str) -> Result<usize> {
        Ok(self.store.load_fields(type_id)?.len())
    }

    pub fn add(&self, type_id: &str, input: NewField) -> Result<FieldDefinition> {
        input.check()?;
        let field_id = utils::new_uuid_to_bech32("field_")?;

        let field = (&self.store.types, &self.store.fields, &self.store.field_owners).transaction(
            |(types, fields, owners)| -> TxResult<FieldDefinition> {
                let doc_type = registry::touch(types, type_id)?;
                let mut current = read_fields(fields, type_id)?;

                if current.iter().any(|f| f.field_key == input.field_key) {
                    return abort(duplicate_key(&input.field_key, &doc_type.code));
                }

                let sort_order = input.sort_order.unwrap_or_else(|| {
                    current
                        .iter()
                        .map(|f| f.sort_order.saturating_add(1))
                        .max()
                        .unwrap_or(0)
                });

                let field = FieldDefinition {
                    id: field_id.clone(),
                    document_type_id: type_id.to_string(),
                    field_key: input.field_key.clone(),
                    label: input.label.clone(),
                    field_type: input.field_type.clone().unwrap_or(FieldType::Text),
                    options: input.options.clone().or_null(),
                    is_required: input.is_required.unwrap_or(false),
                    show_in_grid: input.show_in_grid.unwrap_or(false),
                    show_in_form: input.show_in_form.unwrap_or(true),
                    section_name: input.section_name.clone(),
                    sort_order,
                    validation_rules: input.validation_rules.clone().or_null(),
                    default_value: input.default_value.clone(),
                    col_span: input.col_span.unwrap_or(2),
                    is_line_item: input.is_line_item.unwrap_or(false),
                    is_read_only: input.is_read_only.unwrap_or(false),
                    conditional_display: input.conditional_display.clone().or_null(),
                    placeholder: input.placeholder.clone(),
                    help_text: input.help_text.clone(),
                };

                current.push(field.clone());
                write_fields(fields, type_id, &mut current)?;
                owners.insert(field_id.as_bytes(), type_id.as_bytes())?;
                Ok(field)
            },
        )?;

        info!(type_id, field_key = %field.field_key, sort_order = field.sort_order, "added field");
        Ok(field)
    }

    pub fn update(&self, field_id: &str, patch: FieldPatch) -> Result<FieldDefinition> {
        let field = (&self.store.types, &self.store.fields, &self.store.field_owners).transaction(
            |(types, fields, owners)| -> TxResult<FieldDefinition> {
                let type_id = owner_of(owners, field_id)?;
                let doc_type = registry::touch(types, &type_id)?;
                let mut current = read_fields(fields, &type_id)?;

                if let Some(key) = &patch.field_key {
                    if current.iter().any(|f| &f.field_key == key && f.id != field_id) {
                        return abort(duplicate_key(key, &doc_type.code));
                    }
                }

                let Some(field) = current.iter_mut().find(|f| f.id == field_id) else {
                    return abort(WorkflowError::not_found("field", field_id));
                };
                patch.clone().apply(field);
                let updated = field.clone();

                write_fields(fields, &type_id, &mut current)?;
                Ok(updated)
            },
        )?;

        info!(field_id, field_key = %field.field_key, "updated field");
        Ok(field)
    }

    pub fn delete(&self, field_id: &str) -> Result<FieldDefinition> {
        let removed = (&self.store.types, &self.store.fields, &self.store.field_owners)
            .transaction(|(types, fields, owners)| -> TxResult<FieldDefinition> {
                let type_id = owner_of(owners, field_id)?;
                registry::touch(types, &type_id)?;
                let mut current = read_fields(fields, &type_id)?;

                let Some(pos) = current.iter().position(|f| f.id == field_id) else {
                    return abort(WorkflowError::not_found("field", field_id));
                };
                let removed = current.remove(pos);

                write_fields(fields, &type_id, &mut current)?;
                owners.remove(field_id.as_bytes())?;
                Ok(removed)
            })?;

        info!(field_id, field_key = %removed.field_key, "deleted field");
        Ok(removed)
    }

    /// Assigns `sort_order = index` following `ordered_ids`. Fields not listed
    /// keep their order value. Empty input writes nothing.
    pub fn reorder(&self, type_id: &str, ordered_ids: &[String]) -> Result<Vec<FieldDefinition>> {
        if ordered_ids.is_empty() {
            debug!(type_id, "empty reorder request");
            return self.fields(type_id);
        }

        let reordered = (&self.store.types, &self.store.fields).transaction(
            |(types, fields)| -> TxResult<Vec<FieldDefinition>> {
                registry::touch(types, type_id)?;
                let mut current = read_fields(fields, type_id)?;

                for (index, id) in ordered_ids.iter().enumerate() {
                    let Some(field) = current.iter_mut().find(|f| &f.id == id) else {
                        return abort(WorkflowError::not_found("field", id.as_str()));
                    };
                    let Ok(position) = u32::try_from(index) else {
                        return abort(WorkflowError::rule(format!(
                            "Cannot reorder more than {} fields",
                            u32::MAX
                        )));
                    };
                    field.sort_order = position;
                }

                write_fields(fields, type_id, &mut current)?;
                Ok(current)
            },
        )?;

        info!(type_id, count = ordered_ids.len(), "reordered fields");
        Ok(reordered)
    }

    /// Removes every field of a type inside an enclosing transaction.
    pub(crate) fn stage_remove_all(
        fields: &TransactionalTree,
        owners: &TransactionalTree,
        type_id: &str,
    ) -> TxResult<usize> {
        let current = read_fields(fields, type_id)?;
        for field in &current {
            owners.remove(field.id.as_bytes())?;
        }
        fields.remove(type_id.as_bytes())?;
        Ok(current.len())
    }
}

fn sort_fields(fields: &mut [FieldDefinition]) {
    fields.sort_by_key(|f| f.sort_order);
}

fn read_fields(fields: &TransactionalTree, type_id: &str) -> TxResult<Vec<FieldDefinition>> {
    match fields.get(type_id.as_bytes())? {
        Some(raw) => tx_decode(&raw),
        None => Ok(Vec::new()),
    }
}

fn write_fields(
    fields: &TransactionalTree,
    type_id: &str,
    current: &mut Vec<FieldDefinition>,
) -> TxResult<()> {
    sort_fields(current);
    fields.insert(type_id.as_bytes(), tx_encode(&*current)?)?;
    Ok(())
}

fn owner_of(owners: &TransactionalTree, field_id: &str) -> TxResult<String> {
    match owners.get(field_id.as_bytes())? {
        Some(raw) => Ok(String::from_utf8_lossy(&raw).into_owned()),
        None => Err(ConflictableTransactionError::Abort(WorkflowError::not_found(
            "field", field_id,
        ))),
    }
}

fn duplicate_key(field_key: &str, type_code: &str) -> WorkflowError {
    WorkflowError::rule(format!(
        "Field key '{field_key}' already exists on document type '{type_code}'"
    ))
}
