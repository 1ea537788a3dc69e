//! Document Type Registry: runtime-defined document types, their status
//! graph, approval chain and opaque settings. Field definitions are held by
//! the [`FieldSchemaStore`] and composed into [`TypeDefinition`] on read.
use crate::config::{EngineConfig, Page, Pagination};
use crate::error::{Result, WorkflowError};
use crate::schema::{FieldDefinition, FieldPatch, FieldSchemaStore, NewField};
use crate::store::{Store, TxResult, encode, tx_decode, tx_encode};
use crate::types::{Json, Setting, TimeStamp};
use crate::utils;
use crate::validation::FieldError;
use sled::Transactional;
use sled::transaction::{TransactionalTree, abort};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

pub const DEFAULT_CATEGORY: &str = "custom";
pub const ROLE_WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct StatusDef {
    #[n(0)]
    pub key: String,
    #[n(1)]
    pub label: String,
    #[n(2)]
    pub color: String,
}

/// Directed graph of named statuses.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct StatusFlow {
    #[n(0)]
    pub initial_status: String,
    #[n(1)]
    pub statuses: Vec<StatusDef>,
    #[n(2)]
    pub transitions: BTreeMap<String, Vec<String>>,
}

impl Default for StatusFlow {
    /// A single `draft` status with no transitions.
    fn default() -> Self {
        StatusFlow::new("draft").add_status("draft", "Draft", "gray")
    }
}

impl StatusFlow {
    pub fn new(initial_status: &str) -> Self {
        Self {
            initial_status: initial_status.to_string(),
            statuses: Vec::new(),
            transitions: BTreeMap::new(),
        }
    }
    pub fn add_status(mut self, key: &str, label: &str, color: &str) -> Self {
        self.statuses.push(StatusDef {
            key: key.to_string(),
            label: label.to_string(),
            color: color.to_string(),
        });
        self
    }
    pub fn allow(mut self, from: &str, to: &[&str]) -> Self {
        self.transitions
            .entry(from.to_string())
            .or_default()
            .extend(to.iter().map(|s| s.to_string()));
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.statuses.iter().any(|s| s.key == key)
    }

    /// Statuses reachable from `from` in one step.
    pub fn allowed(&self, from: &str) -> &[String] {
        self.transitions.get(from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A status is editable when it has an outgoing transition or is the
    /// initial status; every other status is terminal.
    pub fn is_editable(&self, status: &str) -> bool {
        status == self.initial_status || !self.allowed(status).is_empty()
    }

    pub fn is_terminal(&self, status: &str) -> bool {
        !self.is_editable(status)
    }

    /// Collects every invariant violation of the graph.
    pub fn check(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();

        if self.statuses.is_empty() {
            errors.push(FieldError::new(
                "statusFlow.statuses",
                "Status flow must define at least one status",
            ));
        }

        let mut seen = HashSet::new();
        for status in &self.statuses {
            if status.key.trim().is_empty() {
                errors.push(FieldError::new("statusFlow.statuses", "Status key must not be empty"));
            } else if !seen.insert(status.key.as_str()) {
                errors.push(FieldError::new(
                    "statusFlow.statuses",
                    format!("Duplicate status key '{}'", status.key),
                ));
            }
        }

        if !self.contains(&self.initial_status) {
            errors.push(FieldError::new(
                "statusFlow.initialStatus",
                format!("Initial status '{}' is not a defined status", self.initial_status),
            ));
        }

        for (from, targets) in &self.transitions {
            let path = format!("statusFlow.transitions.{from}");
            if !self.contains(from) {
                errors.push(FieldError::new(
                    path.clone(),
                    format!("Transition source '{from}' is not a defined status"),
                ));
            }
            for to in targets.iter().filter(|to| !self.contains(to)) {
                errors.push(FieldError::new(
                    path.clone(),
                    format!("Transition target '{to}' from '{from}' is not a defined status"),
                ));
            }
        }

        errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ApprovalLevel {
    #[n(0)]
    pub role: String,
    #[n(1)]
    pub level: u32,
}

impl ApprovalLevel {
    pub fn new(role: &str, level: u32) -> Self {
        Self {
            role: role.to_string(),
            level,
        }
    }
}

/// Levels must start at 1, be strictly increasing and name a role.
pub fn check_approval_levels(levels: &[ApprovalLevel]) -> Vec<FieldError> {
    let mut errors = Vec::new();
    let mut previous: Option<u32> = None;

    for level in levels {
        if level.level == 0 {
            errors.push(FieldError::new("approvalConfig", "Approval levels start at 1"));
        }
        if level.role.trim().is_empty() {
            errors.push(FieldError::new(
                "approvalConfig",
                format!("Approval level {} has no role", level.level),
            ));
        }
        if let Some(prev) = previous.filter(|prev| level.level <= *prev) {
            errors.push(FieldError::new(
                "approvalConfig",
                format!(
                    "Approval levels must be strictly increasing (level {} follows {prev})",
                    level.level
                ),
            ));
        }
        previous = Some(level.level);
    }

    errors
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct DocumentType {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub code: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub description: Option<String>,
    #[n(4)]
    pub category: String,
    #[n(5)]
    pub is_active: bool,
    #[n(6)]
    pub version: u64,
    #[n(7)]
    pub status_flow: StatusFlow,
    #[n(8)]
    pub approval_config: Setting<Vec<ApprovalLevel>>,
    #[n(9)]
    pub permission_config: Setting<Json>,
    #[n(10)]
    pub settings: Json,
    #[n(11)]
    pub visible_to_roles: Vec<String>,
    #[n(12)]
    pub created_by: String,
    #[n(13)]
    pub created_at: TimeStamp,
    #[n(14)]
    pub updated_at: TimeStamp,
}

impl DocumentType {
    /// The configured approval chain, or `None` when the type needs no approval.
    pub fn approval_levels(&self) -> Option<&[ApprovalLevel]> {
        self.approval_config
            .as_value()
            .map(Vec::as_slice)
            .filter(|levels| !levels.is_empty())
    }

    pub fn is_visible_to(&self, role: &str) -> bool {
        self.visible_to_roles
            .iter()
            .any(|r| r == role || r == ROLE_WILDCARD)
    }

    fn check(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.code.trim().is_empty() {
            errors.push(FieldError::new("code", "Code is required"));
        }
        if self.name.trim().is_empty() {
            errors.push(FieldError::new("name", "Name is required"));
        }
        errors.extend(self.status_flow.check());
        if let Some(levels) = self.approval_config.as_value() {
            errors.extend(check_approval_levels(levels));
        }
        match errors.is_empty() {
            true => Ok(()),
            false => Err(WorkflowError::validation(errors)),
        }
    }
}

/// A document type with its fields ordered by `sort_order`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDefinition {
    pub doc_type: DocumentType,
    pub fields: Vec<FieldDefinition>,
}

impl TypeDefinition {
    pub fn header_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| !f.is_line_item)
    }

    pub fn line_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.is_line_item)
    }

    pub fn field(&self, field_key: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.field_key == field_key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewDocumentType {
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub is_active: Option<bool>,
    pub status_flow: Option<StatusFlow>,
    pub approval_config: Setting<Vec<ApprovalLevel>>,
    pub permission_config: Setting<Json>,
    pub settings: Option<Json>,
    pub visible_to_roles: Option<Vec<String>>,
}

impl NewDocumentType {
    pub fn new(code: &str, name: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }
    pub fn set_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
    pub fn set_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }
    pub fn set_active(mut self, active: bool) -> Self {
        self.is_active = Some(active);
        self
    }
    pub fn set_status_flow(mut self, flow: StatusFlow) -> Self {
        self.status_flow = Some(flow);
        self
    }
    pub fn set_approval_levels(mut self, levels: &[(&str, u32)]) -> Self {
        self.approval_config = Setting::Value(
            levels
                .iter()
                .map(|(role, level)| ApprovalLevel::new(role, *level))
                .collect(),
        );
        self
    }
    pub fn set_permission_config(mut self, config: serde_json::Value) -> Self {
        self.permission_config = Setting::Value(Json(config));
        self
    }
    pub fn set_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = Some(Json(settings));
        self
    }
    pub fn set_visible_to(mut self, roles: &[&str]) -> Self {
        self.visible_to_roles = Some(roles.iter().map(|r| r.to_string()).collect());
        self
    }
}

/// Partial update; only supplied attributes are written. `code` is fixed at
/// creation because numbering scopes and approval tags derive from it.
#[derive(Debug, Clone, Default)]
pub struct DocumentTypePatch {
    pub name: Option<String>,
    pub description: Setting<String>,
    pub category: Option<String>,
    pub is_active: Option<bool>,
    pub status_flow: Option<StatusFlow>,
    pub approval_config: Setting<Vec<ApprovalLevel>>,
    pub permission_config: Setting<Json>,
    pub settings: Option<Json>,
    pub visible_to_roles: Option<Vec<String>>,
}

impl DocumentTypePatch {
    fn apply(self, doc_type: &mut DocumentType) {
        if let Some(name) = self.name {
            doc_type.name = name;
        }
        doc_type.description = self.description.patch_option(doc_type.description.take());
        if let Some(category) = self.category {
            doc_type.category = category;
        }
        if let Some(active) = self.is_active {
            doc_type.is_active = active;
        }
        if let Some(flow) = self.status_flow {
            doc_type.status_flow = flow;
        }
        doc_type.approval_config = self.approval_config.patch(doc_type.approval_config.clone());
        doc_type.permission_config = self
            .permission_config
            .patch(doc_type.permission_config.clone());
        if let Some(settings) = self.settings {
            doc_type.settings = settings;
        }
        if let Some(roles) = self.visible_to_roles {
            doc_type.visible_to_roles = roles;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeFilter {
    /// Case-insensitive substring of name or code.
    pub search: Option<String>,
    pub category: Option<String>,
    pub is_active: Option<bool>,
}

impl TypeFilter {
    fn matches(&self, doc_type: &DocumentType) -> bool {
        if let Some(search) = self.search.as_deref().map(str::to_lowercase) {
            if !doc_type.name.to_lowercase().contains(&search)
                && !doc_type.code.to_lowercase().contains(&search)
            {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if &doc_type.category != category {
                return false;
            }
        }
        if let Some(active) = self.is_active {
            if doc_type.is_active != active {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeSummary {
    pub doc_type: DocumentType,
    pub field_count: usize,
    pub instance_count: u64,
}

#[derive(Clone)]
pub struct TypeRegistry {
    store: Store,
    schema: FieldSchemaStore,
    config: EngineConfig,
}

impl TypeRegistry {
    pub fn new(store: Store, config: EngineConfig) -> Self {
        Self {
            schema: FieldSchemaStore::new(store.clone()),
            store,
            config,
        }
    }

    pub fn schema(&self) -> &FieldSchemaStore {
        &self.schema
    }

    pub fn list(&self, filter: &TypeFilter, pagination: Pagination) -> Result<Page<TypeSummary>> {
        let mut matches = self
            .all_types()?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect::<Vec<_>>();
        matches.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.code.cmp(&b.code)));

        Page::slice(matches, pagination, &self.config).try_map(|doc_type| -> Result<TypeSummary> {
            Ok(TypeSummary {
                field_count: self.schema.field_count(&doc_type.id)?,
                instance_count: self.store.instance_count(&doc_type.id)?,
                doc_type,
            })
        })
    }

    pub fn get_by_id(&self, type_id: &str) -> Result<TypeDefinition> {
        debug!(type_id, "loading document type");
        let doc_type = self
            .store
            .load_type(type_id)?
            .ok_or_else(|| WorkflowError::not_found("document type", type_id))?;
        self.compose(doc_type)
    }

    pub fn get_by_code(&self, code: &str) -> Result<TypeDefinition> {
        debug!(code, "loading document type by code");
        let type_id = self
            .store
            .type_id_for_code(code)?
            .ok_or_else(|| WorkflowError::not_found("document type", code))?;
        let doc_type = self
            .store
            .load_type(&type_id)?
            .ok_or_else(|| WorkflowError::not_found("document type", code))?;
        self.compose(doc_type)
    }

    pub fn create(&self, input: NewDocumentType, actor_id: &str) -> Result<TypeDefinition> {
        let now = TimeStamp::now();
        let doc_type = DocumentType {
            id: utils::new_uuid_to_bech32("doctype_")?,
            code: input.code.trim().to_string(),
            name: input.name,
            description: input.description,
            category: input.category.unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            is_active: input.is_active.unwrap_or(true),
            version: 1,
            status_flow: input.status_flow.unwrap_or_default(),
            approval_config: input.approval_config.or_null(),
            permission_config: input.permission_config.or_null(),
            settings: input.settings.unwrap_or_else(Json::empty_object),
            visible_to_roles: input
                .visible_to_roles
                .unwrap_or_else(|| vec!["admin".to_string()]),
            created_by: actor_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        doc_type.check()?;

        let raw = encode(&doc_type)?;
        (&self.store.types, &self.store.type_codes).transaction(
            |(types, codes)| -> TxResult<()> {
                if codes.get(doc_type.code.as_bytes())?.is_some() {
                    return abort(WorkflowError::rule(format!(
                        "Document type with code '{}' already exists",
                        doc_type.code
                    )));
                }
                types.insert(doc_type.id.as_bytes(), raw.as_slice())?;
                codes.insert(doc_type.code.as_bytes(), doc_type.id.as_bytes())?;
                Ok(())
            },
        )?;

        info!(type_id = %doc_type.id, code = %doc_type.code, actor_id, "created document type");
        Ok(TypeDefinition {
            doc_type,
            fields: Vec::new(),
        })
    }

    /// Writes supplied attributes and always bumps `version`.
    pub fn update(&self, type_id: &str, patch: DocumentTypePatch) -> Result<TypeDefinition> {
        let updated = self.store.types.transaction(|types| -> TxResult<DocumentType> {
            let mut doc_type = touch(types, type_id)?;
            patch.clone().apply(&mut doc_type);
            if let Err(err) = doc_type.check() {
                return abort(err);
            }
            types.insert(type_id.as_bytes(), tx_encode(&doc_type)?)?;
            Ok(doc_type)
        })?;

        info!(type_id, code = %updated.code, version = updated.version, "updated document type");
        self.compose(updated)
    }

    /// Removes a type and its fields. Refused while instances exist.
    pub fn delete(&self, type_id: &str) -> Result<DocumentType> {
        let removed = (
            &self.store.types,
            &self.store.type_codes,
            &self.store.fields,
            &self.store.field_owners,
            &self.store.type_stats,
        )
            .transaction(|(types, codes, fields, owners, stats)| -> TxResult<DocumentType> {
                let Some(raw) = types.get(type_id.as_bytes())? else {
                    return abort(WorkflowError::not_found("document type", type_id));
                };
                let doc_type: DocumentType = tx_decode(&raw)?;

                let count = stats
                    .get(type_id.as_bytes())?
                    .map(|raw| crate::store::read_u64(&raw))
                    .unwrap_or(0);
                if count > 0 {
                    return abort(WorkflowError::rule(format!(
                        "Cannot delete document type '{}': {count} document(s) exist. Deactivate it instead.",
                        doc_type.code
                    )));
                }

                FieldSchemaStore::stage_remove_all(fields, owners, type_id)?;
                types.remove(type_id.as_bytes())?;
                codes.remove(doc_type.code.as_bytes())?;
                stats.remove(type_id.as_bytes())?;
                Ok(doc_type)
            })
            .inspect_err(|err| warn!(type_id, %err, "document type not deleted"))?;

        info!(type_id, code = %removed.code, "deleted document type");
        Ok(removed)
    }

    pub fn add_field(&self, type_id: &str, input: NewField) -> Result<FieldDefinition> {
        self.schema.add(type_id, input)
    }

    pub fn update_field(&self, field_id: &str, patch: FieldPatch) -> Result<FieldDefinition> {
        self.schema.update(field_id, patch)
    }

    pub fn delete_field(&self, field_id: &str) -> Result<FieldDefinition> {
        self.schema.delete(field_id)
    }

    pub fn reorder_fields(
        &self,
        type_id: &str,
        ordered_field_ids: &[String],
    ) -> Result<Vec<FieldDefinition>> {
        self.schema.reorder(type_id, ordered_field_ids)
    }

    /// Active types visible to `role` (or to everyone), by category then name.
    pub fn active_types_for_role(&self, role: &str) -> Result<Vec<DocumentType>> {
        let mut visible = self
            .all_types()?
            .into_iter()
            .filter(|t| t.is_active && t.is_visible_to(role))
            .collect::<Vec<_>>();
        visible.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(visible)
    }

    fn all_types(&self) -> Result<Vec<DocumentType>> {
        self.store
            .types
            .iter()
            .map(|item| -> Result<DocumentType> {
                let (_, raw) = item?;
                crate::store::decode(&raw)
            })
            .collect()
    }

    fn compose(&self, doc_type: DocumentType) -> Result<TypeDefinition> {
        let fields = self.schema.fields(&doc_type.id)?;
        Ok(TypeDefinition { doc_type, fields })
    }
}

/// Loads a type inside a transaction and records an edit: `version + 1` and a
/// fresh `updated_at`. The caller's transaction decides whether it commits.
pub(crate) fn touch(types: &TransactionalTree, type_id: &str) -> TxResult<DocumentType> {
    let Some(raw) = types.get(type_id.as_bytes())? else {
        return abort(WorkflowError::not_found("document type", type_id));
    };
    let mut doc_type: DocumentType = tx_decode(&raw)?;
    doc_type.version += 1;
    doc_type.updated_at = TimeStamp::now();
    types.insert(type_id.as_bytes(), tx_encode(&doc_type)?)?;
    Ok(doc_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work_order_flow() -> StatusFlow {
        StatusFlow::new("draft")
            .add_status("draft", "Draft", "gray")
            .add_status("submitted", "Submitted", "blue")
            .add_status("approved", "Approved", "green")
            .add_status("rejected", "Rejected", "red")
            .allow("draft", &["submitted"])
            .allow("submitted", &["approved", "rejected"])
    }

    #[test]
    fn default_flow_is_a_single_draft_status() {
        let flow = StatusFlow::default();
        assert_eq!(flow.initial_status, "draft");
        assert_eq!(flow.statuses.len(), 1);
        assert!(flow.transitions.is_empty());
        assert!(flow.check().is_empty());
        assert!(flow.is_editable("draft"));
    }

    #[test]
    fn editability_follows_outgoing_transitions() {
        let flow = work_order_flow();
        assert!(flow.is_editable("draft"));
        assert!(flow.is_editable("submitted"));
        assert!(flow.is_terminal("approved"));
        assert_eq!(flow.allowed("approved"), &[] as &[String]);
    }

    #[test]
    fn check_reports_unknown_keys() {
        let flow = StatusFlow::new("start")
            .add_status("draft", "Draft", "gray")
            .allow("draft", &["done"])
            .allow("ghost", &["draft"]);

        let fields: Vec<_> = flow.check().into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "statusFlow.initialStatus",
                "statusFlow.transitions.draft",
                "statusFlow.transitions.ghost",
            ]
        );
    }

    #[test]
    fn check_rejects_duplicate_status_keys() {
        let flow = StatusFlow::default().add_status("draft", "Again", "gray");
        assert_eq!(flow.check().len(), 1);
    }

    #[test]
    fn approval_levels_must_increase() {
        assert!(check_approval_levels(&[ApprovalLevel::new("a", 1), ApprovalLevel::new("b", 2)])
            .is_empty());

        let errors = check_approval_levels(&[ApprovalLevel::new("a", 2), ApprovalLevel::new("b", 2)]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("strictly increasing"));

        assert_eq!(check_approval_levels(&[ApprovalLevel::new("", 0)]).len(), 2);
    }

    #[test]
    fn filter_matches_name_or_code_case_insensitively() {
        let now = TimeStamp::now();
        let doc_type = DocumentType {
            id: "doctype_1".into(),
            code: "WO".into(),
            name: "Work Order".into(),
            description: None,
            category: "operations".into(),
            is_active: true,
            version: 1,
            status_flow: StatusFlow::default(),
            approval_config: Setting::Null,
            permission_config: Setting::Null,
            settings: Json::empty_object(),
            visible_to_roles: vec!["admin".into()],
            created_by: "user_1".into(),
            created_at: now,
            updated_at: now,
        };

        let by = |search: &str| TypeFilter {
            search: Some(search.into()),
            ..TypeFilter::default()
        };
        assert!(by("work").matches(&doc_type));
        assert!(by("wo").matches(&doc_type));
        assert!(!by("receipt").matches(&doc_type));

        let inactive = TypeFilter {
            is_active: Some(false),
            ..TypeFilter::default()
        };
        assert!(!inactive.matches(&doc_type));
    }
}
