//! Service layer API for document workflow operations
use crate::approval::{
    ApprovalEngine, ApprovalOutcome, ApprovalStep, Authorizer, LeaveStatus, RejectionPolicy,
    materialize, stage_steps,
};
use crate::config::{EngineConfig, Page, Pagination};
use crate::error::{Result, WorkflowError};
use crate::history::{HistoryAction, HistoryEntry, HistoryLedger};
use crate::registry::{TypeDefinition, TypeRegistry};
use crate::store::{Store, TxResult, read_u64, tx_decode, tx_encode};
use crate::types::{Record, TimeStamp};
use crate::utils::{self, compound_key, key_prefix};
use crate::validation::{apply_defaults, coerce, validate};
use sled::transaction::{ConflictableTransactionError, TransactionalTree, abort};
use sled::{Db, Transactional};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct DocumentLine {
    #[n(0)]
    pub line_number: u32,
    #[n(1)]
    pub data: Record,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct DocumentInstance {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub document_type_id: String,
    #[n(2)]
    pub type_code: String,
    #[n(3)]
    pub document_number: String,
    #[n(4)]
    pub status: String,
    #[n(5)]
    pub data: Record,
    #[n(6)]
    pub lines: Vec<DocumentLine>,
    #[n(7)]
    pub project_id: Option<String>,
    #[n(8)]
    pub warehouse_id: Option<String>,
    #[n(9)]
    pub created_by: String,
    #[n(10)]
    pub updated_by: String,
    #[n(11)]
    pub version: u64,
    #[n(12)]
    pub created_at: TimeStamp,
    #[n(13)]
    pub updated_at: TimeStamp,
}

impl DocumentInstance {
    pub fn line_records(&self) -> Vec<Record> {
        self.lines.iter().map(|line| line.data.clone()).collect()
    }
}

/// Lines numbered from 1 in the order given.
fn number_lines(lines: Vec<Record>) -> Vec<DocumentLine> {
    lines
        .into_iter()
        .zip(1u32..)
        .map(|(data, line_number)| DocumentLine { line_number, data })
        .collect()
}

/// Issues document numbers. Runs inside the creation transaction with the
/// counters tree, so an aborted creation leaves the counter untouched.
pub trait SequenceGenerator: Send + Sync {
    fn generate(&self, scope: &str, counters: &TransactionalTree) -> TxResult<String>;
}

/// `"<CODE>-<n>"` with `n` zero padded to `width`, one counter per scope.
#[derive(Debug, Clone, Copy)]
pub struct ScopedCounter {
    pub width: usize,
}

impl SequenceGenerator for ScopedCounter {
    fn generate(&self, scope: &str, counters: &TransactionalTree) -> TxResult<String> {
        let last = counters
            .get(scope.as_bytes())?
            .map(|raw| read_u64(&raw))
            .unwrap_or(0);
        let next = last + 1;
        counters.insert(scope.as_bytes(), next.to_be_bytes().to_vec())?;

        let prefix = scope.rsplit(':').next().unwrap_or(scope);
        Ok(format!("{prefix}-{next:0width$}", width = self.width))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Update,
    Transition,
    Rejection,
}

/// Consulted before a document is overwritten. Returning an error vetoes the
/// write; nothing is persisted.
pub trait WriteGuard: Send + Sync {
    fn check(&self, current: &DocumentInstance, kind: WriteKind) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl WriteGuard for AllowAll {
    fn check(&self, _: &DocumentInstance, _: WriteKind) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewDocument {
    pub data: Record,
    pub lines: Vec<Record>,
    pub project_id: Option<String>,
    pub warehouse_id: Option<String>,
}

impl NewDocument {
    pub fn new(data: Record) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }
    pub fn set_lines(mut self, lines: Vec<Record>) -> Self {
        self.lines = lines;
        self
    }
    pub fn set_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }
    pub fn set_warehouse(mut self, warehouse_id: &str) -> Self {
        self.warehouse_id = Some(warehouse_id.to_string());
        self
    }
}

/// `None` keeps the stored value. Supplied lines replace all existing lines.
#[derive(Debug, Clone, Default)]
pub struct DocumentChanges {
    pub data: Option<Record>,
    pub lines: Option<Vec<Record>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub before: DocumentInstance,
    pub after: DocumentInstance,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub status: Option<String>,
    /// Case-insensitive substring of the document number.
    pub search: Option<String>,
    pub project_id: Option<String>,
    pub warehouse_id: Option<String>,
}

impl DocumentFilter {
    fn matches(&self, document: &DocumentInstance) -> bool {
        if self.status.as_ref().is_some_and(|s| s != &document.status) {
            return false;
        }
        if let Some(search) = self.search.as_deref().map(str::to_lowercase) {
            if !document.document_number.to_lowercase().contains(&search) {
                return false;
            }
        }
        if self.project_id.is_some() && self.project_id != document.project_id {
            return false;
        }
        if self.warehouse_id.is_some() && self.warehouse_id != document.warehouse_id {
            return false;
        }
        true
    }
}

pub struct DocumentService {
    store: Store,
    config: EngineConfig,
    registry: TypeRegistry,
    ledger: HistoryLedger,
    approvals: ApprovalEngine,
    authorizer: Arc<dyn Authorizer>,
    rejection: Arc<dyn RejectionPolicy>,
    sequence: Arc<dyn SequenceGenerator>,
    guard: Arc<dyn WriteGuard>,
}

impl DocumentService {
    pub fn new(
        instance: Arc<Db>,
        config: EngineConfig,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self> {
        let store = Store::new(instance)?;
        let rejection: Arc<dyn RejectionPolicy> = Arc::new(LeaveStatus);
        let guard: Arc<dyn WriteGuard> = Arc::new(AllowAll);
        Ok(Self {
            registry: TypeRegistry::new(store.clone(), config.clone()),
            ledger: HistoryLedger::new(store.clone()),
            approvals: ApprovalEngine::new(
                store.clone(),
                config.clone(),
                authorizer.clone(),
                rejection.clone(),
                guard.clone(),
            ),
            sequence: Arc::new(ScopedCounter {
                width: config.number_width,
            }),
            store,
            config,
            authorizer,
            rejection,
            guard,
        })
    }

    pub fn with_sequence(mut self, sequence: Arc<dyn SequenceGenerator>) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_rejection_policy(mut self, rejection: Arc<dyn RejectionPolicy>) -> Self {
        self.rejection = rejection;
        self.rebuild_approvals()
    }

    pub fn with_write_guard(mut self, guard: Arc<dyn WriteGuard>) -> Self {
        self.guard = guard;
        self.rebuild_approvals()
    }

    fn rebuild_approvals(mut self) -> Self {
        self.approvals = ApprovalEngine::new(
            self.store.clone(),
            self.config.clone(),
            self.authorizer.clone(),
            self.rejection.clone(),
            self.guard.clone(),
        );
        self
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn approvals(&self) -> &ApprovalEngine {
        &self.approvals
    }

    pub fn ledger(&self) -> &HistoryLedger {
        &self.ledger
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Validates and persists a new document in the type's initial status,
    /// with its number, first history entry and pending approval steps.
    pub fn create(
        &self,
        type_code: &str,
        input: NewDocument,
        actor_id: &str,
    ) -> Result<DocumentInstance> {
        let definition = self.registry.get_by_code(type_code)?;
        let doc_type = &definition.doc_type;
        if !doc_type.is_active {
            return Err(WorkflowError::rule(format!(
                "Document type '{type_code}' is inactive"
            )));
        }

        let NewDocument {
            mut data,
            mut lines,
            project_id,
            warehouse_id,
        } = input;
        // defaults fill gaps before validation, coercion runs after it
        apply_defaults(&definition.fields, &mut data, &mut lines);
        let report = validate(&definition.fields, &data, &lines);
        if !report.is_valid() {
            warn!(type_code, actor_id, "document rejected by validation");
            return Err(WorkflowError::validation(report.into_errors()));
        }
        coerce(&definition.fields, &mut data, &mut lines);

        let now = TimeStamp::now();
        let document = DocumentInstance {
            id: utils::new_uuid_to_bech32("doc_")?,
            document_type_id: doc_type.id.clone(),
            type_code: doc_type.code.clone(),
            document_number: String::new(),
            status: doc_type.status_flow.initial_status.clone(),
            data,
            lines: number_lines(lines),
            project_id,
            warehouse_id,
            created_by: actor_id.to_string(),
            updated_by: actor_id.to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let steps = doc_type
            .approval_levels()
            .map(|levels| {
                materialize(levels, &self.config.approval_tag(type_code), &document.id)
            })
            .unwrap_or_default();
        let scope = self.config.number_scope(type_code);
        let index_key = compound_key(&[
            doc_type.id.as_bytes(),
            &now.sort_key().to_be_bytes(),
            document.id.as_bytes(),
        ]);

        let created = (
            &self.store.types,
            &self.store.documents,
            &self.store.documents_by_type,
            &self.store.type_stats,
            &self.store.approval_steps,
            &self.store.history,
            &self.store.sequences,
        )
            .transaction(
                |(types, documents, by_type, stats, step_tree, history, counters)| -> TxResult<DocumentInstance> {
                    // the type may have been deleted since it was loaded
                    if types.get(document.document_type_id.as_bytes())?.is_none() {
                        return abort(WorkflowError::not_found("document type", type_code));
                    }

                    // number, document and type index
                    let mut document = document.clone();
                    document.document_number = self.sequence.generate(&scope, counters)?;
                    documents.insert(document.id.as_bytes(), tx_encode(&document)?)?;
                    by_type.insert(index_key.as_slice(), document.id.as_bytes())?;

                    // instance counter read by delete
                    let count = stats
                        .get(document.document_type_id.as_bytes())?
                        .map(|raw| read_u64(&raw))
                        .unwrap_or(0);
                    stats.insert(
                        document.document_type_id.as_bytes(),
                        (count + 1).to_be_bytes().to_vec(),
                    )?;

                    // pending approvals and the first history entry
                    stage_steps(step_tree, &steps)?;
                    HistoryEntry::new(
                        &document.id,
                        None,
                        &document.status,
                        HistoryAction::Created,
                        actor_id,
                        Some("Document created".to_string()),
                    )
                    .seal()
                    .map_err(ConflictableTransactionError::Abort)?
                    .stage(history)?;

                    Ok(document)
                },
            )?;

        info!(
            document_id = %created.id,
            number = %created.document_number,
            type_code,
            actor_id,
            approval_steps = steps.len(),
            "created document"
        );
        Ok(created)
    }

    pub fn get(&self, document_id: &str) -> Result<DocumentInstance> {
        debug!(document_id, "loading document");
        self.store
            .load_document(document_id)?
            .ok_or_else(|| WorkflowError::not_found("document", document_id))
    }

    /// Documents of one type, newest first.
    pub fn list(
        &self,
        type_code: &str,
        filter: &DocumentFilter,
        pagination: Pagination,
    ) -> Result<Page<DocumentInstance>> {
        let type_id = self
            .store
            .type_id_for_code(type_code)?
            .ok_or_else(|| WorkflowError::not_found("document type", type_code))?;

        let mut matches = Vec::new();
        for item in self
            .store
            .documents_by_type
            .scan_prefix(key_prefix(&[type_id.as_bytes()]))
            .rev()
        {
            let (_, document_id) = item?;
            let document_id = String::from_utf8_lossy(&document_id);
            if let Some(document) = self.store.load_document(&document_id)? {
                if filter.matches(&document) {
                    matches.push(document);
                }
            }
        }
        Ok(Page::slice(matches, pagination, &self.config))
    }

    /// Replaces the supplied parts of an editable document.
    pub fn update(
        &self,
        document_id: &str,
        changes: DocumentChanges,
        actor_id: &str,
    ) -> Result<UpdateOutcome> {
        let before = self.get(document_id)?;
        let definition = self.registry.get_by_id(&before.document_type_id)?;
        if !definition.doc_type.status_flow.is_editable(&before.status) {
            return Err(WorkflowError::rule(format!(
                "Document {} cannot be edited in status '{}'",
                before.document_number, before.status
            )));
        }
        self.guard.check(&before, WriteKind::Update)?;

        let after = apply_changes(&definition, &before, changes, actor_id)?;

        (&self.store.documents, &self.store.history).transaction(
            |(documents, history)| -> TxResult<()> {
                // the changes were computed against `before`; refuse if anything moved since
                let stored: DocumentInstance = match documents.get(document_id.as_bytes())? {
                    Some(raw) => tx_decode(&raw)?,
                    None => return abort(WorkflowError::not_found("document", document_id)),
                };
                if stored.status != before.status || stored.version != before.version {
                    return abort(WorkflowError::rule(format!(
                        "Document {} changed while being updated (status '{}' version {}, now '{}' version {})",
                        stored.document_number,
                        before.status,
                        before.version,
                        stored.status,
                        stored.version
                    )));
                }
                documents.insert(document_id.as_bytes(), tx_encode(&after)?)?;
                HistoryEntry::new(
                    document_id,
                    Some(before.status.as_str()),
                    &after.status,
                    HistoryAction::Updated,
                    actor_id,
                    Some("Document updated".to_string()),
                )
                .seal()
                .map_err(ConflictableTransactionError::Abort)?
                .stage(history)?;
                Ok(())
            },
        )?;

        info!(document_id, version = after.version, actor_id, "updated document");
        Ok(UpdateOutcome { before, after })
    }

    /// Moves a document along its status graph. Every approval step must be
    /// decided first, except when leaving the initial status for a status
    /// that still has outgoing transitions (the usual submit step).
    pub fn transition(
        &self,
        type_code: &str,
        document_id: &str,
        to_status: &str,
        actor_id: &str,
        comment: Option<String>,
    ) -> Result<DocumentInstance> {
        let definition = self.registry.get_by_code(type_code)?;
        let current = self.get(document_id)?;
        if current.document_type_id != definition.doc_type.id {
            return Err(WorkflowError::not_found("document", document_id));
        }

        // the edge must exist in the type's graph
        let flow = &definition.doc_type.status_flow;
        let allowed = flow.allowed(&current.status);
        if !allowed.iter().any(|s| s == to_status) {
            let allowed = match allowed.is_empty() {
                true => "none".to_string(),
                false => allowed.join(", "),
            };
            return Err(WorkflowError::rule(format!(
                "Invalid status transition: '{}' → '{to_status}'. Allowed: {allowed}",
                current.status
            )));
        }

        // pending approvals block the move unless it is a submit out of the initial status
        let submits = current.status == flow.initial_status && flow.is_editable(to_status);
        if !submits && definition.doc_type.approval_levels().is_some() {
            let pending = self
                .approvals
                .pending_levels(&self.config.approval_tag(type_code), document_id)?;
            if !pending.is_empty() {
                let levels = pending
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(WorkflowError::rule(format!(
                    "Document {} has {} pending approval(s) at level(s) {levels}",
                    current.document_number,
                    pending.len()
                )));
            }
        }
        self.guard.check(&current, WriteKind::Transition)?;

        let from_status = current.status.clone();
        let moved = (&self.store.documents, &self.store.history).transaction(
            |(documents, history)| -> TxResult<DocumentInstance> {
                let mut document: DocumentInstance = match documents.get(document_id.as_bytes())? {
                    Some(raw) => tx_decode(&raw)?,
                    None => return abort(WorkflowError::not_found("document", document_id)),
                };
                // a concurrent transition may already have moved it
                if document.status != from_status {
                    return abort(WorkflowError::rule(format!(
                        "Document {} left status '{from_status}' during the transition",
                        document.document_number
                    )));
                }
                document.status = to_status.to_string();
                document.version += 1;
                document.updated_by = actor_id.to_string();
                document.updated_at = TimeStamp::now();
                documents.insert(document_id.as_bytes(), tx_encode(&document)?)?;

                HistoryEntry::new(
                    document_id,
                    Some(from_status.as_str()),
                    to_status,
                    HistoryAction::Transitioned,
                    actor_id,
                    comment.clone(),
                )
                .seal()
                .map_err(ConflictableTransactionError::Abort)?
                .stage(history)?;
                Ok(document)
            },
        )?;

        info!(document_id, from = %from_status, to = to_status, actor_id, "transitioned document");
        Ok(moved)
    }

    pub fn approve(
        &self,
        type_code: &str,
        document_id: &str,
        actor_id: &str,
        notes: Option<String>,
    ) -> Result<ApprovalOutcome> {
        self.approvals.approve(type_code, document_id, actor_id, notes)
    }

    pub fn reject(
        &self,
        type_code: &str,
        document_id: &str,
        actor_id: &str,
        notes: Option<String>,
    ) -> Result<ApprovalOutcome> {
        self.approvals.reject(type_code, document_id, actor_id, notes)
    }

    /// Approval steps of a document, by level.
    pub fn approval_steps(&self, document_id: &str) -> Result<Vec<ApprovalStep>> {
        let document = self.get(document_id)?;
        self.approvals
            .steps(&self.config.approval_tag(&document.type_code), document_id)
    }

    /// History of a document, newest first.
    pub fn history(&self, document_id: &str) -> Result<Vec<HistoryEntry>> {
        self.ledger.list(document_id)
    }
}

/// Builds the updated document. Header data is validated when supplied and
/// lines when supplied; the version always advances.
fn apply_changes(
    definition: &TypeDefinition,
    before: &DocumentInstance,
    changes: DocumentChanges,
    actor_id: &str,
) -> Result<DocumentInstance> {
    let DocumentChanges { data, lines } = changes;
    let data_supplied = data.is_some();
    let lines_supplied = lines.is_some();

    let mut header = data.unwrap_or_else(|| before.data.clone());
    let mut records = lines.unwrap_or_else(|| before.line_records());

    let report = validate(&definition.fields, &header, &records);
    let mut errors = Vec::new();
    if data_supplied {
        errors.extend(report.header_errors);
    }
    if lines_supplied {
        errors.extend(report.line_errors);
    }
    if !errors.is_empty() {
        warn!(document_id = %before.id, "update rejected by validation");
        return Err(WorkflowError::validation(errors));
    }
    coerce(&definition.fields, &mut header, &mut records);

    let mut after = before.clone();
    after.data = header;
    if lines_supplied {
        after.lines = number_lines(records);
    }
    after.version += 1;
    after.updated_by = actor_id.to_string();
    after.updated_at = TimeStamp::now();
    Ok(after)
}
