//! Approval Workflow Engine.
//!
//! Steps are materialised, all pending, when a document is created and are
//! decided one at a time in level order. The current step is always the
//! lowest-level pending one.
use crate::config::EngineConfig;
use crate::error::{Result, WorkflowError};
use crate::history::{HistoryAction, HistoryEntry};
use crate::registry::{ApprovalLevel, DocumentType};
use crate::service::{DocumentInstance, WriteGuard, WriteKind};
use crate::store::{Store, TxResult, decode, tx_decode, tx_encode};
use crate::types::TimeStamp;
use crate::utils::{compound_key, key_prefix};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionalTree, abort};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ApprovalStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ApprovalStep {
    #[n(0)]
    pub document_type_tag: String, // "<prefix><typeCode>"
    #[n(1)]
    pub document_id: String,
    #[n(2)]
    pub level: u32,
    #[n(3)]
    pub approver_role: String,
    #[n(4)]
    pub status: ApprovalStatus,
    #[n(5)]
    pub approver_id: Option<String>,
    #[n(6)]
    pub notes: Option<String>,
    #[n(7)]
    pub decided_at: Option<TimeStamp>,
}

impl ApprovalStep {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    fn key(&self) -> Vec<u8> {
        step_key(&self.document_type_tag, &self.document_id, self.level)
    }
}

/// Result of an approval decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    pub decision: ApprovalStatus,
    pub level: u32,
    pub approver_role: String,
    /// No step is left pending after an approval.
    pub all_approved: bool,
    pub remaining_levels: usize,
    /// Every step of the document after the decision, by level.
    pub steps: Vec<ApprovalStep>,
    /// The document after the decision; its status only changes when a
    /// [`RejectionPolicy`] asks for it.
    pub document: DocumentInstance,
}

/// Decides whether an actor may act for an approver role.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, actor_id: &str, role: &str) -> anyhow::Result<bool>;
}

/// Actor → roles lookup table.
#[derive(Debug, Clone, Default)]
pub struct RoleTable {
    roles: HashMap<String, HashSet<String>>,
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn grant(mut self, actor_id: &str, role: &str) -> Self {
        self.roles
            .entry(actor_id.to_string())
            .or_default()
            .insert(role.to_string());
        self
    }
}

impl Authorizer for RoleTable {
    fn is_authorized(&self, actor_id: &str, role: &str) -> anyhow::Result<bool> {
        Ok(self
            .roles
            .get(actor_id)
            .is_some_and(|roles| roles.contains(role)))
    }
}

/// Chooses what a rejected step does to the owning document's status.
pub trait RejectionPolicy: Send + Sync {
    /// `Some(status)` moves the document to `status`; `None` leaves it alone.
    fn status_after_rejection(
        &self,
        document: &DocumentInstance,
        step: &ApprovalStep,
    ) -> Option<String>;
}

/// Leaves the document status unchanged; callers act on the returned steps.
///
/// Later levels stay pending and can still be decided, but once a level is
/// rejected no outcome reports `all_approved`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaveStatus;

impl RejectionPolicy for LeaveStatus {
    fn status_after_rejection(&self, _: &DocumentInstance, _: &ApprovalStep) -> Option<String> {
        None
    }
}

/// Moves a document to a fixed status on any rejection.
#[derive(Debug, Clone)]
pub struct MoveToStatus(pub String);

impl RejectionPolicy for MoveToStatus {
    fn status_after_rejection(&self, _: &DocumentInstance, _: &ApprovalStep) -> Option<String> {
        Some(self.0.clone())
    }
}

pub(crate) fn step_key(tag: &str, document_id: &str, level: u32) -> Vec<u8> {
    compound_key(&[tag.as_bytes(), document_id.as_bytes(), &level.to_be_bytes()])
}

/// One pending step per configured level.
pub fn materialize(levels: &[ApprovalLevel], tag: &str, document_id: &str) -> Vec<ApprovalStep> {
    levels
        .iter()
        .map(|level| ApprovalStep {
            document_type_tag: tag.to_string(),
            document_id: document_id.to_string(),
            level: level.level,
            approver_role: level.role.clone(),
            status: ApprovalStatus::Pending,
            approver_id: None,
            notes: None,
            decided_at: None,
        })
        .collect()
}

/// Writes freshly materialised steps inside the creation transaction.
pub(crate) fn stage_steps(tree: &TransactionalTree, steps: &[ApprovalStep]) -> TxResult<()> {
    for step in steps {
        tree.insert(step.key(), tx_encode(step)?)?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct ApprovalEngine {
    store: Store,
    config: EngineConfig,
    authorizer: Arc<dyn Authorizer>,
    rejection: Arc<dyn RejectionPolicy>,
    guard: Arc<dyn WriteGuard>,
}

impl ApprovalEngine {
    pub fn new(
        store: Store,
        config: EngineConfig,
        authorizer: Arc<dyn Authorizer>,
        rejection: Arc<dyn RejectionPolicy>,
        guard: Arc<dyn WriteGuard>,
    ) -> Self {
        Self {
            store,
            config,
            authorizer,
            rejection,
            guard,
        }
    }

    /// Steps of one document ordered by level.
    pub fn steps(&self, tag: &str, document_id: &str) -> Result<Vec<ApprovalStep>> {
        self.store
            .approval_steps
            .scan_prefix(key_prefix(&[tag.as_bytes(), document_id.as_bytes()]))
            .map(|item| -> Result<ApprovalStep> {
                let (_, raw) = item?;
                decode(&raw)
            })
            .collect()
    }

    /// Levels still pending, ascending.
    pub fn pending_levels(&self, tag: &str, document_id: &str) -> Result<Vec<u32>> {
        let mut levels: Vec<u32> = self
            .steps(tag, document_id)?
            .into_iter()
            .filter(ApprovalStep::is_pending)
            .map(|s| s.level)
            .collect();
        levels.sort_unstable();
        Ok(levels)
    }

    pub fn approve(
        &self,
        type_code: &str,
        document_id: &str,
        actor_id: &str,
        notes: Option<String>,
    ) -> Result<ApprovalOutcome> {
        self.decide(type_code, document_id, actor_id, notes, ApprovalStatus::Approved)
    }

    pub fn reject(
        &self,
        type_code: &str,
        document_id: &str,
        actor_id: &str,
        notes: Option<String>,
    ) -> Result<ApprovalOutcome> {
        self.decide(type_code, document_id, actor_id, notes, ApprovalStatus::Rejected)
    }

    fn decide(
        &self,
        type_code: &str,
        document_id: &str,
        actor_id: &str,
        notes: Option<String>,
        decision: ApprovalStatus,
    ) -> Result<ApprovalOutcome> {
        let (doc_type, document) = self.load(type_code, document_id)?;
        if doc_type.approval_levels().is_none() {
            return Err(WorkflowError::rule(format!(
                "Document type '{type_code}' does not have an approval workflow configured"
            )));
        }

        // steps are decided strictly in level order
        let tag = self.config.approval_tag(type_code);
        let steps = self.steps(&tag, document_id)?;
        let Some(current) = steps.iter().find(|s| s.is_pending()).cloned() else {
            return Err(WorkflowError::rule(format!(
                "No pending approval steps for document {}",
                document.document_number
            )));
        };

        if !self.authorizer.is_authorized(actor_id, &current.approver_role)? {
            warn!(document_id, actor_id, level = current.level, "approval refused");
            return Err(WorkflowError::rule(format!(
                "User '{actor_id}' is not authorized to approve level {} (requires role '{}')",
                current.level, current.approver_role
            )));
        }

        // the rejection policy is resolved and checked before any write
        let target_status = match decision {
            ApprovalStatus::Rejected => self.rejection_target(&doc_type, &document, &current)?,
            _ => None,
        };

        let (decided_steps, document) = (
            &self.store.approval_steps,
            &self.store.history,
            &self.store.documents,
        )
            .transaction(
                |(step_tree, history, documents)| -> TxResult<(Vec<ApprovalStep>, DocumentInstance)> {
                    // someone else may have decided this level meanwhile
                    let mut decided = read_step(step_tree, &current)?;
                    if !decided.is_pending() {
                        return abort(WorkflowError::rule(format!(
                            "Approval level {} has already been {}",
                            decided.level, decided.status
                        )));
                    }
                    decided.status = decision;
                    decided.approver_id = Some(actor_id.to_string());
                    decided.notes = notes.clone();
                    decided.decided_at = Some(TimeStamp::now());
                    step_tree.insert(decided.key(), tx_encode(&decided)?)?;

                    let mut fresh = Vec::with_capacity(steps.len());
                    for step in &steps {
                        match step.level == decided.level {
                            true => fresh.push(decided.clone()),
                            false => fresh.push(read_step(step_tree, step)?),
                        }
                    }
                    let complete = chain_approved(&fresh);

                    let mut doc: DocumentInstance = match documents.get(document_id.as_bytes())? {
                        Some(raw) => tx_decode(&raw)?,
                        None => return abort(WorkflowError::not_found("document", document_id)),
                    };
                    // only a policy-driven rejection touches the document
                    let from_status = doc.status.clone();
                    if let Some(target) = &target_status {
                        doc.status = target.clone();
                        doc.version += 1;
                        doc.updated_by = actor_id.to_string();
                        doc.updated_at = TimeStamp::now();
                        documents.insert(document_id.as_bytes(), tx_encode(&doc)?)?;
                    }

                    let (action, comment) = decision_comment(decision, &decided, complete);
                    let entry = HistoryEntry::new(
                        document_id,
                        Some(from_status.as_str()),
                        &doc.status,
                        action,
                        actor_id,
                        Some(comment),
                    )
                    .seal()
                    .map_err(ConflictableTransactionError::Abort)?;
                    entry.stage(history)?;

                    Ok((fresh, doc))
                },
            )?;

        let remaining_levels = decided_steps.iter().filter(|s| s.is_pending()).count();
        info!(
            document_id,
            level = current.level,
            %decision,
            remaining_levels,
            "recorded approval decision"
        );

        Ok(ApprovalOutcome {
            decision,
            level: current.level,
            approver_role: current.approver_role,
            all_approved: decision == ApprovalStatus::Approved && chain_approved(&decided_steps),
            remaining_levels,
            steps: decided_steps,
            document,
        })
    }

    fn load(&self, type_code: &str, document_id: &str) -> Result<(DocumentType, DocumentInstance)> {
        let document = self
            .store
            .load_document(document_id)?
            .ok_or_else(|| WorkflowError::not_found("document", document_id))?;
        let doc_type = self
            .store
            .type_id_for_code(type_code)?
            .map(|id| self.store.load_type(&id))
            .transpose()?
            .flatten()
            .ok_or_else(|| WorkflowError::not_found("document type", type_code))?;
        if document.document_type_id != doc_type.id {
            return Err(WorkflowError::not_found("document", document_id));
        }
        Ok((doc_type, document))
    }

    fn rejection_target(
        &self,
        doc_type: &DocumentType,
        document: &DocumentInstance,
        step: &ApprovalStep,
    ) -> Result<Option<String>> {
        let Some(target) = self.rejection.status_after_rejection(document, step) else {
            return Ok(None);
        };
        if !doc_type.status_flow.contains(&target) {
            return Err(WorkflowError::rule(format!(
                "Rejection policy chose status '{target}', which is not defined for document type '{}'",
                doc_type.code
            )));
        }
        self.guard.check(document, WriteKind::Rejection)?;
        Ok(Some(target))
    }
}

fn read_step(tree: &TransactionalTree, step: &ApprovalStep) -> TxResult<ApprovalStep> {
    match tree.get(step.key())? {
        Some(raw) => tx_decode(&raw),
        None => abort(WorkflowError::not_found(
            "approval step",
            format!("{}/{}/{}", step.document_type_tag, step.document_id, step.level),
        )),
    }
}

/// True when every step carries an approval. A chain with a rejected level
/// is never complete, even after its remaining levels are approved.
fn chain_approved(steps: &[ApprovalStep]) -> bool {
    steps.iter().all(|s| s.status == ApprovalStatus::Approved)
}

fn decision_comment(
    decision: ApprovalStatus,
    step: &ApprovalStep,
    complete: bool,
) -> (HistoryAction, String) {
    match decision {
        ApprovalStatus::Rejected => (
            HistoryAction::Rejected,
            format!("Approval level {} rejected by {}", step.level, step.approver_role),
        ),
        _ if complete => (
            HistoryAction::Approved,
            format!("All approval levels completed (level {} approved)", step.level),
        ),
        _ => (
            HistoryAction::Approved,
            format!("Approval level {} approved by {}", step.level, step.approver_role),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_creates_one_pending_step_per_level() {
        let levels = vec![
            ApprovalLevel::new("warehouse_manager", 1),
            ApprovalLevel::new("project_manager", 2),
        ];
        let steps = materialize(&levels, "dynamic_WO", "doc_1");

        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(ApprovalStep::is_pending));
        assert_eq!(steps[1].approver_role, "project_manager");
        assert_eq!(steps[1].level, 2);
    }

    #[test]
    fn step_keys_sort_by_level() {
        let low = step_key("dynamic_WO", "doc_1", 2);
        let high = step_key("dynamic_WO", "doc_1", 10);
        assert!(low < high);
    }

    #[test]
    fn comments_name_level_and_role() {
        let step = &materialize(&[ApprovalLevel::new("qa", 3)], "t", "d")[0];

        let (_, partial) = decision_comment(ApprovalStatus::Approved, step, false);
        assert_eq!(partial, "Approval level 3 approved by qa");

        let (_, last) = decision_comment(ApprovalStatus::Approved, step, true);
        assert_eq!(last, "All approval levels completed (level 3 approved)");

        let (action, rejected) = decision_comment(ApprovalStatus::Rejected, step, true);
        assert_eq!(action, HistoryAction::Rejected);
        assert_eq!(rejected, "Approval level 3 rejected by qa");
    }

    #[test]
    fn a_rejected_level_keeps_the_chain_incomplete() {
        let mut steps = materialize(
            &[ApprovalLevel::new("qa", 1), ApprovalLevel::new("finance", 2)],
            "t",
            "d",
        );
        assert!(!chain_approved(&steps));

        steps[0].status = ApprovalStatus::Rejected;
        steps[1].status = ApprovalStatus::Approved;
        assert!(!chain_approved(&steps));

        steps[0].status = ApprovalStatus::Approved;
        assert!(chain_approved(&steps));
    }

    #[test]
    fn role_table_checks_membership() {
        let table = RoleTable::new().grant("user_a", "qa");
        assert!(table.is_authorized("user_a", "qa").unwrap());
        assert!(!table.is_authorized("user_a", "finance").unwrap());
        assert!(!table.is_authorized("user_b", "qa").unwrap());
    }
}
