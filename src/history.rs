//! History Ledger: the append-only record of every state change and approval
//! decision on a document instance.
//!
//! Each entry is content addressed (sha256 of its CBOR encoding) and keyed by
//! `document_id / performed_at / id`, so a reverse prefix scan yields the
//! newest entries first.
use crate::error::{Result, WorkflowError};
use crate::store::{Store, TxResult, decode, encode};
use crate::types::TimeStamp;
use crate::utils::{compound_key, key_prefix};
use crate::validation::FieldError;
use sled::transaction::TransactionalTree;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum HistoryAction {
    #[n(0)]
    Created,
    #[n(1)]
    Updated,
    #[n(2)]
    Transitioned,
    #[n(3)]
    Approved,
    #[n(4)]
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct HistoryEntry {
    #[n(0)]
    pub id: String, // sha256 of the entry encoded with an empty id
    #[n(1)]
    pub document_id: String,
    #[n(2)]
    pub from_status: Option<String>,
    #[n(3)]
    pub to_status: String,
    #[n(4)]
    pub action: HistoryAction,
    #[n(5)]
    pub performed_by_id: String,
    #[n(6)]
    pub comment: Option<String>,
    #[n(7)]
    pub performed_at: TimeStamp,
}

impl HistoryEntry {
    pub fn new(
        document_id: &str,
        from_status: Option<&str>,
        to_status: &str,
        action: HistoryAction,
        performed_by_id: &str,
        comment: Option<String>,
    ) -> Self {
        Self {
            id: String::new(),
            document_id: document_id.to_string(),
            from_status: from_status.map(str::to_string),
            to_status: to_status.to_string(),
            action,
            performed_by_id: performed_by_id.to_string(),
            comment,
            performed_at: TimeStamp::now(),
        }
    }

    fn check(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.document_id.is_empty() {
            errors.push(FieldError::new("documentId", "Document id is required"));
        }
        if self.to_status.is_empty() {
            errors.push(FieldError::new("toStatus", "Target status is required"));
        }
        match errors.is_empty() {
            true => Ok(()),
            false => Err(WorkflowError::validation(errors)),
        }
    }

    /// Assigns the content hash and returns the storage key and encoding.
    pub(crate) fn seal(mut self) -> Result<SealedEntry> {
        self.check()?;
        self.id.clear();
        self.id = sha256::digest(encode(&self)?.as_slice());

        let key = compound_key(&[
            self.document_id.as_bytes(),
            &self.performed_at.sort_key().to_be_bytes(),
            self.id.as_bytes(),
        ]);
        let raw = encode(&self)?;
        Ok(SealedEntry {
            key,
            raw,
            entry: self,
        })
    }
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} by {}",
            self.performed_at.to_datetime_utc().to_rfc3339(),
            self.from_status.as_deref().unwrap_or("(new)"),
            self.to_status,
            self.performed_by_id
        )?;
        if let Some(comment) = &self.comment {
            write!(f, ": {comment}")?;
        }
        Ok(())
    }
}

pub(crate) struct SealedEntry {
    key: Vec<u8>,
    raw: Vec<u8>,
    pub(crate) entry: HistoryEntry,
}

impl SealedEntry {
    /// Writes the entry as part of an enclosing transaction.
    pub(crate) fn stage(&self, history: &TransactionalTree) -> TxResult<()> {
        history.insert(self.key.as_slice(), self.raw.as_slice())?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct HistoryLedger {
    store: Store,
}

impl HistoryLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn append(&self, entry: HistoryEntry) -> Result<HistoryEntry> {
        let sealed = entry.seal()?;
        self.store
            .history
            .insert(sealed.key.as_slice(), sealed.raw.as_slice())?;
        debug!(document_id = %sealed.entry.document_id, id = %sealed.entry.id, "appended history entry");
        Ok(sealed.entry)
    }

    /// Entries of one document, newest first.
    pub fn list(&self, document_id: &str) -> Result<Vec<HistoryEntry>> {
        self.store
            .history
            .scan_prefix(key_prefix(&[document_id.as_bytes()]))
            .rev()
            .map(|item| -> Result<HistoryEntry> {
                let (_, raw) = item?;
                decode(&raw)
            })
            .collect()
    }
}
