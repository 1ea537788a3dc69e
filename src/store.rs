//! sled-backed persistence shared by every component.
//!
//! Records are CBOR encoded with minicbor. Multi-record writes go through
//! `sled::Transactional` over tuples of the trees below so that each
//! lifecycle call commits as one unit.
use crate::error::{Result, WorkflowError};
use crate::registry::DocumentType;
use crate::schema::FieldDefinition;
use crate::service::DocumentInstance;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct Store {
    instance: Arc<Db>,
    pub(crate) types: Tree,
    pub(crate) type_codes: Tree,
    pub(crate) fields: Tree,
    pub(crate) field_owners: Tree,
    pub(crate) type_stats: Tree,
    pub(crate) documents: Tree,
    pub(crate) documents_by_type: Tree,
    pub(crate) approval_steps: Tree,
    pub(crate) history: Tree,
    pub(crate) sequences: Tree,
}

impl Store {
    pub fn new(instance: Arc<Db>) -> Result<Self> {
        Ok(Self {
            types: instance.open_tree("doc_types")?,
            type_codes: instance.open_tree("doc_type_codes")?,
            fields: instance.open_tree("doc_type_fields")?,
            field_owners: instance.open_tree("field_owners")?,
            type_stats: instance.open_tree("doc_type_stats")?,
            documents: instance.open_tree("documents")?,
            documents_by_type: instance.open_tree("documents_by_type")?,
            approval_steps: instance.open_tree("approval_steps")?,
            history: instance.open_tree("document_history")?,
            sequences: instance.open_tree("sequences")?,
            instance,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Arc::new(sled::open(path)?))
    }

    pub fn db(&self) -> &Db {
        &self.instance
    }

    pub fn flush(&self) -> Result<()> {
        self.instance.flush()?;
        Ok(())
    }

    pub(crate) fn load_type(&self, type_id: &str) -> Result<Option<DocumentType>> {
        self.types.get(type_id)?.map(|raw| decode(&raw)).transpose()
    }

    pub(crate) fn type_id_for_code(&self, code: &str) -> Result<Option<String>> {
        Ok(self
            .type_codes
            .get(code)?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    pub(crate) fn load_fields(&self, type_id: &str) -> Result<Vec<FieldDefinition>> {
        match self.fields.get(type_id)? {
            Some(raw) => decode(&raw),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn load_document(&self, document_id: &str) -> Result<Option<DocumentInstance>> {
        self.documents
            .get(document_id)?
            .map(|raw| decode(&raw))
            .transpose()
    }

    pub(crate) fn instance_count(&self, type_id: &str) -> Result<u64> {
        Ok(self.type_stats.get(type_id)?.map(|raw| read_u64(&raw)).unwrap_or(0))
    }
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    minicbor::to_vec(value).map_err(|e| WorkflowError::Encode(e.to_string()))
}

pub(crate) fn decode<'b, T: minicbor::Decode<'b, ()>>(raw: &'b [u8]) -> Result<T> {
    Ok(minicbor::decode(raw)?)
}

pub type TxResult<T> = ConflictableTransactionResult<T, WorkflowError>;

pub(crate) fn tx_encode<T: minicbor::Encode<()>>(value: &T) -> TxResult<Vec<u8>> {
    encode(value).map_err(ConflictableTransactionError::Abort)
}

pub(crate) fn tx_decode<'b, T: minicbor::Decode<'b, ()>>(raw: &'b [u8]) -> TxResult<T> {
    decode(raw).map_err(ConflictableTransactionError::Abort)
}

pub(crate) fn read_u64(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    if raw.len() == 8 {
        buf.copy_from_slice(raw);
    }
    u64::from_be_bytes(buf)
}
