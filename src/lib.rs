pub mod approval;
pub mod config;
pub mod error;
pub mod history;
pub mod registry;
pub mod schema;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;
pub mod validation;

pub use approval::{
    ApprovalEngine, ApprovalOutcome, ApprovalStatus, ApprovalStep, Authorizer, LeaveStatus,
    MoveToStatus, RejectionPolicy, RoleTable,
};
pub use config::{EngineConfig, Page, Pagination};
pub use error::{Result, WorkflowError};
pub use history::{HistoryAction, HistoryEntry, HistoryLedger};
pub use registry::{
    ApprovalLevel, DocumentType, DocumentTypePatch, NewDocumentType, StatusFlow, TypeDefinition,
    TypeFilter, TypeRegistry,
};
pub use schema::{FieldDefinition, FieldPatch, FieldSchemaStore, FieldType, NewField, ValidationRules};
pub use service::{
    AllowAll, DocumentChanges, DocumentFilter, DocumentInstance, DocumentService, NewDocument,
    ScopedCounter, SequenceGenerator, UpdateOutcome, WriteGuard, WriteKind,
};
pub use store::Store;
pub use types::{FieldValue, Json, Record, Setting, TimeStamp};
pub use validation::{FieldError, ValidationReport, validate};
