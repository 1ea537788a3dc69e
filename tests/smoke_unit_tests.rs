//! Smoke screen unit tests for the document workflow components
//!
//! Happy-path checks of the public value types and helpers, in isolation
//! from the lifecycle scenarios.

use chrono::{Datelike, Timelike};
use doc_workflow::{
    EngineConfig, FieldValue, HistoryAction, HistoryEntry, Json, Setting, StatusFlow, TimeStamp,
    types::FileRef, utils::new_uuid_to_bech32,
};
use serde_json::json;

// UTILS MODULE TESTS
mod utils_tests {
    use super::*;

    /// Ids are bech32 strings starting with their human-readable prefix
    #[test]
    fn generates_valid_bech32_with_hrp() {
        let encoded = new_uuid_to_bech32("doctype_").unwrap();
        assert!(encoded.starts_with("doctype_1"));
        assert!(encoded.len() > 10);
    }

    #[test]
    fn handles_empty_hrp() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    #[test]
    fn generates_unique_ids() {
        let id1 = new_uuid_to_bech32("doc_").unwrap();
        let id2 = new_uuid_to_bech32("doc_").unwrap();
        assert_ne!(id1, id2);
    }
}

// TYPES MODULE TESTS
mod types_tests {
    use super::*;

    #[test]
    fn timestamp_new_with_creates_specific_time() {
        let ts = TimeStamp::new_with(2025, 3, 14, 9, 30, 0).unwrap();
        let dt = ts.to_datetime_utc();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2025, 3, 14));
        assert_eq!((dt.hour(), dt.minute()), (9, 30));

        assert!(TimeStamp::new_with(2025, 2, 30, 0, 0, 0).is_none());
    }

    #[test]
    fn timestamp_cbor_roundtrip() {
        let ts = TimeStamp::now();
        let raw = minicbor::to_vec(ts).unwrap();
        let decoded: TimeStamp = minicbor::decode(&raw).unwrap();
        assert_eq!(ts, decoded);
    }

    #[test]
    fn field_values_from_json() {
        assert_eq!(FieldValue::from_json(&json!(null)), None);
        assert_eq!(FieldValue::from_json(&json!(4.5)), Some(FieldValue::Number(4.5)));
        assert_eq!(FieldValue::from_json(&json!(true)), Some(FieldValue::Bool(true)));
        assert_eq!(
            FieldValue::from_json(&json!({"name": "plan.pdf", "url": "s3://b/plan.pdf"})),
            Some(FieldValue::File(FileRef {
                name: "plan.pdf".into(),
                url: "s3://b/plan.pdf".into(),
            }))
        );

        let record = FieldValue::record_from_json(&json!({"title": "Pump", "notes": null}));
        assert_eq!(record.len(), 1);
        assert_eq!(record["title"], FieldValue::text("Pump"));
    }

    #[test]
    fn text_values_convert_on_demand() {
        assert_eq!(FieldValue::text(" 12 ").as_number(), Some(12.0));
        assert_eq!(FieldValue::text("NaN").as_number(), None);
        assert_eq!(FieldValue::text("false").as_bool(), Some(false));
        assert!(FieldValue::text("2025-01-31").as_date().is_some());
        assert!(FieldValue::text("31/01/2025").as_date().is_none());
        assert!(FieldValue::text("  ").is_blank());
    }

    #[test]
    fn settings_keep_three_states() {
        let stored: Setting<u8> = Setting::Value(3);
        assert_eq!(Setting::Unset.patch(stored.clone()), Setting::Value(3));
        assert_eq!(Setting::Null.patch(stored), Setting::Null);
        assert_eq!(Setting::<u8>::Unset.or_null(), Setting::Null);
        assert_eq!(Setting::from(Some(1u8)), Setting::Value(1));
        assert_eq!(Setting::<u8>::Null.patch_option(Some(2)), None);
    }

    #[test]
    fn json_survives_cbor() {
        let settings = Json(json!({"print": {"copies": 2}}));
        let raw = minicbor::to_vec(&settings).unwrap();
        let decoded: Json = minicbor::decode(&raw).unwrap();
        assert_eq!(decoded, settings);
    }
}

// REGISTRY AND HISTORY TESTS
mod workflow_tests {
    use super::*;

    #[test]
    fn status_flow_builder_links_statuses() {
        let flow = StatusFlow::new("open")
            .add_status("open", "Open", "gray")
            .add_status("done", "Done", "green")
            .allow("open", &["done"]);

        assert!(flow.check().is_empty());
        assert_eq!(flow.allowed("open"), &["done".to_string()]);
        assert!(flow.is_terminal("done"));
    }

    #[test]
    fn history_entry_starts_unsealed() {
        let entry = HistoryEntry::new("doc_1", None, "draft", HistoryAction::Created, "u", None);
        assert!(entry.id.is_empty());
        assert_eq!(entry.from_status, None);
        assert!(entry.to_string().contains("(new) -> draft by u"));
    }

    #[test]
    fn default_config_matches_scopes() {
        let config = EngineConfig::default();
        assert_eq!(config.number_scope("PO"), "dynamic:PO");
        assert_eq!(config.approval_tag("PO"), "dynamic_PO");
    }
}
