//! Property-based tests for status flows, validation and field ordering
//!
//! Status flows and field schemas are authored at runtime, so these tests
//! generate them instead of enumerating a handful of hand-written cases.

use doc_workflow::{
    DocumentService, EngineConfig, FieldDefinition, FieldType, FieldValue, NewDocumentType,
    NewField, Record, RoleTable, Setting, StatusFlow, ValidationRules, validate,
    validation::coerce,
};
use proptest::prelude::*;
use std::sync::Arc;

// These property tests cover:
//
// 1. Chain-shaped status flows are valid and only their last status is terminal
// 2. Unknown transition targets are always reported under the source's path
// 3. Required text rejects blank input and accepts anything else
// 4. Numeric text coerces to the number it spells
// 5. Reordering by a permutation yields dense positions in permutation order
//
// Document lifecycle and approvals are exercised in scenarios.rs.

/// Strategy for 1 to 8 distinct status keys
fn status_keys_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-z]{3,8}", 1..8).prop_map(|keys| keys.into_iter().collect())
}

/// A flow walking the keys in order: k0 -> k1 -> ... -> kN
fn chain_flow(keys: &[String]) -> StatusFlow {
    let mut flow = StatusFlow::new(&keys[0]);
    for key in keys {
        flow = flow.add_status(key, key, "gray");
    }
    for pair in keys.windows(2) {
        flow = flow.allow(&pair[0], &[pair[1].as_str()]);
    }
    flow
}

fn text_field(key: &str, required: bool) -> FieldDefinition {
    FieldDefinition {
        id: format!("field_{key}"),
        document_type_id: "doctype_p".into(),
        field_key: key.into(),
        label: "Name".into(),
        field_type: FieldType::Text,
        options: Setting::Null,
        is_required: required,
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

// PROPERTY TESTS
proptest! {
    /// Property: a chain flow passes every graph check, every status but the
    /// last is editable, and the last one is terminal.
    #[test]
    fn prop_chain_flow_is_valid(keys in status_keys_strategy()) {
        let flow = chain_flow(&keys);

        prop_assert!(flow.check().is_empty());
        let (last, rest) = keys.split_last().unwrap();
        for key in rest {
            prop_assert!(flow.is_editable(key));
        }
        prop_assert!(flow.is_editable(&keys[0]));
        if keys.len() > 1 {
            prop_assert!(flow.is_terminal(last));
            prop_assert!(flow.allowed(last).is_empty());
        }
    }

    /// Property: pointing a transition at an undefined status always yields an
    /// error on `statusFlow.transitions.<source>`.
    #[test]
    fn prop_unknown_target_is_reported(keys in status_keys_strategy(), ghost in "[0-9]{4}") {
        let flow = chain_flow(&keys).allow(&keys[0], &[ghost.as_str()]);

        let errors = flow.check();
        prop_assert_eq!(errors.len(), 1);
        prop_assert_eq!(&errors[0].field, &format!("statusFlow.transitions.{}", keys[0]));
        prop_assert!(errors[0].message.contains(&ghost));
    }

    /// Property: whitespace-only text never satisfies a required field.
    #[test]
    fn prop_blank_text_fails_required(blank in "[ \t\n]{0,6}") {
        let fields = vec![text_field("name", true)];
        let header: Record = [("name".to_string(), FieldValue::text(blank))].into_iter().collect();

        let report = validate(&fields, &header, &[]);
        prop_assert_eq!(report.header_errors.len(), 1);
        prop_assert_eq!(&report.header_errors[0].message, "Name is required");
    }

    /// Property: any text with a visible character satisfies a required
    /// text field without other rules.
    #[test]
    fn prop_visible_text_passes_required(text in "[ ]{0,2}[a-zA-Z0-9]{1,12}[ ]{0,2}") {
        let fields = vec![text_field("name", true)];
        let header: Record = [("name".to_string(), FieldValue::text(text))].into_iter().collect();

        prop_assert!(validate(&fields, &header, &[]).is_valid());
    }

    /// Property: a finite number written as text validates on a number field
    /// and is stored as that number.
    #[test]
    fn prop_numeric_text_coerces(n in -1.0e9f64..1.0e9) {
        let mut field = text_field("amount", true);
        field.field_type = FieldType::Number;
        field.validation_rules = Setting::Value(ValidationRules::default());
        let fields = vec![field];

        let mut header: Record =
            [("amount".to_string(), FieldValue::text(n.to_string()))].into_iter().collect();
        prop_assert!(validate(&fields, &header, &[]).is_valid());

        coerce(&fields, &mut header, &mut []);
        prop_assert_eq!(&header["amount"], &FieldValue::Number(n));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: reordering by any permutation assigns positions 0..n in the
    /// order given.
    #[test]
    fn prop_reorder_follows_permutation(
        order in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(sled::open(dir.path().join("reorder_prop.db")).unwrap());
        let service =
            DocumentService::new(db, EngineConfig::default(), Arc::new(RoleTable::new())).unwrap();
        let registry = service.registry();

        let type_id = registry
            .create(NewDocumentType::new("PR", "Purchase Request"), "admin_1")
            .unwrap()
            .doc_type
            .id;
        let ids: Vec<String> = (0..5)
            .map(|i| {
                registry
                    .add_field(&type_id, NewField::new(&format!("f{i}"), "F", FieldType::Text))
                    .unwrap()
                    .id
            })
            .collect();

        let requested: Vec<String> = order.iter().map(|i| ids[*i].clone()).collect();
        let fields = registry.reorder_fields(&type_id, &requested).unwrap();

        let got: Vec<&str> = fields.iter().map(|f| f.id.as_str()).collect();
        let want: Vec<&str> = requested.iter().map(String::as_str).collect();
        prop_assert_eq!(got, want);
        let positions: Vec<u32> = fields.iter().map(|f| f.sort_order).collect();
        prop_assert_eq!(positions, vec![0, 1, 2, 3, 4]);

        // field edits and reorders count as type edits
        prop_assert_eq!(registry.get_by_id(&type_id).unwrap().doc_type.version, 7);
    }
}
