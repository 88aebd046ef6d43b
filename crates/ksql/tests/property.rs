use ksql::columns::parse_schema_keys;
use ksql::{Columns, KsqlError, Params, Row, build_statement};
use proptest::prelude::*;
use serde_json::Value;

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z ']{0,8}".prop_map(Value::from),
    ]
}

fn arb_row(max_len: usize) -> impl Strategy<Value = Row> {
    prop::collection::vec(arb_value(), 0..max_len)
}

fn arb_ident() -> impl Strategy<Value = String> {
    "[A-Z][A-Z0-9_]{0,7}"
}

proptest! {
    #[test]
    fn validate_accepts_exactly_the_declared_count(count in 0usize..8, row in arb_row(10)) {
        let cols = Columns::new(count, Vec::new());
        match cols.validate(&row) {
            Ok(()) => prop_assert_eq!(row.len(), count),
            Err(KsqlError::ColumnCountMismatch { expected, got }) => {
                prop_assert_ne!(row.len(), count);
                prop_assert_eq!(expected, count);
                prop_assert_eq!(got, row.len());
            }
            Err(other) => prop_assert!(false, "unexpected error {:?}", other),
        }
    }

    #[test]
    fn unknown_count_accepts_every_row(row in arb_row(20)) {
        prop_assert!(Columns::unknown().validate(&row).is_ok());
    }

    #[test]
    fn names_always_match_count(count in 0usize..6, names in prop::collection::vec(arb_ident(), 0..6)) {
        let cols = Columns::new(count, names.clone());
        let reported = cols.names();
        prop_assert_eq!(reported.len(), count);
        if names.len() == count {
            prop_assert_eq!(reported, names);
        } else {
            prop_assert!(reported.iter().all(String::is_empty));
        }
    }

    #[test]
    fn schema_names_are_recovered(names in prop::collection::vec(arb_ident(), 0..6)) {
        let schema = names
            .iter()
            .map(|n| format!("`{}` STRING", n))
            .collect::<Vec<_>>()
            .join(", ");
        prop_assert_eq!(parse_schema_keys(&schema), names);
    }

    #[test]
    fn string_parameters_stay_one_literal(text in "[a-z' ]{0,12}") {
        let sql = build_statement("SELECT * FROM T WHERE A = $1;", &Params::new().push(text.as_str())).unwrap();
        let literal = sql
            .trim_start_matches("SELECT * FROM T WHERE A = ")
            .trim_end_matches(';');
        prop_assert!(literal.starts_with('\'') && literal.ends_with('\''));
        let inner = &literal[1..literal.len() - 1];
        prop_assert_eq!(inner.replace("''", "'"), text);
    }
}
