use super::*;
use serde_json::json;

fn bindings(names: &[&str]) -> Vec<ColumnBinding> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| ColumnBinding {
            source_ordinal: i,
            target_column: name.to_string(),
        })
        .collect()
}

#[test]
fn server_address_with_port_splits() {
    assert_eq!(
        parse_server_address("db.internal,14330"),
        ("db.internal".to_string(), 14330)
    );
}

#[test]
fn bare_server_address_gets_default_port() {
    assert_eq!(
        parse_server_address(" db.internal "),
        ("db.internal".to_string(), 1433)
    );
}

#[test]
fn unparsable_port_falls_back_to_default() {
    assert_eq!(
        parse_server_address("db.internal,stable"),
        ("db.internal,stable".to_string(), 1433)
    );
}

#[test]
fn literals_cover_the_json_value_range() {
    assert_eq!(sql_literal(&Value::Null), "NULL");
    assert_eq!(sql_literal(&json!(true)), "1");
    assert_eq!(sql_literal(&json!(false)), "0");
    assert_eq!(sql_literal(&json!(42)), "42");
    assert_eq!(sql_literal(&json!(-1.5)), "-1.5");
    assert_eq!(sql_literal(&json!("plain")), "N'plain'");
    assert_eq!(sql_literal(&json!("O'Brien")), "N'O''Brien'");
}

#[test]
fn insert_statement_orders_columns_by_binding() {
    let rows = vec![
        vec![json!(1), json!("first")],
        vec![json!(2), json!("second")],
    ];

    let statement =
        build_insert_statement("[OrdersArchive]", &bindings(&["Id", "Label"]), &rows).unwrap();
    assert_eq!(
        statement,
        "INSERT INTO [OrdersArchive] ([Id], [Label]) VALUES (1, N'first'), (2, N'second')"
    );
}

#[test]
fn insert_statement_uses_source_ordinals() {
    // Bindings address the projection positionally, not by name order.
    let bindings = vec![
        ColumnBinding {
            source_ordinal: 1,
            target_column: "Label".to_string(),
        },
        ColumnBinding {
            source_ordinal: 0,
            target_column: "Id".to_string(),
        },
    ];
    let rows = vec![vec![json!(9), json!("only")]];

    let statement = build_insert_statement("[T]", &bindings, &rows).unwrap();
    assert_eq!(
        statement,
        "INSERT INTO [T] ([Label], [Id]) VALUES (N'only', 9)"
    );
}

#[test]
fn short_row_is_an_internal_error() {
    let rows = vec![vec![json!(1)]];
    let err = build_insert_statement("[T]", &bindings(&["A", "B"]), &rows).unwrap_err();
    assert!(matches!(err, TransferError::Internal(_)));
}

#[test]
fn windows_auth_endpoint_is_rejected() {
    let endpoint = ResolvedEndpoint {
        host: "db.internal".to_string(),
        port: 1433,
        database: "Imports".to_string(),
        auth_mode: AuthMode::Windows,
        username: String::new(),
        password: String::new(),
    };

    match create_pool(&endpoint, 1) {
        Err(TransferError::Connection(message)) => {
            assert!(message.contains("Windows authentication"));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("expected the pool build to be rejected"),
    }
}
