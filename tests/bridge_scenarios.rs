use serde_json::{json, Value as JsonValue};
use sqlite_bridge::error::Result;
use sqlite_bridge::{BridgeConfig, Command, Dispatcher, MethodCall, Response, Value};
use tempfile::{tempdir, NamedTempFile};

// Helper function to create a dispatcher with one open in-memory database
fn create_test_db() -> Result<(Dispatcher, i64)> {
    let dispatcher = Dispatcher::new(BridgeConfig::default());
    let opened = dispatcher.handle(&MethodCall::new("openDatabase", json!({ "path": ":memory:" })))?;
    let id = match opened {
        Response::Opened { id, .. } => id,
        other => panic!("unexpected open response {other:?}"),
    };
    initialize_schema(&dispatcher, id)?;
    Ok((dispatcher, id))
}

// Initialize the database schema
fn initialize_schema(dispatcher: &Dispatcher, id: i64) -> Result<()> {
    dispatcher.run(
        id,
        &Command::execute(
            r#"
            CREATE TABLE users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT UNIQUE,
                avatar BLOB
            )
            "#,
        ),
    )?;
    Ok(())
}

fn call(dispatcher: &Dispatcher, method: &str, arguments: JsonValue) -> JsonValue {
    dispatcher
        .dispatch(&MethodCall::new(method, arguments))
        .to_json()
}

fn error_code(envelope: &JsonValue) -> &str {
    envelope["error"]["code"].as_str().unwrap_or_default()
}

fn names(dispatcher: &Dispatcher, id: i64) -> JsonValue {
    call(
        dispatcher,
        "query",
        json!({ "id": id, "sql": "SELECT name FROM users ORDER BY id" }),
    )["result"]["rows"]
        .clone()
}

fn seed_users(dispatcher: &Dispatcher, id: i64, count: usize) {
    for n in 1..=count {
        let inserted = call(
            dispatcher,
            "insert",
            json!({ "id": id, "sql": "INSERT INTO users (name) VALUES (?)", "arguments": [format!("user{n}")] }),
        );
        assert_eq!(inserted, json!({ "result": n }));
    }
}

#[tokio::test]
async fn test_paged_query() {
    test_paged_query_impl().unwrap();
}

fn test_paged_query_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;
    seed_users(&dispatcher, id, 5);

    let first = call(
        &dispatcher,
        "query",
        json!({ "id": id, "sql": "SELECT * FROM users", "cursorPageSize": 2 }),
    );
    let mut pages = vec![first["result"].clone()];
    while let Some(cursor) = pages.last().and_then(|p| p["cursorId"].as_i64()) {
        let next = call(
            &dispatcher,
            "queryCursorNext",
            json!({ "id": id, "cursorId": cursor }),
        );
        pages.push(next["result"].clone());
    }

    let sizes: Vec<usize> = pages
        .iter()
        .map(|p| p["rows"].as_array().map(Vec::len).unwrap_or(0))
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert!(pages[0].get("cursorId").is_some());
    assert!(pages[1].get("cursorId").is_some());
    assert!(pages[2].get("cursorId").is_none());
    assert_eq!(pages[0]["columns"], json!(["id", "name", "email", "avatar"]));

    let names: Vec<JsonValue> = pages
        .iter()
        .flat_map(|p| p["rows"].as_array().cloned().unwrap_or_default())
        .map(|row| row[1].clone())
        .collect();
    assert_eq!(names, vec![json!("user1"), json!("user2"), json!("user3"), json!("user4"), json!("user5")]);

    let cursor = pages[0]["cursorId"].as_i64().unwrap();
    let exhausted = call(
        &dispatcher,
        "queryCursorNext",
        json!({ "id": id, "cursorId": cursor }),
    );
    assert_eq!(error_code(&exhausted), "InvalidCursor");
    Ok(())
}

#[tokio::test]
async fn test_cursor_cancel() {
    test_cursor_cancel_impl().unwrap();
}

fn test_cursor_cancel_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;
    seed_users(&dispatcher, id, 3);

    let first = call(
        &dispatcher,
        "query",
        json!({ "id": id, "sql": "SELECT id FROM users", "cursorPageSize": 1 }),
    );
    let cursor = first["result"]["cursorId"].as_i64().unwrap();
    let cancelled = call(
        &dispatcher,
        "queryCursorNext",
        json!({ "id": id, "cursorId": cursor, "cancel": true }),
    );
    assert_eq!(cancelled, json!({ "result": null }));

    let after = call(
        &dispatcher,
        "queryCursorNext",
        json!({ "id": id, "cursorId": cursor }),
    );
    assert_eq!(error_code(&after), "InvalidCursor");
    Ok(())
}

#[tokio::test]
async fn test_row_failure_surfaces_on_a_later_page() {
    test_row_failure_surfaces_on_a_later_page_impl().unwrap();
}

fn test_row_failure_surfaces_on_a_later_page_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;
    let sql = "WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c WHERE n < 5) \
               SELECT CASE WHEN n = 5 THEN abs(n - 5 - 9223372036854775807 - 1) ELSE n END AS v FROM c";

    let first = call(
        &dispatcher,
        "query",
        json!({ "id": id, "sql": sql, "cursorPageSize": 2 }),
    );
    assert_eq!(first["result"]["rows"], json!([[1], [2]]));
    let cursor = first["result"]["cursorId"].as_i64().unwrap();

    let second = call(
        &dispatcher,
        "queryCursorNext",
        json!({ "id": id, "cursorId": cursor }),
    );
    assert_eq!(second["result"]["rows"], json!([[3], [4]]));

    let failed = call(
        &dispatcher,
        "queryCursorNext",
        json!({ "id": id, "cursorId": cursor }),
    );
    assert_eq!(error_code(&failed), "SQLITE_ERROR");
    assert_eq!(failed["error"]["message"], json!("integer overflow"));

    let released = call(
        &dispatcher,
        "queryCursorNext",
        json!({ "id": id, "cursorId": cursor }),
    );
    assert_eq!(error_code(&released), "InvalidCursor");
    Ok(())
}

#[tokio::test]
async fn test_batch_continue_on_error() {
    test_batch_continue_on_error_impl().unwrap();
}

fn test_batch_continue_on_error_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;
    let response = call(
        &dispatcher,
        "batch",
        json!({
            "id": id,
            "continueOnError": true,
            "operations": [
                { "method": "insert", "sql": "INSERT INTO users (name) VALUES (?)", "arguments": ["A"] },
                { "method": "insert", "sql": "INSERT INTO users (nme) VALUS (?)", "arguments": ["B"] },
                { "method": "insert", "sql": "INSERT INTO users (name) VALUES (?)", "arguments": ["C"] }
            ]
        }),
    );

    let results = response["result"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], json!({ "result": 1 }));
    assert_eq!(results[1]["error"]["code"], json!("SQLITE_ERROR"));
    assert!(results[1]["error"]["message"].as_str().unwrap().contains("syntax error"));
    assert_eq!(results[2], json!({ "result": 2 }));

    assert_eq!(names(&dispatcher, id), json!([["A"], ["C"]]));
    Ok(())
}

#[tokio::test]
async fn test_batch_abort_rolls_back() {
    test_batch_abort_rolls_back_impl().unwrap();
}

fn test_batch_abort_rolls_back_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;
    let response = call(
        &dispatcher,
        "batch",
        json!({
            "id": id,
            "inTransactionChange": true,
            "operations": [
                { "method": "insert", "sql": "INSERT INTO users (name, email) VALUES ('A', 'a@x')" },
                { "method": "insert", "sql": "INSERT INTO users (name, email) VALUES ('B', 'a@x')" },
                { "method": "insert", "sql": "INSERT INTO users (name) VALUES ('C')" }
            ]
        }),
    );

    assert_eq!(error_code(&response), "SQLITE_CONSTRAINT");
    assert_eq!(response["error"]["data"]["index"], json!(1));
    assert_eq!(response["error"]["data"]["extendedCode"], json!(2067));
    assert_eq!(names(&dispatcher, id), json!([]));

    // The handle is usable again: the batch transaction was closed.
    let begin = call(&dispatcher, "beginTransaction", json!({ "id": id }));
    assert_eq!(begin, json!({ "result": null }));
    Ok(())
}

#[tokio::test]
async fn test_batch_abort_without_transaction() {
    test_batch_abort_without_transaction_impl().unwrap();
}

fn test_batch_abort_without_transaction_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;
    let response = call(
        &dispatcher,
        "batch",
        json!({
            "id": id,
            "operations": [
                { "method": "insert", "sql": "INSERT INTO users (name) VALUES ('A')" },
                { "method": "insert", "sql": "INSERT INTO users (name) VALUES (NULL)" },
                { "method": "insert", "sql": "INSERT INTO users (name) VALUES ('C')" }
            ]
        }),
    );
    assert_eq!(error_code(&response), "SQLITE_CONSTRAINT");
    assert_eq!(names(&dispatcher, id), json!([["A"]]));
    Ok(())
}

#[tokio::test]
async fn test_batch_no_result_with_query() {
    test_batch_no_result_with_query_impl().unwrap();
}

fn test_batch_no_result_with_query_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;
    let response = call(
        &dispatcher,
        "batch",
        json!({
            "id": id,
            "noResult": true,
            "operations": [
                { "method": "insert", "sql": "INSERT INTO users (name) VALUES ('A')" },
                { "method": "query", "sql": "SELECT * FROM users" },
                { "method": "update", "sql": "UPDATE users SET name = 'Z'" }
            ]
        }),
    );
    assert_eq!(
        response,
        json!({ "result": [{ "result": null }, { "result": null }, { "result": null }] })
    );
    assert_eq!(names(&dispatcher, id), json!([["Z"]]));

    let with_results = call(
        &dispatcher,
        "batch",
        json!({
            "id": id,
            "operations": [{ "method": "query", "sql": "SELECT name FROM users" }]
        }),
    );
    assert_eq!(
        with_results,
        json!({ "result": [{ "result": { "columns": ["name"], "rows": [["Z"]] } }] })
    );
    Ok(())
}

#[tokio::test]
async fn test_nested_transaction_is_illegal() {
    test_nested_transaction_is_illegal_impl().unwrap();
}

fn test_nested_transaction_is_illegal_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;
    assert_eq!(
        call(&dispatcher, "beginTransaction", json!({ "id": id })),
        json!({ "result": null })
    );
    let nested = call(&dispatcher, "beginTransaction", json!({ "id": id }));
    assert_eq!(error_code(&nested), "IllegalState");

    let nested_batch = call(
        &dispatcher,
        "batch",
        json!({ "id": id, "inTransactionChange": true, "operations": [] }),
    );
    assert_eq!(error_code(&nested_batch), "IllegalState");

    // Statements issued meanwhile run inside the open scope.
    call(
        &dispatcher,
        "insert",
        json!({ "id": id, "sql": "INSERT INTO users (name) VALUES ('tx')" }),
    );
    call(&dispatcher, "rollbackTransaction", json!({ "id": id }));
    assert_eq!(names(&dispatcher, id), json!([]));
    Ok(())
}

#[tokio::test]
async fn test_plain_transaction_statements_are_tracked() {
    test_plain_transaction_statements_are_tracked_impl().unwrap();
}

fn test_plain_transaction_statements_are_tracked_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;

    call(&dispatcher, "execute", json!({ "id": id, "sql": "BEGIN" }));
    let nested = call(&dispatcher, "beginTransaction", json!({ "id": id }));
    assert_eq!(error_code(&nested), "IllegalState");
    call(&dispatcher, "execute", json!({ "id": id, "sql": "COMMIT" }));

    call(&dispatcher, "beginTransaction", json!({ "id": id }));
    call(&dispatcher, "execute", json!({ "id": id, "sql": "COMMIT" }));
    let batch = call(
        &dispatcher,
        "batch",
        json!({
            "id": id,
            "inTransactionChange": true,
            "operations": [
                { "method": "insert", "sql": "INSERT INTO users (name) VALUES ('after')" }
            ]
        }),
    );
    assert_eq!(batch, json!({ "result": [{ "result": 1 }] }));
    assert_eq!(names(&dispatcher, id), json!([["after"]]));
    Ok(())
}

#[tokio::test]
async fn test_argument_lists() {
    test_argument_lists_impl().unwrap();
}

fn test_argument_lists_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;

    let omitted = call(&dispatcher, "query", json!({ "id": id, "sql": "SELECT 1 AS one" }));
    let empty = call(
        &dispatcher,
        "query",
        json!({ "id": id, "sql": "SELECT 1 AS one", "arguments": [] }),
    );
    assert_eq!(omitted, json!({ "result": { "columns": ["one"], "rows": [[1]] } }));
    assert_eq!(omitted, empty);

    let missing = call(
        &dispatcher,
        "query",
        json!({ "id": id, "sql": "SELECT ?", "arguments": [] }),
    );
    assert_eq!(error_code(&missing), "SQLITE_RANGE");

    let composite = call(
        &dispatcher,
        "insert",
        json!({ "id": id, "sql": "INSERT INTO users (name) VALUES (?)", "arguments": [["nested"]] }),
    );
    assert_eq!(error_code(&composite), "BadParam");
    assert_eq!(names(&dispatcher, id), json!([]));
    Ok(())
}

#[tokio::test]
async fn test_tagged_values() {
    test_tagged_values_impl().unwrap();
}

fn test_tagged_values_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;
    call(
        &dispatcher,
        "insert",
        json!({
            "id": id,
            "sql": "INSERT INTO users (name, email, avatar) VALUES (?, ?, ?)",
            "arguments": ["blob", { "@bigint": "99999999999999999999" }, { "@blob": [0, 1, 254] }]
        }),
    );
    let row = call(
        &dispatcher,
        "query",
        json!({ "id": id, "sql": "SELECT email, avatar, ? AS seen, ? AS flag FROM users",
                "arguments": [{ "@date": 1_000 }, true] }),
    );
    assert_eq!(
        row["result"]["rows"],
        json!([["99999999999999999999", { "@blob": [0, 1, 254] }, 1000, 1]])
    );
    Ok(())
}

#[tokio::test]
async fn test_protocol_errors() {
    test_protocol_errors_impl().unwrap();
}

fn test_protocol_errors_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;
    let negative = call(
        &dispatcher,
        "query",
        json!({ "id": id, "sql": "SELECT 1", "cursorPageSize": -2 }),
    );
    assert_eq!(error_code(&negative), "BadParam");

    let no_sql = call(&dispatcher, "update", json!({ "id": id }));
    assert_eq!(error_code(&no_sql), "BadParam");

    let unknown = call(&dispatcher, "transmogrify", json!({ "id": id }));
    assert_eq!(error_code(&unknown), "UnsupportedMethod");

    let bad_batch = call(
        &dispatcher,
        "batch",
        json!({ "id": id, "operations": [
            { "method": "insert", "sql": "INSERT INTO users (name) VALUES ('A')" },
            { "method": "insert" }
        ]}),
    );
    assert_eq!(error_code(&bad_batch), "BadParam");
    assert_eq!(names(&dispatcher, id), json!([]));

    for envelope in [&negative, &no_sql, &unknown, &bad_batch] {
        assert!(!envelope["error"]["message"].as_str().unwrap().is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_file_database_lifecycle() {
    test_file_database_lifecycle_impl().unwrap();
}

fn test_file_database_lifecycle_impl() -> Result<()> {
    let dir = tempdir().unwrap();
    let dispatcher = Dispatcher::new(BridgeConfig::default().with_databases_path(dir.path()));

    let first = call(&dispatcher, "openDatabase", json!({ "path": "nested/app.db" }));
    let id = first["result"]["id"].as_i64().unwrap();
    initialize_schema(&dispatcher, id)?;
    assert_eq!(
        call(&dispatcher, "databaseExists", json!({ "path": "nested/app.db" })),
        json!({ "result": true })
    );

    let again = call(&dispatcher, "openDatabase", json!({ "path": "nested/app.db" }));
    assert_eq!(again, json!({ "result": { "id": id, "recovered": true } }));

    let separate = call(
        &dispatcher,
        "openDatabase",
        json!({ "path": "nested/app.db", "singleInstance": false }),
    );
    assert_ne!(separate["result"]["id"].as_i64().unwrap(), id);

    call(&dispatcher, "deleteDatabase", json!({ "path": "nested/app.db" }));
    assert_eq!(dispatcher.open_handles(), 0);
    assert_eq!(
        call(&dispatcher, "databaseExists", json!({ "path": "nested/app.db" })),
        json!({ "result": false })
    );
    let closed = call(&dispatcher, "query", json!({ "id": id, "sql": "SELECT 1" }));
    assert_eq!(error_code(&closed), "DatabaseClosed");
    Ok(())
}

#[tokio::test]
async fn test_read_only_database() {
    test_read_only_database_impl().unwrap();
}

fn test_read_only_database_impl() -> Result<()> {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_str().unwrap().to_string();
    let dispatcher = Dispatcher::new(BridgeConfig::default());

    let writer = call(&dispatcher, "openDatabase", json!({ "path": path, "singleInstance": false }));
    let writer = writer["result"]["id"].as_i64().unwrap();
    initialize_schema(&dispatcher, writer)?;
    seed_users(&dispatcher, writer, 1);
    dispatcher.close_database(writer)?;

    let reader = call(&dispatcher, "openDatabase", json!({ "path": path, "readOnly": true }));
    let reader = reader["result"]["id"].as_i64().unwrap();
    assert_eq!(names(&dispatcher, reader), json!([["user1"]]));

    let write = call(
        &dispatcher,
        "insert",
        json!({ "id": reader, "sql": "INSERT INTO users (name) VALUES ('nope')" }),
    );
    assert_eq!(error_code(&write), "SQLITE_READONLY");
    Ok(())
}

#[tokio::test]
async fn test_typed_api() {
    test_typed_api_impl().unwrap();
}

fn test_typed_api_impl() -> Result<()> {
    let (dispatcher, id) = create_test_db()?;
    let inserted = dispatcher.run(
        id,
        &Command::insert("INSERT INTO users (name, email) VALUES (?, ?)")
            .with_arguments(vec![Value::from("Jane"), Value::from(None::<String>)]),
    )?;
    assert_eq!(inserted, Response::Inserted(Some(1)));

    let updated = dispatcher.run(
        id,
        &Command::update("UPDATE users SET email = ? WHERE id = ?")
            .with_arguments(vec![Value::from("jane@example.com"), Value::from(1)]),
    )?;
    assert_eq!(updated, Response::Updated(1));

    let Response::Page(page) = dispatcher.run(id, &Command::query("SELECT name, email FROM users"))? else {
        panic!("expected a page");
    };
    assert_eq!(
        page.row_map(0).unwrap(),
        vec![
            ("name", &Value::from("Jane")),
            ("email", &Value::from("jane@example.com")),
        ]
    );
    Ok(())
}
