/// # Integration Tests Module
///
/// End-to-end tests of `Database` over the scriptable mock driver (for
/// exact SQL, reconnects and charset refusals) and over in-memory SQLite
/// (for real reads and writes).

#[cfg(test)]
mod tests {
    use crate::assert_db_error;
    use crate::config::DbConfig;
    use crate::core::db::{ConnectionState, DriverError, Execution, Output, QueryStatus, Results, RowShape, Value};
    use crate::core::ErrorKind;
    use crate::database::Database;
    use crate::placeholder::{escape_token, Arg, Format};
    use crate::storage::QueryLogStore;
    use crate::test_utils::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn cant_connect() -> DriverError {
        DriverError::mysql(2003, "Can't connect to MySQL server on 'db.internal'")
    }

    // Reconnects

    #[test]
    fn test_reconnect_gives_up_after_configured_retries() {
        let (mut db, handle, sleeper) = mock_database(mock_config()).unwrap();
        handle.drop_link();
        handle.script_connects((0..5).map(|_| Err(cant_connect())).collect());

        let result = db.query("SELECT 1");
        assert_eq!(result.as_ref().err().map(|e| e.cause()), Some(ErrorKind::ConnectionLost));
        assert_db_error!(result, Bailed, "exhausted reconnect");
        assert_eq!(sleeper.sleeps(), vec![Duration::from_millis(10); 5]);
        assert_eq!(db.state(), ConnectionState::Failed);
        assert_eq!(db.last_error().and_then(|e| e.code.as_deref()), Some("db_connect_fail"));

        // Not ready any more: no further attempts.
        assert_db_error!(db.query("SELECT 1"), NotReady, "after failure");
        assert_eq!(handle.state().connects, 6);
    }

    #[test]
    fn test_reconnect_recovers_and_reruns_statement() {
        let (mut db, handle, sleeper) = mock_database(mock_config()).unwrap();
        handle.drop_link();
        handle.script_connects(vec![Err(cant_connect()), Err(cant_connect())]);
        handle.respond_row(&["one"], vec![Value::Int(1)]);

        assert_eq!(db.query("SELECT 1").unwrap(), QueryStatus::Rows(1));
        assert_eq!(sleeper.sleeps().len(), 2);
        assert!(db.is_ready());
        assert_eq!(db.num_queries(), 2);
        let selects: Vec<String> = handle
            .data_statements()
            .into_iter()
            .filter(|s| s == "SELECT 1")
            .collect();
        assert_eq!(selects.len(), 2);
        assert_eq!(handle.state().selected, vec!["wordpress", "wordpress"]);
    }

    #[test]
    fn test_refused_credentials_stop_reconnecting() {
        let (mut db, handle, sleeper) = mock_database(mock_config()).unwrap();
        handle.drop_link();
        handle.script_connects(vec![Err(DriverError::mysql(1045, "Access denied for user 'wp'"))]);

        let result = db.query("SELECT 1");
        assert_eq!(result.as_ref().err().map(|e| e.cause()), Some(ErrorKind::AuthenticationFailure));
        assert_db_error!(result, Bailed, "refused credentials");
        assert!(sleeper.sleeps().is_empty());
        assert_eq!(handle.state().connects, 2);
    }

    #[test]
    fn test_check_connection_without_bail_returns_typed_errors() {
        let (mut db, handle, sleeper) = mock_database(mock_config()).unwrap();
        handle.drop_link();
        handle.script_connects(vec![Err(DriverError::mysql(1045, "Access denied for user 'wp'"))]);
        assert_db_error!(db.check_connection(false), AuthenticationFailure, "refused credentials");
        assert!(sleeper.sleeps().is_empty());

        handle.drop_link();
        handle.script_connects((0..5).map(|_| Err(cant_connect())).collect());
        assert_db_error!(db.check_connection(false), ConnectionLost, "exhausted reconnect");
        assert_eq!(sleeper.sleeps().len(), 5);
        assert!(db.last_error().is_none());
    }

    fn fatal_database() -> (Database, MockHandle, RecordingSleeper, Arc<std::sync::Mutex<Vec<crate::reporter::ErrorRecord>>>) {
        let (driver, handle) = MockDriver::new();
        let (terminator, records) = recording_terminator();
        let sleeper = RecordingSleeper::default();
        let mut db = Database::new(
            DbConfig {
                fatal_errors: true,
                ..mock_config()
            },
            Box::new(driver),
        )
        .unwrap()
        .with_terminator(terminator)
        .with_sleeper(Box::new(sleeper.clone()));
        db.connect().unwrap();
        (db, handle, sleeper, records)
    }

    #[test]
    fn test_lost_link_during_select_keeps_retrying_without_bail() {
        let (mut db, handle, sleeper, records) = fatal_database();
        handle.drop_link();
        handle.script_selects(vec![Err(DriverError::mysql(2013, "Lost connection to MySQL server during query"))]);

        db.check_connection(false).unwrap();
        assert!(records.lock().unwrap().is_empty());
        assert_eq!(sleeper.sleeps(), vec![Duration::from_millis(10)]);
        assert!(db.is_ready());
        assert_eq!(handle.state().selected, vec!["wordpress", "wordpress"]);
    }

    #[test]
    fn test_unknown_schema_on_reconnect_is_not_retried() {
        let (mut db, handle, sleeper, records) = fatal_database();
        handle.drop_link();
        handle.script_selects(vec![Err(DriverError::mysql(1049, "Unknown database 'wordpress'"))]);

        assert_db_error!(db.check_connection(false), NotReady, "unknown schema");
        assert!(records.lock().unwrap().is_empty());
        assert!(sleeper.sleeps().is_empty());
        assert_eq!(db.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_fatal_mode_runs_terminator() {
        let (driver, handle) = MockDriver::new();
        let (terminator, records) = recording_terminator();
        let mut db = Database::new(
            DbConfig {
                fatal_errors: true,
                ..mock_config()
            },
            Box::new(driver),
        )
        .unwrap()
        .with_terminator(terminator);
        handle.script_connects(vec![Err(cant_connect())]);

        assert_db_error!(db.connect(), Bailed, "fatal connect");
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ErrorKind::Setup);
        assert_eq!(records[0].code.as_deref(), Some("db_connect_fail"));
        assert!(records[0].message.contains("db.internal:3306"));
    }

    #[test]
    fn test_query_before_connect_is_not_ready() {
        let (driver, handle) = MockDriver::new();
        let mut db = Database::new(mock_config(), Box::new(driver)).unwrap();
        assert_db_error!(db.query("SELECT 1"), NotReady, "unconnected");
        assert!(handle.executed().is_empty());
    }

    #[test]
    fn test_connect_prepares_session() {
        let (db, handle, _) = mock_database(mock_config()).unwrap();
        assert_eq!(db.charset(), Some("utf8mb4"));
        assert_eq!(db.collate(), Some("utf8mb4_unicode_520_ci"));
        let executed = handle.executed();
        assert!(executed.contains(&"SET NAMES 'utf8mb4' COLLATE 'utf8mb4_unicode_520_ci'".to_string()));
        assert!(executed.contains(&"SET SESSION sql_mode='NO_ENGINE_SUBSTITUTION'".to_string()));
    }

    // CRUD statements

    #[test]
    fn test_insert_emits_literal_null() {
        let (mut db, handle, _) = mock_database(mock_config()).unwrap();
        handle.respond(Ok(Execution {
            rows_affected: 1,
            insert_id: 42,
            ..Execution::default()
        }));

        let affected = db
            .insert("wp_posts", &[("post_title", "Hello".into()), ("post_parent", Arg::Null)], &[])
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(db.insert_id(), 42);
        insta::assert_snapshot!(
            handle.last_statement().unwrap(),
            @"INSERT INTO `wp_posts` (`post_title`, `post_parent`) VALUES ('Hello', NULL)"
        );
    }

    #[test]
    fn test_update_uses_is_null_in_where() {
        let (mut db, handle, _) = mock_database(mock_config()).unwrap();
        db.update(
            "wp_posts",
            &[("post_title", "Hi O'Brien".into())],
            &[("ID", 7.into()), ("post_parent", Arg::Null)],
            &[],
            &[Format::Int],
        )
        .unwrap();
        insta::assert_snapshot!(
            handle.last_statement().unwrap(),
            @"UPDATE `wp_posts` SET `post_title` = 'Hi O''Brien' WHERE `ID` = 7 AND `post_parent` IS NULL"
        );
    }

    #[test]
    fn test_replace_and_delete_statements() {
        let config = DbConfig {
            field_types: [("post_parent".to_string(), Format::Int)].into_iter().collect(),
            ..mock_config()
        };
        let (mut db, handle, _) = mock_database(config).unwrap();

        db.replace("wp_posts", &[("ID", Arg::Int(3)), ("post_parent", "12".into())], &[])
            .unwrap();
        insta::assert_snapshot!(
            handle.last_statement().unwrap(),
            @"REPLACE INTO `wp_posts` (`ID`, `post_parent`) VALUES ('3', 12)"
        );

        db.delete("wp_posts", &[("post_name", "hello".into())], &[]).unwrap();
        insta::assert_snapshot!(
            handle.last_statement().unwrap(),
            @"DELETE FROM `wp_posts` WHERE `post_name` = 'hello'"
        );
    }

    #[test]
    fn test_null_ignores_numeric_formats() {
        let (mut db, handle, _) = mock_database(mock_config()).unwrap();

        db.insert(
            "wp_posts",
            &[("ID", Arg::Null), ("post_title", "x".into()), ("post_parent", Arg::Null)],
            &[Format::Int, Format::Str, Format::Float],
        )
        .unwrap();
        insta::assert_snapshot!(
            handle.last_statement().unwrap(),
            @"INSERT INTO `wp_posts` (`ID`, `post_title`, `post_parent`) VALUES (NULL, 'x', NULL)"
        );

        db.update(
            "wp_posts",
            &[("post_parent", Arg::Null), ("post_title", "y".into())],
            &[("ID", 4.into())],
            &[Format::Float, Format::Str],
            &[Format::Int],
        )
        .unwrap();
        insta::assert_snapshot!(
            handle.last_statement().unwrap(),
            @"UPDATE `wp_posts` SET `post_parent` = NULL, `post_title` = 'y' WHERE `ID` = 4"
        );

        db.delete("wp_posts", &[("post_parent", Arg::Null)], &[Format::Int]).unwrap();
        insta::assert_snapshot!(
            handle.last_statement().unwrap(),
            @"DELETE FROM `wp_posts` WHERE `post_parent` IS NULL"
        );
    }

    #[test]
    fn test_legacy_unquoted_mode_still_quotes_conversions() {
        let config = DbConfig {
            allow_unsafe_unquoted_parameters: true,
            ..mock_config()
        };
        let (mut db, handle, _) = mock_database(config).unwrap();
        handle.with_table("wp_cp", &[("title", "varchar(50)", Some("cp1251_general_ci"))]);
        let title = "Жук') OR 1=1 -- ";
        handle.respond_row(&["x_0"], vec![Value::Text(title.to_string())]);

        db.insert("wp_cp", &[("title", title.into())], &[]).unwrap();
        let statements = handle.data_statements();
        assert_eq!(statements.len(), 2);
        insta::assert_snapshot!(
            statements[0],
            @"SELECT CONVERT( LEFT( CONVERT( 'Жук'') OR 1=1 -- ' USING cp1251 ), 50 ) USING utf8mb4 ) AS x_0"
        );
        insta::assert_snapshot!(
            statements[1],
            @"INSERT INTO `wp_cp` (`title`) VALUES ('Жук'') OR 1=1 -- ')"
        );
    }

    #[test]
    fn test_crud_refuses_values_that_do_not_fit() {
        let (mut db, handle, _) = mock_database(mock_config()).unwrap();
        let result = db.insert(
            "wp_posts",
            &[("post_title", "fine".into()), ("post_name", "hello-world-long".into())],
            &[],
        );
        match result {
            Err(crate::core::DbError::InvalidData(message)) => {
                assert!(message.contains("post_name"));
                assert!(!message.contains("post_title"));
            }
            other => panic!("Expected invalid data, got {:?}", other),
        }
        assert!(handle.last_statement().is_none());
        assert_eq!(db.insert_id(), 0);
    }

    #[test]
    fn test_crud_requires_where_columns() {
        let (mut db, _, _) = mock_database(mock_config()).unwrap();
        assert_db_error!(db.delete("wp_posts", &[], &[]), InvalidData, "empty delete");
        assert_db_error!(
            db.update("wp_posts", &[("post_title", "x".into())], &[], &[], &[]),
            InvalidData,
            "empty update"
        );
    }

    #[test]
    fn test_failed_insert_resets_insert_id() {
        let (mut db, handle, _) = mock_database(mock_config()).unwrap();
        handle.respond(Ok(Execution {
            rows_affected: 1,
            insert_id: 9,
            ..Execution::default()
        }));
        db.insert("wp_posts", &[("post_title", "a".into())], &[]).unwrap();
        assert_eq!(db.insert_id(), 9);

        handle.respond(Err(DriverError::mysql(1062, "Duplicate entry '9' for key 'PRIMARY'")));
        let result = db.insert("wp_posts", &[("post_title", "a".into())], &[]);
        assert_db_error!(result, QueryExecution, "duplicate insert");
        assert_eq!(db.insert_id(), 0);

        let error = db.last_error().unwrap();
        assert_eq!(error.kind, ErrorKind::QueryExecution);
        assert!(error.message.contains("Duplicate entry"));
        assert!(error.query.as_deref().unwrap().starts_with("INSERT INTO `wp_posts`"));
        assert!(error.caller.contains("integration_tests.rs"));
    }

    // Charset checks on raw queries

    #[test]
    fn test_query_with_unstorable_text_is_refused() {
        let (mut db, handle, _) = mock_database(mock_config()).unwrap();
        handle.with_table("wp_legacy", &[("title", "varchar(50)", Some("utf8_general_ci"))]);

        let result = db.query("SELECT * FROM wp_legacy WHERE title = 'smile 😀'");
        assert_db_error!(result, InvalidData, "four-byte text in utf8 table");
        assert!(handle.last_statement().is_none());
        assert_eq!(db.last_query(), Some("SELECT * FROM wp_legacy WHERE title = 'smile 😀'"));

        // Three-byte text passes the same table.
        db.query("SELECT * FROM wp_legacy WHERE title = 'café €'").unwrap();
        assert_eq!(
            handle.last_statement().as_deref(),
            Some("SELECT * FROM wp_legacy WHERE title = 'café €'")
        );
    }

    #[test]
    fn test_safe_collation_skips_strip_for_reads() {
        let (mut db, handle, _) = mock_database(mock_config()).unwrap();
        handle.with_table("wp_terms", &[("name", "varchar(200)", Some("utf8mb4_general_ci"))]);
        handle.with_table("wp_latin", &[("name", "varchar(200)", Some("latin1_swedish_ci"))]);

        assert!(db.check_safe_collation("SELECT * FROM wp_posts WHERE ID = 1"));
        assert!(db.check_safe_collation("SHOW TABLES LIKE 'wp_é%'"));
        assert!(db.check_safe_collation("SELECT * FROM wp_terms WHERE name = 'café'"));
        assert!(db.check_safe_collation("SELECT * FROM wp_latin WHERE name = 'café'"));
        assert!(!db.check_safe_collation("SELECT * FROM wp_posts WHERE post_title = 'café'"));
        assert!(!db.check_safe_collation("SELECT 'café'"));
    }

    #[test]
    fn test_reads_use_query_results() {
        let (mut db, handle, _) = mock_database(mock_config()).unwrap();
        handle.respond_row(&["post_title"], vec![Value::Text("Hello".into())]);
        assert_eq!(
            db.get_var("SELECT post_title FROM wp_posts WHERE ID = 1", 0, 0).unwrap(),
            Some(Value::Text("Hello".into()))
        );
        assert_eq!(db.num_rows(), 1);

        handle.respond_row(&["post_title"], vec![Value::Text(String::new())]);
        assert_eq!(db.get_var("SELECT post_title FROM wp_posts WHERE ID = 2", 0, 0).unwrap(), None);
    }

    #[test]
    fn test_schema_cache_is_shared() {
        let (mut first, first_handle, _) = mock_database(mock_config()).unwrap();
        let cache = first.schema_cache();
        assert_eq!(first.get_table_charset("wp_posts").unwrap().as_deref(), Some("utf8mb4"));

        let (driver, second_handle) = MockDriver::new();
        let mut second = Database::open(mock_config(), Box::new(driver))
            .unwrap()
            .with_schema_cache(Arc::clone(&cache));
        assert_eq!(second.get_col_charset("WP_POSTS", "post_title").unwrap().as_deref(), Some("utf8mb4"));
        assert_eq!(second.get_col_charset("wp_posts", "ID").unwrap(), None);

        assert_eq!(first_handle.describe_count("wp_posts"), 1);
        assert_eq!(second_handle.describe_count("wp_posts"), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_tenant_tables() {
        let config = DbConfig {
            multisite: true,
            ..mock_config()
        };
        let (mut db, _, _) = mock_database(config).unwrap();
        assert_eq!(db.set_blog_id(3, None), 0);
        assert_eq!(db.table("posts"), Some("wp_3_posts"));
        assert_eq!(db.table("users"), Some("wp_users"));
        assert_eq!(db.get_blog_prefix(Some(1)), "wp_");

        assert!(db.set_prefix("bad-prefix").is_err());
        assert_eq!(db.set_prefix("site_").unwrap(), "wp_");
        assert_eq!(db.table("posts"), Some("site_3_posts"));
    }

    // SQLite end to end

    #[test]
    fn test_sqlite_crud_round_trip() {
        let mut db = sqlite_database(DbConfig::default()).unwrap();

        db.insert(
            "wp_posts",
            &[("post_title", "O'Brien's 100% post".into()), ("post_name", "obrien".into())],
            &[],
        )
        .unwrap();
        assert_eq!(db.insert_id(), 1);
        db.insert("wp_posts", &[("post_title", "Second".into()), ("menu_order", 5.into())], &[Format::Str, Format::Int])
            .unwrap();
        assert_eq!(db.insert_id(), 2);

        let title = db.get_var("SELECT post_title FROM wp_posts WHERE ID = 1", 0, 0).unwrap();
        assert_eq!(title, Some(Value::Text("O'Brien's 100% post".into())));

        let affected = db
            .update("wp_posts", &[("post_parent", 1.into())], &[("post_name", "".into())], &[Format::Int], &[])
            .unwrap();
        assert_eq!(affected, 1);

        let parents = db.get_col("SELECT post_parent FROM wp_posts ORDER BY ID", 0).unwrap();
        assert_eq!(parents, vec![Value::Null, Value::Int(1)]);

        match db.get_row("SELECT ID, post_name FROM wp_posts WHERE ID = 1", Output::ArrayA, 0).unwrap() {
            Some(RowShape::Assoc(pairs)) => {
                assert_eq!(pairs[1], ("post_name".to_string(), Value::Text("obrien".into())));
            }
            other => panic!("Expected an associative row, got {:?}", other),
        }

        assert_eq!(db.delete("wp_posts", &[("post_parent", Arg::Null)], &[]).unwrap(), 1);
        assert_eq!(db.get_var("SELECT COUNT(*) FROM wp_posts", 0, 0).unwrap(), Some(Value::Int(1)));
    }

    #[test]
    fn test_sqlite_prepared_percent_survives() {
        let mut db = sqlite_database(DbConfig::default()).unwrap();
        db.insert("wp_options", &[("option_name", "ratio".into()), ("option_value", "50%".into())], &[])
            .unwrap();

        let prepared = db
            .prepare("SELECT option_value FROM wp_options WHERE option_value = %s", &["50%".into()])
            .unwrap();
        assert!(prepared.escaped().contains(escape_token()));
        assert_eq!(
            db.get_var(prepared.escaped(), 0, 0).unwrap(),
            Some(Value::Text("50%".into()))
        );
        assert!(!db.last_query().unwrap().contains(escape_token()));
    }

    #[test]
    fn test_sqlite_keyed_results() {
        let mut db = sqlite_database(DbConfig::default()).unwrap();
        for (name, value) in [("a", "1"), ("b", "2")] {
            db.insert("wp_options", &[("option_name", name.into()), ("option_value", value.into())], &[])
                .unwrap();
        }

        let results = db
            .get_results("SELECT option_name, option_value FROM wp_options ORDER BY option_id", Output::ObjectKeyed)
            .unwrap();
        match results {
            Results::Keyed(rows) => {
                let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, vec!["a", "b"]);
                assert_eq!(rows[1].1.get("option_value"), Some(&Value::Text("2".into())));
            }
            other => panic!("Expected keyed results, got {:?}", other),
        }
        assert_eq!(
            db.last_result().shape(Output::ArrayN).to_json().unwrap(),
            r#"[["a","1"],["b","2"]]"#
        );
    }

    #[test]
    fn test_sqlite_binary_table_skips_text_check() {
        let mut db = sqlite_database(DbConfig::default()).unwrap();
        assert!(db.get_table_charset("wp_files").unwrap().as_deref() == Some("binary"));
        assert_eq!(
            db.query("SELECT * FROM wp_files WHERE body = 'é'").unwrap(),
            QueryStatus::Rows(0)
        );
    }

    #[test]
    fn test_sqlite_errors_are_reported() {
        let mut db = sqlite_database(DbConfig::default()).unwrap();
        let result = db.query("SELECT * FROM wp_missing");
        assert_db_error!(result, QueryExecution, "missing table");
        let error = db.last_error().unwrap();
        assert!(error.message.contains("no such table"));
        assert_eq!(error.query.as_deref(), Some("SELECT * FROM wp_missing"));

        db.query("SELECT 1").unwrap();
        assert!(db.last_error().is_none());
    }

    #[test]
    fn test_sqlite_query_log() {
        let mut db = sqlite_database(DbConfig {
            save_queries: true,
            ..DbConfig::default()
        })
        .unwrap();
        db.query("SELECT 1").unwrap();
        let _ = db.query("SELECT * FROM nope");

        let log = db.query_log();
        // three fixture DDL statements first
        assert_eq!(log.len(), 5);
        let last = &log.entries()[4];
        assert!(!last.success);
        assert!(last.caller.contains("integration_tests.rs"));
        assert_eq!(log.entries()[3].row_count, Some(1));

        let store = QueryLogStore::open_in_memory().unwrap();
        assert_eq!(db.persist_query_log(&store).unwrap(), 5);
        assert_eq!(store.search("nope").unwrap().len(), 1);
    }
}
