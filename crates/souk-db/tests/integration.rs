use souk_db::{create_pool, run_migrations, DbRuntimeSettings};

#[test]
fn pooled_connections_share_migrated_schema() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("souk.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings::default(),
    )
    .expect("failed to create pool");

    {
        let conn = pool.get().expect("failed to get connection");
        let applied = run_migrations(&conn).expect("failed to run migrations");
        assert!(applied > 0);
    }

    // A second pooled connection must see the tables created by the first.
    let first = pool.get().expect("failed to get connection");
    let second = pool.get().expect("failed to get second connection");
    drop(first);

    let mut stmt = second
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .expect("failed to prepare table query");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("failed to execute table query")
        .map(|r| r.expect("failed to read table name"))
        .collect();

    assert_eq!(
        tables,
        vec![
            "_souk_migrations",
            "federated_servers",
            "federation_audit_log",
            "local_server_identity",
        ]
    );
}
