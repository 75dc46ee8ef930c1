mod common;

use std::ffi::OsStr;

#[test]
fn verify_ddl_session() -> anyhow::Result<()> {
    let env = tempfile::tempdir()?;
    let script = "\
create table foo (id int, data text)
create table foo (id int)
create table bar (flag boolean)
show tables
show columns from foo
create index fx on foo (id, data)
show index from foo
drop index fx from foo
drop table foo
drop table _columns
show tables
quit
show tables
";
    let out = common::run_session(env.path(), script)?;
    assert!(out.status.success());
    let stdout = out.stdout;

    assert!(stdout.starts_with("(rusty-mini-sql: running with database environment at "));
    assert!(stdout.contains("SQL> CREATE TABLE foo (id INT, data TEXT)\ncreated foo\n"));
    assert!(stdout.contains("CREATE TABLE foo (id INT)\nError: DbRelationError: "));
    assert!(stdout.contains(
        "CREATE TABLE bar (flag BOOLEAN)\nError: unsupported column definition: flag BOOLEAN\n"
    ));
    assert!(stdout.contains(
        "SHOW TABLES\ntable_name \n+----------+\n\"foo\" \nsuccessfully returned 1 rows\n"
    ));
    assert!(stdout.contains(
        "SHOW COLUMNS FROM foo\n\
         table_name column_name data_type \n\
         +----------+----------+----------+\n\
         \"foo\" \"id\" \"INT\" \n\
         \"foo\" \"data\" \"TEXT\" \n\
         successfully returned 2 rows\n"
    ));
    assert!(stdout.contains("CREATE INDEX fx ON foo USING BTREE (id, data)\ncreated index fx\n"));
    assert!(stdout.contains(
        "\"foo\" \"fx\" 2 \"data\" \"BTREE\" false \nsuccessfully returned 2 rows\n"
    ));
    assert!(stdout.contains("DROP INDEX fx FROM foo\ndropped index fx\n"));
    assert!(stdout.contains("DROP TABLE foo\ndropped foo\n"));
    assert!(stdout.contains("DROP TABLE _columns\nError: cannot drop a schema table: _columns\n"));
    assert!(stdout.ends_with(
        "SHOW TABLES\ntable_name \n+----------+\nsuccessfully returned 0 rows\nSQL> "
    ));
    Ok(())
}

#[test]
fn verify_catalog_survives_restart() -> anyhow::Result<()> {
    let env = tempfile::tempdir()?;
    common::run_session(env.path(), "create table keep (k int)\ncreate index kx on keep (k)\n")?;

    let out = common::run_session(
        env.path(),
        "show tables\nshow index from keep\ncreate table if not exists keep (k int)\n",
    )?;
    assert!(out.status.success());
    assert!(out.stdout.contains("\"keep\" \nsuccessfully returned 1 rows\n"));
    assert!(out
        .stdout
        .contains("\"keep\" \"kx\" 1 \"k\" \"BTREE\" false \nsuccessfully returned 1 rows\n"));
    assert!(out.stdout.contains("table keep already exists\n"));
    Ok(())
}

#[test]
fn verify_sentinels_and_invalid_input() -> anyhow::Result<()> {
    let env = tempfile::tempdir()?;
    let out = common::run_session(
        env.path(),
        "test\nthis is not sql\ninsert into foo values (1)\n",
    )?;
    assert!(out.status.success());
    assert!(out.stdout.contains("SQL> test_heap_storage: Passed\n"));
    assert!(out.stdout.contains("SQL> INVALID SQL: this is not sql\nParse error: "));
    assert!(out.stdout.contains("\nnot implemented\n"));
    // End of input closes the shell like `quit`.
    assert!(out.stdout.ends_with("SQL> \n"));
    Ok(())
}

#[test]
fn verify_cli_requires_one_argument() -> anyhow::Result<()> {
    let out = common::run_with_args(Vec::<&OsStr>::new(), "quit\n")?;
    assert!(!out.status.success());
    assert!(!out.stdout.contains("SQL> "));

    let env = tempfile::tempdir()?;
    let out = common::run_with_args([env.path().as_os_str(), OsStr::new("extra")], "quit\n")?;
    assert!(!out.status.success());
    Ok(())
}
