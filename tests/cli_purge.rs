use std::{
    ffi::OsStr,
    fs,
    path::Path,
    process::{Command, Output},
};

use reqbin::store::unix_now_secs;
use rusqlite::{Connection, params};
use tempfile::tempdir;

fn run_reqbin<I, S>(args: I, cwd: &Path, home: &Path) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_reqbin"))
        .args(args)
        .env("HOME", home)
        .env_remove("REQBIN_LOG")
        .current_dir(cwd)
        .output()
        .expect("reqbin command should execute")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "expected success\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn seed_sessions(db_path: &Path) {
    let conn = Connection::open(db_path).expect("database should open");
    let now = unix_now_secs();
    for (id, age_secs) in [("old", 7_200), ("recent", 60)] {
        conn.execute(
            "INSERT INTO session (id, creation_date) VALUES (?1, ?2)",
            params![id, now - age_secs],
        )
        .expect("session should be inserted");
        conn.execute(
            "INSERT INTO request (id_session, data) VALUES (?1, ?2)",
            params![id, format!("{{\"session\":\"{id}\"}}")],
        )
        .expect("request should be inserted");
    }
}

fn remaining_sessions(db_path: &Path) -> Vec<String> {
    let conn = Connection::open(db_path).expect("database should open");
    let mut stmt = conn
        .prepare("SELECT id FROM session ORDER BY id")
        .expect("query should prepare");
    stmt.query_map([], |row| row.get::<_, String>(0))
        .expect("query should run")
        .collect::<Result<_, _>>()
        .expect("rows should decode")
}

#[test]
fn purge_command_removes_sessions_older_than_max_age() {
    let sandbox = tempdir().expect("tempdir should be created");
    let project_dir = sandbox.path().join("project");
    let home_dir = sandbox.path().join("home");
    fs::create_dir_all(&project_dir).expect("project dir should be created");
    fs::create_dir_all(&home_dir).expect("home dir should be created");

    let db_path = sandbox.path().join("data").join("reqbin.db");
    let config_path = sandbox.path().join("reqbin.toml");
    fs::write(
        &config_path,
        format!(
            r#"
[storage]
path = "{}"

[purge]
max_age_secs = 3600
"#,
            db_path.display()
        ),
    )
    .expect("config should be written");

    // First run creates the database and schema.
    let output = run_reqbin(
        [OsStr::new("purge"), OsStr::new("--config"), config_path.as_os_str()],
        &project_dir,
        &home_dir,
    );
    assert_success(&output);
    assert!(
        String::from_utf8_lossy(&output.stdout).contains("purged 0 session(s)"),
        "stdout: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    assert!(db_path.is_file());

    seed_sessions(&db_path);

    let output = run_reqbin(
        [OsStr::new("purge"), OsStr::new("--config"), config_path.as_os_str()],
        &project_dir,
        &home_dir,
    );
    assert_success(&output);
    assert!(
        String::from_utf8_lossy(&output.stdout)
            .contains("purged 1 session(s) and 1 request(s) older than 3600s"),
        "stdout: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    assert_eq!(remaining_sessions(&db_path), vec!["recent".to_owned()]);

    let output = run_reqbin(
        [
            OsStr::new("purge"),
            OsStr::new("--config"),
            config_path.as_os_str(),
            OsStr::new("--max-age-secs"),
            OsStr::new("30"),
        ],
        &project_dir,
        &home_dir,
    );
    assert_success(&output);
    assert!(remaining_sessions(&db_path).is_empty());
}

#[test]
fn purge_command_reads_project_config() {
    let sandbox = tempdir().expect("tempdir should be created");
    let project_dir = sandbox.path().join("project");
    let home_dir = sandbox.path().join("home");
    fs::create_dir_all(&project_dir).expect("project dir should be created");
    fs::create_dir_all(&home_dir).expect("home dir should be created");
    fs::write(
        project_dir.join("reqbin.toml"),
        r#"
[storage]
path = "project.db"
"#,
    )
    .expect("project config should be written");

    let output = run_reqbin(["purge"], &project_dir, &home_dir);

    assert_success(&output);
    assert!(project_dir.join("project.db").is_file());
}

#[test]
fn purge_command_fails_on_a_corrupt_database() {
    let sandbox = tempdir().expect("tempdir should be created");
    let db_path = sandbox.path().join("corrupt.db");
    fs::write(&db_path, vec![0x5a_u8; 4096]).expect("garbage file should be written");
    let config_path = sandbox.path().join("reqbin.toml");
    fs::write(
        &config_path,
        format!("[storage]\npath = \"{}\"\n", db_path.display()),
    )
    .expect("config should be written");

    let output = run_reqbin(
        [OsStr::new("purge"), OsStr::new("--config"), config_path.as_os_str()],
        sandbox.path(),
        sandbox.path(),
    );

    assert!(!output.status.success());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("cannot open"),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn purge_command_emits_structured_logs() {
    let sandbox = tempdir().expect("tempdir should be created");
    let db_path = sandbox.path().join("reqbin.db");
    let config_path = sandbox.path().join("reqbin.toml");
    fs::write(
        &config_path,
        format!("[storage]\npath = \"{}\"\n", db_path.display()),
    )
    .expect("config should be written");

    let output = run_reqbin(
        [
            OsStr::new("purge"),
            OsStr::new("--config"),
            config_path.as_os_str(),
            OsStr::new("--log-level"),
            OsStr::new("debug"),
        ],
        sandbox.path(),
        sandbox.path(),
    );
    assert_success(&output);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("store opened"), "stderr: {stderr}");
    assert!(stderr.contains("purge finished"), "stderr: {stderr}");

    let output = run_reqbin(
        [OsStr::new("purge"), OsStr::new("--config"), config_path.as_os_str()],
        sandbox.path(),
        sandbox.path(),
    );
    assert_success(&output);
    assert!(
        !String::from_utf8_lossy(&output.stderr).contains("store opened"),
        "debug events should be filtered at the default level"
    );

    let output = Command::new(env!("CARGO_BIN_EXE_reqbin"))
        .args([OsStr::new("purge"), OsStr::new("--config"), config_path.as_os_str()])
        .env("HOME", sandbox.path())
        .env("REQBIN_LOG", "debug")
        .current_dir(sandbox.path())
        .output()
        .expect("reqbin command should execute");
    assert_success(&output);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("store opened"), "stderr: {stderr}");
}
