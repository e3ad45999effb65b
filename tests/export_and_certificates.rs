use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::ZipArchive;

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_bulletind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bulletind");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .expect("error code")
        .to_string()
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "class",
        "setup.class",
        json!({ "id": "c1", "name": "4e A" }),
    );
    for (id, last, sort) in [("sa", "Abena", 0), ("sb", "Biya", 1)] {
        let _ = request_ok(
            stdin,
            reader,
            &format!("stu-{}", id),
            "setup.student",
            json!({ "id": id, "classId": "c1", "lastName": last, "firstName": "X", "sortOrder": sort }),
        );
    }
    let _ = request_ok(
        stdin,
        reader,
        "subj",
        "setup.subject",
        json!({ "id": "subj-h", "name": "Histoire", "shortCode": "HIST" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "asg",
        "setup.assignment",
        json!({ "id": "asg-h", "subjectId": "subj-h", "classId": "c1", "coefficient": 2 }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "term",
        "terms.create",
        json!({ "id": "t1", "schoolYear": "2025-2026", "label": "Trimestre 1" }),
    );
    for (i, (student, value)) in [("sa", 16.0), ("sb", 8.0)].iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("score-{}", i),
            "scores.record",
            json!({
                "studentId": student,
                "assignmentId": "asg-h",
                "termId": "t1",
                "sequence": 1,
                "value": value,
            }),
        );
    }
    let _ = request_ok(
        stdin,
        reader,
        "gen",
        "bulletins.generate",
        json!({ "classId": "c1", "termId": "t1" }),
    );
}

#[test]
fn bundle_export_ships_validated_bulletins_with_checksums() {
    let workspace = temp_dir("bulletind-export");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    // Drafts only: nothing to export yet.
    let out_path = workspace.join("bundle.zip");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "export-none",
        "bulletins.exportBundle",
        json!({ "classId": "c1", "termId": "t1", "outPath": out_path.to_string_lossy() }),
    );
    assert_eq!(code, "export_failed");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "val-a",
        "bulletins.validate",
        json!({ "studentId": "sa", "termId": "t1" }),
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "export",
        "bulletins.exportBundle",
        json!({ "classId": "c1", "termId": "t1", "outPath": out_path.to_string_lossy() }),
    );
    assert_eq!(
        result.get("bundleFormat").and_then(|v| v.as_str()),
        Some("bulletin-bundle-v1")
    );
    // One bulletin entry plus the manifest; B's draft is not issued.
    assert_eq!(result.get("entryCount").and_then(|v| v.as_u64()), Some(2));

    let file = std::fs::File::open(&out_path).expect("open bundle");
    let mut archive = ZipArchive::new(file).expect("read zip");

    let mut manifest_text = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest_text)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest_text).expect("parse manifest");
    let entries = manifest
        .get("entries")
        .and_then(|v| v.as_array())
        .expect("manifest entries");
    assert_eq!(entries.len(), 1);
    let entry_path = entries[0].get("path").and_then(|v| v.as_str()).expect("path");
    let expected_sha = entries[0]
        .get("sha256")
        .and_then(|v| v.as_str())
        .expect("sha256");
    assert_eq!(entry_path, "bulletins/sa.json");

    let mut bytes = Vec::new();
    archive
        .by_name(entry_path)
        .expect("bulletin entry")
        .read_to_end(&mut bytes)
        .expect("read bulletin entry");
    assert_eq!(format!("{:x}", Sha256::digest(&bytes)), expected_sha);

    let doc: serde_json::Value = serde_json::from_slice(&bytes).expect("parse bulletin doc");
    assert_eq!(doc.get("overallAverage").and_then(|v| v.as_f64()), Some(16.0));
    assert_eq!(doc.get("rank").and_then(|v| v.as_i64()), Some(1));

    let _ = child.kill();
}

#[test]
fn certificates_follow_numbering_and_lifecycle() {
    let workspace = temp_dir("bulletind-certs");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "issue-1",
        "certificates.issue",
        json!({ "studentId": "sa", "kind": "enrollment", "body": "Enrolled in 4e A for 2025-2026." }),
    );
    let first = first.get("certificate").expect("certificate");
    assert_eq!(first.get("number").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(first.get("status").and_then(|v| v.as_str()), Some("draft"));
    let first_id = first.get("id").and_then(|v| v.as_str()).expect("id").to_string();

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "issue-2",
        "certificates.issue",
        json!({ "studentId": "sb", "kind": "enrollment", "body": "Enrolled in 4e A for 2025-2026." }),
    );
    assert_eq!(
        second
            .get("certificate")
            .and_then(|c| c.get("number"))
            .and_then(|v| v.as_i64()),
        Some(2)
    );

    // Attendance numbering is independent of enrollment numbering.
    let attendance = request_ok(
        &mut stdin,
        &mut reader,
        "issue-3",
        "certificates.issue",
        json!({ "studentId": "sa", "kind": "attendance", "body": "Attended all sessions." }),
    );
    assert_eq!(
        attendance
            .get("certificate")
            .and_then(|c| c.get("number"))
            .and_then(|v| v.as_i64()),
        Some(1)
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "doc-draft",
        "certificates.attachDocument",
        json!({ "certificateId": first_id, "path": "out/cert-1.pdf" }),
    );
    assert_eq!(code, "not_validated");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "val",
        "certificates.validate",
        json!({ "certificateId": first_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "val-again",
        "certificates.validate",
        json!({ "certificateId": first_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "doc",
        "certificates.attachDocument",
        json!({ "certificateId": first_id, "path": "out/cert-1.pdf" }),
    );

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "certificates.get",
        json!({ "certificateId": first_id }),
    );
    let fetched = fetched.get("certificate").expect("certificate");
    assert_eq!(fetched.get("status").and_then(|v| v.as_str()), Some("validated"));
    assert_eq!(
        fetched.get("signedDocumentPath").and_then(|v| v.as_str()),
        Some("out/cert-1.pdf")
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "bad-kind",
        "certificates.issue",
        json!({ "studentId": "sa", "kind": "diploma", "body": "..." }),
    );
    assert_eq!(code, "bad_params");

    let _ = child.kill();
}
