use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use juridoc::walk::bytes_hash;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

fn juridoc_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("juridoc");
    path
}

struct TestEnv {
    _tmp: TempDir,
    root: PathBuf,
    config: PathBuf,
}

impl TestEnv {
    fn sources(&self) -> PathBuf {
        self.root.join("sources")
    }

    fn notes(&self) -> PathBuf {
        self.root.join("notes")
    }

    fn out(&self) -> PathBuf {
        self.root.join("out")
    }

    fn run(&self, args: &[&str]) -> (String, String, bool) {
        let binary = juridoc_binary();
        let output = Command::new(&binary)
            .arg("--config")
            .arg(self.config.to_str().unwrap())
            .arg("--progress")
            .arg("off")
            .args(args)
            .output()
            .unwrap_or_else(|e| panic!("Failed to run juridoc binary at {:?}: {}", binary, e));

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        (stdout, stderr, output.status.success())
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let (stdout, stderr, success) = self.run(args);
        assert!(
            success,
            "juridoc {:?} failed: stdout={}, stderr={}",
            args, stdout, stderr
        );
        stdout
    }
}

fn setup_test_env() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::create_dir_all(root.join("sources/exhibits")).unwrap();
    fs::create_dir_all(root.join("notes")).unwrap();

    fs::write(root.join("sources/a.pdf"), b"alpha exhibit").unwrap();
    fs::write(root.join("sources/exhibits/b.pdf"), b"bravo exhibit").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/juridoc.sqlite"

[output]
dir = "{root}/out"

[scan]
exclude_globs = ["**/.~lock*"]

[preview]
enabled = false
"#,
        root = root.display()
    );
    let config = root.join("config/juridoc.toml");
    fs::write(&config, config_content).unwrap();

    TestEnv {
        _tmp: tmp,
        root,
        config,
    }
}

fn odt_with_body(body: &str) -> Vec<u8> {
    let content = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<office:document-content "#,
            r#"xmlns:office="urn:oasis:names:tc:opendocument:xmlns:office:1.0" "#,
            r#"xmlns:text="urn:oasis:names:tc:opendocument:xmlns:text:1.0" "#,
            r#"xmlns:xlink="http://www.w3.org/1999/xlink" office:version="1.2">"#,
            r#"<office:body><office:text>{}</office:text></office:body>"#,
            r#"</office:document-content>"#
        ),
        body
    );

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file("mimetype", stored).unwrap();
    zip.write_all(b"application/vnd.oasis.opendocument.text")
        .unwrap();
    zip.start_file("content.xml", deflated).unwrap();
    zip.write_all(content.as_bytes()).unwrap();
    zip.finish().unwrap().into_inner()
}

fn link(hash: &str, text: &str) -> String {
    format!(
        r#"<text:p>See <text:a xlink:type="simple" xlink:href="src:{}">{}</text:a>.</text:p>"#,
        hash, text
    )
}

fn content_xml(path: &Path) -> String {
    let bytes = fs::read(path).unwrap();
    let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
    let mut content = String::new();
    archive
        .by_name("content.xml")
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    content
}

fn read_index(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers = reader.headers().unwrap().iter().map(String::from).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect();
    (headers, rows)
}

fn cell<'a>(headers: &[String], row: &'a [String], column: &str) -> &'a str {
    let i = headers.iter().position(|h| h == column).unwrap();
    &row[i]
}

fn row_by_uri<'a>(headers: &[String], rows: &'a [Vec<String>], uri: &str) -> &'a [String] {
    rows.iter()
        .find(|row| cell(headers, row, "uri") == uri)
        .unwrap_or_else(|| panic!("no row for {}", uri))
}

/// Both roots selected, with one note citing `a.pdf` and a source that
/// does not exist.
fn configured_env() -> TestEnv {
    let env = setup_test_env();
    let h1 = bytes_hash(b"alpha exhibit");
    let h3 = bytes_hash(b"charlie exhibit");
    fs::write(
        env.notes().join("note.odt"),
        odt_with_body(&format!("{}{}", link(&h1, "exhibit A"), link(&h3, "exhibit C"))),
    )
    .unwrap();
    fs::write(env.notes().join("plain.txt"), "no links here").unwrap();

    env.run_ok(&["init"]);
    env.run_ok(&[
        "roots",
        "--sources",
        env.sources().to_str().unwrap(),
        "--notes",
        env.notes().to_str().unwrap(),
    ]);
    env
}

#[test]
fn test_init_creates_database() {
    let env = setup_test_env();

    let stdout = env.run_ok(&["init"]);
    assert!(stdout.contains("initialized"));
    assert!(env.root.join("data/juridoc.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let env = setup_test_env();

    env.run_ok(&["init"]);
    env.run_ok(&["init"]);
}

#[test]
fn test_sync_without_roots_fails() {
    let env = setup_test_env();
    env.run_ok(&["init"]);

    let (_, stderr, success) = env.run(&["sync", "sources"]);
    assert!(!success);
    assert!(stderr.contains("sources_root is not configured"), "stderr={}", stderr);
}

#[test]
fn test_roots_rejects_missing_directory() {
    let env = setup_test_env();
    env.run_ok(&["init"]);

    let missing = env.root.join("nowhere");
    let (_, _, success) = env.run(&["roots", "--sources", missing.to_str().unwrap()]);
    assert!(!success);
}

#[test]
fn test_sync_all_records_sources_and_xrefs() {
    let env = configured_env();

    let stdout = env.run_ok(&["sync", "all"]);
    assert!(stdout.contains("sync sources"));
    assert!(stdout.contains("added: 2"));
    assert!(stdout.contains("notes: 2"));
    assert!(stdout.contains("documents: 1"));
    assert!(stdout.contains("cross-references: 1"));
    assert!(stdout.contains("unresolved links: 1"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_sync_idempotent() {
    let env = configured_env();
    env.run_ok(&["sync", "sources"]);

    let stdout = env.run_ok(&["sync", "sources"]);
    assert!(stdout.contains("added: 0"));
    assert!(stdout.contains("renamed: 0"));
    assert!(stdout.contains("removed: 0"));
}

#[test]
fn test_export_all_writes_index_sources_and_notes() {
    let env = configured_env();
    env.run_ok(&["sync", "all"]);

    let stdout = env.run_ok(&["export", "all"]);
    assert!(stdout.contains("export all"));
    assert!(stdout.contains("sources copied: 1"));
    assert!(stdout.contains("sources filtered: 1"));
    assert!(stdout.contains("notes rendered: 1"));
    assert!(stdout.contains("notes copied: 1"));

    let (headers, rows) = read_index(&env.out().join("index.csv"));
    assert_eq!(headers, vec!["idx", "uri", "source", "dest", "xref"]);
    assert_eq!(rows.len(), 2);

    let h1 = bytes_hash(b"alpha exhibit");
    let h2 = bytes_hash(b"bravo exhibit");
    let a = row_by_uri(&headers, &rows, &h1);
    let b = row_by_uri(&headers, &rows, &h2);
    assert_eq!(cell(&headers, a, "source"), "a.pdf");
    assert_eq!(cell(&headers, a, "xref"), "true");
    assert_eq!(cell(&headers, b, "source"), "exhibits/b.pdf");
    assert_eq!(cell(&headers, b, "xref"), "false");

    let idx_a = cell(&headers, a, "idx").to_string();
    let dest_a = cell(&headers, a, "dest");
    assert_eq!(dest_a, format!("{:03} - a.pdf", idx_a.parse::<u64>().unwrap()));
    assert_eq!(
        fs::read(env.out().join("sources").join(dest_a)).unwrap(),
        b"alpha exhibit"
    );
    // Only cited sources are copied by `export all`.
    let dest_b = cell(&headers, b, "dest");
    assert!(!env.out().join("sources").join(dest_b).exists());

    let rendered = content_xml(&env.out().join("notes/note.odt"));
    assert!(rendered.contains(&format!(">{}</text:a>", idx_a)));
    assert!(!rendered.contains("exhibit A"));
    assert!(rendered.contains("exhibit C"));
    assert_eq!(
        fs::read_to_string(env.out().join("notes/plain.txt")).unwrap(),
        "no links here"
    );
}

#[test]
fn test_rename_keeps_idx_and_manual_edits() {
    let env = configured_env();
    env.run_ok(&["sync", "all"]);
    env.run_ok(&["export", "index"]);

    let index = env.out().join("index.csv");
    let h1 = bytes_hash(b"alpha exhibit");
    let (headers, rows) = read_index(&index);
    let idx_a = cell(&headers, row_by_uri(&headers, &rows, &h1), "idx").to_string();

    // A hand-added column and a hand-edited dest must survive re-export.
    let mut writer = csv::Writer::from_path(&index).unwrap();
    let mut with_comment = headers.clone();
    with_comment.push("comment".to_string());
    writer.write_record(&with_comment).unwrap();
    for row in &rows {
        let mut row = row.clone();
        if cell(&headers, &row, "uri") == h1 {
            let dest = headers.iter().position(|h| h == "dest").unwrap();
            row[dest] = "annexes/A1 - contract.pdf".to_string();
            row.push("signed copy".to_string());
        } else {
            row.push(String::new());
        }
        writer.write_record(&row).unwrap();
    }
    writer.flush().unwrap();
    drop(writer);

    fs::rename(env.sources().join("a.pdf"), env.sources().join("contract.pdf")).unwrap();
    let stdout = env.run_ok(&["sync", "sources"]);
    assert!(stdout.contains("renamed: 1"));
    assert!(stdout.contains("added: 0"));

    env.run_ok(&["export", "index"]);
    let (headers, rows) = read_index(&index);
    assert_eq!(rows.len(), 2);
    assert_eq!(headers.last().map(String::as_str), Some("comment"));
    let a = row_by_uri(&headers, &rows, &h1);
    assert_eq!(cell(&headers, a, "idx"), idx_a);
    assert_eq!(cell(&headers, a, "dest"), "annexes/A1 - contract.pdf");
    assert_eq!(cell(&headers, a, "comment"), "signed copy");

    env.run_ok(&["export", "sources", "--xref-only"]);
    assert!(env.out().join("sources/annexes/A1 - contract.pdf").exists());
}

#[test]
fn test_new_source_gets_next_idx() {
    let env = configured_env();
    env.run_ok(&["sync", "sources"]);
    env.run_ok(&["export", "index"]);

    fs::write(env.sources().join("c.pdf"), b"charlie exhibit").unwrap();
    let stdout = env.run_ok(&["sync", "all"]);
    assert!(stdout.contains("added: 1"));
    // The note's second link now resolves.
    assert!(stdout.contains("cross-references: 2"));
    assert!(stdout.contains("unresolved links: 0"));

    env.run_ok(&["export", "index"]);
    let (headers, rows) = read_index(&env.out().join("index.csv"));
    assert_eq!(rows.len(), 3);
    let idxs: Vec<u64> = rows
        .iter()
        .map(|row| cell(&headers, row, "idx").parse().unwrap())
        .collect();
    let mut sorted = idxs.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted, idxs, "idx values are unique and ascending");

    let c = row_by_uri(&headers, &rows, &bytes_hash(b"charlie exhibit"));
    assert_eq!(cell(&headers, c, "xref"), "true");
}

#[test]
fn test_duplicate_content_aborts_sync() {
    let env = configured_env();
    fs::write(env.sources().join("copy.pdf"), b"alpha exhibit").unwrap();

    let (_, stderr, success) = env.run(&["sync", "sources"]);
    assert!(!success);
    assert!(stderr.contains("duplicate content"), "stderr={}", stderr);

    let stdout = env.run_ok(&["status"]);
    assert!(stdout.contains("Sources:     0"));
}

#[test]
fn test_deleted_source_drops_from_index() {
    let env = configured_env();
    env.run_ok(&["sync", "all"]);

    fs::remove_file(env.sources().join("exhibits/b.pdf")).unwrap();
    let stdout = env.run_ok(&["sync", "sources"]);
    assert!(stdout.contains("removed: 1"));

    env.run_ok(&["export", "index"]);
    let (_, rows) = read_index(&env.out().join("index.csv"));
    assert_eq!(rows.len(), 1);
}

#[test]
fn test_status_reports_counts() {
    let env = configured_env();
    env.run_ok(&["sync", "all"]);

    let stdout = env.run_ok(&["status"]);
    assert!(stdout.contains("juridoc status"));
    assert!(stdout.contains("Sources:     2"));
    assert!(stdout.contains("Referenced:  1 / 2 (50%)"));
    assert!(stdout.contains("Notes:       2"));
    assert!(stdout.contains("Xrefs:       1"));
}

#[test]
fn test_notes_export_requires_notes_root() {
    let env = setup_test_env();
    env.run_ok(&["init"]);
    env.run_ok(&["roots", "--sources", env.sources().to_str().unwrap()]);
    env.run_ok(&["sync", "sources"]);

    let (_, stderr, success) = env.run(&["export", "notes"]);
    assert!(!success);
    assert!(stderr.contains("notes_root is not configured"), "stderr={}", stderr);
}

#[test]
fn test_config_get_set_list() {
    let env = setup_test_env();
    env.run_ok(&["init"]);

    env.run_ok(&["config", "set", "case", "2024-117"]);
    assert_eq!(env.run_ok(&["config", "get", "case"]).trim(), "2024-117");
    assert!(env.run_ok(&["config", "list"]).contains("case = 2024-117"));

    let (_, _, success) = env.run(&["config", "get", "missing"]);
    assert!(!success);
}

#[test]
fn test_config_set_root_is_canonicalized() {
    let env = setup_test_env();
    env.run_ok(&["init"]);

    let roundabout = env.root.join("sources/exhibits/..");
    env.run_ok(&["config", "set", "sources_root", roundabout.to_str().unwrap()]);
    assert_eq!(
        env.run_ok(&["config", "get", "sources_root"]).trim(),
        env.sources().to_str().unwrap()
    );

    let missing = env.root.join("nowhere");
    let (_, _, success) = env.run(&["config", "set", "notes_root", missing.to_str().unwrap()]);
    assert!(!success);
    let (_, _, success) = env.run(&["config", "get", "notes_root"]);
    assert!(!success);
}
