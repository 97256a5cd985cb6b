//! State documents survive many sessions, archival and a re-read from disk.

use chrono::{Duration, TimeZone, Utc};
use orchestrator::io::config::LedgerConfig;
use orchestrator::io::ledger::{ChainOutput, Ledger, NewProgressEntry};

fn entry(n: u32) -> NewProgressEntry {
    NewProgressEntry {
        accomplishments: vec![format!("step {n} done")],
        issues: (n % 3 == 0).then(|| format!("flaky test in step {n}")),
        next_steps: format!("start step {}", n + 1),
    }
}

#[test]
fn archival_keeps_every_entry_exactly_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let limits = LedgerConfig {
        max_document_bytes: 1_000_000,
        max_entries: 4,
        retain_recent: 2,
    };
    let ledger = Ledger::new(temp.path(), limits);
    ledger.ensure("t1", "Checkout flow", Some("e1")).expect("ensure");

    let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("time");
    for n in 1..=11 {
        let at = start + Duration::hours(i64::from(n));
        let appended = ledger.append_session_at("t1", entry(n), at).expect("append");
        assert_eq!(appended.session_number, n);
    }

    let record = ledger.read("t1").expect("read").expect("record");
    let archived = ledger.read_archive("t1").expect("archive");
    assert!(record.progress_log.len() <= 4);
    assert!(record.progress_log.len() >= 2);

    let mut numbers: Vec<u32> = archived
        .iter()
        .chain(record.progress_log.iter())
        .map(|e| e.session_number)
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=11).collect::<Vec<_>>());

    let rollup = record.archive.as_ref().expect("rollup");
    assert_eq!(rollup.archived_sessions as usize, archived.len());
    assert_eq!(rollup.first_session, 1);
    assert_eq!(rollup.last_session, archived.last().expect("archived").session_number);
    assert!(rollup.highlights.len() <= 5);

    assert_eq!(record.metadata.session_count, 11);
    assert_eq!(record.metadata.first_session_at, Some(start + Duration::hours(1)));
    assert_eq!(record.metadata.last_session_at, Some(start + Duration::hours(11)));
    assert_eq!(record.epic_id.as_deref(), Some("e1"));
}

#[test]
fn byte_limit_triggers_archival() {
    let temp = tempfile::tempdir().expect("tempdir");
    let limits = LedgerConfig {
        max_document_bytes: 2_000,
        max_entries: 1_000,
        retain_recent: 1,
    };
    let ledger = Ledger::new(temp.path(), limits);
    ledger.ensure("t1", "Search", None).expect("ensure");

    for n in 1..=20 {
        let mut big = entry(n);
        big.next_steps = "x".repeat(200);
        ledger.append_session("t1", big).expect("append");
    }
    let record = ledger.read("t1").expect("read").expect("record");
    assert!(record.archive.is_some());
    assert!(!ledger.read_archive("t1").expect("archive").is_empty());
}

#[test]
fn chain_output_and_human_sections_round_trip() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ledger = Ledger::new(temp.path(), LedgerConfig::default());
    ledger.ensure("t1", "API client", None).expect("ensure");
    ledger.append_session("t1", entry(1)).expect("append");

    let output = ChainOutput {
        summary: "Client wraps the REST API".to_string(),
        files_created: Some(vec!["src/client.rs".to_string()]),
        api_contract: Some("Client::get(path) -> Result<Value>".to_string()),
        configuration: None,
        integration_notes: Some("Reads API_BASE from env".to_string()),
    };
    let written = ledger.set_chain_output("t1", output.clone()).expect("output");
    assert!(written.metadata.completed_at.is_some());

    let reread = ledger.read("t1").expect("read").expect("record");
    assert_eq!(reread, written);
    assert_eq!(reread.chain_output, Some(output));

    let raw = std::fs::read_to_string(ledger.state_path("t1")).expect("raw");
    assert!(raw.starts_with("<!-- task-state v1 -->"));
    assert!(raw.contains("step 1 done"));

    // A recorded output is never replaced by the synthesized default.
    assert!(!ledger.ensure_chain_output("t1", Vec::new()).expect("ensure output"));
}
