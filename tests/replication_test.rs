//! Primary/secondary replication through the change feed: a secondary that
//! applies every shipped batch ends up logically identical to the primary.

mod common;

use cdxdb::{
    load_cdx, parse_change_feed, render_change_feed, BadLines, Canonicalizer, Error, Index, SeqNo,
    DEFAULT_FEED_SIZE,
};

use common::{cdx_line, ingest, init_tracing, temp_index};

/// Drains the primary's feed into the secondary via the wire format,
/// checkpointing as a real poll loop would. Returns the last applied
/// sequence number.
fn replicate(primary: &Index, secondary: &Index, mut checkpoint: SeqNo) -> SeqNo {
    loop {
        let mut cursor = primary.get_updates_since(checkpoint).expect("open cursor");
        let body = render_change_feed(&mut cursor, DEFAULT_FEED_SIZE).expect("render feed");
        let entries = parse_change_feed(&body).expect("parse feed");
        if entries.is_empty() {
            return checkpoint;
        }
        for entry in entries {
            secondary
                .apply_raw_batch(entry.seq, &entry.batch)
                .expect("apply batch");
            checkpoint = entry.seq;
        }
    }
}

fn dump(index: &Index) -> Vec<String> {
    index
        .captures_after("")
        .expect("scan")
        .map(|c| {
            let c = c.expect("capture");
            format!("{} {} {} {}", c.urlkey, c.timestamp, c.filename, c.offset)
        })
        .collect()
}

#[test]
fn secondary_converges_on_primary_contents() {
    init_tracing();
    let (_p, primary) = temp_index("primary");
    let (_s, secondary) = temp_index("secondary");

    // 1000 records across several batches, plus an alias and a delete
    let lines: Vec<String> = (0..1000)
        .map(|i| {
            cdx_line(
                &format!("http://example.com/page/{i}"),
                20200101000000 + (i % 97) as u64,
                &format!("D{i}"),
                i as u64 * 10,
            )
        })
        .collect();
    for chunk in lines.chunks(250) {
        ingest(&primary, chunk);
    }
    ingest(
        &primary,
        &["@alias http://mirror.example.org/ http://example.com/".to_string()],
    );

    let applied = replicate(&primary, &secondary, SeqNo::ZERO);
    assert_eq!(applied, primary.latest_sequence_number().unwrap());

    assert_eq!(dump(&secondary), dump(&primary));
    assert_eq!(
        secondary.resolve_alias("org,example,mirror)/").unwrap().as_deref(),
        Some("com,example)/"),
        "aliases replicate too"
    );
}

#[test]
fn replication_resumes_from_checkpoint() {
    init_tracing();
    let (_p, primary) = temp_index("primary");
    let (_s, secondary) = temp_index("secondary");

    ingest(&primary, &[cdx_line("http://example.com/1", 1, "D1", 10)]);
    let checkpoint = replicate(&primary, &secondary, SeqNo::ZERO);

    ingest(&primary, &[cdx_line("http://example.com/2", 2, "D2", 20)]);
    ingest(&primary, &[cdx_line("http://example.com/3", 3, "D3", 30)]);
    replicate(&primary, &secondary, checkpoint);

    assert_eq!(dump(&secondary), dump(&primary));
}

#[test]
fn feed_pages_respect_size_budget_with_forward_progress() {
    init_tracing();
    let (_p, primary) = temp_index("primary");
    for i in 0..5 {
        ingest(
            &primary,
            &[cdx_line(&format!("http://example.com/{i}"), i, &format!("D{i}"), i)],
        );
    }

    // a tiny budget forces one entry per page, never zero
    let mut pages = 0;
    let mut checkpoint = SeqNo::ZERO;
    loop {
        let mut cursor = primary.get_updates_since(checkpoint).unwrap();
        let body = render_change_feed(&mut cursor, 1).unwrap();
        let entries = parse_change_feed(&body).unwrap();
        if entries.is_empty() {
            break;
        }
        assert_eq!(entries.len(), 1, "minimal budget still makes progress");
        checkpoint = entries.last().unwrap().seq;
        pages += 1;
    }
    assert_eq!(pages, 5);
}

#[test]
fn truncated_log_is_reported_not_papered_over() {
    init_tracing();
    let (_p, primary) = temp_index("primary");
    ingest(&primary, &[cdx_line("http://example.com/1", 1, "D1", 10)]);
    ingest(&primary, &[cdx_line("http://example.com/2", 2, "D2", 20)]);

    primary.flush_wal().unwrap();
    ingest(&primary, &[cdx_line("http://example.com/3", 3, "D3", 30)]);

    match primary.get_updates_since(SeqNo::ZERO) {
        Err(Error::SequenceTruncated { requested, oldest }) => {
            assert_eq!(requested, 0);
            assert_eq!(oldest, 3);
        }
        other => panic!("expected SequenceTruncated, got {other:?}"),
    }

    // a caught-up secondary can still follow
    assert_eq!(
        primary
            .get_updates_since(SeqNo::from_raw(2))
            .unwrap()
            .count(),
        1
    );
}

#[test]
fn secondary_mode_refuses_client_writes_but_applies_batches() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let secondary = Index::open("ro", &dir.path().join("ro.db"), false).unwrap();

    let err = load_cdx(
        &secondary,
        &Canonicalizer::default(),
        &cdx_line("http://example.com/", 1, "D", 0),
        BadLines::Error,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));
    assert!(err.to_string().contains("secondary"));

    // but the replication path works
    let (_p, primary) = temp_index("primary");
    ingest(&primary, &[cdx_line("http://example.com/", 1, "D", 0)]);
    replicate(&primary, &secondary, SeqNo::ZERO);
    assert_eq!(secondary.estimated_record_count().unwrap(), 1);
}

#[test]
fn sequence_numbers_survive_reopen() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("p.db");

    let before;
    {
        let index = Index::open("p", &path, true).unwrap();
        ingest(&index, &[cdx_line("http://example.com/", 1, "D", 0)]);
        before = index.latest_sequence_number().unwrap();
    }
    let reopened = Index::open("p", &path, true).unwrap();
    assert_eq!(reopened.latest_sequence_number().unwrap(), before);

    ingest(&reopened, &[cdx_line("http://example.com/2", 2, "D2", 1)]);
    assert!(reopened.latest_sequence_number().unwrap() > before);
}
