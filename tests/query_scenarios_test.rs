//! End-to-end query scenarios: ingest through the CDX write path, query
//! through the executor, assert on result order and content.

mod common;

use cdxdb::{
    render_cdx, render_json, Canonicalizer, Config, ParamMap, QueryExecutor,
};

use common::{cdx_line, ingest, run_query, temp_index};

fn render_cdx_for(index: &cdxdb::Index, pairs: &[(&str, &str)]) -> String {
    let config = Config::default();
    let canonicalizer = Canonicalizer::default();
    let executor = QueryExecutor::new(index, &canonicalizer, &config, &[]);
    let mut outcome = executor
        .execute(&ParamMap::from_pairs(pairs.iter().copied()))
        .unwrap();
    render_cdx(&mut outcome).unwrap()
}

#[test]
fn exact_query_returns_captures_in_timestamp_order() {
    let (_dir, index) = temp_index("exact");
    ingest(
        &index,
        &[
            cdx_line("http://example.com/", 20200102000000, "D2", 200),
            cdx_line("http://example.com/", 20200101000000, "D1", 100),
            cdx_line("http://example.com/", 20200103000000, "D3", 300),
        ],
    );

    let results = run_query(
        &index,
        &Config::default(),
        &[("url", "http://example.com/")],
    );
    assert_eq!(
        results.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
        vec![20200101000000, 20200102000000, 20200103000000]
    );
}

#[test]
fn exact_query_does_not_leak_key_extensions() {
    let (_dir, index) = temp_index("exact-strict");
    ingest(
        &index,
        &[
            cdx_line("http://example.com/a", 20200101000000, "D1", 100),
            cdx_line("http://example.com/ab", 20200101000000, "D2", 200),
        ],
    );

    let results = run_query(
        &index,
        &Config::default(),
        &[("url", "http://example.com/a")],
    );
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, "com,example)/a");
}

#[test]
fn prefix_query_stays_within_prefix() {
    let (_dir, index) = temp_index("prefix");
    ingest(
        &index,
        &[
            cdx_line("http://example.com/a", 20200101000000, "D1", 100),
            cdx_line("http://example.com/b", 20200101000000, "D2", 200),
            cdx_line("http://other.com/a", 20200101000000, "D3", 300),
        ],
    );

    let results = run_query(
        &index,
        &Config::default(),
        &[("url", "http://example.com/*"), ("matchType", "prefix")],
    );
    assert_eq!(
        results.iter().map(|(_, k)| k.as_str()).collect::<Vec<_>>(),
        vec!["com,example)/a", "com,example)/b"]
    );
}

#[test]
fn host_and_domain_match_types() {
    let (_dir, index) = temp_index("domain");
    ingest(
        &index,
        &[
            cdx_line("http://example.com/", 20200101000000, "D1", 100),
            cdx_line("http://sub.example.com/x", 20200101000000, "D2", 200),
            // a sibling registered domain that shares the byte prefix
            cdx_line("http://examplez.com/", 20200101000000, "D3", 300),
        ],
    );

    let host = run_query(
        &index,
        &Config::default(),
        &[("url", "http://example.com/"), ("matchType", "host")],
    );
    assert_eq!(
        host.iter().map(|(_, k)| k.as_str()).collect::<Vec<_>>(),
        vec!["com,example)/"]
    );

    let domain = run_query(&index, &Config::default(), &[("url", "*.example.com")]);
    assert_eq!(
        domain.iter().map(|(_, k)| k.as_str()).collect::<Vec<_>>(),
        vec!["com,example)/", "com,example,sub)/x"],
        "domain match covers subdomains but not prefix siblings"
    );
}

#[test]
fn closest_sorts_by_distance_ties_to_earlier() {
    let (_dir, index) = temp_index("closest");
    ingest(
        &index,
        &[
            cdx_line("http://example.com/", 20200101000000, "D1", 100),
            cdx_line("http://example.com/", 20200102000000, "D2", 200),
            cdx_line("http://example.com/", 20200103000000, "D3", 300),
        ],
    );

    let results = run_query(
        &index,
        &Config::default(),
        &[
            ("url", "http://example.com/"),
            ("sort", "closest"),
            ("closest", "20200102120000"),
        ],
    );
    assert_eq!(
        results.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
        vec![20200102000000, 20200103000000, 20200101000000]
    );
}

#[test]
fn reverse_sort_walks_timestamps_downward() {
    let (_dir, index) = temp_index("reverse");
    ingest(
        &index,
        &[
            cdx_line("http://example.com/", 20200101000000, "D1", 100),
            cdx_line("http://example.com/", 20200102000000, "D2", 200),
        ],
    );

    let results = run_query(
        &index,
        &Config::default(),
        &[("url", "http://example.com/"), ("sort", "reverse")],
    );
    assert_eq!(
        results.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
        vec![20200102000000, 20200101000000]
    );
}

#[test]
fn collapse_to_last_keeps_final_capture_of_each_run() {
    let (_dir, index) = temp_index("collapse");
    ingest(
        &index,
        &[
            cdx_line("http://example.com/", 20200101000000, "d1", 1),
            cdx_line("http://example.com/", 20200102000000, "d1", 2),
            cdx_line("http://example.com/", 20200103000000, "d2", 3),
            cdx_line("http://example.com/", 20200104000000, "d2", 4),
            cdx_line("http://example.com/", 20200105000000, "d2", 5),
        ],
    );

    let results = run_query(
        &index,
        &Config::default(),
        &[("url", "http://example.com/"), ("collapseToLast", "digest")],
    );
    assert_eq!(
        results.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
        vec![20200102000000, 20200105000000],
        "captures #2 and #5 survive"
    );
}

#[test]
fn alias_query_returns_target_captures_unchanged() {
    let (_dir, index) = temp_index("alias");
    ingest(
        &index,
        &[
            "@alias http://legacy-mirror.org/ http://example.com/".to_string(),
            cdx_line("http://example.com/", 20200101000000, "D1", 100),
            cdx_line("http://example.com/", 20200102000000, "D2", 200),
        ],
    );

    let results = run_query(
        &index,
        &Config::default(),
        &[("url", "http://legacy-mirror.org/")],
    );
    assert_eq!(results.len(), 2);
    assert!(
        results.iter().all(|(_, k)| k == "com,example)/"),
        "target captures come back unchanged"
    );
}

#[test]
fn from_to_window_and_limit() {
    let (_dir, index) = temp_index("window");
    ingest(
        &index,
        &[
            cdx_line("http://example.com/", 20190101000000, "D0", 50),
            cdx_line("http://example.com/", 20200101000000, "D1", 100),
            cdx_line("http://example.com/", 20200601000000, "D2", 200),
            cdx_line("http://example.com/", 20210101000000, "D3", 300),
        ],
    );

    let results = run_query(
        &index,
        &Config::default(),
        &[("url", "http://example.com/"), ("from", "2020"), ("to", "2020")],
    );
    assert_eq!(
        results.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
        vec![20200101000000, 20200601000000]
    );

    let limited = run_query(
        &index,
        &Config::default(),
        &[("url", "http://example.com/"), ("limit", "2")],
    );
    assert_eq!(limited.len(), 2);
}

#[test]
fn filters_and_negation_compose() {
    let (_dir, index) = temp_index("filters");
    let mut lines = vec![
        cdx_line("http://example.com/a", 20200101000000, "D1", 100),
        cdx_line("http://example.com/b", 20200101000000, "D2", 200),
    ];
    // one 404 capture
    lines.push(
        format!("- 20200101000000 http://example.com/c text/html 404 D3 - - 100 300 test.warc.gz"),
    );
    ingest(&index, &lines);

    let ok_only = run_query(
        &index,
        &Config::default(),
        &[
            ("url", "http://example.com/*"),
            ("matchType", "prefix"),
            ("filter", "status:200"),
        ],
    );
    assert_eq!(ok_only.len(), 2);

    let not_b = run_query(
        &index,
        &Config::default(),
        &[
            ("url", "http://example.com/*"),
            ("matchType", "prefix"),
            ("filter", "status:200"),
            ("filter", "!urlkey:.*b"),
        ],
    );
    assert_eq!(not_b.len(), 1);
    assert_eq!(not_b[0].1, "com,example)/a");
}

#[test]
fn omit_self_redirects_drops_only_self_targets() {
    let (_dir, index) = temp_index("selfredir");
    ingest(
        &index,
        &[
            format!(
                "- 20200101000000 http://example.com/a text/html 301 D1 http://www.example.com/a - 100 100 test.warc.gz"
            ),
            format!(
                "- 20200102000000 http://example.com/a text/html 301 D2 http://example.com/b - 100 200 test.warc.gz"
            ),
        ],
    );

    let all = run_query(&index, &Config::default(), &[("url", "http://example.com/a")]);
    assert_eq!(all.len(), 2);

    let pruned = run_query(
        &index,
        &Config::default(),
        &[("url", "http://example.com/a"), ("omitSelfRedirects", "true")],
    );
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].0, 20200102000000);
}

#[test]
fn post_captures_collate_with_gets_but_stay_distinct() {
    let (_dir, index) = temp_index("post");
    ingest(
        &index,
        &[
            cdx_line("http://example.com/api", 20200101000000, "D1", 100),
            cdx_line(
                "http://example.com/api?__wb_method=POST&payload=1",
                20200101000000,
                "D2",
                200,
            ),
        ],
    );

    let get = run_query(&index, &Config::default(), &[("url", "http://example.com/api")]);
    assert_eq!(get.len(), 1);
    assert_eq!(get[0].1, "com,example)/api");

    let post = run_query(
        &index,
        &Config::default(),
        &[
            ("url", "http://example.com/api"),
            ("method", "POST"),
            ("requestBody", "payload=1"),
        ],
    );
    assert_eq!(post.len(), 1);
    assert_eq!(post[0].1, "com,example)/api?__wb_method=POST&payload=1");
}

#[test]
fn cdx_output_renders_fields_in_fl_order() {
    let (_dir, index) = temp_index("render");
    ingest(
        &index,
        &[cdx_line("http://example.com/", 20200101000000, "DIGEST", 100)],
    );

    let body = render_cdx_for(
        &index,
        &[("url", "http://example.com/"), ("fl", "timestamp,urlkey,digest")],
    );
    assert_eq!(body, "20200101000000 com,example)/ DIGEST\n");
}

#[test]
fn json_output_leads_with_field_header() {
    let (_dir, index) = temp_index("json");
    ingest(
        &index,
        &[cdx_line("http://example.com/", 20200101000000, "DIGEST", 100)],
    );

    let config = Config::default();
    let canonicalizer = Canonicalizer::default();
    let executor = QueryExecutor::new(&index, &canonicalizer, &config, &[]);
    let mut outcome = executor
        .execute(&ParamMap::from_pairs([
            ("url", "http://example.com/"),
            ("output", "json"),
            ("fl", "urlkey,timestamp"),
        ]))
        .unwrap();
    let body = render_json(&mut outcome).unwrap();

    let parsed: Vec<Vec<String>> = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed[0], vec!["urlkey", "timestamp"]);
    assert_eq!(parsed[1], vec!["com,example)/", "20200101000000"]);
}

#[test]
fn plus_workaround_retries_once_when_enabled() {
    let (_dir, index) = temp_index("plus");
    // the dataset wrote + where the client will ask with %20
    ingest(
        &index,
        &[cdx_line("http://example.com/a+b", 20200101000000, "D1", 100)],
    );

    let plain = run_query(
        &index,
        &Config::default(),
        &[("url", "http://example.com/a%20b")],
    );
    assert!(plain.is_empty(), "workaround off: no results");

    let mut config = Config::default();
    config.cdx_plus_workaround = true;
    let rescued = run_query(&index, &config, &[("url", "http://example.com/a%20b")]);
    assert_eq!(rescued.len(), 1);
    assert_eq!(rescued[0].1, "com,example)/a+b");
}
