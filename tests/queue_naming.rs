//! Filesystem-backed checks for invariants 6 (filename parseability) and 7
//! (unique-crash subset) from spec.md §8, exercised against the real
//! `InputCorpus` filesystem writes rather than just the naming helper.

use manul::corpus::InputCorpus;

fn parse_manul_name(name: &str) -> Option<(u64, usize, u64, &str)> {
    let rest = name.strip_prefix("manul-")?;
    let mut parts = rest.splitn(4, ['-', '_']);
    let ts: u64 = parts.next()?.parse().ok()?;
    let worker: usize = parts.next()?.parse().ok()?;
    let execs: u64 = parts.next()?.parse().ok()?;
    let original = parts.next().unwrap_or("");
    Some((ts, worker, execs, original))
}

#[test]
fn discovered_entries_get_parseable_names_without_double_prefixing() {
    let tmp = tempfile::tempdir().unwrap();
    let queue_dir = tmp.path().join("queue");
    std::fs::create_dir_all(&queue_dir).unwrap();
    let mut corpus = InputCorpus::new(&queue_dir);

    let idx = corpus.add_interesting(3, 42, Some("seed.bin"), b"payload-one".to_vec()).unwrap();
    let first_name = corpus.get(idx).path.file_name().unwrap().to_str().unwrap().to_string();

    let (_, worker, execs, original) = parse_manul_name(&first_name).expect("name should parse");
    assert_eq!(worker, 3);
    assert_eq!(execs, 42);
    assert_eq!(original, "seed.bin");
    assert!(!original.starts_with("manul-"));

    // Re-mutating an already-queued entry must not pile up prefixes.
    let idx2 = corpus.add_interesting(3, 99, Some(first_name.as_str()), b"payload-two".to_vec()).unwrap();
    let second_name = corpus.get(idx2).path.file_name().unwrap().to_str().unwrap().to_string();
    let (_, _, _, original2) = parse_manul_name(&second_name).expect("second name should parse too");
    assert_eq!(original2, "seed.bin");
    assert!(!original2.starts_with("manul-"));
}

#[test]
fn add_interesting_writes_the_file_it_names() {
    let tmp = tempfile::tempdir().unwrap();
    let queue_dir = tmp.path().join("queue");
    std::fs::create_dir_all(&queue_dir).unwrap();
    let mut corpus = InputCorpus::new(&queue_dir);

    let idx = corpus.add_interesting(0, 1, None, b"hello".to_vec()).unwrap();
    let path = corpus.get(idx).path.clone();
    assert_eq!(std::fs::read(&path).unwrap(), b"hello");
}
