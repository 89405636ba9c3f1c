use tempfile::TempDir;

use crate::model::{Triple, TripleOrder};
use crate::pages::{Compression, PagedIndexReader, PagedIndexWriter};

fn build_reader(dir: &TempDir, page_size: usize) -> PagedIndexReader {
    let path = dir.path().join("SPO.idxpage");
    let mut writer = PagedIndexWriter::new(&path, TripleOrder::Spo, page_size, Compression::None);
    for s in 1..=3u32 {
        for o in 0..4u32 {
            writer.push(Triple::new(s, 1, 100 + o));
        }
    }
    let metas = writer.finalize().unwrap();
    PagedIndexReader::new(&path, TripleOrder::Spo, metas, Compression::None)
}

#[test]
fn stream_all_matches_read_all() {
    let dir = TempDir::new().unwrap();
    let reader = build_reader(&dir, 2);

    let mut streamed: Vec<Triple> = reader.stream_all().collect();
    let mut direct = reader.read_all().unwrap();
    streamed.sort();
    direct.sort();
    assert_eq!(streamed, direct);
    assert_eq!(streamed.len(), 12);
}

#[test]
fn stream_batches_group_by_page() {
    let dir = TempDir::new().unwrap();
    let reader = build_reader(&dir, 2);

    for batch in reader.stream_batches() {
        let batch = batch.unwrap();
        assert!(batch.triples.len() <= 2);
        assert!(batch.triples.iter().all(|t| t.s == batch.primary_value));
    }
}

#[test]
fn stream_by_primary_filters() {
    let dir = TempDir::new().unwrap();
    let reader = build_reader(&dir, 2);

    let triples: Vec<Triple> = reader.stream_by_primary(2).collect();
    assert_eq!(triples.len(), 4);
    assert!(triples.iter().all(|t| t.s == 2));
}

#[test]
fn dropping_a_stream_early_terminates_the_producer() {
    let dir = TempDir::new().unwrap();
    let reader = build_reader(&dir, 1);

    let mut stream = reader.stream_all();
    let first = stream.next();
    assert!(first.is_some());
    drop(stream);
    // Nothing to assert beyond "no deadlock": the producer's next send
    // fails and its thread exits.
}

#[test]
fn empty_order_streams_nothing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SPO.idxpage");
    let reader =
        PagedIndexReader::new(&path, TripleOrder::Spo, Vec::new(), Compression::None);

    assert_eq!(reader.stream_all().count(), 0);
    assert_eq!(reader.stream_batches().count(), 0);
}
