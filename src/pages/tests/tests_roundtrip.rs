use tempfile::TempDir;

use crate::model::{Triple, TripleOrder};
use crate::pages::{Compression, PagedIndexReader, PagedIndexWriter};

fn triples_for_subject(s: u32, count: u32) -> Vec<Triple> {
    (0..count).map(|i| Triple::new(s, 1, 100 + i)).collect()
}

#[test]
fn write_then_read_by_primary() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SPO.idxpage");

    let mut writer = PagedIndexWriter::new(&path, TripleOrder::Spo, 1024, Compression::None);
    writer.push_all(triples_for_subject(1, 3));
    writer.push_all(triples_for_subject(2, 2));
    assert_eq!(writer.buffered(), 5);
    let metas = writer.finalize().unwrap();
    assert_eq!(metas.len(), 2);

    let reader = PagedIndexReader::new(&path, TripleOrder::Spo, metas, Compression::None);
    assert_eq!(reader.read(1).unwrap(), triples_for_subject(1, 3));
    assert_eq!(reader.read(2).unwrap(), triples_for_subject(2, 2));
    assert!(reader.read(99).unwrap().is_empty());
    assert_eq!(reader.read_all().unwrap().len(), 5);
    assert_eq!(reader.primary_values(), vec![1, 2]);
}

#[test]
fn page_size_splits_groups() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SPO.idxpage");

    let mut writer = PagedIndexWriter::new(&path, TripleOrder::Spo, 2, Compression::None);
    writer.push_all(triples_for_subject(1, 5));
    let metas = writer.finalize().unwrap();

    // 5 triples at page_size 2 → 2 sealed pages + 1 remainder page.
    assert_eq!(metas.len(), 3);
    assert!(metas.iter().all(|m| m.primary_value == 1));

    let reader = PagedIndexReader::new(&path, TripleOrder::Spo, metas, Compression::None);
    assert_eq!(reader.read(1).unwrap().len(), 5);
}

#[test]
fn metas_describe_contiguous_bytes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("POS.idxpage");

    let mut writer = PagedIndexWriter::new(&path, TripleOrder::Pos, 2, Compression::None);
    writer.push_all(vec![
        Triple::new(1, 7, 10),
        Triple::new(2, 7, 11),
        Triple::new(3, 8, 12),
    ]);
    let metas = writer.finalize().unwrap();

    let mut expected_offset = 0;
    for meta in &metas {
        assert_eq!(meta.offset, expected_offset);
        assert!(meta.crc32.is_some());
        assert!(meta.raw_length.is_none());
        expected_offset += meta.length;
    }
    assert_eq!(expected_offset, std::fs::metadata(&path).unwrap().len());
}

#[test]
fn second_finalize_appends_after_existing_pages() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SPO.idxpage");

    let mut writer = PagedIndexWriter::new(&path, TripleOrder::Spo, 1024, Compression::None);
    writer.push_all(triples_for_subject(1, 2));
    let mut metas = writer.finalize().unwrap();

    let mut writer = PagedIndexWriter::new(&path, TripleOrder::Spo, 1024, Compression::None);
    writer.push_all(triples_for_subject(1, 2));
    let second = writer.finalize().unwrap();
    assert_eq!(second[0].offset, metas[0].length);
    metas.extend(second);

    // A primary split across appends merges at read time.
    let reader = PagedIndexReader::new(&path, TripleOrder::Spo, metas, Compression::None);
    assert_eq!(reader.read(1).unwrap().len(), 4);
}

#[test]
fn empty_writer_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SPO.idxpage");

    let writer = PagedIndexWriter::new(&path, TripleOrder::Spo, 1024, Compression::None);
    assert!(writer.finalize().unwrap().is_empty());
    assert!(!path.exists());
}

#[test]
fn pages_are_sorted_by_projection() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("OSP.idxpage");

    let mut writer = PagedIndexWriter::new(&path, TripleOrder::Osp, 1024, Compression::None);
    writer.push_all(vec![
        Triple::new(3, 9, 50),
        Triple::new(1, 8, 50),
        Triple::new(2, 7, 50),
    ]);
    let metas = writer.finalize().unwrap();

    let reader = PagedIndexReader::new(&path, TripleOrder::Osp, metas, Compression::None);
    let triples = reader.read(50).unwrap();
    for pair in triples.windows(2) {
        assert!(TripleOrder::Osp.cmp_triples(&pair[0], &pair[1]).is_lt());
    }
}

#[test]
fn brotli_roundtrip_records_raw_length() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SPO.idxpage");
    let compression = Compression::Brotli { level: Some(5) };

    let triples = triples_for_subject(1, 200);
    let mut writer = PagedIndexWriter::new(&path, TripleOrder::Spo, 1024, compression);
    writer.push_all(triples.clone());
    let metas = writer.finalize().unwrap();

    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].raw_length, Some((200 * 12) as u64));
    // 200 near-identical records compress well.
    assert!(metas[0].length < metas[0].raw_length.unwrap());

    let reader = PagedIndexReader::new(&path, TripleOrder::Spo, metas, compression);
    assert_eq!(reader.read(1).unwrap(), triples);
}

#[test]
fn compression_config_serializes_per_manifest_schema() {
    let json = serde_json::to_string(&Compression::None).unwrap();
    assert_eq!(json, r#"{"codec":"none"}"#);

    let json = serde_json::to_string(&Compression::Brotli { level: Some(7) }).unwrap();
    assert_eq!(json, r#"{"codec":"brotli","level":7}"#);

    let parsed: Compression = serde_json::from_str(r#"{"codec":"brotli"}"#).unwrap();
    assert_eq!(parsed, Compression::Brotli { level: None });
}
