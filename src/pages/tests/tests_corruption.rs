use tempfile::TempDir;

use crate::model::{Triple, TripleOrder};
use crate::pages::{Compression, PagedIndexReader, PagedIndexWriter};

fn build_two_pages(path: &std::path::Path) -> Vec<crate::pages::PageMeta> {
    let mut writer = PagedIndexWriter::new(path, TripleOrder::Spo, 2, Compression::None);
    writer.push_all(vec![
        Triple::new(1, 1, 10),
        Triple::new(1, 1, 11),
        Triple::new(2, 1, 20),
    ]);
    writer.finalize().unwrap()
}

#[test]
fn crc_mismatch_skips_only_the_damaged_page() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SPO.idxpage");
    let metas = build_two_pages(&path);

    // Flip a byte inside the first page.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[metas[0].offset as usize] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let reader = PagedIndexReader::new(&path, TripleOrder::Spo, metas, Compression::None);
    // The damaged primary reads empty, never a wrong value.
    assert!(reader.read(1).unwrap().is_empty());
    // The intact page still reads.
    assert_eq!(reader.read(2).unwrap(), vec![Triple::new(2, 1, 20)]);
    assert_eq!(reader.read_all().unwrap(), vec![Triple::new(2, 1, 20)]);
}

#[test]
fn check_pages_reports_exact_damage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SPO.idxpage");
    let metas = build_two_pages(&path);

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[metas[0].offset as usize + 3] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let reader =
        PagedIndexReader::new(&path, TripleOrder::Spo, metas.clone(), Compression::None);
    let damaged = reader.check_pages().unwrap();
    assert_eq!(damaged.len(), 1);
    assert_eq!(damaged[0], metas[0]);
}

#[test]
fn untouched_file_passes_strict_check() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SPO.idxpage");
    let metas = build_two_pages(&path);

    let reader = PagedIndexReader::new(&path, TripleOrder::Spo, metas, Compression::None);
    assert!(reader.check_pages().unwrap().is_empty());
}

#[test]
fn out_of_bounds_page_is_skipped_and_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SPO.idxpage");
    let mut metas = build_two_pages(&path);

    // Pretend a page extends past the end of the file.
    metas[1].offset = 1 << 20;

    let reader =
        PagedIndexReader::new(&path, TripleOrder::Spo, metas.clone(), Compression::None);
    assert!(reader.read(2).unwrap().is_empty());
    let damaged = reader.check_pages().unwrap();
    assert_eq!(damaged.len(), 1);
    assert_eq!(damaged[0].primary_value, 2);
}

#[test]
fn truncated_compressed_page_is_skipped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SPO.idxpage");
    let compression = Compression::Brotli { level: None };

    let mut writer = PagedIndexWriter::new(&path, TripleOrder::Spo, 1024, compression);
    writer.push_all((0..50).map(|i| Triple::new(1, 2, i)));
    let metas = writer.finalize().unwrap();

    // Zero the stored stream: CRC fails before decompression is tried.
    let mut bytes = std::fs::read(&path).unwrap();
    for b in &mut bytes {
        *b = 0;
    }
    std::fs::write(&path, &bytes).unwrap();

    let reader = PagedIndexReader::new(&path, TripleOrder::Spo, metas, compression);
    assert!(reader.read(1).unwrap().is_empty());
}
