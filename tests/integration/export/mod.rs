use crate::integration::common::{self, Call, Failures, MockDriver, MockEntry};
use anyhow::Result;
use ociwclayer::backup_stream::{self, PAX_BLOCKS, PAX_FILE_ATTR};
use ociwclayer::{is_cancelled, CancelToken, LayerExporter, StreamBlock, StreamKind};
use std::path::{Path, PathBuf};
use tar_rs as tar;

const LAYER: &str = "/layers/l2";

fn parents() -> Vec<PathBuf> {
    vec![PathBuf::from("/layers/l0"), PathBuf::from("/layers/l1")]
}

fn export(driver: &MockDriver, cancel: &CancelToken) -> (Result<()>, Vec<u8>) {
    let exporter = LayerExporter::new(driver, common::quiet());
    let mut out = Vec::new();
    let result = exporter.export(cancel, &mut out, Path::new(LAYER), &parents());
    (result, out)
}

#[test]
fn test_export_file_and_deletion() -> Result<()> {
    let driver = MockDriver::new(vec![
        MockEntry::file("a.txt", b"hi"),
        MockEntry::deleted("b.txt"),
    ]);
    let (result, out) = export(&driver, &CancelToken::new());
    result?;

    let entries = common::read_archive(&out)?;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, "a.txt");
    assert_eq!(entries[0].1, tar::EntryType::Regular);
    assert_eq!(entries[0].2, 2);
    assert_eq!(entries[0].3, b"hi");
    assert_eq!(entries[1].0, ".wh.b.txt");
    assert_eq!(entries[1].2, 0);
    assert!(entries[1].3.is_empty());

    // The stream is properly terminated
    assert!(out.ends_with(&[0u8; 1024]));

    let layer = PathBuf::from(LAYER);
    assert_eq!(
        driver.calls(),
        vec![
            Call::Activate(layer.clone()),
            Call::Prepare(layer.clone(), parents()),
            Call::Unprepare(layer.clone()),
            Call::OpenReader(layer.clone()),
            Call::CloseReader,
            Call::Deactivate(layer),
        ]
    );
    Ok(())
}

#[test]
fn test_export_nested_whiteout() -> Result<()> {
    let driver = MockDriver::new(vec![MockEntry::deleted("Files/Windows/gone.dll")]);
    let (result, out) = export(&driver, &CancelToken::new());
    result?;

    let entries = common::read_archive(&out)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "Files/Windows/.wh.gone.dll");
    Ok(())
}

#[test]
fn test_export_records_metadata() -> Result<()> {
    let mut dir = MockEntry::file("Files/dir", b"");
    dir.info = Some(common::dir_info());
    let driver = MockDriver::new(vec![dir, MockEntry::file("Files/dir/f", b"content")]);
    let (result, out) = export(&driver, &CancelToken::new());
    result?;

    let mut archive = tar::Archive::new(&out[..]);
    let mut seen = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        let kind = entry.header().entry_type();
        let meta = backup_stream::metadata_from_entry(&mut entry)?;
        seen.push((name, kind, meta));
    }

    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].1, tar::EntryType::Directory);
    assert_eq!(seen[0].2.info, common::dir_info());
    assert_eq!(seen[1].0, "Files/dir/f");
    assert_eq!(seen[1].2.info, common::file_info());
    assert_eq!(seen[1].2.size, 7);
    assert_eq!(seen[1].2.block_len, 0);
    Ok(())
}

#[test]
fn test_export_appends_stream_blocks() -> Result<()> {
    let blocks = vec![
        StreamBlock::new(StreamKind::SecurityDescriptor, "", vec![1, 2, 3, 4]),
        StreamBlock::new(StreamKind::AlternateData, "Zone.Identifier", b"[ZoneTransfer]".to_vec()),
    ];
    let driver = MockDriver::new(vec![
        MockEntry::file("Files/app.exe", b"MZ").with_streams(blocks.clone())
    ]);
    let (result, out) = export(&driver, &CancelToken::new());
    result?;

    let encoded = backup_stream::encode_blocks(&blocks);
    let mut archive = tar::Archive::new(&out[..]);
    let mut entries = archive.entries()?;
    let mut entry = entries.next().expect("one entry")?;

    let records = backup_stream::pax_records(&mut entry)?;
    assert_eq!(records.get(PAX_BLOCKS), Some(&encoded.len().to_string()));
    assert!(records.contains_key(PAX_FILE_ATTR));
    assert_eq!(entry.size(), 2 + encoded.len() as u64);

    let mut body = Vec::new();
    std::io::Read::read_to_end(&mut entry, &mut body)?;
    assert_eq!(&body[..2], b"MZ");
    assert_eq!(backup_stream::read_blocks(&body[2..])?, blocks);
    Ok(())
}

#[test]
fn test_export_cancelled_before_first_entry() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let driver = MockDriver::new(vec![MockEntry::file("a.txt", b"hi")]);
    let (result, out) = export(&driver, &cancel);

    let err = result.unwrap_err();
    assert!(is_cancelled(&err), "{err:#}");
    assert!(out.is_empty());

    // Cleanup still runs
    let calls = driver.calls();
    assert!(calls.contains(&Call::CloseReader));
    assert_eq!(calls.last(), Some(&Call::Deactivate(PathBuf::from(LAYER))));
}

#[test]
fn test_export_cancelled_midway_leaves_unterminated_stream() -> Result<()> {
    let cancel = CancelToken::new();
    let driver = MockDriver::new(vec![
        MockEntry::file("a.txt", b"hi"),
        MockEntry::file("b.txt", b"there"),
        MockEntry::file("c.txt", b"!"),
    ])
    .cancel_after(1, &cancel);
    let (result, out) = export(&driver, &cancel);

    let err = result.unwrap_err();
    assert!(is_cancelled(&err), "{err:#}");
    assert!(!out.is_empty());
    assert!(!out.ends_with(&[0u8; 1024]));

    // Whatever was emitted before the cancellation is a single well-formed entry
    let entries = common::read_archive(&out)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "a.txt");

    assert_eq!(
        driver.calls().last(),
        Some(&Call::Deactivate(PathBuf::from(LAYER)))
    );
    Ok(())
}

#[test]
fn test_export_cancelled_at_each_entry() -> Result<()> {
    let entries = vec![
        MockEntry::file("a.txt", b"hi"),
        MockEntry::deleted("b.txt"),
        MockEntry::file("c.txt", b"there"),
    ];

    for k in 1..=3 {
        let cancel = CancelToken::new();
        let driver = MockDriver::new(entries.clone()).cancel_after(k - 1, &cancel);
        let (result, out) = export(&driver, &cancel);

        let err = result.unwrap_err();
        assert!(is_cancelled(&err), "k={k}: {err:#}");
        assert!(!out.ends_with(&[0u8; 1024]), "k={k}");

        let written: Vec<String> = common::read_archive(&out)?
            .into_iter()
            .map(|(name, ..)| name)
            .collect();
        let expected: Vec<&str> = ["a.txt", ".wh.b.txt", "c.txt"][..k - 1].to_vec();
        assert_eq!(written, expected, "k={k}");

        let calls = driver.calls();
        assert!(calls.contains(&Call::CloseReader), "k={k}");
        assert_eq!(
            calls.last(),
            Some(&Call::Deactivate(PathBuf::from(LAYER))),
            "k={k}"
        );
    }
    Ok(())
}

#[test]
fn test_export_activate_failure_stops_early() {
    let driver = MockDriver::new(vec![MockEntry::file("a.txt", b"hi")]).with_failures(Failures {
        activate: true,
        ..Default::default()
    });
    let (result, out) = export(&driver, &CancelToken::new());

    assert!(result.is_err());
    assert!(out.is_empty());
    assert_eq!(driver.calls(), vec![Call::Activate(PathBuf::from(LAYER))]);
}

#[test]
fn test_export_enumeration_error_wins_over_close_errors() {
    let driver = MockDriver::new(vec![
        MockEntry::file("a.txt", b"hi"),
        MockEntry::file("b.txt", b"there"),
    ])
    .with_failures(Failures {
        next_at: Some(1),
        close_reader: true,
        deactivate: true,
        ..Default::default()
    });
    let (result, _) = export(&driver, &CancelToken::new());

    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("enumeration failed"), "{err:#}");
    assert!(!is_cancelled(&err));

    let calls = driver.calls();
    assert!(calls.contains(&Call::CloseReader));
    assert!(calls.contains(&Call::Deactivate(PathBuf::from(LAYER))));
}

#[test]
fn test_export_deactivate_failure_is_reported() {
    let driver = MockDriver::new(vec![MockEntry::file("a.txt", b"hi")]).with_failures(Failures {
        deactivate: true,
        ..Default::default()
    });
    let (result, _) = export(&driver, &CancelToken::new());

    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("deactivate failed"), "{err:#}");
}

#[test]
fn test_export_short_layer_file_fails() {
    let mut entry = MockEntry::file("a.txt", b"hi");
    entry.size = 5;
    let (result, out) = export(&MockDriver::new(vec![entry]), &CancelToken::new());

    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("Short read"), "{err:#}");
    assert!(!out.ends_with(&[0u8; 1024]));
}

#[test]
fn test_export_empty_layer() -> Result<()> {
    let (result, out) = export(&MockDriver::new(Vec::new()), &CancelToken::new());
    result?;
    assert!(common::read_archive(&out)?.is_empty());
    Ok(())
}
