use chrono::{TimeZone, Utc};

use seis_harvest::archive::ChunkArchive;
use seis_harvest::domain::TimeWindow;
use seis_harvest::store::Store;

fn day(day: u32) -> TimeWindow {
    TimeWindow::new(
        Utc.with_ymd_and_hms(2020, 1, day, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2020, 1, day + 1, 0, 0, 0).unwrap(),
    )
    .unwrap()
}

#[test]
fn lists_archives_in_window_order() {
    let temp = tempfile::tempdir().unwrap();
    let store = Store::from_std(temp.path()).unwrap();
    store.ensure_root().unwrap();

    for window in [day(3), day(1), day(2)] {
        ChunkArchive::create_empty(&store.archive_path(&window)).unwrap();
    }
    std::fs::write(store.station_table_path().as_std_path(), "network\n").unwrap();

    let archives = store.list_archives().unwrap();
    let names: Vec<&str> = archives.iter().filter_map(|path| path.file_name()).collect();
    assert_eq!(
        names,
        vec![
            "2020_01_01_00_00_00T2020_01_02_00_00_00.zip",
            "2020_01_02_00_00_00T2020_01_03_00_00_00.zip",
            "2020_01_03_00_00_00T2020_01_04_00_00_00.zip",
        ]
    );
}

#[test]
fn missing_root_has_no_archives() {
    let temp = tempfile::tempdir().unwrap();
    let store = Store::from_std(&temp.path().join("absent")).unwrap();
    assert!(!store.exists(store.root()));
    assert!(store.list_archives().unwrap().is_empty());
}
