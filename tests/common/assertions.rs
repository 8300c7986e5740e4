//! Assertions over the state file and output directory

use std::path::Path;

/// Read the watermark persisted for `source`
pub fn persisted_watermark(state_path: &Path, source: &str) -> Option<f64> {
    let content = std::fs::read_to_string(state_path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&content).expect("state file is JSON");
    value["latestHandledTimes"][source].as_f64()
}

/// Assert the persisted watermark for `source`
pub fn assert_watermark(state_path: &Path, source: &str, expected: f64) {
    assert_eq!(
        persisted_watermark(state_path, source),
        Some(expected),
        "watermark for {source}"
    );
}

/// Number of files in `dir` (0 if it does not exist)
pub fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

/// Assert every file in `dir` is a 32-hex-digit name with an image extension
pub fn assert_image_names(dir: &Path) {
    for entry in std::fs::read_dir(dir).expect("read output dir") {
        let name = entry.expect("dir entry").file_name();
        let name = name.to_str().expect("utf-8 name");
        let (stem, ext) = name.split_once('.').expect("file has extension");
        assert_eq!(stem.len(), 32, "id length in {name}");
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()), "hex id in {name}");
        assert!(matches!(ext, "jpg" | "png"), "extension in {name}");
    }
}
