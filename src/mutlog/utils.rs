//! Log directory scanning and file-set sanity checks.

use std::path::{Path, PathBuf};

use super::file::LogFile;

use crate::utils::ReplogError;

use tokio::fs;

/// Lists `log.{index}.{start_offset}` files under `dir`, sorted by index.
/// Other files are ignored.
pub async fn list_log_files(
    dir: &Path,
) -> Result<Vec<(u32, i64, PathBuf)>, ReplogError> {
    let mut files = vec![];
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if let Some((index, start)) =
            name.to_str().and_then(LogFile::parse_file_name)
        {
            files.push((index, start, entry.path()));
        }
    }
    files.sort_by_key(|(index, _, _)| *index);
    Ok(files)
}

/// Checks that file indices are consecutive and that each file ends exactly
/// where the next one starts.
pub fn check_log_files_continuity(files: &[LogFile]) -> Result<(), ReplogError> {
    for pair in files.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.index() + 1 != next.index() {
            return Err(ReplogError::msg(format!(
                "log file index gap: {} followed by {}",
                prev.index(),
                next.index()
            )));
        }
        if prev.end_offset() != next.start_offset() {
            return Err(ReplogError::msg(format!(
                "log offset gap: {} ends at {} but {} starts at {}",
                prev.path().display(),
                prev.end_offset(),
                next.path().display(),
                next.start_offset()
            )));
        }
    }
    Ok(())
}
