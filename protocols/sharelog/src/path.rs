use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};

/// UTC midnight of the day containing `ts`.
pub fn day_begin_ts(ts: u32) -> u32 {
    ts - (ts % 86_400)
}

/// Path of the sharelog file for the day containing `ts`:
/// `<dir>/sharelog-YYYY-MM-DD.bin`, date rendered in UTC.
pub fn sharelog_path(data_dir: &Path, ts: u32) -> PathBuf {
    let date = Utc
        .timestamp_opt(i64::from(ts), 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
    data_dir.join(format!("sharelog-{}.bin", date.format("%F")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_begin() {
        // 2016-07-12 13:45:00 UTC
        let ts = 1_468_331_100;
        assert_eq!(day_begin_ts(ts), 1_468_281_600);
        assert_eq!(day_begin_ts(1_468_281_600), 1_468_281_600);
    }

    #[test]
    fn test_file_name() {
        let dir = Path::new("/data/sharelog");
        let path = sharelog_path(dir, 1_468_331_100);
        assert_eq!(path, Path::new("/data/sharelog/sharelog-2016-07-12.bin"));
    }

    #[test]
    fn test_late_share_lands_in_own_day() {
        let dir = Path::new("/data");
        // one second before and after midnight go to different files
        let before = sharelog_path(dir, 1_468_281_599);
        let after = sharelog_path(dir, 1_468_281_600);
        assert_eq!(before, Path::new("/data/sharelog-2016-07-11.bin"));
        assert_eq!(after, Path::new("/data/sharelog-2016-07-12.bin"));
    }
}
