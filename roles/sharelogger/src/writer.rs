use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use msg_log::{ConsumeError, LogConsumer};
use sharelog::{day_begin_ts, sharelog_path, Share, SHARE_SIZE};
use thiserror::Error;
use tracing::{error, info, warn};

/// At most this many day files stay open; the oldest are closed first.
const MAX_OPEN_HANDLES: usize = 3;

/// Buffered shares are flushed to disk at this cadence.
const FLUSH_DISK_INTERVAL: Duration = Duration::from_secs(2);

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("sharelog io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("consume error: {0}")]
    Consume(#[from] ConsumeError),
}

/// Batches incoming shares and appends them to day-partitioned binary
/// files. Records are written back-to-back with no framing, so a file is
/// readable as a plain array of fixed-width records.
pub struct ShareLogWriter {
    data_dir: PathBuf,
    shares: Vec<Share>,
    /// Open handles keyed by UTC day-begin timestamp; BTreeMap keeps them
    /// sorted so the oldest day is always first.
    handles: BTreeMap<u32, BufWriter<File>>,
}

impl ShareLogWriter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            shares: Vec::new(),
            handles: BTreeMap::new(),
        }
    }

    /// Decode and buffer one payload. Oversize/undersize payloads and
    /// invalid shares are logged and dropped.
    pub fn consume(&mut self, payload: &[u8]) {
        if payload.len() != SHARE_SIZE {
            error!(
                "sharelog message size({}) is not: {}",
                payload.len(),
                SHARE_SIZE
            );
            return;
        }
        match Share::decode(payload) {
            Ok(share) if share.is_valid() => self.shares.push(share),
            Ok(share) => error!("invalid share: {}", share),
            Err(e) => error!("undecodable share: {}", e),
        }
    }

    pub fn buffered(&self) -> usize {
        self.shares.len()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn handle(&mut self, bucket_ts: u32) -> std::io::Result<&mut BufWriter<File>> {
        match self.handles.entry(bucket_ts) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let path = sharelog_path(&self.data_dir, bucket_ts);
                info!("open sharelog file: {}", path.display());
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                Ok(entry.insert(BufWriter::new(file)))
            }
        }
    }

    fn close_old_handles(&mut self) {
        while self.handles.len() > MAX_OPEN_HANDLES {
            if let Some((&ts, _)) = self.handles.iter().next() {
                info!("close sharelog handle, day ts: {}", ts);
                self.handles.remove(&ts);
            }
        }
    }

    /// Append every buffered share to its day file, then flush the files
    /// actually touched. Failure to open a day file is fatal: the writer
    /// cannot proceed without it.
    pub fn flush_to_disk(&mut self) -> std::io::Result<()> {
        let shares = std::mem::take(&mut self.shares);
        let mut touched: Vec<u32> = Vec::new();

        for share in &shares {
            let bucket_ts = day_begin_ts(share.timestamp);
            let handle = self.handle(bucket_ts)?;
            handle.write_all(&share.encode())?;
            if !touched.contains(&bucket_ts) {
                touched.push(bucket_ts);
            }
        }

        for ts in touched {
            if let Some(handle) = self.handles.get_mut(&ts) {
                handle.flush()?;
            }
        }

        self.close_old_handles();
        Ok(())
    }

    /// Consume until `running` clears, flushing every
    /// [`FLUSH_DISK_INTERVAL`] and once more on shutdown.
    pub async fn run<C: LogConsumer>(
        mut self,
        mut consumer: C,
        running: Arc<AtomicBool>,
    ) -> Result<(), WriterError> {
        let mut last_flush = Instant::now();

        while running.load(Ordering::Relaxed) {
            if !self.shares.is_empty() && last_flush.elapsed() > FLUSH_DISK_INTERVAL {
                self.flush_to_disk()?;
                last_flush = Instant::now();
            }

            match consumer.poll(POLL_TIMEOUT).await {
                Ok(Some(message)) => self.consume(&message.payload),
                Ok(None) => continue,
                Err(e @ ConsumeError::UnknownTopic(_)) => {
                    error!("consume fatal: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    warn!("consume error: {}", e);
                    continue;
                }
            }
        }

        if !self.shares.is_empty() {
            self.flush_to_disk()?;
        }
        info!("sharelog writer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharelog::{Share, ShareResult};

    // 2016-07-12 00:00:00 UTC
    const DAY: u32 = 1_468_281_600;

    fn share_at(ts: u32) -> Share {
        Share {
            job_id: 9,
            worker_hash_id: 42,
            user_id: 7,
            ip: 0x0a000001,
            result: ShareResult::Accept,
            timestamp: ts,
            share: 1,
            block_bits: 0x1d00ffff,
        }
    }

    fn consume_share(writer: &mut ShareLogWriter, share: &Share) {
        writer.consume(&share.encode());
    }

    #[test]
    fn test_midnight_split_creates_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShareLogWriter::new(dir.path());

        // 3 shares before midnight, 2 after
        for ts in [DAY - 3, DAY - 2, DAY - 1, DAY, DAY + 1] {
            consume_share(&mut writer, &share_at(ts));
        }
        writer.flush_to_disk().unwrap();

        let before = std::fs::read(dir.path().join("sharelog-2016-07-11.bin")).unwrap();
        let after = std::fs::read(dir.path().join("sharelog-2016-07-12.bin")).unwrap();
        assert_eq!(before.len(), 3 * SHARE_SIZE);
        assert_eq!(after.len(), 2 * SHARE_SIZE);
    }

    #[test]
    fn test_round_trip_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShareLogWriter::new(dir.path());

        let shares: Vec<Share> = (0..10).map(|i| share_at(DAY + i * 1000)).collect();
        for share in &shares {
            consume_share(&mut writer, share);
        }
        writer.flush_to_disk().unwrap();

        let bytes = std::fs::read(dir.path().join("sharelog-2016-07-12.bin")).unwrap();
        assert_eq!(bytes.len() % SHARE_SIZE, 0);
        let decoded: Vec<Share> = bytes
            .chunks(SHARE_SIZE)
            .map(|c| Share::decode(c).unwrap())
            .collect();
        assert_eq!(decoded, shares);
    }

    #[test]
    fn test_handle_cache_closes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShareLogWriter::new(dir.path());

        for day in 0..4u32 {
            consume_share(&mut writer, &share_at(DAY + day * 86_400));
        }
        writer.flush_to_disk().unwrap();

        assert_eq!(writer.open_handles(), MAX_OPEN_HANDLES);
        // the oldest day was evicted; the newest three remain
        let remaining: Vec<u32> = writer.handles.keys().copied().collect();
        assert_eq!(
            remaining,
            vec![DAY + 86_400, DAY + 2 * 86_400, DAY + 3 * 86_400]
        );
    }

    #[test]
    fn test_invalid_and_odd_sized_payloads_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShareLogWriter::new(dir.path());

        writer.consume(&[0u8; 7]);
        writer.consume(&[0u8; SHARE_SIZE + 1]);

        let mut bad = share_at(DAY);
        bad.worker_hash_id = 0;
        writer.consume(&bad.encode());

        assert_eq!(writer.buffered(), 0);
    }

    #[test]
    fn test_late_share_lands_in_own_day_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShareLogWriter::new(dir.path());

        // share from two days ago arrives now
        consume_share(&mut writer, &share_at(DAY - 2 * 86_400));
        consume_share(&mut writer, &share_at(DAY));
        writer.flush_to_disk().unwrap();

        assert!(dir.path().join("sharelog-2016-07-10.bin").exists());
        assert!(dir.path().join("sharelog-2016-07-12.bin").exists());
    }

    #[tokio::test]
    async fn test_run_consumes_from_hub() {
        use msg_log::LogHub;
        use std::sync::atomic::AtomicBool;

        let dir = tempfile::tempdir().unwrap();
        let hub = LogHub::new(1000);
        hub.create_topic("sharelog");
        for i in 0..5u32 {
            hub.publish("sharelog", share_at(DAY + i).encode().to_vec());
        }

        let consumer = hub.subscribe_group("sharelog", "writer-test").unwrap();
        let writer = ShareLogWriter::new(dir.path());
        let running = Arc::new(AtomicBool::new(true));

        let stopper = running.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stopper.store(false, Ordering::Relaxed);
        });

        writer.run(consumer, running).await.unwrap();

        let bytes = std::fs::read(dir.path().join("sharelog-2016-07-12.bin")).unwrap();
        assert_eq!(bytes.len(), 5 * SHARE_SIZE);
    }
}
