use futures_util::future::BoxFuture;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarm_engine::BlobReader;
use swarm_vfs::{SwarmError, SwarmResult};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// Opens one more sequential engine reader for the file backing a pool.
pub type ReaderOpener =
    Arc<dyn Fn() -> BoxFuture<'static, SwarmResult<BlobReader>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ReaderPoolConfig {
    pub pool_size: usize,
    pub read_timeout: Duration,
    pub readahead_bytes: u64,
}

impl Default for ReaderPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            read_timeout: Duration::from_secs(120),
            readahead_bytes: 2 * 1024 * 1024,
        }
    }
}

struct PoolChannel {
    tx: mpsc::Sender<BlobReader>,
    rx: Arc<Mutex<mpsc::Receiver<BlobReader>>>,
}

/// Pool of N positional readers over one file. Each reader wraps a
/// sequential engine reader; a seek+read pair is a critical section, so a
/// reader is owned by exactly one operation at a time. The idle set lives
/// in a bounded channel acting as an MPMC queue.
pub struct ReaderPool {
    opener: ReaderOpener,
    file_len: u64,
    config: ReaderPoolConfig,
    channel: Mutex<Option<PoolChannel>>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl ReaderPool {
    pub fn new(opener: ReaderOpener, file_len: u64, config: ReaderPoolConfig) -> Self {
        Self {
            opener,
            file_len,
            config: ReaderPoolConfig {
                pool_size: config.pool_size.max(1),
                ..config
            },
            channel: Mutex::new(None),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    async fn ensure_pool(&self) -> SwarmResult<(mpsc::Sender<BlobReader>, Arc<Mutex<mpsc::Receiver<BlobReader>>>)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SwarmError::InvalidState("file handle closed".to_string()));
        }
        let mut slot = self.channel.lock().await;
        if slot.is_none() {
            let size = self.config.pool_size;
            let (tx, rx) = mpsc::channel(size);
            for _ in 0..size {
                let reader = (self.opener)().await?;
                tx.send(reader)
                    .await
                    .map_err(|_| SwarmError::Internal("pool channel closed".to_string()))?;
            }
            *slot = Some(PoolChannel {
                tx,
                rx: Arc::new(Mutex::new(rx)),
            });
            self.initialized.store(true, Ordering::SeqCst);
        }
        let ch = slot.as_ref().expect("pool just initialized");
        Ok((ch.tx.clone(), ch.rx.clone()))
    }

    /// Positional read filling `buf` from `offset`. Blocks until an idle
    /// reader is available, carries the configured deadline, and schedules
    /// a background prefetch of the next window on success.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> SwarmResult<usize> {
        if buf.is_empty() || offset >= self.file_len {
            return Ok(0);
        }
        let (tx, rx) = self.ensure_pool().await?;

        let mut reader = {
            let mut rx = rx.lock().await;
            rx.recv()
                .await
                .ok_or_else(|| SwarmError::InvalidState("file handle closed".to_string()))?
        };

        let result = timeout(
            self.config.read_timeout,
            read_full_at(&mut reader, buf, offset),
        )
        .await;

        // The reader goes back to the queue even after a failed or timed
        // out read; the next seek resets its position.
        let outcome = match result {
            Ok(done) => done,
            Err(_) => Err(SwarmError::Timeout(format!(
                "read of {} bytes at {} exceeded {:?}",
                buf.len(),
                offset,
                self.config.read_timeout
            ))),
        };
        let n = match outcome {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(reader).await;
                return Err(e);
            }
        };

        if n > 0 {
            self.spawn_prefetch(&tx, &rx, offset + n as u64);
        }
        let _ = tx.send(reader).await;
        Ok(n)
    }

    /// Fire one asynchronous read of the next window to pull upcoming
    /// pieces into the cache. Never blocks: if no spare reader is idle
    /// right now, the prefetch is skipped.
    fn spawn_prefetch(
        &self,
        tx: &mpsc::Sender<BlobReader>,
        rx: &Arc<Mutex<mpsc::Receiver<BlobReader>>>,
        next_offset: u64,
    ) {
        if self.config.readahead_bytes == 0 || next_offset >= self.file_len {
            return;
        }
        let mut guard = match rx.try_lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        let mut reader = match guard.try_recv() {
            Ok(r) => r,
            Err(_) => return,
        };
        drop(guard);

        let want = self
            .config
            .readahead_bytes
            .min(self.file_len - next_offset) as usize;
        let deadline = self.config.read_timeout;
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut sink = vec![0u8; want];
            // Errors are dropped on purpose; the buffer only exists to pull
            // pieces into the cache.
            let _ = timeout(deadline, read_full_at(&mut reader, &mut sink, next_offset)).await;
            let _ = tx.send(reader).await;
        });
    }

    /// Close the pool. Idle readers are dropped immediately; a reader held
    /// by an in-flight prefetch dies when its return-send hits the closed
    /// channel. Subsequent reads fail.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut slot = self.channel.lock().await;
        if let Some(ch) = slot.take() {
            let mut rx = ch.rx.lock().await;
            while rx.try_recv().is_ok() {}
            rx.close();
        }
    }
}

/// Seek to `offset` and read until `buf` is full. A terminal EOF before the
/// buffer is satisfied surfaces as unexpected-eof, except when nothing was
/// read at all.
async fn read_full_at(
    reader: &mut BlobReader,
    buf: &mut [u8],
    offset: u64,
) -> SwarmResult<usize> {
    reader.seek(SeekFrom::Start(offset)).await?;
    let mut n = 0usize;
    while n < buf.len() {
        let m = reader.read(&mut buf[n..]).await?;
        if m == 0 {
            if n == 0 {
                return Ok(0);
            }
            return Err(SwarmError::UnexpectedEof(format!(
                "wanted {} bytes at {}, got {}",
                buf.len(),
                offset,
                n
            )));
        }
        n += m;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use swarm_engine::{MemTorrentSpec, MemoryEngine, MemoryEngineOptions, InfoHash, TorrentEngine};

    fn hash(b: u8) -> InfoHash {
        InfoHash::new([b; 20])
    }

    async fn pool_for(
        engine: &MemoryEngine,
        spec: MemTorrentSpec,
        config: ReaderPoolConfig,
    ) -> ReaderPool {
        let magnet = spec.magnet();
        let len = spec.total_length();
        engine.register(spec);
        let handle = engine.add_magnet(&magnet).await.unwrap();
        handle.wait_info().await.unwrap();
        let opener: ReaderOpener = Arc::new(move || {
            let handle = handle.clone();
            Box::pin(async move { handle.new_reader(0).await })
        });
        ReaderPool::new(opener, len, config)
    }

    #[tokio::test]
    async fn test_read_at_returns_requested_bytes() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let spec = MemTorrentSpec::single_file(hash(1), "f.bin", 1024, data.clone());
        let pool = pool_for(&engine, spec, ReaderPoolConfig::default()).await;

        let mut buf = [0u8; 32];
        let n = pool.read_at(&mut buf, 100).await.unwrap();
        assert_eq!(n, 32);
        assert_eq!(&buf[..], &data[100..132]);

        // Reading past the end yields zero bytes.
        assert_eq!(pool.read_at(&mut buf, 5000).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_share_pool() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let data: Vec<u8> = (0..128u8).cycle().take(1 << 16).collect();
        let spec = MemTorrentSpec::single_file(hash(2), "f.bin", 4096, data.clone());
        let pool = Arc::new(
            pool_for(
                &engine,
                spec,
                ReaderPoolConfig {
                    pool_size: 3,
                    ..Default::default()
                },
            )
            .await,
        );

        let hits = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for i in 0..24u64 {
            let pool = pool.clone();
            let data = data.clone();
            let hits = hits.clone();
            tasks.push(tokio::spawn(async move {
                let off = i * 2048;
                let mut buf = [0u8; 64];
                let n = pool.read_at(&mut buf, off).await.unwrap();
                assert_eq!(n, 64);
                assert_eq!(&buf[..], &data[off as usize..off as usize + 64]);
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 24);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_and_pool_survives() {
        let engine = MemoryEngine::new(
            MemoryEngineOptions::default().with_stall_reads(true),
        );
        let spec = MemTorrentSpec::single_file(hash(3), "f.bin", 1024, vec![0u8; 4096]);
        let pool = pool_for(
            &engine,
            spec,
            ReaderPoolConfig {
                pool_size: 1,
                read_timeout: Duration::from_millis(200),
                readahead_bytes: 0,
            },
        )
        .await;

        let started = std::time::Instant::now();
        let mut buf = [0u8; 8];
        let err = pool.read_at(&mut buf, 0).await.unwrap_err();
        assert!(err.is_timeout(), "got {:?}", err);
        assert!(started.elapsed() < Duration::from_millis(1200));

        // The single reader went back to the queue: the next read gets it
        // again instead of hanging forever on an empty pool.
        let err = pool.read_at(&mut buf, 0).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_prefetch_does_not_block_foreground() {
        let engine = MemoryEngine::new(
            MemoryEngineOptions::default().with_read_delay(Duration::from_millis(20)),
        );
        let spec = MemTorrentSpec::single_file(hash(4), "f.bin", 1024, vec![5u8; 1 << 20]);
        let pool = pool_for(
            &engine,
            spec,
            ReaderPoolConfig {
                pool_size: 2,
                read_timeout: Duration::from_secs(5),
                readahead_bytes: 1 << 18,
            },
        )
        .await;

        // Every foreground read completes promptly even while prefetches
        // occupy the spare reader.
        for i in 0..8u64 {
            let started = std::time::Instant::now();
            let mut buf = [0u8; 128];
            let n = pool.read_at(&mut buf, i * 4096).await.unwrap();
            assert_eq!(n, 128);
            assert!(started.elapsed() < Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_close_fails_later_reads() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let spec = MemTorrentSpec::single_file(hash(5), "f.bin", 1024, vec![1u8; 64]);
        let pool = pool_for(&engine, spec, ReaderPoolConfig::default()).await;

        let mut buf = [0u8; 8];
        pool.read_at(&mut buf, 0).await.unwrap();
        pool.close().await;
        assert!(pool.read_at(&mut buf, 0).await.is_err());
    }
}
