use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Flush,
}

impl IoKind {
    fn index(self) -> usize {
        match self {
            IoKind::Read => 0,
            IoKind::Write => 1,
            IoKind::Flush => 2,
        }
    }
}

/// Per-request accounting token: created when the request starts, consumed when it completes.
#[derive(Debug)]
pub struct IoCookie {
    kind: IoKind,
    bytes: u64,
    started: Instant,
}

/// Cumulative I/O counters for one volume.
#[derive(Debug, Default)]
pub struct IoStats {
    bytes: [AtomicU64; 3],
    ops: [AtomicU64; 3],
    total_time_ns: [AtomicU64; 3],
    /// One past the highest byte ever written, zero when nothing was written.
    write_high_water: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    pub read_bytes: u64,
    pub read_ops: u64,
    pub write_bytes: u64,
    pub write_ops: u64,
    pub flush_ops: u64,
    pub read_time: Duration,
    pub write_time: Duration,
    pub flush_time: Duration,
    pub write_high_water: u64,
}

impl IoStats {
    pub fn start(&self, kind: IoKind, bytes: u64) -> IoCookie {
        IoCookie {
            kind,
            bytes,
            started: Instant::now(),
        }
    }

    pub fn done(&self, cookie: IoCookie) {
        let idx = cookie.kind.index();
        let elapsed = u64::try_from(cookie.started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.bytes[idx].fetch_add(cookie.bytes, Ordering::Relaxed);
        self.ops[idx].fetch_add(1, Ordering::Relaxed);
        self.total_time_ns[idx].fetch_add(elapsed, Ordering::Relaxed);
    }

    pub fn record_write_extent(&self, offset: u64, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.write_high_water
            .fetch_max(offset.saturating_add(bytes), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IoStatsSnapshot {
        let read = IoKind::Read.index();
        let write = IoKind::Write.index();
        let flush = IoKind::Flush.index();
        IoStatsSnapshot {
            read_bytes: self.bytes[read].load(Ordering::Relaxed),
            read_ops: self.ops[read].load(Ordering::Relaxed),
            write_bytes: self.bytes[write].load(Ordering::Relaxed),
            write_ops: self.ops[write].load(Ordering::Relaxed),
            flush_ops: self.ops[flush].load(Ordering::Relaxed),
            read_time: Duration::from_nanos(self.total_time_ns[read].load(Ordering::Relaxed)),
            write_time: Duration::from_nanos(self.total_time_ns[write].load(Ordering::Relaxed)),
            flush_time: Duration::from_nanos(self.total_time_ns[flush].load(Ordering::Relaxed)),
            write_high_water: self.write_high_water.load(Ordering::Relaxed),
        }
    }
}
