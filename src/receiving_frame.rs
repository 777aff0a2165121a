use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::chunk_header::{ChunkHeader, TransmissionType};
use crate::config::{FRAME_DROP_TIMEOUT, INIT_CHUNK_TIMEOUT, RESEND_TIMEOUT};
use crate::memory_pool::PoolBlock;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Callbacks from a frame back into its receiver. The receiver implements this on
///  its shared state; frames hold it as a trait object so the reassembly logic can
///  be tested against a recording fake.
#[async_trait]
pub trait FrameEvents: Send + Sync + 'static {
    /// emit a single NAK datagram asking the peer to retransmit one chunk
    async fn request_resend(&self, header: ChunkHeader, to: SocketAddr);

    /// a frame has all of its chunks and can be delivered
    async fn frame_assembled(&self, id: u32, total_size: u32);

    /// the drop deadline expired before the frame completed
    async fn frame_dropped(&self, id: u32);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameStatus {
    Assembling = 0,
    Ready = 1,
    Dropped = 2,
}

impl FrameStatus {
    fn from_raw(raw: u8) -> FrameStatus {
        match raw {
            0 => FrameStatus::Assembling,
            1 => FrameStatus::Ready,
            2 => FrameStatus::Dropped,
            _ => unreachable!("invalid frame status {}", raw),
        }
    }
}

/// One inbound frame being reassembled from chunks.
///
/// The frame is a small state machine: it starts `Assembling` and ends either
///  `Ready` (all chunks present, delivered through [`FrameEvents::frame_assembled`])
///  or `Dropped` (drop deadline expired first). Transitions are monotone.
///
/// Loss detection is driven by a quiet timer: every fresh INIT chunk re-arms it,
///  so it measures the time since the sender last made progress. When it fires the
///  frame enters resend mode - NAKs for all missing chunks go out periodically and
///  the drop deadline starts counting.
#[derive(Clone)]
pub struct ReceivingFrame {
    inner: Arc<FrameInner>,
}

struct FrameInner {
    id: u32,
    sender_addr: SocketAddr,
    total_chunks: u16,
    total_size: u32,
    /// payload stride: every chunk except the last carries exactly this many bytes
    block_size: usize,
    status: AtomicU8,
    request_resend: AtomicBool,
    request_timeout: AtomicBool,
    /// which chunks have arrived; headers need not be retained since every chunk
    ///  is validated against the frame-level dimensions on arrival
    chunk_bitmap: Mutex<Vec<bool>>,
    /// the frame's slot in the receiver's data pool; taken out by the receiver on
    ///  release / drop cleanup
    data: Mutex<Option<PoolBlock>>,
    timers: Mutex<FrameTimers>,
    events: Arc<dyn FrameEvents>,
}

#[derive(Default)]
struct FrameTimers {
    init_chunk: Option<JoinHandle<()>>,
    frame_drop: Option<JoinHandle<()>>,
    resend_loop: Option<JoinHandle<()>>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        self.timers.lock().unwrap().abort_all();
    }
}

impl FrameTimers {
    fn abort_all(&mut self) {
        for handle in [
            self.init_chunk.take(),
            self.frame_drop.take(),
            self.resend_loop.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

impl ReceivingFrame {
    pub fn new(
        id: u32,
        sender_addr: SocketAddr,
        total_chunks: u16,
        total_size: u32,
        block_size: usize,
        data: PoolBlock,
        events: Arc<dyn FrameEvents>,
    ) -> ReceivingFrame {
        ReceivingFrame {
            inner: Arc::new(FrameInner {
                id,
                sender_addr,
                total_chunks,
                total_size,
                block_size,
                status: AtomicU8::new(FrameStatus::Assembling as u8),
                request_resend: AtomicBool::new(false),
                request_timeout: AtomicBool::new(false),
                chunk_bitmap: Mutex::new(vec![false; total_chunks.safe_cast()]),
                data: Mutex::new(Some(data)),
                timers: Mutex::new(FrameTimers::default()),
                events,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn sender_addr(&self) -> SocketAddr {
        self.inner.sender_addr
    }

    pub fn status(&self) -> FrameStatus {
        FrameStatus::from_raw(self.inner.status.load(Ordering::Acquire))
    }

    /// true once the drop deadline has expired - the frame accepts no more chunks
    pub fn is_timed_out(&self) -> bool {
        self.inner.request_timeout.load(Ordering::Acquire)
    }

    /// Used by the receiver to filter duplicates before handing a chunk to
    ///  [`add_chunk`](ReceivingFrame::add_chunk). Out-of-range indices are filtered
    ///  like duplicates.
    pub fn is_chunk_added(&self, chunk_index: u16) -> bool {
        let chunk_index: usize = chunk_index.safe_cast();
        let bitmap = self.inner.chunk_bitmap.lock().unwrap();
        bitmap.get(chunk_index).copied().unwrap_or(true)
    }

    pub async fn add_chunk(&self, header: &ChunkHeader, payload: &[u8]) {
        let chunk_index: usize = header.chunk_index.safe_cast();
        let chunk_size: usize = header.chunk_size.safe_cast();
        let total_size: usize = self.inner.total_size.safe_cast();
        let total_chunks: usize = self.inner.total_chunks.safe_cast();

        if chunk_index >= total_chunks {
            warn!(
                "frame #{}: chunk index {} out of range for {} chunks - dropping",
                self.inner.id, chunk_index, self.inner.total_chunks
            );
            return;
        }
        if header.total_size != self.inner.total_size {
            warn!(
                "frame #{}: chunk {} declares total size {} instead of {} - dropping",
                self.inner.id, chunk_index, header.total_size, self.inner.total_size
            );
            return;
        }
        // every chunk except the last carries exactly one stride; the last one
        //  carries the remainder. Anything else cannot be placed in the buffer.
        let expected_size = if chunk_index + 1 == total_chunks {
            total_size.saturating_sub(chunk_index * self.inner.block_size)
        }
        else {
            self.inner.block_size
        };
        if chunk_size != expected_size || payload.len() < chunk_size {
            warn!(
                "frame #{}: chunk {} declares {} bytes instead of {} (carrying {}) - dropping",
                self.inner.id,
                chunk_index,
                chunk_size,
                expected_size,
                payload.len()
            );
            return;
        }

        let all_added = {
            let mut bitmap = self.inner.chunk_bitmap.lock().unwrap();
            bitmap[chunk_index] = true;

            // scan backwards: the tail chunks are the ones most likely still missing
            bitmap.iter().rev().all(|added| *added)
        };

        // the payload copy happens outside the bitmap lock
        {
            let mut data = self.inner.data.lock().unwrap();
            if let Some(block) = data.as_mut() {
                let offset = chunk_index * self.inner.block_size;
                block.as_mut_slice()[offset..offset + chunk_size]
                    .copy_from_slice(&payload[..chunk_size]);
            }
        }

        if all_added {
            if self
                .inner
                .status
                .compare_exchange(
                    FrameStatus::Assembling as u8,
                    FrameStatus::Ready as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                // lost the race against the drop deadline
                return;
            }
            self.inner.request_resend.store(false, Ordering::Release);
            self.inner.timers.lock().unwrap().abort_all();

            trace!("frame #{}: all {} chunks present", self.inner.id, self.inner.total_chunks);
            self.inner
                .events
                .frame_assembled(self.inner.id, self.inner.total_size)
                .await;
        }
        else if header.transmission_type == TransmissionType::Init
            && !self.inner.request_resend.load(Ordering::Acquire)
        {
            // a fresh INIT chunk proves the sender is still transmitting
            self.arm_init_chunk_timer();
        }
        // a RESEND fills its bitmap slot but never touches the quiet timer
    }

    /// copy of the reassembled frame, sized to the frame's declared total size
    pub fn assembled_bytes(&self) -> Option<Vec<u8>> {
        let total_size: usize = self.inner.total_size.safe_cast();
        let data = self.inner.data.lock().unwrap();
        data.as_ref()
            .map(|block| block.as_slice()[..total_size].to_vec())
    }

    /// takes the frame's data pool block; subsequent chunks are copied nowhere
    pub fn take_data(&self) -> Option<PoolBlock> {
        self.inner.data.lock().unwrap().take()
    }

    fn arm_init_chunk_timer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut timers = self.inner.timers.lock().unwrap();

        if let Some(handle) = timers.init_chunk.take() {
            handle.abort();
        }
        timers.init_chunk = Some(tokio::spawn(async move {
            sleep(INIT_CHUNK_TIMEOUT).await;
            if let Some(frame) = Self::upgrade(&weak) {
                frame.on_quiet_timeout().await;
            }
        }));
    }

    async fn on_quiet_timeout(&self) {
        if self.status() != FrameStatus::Assembling {
            return;
        }
        debug!(
            "frame #{}: sender went quiet with chunks missing - entering resend mode",
            self.inner.id
        );
        self.inner.request_resend.store(true, Ordering::Release);
        self.arm_frame_drop_timer();
        self.run_resend_loop().await;
    }

    fn arm_frame_drop_timer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut timers = self.inner.timers.lock().unwrap();

        if timers.frame_drop.is_some() {
            // armed exactly once, at the moment resend requests begin
            return;
        }
        timers.frame_drop = Some(tokio::spawn(async move {
            sleep(FRAME_DROP_TIMEOUT).await;
            if let Some(frame) = Self::upgrade(&weak) {
                frame.on_drop_deadline().await;
            }
        }));
    }

    async fn on_drop_deadline(&self) {
        if self
            .inner
            .status
            .compare_exchange(
                FrameStatus::Assembling as u8,
                FrameStatus::Dropped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.inner.request_resend.store(false, Ordering::Release);
        self.inner.request_timeout.store(true, Ordering::Release);

        debug!("frame #{}: drop deadline expired before completion", self.inner.id);
        self.inner.events.frame_dropped(self.inner.id).await;
    }

    /// NAK every missing chunk, then again every RESEND_TIMEOUT until the frame
    ///  either completes or is dropped.
    async fn run_resend_loop(&self) {
        self.emit_naks().await;

        let weak = Arc::downgrade(&self.inner);
        let mut timers = self.inner.timers.lock().unwrap();
        if let Some(handle) = timers.resend_loop.take() {
            handle.abort();
        }
        timers.resend_loop = Some(tokio::spawn(async move {
            loop {
                sleep(RESEND_TIMEOUT).await;
                match Self::upgrade(&weak) {
                    Some(frame) => {
                        if !frame.inner.request_resend.load(Ordering::Acquire) {
                            return;
                        }
                        frame.emit_naks().await;
                    }
                    None => return,
                }
            }
        }));
    }

    async fn emit_naks(&self) {
        if !self.inner.request_resend.load(Ordering::Acquire) {
            return;
        }

        let missing: Vec<u16> = {
            let bitmap = self.inner.chunk_bitmap.lock().unwrap();
            bitmap
                .iter()
                .enumerate()
                .filter(|(_, added)| !**added)
                .map(|(i, _)| i.prechecked_cast())
                .collect()
        };

        trace!(
            "frame #{}: requesting resend of {} missing chunks",
            self.inner.id,
            missing.len()
        );
        for chunk_index in missing {
            self.inner
                .events
                .request_resend(
                    ChunkHeader::nak(self.inner.id, chunk_index, self.inner.total_chunks),
                    self.inner.sender_addr,
                )
                .await;
        }
    }

    fn upgrade(weak: &Weak<FrameInner>) -> Option<ReceivingFrame> {
        weak.upgrade().map(|inner| ReceivingFrame { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_pool::MemoryPool;
    use rstest::rstest;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        Nak { chunk_index: u16, at_millis: u64 },
        Assembled { id: u32, total_size: u32 },
        Dropped { id: u32 },
    }

    /// records frame callbacks together with (paused-clock) timestamps
    struct RecordingEvents {
        started: Instant,
        log: Mutex<Vec<Event>>,
    }

    impl RecordingEvents {
        fn new() -> Arc<RecordingEvents> {
            Arc::new(RecordingEvents {
                started: Instant::now(),
                log: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<Event> {
            self.log.lock().unwrap().clone()
        }

        fn naks(&self) -> Vec<(u16, u64)> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Nak { chunk_index, at_millis } => Some((chunk_index, at_millis)),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl FrameEvents for RecordingEvents {
        async fn request_resend(&self, header: ChunkHeader, _to: SocketAddr) {
            let at_millis = self.started.elapsed().as_millis() as u64;
            self.log.lock().unwrap().push(Event::Nak {
                chunk_index: header.chunk_index,
                at_millis,
            });
        }

        async fn frame_assembled(&self, id: u32, total_size: u32) {
            self.log.lock().unwrap().push(Event::Assembled { id, total_size });
        }

        async fn frame_dropped(&self, id: u32) {
            self.log.lock().unwrap().push(Event::Dropped { id });
        }
    }

    const BLOCK_SIZE: usize = 8;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    fn new_frame(
        total_chunks: u16,
        total_size: u32,
        events: Arc<RecordingEvents>,
    ) -> (ReceivingFrame, MemoryPool) {
        let pool = MemoryPool::new(BLOCK_SIZE * total_chunks as usize, 1);
        let block = pool.acquire().unwrap();
        let frame = ReceivingFrame::new(7, peer(), total_chunks, total_size, BLOCK_SIZE, block, events);
        (frame, pool)
    }

    fn chunk_header(chunk_index: u16, total_chunks: u16, total_size: u32, chunk_size: u32, transmission_type: TransmissionType) -> ChunkHeader {
        ChunkHeader {
            id: 7,
            total_size,
            total_chunks,
            chunk_index,
            chunk_size,
            transmission_type,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_chunk_completes_immediately() {
        let events = RecordingEvents::new();
        let (frame, _pool) = new_frame(1, 5, events.clone());

        frame
            .add_chunk(&chunk_header(0, 1, 5, 5, TransmissionType::Init), b"hello")
            .await;

        assert_eq!(frame.status(), FrameStatus::Ready);
        assert_eq!(events.events(), vec![Event::Assembled { id: 7, total_size: 5 }]);
        assert_eq!(frame.assembled_bytes(), Some(b"hello".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_commute() {
        let events = RecordingEvents::new();
        let (frame, _pool) = new_frame(3, 20, events.clone());

        frame.add_chunk(&chunk_header(2, 3, 20, 4, TransmissionType::Init), b"mmmm").await;
        frame.add_chunk(&chunk_header(0, 3, 20, 8, TransmissionType::Init), b"aaaaaaaa").await;
        assert_eq!(frame.status(), FrameStatus::Assembling);

        frame.add_chunk(&chunk_header(1, 3, 20, 8, TransmissionType::Init), b"zzzzzzzz").await;

        assert_eq!(frame.status(), FrameStatus::Ready);
        assert_eq!(events.events(), vec![Event::Assembled { id: 7, total_size: 20 }]);
        assert_eq!(frame.assembled_bytes(), Some(b"aaaaaaaazzzzzzzzmmmm".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_chunk_is_idempotent() {
        let events = RecordingEvents::new();
        let (frame, _pool) = new_frame(2, 10, events.clone());

        let header = chunk_header(0, 2, 10, 8, TransmissionType::Init);
        frame.add_chunk(&header, b"xxxxxxxx").await;
        assert!(frame.is_chunk_added(0));
        assert!(!frame.is_chunk_added(1));

        frame.add_chunk(&header, b"xxxxxxxx").await;
        assert_eq!(frame.status(), FrameStatus::Assembling);

        frame.add_chunk(&chunk_header(1, 2, 10, 2, TransmissionType::Init), b"yy").await;
        assert_eq!(events.events(), vec![Event::Assembled { id: 7, total_size: 10 }]);
    }

    #[rstest]
    #[case::index_out_of_range(chunk_header(2, 2, 10, 8, TransmissionType::Init))]
    #[case::total_size_disagrees(chunk_header(0, 2, 11, 8, TransmissionType::Init))]
    #[case::chunk_size_exceeds_stride(chunk_header(0, 2, 10, 9, TransmissionType::Init))]
    #[case::non_final_chunk_undersized(chunk_header(0, 2, 10, 4, TransmissionType::Init))]
    #[case::final_chunk_oversized(chunk_header(1, 2, 10, 8, TransmissionType::Init))]
    fn test_malformed_chunk_rejected(#[case] header: ChunkHeader) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let events = RecordingEvents::new();
            let (frame, _pool) = new_frame(2, 10, events.clone());

            frame.add_chunk(&header, b"xxxxxxxxxxxx").await;

            assert!(!frame.is_chunk_added(0));
            assert!(!frame.is_chunk_added(1));
            assert!(events.events().is_empty());
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_payload_rejected() {
        let events = RecordingEvents::new();
        let (frame, _pool) = new_frame(2, 10, events.clone());

        frame.add_chunk(&chunk_header(0, 2, 10, 8, TransmissionType::Init), b"short").await;

        assert!(!frame.is_chunk_added(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_timer_starts_nak_loop() {
        let events = RecordingEvents::new();
        let (frame, _pool) = new_frame(3, 20, events.clone());

        frame.add_chunk(&chunk_header(0, 3, 20, 8, TransmissionType::Init), b"aaaaaaaa").await;

        // quiet timer fires 20ms after the last INIT chunk
        tokio::time::sleep(Duration::from_millis(25)).await;

        let naks = events.naks();
        assert_eq!(naks.iter().map(|(c, _)| *c).collect::<Vec<_>>(), vec![1, 2]);
        assert!(naks.iter().all(|(_, at)| *at == 20));
        assert_eq!(frame.status(), FrameStatus::Assembling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_init_chunk_rearms_quiet_timer() {
        let events = RecordingEvents::new();
        let (frame, _pool) = new_frame(3, 20, events.clone());

        frame.add_chunk(&chunk_header(0, 3, 20, 8, TransmissionType::Init), b"aaaaaaaa").await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        frame.add_chunk(&chunk_header(1, 3, 20, 8, TransmissionType::Init), b"bbbbbbbb").await;
        tokio::time::sleep(Duration::from_millis(15)).await;

        // 30ms in, but only 15ms since the last fresh chunk
        assert!(events.naks().is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(events.naks(), vec![(2, 35)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_does_not_rearm_quiet_timer() {
        let events = RecordingEvents::new();
        let (frame, _pool) = new_frame(3, 20, events.clone());

        frame.add_chunk(&chunk_header(0, 3, 20, 8, TransmissionType::Init), b"aaaaaaaa").await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        frame.add_chunk(&chunk_header(1, 3, 20, 8, TransmissionType::Resend), b"bbbbbbbb").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // the RESEND at 15ms did not reset the quiet timer armed at 0ms
        assert_eq!(events.naks(), vec![(2, 20)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_loop_repeats_until_drop_deadline() {
        let events = RecordingEvents::new();
        let (frame, _pool) = new_frame(2, 10, events.clone());

        frame.add_chunk(&chunk_header(0, 2, 10, 8, TransmissionType::Init), b"aaaaaaaa").await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // resend mode began at 20ms, the drop deadline 100ms later
        let naks = events.naks();
        assert!(naks.len() >= 4, "expected several NAK rounds, got {:?}", naks);
        assert!(naks.iter().all(|(c, _)| *c == 1));
        assert!(naks.iter().all(|(_, at)| *at >= 20 && *at <= 120));

        assert_eq!(frame.status(), FrameStatus::Dropped);
        assert!(frame.is_timed_out());
        assert_eq!(events.events().last(), Some(&Event::Dropped { id: 7 }));

        // no further NAKs after the drop
        let nak_count = events.naks().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(events.naks().len(), nak_count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_cancels_timers() {
        let events = RecordingEvents::new();
        let (frame, _pool) = new_frame(2, 10, events.clone());

        frame.add_chunk(&chunk_header(0, 2, 10, 8, TransmissionType::Init), b"aaaaaaaa").await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(events.naks(), vec![(1, 20)]);

        // the NAK'ed chunk arrives as a RESEND and completes the frame
        frame.add_chunk(&chunk_header(1, 2, 10, 2, TransmissionType::Resend), b"bb").await;
        assert_eq!(frame.status(), FrameStatus::Ready);

        tokio::time::sleep(Duration::from_millis(300)).await;

        let events_after = events.events();
        assert!(!events_after.iter().any(|e| matches!(e, Event::Dropped { .. })));
        assert_eq!(events.naks(), vec![(1, 20)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_data_stops_copies() {
        let events = RecordingEvents::new();
        let (frame, pool) = new_frame(2, 10, events.clone());

        let block = frame.take_data().unwrap();
        pool.release(block);

        frame.add_chunk(&chunk_header(0, 2, 10, 8, TransmissionType::Init), b"aaaaaaaa").await;
        assert_eq!(frame.assembled_bytes(), None);
    }
}
