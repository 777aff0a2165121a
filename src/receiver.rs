use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::chunk_header::{ChunkHeader, TransmissionType};
use crate::config::ChunkConfig;
use crate::memory_pool::MemoryPool;
use crate::ordered_hash::OrderedHashMap;
use crate::receiving_frame::{FrameEvents, ReceivingFrame};
use crate::safe_converter::SafeCast;
use crate::socket::DatagramSocket;

/// Application-side sink for reassembled frames.
///
/// `data` is an owned copy of the frame - the underlying pool block is recycled
///  independently of how long the application keeps the bytes. The handler must
///  invoke `release` to hand the frame's pool block back; a handle that is dropped
///  without being invoked keeps the block out of circulation until
///  [`Receiver::flush`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn on_frame(&self, data: Vec<u8>, release: FrameRelease);
}

/// Consume-once handle returning a delivered frame's buffers to the receiver.
pub struct FrameRelease {
    shared: Weak<ReceiverShared>,
    id: u32,
}

impl FrameRelease {
    pub fn release(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release_frame(self.id);
        }
    }
}

/// Receiving side of the protocol: reads chunk datagrams off a UDP socket,
///  reassembles them into frames and hands completed frames to a [`FrameHandler`].
///
/// All buffers on the ingress path come from three fixed pools, so a receiver's
///  memory use is bounded at construction time. When the frame pool is exhausted,
///  new frames are dropped on arrival until blocks are released.
pub struct Receiver {
    socket: Arc<UdpSocket>,
    raw_pool: MemoryPool,
    shared: Arc<ReceiverShared>,
    running: AtomicBool,
    shutdown: Notify,
}

struct ReceiverShared {
    self_weak: Weak<ReceiverShared>,
    nak_socket: Arc<dyn DatagramSocket>,
    handler: Option<Arc<dyn FrameHandler>>,
    /// payload stride per chunk
    payload: usize,
    data_pool: MemoryPool,
    resend_pool: MemoryPool,
    assembling_queue: OrderedHashMap<u32, ReceivingFrame>,
    /// ids of frames declared lost, awaiting lazy cleanup on the next new frame
    dropped_queue: Mutex<VecDeque<u32>>,
    assembled_count: AtomicUsize,
    dropped_count: AtomicUsize,
}

impl Receiver {
    /// Binds a UDP socket on the given port and sets up the pools. The receiver is
    ///  inert until [`run`](Receiver::run) is called.
    pub async fn new(
        port: u16,
        handler: Option<Arc<dyn FrameHandler>>,
        config: ChunkConfig,
    ) -> anyhow::Result<Receiver> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?);
        info!("bound receive socket to {:?}", socket.local_addr());

        Ok(Self::from_parts(socket.clone(), Arc::new(socket), handler, config))
    }

    fn from_parts(
        socket: Arc<UdpSocket>,
        nak_socket: Arc<dyn DatagramSocket>,
        handler: Option<Arc<dyn FrameHandler>>,
        config: ChunkConfig,
    ) -> Receiver {
        let shared = Arc::new_cyclic(|self_weak| ReceiverShared {
            self_weak: self_weak.clone(),
            nak_socket,
            handler,
            payload: config.payload(),
            data_pool: MemoryPool::new(config.max_data_size, config.buffer_size),
            resend_pool: MemoryPool::new(ChunkHeader::SERIALIZED_LEN, config.buffer_size),
            assembling_queue: OrderedHashMap::new(),
            dropped_queue: Mutex::new(VecDeque::new()),
            assembled_count: AtomicUsize::new(0),
            dropped_count: AtomicUsize::new(0),
        });

        Receiver {
            socket,
            raw_pool: MemoryPool::new(
                config.datagram_size(),
                config.max_total_chunks() * config.buffer_size,
            ),
            shared,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// number of frames delivered since start
    pub fn frame_count(&self) -> usize {
        self.shared.assembled_count.load(Ordering::Relaxed)
    }

    /// number of frames declared lost since start
    pub fn drop_count(&self) -> usize {
        self.shared.dropped_count.load(Ordering::Relaxed)
    }

    /// The ingress loop: runs until [`stop`](Receiver::stop) is called.
    pub async fn run(&self) {
        info!("starting receive loop");
        self.running.store(true, Ordering::Release);

        while self.running.load(Ordering::Acquire) {
            let Some(mut block) = self.raw_pool.acquire() else {
                warn!("raw pool exhausted - receive stalled until buffers free up");
                tokio::task::yield_now().await;
                continue;
            };

            let received = tokio::select! {
                r = self.socket.recv_from(block.as_mut_slice()) => Some(r),
                _ = self.shutdown.notified() => None,
            };

            match received {
                None => {
                    self.raw_pool.release(block);
                    break;
                }
                Some(Err(e)) => {
                    error!("socket error: {}", e);
                    self.raw_pool.release(block);
                }
                Some(Ok((num_read, from))) => {
                    self.shared
                        .handle_datagram(&block.as_slice()[..num_read], from)
                        .await;
                    self.raw_pool.release(block);
                }
            }
        }
        info!("receive loop stopped");
    }

    /// Stops the ingress loop and zeroes the counters. In-flight frames stay in
    ///  the assembling queue until [`flush`](Receiver::flush).
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        // notify_one stores a permit, so a stop between two receives is not lost
        self.shutdown.notify_one();
        self.shared.assembled_count.store(0, Ordering::Relaxed);
        self.shared.dropped_count.store(0, Ordering::Relaxed);
    }

    /// Reclaims every in-flight frame's data block back into the pool.
    pub fn flush(&self) {
        self.shared.dropped_queue.lock().unwrap().clear();

        while let Some((id, frame)) = self.shared.assembling_queue.pop_front() {
            trace!("flushing frame #{}", id);
            if let Some(block) = frame.take_data() {
                self.shared.data_pool.release(block);
            }
        }
    }
}

impl ReceiverShared {
    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        if datagram.len() < ChunkHeader::SERIALIZED_LEN {
            debug!("datagram of {} bytes is below header size - dropping", datagram.len());
            return;
        }

        let mut buf = datagram;
        let header = match ChunkHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(_) => {
                debug!("received datagram with unparsable header from {:?} - dropping", from);
                return;
            }
        };

        match self.assembling_queue.find(&header.id) {
            None => {
                // RESENDs never create frames: a retransmission of an already
                //  delivered (and forgotten) frame must not resurrect it
                if header.transmission_type == TransmissionType::Init {
                    self.start_frame(header, buf, from).await;
                }
                else {
                    debug!("RESEND chunk for untracked frame #{} - dropping", header.id);
                }
            }
            Some(frame) => {
                if !frame.is_timed_out() && !frame.is_chunk_added(header.chunk_index) {
                    frame.add_chunk(&header, buf).await;
                }
                else {
                    trace!(
                        "duplicate or late chunk {} for frame #{} - dropping",
                        header.chunk_index,
                        header.id
                    );
                }
            }
        }
    }

    async fn start_frame(&self, header: ChunkHeader, payload: &[u8], from: SocketAddr) {
        let total_size: usize = header.total_size.safe_cast();
        let total_chunks: usize = header.total_chunks.safe_cast();
        if total_chunks == 0
            || total_size > self.data_pool.block_size()
            || total_size.div_ceil(self.payload) != total_chunks
        {
            debug!(
                "frame #{} declares inconsistent dimensions ({} bytes in {} chunks) - dropping",
                header.id, header.total_size, header.total_chunks
            );
            return;
        }

        self.drain_dropped_queue();

        let Some(block) = self.data_pool.acquire() else {
            warn!(
                "data pool exhausted - dropping new frame #{} (consider a bigger buffer_size)",
                header.id
            );
            return;
        };

        let events: Arc<dyn FrameEvents> =
            self.self_weak.upgrade().expect("receiver is alive while handling datagrams");
        let frame = ReceivingFrame::new(
            header.id,
            from,
            header.total_chunks,
            header.total_size,
            self.payload,
            block,
            events,
        );

        debug!("frame #{}: starting reassembly of {} chunks from {:?}", header.id, header.total_chunks, from);

        // push before the first add_chunk: a single-chunk frame completes
        //  synchronously and the completion path looks the id up in the queue
        self.assembling_queue.push_back(header.id, frame.clone());
        frame.add_chunk(&header, payload).await;
    }

    /// Dropped frames are reclaimed here, on the ingress path of the next new
    ///  frame - never from the drop-timer callback itself.
    fn drain_dropped_queue(&self) {
        loop {
            let id = self.dropped_queue.lock().unwrap().pop_front();
            let Some(id) = id else { break };

            if let Some(frame) = self.assembling_queue.erase(&id) {
                if let Some(block) = frame.take_data() {
                    self.data_pool.release(block);
                }
            }
            debug!("reclaimed buffers of dropped frame #{}", id);
        }
    }

    fn release_frame(&self, id: u32) {
        if let Some(frame) = self.assembling_queue.erase(&id) {
            if let Some(block) = frame.take_data() {
                self.data_pool.release(block);
            }
        }
    }
}

#[async_trait]
impl FrameEvents for ReceiverShared {
    async fn request_resend(&self, header: ChunkHeader, to: SocketAddr) {
        let Some(mut block) = self.resend_pool.acquire() else {
            // not fatal: the NAK loop reissues on its next tick
            warn!(
                "resend pool exhausted - skipping NAK for frame #{} chunk {}",
                header.id, header.chunk_index
            );
            return;
        };

        {
            let mut buf = block.as_mut_slice();
            header.ser(&mut buf);
        }
        self.nak_socket
            .send_datagram(to, &block.as_slice()[..ChunkHeader::SERIALIZED_LEN])
            .await;
        self.resend_pool.release(block);
    }

    async fn frame_assembled(&self, id: u32, total_size: u32) {
        self.assembled_count.fetch_add(1, Ordering::Relaxed);
        trace!("frame #{} assembled with {} bytes", id, total_size);

        let Some(frame) = self.assembling_queue.find(&id) else {
            return;
        };

        match &self.handler {
            Some(handler) => {
                // deliberate copy-out: the pool block can be recycled promptly
                //  even if the application retains the buffer
                let Some(data) = frame.assembled_bytes() else {
                    return;
                };
                let release = FrameRelease {
                    shared: self.self_weak.clone(),
                    id,
                };
                handler.on_frame(data, release).await;
            }
            None => self.release_frame(id),
        }
    }

    async fn frame_dropped(&self, id: u32) {
        self.dropped_queue.lock().unwrap().push_back(id);
        self.dropped_count.fetch_add(1, Ordering::Relaxed);
    }
}
