use std::cmp::min;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

use crate::chunk_header::{ChunkHeader, TransmissionType};
use crate::config::ChunkConfig;
use crate::memory_pool::{MemoryPool, PoolBlock};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::socket::DatagramSocket;

/// id of a retransmission slot that has never carried a frame
const UNUSED_ID: u32 = u32::MAX;

/// Sending side of the protocol: fragments frames into MTU-sized chunks, keeps
///  every chunk in a circular retransmission store, and answers the receiver's
///  NAKs with RESEND datagrams out of that store.
///
/// A slot stays claimed while any transmission referring to its buffers is in
///  flight (`ref_count > 0`). When every slot is claimed, [`send`](Sender::send)
///  waits for one to free up - that is the protocol's back-pressure.
pub struct Sender {
    remote_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    send_socket: Arc<dyn DatagramSocket>,
    payload: usize,
    /// circular retransmission store, indexed round-robin by `buffer_index`
    slots: Vec<Mutex<SendingFrame>>,
    buffer_index: AtomicUsize,
    next_id: AtomicU32,
    /// serializes slot claiming against NAK lookup: the id lookup needs the slot
    ///  array to be quiescent. Lock order is buffering -> slot, never reversed.
    buffering: tokio::sync::Mutex<()>,
    /// wire buffers for outgoing datagrams, so no slot lock is held across a send
    scratch_pool: MemoryPool,
    running: AtomicBool,
    shutdown: Notify,
}

struct SendingFrame {
    id: u32,
    /// per-chunk retransmit images, each `header + payload` as last transmitted
    chunks: Vec<Vec<u8>>,
    /// canonical headers last written per chunk - NAKs carry neither
    ///  `total_size` nor `chunk_size`, so RESENDs restore them from here
    headers: Vec<Option<ChunkHeader>>,
    /// outstanding transmissions referring to this slot's buffers; the slot may
    ///  only be reused for a new frame at zero
    ref_count: u16,
}

impl SendingFrame {
    fn new(preallocated_chunks: usize, chunk_buf_len: usize) -> SendingFrame {
        SendingFrame {
            id: UNUSED_ID,
            chunks: vec![vec![0; chunk_buf_len]; preallocated_chunks],
            headers: vec![None; preallocated_chunks],
            ref_count: 0,
        }
    }
}

impl Sender {
    /// Binds a UDP socket on an OS-chosen port and pre-allocates the
    ///  retransmission store for `config.buffer_size` frames of up to
    ///  `config.max_data_size` bytes each.
    pub async fn new(remote_addr: SocketAddr, config: ChunkConfig) -> anyhow::Result<Sender> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        info!("bound send socket to {:?}", socket.local_addr());

        Ok(Self::from_parts(remote_addr, socket.clone(), Arc::new(socket), config))
    }

    fn from_parts(
        remote_addr: SocketAddr,
        socket: Arc<UdpSocket>,
        send_socket: Arc<dyn DatagramSocket>,
        config: ChunkConfig,
    ) -> Sender {
        let chunk_buf_len = config.datagram_size();
        let slots = (0..config.buffer_size)
            .map(|_| Mutex::new(SendingFrame::new(config.max_total_chunks(), chunk_buf_len)))
            .collect();

        Sender {
            remote_addr,
            socket,
            send_socket,
            payload: config.payload(),
            slots,
            buffer_index: AtomicUsize::new(0),
            next_id: AtomicU32::new(0),
            buffering: tokio::sync::Mutex::new(()),
            scratch_pool: MemoryPool::new(chunk_buf_len, config.buffer_size),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Fragments `data` into chunks and hands every chunk to the socket layer.
    ///  Returns once all chunks are sent; blocks while no retransmission slot is
    ///  free (back-pressure).
    pub async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        if data.is_empty() {
            bail!("cannot send an empty frame");
        }
        let total_chunks = data.len().div_ceil(self.payload);
        if total_chunks > u16::MAX as usize {
            bail!(
                "frame of {} bytes needs {} chunks, which exceeds the chunk index space",
                data.len(),
                total_chunks
            );
        }

        let mut header = ChunkHeader::for_frame(self.next_frame_id(), data.len(), self.payload);
        let slot_idx = self.claim_slot(header.id, header.total_chunks).await;

        trace!(
            "frame #{}: sending {} bytes as {} chunks from slot {}",
            header.id,
            data.len(),
            header.total_chunks,
            slot_idx
        );

        for i in 0..total_chunks {
            let offset = i * self.payload;
            let chunk_size = min(self.payload, data.len() - offset);
            header.chunk_index = i.prechecked_cast();
            header.chunk_size = chunk_size.prechecked_cast();

            let mut scratch = self.acquire_scratch().await;
            let datagram_len = ChunkHeader::SERIALIZED_LEN + chunk_size;
            {
                let mut slot = self.slots[slot_idx].lock().unwrap();
                let slot = &mut *slot;

                // write the retransmit image first, then copy it out for the wire
                let chunk_buf = &mut slot.chunks[i];
                {
                    let mut w = &mut chunk_buf[..];
                    header.ser(&mut w);
                }
                chunk_buf[ChunkHeader::SERIALIZED_LEN..datagram_len]
                    .copy_from_slice(&data[offset..offset + chunk_size]);
                slot.headers[i] = Some(header);

                scratch.as_mut_slice()[..datagram_len].copy_from_slice(&chunk_buf[..datagram_len]);
            }

            self.send_socket
                .send_datagram(self.remote_addr, &scratch.as_slice()[..datagram_len])
                .await;
            self.scratch_pool.release(scratch);

            self.slots[slot_idx].lock().unwrap().ref_count -= 1;
        }

        Ok(())
    }

    /// The NAK ingress loop: runs until [`stop`](Sender::stop) is called.
    pub async fn run(&self) {
        info!("starting NAK ingress loop");
        self.running.store(true, Ordering::Release);

        let mut buf = vec![0u8; ChunkHeader::SERIALIZED_LEN + self.payload];
        while self.running.load(Ordering::Acquire) {
            let received = tokio::select! {
                r = self.socket.recv_from(&mut buf) => Some(r),
                _ = self.shutdown.notified() => None,
            };

            match received {
                None => break,
                Some(Err(e)) => error!("socket error: {}", e),
                Some(Ok((num_read, from))) => {
                    if num_read < ChunkHeader::SERIALIZED_LEN {
                        debug!("datagram of {} bytes is below header size - dropping", num_read);
                        continue;
                    }
                    match ChunkHeader::deser(&mut &buf[..num_read]) {
                        Ok(header) => self.handle_nak(header).await,
                        Err(_) => {
                            debug!("received datagram with unparsable header from {:?} - dropping", from)
                        }
                    }
                }
            }
        }
        info!("NAK ingress loop stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        // notify_one stores a permit, so a stop between two receives is not lost
        self.shutdown.notify_one();
    }

    /// Answers a NAK with a RESEND datagram out of the retransmission store. NAKs
    ///  for ids no longer (or never) in the store are ignored.
    async fn handle_nak(&self, nak: ChunkHeader) {
        let (slot_idx, scratch, datagram_len) = {
            let _guard = self.buffering.lock().await;

            let Some(slot_idx) = self.find_slot(nak.id) else {
                debug!("NAK for unknown frame #{} - ignoring", nak.id);
                return;
            };

            let mut slot = self.slots[slot_idx].lock().unwrap();
            let chunk_index: usize = nak.chunk_index.safe_cast();
            let canonical = match slot.headers.get(chunk_index) {
                Some(Some(header)) => *header,
                _ => {
                    debug!(
                        "NAK for frame #{} chunk {} that was never sent - ignoring",
                        nak.id, nak.chunk_index
                    );
                    return;
                }
            };

            // the NAK carries neither total_size nor chunk_size - restore them
            //  from the stored header and flip the type to RESEND
            let mut resend = canonical;
            resend.transmission_type = TransmissionType::Resend;

            let Some(mut scratch) = self.scratch_pool.acquire() else {
                debug!(
                    "scratch pool exhausted - skipping RESEND for frame #{} chunk {}",
                    nak.id, nak.chunk_index
                );
                return;
            };

            slot.ref_count += 1;

            let chunk_size: usize = resend.chunk_size.safe_cast();
            let datagram_len = ChunkHeader::SERIALIZED_LEN + chunk_size;
            {
                let chunk_buf = &mut slot.chunks[chunk_index];
                let mut w = &mut chunk_buf[..];
                resend.ser(&mut w);
            }
            scratch.as_mut_slice()[..datagram_len]
                .copy_from_slice(&slot.chunks[chunk_index][..datagram_len]);

            (slot_idx, scratch, datagram_len)
        };

        trace!("frame #{}: resending chunk {}", nak.id, nak.chunk_index);
        self.send_socket
            .send_datagram(self.remote_addr, &scratch.as_slice()[..datagram_len])
            .await;
        self.scratch_pool.release(scratch);

        self.slots[slot_idx].lock().unwrap().ref_count -= 1;
    }

    fn next_frame_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            // the id counter wraps; skip the slot sentinel
            if id != UNUSED_ID {
                return id;
            }
        }
    }

    /// Claims the next free slot round-robin, waiting while every slot is still
    ///  referenced by in-flight transmissions.
    async fn claim_slot(&self, id: u32, total_chunks: u16) -> usize {
        loop {
            {
                let _guard = self.buffering.lock().await;
                let idx = self.buffer_index.fetch_add(1, Ordering::Relaxed) % self.slots.len();

                let mut slot = self.slots[idx].lock().unwrap();
                if slot.ref_count == 0 {
                    let num_chunks: usize = total_chunks.safe_cast();
                    slot.id = id;
                    slot.ref_count = total_chunks;
                    // stale headers of the previous tenant must not answer NAKs
                    //  for the new frame
                    for header in &mut slot.headers {
                        *header = None;
                    }
                    if slot.chunks.len() < num_chunks {
                        let chunk_buf_len = ChunkHeader::SERIALIZED_LEN + self.payload;
                        slot.chunks.resize_with(num_chunks, || vec![0; chunk_buf_len]);
                        slot.headers.resize(num_chunks, None);
                    }
                    return idx;
                }
            }
            tokio::task::yield_now().await;
        }
    }

    /// Looks up the slot carrying `id`. Must be called under the buffering mutex.
    fn find_slot(&self, id: u32) -> Option<usize> {
        if id == UNUSED_ID {
            return None;
        }

        let ids: Vec<u32> = self.slots.iter().map(|s| s.lock().unwrap().id).collect();

        // while any slot was never written, its sentinel breaks the
        //  rotated-sorted invariant - fall back to a linear scan
        if ids.iter().any(|&slot_id| slot_id == UNUSED_ID) {
            return ids.iter().position(|&slot_id| slot_id == id);
        }

        rotated_search(&ids, id)
    }

    /// Waits for a wire buffer; the pool bounds concurrent in-flight sends.
    async fn acquire_scratch(&self) -> PoolBlock {
        loop {
            if let Some(block) = self.scratch_pool.acquire() {
                return block;
            }
            tokio::task::yield_now().await;
        }
    }
}

/// Binary search over a rotated sorted array: slot ids are written round-robin
///  from a monotonic counter, so the sequence is sorted with exactly one wrap
///  point.
///
/// NB: when the id counter itself wraps around u32 a second wrap point appears
///  and ids are not found reliably for the few frames spanning that boundary.
fn rotated_search(ids: &[u32], id: u32) -> Option<usize> {
    let mut lo = 0;
    let mut hi = ids.len();

    while lo < hi {
        let mid = (lo + hi) / 2;
        if ids[mid] == id {
            return Some(mid);
        }

        if ids[lo] <= ids[mid] {
            // the left half is sorted
            if ids[lo] <= id && id < ids[mid] {
                hi = mid;
            }
            else {
                lo = mid + 1;
            }
        }
        else {
            // the right half is sorted
            if ids[mid] < id && id <= ids[hi - 1] {
                lo = mid + 1;
            }
            else {
                hi = mid;
            }
        }
    }
    None
}
