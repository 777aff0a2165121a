//! ChunkStream turns an unreliable datagram channel into a reliable,
//!  bounded-latency stream of large application *frames*.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *frames*, i.e. defined-length chunks of
//!   application data (e.g. video frames, sensor snapshots) as opposed to a stream of bytes
//! * Frames bigger than a single datagram are sent without IP-level fragmentation - the
//!   protocol takes care of chunking, buffering and re-assembling
//!   * configured MTU since discovery does not work reliably
//! * The default is to assume delivery unless a negative ack is sent
//!   * a receiver that stops hearing from the sender mid-frame asks for the missing
//!     chunks explicitly, repeating the request on a fixed period
//! * Bounded latency beats full reliability: a frame that cannot be completed within a
//!   fixed deadline is *dropped*, its buffers reclaimed, and the stream continues with
//!   fresh frames
//! * Allocation on the hot path is bounded on both sides by fixed-block memory pools -
//!   a full pool shows up as drops / back-pressure, never as unbounded memory growth
//! * Frames are delivered in completion order, which can differ from send order when
//!   losses delay an earlier frame
//! * A single logical peer per receiver; the peer address is learned from the first
//!   chunk of each frame
//!
//! Explicitly *not* goals: congestion control, flow control, encryption, in-order
//!  delivery across frames, multi-sender fan-in.
//!
//! ## Header
//!
//! Every datagram starts with a fixed-length chunk header - all numbers in network
//!  byte order (BE):
//!
//! ```ascii
//! 0:  frame id (u32): monotonic counter assigned by the sender
//! 4:  total size (u32): payload byte count of the entire frame
//! 8:  total chunks (u16): number of chunks the frame was split into
//! 10: chunk index (u16): 0-based position of this chunk within the frame
//! 12: chunk size (u32): payload byte count carried in this chunk
//! 16: transmission type (u16):
//!     * 0 INIT - sender-initiated transmission
//!     * 1 RESEND - sender's answer to a NAK
//! 18: padding (2 bytes, zero)
//! ```
//!
//! INIT and RESEND datagrams carry exactly `chunk size` payload bytes after the
//!  header. Every chunk except a frame's last carries exactly `PAYLOAD` bytes
//!  (`MTU - 28 - header`), so the receiver can reassemble into a contiguous buffer
//!  at offset `chunk_index * PAYLOAD`.
//!
//! ## NAK
//!
//! A NAK is a header-only datagram from receiver to sender requesting retransmission
//!  of one chunk. Only `frame id`, `chunk index` and `total chunks` are meaningful;
//!  the other fields are zero. The sender answers with a RESEND datagram for that
//!  chunk, restoring the sizes from its retransmission store.
//!
//! NAKs are driven by a quiet timer: if the sender goes silent for
//!  [`config::INIT_CHUNK_TIMEOUT`] while chunks are still missing, the receiver
//!  assumes loss and NAKs every missing chunk each [`config::RESEND_TIMEOUT`] until
//!  the frame either completes or hits [`config::FRAME_DROP_TIMEOUT`] and is dropped.
//!
//! ## Related:
//! * TCP
//!   * positive cumulative ACK, retransmission timeout on the *sender*
//!   * head-of-line blocking across application messages
//! * QUIC
//!   * connection based - initial handshake, enforces encryption
//!   * stream per 'message', focus on large transfers
//! * Aeron
//!   * NAK-based like this protocol, but with pub/sub semantics and
//!     dedicated pre-allocated buffers per peer

pub mod chunk_header;
pub mod config;
pub mod memory_pool;
pub mod ordered_hash;
pub mod receiver;
pub mod receiving_frame;
pub mod safe_converter;
pub mod sender;
pub mod socket;
