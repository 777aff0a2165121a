use std::time::Duration;

use anyhow::bail;

use crate::chunk_header::ChunkHeader;

/// How long the receiver waits after the last fresh INIT chunk of an incomplete
///  frame before assuming loss and starting to NAK.
pub const INIT_CHUNK_TIMEOUT: Duration = Duration::from_millis(20);

/// Period of the NAK re-emission loop once a frame is in resend mode.
pub const RESEND_TIMEOUT: Duration = Duration::from_millis(20);

/// Deadline for completing a frame once resend mode started; on expiry the frame
///  is dropped and its buffers reclaimed.
pub const FRAME_DROP_TIMEOUT: Duration = Duration::from_millis(100);

/// IPv4 header + UDP header bytes assumed to precede the payload in every datagram.
const IP_UDP_OVERHEAD: usize = 20 + 8;

#[derive(Clone, Debug)]
pub struct ChunkConfig {
    /// The full datagram budget per chunk is derived from this as `mtu - 28`
    ///  (IPv4 + UDP headers). ChunkStream never sends datagrams that would fragment
    ///  at the IP layer, so this must be supported end-to-end between the peers -
    ///  this is configured rather than discovered because path MTU discovery does
    ///  not work reliably across surprising network hardware.
    ///
    /// Choosing this too big causes chunks to be dropped by the network; choosing
    ///  it too small wastes bandwidth on headers.
    pub mtu: usize,

    /// Number of pool blocks per side: in-flight inbound frames on the receiver,
    ///  retained retransmission slots on the sender. When all sender slots are
    ///  still referenced by in-flight transmissions, `send` blocks (back-pressure);
    ///  when all receiver blocks are in use, new frames are dropped on arrival.
    pub buffer_size: usize,

    /// Size in bytes of the largest frame this configuration is provisioned for.
    ///  Both sides pre-allocate their per-frame buffers from this.
    pub max_data_size: usize,
}

impl ChunkConfig {
    pub fn new(max_data_size: usize) -> ChunkConfig {
        ChunkConfig {
            mtu: 1500,
            buffer_size: 10,
            max_data_size,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= IP_UDP_OVERHEAD + ChunkHeader::SERIALIZED_LEN {
            bail!("mtu of {} leaves no room for chunk payload", self.mtu);
        }
        if self.buffer_size == 0 {
            bail!("buffer_size must be at least 1");
        }
        if self.max_data_size == 0 {
            bail!("max_data_size must be at least 1");
        }
        if self.max_total_chunks() > u16::MAX as usize {
            bail!(
                "max_data_size of {} needs more than {} chunks at mtu {}",
                self.max_data_size,
                u16::MAX,
                self.mtu
            );
        }
        Ok(())
    }

    /// application payload bytes per chunk
    pub fn payload(&self) -> usize {
        self.mtu - IP_UDP_OVERHEAD - ChunkHeader::SERIALIZED_LEN
    }

    /// UDP payload bytes per chunk, i.e. header plus application payload
    pub fn datagram_size(&self) -> usize {
        self.mtu - IP_UDP_OVERHEAD
    }

    /// chunks needed for a frame of `max_data_size` bytes
    pub fn max_total_chunks(&self) -> usize {
        self.max_data_size.div_ceil(self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = ChunkConfig::new(1024 * 1024);

        assert_eq!(config.mtu, 1500);
        assert_eq!(config.buffer_size, 10);
        assert_eq!(config.payload(), 1452);
        assert_eq!(config.datagram_size(), 1472);
        config.validate().unwrap();
    }

    #[rstest]
    #[case::one_byte(1, 1)]
    #[case::one_chunk(1452, 1)]
    #[case::just_over(1453, 2)]
    #[case::three(4000, 3)]
    fn test_max_total_chunks(#[case] max_data_size: usize, #[case] expected: usize) {
        let config = ChunkConfig::new(max_data_size);
        assert_eq!(config.max_total_chunks(), expected);
    }

    #[rstest]
    #[case::mtu_too_small(ChunkConfig { mtu: 48, buffer_size: 10, max_data_size: 100 })]
    #[case::zero_buffers(ChunkConfig { mtu: 1500, buffer_size: 0, max_data_size: 100 })]
    #[case::zero_max_data(ChunkConfig { mtu: 1500, buffer_size: 10, max_data_size: 0 })]
    #[case::too_many_chunks(ChunkConfig { mtu: 1500, buffer_size: 10, max_data_size: 1452 * 70000 })]
    fn test_validate_rejects(#[case] config: ChunkConfig) {
        assert!(config.validate().is_err());
    }
}
