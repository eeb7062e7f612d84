use std::collections::BTreeSet;
use std::fmt::Display;

use super::ConnIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnType {
    Send,
    Recv,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.to_string().as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerConnId {
    pub peer_rank: usize,
    pub channel: ChannelId,
    pub conn_index: ConnIndex,
    pub conn_type: ConnType,
}

/// Peer connections a communicator still has to establish on one
/// connection index before its queued P2P work can run.
#[derive(Clone, Debug, Default)]
pub struct ConnectRequests {
    pending: BTreeSet<PeerConnId>,
}

impl ConnectRequests {
    #[inline]
    pub fn needs_connect(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn request(&mut self, conn: PeerConnId) {
        self.pending.insert(conn);
    }

    pub fn pending(&self) -> impl Iterator<Item = &PeerConnId> {
        self.pending.iter()
    }

    pub fn take(&mut self) -> BTreeSet<PeerConnId> {
        std::mem::take(&mut self.pending)
    }
}

/// Bit-mirrored assignment of per-peer P2P channels.
///
/// With few channels per peer, consecutive peers land on channels spread
/// over the whole P2P channel space instead of piling onto the first ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct P2pChannelLayout {
    pub num_channels: u32,
    pub channels_per_peer: u32,
    pub channels: Vec<u32>,
}

impl P2pChannelLayout {
    pub fn new(num_channels: u32, channels_per_peer: u32) -> Self {
        let num_channels = num_channels.max(1).next_power_of_two();
        let channels_per_peer = channels_per_peer
            .max(1)
            .next_power_of_two()
            .min(num_channels);
        let channels = (0..channels_per_peer)
            .map(|c| {
                let mut mirror = 0;
                let mut b = 1;
                let mut mb = num_channels >> 1;
                while b < num_channels {
                    if c & b != 0 {
                        mirror |= mb;
                    }
                    b <<= 1;
                    mb >>= 1;
                }
                mirror
            })
            .collect();
        P2pChannelLayout {
            num_channels,
            channels_per_peer,
            channels,
        }
    }

    /// Channel used by the `chunk`-th piece of a transfer at `delta`.
    #[inline]
    pub fn channel_for(&self, delta: usize, chunk: usize) -> ChannelId {
        let base = self.channels[chunk % self.channels_per_peer as usize] as usize;
        ChannelId(((delta + base) % self.num_channels as usize) as u32)
    }

    pub fn peer_channels(&self, delta: usize) -> impl Iterator<Item = ChannelId> + '_ {
        (0..self.channels_per_peer as usize).map(move |c| self.channel_for(delta, c))
    }
}
