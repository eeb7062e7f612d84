//! P2P transfer scheduling.
//!
//! Each round visits every peer offset ("delta") once, in the order
//! 0, +1, -1, +2, -2, ... interleaved with the half-way peer and its
//! mirror, so that ranks talking to each other get scheduled together.
//! Every matched send/recv pair is cut into chunks spread over the
//! channels assigned to the peer.

use crate::comm::p2p::{P2pInfo, P2pQueues};
use crate::comm::{CommProfile, Communicator, CommunicatorId};
use crate::device::DevicePtr;
use crate::error::GroupError;
use crate::transport::channel::{ChannelId, P2pChannelLayout};
use crate::transport::ConnIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferSide {
    pub peer: usize,
    pub num_bytes: usize,
    pub buf: Option<DevicePtr>,
    pub conn_index: ConnIndex,
}

/// One chunk of a send/recv pair, bound to a channel.
/// A missing side means that direction has nothing to do in this chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub comm: CommunicatorId,
    pub delta: usize,
    pub channel: ChannelId,
    pub recv: Option<TransferSide>,
    pub send: Option<TransferSide>,
}

/// Peer offsets of one scheduling round.
pub fn round_deltas(num_ranks: usize) -> Vec<usize> {
    let n = num_ranks;
    let mut order = Vec::with_capacity(n);
    if n == 0 {
        return order;
    }
    for d in 0..=n / 4 {
        let deltas = [d, (n - d) % n, n / 2 - d, (n - (n / 2 - d)) % n];
        let mut index = 0;
        loop {
            order.push(deltas[index]);
            index += 1;
            if index == 1 && deltas[1] == deltas[0] {
                index += 1;
            }
            if index == 2 && deltas[2] == deltas[0] {
                index += 1;
            }
            if index == 3 && deltas[3] == deltas[2] {
                index += 1;
            }
            if index == 3 && deltas[3] == deltas[1] {
                index += 1;
            }
            if index >= 4 {
                break;
            }
        }
    }
    order
}

/// Chunk size for a transfer of `total` bytes.
pub fn p2p_chunk_size(
    total: usize,
    min_channels: usize,
    max_channels: usize,
    min_size: usize,
    max_size: usize,
) -> usize {
    let mut size = min_size.max(total.div_ceil(min_channels));
    let mut num_channels = min_channels;
    while size > max_size && num_channels <= max_channels / 2 {
        num_channels *= 2;
        size = total.div_ceil(num_channels);
    }
    size.div_ceil(min_size) * min_size
}

/// Bytes of the chunk at `offset`, or `None` when this direction skips it.
/// A zero-byte total yields one explicit zero-byte chunk.
fn chunk_bytes(total: Option<usize>, offset: usize, chunk_size: usize, remaining: &mut bool) -> Option<usize> {
    let Some(total) = total else {
        *remaining = false;
        return None;
    };
    if total > offset + chunk_size {
        return Some(chunk_size);
    }
    *remaining = false;
    if offset > total || (offset == total && total != 0) {
        None
    } else {
        Some(total - offset)
    }
}

#[derive(Clone, Debug)]
pub struct P2pScheduler {
    comm: CommunicatorId,
    rank: usize,
    num_ranks: usize,
    layout: P2pChannelLayout,
    step_size: usize,
    max_size: usize,
    min_channels: usize,
    max_channels: usize,
    profile: CommProfile,
}

impl P2pScheduler {
    pub fn new(comm: &Communicator) -> Self {
        let layout = comm.p2p_layout.clone();
        let budget = (comm.profile.num_channels as usize).max(layout.num_channels as usize);
        // try to use all channels
        let mut max_channels = layout.channels_per_peer as usize;
        let mut min_channels = max_channels;
        // but one channel per operation
        while min_channels * comm.num_ranks > budget && min_channels > 1 {
            min_channels /= 2;
        }
        // and avoid overloading channels with too many operations
        while max_channels * comm.num_ranks > budget * 4 && max_channels > 1 {
            max_channels /= 2;
        }
        P2pScheduler {
            comm: comm.id,
            rank: comm.rank,
            num_ranks: comm.num_ranks,
            layout,
            step_size: comm.profile.step_size(),
            max_size: comm.profile.max_p2p_chunk_size(),
            min_channels,
            max_channels,
            profile: comm.profile.clone(),
        }
    }

    #[inline]
    pub fn channel_budget(&self) -> (usize, usize) {
        (self.min_channels, self.max_channels)
    }

    fn chunk_size(&self, total: usize) -> usize {
        p2p_chunk_size(
            total,
            self.min_channels,
            self.max_channels,
            self.step_size,
            self.max_size,
        )
    }

    /// Drains `queues` into transfer descriptors.
    pub fn schedule(&self, queues: &mut P2pQueues) -> Result<Vec<TransferDescriptor>, GroupError> {
        let mut descs = Vec::new();
        let deltas = round_deltas(self.num_ranks);
        while queues.has_pending() {
            let before = (queues.send_count(), queues.recv_count());
            for &delta in deltas.iter() {
                self.schedule_delta(queues, delta, &mut descs)?;
            }
            if before == (queues.send_count(), queues.recv_count()) {
                return Err(GroupError::Internal(format!(
                    "{}: P2P scheduling made no progress with {} sends and {} recvs pending",
                    self.comm, before.0, before.1
                )));
            }
        }
        Ok(descs)
    }

    fn schedule_delta(
        &self,
        queues: &mut P2pQueues,
        delta: usize,
        descs: &mut Vec<TransferDescriptor>,
    ) -> Result<(), GroupError> {
        let n = self.num_ranks;
        let from = (self.rank + n - delta) % n;
        let to = (self.rank + delta) % n;
        let recv = queues.pop_recv(from);
        let send = queues.pop_send(to);

        if recv.is_some() || send.is_some() {
            self.slice_pair(delta, from, to, recv.as_ref(), send.as_ref(), descs)?;
        }
        if recv.is_none() {
            queues.recycle_recv(from);
        }
        if send.is_none() {
            queues.recycle_send(to);
        }
        Ok(())
    }

    fn slice_pair(
        &self,
        delta: usize,
        from: usize,
        to: usize,
        recv: Option<&P2pInfo>,
        send: Option<&P2pInfo>,
        descs: &mut Vec<TransferDescriptor>,
    ) -> Result<(), GroupError> {
        let total_recv = recv.map(|r| r.num_bytes);
        let total_send = send.map(|s| s.num_bytes);
        if delta == 0 && total_recv != total_send {
            return Err(GroupError::invalid_usage(format!(
                "{}: self send/recv size mismatch ({:?} sent, {:?} received)",
                self.comm, total_send, total_recv
            )));
        }
        let recv_chunk = total_recv.map_or(0, |t| self.chunk_size(t));
        let send_chunk = total_send.map_or(0, |t| self.chunk_size(t));
        let recv_conn = total_recv.map_or(ConnIndex::Default, |t| self.profile.p2p_conn_index(t));
        let send_conn = total_send.map_or(ConnIndex::Default, |t| self.profile.p2p_conn_index(t));

        let (mut recv_offset, mut send_offset) = (0, 0);
        let (mut recv_remaining, mut send_remaining) = (true, true);
        let mut chunk = 0;
        loop {
            let channel = self.layout.channel_for(delta, chunk);
            let recv_bytes = chunk_bytes(total_recv, recv_offset, recv_chunk, &mut recv_remaining);
            let send_bytes = chunk_bytes(total_send, send_offset, send_chunk, &mut send_remaining);
            if recv_bytes.is_some() || send_bytes.is_some() {
                descs.push(TransferDescriptor {
                    comm: self.comm,
                    delta,
                    channel,
                    recv: recv_bytes.map(|num_bytes| TransferSide {
                        peer: from,
                        num_bytes,
                        buf: recv.and_then(|r| r.buf).map(|b| b.byte_add(recv_offset)),
                        conn_index: recv_conn,
                    }),
                    send: send_bytes.map(|num_bytes| TransferSide {
                        peer: to,
                        num_bytes,
                        buf: send.and_then(|s| s.buf).map(|b| b.byte_add(send_offset)),
                        conn_index: send_conn,
                    }),
                });
            }
            recv_offset += recv_chunk;
            send_offset += send_chunk;
            chunk += 1;
            if !recv_remaining && !send_remaining {
                break;
            }
        }
        log::trace!(
            "{}: delta {} scheduled recv {:?} from {} / send {:?} to {} in {} chunks",
            self.comm,
            delta,
            total_recv,
            from,
            total_send,
            to,
            chunk
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::tests::test_comm;
    use crate::config::DefaultCommConfig;
    use crate::comm::{InitArgs, UniqueId};
    use rstest::rstest;

    fn buf(addr: usize) -> Option<DevicePtr> {
        DevicePtr::new(addr)
    }

    fn comm_with(rank: usize, num_ranks: usize, config: DefaultCommConfig) -> Communicator {
        let args = InitArgs {
            unique_id: UniqueId::from_u64(7),
            num_ranks,
            rank,
            cuda_dev: 0,
            clique: None,
        };
        Communicator::new(&args, &config).unwrap()
    }

    #[test]
    fn deltas_cover_every_peer_once() {
        for n in 1..=64 {
            let mut deltas = round_deltas(n);
            assert_eq!(deltas.len(), n, "world size {}", n);
            deltas.sort_unstable();
            deltas.dedup();
            assert_eq!(deltas, (0..n).collect::<Vec<_>>(), "world size {}", n);
        }
    }

    #[rstest]
    #[case(1, vec![0])]
    #[case(2, vec![0, 1])]
    #[case(4, vec![0, 2, 1, 3])]
    #[case(5, vec![0, 2, 3, 1, 4])]
    #[case(8, vec![0, 4, 1, 7, 3, 5, 2, 6])]
    fn delta_order(#[case] n: usize, #[case] expected: Vec<usize>) {
        assert_eq!(round_deltas(n), expected);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(4095)]
    #[case(4097)]
    #[case(300_000)]
    #[case(16 << 20)]
    fn chunk_size_is_step_multiple(#[case] total: usize) {
        for (min, max) in [(1, 1), (1, 4), (2, 8), (4, 4)] {
            let size = p2p_chunk_size(total, min, max, 4096, 4 * 4096);
            assert_eq!(size % 4096, 0);
            assert!(size >= 4096);
        }
    }

    #[test]
    fn chunk_size_doubles_channels() {
        // 1 MiB over at most 8 channels with 64 KiB max chunks
        assert_eq!(p2p_chunk_size(1 << 20, 1, 8, 16 << 10, 64 << 10), 128 << 10);
        assert_eq!(p2p_chunk_size(100, 1, 8, 4096, 16384), 4096);
    }

    #[test]
    fn self_exchange_is_one_pair() {
        let mut comm = test_comm(0, 2);
        comm.enqueue_send(0, buf(0x1000), 256).unwrap();
        comm.enqueue_recv(0, buf(0x2000), 256).unwrap();
        let sched = P2pScheduler::new(&comm);
        let descs = sched.schedule(&mut comm.p2p).unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].delta, 0);
        assert_eq!(descs[0].send.unwrap().num_bytes, 256);
        assert_eq!(descs[0].recv.unwrap().num_bytes, 256);
        assert!(!comm.p2p.has_pending());
    }

    #[test]
    fn asymmetric_self_exchange_fails() {
        let mut comm = test_comm(1, 3);
        comm.enqueue_send(1, buf(0x1000), 256).unwrap();
        comm.enqueue_recv(1, buf(0x2000), 128).unwrap();
        let sched = P2pScheduler::new(&comm);
        let err = sched.schedule(&mut comm.p2p).unwrap_err();
        assert!(matches!(err, GroupError::InvalidUsage(_)));
    }

    #[test]
    fn zero_byte_send_is_a_sync() {
        let mut comm = test_comm(0, 2);
        comm.enqueue_send(1, None, 0).unwrap();
        let descs = P2pScheduler::new(&comm).schedule(&mut comm.p2p).unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].send.map(|s| s.num_bytes), Some(0));
        assert!(descs[0].recv.is_none());
    }

    #[test]
    fn net_threshold_and_chunking() {
        let config = DefaultCommConfig {
            buf_sizes: [8 * 4096],
            channel_count: 4,
            p2p_channel_count: 16,
            p2p_channels_per_peer: 4,
            p2p_net: true,
            p2p_net_threshold: 131072,
            sendrecv_slice_factor: 4,
        };
        let mut comm = comm_with(0, 4, config);
        comm.enqueue_send(1, buf(0x10_0000), 300_000).unwrap();
        comm.enqueue_recv(3, buf(0x20_0000), 50).unwrap();
        let sched = P2pScheduler::new(&comm);
        assert_eq!(sched.channel_budget(), (4, 4));
        let descs = sched.schedule(&mut comm.p2p).unwrap();

        let sends: Vec<_> = descs.iter().filter_map(|d| d.send).collect();
        let recvs: Vec<_> = descs.iter().filter_map(|d| d.recv).collect();
        assert!(sends.len() > 1);
        assert_eq!(sends.iter().map(|s| s.num_bytes).sum::<usize>(), 300_000);
        assert!(sends.iter().all(|s| s.conn_index == ConnIndex::P2pNet && s.peer == 1));
        assert_eq!(recvs.len(), 1);
        assert_eq!(recvs[0].num_bytes, 50);
        assert_eq!(recvs[0].conn_index, ConnIndex::Default);
        assert!(descs.iter().all(|d| d.delta == 1));
        // chunks advance through the buffer
        assert_eq!(sends[1].buf.unwrap().addr().get() - 0x10_0000, sends[0].num_bytes);
    }

    #[test]
    fn descriptors_use_connections_requested_at_enqueue() {
        let config = DefaultCommConfig {
            p2p_net: false,
            p2p_net_threshold: 1024,
            ..DefaultCommConfig::default()
        };
        let mut comm = comm_with(0, 2, config);
        comm.enqueue_send(1, buf(0x10_0000), 300_000).unwrap();
        assert!(comm.needs_connect(ConnIndex::Default));
        assert!(!comm.needs_connect(ConnIndex::P2pNet));
        let descs = P2pScheduler::new(&comm).schedule(&mut comm.p2p).unwrap();
        assert!(!descs.is_empty());
        assert!(descs
            .iter()
            .filter_map(|d| d.send)
            .all(|s| s.conn_index == ConnIndex::Default));
    }

    #[test]
    fn queues_are_drained_in_order() {
        let mut comm = test_comm(0, 4);
        for i in 1..=3 {
            comm.enqueue_send(2, buf(0x1000 * i), 8 * i).unwrap();
        }
        let descs = P2pScheduler::new(&comm).schedule(&mut comm.p2p).unwrap();
        let sizes: Vec<_> = descs.iter().filter_map(|d| d.send.map(|s| s.num_bytes)).collect();
        assert_eq!(sizes, vec![8, 16, 24]);
        assert!(comm.p2p.send_queue(2).map_or(true, |q| q.is_empty()));
        assert!(comm.p2p.recv_queue(2).is_none());
    }
}
