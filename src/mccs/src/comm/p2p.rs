use std::collections::VecDeque;

use super::Communicator;
use crate::device::DevicePtr;
use crate::error::GroupError;
use crate::transport::channel::{ConnType, PeerConnId};
use crate::transport::ConnIndex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct P2pInfo {
    pub buf: Option<DevicePtr>,
    pub num_bytes: usize,
}

/// Transfers queued for one peer in one direction, in arrival order.
#[derive(Debug, Default)]
pub struct P2pQueue {
    entries: VecDeque<P2pInfo>,
}

impl P2pQueue {
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peek(&self) -> Option<&P2pInfo> {
        self.entries.front()
    }
}

/// Per-peer send and receive queues of a communicator.
///
/// Queues are allocated on first use and released again when recycled.
/// The pending counts always equal the number of queued entries.
#[derive(Debug)]
pub struct P2pQueues {
    sends: Vec<Option<P2pQueue>>,
    recvs: Vec<Option<P2pQueue>>,
    send_count: usize,
    recv_count: usize,
}

impl P2pQueues {
    pub fn new(num_ranks: usize) -> Self {
        P2pQueues {
            sends: (0..num_ranks).map(|_| None).collect(),
            recvs: (0..num_ranks).map(|_| None).collect(),
            send_count: 0,
            recv_count: 0,
        }
    }

    #[inline]
    pub fn send_count(&self) -> usize {
        self.send_count
    }

    #[inline]
    pub fn recv_count(&self) -> usize {
        self.recv_count
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.send_count > 0 || self.recv_count > 0
    }

    pub fn push_send(&mut self, peer: usize, info: P2pInfo) {
        self.sends[peer]
            .get_or_insert_with(P2pQueue::default)
            .entries
            .push_back(info);
        self.send_count += 1;
    }

    pub fn push_recv(&mut self, peer: usize, info: P2pInfo) {
        self.recvs[peer]
            .get_or_insert_with(P2pQueue::default)
            .entries
            .push_back(info);
        self.recv_count += 1;
    }

    pub fn pop_send(&mut self, peer: usize) -> Option<P2pInfo> {
        let info = self.sends[peer].as_mut()?.entries.pop_front()?;
        self.send_count -= 1;
        Some(info)
    }

    pub fn pop_recv(&mut self, peer: usize) -> Option<P2pInfo> {
        let info = self.recvs[peer].as_mut()?.entries.pop_front()?;
        self.recv_count -= 1;
        Some(info)
    }

    pub fn send_queue(&self, peer: usize) -> Option<&P2pQueue> {
        self.sends[peer].as_ref()
    }

    pub fn recv_queue(&self, peer: usize) -> Option<&P2pQueue> {
        self.recvs[peer].as_ref()
    }

    /// Releases the send queue of `peer`, dropping whatever is left in it.
    pub fn recycle_send(&mut self, peer: usize) {
        if let Some(queue) = self.sends[peer].take() {
            self.send_count -= queue.len();
        }
    }

    pub fn recycle_recv(&mut self, peer: usize) {
        if let Some(queue) = self.recvs[peer].take() {
            self.recv_count -= queue.len();
        }
    }

    /// Drops every queued transfer. Returns the number dropped.
    pub fn recycle_all(&mut self) -> usize {
        let dropped = self.send_count + self.recv_count;
        self.sends.iter_mut().for_each(|q| *q = None);
        self.recvs.iter_mut().for_each(|q| *q = None);
        self.send_count = 0;
        self.recv_count = 0;
        dropped
    }

    pub fn num_allocated(&self) -> usize {
        self.sends.iter().chain(self.recvs.iter()).filter(|q| q.is_some()).count()
    }
}

impl Communicator {
    fn check_peer(&self, peer: usize) -> Result<(), GroupError> {
        if peer >= self.num_ranks {
            return Err(GroupError::invalid_argument(format!(
                "peer {} out of range for {} ranks",
                peer, self.num_ranks
            )));
        }
        Ok(())
    }

    pub fn enqueue_send(
        &mut self,
        peer: usize,
        buf: Option<DevicePtr>,
        num_bytes: usize,
    ) -> Result<(), GroupError> {
        self.check_peer(peer)?;
        self.check_fatal()?;
        if buf.is_none() && num_bytes > 0 {
            return Err(GroupError::invalid_argument("null send buffer"));
        }
        let conn_index = self.profile.p2p_conn_index(num_bytes);
        let delta = (self.num_ranks + peer - self.rank) % self.num_ranks;
        self.request_connect(peer, delta, ConnType::Send, conn_index);
        self.p2p.push_send(peer, P2pInfo { buf, num_bytes });
        Ok(())
    }

    pub fn enqueue_recv(
        &mut self,
        peer: usize,
        buf: Option<DevicePtr>,
        num_bytes: usize,
    ) -> Result<(), GroupError> {
        self.check_peer(peer)?;
        self.check_fatal()?;
        if buf.is_none() && num_bytes > 0 {
            return Err(GroupError::invalid_argument("null recv buffer"));
        }
        let conn_index = self.profile.p2p_conn_index(num_bytes);
        let delta = (self.num_ranks + self.rank - peer) % self.num_ranks;
        self.request_connect(peer, delta, ConnType::Recv, conn_index);
        self.p2p.push_recv(peer, P2pInfo { buf, num_bytes });
        Ok(())
    }

    fn request_connect(
        &mut self,
        peer: usize,
        delta: usize,
        conn_type: ConnType,
        conn_index: ConnIndex,
    ) {
        if peer == self.rank {
            return;
        }
        for channel in self.p2p_layout.peer_channels(delta) {
            let conn = PeerConnId {
                peer_rank: peer,
                channel,
                conn_index,
                conn_type,
            };
            if !self.p2p_connected.contains(&conn) {
                self.connect[conn_index.as_usize()].request(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::tests::test_comm;

    fn buf(addr: usize) -> Option<DevicePtr> {
        DevicePtr::new(addr)
    }

    #[test]
    fn counts_track_queues() {
        let mut queues = P2pQueues::new(4);
        queues.push_send(1, P2pInfo { buf: buf(0x10), num_bytes: 8 });
        queues.push_send(1, P2pInfo { buf: buf(0x20), num_bytes: 16 });
        queues.push_recv(3, P2pInfo { buf: buf(0x30), num_bytes: 4 });
        assert_eq!((queues.send_count(), queues.recv_count()), (2, 1));

        assert_eq!(queues.pop_send(1).map(|i| i.num_bytes), Some(8));
        assert_eq!(queues.pop_send(2), None);
        assert_eq!(queues.send_count(), 1);

        queues.recycle_send(1);
        assert_eq!(queues.send_count(), 0);
        assert!(queues.send_queue(1).is_none());
        assert_eq!(queues.recycle_all(), 1);
        assert!(!queues.has_pending());
        assert_eq!(queues.num_allocated(), 0);
    }

    #[test]
    fn send_requests_connection_once() {
        let mut comm = test_comm(0, 4);
        comm.enqueue_send(1, buf(0x1000), 64).unwrap();
        assert!(comm.needs_connect(ConnIndex::Default));
        assert!(!comm.needs_connect(ConnIndex::P2pNet));
        let requested = comm.connect[0].pending().count();
        assert_eq!(requested, comm.p2p_layout.channels_per_peer as usize);

        assert_eq!(comm.mark_connected(ConnIndex::Default), requested);
        comm.enqueue_send(1, buf(0x1000), 64).unwrap();
        assert!(!comm.needs_connect(ConnIndex::Default));
        assert_eq!(comm.p2p.send_count(), 2);
    }

    #[test]
    fn large_recv_requests_net_connection() {
        let mut comm = test_comm(2, 4);
        let bytes = comm.profile.p2p_net_threshold + 1;
        comm.enqueue_recv(1, buf(0x1000), bytes).unwrap();
        assert!(comm.needs_connect(ConnIndex::P2pNet));
        assert!(comm.connect[1]
            .pending()
            .all(|c| c.conn_type == ConnType::Recv && c.peer_rank == 1));
    }

    #[test]
    fn self_transfer_needs_no_connection() {
        let mut comm = test_comm(1, 2);
        comm.enqueue_send(1, buf(0x1000), 32).unwrap();
        comm.enqueue_recv(1, buf(0x2000), 32).unwrap();
        assert!(!comm.needs_connect(ConnIndex::Default));
    }

    #[test]
    fn rejects_bad_peer() {
        let mut comm = test_comm(0, 2);
        assert!(matches!(
            comm.enqueue_send(2, buf(0x1000), 1),
            Err(GroupError::InvalidArgument(_))
        ));
        assert!(comm.enqueue_recv(1, None, 0).is_ok());
    }
}
