pub mod p2p;
pub mod redop;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::DefaultCommConfig;
use crate::device::{CaptureId, CoreMask, DeviceIdx};
use crate::error::GroupError;
use crate::group::launch::IntraClique;
use crate::proxy::plan::{ChanWorkSchedule, KernelPlan};
use crate::proxy::task::TaskQueue;
use crate::proxy::ProxyState;
use crate::transport::channel::{ChannelId, ConnectRequests, P2pChannelLayout, PeerConnId};
use crate::transport::{ConnIndex, NUM_BUFFER_SLOTS, NUM_CONN_INDICES, NUM_PROTOCOLS, PROTOCOL_SIMPLE};

use p2p::P2pQueues;
use redop::UserRedOps;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommunicatorId(pub u64);

impl fmt::Display for CommunicatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comm#{}", self.0)
    }
}

static NEXT_COMMUNICATOR_ID: AtomicU64 = AtomicU64::new(1);

impl CommunicatorId {
    /// Process-unique id, never reused.
    pub fn next() -> Self {
        CommunicatorId(NEXT_COMMUNICATOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub const UNIQUE_ID_BYTES: usize = 128;

/// Identifies the collective session all ranks of a communicator join.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueId(pub [u8; UNIQUE_ID_BYTES]);

impl UniqueId {
    pub fn from_u64(id: u64) -> Self {
        let mut bytes = [0u8; UNIQUE_ID_BYTES];
        bytes[..8].copy_from_slice(&id.to_le_bytes());
        UniqueId(bytes)
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        write!(f, "UniqueId({:#x})", u64::from_le_bytes(head))
    }
}

// comm profile, setting and thresholds
#[derive(Clone, Debug)]
pub struct CommProfile {
    pub buff_sizes: [usize; NUM_PROTOCOLS],
    pub num_channels: u32,
    pub p2p_net: bool,
    pub p2p_net_threshold: usize,
    pub sendrecv_slice_factor: usize,
}

impl CommProfile {
    /// Natural P2P step size matching buffer slots.
    #[inline]
    pub fn step_size(&self) -> usize {
        (self.buff_sizes[PROTOCOL_SIMPLE] / NUM_BUFFER_SLOTS).max(1)
    }

    #[inline]
    pub fn max_p2p_chunk_size(&self) -> usize {
        self.sendrecv_slice_factor.max(1) * self.step_size()
    }

    /// Connection used by a P2P transfer of `total_bytes`.
    #[inline]
    pub fn p2p_conn_index(&self, total_bytes: usize) -> ConnIndex {
        if self.p2p_net && total_bytes > self.p2p_net_threshold {
            ConnIndex::P2pNet
        } else {
            ConnIndex::Default
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureState {
    // only meaningful while a group is being launched
    pub using_graph: bool,
    pub last_capture: Option<CaptureId>,
}

#[derive(Default)]
pub struct LaunchState {
    pub plan_schedule: BTreeMap<ChannelId, ChanWorkSchedule>,
    // finalized, host setup not yet done
    pub unlaunched_plans: VecDeque<KernelPlan>,
    // host setup done, waiting for submission
    pub uploaded_plans: VecDeque<KernelPlan>,
    pub work_fifo_head: u64,
    pub op_count: u64,
    pub p2p_op_count: u64,
    pub coll_op_count: u64,
}

/// Parameters handed to a communicator constructor.
#[derive(Clone, Debug)]
pub struct InitArgs {
    pub unique_id: UniqueId,
    pub num_ranks: usize,
    pub rank: usize,
    pub cuda_dev: DeviceIdx,
    /// Communicators of the same session living in this process.
    pub clique: Option<Arc<IntraClique>>,
}

pub type CommInitFn = Arc<dyn Fn(&InitArgs) -> Result<Communicator, GroupError> + Send + Sync>;

pub struct Communicator {
    pub id: CommunicatorId,
    pub unique_id: UniqueId,
    pub rank: usize,
    pub num_ranks: usize,
    pub cuda_dev: DeviceIdx,
    pub cpu_affinity: Option<CoreMask>,
    pub profile: CommProfile,
    pub p2p_layout: P2pChannelLayout,

    // P2P operations queued in a group
    pub p2p: P2pQueues,
    // pending connection setup, per connection index
    pub connect: [ConnectRequests; NUM_CONN_INDICES],
    pub p2p_connected: HashSet<PeerConnId>,

    // collective tasks queued in a group
    pub task_queue: TaskQueue,
    pub async_op_count: usize,
    pub async_total_size: usize,

    pub fatal_error: Option<GroupError>,
    pub proxy: ProxyState,
    pub capture: CaptureState,
    pub launch: LaunchState,
    pub clique: Arc<IntraClique>,

    pub(crate) red_ops: UserRedOps,
}

impl Communicator {
    pub fn new(args: &InitArgs, config: &DefaultCommConfig) -> Result<Self, GroupError> {
        if args.num_ranks == 0 || args.rank >= args.num_ranks {
            return Err(GroupError::invalid_argument(format!(
                "rank {} out of range for {} ranks",
                args.rank, args.num_ranks
            )));
        }
        let clique = args
            .clique
            .clone()
            .unwrap_or_else(|| Arc::new(IntraClique::new(1)));
        let profile = CommProfile {
            buff_sizes: config.buf_sizes,
            num_channels: config.channel_count.max(1),
            p2p_net: config.p2p_net,
            p2p_net_threshold: config.p2p_net_threshold,
            sendrecv_slice_factor: config.sendrecv_slice_factor,
        };
        let p2p_layout =
            P2pChannelLayout::new(config.p2p_channel_count, config.p2p_channels_per_peer);
        let comm = Communicator {
            id: CommunicatorId::next(),
            unique_id: args.unique_id,
            rank: args.rank,
            num_ranks: args.num_ranks,
            cuda_dev: args.cuda_dev,
            cpu_affinity: None,
            profile,
            p2p_layout,
            p2p: P2pQueues::new(args.num_ranks),
            connect: Default::default(),
            p2p_connected: HashSet::new(),
            task_queue: TaskQueue::default(),
            async_op_count: 0,
            async_total_size: 0,
            fatal_error: None,
            proxy: ProxyState::new(),
            capture: CaptureState::default(),
            launch: LaunchState::default(),
            clique,
            red_ops: UserRedOps::default(),
        };
        log::debug!(
            "{} initialized: rank {}/{} on device {}",
            comm.id,
            comm.rank,
            comm.num_ranks,
            comm.cuda_dev
        );
        Ok(comm)
    }

    pub fn with_cpu_affinity(mut self, mask: CoreMask) -> Self {
        self.cpu_affinity = Some(mask);
        self
    }

    #[inline]
    pub fn needs_connect(&self, conn_index: ConnIndex) -> bool {
        self.connect[conn_index.as_usize()].needs_connect()
    }

    /// Marks every pending request on `conn_index` as connected.
    pub fn mark_connected(&mut self, conn_index: ConnIndex) -> usize {
        let connected = self.connect[conn_index.as_usize()].take();
        let num = connected.len();
        self.p2p_connected.extend(connected);
        num
    }

    pub(crate) fn check_fatal(&self) -> Result<(), GroupError> {
        match &self.fatal_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Error that made this communicator unusable, if any.
    pub fn async_error(&self) -> Option<&GroupError> {
        self.fatal_error.as_ref()
    }

    /// Clears per-launch state so the next group starts from scratch.
    pub fn launch_reset(&mut self) {
        self.launch.plan_schedule.clear();
        self.launch.unlaunched_plans.clear();
        self.launch.uploaded_plans.clear();
        self.task_queue.coll_queue.clear();
        self.async_op_count = 0;
        self.async_total_size = 0;
        self.capture.using_graph = false;
    }

    pub fn destroy(self) {
        log::debug!(
            "{} destroyed: rank {}, {} pending P2P ops dropped",
            self.id,
            self.rank,
            self.p2p.send_count() + self.p2p.recv_count()
        );
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("id", &self.id)
            .field("rank", &self.rank)
            .field("num_ranks", &self.num_ranks)
            .field("cuda_dev", &self.cuda_dev)
            .finish_non_exhaustive()
    }
}

/// Shared handle through which the application and the group engine
/// reach a communicator.
#[derive(Clone)]
pub struct CommHandle(Arc<Mutex<Communicator>>);

impl CommHandle {
    pub fn new(comm: Communicator) -> Self {
        CommHandle(Arc::new(Mutex::new(comm)))
    }

    pub fn lock(&self) -> MutexGuard<'_, Communicator> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn ptr_eq(&self, other: &CommHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Destroys the communicator once the last handle is gone.
    pub fn destroy(self) {
        match Arc::try_unwrap(self.0) {
            Ok(comm) => comm.into_inner().unwrap_or_else(PoisonError::into_inner).destroy(),
            Err(shared) => log::debug!(
                "{} still referenced, released by its last handle",
                shared.lock().unwrap_or_else(PoisonError::into_inner).id
            ),
        }
    }
}

impl fmt::Debug for CommHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommHandle").field(&*self.lock()).finish()
    }
}

/// Output slot an asynchronous communicator init publishes into.
#[derive(Clone, Default)]
pub struct CommSlot(Arc<Mutex<Option<CommHandle>>>);

impl CommSlot {
    pub fn new() -> Self {
        CommSlot::default()
    }

    fn inner(&self) -> MutexGuard<'_, Option<CommHandle>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, comm: CommHandle) {
        *self.inner() = Some(comm);
    }

    pub fn get(&self) -> Option<CommHandle> {
        self.inner().clone()
    }

    pub fn take(&self) -> Option<CommHandle> {
        self.inner().take()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().is_none()
    }
}

impl fmt::Debug for CommSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommSlot").field(&self.inner().is_some()).finish()
    }
}
