use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal;

use anyhow::Result;
use structopt::StructOpt;

use mccs_group::config::Config;
use mccs_group::device::DevicePtr;
use mccs_group::comm::redop::ReduceOp;
use mccs_group::proxy::task::TaskDataType;
use mccs_group::sim::{sim_comm_init, SimCluster};
use mccs_group::{CommHandle, CommSlot, GroupState, UniqueId};

use chrono::Timelike;
use env_logger::fmt::Color;
use std::io::Write;

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "mCCS group simulator")]
struct Opts {
    /// Config path
    #[structopt(short, long)]
    config: Option<PathBuf>,
    /// Ranks in this process, one device each
    #[structopt(short, long, default_value = "4")]
    ranks: usize,
    /// Bytes each rank sends to its ring neighbour
    #[structopt(short, long, default_value = "1048576")]
    bytes: usize,
    #[structopt(short, long, default_value = "10")]
    iters: usize,
}

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(sig: i32) {
    assert_eq!(sig, signal::SIGINT as i32);
    TERMINATE.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    better_panic::install();
    let opts = Opts::from_args();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let time = chrono::Local::now();
            let style = buf
                .style()
                .set_color(Color::Black)
                .set_intense(true)
                .clone();
            let time = format!(
                "{:02}:{:02}:{:02}.{:03}",
                time.hour() % 24,
                time.minute(),
                time.second(),
                time.timestamp_subsec_millis()
            );
            writeln!(
                buf,
                "{}{} {} {}{} {}",
                style.value("["),
                time,
                buf.default_styled_level(record.level()),
                record.module_path().unwrap_or(""),
                style.value("]"),
                record.args()
            )
        })
        .init();
    let config = match opts.config.as_ref() {
        Some(path) => Config::from_path(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env()?;
            config
        }
    };
    anyhow::ensure!(opts.ranks > 0, "at least one rank is required");

    // process Ctrl-C event
    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_sigint),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe { signal::sigaction(signal::SIGINT, &sig_action) }?;

    let (cluster, backend) = SimCluster::new(opts.ranks);
    let mut group = GroupState::new(backend, &config.group);

    let slots: Vec<_> = (0..opts.ranks).map(|_| CommSlot::new()).collect();
    let devices: Vec<_> = (0..opts.ranks as i32).collect();
    group.init_all(
        sim_comm_init(config.comm_default_config.clone(), None),
        &devices,
        UniqueId::from_u64(std::process::id() as u64),
        &slots,
    )?;
    let comms = slots
        .iter()
        .map(|slot| slot.get().ok_or_else(|| anyhow::anyhow!("communicator not created")))
        .collect::<Result<Vec<CommHandle>>>()?;
    log::info!("Started mCCS group simulator with {} ranks", comms.len());

    let n = comms.len();
    let send_buf = DevicePtr::new(0x1000_0000).ok_or_else(|| anyhow::anyhow!("null buffer"))?;
    let recv_buf = send_buf.byte_add(opts.bytes.max(1));
    for iter in 0..opts.iters {
        if TERMINATE.load(Ordering::Relaxed) {
            log::info!("Interrupted after {} iterations", iter);
            break;
        }
        group.enter();
        for (rank, comm) in comms.iter().enumerate() {
            group.send(comm, (rank + 1) % n, Some(send_buf), opts.bytes)?;
            group.recv(comm, (rank + n - 1) % n, Some(recv_buf), opts.bytes)?;
        }
        group.close()?;
        log::info!(
            "iteration {}: {} proxy batches posted",
            iter,
            cluster.posted_ops().len()
        );
    }

    // ranks of one clique launch together
    group.enter();
    for comm in comms.iter() {
        group.all_reduce(
            comm,
            Some(send_buf),
            Some(recv_buf),
            opts.bytes / 4,
            TaskDataType::Float32,
            ReduceOp::Sum,
        )?;
    }
    group.close()?;
    log::info!("{} kernel launches submitted", cluster.device.launches().len());

    drop(slots);
    for comm in comms {
        comm.destroy();
    }
    Ok(())
}
