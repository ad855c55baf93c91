use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;
use t5_pretrain::distributed::{
    ClusterEnv, Communicator, Coordinator, DistributedContext, LocalGroup, SingleProcess,
    TcpCommunicator,
};
use t5_pretrain::PretrainError;
use tch::{nn, Device, Kind, Tensor};

fn free_address() -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.to_string())
}

fn env_from(vars: &[(&str, &str)]) -> Result<ClusterEnv, PretrainError> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    ClusterEnv::from_lookup(|name| vars.get(name).cloned())
}

#[test]
fn ranks_agree_on_the_shortest_epoch() -> anyhow::Result<()> {
    let handles: Vec<_> = LocalGroup::new(3)
        .into_iter()
        .zip([120usize, 115, 130])
        .map(|(communicator, local)| {
            thread::spawn(move || Coordinator::new(communicator).agree_on_epoch_length(local))
        })
        .collect();

    for handle in handles {
        let agreed = handle.join().map_err(|_| anyhow::anyhow!("rank panicked"))??;
        assert_eq!(agreed, 115);
    }
    Ok(())
}

#[test]
fn gradients_are_averaged_across_ranks() -> anyhow::Result<()> {
    let handles: Vec<_> = LocalGroup::new(3)
        .into_iter()
        .map(|communicator| {
            thread::spawn(move || -> Result<Vec<f32>, PretrainError> {
                let rank = communicator.rank();
                let mut coordinator = Coordinator::new(communicator);
                let vs = nn::VarStore::new(Device::Cpu);
                let weight = vs.root().var("weight", &[2], nn::Init::Const(1.0));
                // never used in the loss: no gradient on any rank
                let _unused = vs.root().var("unused", &[3], nn::Init::Const(1.0));

                let loss = (&weight * (rank as f64 + 1.0)).sum(Kind::Float);
                loss.backward();
                coordinator.synchronize_gradients(&vs)?;
                Ok(Vec::<f32>::try_from(&weight.grad())?)
            })
        })
        .collect();

    for handle in handles {
        let gradient = handle.join().map_err(|_| anyhow::anyhow!("rank panicked"))??;
        assert_eq!(gradient, vec![2.0, 2.0]);
    }
    Ok(())
}

#[test]
fn tensors_are_summed_in_place() -> anyhow::Result<()> {
    let handles: Vec<_> = LocalGroup::new(2)
        .into_iter()
        .map(|mut communicator| {
            thread::spawn(move || -> Result<(Vec<f32>, Kind), PretrainError> {
                let rank = communicator.rank() as f32;
                let mut tensor = Tensor::from_slice(&[1.0f32, rank, -rank, 0.5])
                    .view([2, 2])
                    .to_kind(Kind::Double);
                communicator.all_reduce_sum_tensor(&mut tensor)?;
                let kind = tensor.kind();
                Ok((Vec::<f32>::try_from(&tensor.to_kind(Kind::Float).view(-1))?, kind))
            })
        })
        .collect();

    for handle in handles {
        let (values, kind) = handle.join().map_err(|_| anyhow::anyhow!("rank panicked"))??;
        assert_eq!(values, vec![2.0, 1.0, -1.0, 1.0]);
        assert_eq!(kind, Kind::Double);
    }

    let mut tensor = Tensor::from_slice(&[3.0f32]);
    SingleProcess.all_reduce_sum_tensor(&mut tensor)?;
    assert_eq!(Vec::<f32>::try_from(&tensor)?, vec![3.0]);
    Ok(())
}

#[test]
fn tcp_group_runs_collectives() -> anyhow::Result<()> {
    let address = free_address()?;
    let handles: Vec<_> = (0..3usize)
        .map(|rank| {
            let address = address.clone();
            thread::spawn(move || -> Result<(i64, Vec<f32>), PretrainError> {
                let mut communicator =
                    TcpCommunicator::init(rank, 3, &address, Duration::from_secs(20))?;
                let minimum = communicator.all_reduce_min([120, 115, 130][rank])?;
                let mut values = vec![rank as f32, 1.0];
                communicator.all_reduce_sum(&mut values)?;
                communicator.barrier()?;
                Ok((minimum, values))
            })
        })
        .collect();

    for handle in handles {
        let (minimum, values) = handle.join().map_err(|_| anyhow::anyhow!("rank panicked"))??;
        assert_eq!(minimum, 115);
        assert_eq!(values, vec![3.0, 3.0]);
    }
    Ok(())
}

#[test]
fn dead_peer_fails_the_collective() -> anyhow::Result<()> {
    let address = free_address()?;
    let peer_address = address.clone();
    let peer = thread::spawn(move || -> Result<(), PretrainError> {
        let communicator = TcpCommunicator::init(1, 2, &peer_address, Duration::from_secs(20))?;
        drop(communicator);
        Ok(())
    });

    let mut root = TcpCommunicator::init(0, 2, &address, Duration::from_secs(20))?;
    peer.join().map_err(|_| anyhow::anyhow!("peer panicked"))??;

    assert!(matches!(
        root.all_reduce_min(7),
        Err(PretrainError::CollectiveCommunicationError(_))
    ));
    Ok(())
}

#[test]
fn departed_local_rank_fails_the_collective() -> anyhow::Result<()> {
    let mut ranks = LocalGroup::new(3).into_iter();
    let (mut first, mut second, third) = match (ranks.next(), ranks.next(), ranks.next()) {
        (Some(first), Some(second), Some(third)) => (first, second, third),
        _ => anyhow::bail!("local group of 3 expected"),
    };

    // rank 1 is already waiting when rank 2 leaves
    let waiting = thread::spawn(move || second.all_reduce_min(3));
    thread::sleep(Duration::from_millis(100));
    drop(third);

    assert!(matches!(
        waiting.join().map_err(|_| anyhow::anyhow!("rank panicked"))?,
        Err(PretrainError::CollectiveCommunicationError(_))
    ));
    assert!(matches!(
        first.all_reduce_min(7),
        Err(PretrainError::CollectiveCommunicationError(_))
    ));
    Ok(())
}

#[test]
fn silent_local_rank_times_out() -> anyhow::Result<()> {
    let mut ranks = LocalGroup::with_timeout(2, Duration::from_millis(200));
    let _idle = ranks.pop();
    let mut root = ranks
        .pop()
        .ok_or_else(|| anyhow::anyhow!("local group of 2 expected"))?;

    let mut values = vec![1.0f32];
    assert!(matches!(
        root.all_reduce_sum(&mut values),
        Err(PretrainError::CollectiveCommunicationError(_))
    ));
    assert_eq!(values, vec![1.0]);
    Ok(())
}

#[test]
fn missing_root_times_out() -> anyhow::Result<()> {
    let address = free_address()?;
    let result = TcpCommunicator::init(1, 2, &address, Duration::from_millis(300));
    assert!(matches!(
        result,
        Err(PretrainError::CollectiveCommunicationError(_))
    ));
    Ok(())
}

#[test]
fn environment_is_validated() {
    let complete = [
        ("WORLD_SIZE", "8"),
        ("SLURM_PROCID", "6"),
        ("SLURM_GPUS_ON_NODE", "4"),
        ("MASTER_ADDR", "node-001"),
        ("MASTER_PORT", "29400"),
        ("HOSTNAME", "node-002"),
    ];
    let env = env_from(&complete).unwrap();
    assert_eq!(env.local_rank(), 2);
    assert_eq!(env.hostname, "node-002");
    assert!(env.validate_devices(4).is_ok());
    assert!(matches!(
        env.validate_devices(2),
        Err(PretrainError::InvalidConfigurationError(_))
    ));

    for missing in ["WORLD_SIZE", "SLURM_PROCID", "SLURM_GPUS_ON_NODE", "MASTER_ADDR"] {
        let vars: Vec<_> = complete
            .iter()
            .copied()
            .filter(|(name, _)| *name != missing)
            .collect();
        assert!(matches!(
            env_from(&vars),
            Err(PretrainError::InvalidConfigurationError(_))
        ));
    }

    assert!(matches!(
        env_from(&[("WORLD_SIZE", "2"), ("SLURM_PROCID", "2"), ("SLURM_GPUS_ON_NODE", "1")]),
        Err(PretrainError::InvalidConfigurationError(_))
    ));
    assert!(matches!(
        env_from(&[("WORLD_SIZE", "two"), ("SLURM_PROCID", "0"), ("SLURM_GPUS_ON_NODE", "1")]),
        Err(PretrainError::InvalidConfigurationError(_))
    ));

    let single = env_from(&[("WORLD_SIZE", "1"), ("SLURM_PROCID", "0"), ("SLURM_GPUS_ON_NODE", "1")])
        .unwrap();
    assert_eq!(single.master_addr, "127.0.0.1:29500");
    let context = DistributedContext::new(&single, 0).unwrap();
    assert_eq!(context.device, Device::Cpu);
    assert!(context.is_main());
}

#[test]
fn seeds_and_shards_rotate_with_the_epoch() -> anyhow::Result<()> {
    let world_size = 4;
    let mut seeds = HashSet::new();
    let mut shards_of_epoch: Vec<HashSet<usize>> = vec![HashSet::new(); 3];
    for communicator in LocalGroup::new(world_size) {
        let coordinator = Coordinator::new(communicator);
        for epoch in 0..10 {
            assert!(seeds.insert(coordinator.epoch_seed(42, epoch)));
        }
        for (epoch, shards) in shards_of_epoch.iter_mut().enumerate() {
            shards.insert(coordinator.shard_index(epoch, 8)?);
        }
    }
    assert_eq!(seeds.len(), 40);
    assert_eq!(shards_of_epoch[0], HashSet::from([0, 1, 2, 3]));
    assert_eq!(shards_of_epoch[1], HashSet::from([4, 5, 6, 7]));
    assert_eq!(shards_of_epoch[2], HashSet::from([0, 1, 2, 3]));

    let single = Coordinator::new(SingleProcess);
    assert_eq!(single.epoch_seed(42, 3), 45);
    assert!(matches!(
        single.shard_index(0, 0),
        Err(PretrainError::InvalidConfigurationError(_))
    ));
    Ok(())
}

#[test]
fn single_process_collectives_are_local() -> anyhow::Result<()> {
    let mut coordinator = Coordinator::new(SingleProcess);
    assert_eq!(coordinator.agree_on_epoch_length(17)?, 17);

    let vs = nn::VarStore::new(Device::Cpu);
    let weight = vs.root().var("weight", &[2], nn::Init::Const(0.0));
    (&weight * Tensor::from_slice(&[3.0f32, 4.0])).sum(Kind::Float).backward();
    coordinator.synchronize_gradients(&vs)?;
    assert_eq!(Vec::<f32>::try_from(&weight.grad())?, vec![3.0, 4.0]);
    Ok(())
}
