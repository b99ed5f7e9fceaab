//! Send/receive/release cost on the mock platform

use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relay_ipc::*;
use relay_platform::mock::MockPlatform;
use relay_platform::TaskId;

struct Pair {
    ipc: IpcSubsystem,
    client: TaskId,
    service: TaskId,
    handle: Handle,
}

fn pair(mock: &MockPlatform, ipc: IpcSubsystem) -> Pair {
    let spawn = |ipc: &IpcSubsystem| {
        let pid = mock.tasks.spawn_process();
        let task = mock.tasks.spawn_task(pid);
        ipc.open_process(pid);
        ipc.map_pool(task, ipc.default_region(pid)).unwrap();
        task
    };
    let authority = spawn(&ipc);
    ipc.establish_authority(authority, 4096).unwrap();
    let service = spawn(&ipc);
    ipc.bind_endpoint(service).unwrap();
    let AdminReply::Handle(handle) = ipc
        .admin(authority, AdminCommand::GenerateHandle { task: Some(service) })
        .unwrap()
    else {
        unreachable!()
    };
    let client = spawn(&ipc);
    ipc.admin(authority, AdminCommand::GrantAccess { task: client, handle })
        .unwrap();
    Pair {
        ipc,
        client,
        service,
        handle,
    }
}

fn one_way(c: &mut Criterion) {
    let mut group = c.benchmark_group("one_way");
    for size in [0usize, 64, 1024, 4096] {
        let mock = MockPlatform::new();
        let ipc = IpcSubsystem::new(IpcConfig::default(), mock.platform()).unwrap();
        let p = pair(&mock, ipc);
        let message = OutboundMessage::one_way(p.handle, 1, Payload::from_bytes(vec![0xa5u8; size]));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| {
                p.ipc.send(p.client, black_box(message)).unwrap();
                let delivery = p
                    .ipc
                    .receive(p.service, Expectation::Request, Some(Duration::from_secs(1)))
                    .unwrap();
                p.ipc
                    .transact(p.service, Transaction::release(delivery.message))
                    .unwrap();
            })
        });
    }
    group.finish();
}

criterion_group!(benches, one_way);
criterion_main!(benches);
