// Key keeper benchmarks.
//
// Covers output generation (range proofs), split signing, and the overhead
// of routing calls through the threaded keeper.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use umbra_wallet::crypto::KeyType;
use umbra_wallet::keykeeper::{KeyKeeperExt, LocalKeyKeeper, PrivateKeyKeeper, ThreadedKeyKeeper};
use umbra_wallet::storage::WalletDb;
use umbra_wallet::transaction::types::CoinId;
use umbra_wallet::transaction::KernelParameters;

fn local_keeper() -> Arc<LocalKeyKeeper> {
    let db = Arc::new(WalletDb::open_temporary().expect("temporary db"));
    Arc::new(LocalKeyKeeper::from_seed(db, &[42u8; 32]).expect("keeper"))
}

fn coin(idx: u64, amount: u64) -> CoinId {
    CoinId::new(idx, KeyType::Regular, amount)
}

fn bench_generate_outputs(c: &mut Criterion) {
    let keeper = local_keeper();
    let mut group = c.benchmark_group("keeper/generate_outputs");

    for count in [1usize, 4, 16] {
        let ids: Vec<_> = (0..count as u64).map(|i| coin(i + 1, 1_000 + i)).collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &ids, |b, ids| {
            b.iter(|| keeper.generate_outputs(200, ids.clone()).unwrap());
        });
    }

    group.finish();
}

fn bench_sign_split(c: &mut Criterion) {
    let keeper = local_keeper();
    let kernel = KernelParameters {
        fee: 100,
        min_height: 10,
        max_height: 130,
        ..Default::default()
    };

    c.bench_function("keeper/sign_split", |b| {
        b.iter(|| {
            keeper
                .sign_split(
                    vec![coin(1, 1_000)],
                    vec![coin(2, 450), coin(3, 450)],
                    kernel.clone(),
                )
                .unwrap()
        });
    });
}

fn bench_nonce_roundtrip(c: &mut Criterion) {
    let local = local_keeper();
    let threaded = ThreadedKeyKeeper::new(local.clone()).expect("worker");
    let mut group = c.benchmark_group("keeper/allocate_nonce");

    let keepers: [(&str, &dyn PrivateKeyKeeper); 2] = [("local", &*local), ("threaded", &threaded)];
    for (name, keeper) in keepers {
        group.bench_function(name, |b| {
            b.iter(|| keeper.allocate_nonce_slot().unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_generate_outputs,
    bench_sign_split,
    bench_nonce_roundtrip,
);
criterion_main!(benches);
