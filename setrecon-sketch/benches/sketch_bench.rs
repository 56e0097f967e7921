use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use setrecon_sketch::{derive_ibf_key, BloomFilter, IbfKey, InvertibleBloomFilter, StrataEstimator};
use setrecon_types::Element;

fn keys(prefix: &str, n: usize) -> Vec<IbfKey> {
    (0..n)
        .map(|i| derive_ibf_key(&Element::from_bytes(format!("{prefix}-{i}").into_bytes()).hash()))
        .collect()
}

fn bench_ibf_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("ibf_decode");
    for diff in [64usize, 1024, 8192] {
        let size = (diff * 4).next_power_of_two();
        let mut filled = InvertibleBloomFilter::new(size, 4).unwrap();
        for k in keys("d", diff) {
            filled.insert(k);
        }
        group.bench_with_input(BenchmarkId::from_parameter(diff), &filled, |b, ibf| {
            b.iter(|| {
                let mut work = ibf.clone();
                black_box(work.decode_all().unwrap().len())
            });
        });
    }
    group.finish();
}

fn bench_strata_difference(c: &mut Criterion) {
    let mut a = StrataEstimator::new();
    let mut b = StrataEstimator::new();
    for k in keys("shared", 5000) {
        a.insert(k);
        b.insert(k);
    }
    for k in keys("only-a", 300) {
        a.insert(k);
    }
    c.bench_function("strata_difference", |bench| {
        bench.iter(|| black_box(a.difference(&b).unwrap()));
    });
    c.bench_function("strata_encode", |bench| {
        bench.iter(|| black_box(a.encode().bytes.len()));
    });
}

fn bench_bloom(c: &mut Criterion) {
    let items: Vec<Vec<u8>> = (0..10_000u32).map(|i| i.to_le_bytes().to_vec()).collect();
    c.bench_function("bloom_build_10k", |bench| {
        bench.iter(|| {
            let mut bf = BloomFilter::for_elements(items.len(), 4).unwrap();
            for item in &items {
                bf.insert(item);
            }
            black_box(bf.bits_set())
        });
    });
}

criterion_group!(benches, bench_ibf_decode, bench_strata_difference, bench_bloom);
criterion_main!(benches);
