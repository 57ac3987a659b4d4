// ========================================================================================
//
//                        LDEPI PAIRWISE KERNEL BENCHMARKS
//
// ========================================================================================
//
// Measures the two inner loops every all-pairs scan spends its time in: the bit-sliced
// dot product behind each correlation (SIMD batches against one word at a time) and the
// 3×3 contingency table built from class planes.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ldepi::arena::Region;
use ldepi::contingency::{ContingencyTable, SplitGeometry, split_dosages};
use ldepi::encode::{EncodedBlock, GenotypeEncoder, SAMPLES_PER_WORD, XDosagePolicy};
use ldepi::kernel::{KernelSums, dot_product, dot_product_scalar};
use ldepi::types::{ChromosomeKind, Sex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Cohort sizes to sweep.
const COHORT_SIZES: [usize; 4] = [1_000, 10_000, 50_000, 200_000];

fn random_packed(rng: &mut StdRng, n: usize) -> Vec<u64> {
    let mut words = vec![0u64; n.div_ceil(SAMPLES_PER_WORD)];
    for idx in 0..n {
        let code: u64 = if rng.gen_bool(0.01) { 3 } else { rng.gen_range(0..3) };
        words[idx / SAMPLES_PER_WORD] |= code << (2 * (idx % SAMPLES_PER_WORD));
    }
    words
}

fn bench_dot_product(c: &mut Criterion) {
    let mut group = c.benchmark_group("dot_product");
    let mut rng = StdRng::seed_from_u64(42);
    for &n in &COHORT_SIZES {
        let encoder = GenotypeEncoder::new(&vec![Sex::Female; n], XDosagePolicy::AsAutosome);
        let geometry = encoder.geometry();
        let region = Region::with_budget(4 * EncodedBlock::bytes_per_slot(geometry, false));
        let mut block = EncodedBlock::allocate(&region, geometry, 2, false).expect("bench block");
        for slot in 0..2 {
            let mut raw = random_packed(&mut rng, n);
            encoder.encode(&mut raw, ChromosomeKind::Autosome, block.slot_mut(slot));
        }
        let (fixed, var) = (block.view(0), block.view(1));
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("simd", n), &n, |b, _| {
            b.iter(|| {
                let mut sums = KernelSums::default();
                dot_product(var.geno, fixed.geno, var.mask, fixed.mask, &mut sums);
                black_box(sums)
            })
        });
        group.bench_with_input(BenchmarkId::new("scalar", n), &n, |b, _| {
            b.iter(|| {
                let mut sums = KernelSums::default();
                dot_product_scalar(var.geno, fixed.geno, var.mask, fixed.mask, &mut sums);
                black_box(sums)
            })
        });
    }
    group.finish();
}

fn bench_contingency(c: &mut Criterion) {
    let mut group = c.benchmark_group("contingency_table");
    let mut rng = StdRng::seed_from_u64(7);
    for &n in &COHORT_SIZES {
        let geometry = SplitGeometry::new(n / 2, n - n / 2);
        let mut markers = vec![vec![0u64; geometry.words_per_marker()]; 2];
        for marker in &mut markers {
            let (cases, controls) = geometry.halves_mut(marker);
            split_dosages(&random_packed(&mut rng, geometry.cases), geometry.cases, cases);
            split_dosages(
                &random_packed(&mut rng, geometry.controls),
                geometry.controls,
                controls,
            );
        }
        let (first, second) = (geometry.view(&markers[0]), geometry.view(&markers[1]));
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                black_box((
                    ContingencyTable::build(&first.cases, &second.cases),
                    ContingencyTable::build(&first.controls, &second.controls),
                ))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_dot_product, bench_contingency);
criterion_main!(benches);
