//! Benchmarks instruction decoder performance.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use hexane::cpu::decode::Decoder;
use hexane::memory::MemImage;

/// A representative basic block: prologue, integer arithmetic, a divide,
/// some SSE, epilogue.
///
/// One instruction per line.
static DATA: &str = r#"
48 89 5C 24 08
48 89 6C 24 10
48 83 EC 20
48 8B D9
8B 0D 18 01 01 00
B8 01 00 00 00
48 0F AF C3
73 02
89 01
83 E0 F0
6A FC
59
83 C0 04
99
F7 F9
33 F6
56
68 9B D8 04 00
E8 45 1B 00 00
8B F8
3B FE
75 0A
F3 0F 10 05 10 00 00 00
F2 0F 58 C1
66 0F EF C9
48 8B 5C 24 08
48 83 C4 20
C3
"#;

fn decode_basic_block(c: &mut Criterion) {
    // expected instr count
    let icount = DATA.lines().filter(|line| !line.trim().is_empty()).count();
    let data: Vec<_> = DATA
        .split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).unwrap())
        .collect();
    let bytes = data.len() as u64;

    let mem = MemImage::new(data, 0, 0, 0);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(bytes));
    group.bench_function("basic block", |b| {
        b.iter(|| {
            let mut decoder = Decoder::new(&mem, 0);
            for _ in 0..icount {
                black_box(&decoder.decode_next().unwrap());
            }
        })
    });
    group.finish();
}

criterion_group!(decode, decode_basic_block);
criterion_main!(decode);
