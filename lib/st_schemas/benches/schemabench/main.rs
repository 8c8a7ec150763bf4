use criterion::criterion_main;

pub mod codecbench;
pub mod zorderbench;

criterion_main!(codecbench::codec_benches, zorderbench::zorder_benches);
