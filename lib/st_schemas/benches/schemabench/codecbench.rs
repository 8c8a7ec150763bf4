use criterion::{black_box, criterion_group, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use st_schemas::coordinates::{SectionKey, SECTION_DIM3Z};
use st_schemas::voxel::codec::{CodecOptions, SectionDecoder, SectionEncoder, SectionMetadata};

fn filled_encoder(palette_size: usize) -> SectionEncoder {
    let mut rng = Pcg64::seed_from_u64(0x5eed);
    let palette: Vec<u64> = (0..palette_size).map(|_| rng.gen()).collect();
    let mut encoder = SectionEncoder::new();
    for v in encoder.voxels_mut().iter_mut() {
        *v = palette[rng.gen_range(0..palette_size)];
    }
    encoder
}

fn bench_encode(c: &mut Criterion) {
    let key = SectionKey::new(2, 10, -3, 77);
    for palette_size in [1usize, 64, 4096] {
        let mut encoder = filled_encoder(palette_size);
        let mut out = Vec::new();
        c.bench_with_input(BenchmarkId::new("encode", palette_size), &palette_size, |b, _| {
            b.iter(|| {
                out.clear();
                encoder.encode_into(black_box(key), SectionMetadata::default(), &mut out);
            })
        });
    }
}

fn bench_decode(c: &mut Criterion) {
    let key = SectionKey::new(2, 10, -3, 77);
    let mut out: Box<[u64; SECTION_DIM3Z]> = bytemuck::zeroed_box();
    for palette_size in [1usize, 64, 4096] {
        let data = filled_encoder(palette_size).encode(key, SectionMetadata::default());
        for verify_hash in [true, false] {
            let mut decoder = SectionDecoder::new(CodecOptions {
                verify_hash,
                ..CodecOptions::default()
            });
            let name = if verify_hash { "decode" } else { "decode_unverified" };
            c.bench_with_input(BenchmarkId::new(name, palette_size), &data, |b, data| {
                b.iter(|| decoder.decode(key, black_box(data), &mut out).unwrap())
            });
        }
    }
}

criterion_group!(codec_benches, bench_encode, bench_decode);
