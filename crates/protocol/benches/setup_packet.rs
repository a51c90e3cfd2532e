//! Benchmarks for wire encoding
//!
//! Measures:
//! - Setup packet construction and field decoding
//! - Configuration descriptor tree parsing

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{
    Configuration, ControlSetupPacket, DescriptorType, STANDARD_IN_FROM_DEVICE, get_descriptor,
    validate_standard,
};

fn benchmark_setup_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("setup_packet");

    group.bench_function("encode_get_descriptor", |b| {
        b.iter(|| get_descriptor(black_box(DescriptorType::Device), 0, 0, black_box(18)))
    });

    let setup = ControlSetupPacket::new(STANDARD_IN_FROM_DEVICE, 0x06, 0x0100, 0, 18);
    group.bench_function("decode_request_type", |b| {
        b.iter(|| black_box(&setup).request_type())
    });

    group.bench_function("validate_standard", |b| {
        b.iter(|| validate_standard(black_box(&setup)))
    });

    group.finish();
}

/// Configuration with `interfaces` interfaces of two bulk endpoints each
fn build_configuration(interfaces: u8) -> Vec<u8> {
    let mut bytes = vec![0x09, 0x02, 0x00, 0x00, interfaces, 0x01, 0x00, 0x80, 0x32];
    for number in 0..interfaces {
        bytes.extend_from_slice(&[0x09, 0x04, number, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00]);
        let ep = (number % 15) + 1;
        bytes.extend_from_slice(&[0x07, 0x05, 0x80 | ep, 0x02, 0x00, 0x02, 0x00]);
        bytes.extend_from_slice(&[0x07, 0x05, ep, 0x02, 0x00, 0x02, 0x00]);
    }
    let total = bytes.len() as u16;
    bytes[2..4].copy_from_slice(&total.to_le_bytes());
    bytes
}

fn benchmark_configuration_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("configuration_parse");

    for interfaces in [1u8, 4, 16] {
        let bytes = build_configuration(interfaces);
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_function(format!("interfaces_{}", interfaces), |b| {
            b.iter(|| Configuration::parse(black_box(&bytes)))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_setup_packet, benchmark_configuration_parse);
criterion_main!(benches);
