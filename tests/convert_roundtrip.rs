//! End-to-end converter and shard format tests

use accel_engine::convert::pipeline::shard_name;
use accel_engine::convert::safetensors::build_archive;
use accel_engine::convert::{convert_archive, ConvertOptions};
use accel_engine::quant::{self, Dtype, QuantMode, QuantPolicy};
use accel_engine::shard::{pack_tensor, parse_shard};
use accel_engine::store::ObjectStore;
use accel_engine::Manifest;

fn f32_bytes(vals: &[f32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn f32_vals(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[test]
fn shard_round_trip_q4_record() {
    // 4x8 tensor of 0.5 in one 32-element block: 4 scale bytes + 16 packed
    let src = vec![0.5f32; 32];
    let (packed, scales) = quant::quantize_q4(&src, 32, false);
    let mut data = Vec::new();
    for s in &scales {
        data.extend_from_slice(&s.to_le_bytes());
    }
    data.extend_from_slice(&packed);

    let record_bytes = pack_tensor("w.1", Dtype::Q4, &[4, 8], &data).unwrap();
    let records = parse_shard(&record_bytes).unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "w.1");
    assert_eq!(records[0].dtype, Dtype::Q4);
    assert_eq!(records[0].shape, vec![4, 8]);
    assert_eq!(records[0].data.len(), 4 + 16);
    assert_eq!(records[0].data, data);

    // And the payload still dequantizes to the source values
    let (scale_bytes, packed_bytes) = records[0].data.split_at(4);
    let scale = f32::from_le_bytes(scale_bytes.try_into().unwrap());
    let recon = quant::dequantize_q4(packed_bytes, &[scale], 32, 32);
    for v in recon {
        assert!((v - 0.5).abs() <= 0.5 * 0.125);
    }
}

#[tokio::test]
async fn identity_convert_reproduces_source_tensors() {
    let a = [1.0f32, 2.0, 3.0, 4.0];
    let b = [0.5f32, -0.5, 0.0];
    let archive = build_archive(&[
        ("model.embed_tokens.weight", "F32", &[2, 2], f32_bytes(&a)),
        ("b", "F32", &[3], f32_bytes(&b)),
    ]);

    let tmp = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(tmp.path()).await.unwrap();
    let bundle = store.dir("models").subdir("identity");

    let options = ConvertOptions {
        policy: QuantPolicy {
            mode: QuantMode::F32,
            ..Default::default()
        },
        ..Default::default()
    };
    let outcome = convert_archive(archive, &bundle, None, None, &options, &mut |_| {})
        .await
        .unwrap();
    assert_eq!(outcome.manifest.num_shards, 1);

    let shard = bundle
        .subdir("shards")
        .read_file(&shard_name(0))
        .await
        .unwrap();
    let records = parse_shard(&shard).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name, "model.embed_tokens.weight");
    assert_eq!(records[0].dtype, Dtype::F32);
    assert_eq!(records[0].data, f32_bytes(&a));
    assert_eq!(records[1].name, "b");
    assert_eq!(records[1].data, f32_bytes(&b));
}

#[tokio::test]
async fn q8_convert_round_trips_within_tolerance() {
    let weight: Vec<f32> = (0..256).map(|i| ((i as f32) * 0.13).sin() * 2.0).collect();
    let archive = build_archive(&[
        (
            "model.embed_tokens.weight",
            "F32",
            &[4, 64],
            f32_bytes(&vec![0.1; 256]),
        ),
        (
            "model.layers.0.self_attn.q_proj.weight",
            "F32",
            &[4, 64],
            f32_bytes(&weight),
        ),
    ]);

    let tmp = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(tmp.path()).await.unwrap();
    let bundle = store.dir("models").subdir("q8");

    let options = ConvertOptions {
        policy: QuantPolicy {
            mode: QuantMode::Q8,
            ..Default::default()
        },
        ..Default::default()
    };
    convert_archive(archive, &bundle, None, None, &options, &mut |_| {})
        .await
        .unwrap();

    let shard = bundle
        .subdir("shards")
        .read_file(&shard_name(0))
        .await
        .unwrap();
    let records = parse_shard(&shard).unwrap();
    let q = &records[1];
    assert_eq!(q.dtype, Dtype::Q8);

    let n_blocks = 256 / 32;
    let (scale_bytes, data) = q.data.split_at(n_blocks * 4);
    let scales = f32_vals(scale_bytes);
    let recon = quant::dequantize_q8(data, &scales, 32, 256);
    // Tolerance is relative to each block's max-abs, which the scale tracks
    for (b, chunk) in weight.chunks(32).enumerate() {
        let maxabs = chunk.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        for (i, &orig) in chunk.iter().enumerate() {
            let back = recon[b * 32 + i];
            assert!(
                (orig - back).abs() <= 0.008 * maxabs,
                "q8 error too large: {} vs {}",
                orig,
                back
            );
        }
    }
}

#[tokio::test]
async fn manifest_carries_required_fields() {
    let archive = build_archive(&[(
        "model.embed_tokens.weight",
        "F32",
        &[2, 32],
        f32_bytes(&vec![0.5; 64]),
    )]);

    let tmp = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(tmp.path()).await.unwrap();
    let bundle = store.dir("models").subdir("m");

    convert_archive(
        archive,
        &bundle,
        Some(b"{\"model\":{}}"),
        Some("abc123".into()),
        &ConvertOptions::default(),
        &mut |_| {},
    )
    .await
    .unwrap();

    let manifest: Manifest =
        serde_json::from_slice(&bundle.read_file("manifest.json").await.unwrap()).unwrap();
    assert_eq!(manifest.acc_version, "1.0.0");
    assert_eq!(manifest.quant, "q4");
    assert_eq!(manifest.num_shards, 1);
    assert_eq!(manifest.tensor_count, 1);
    assert_eq!(manifest.block_size, 32);
    assert_eq!(manifest.source_digest.as_deref(), Some("abc123"));
    assert!(!manifest.created_at.is_empty());

    // Bundle layout: config, tokenizer, kernels alongside the shards
    assert!(bundle.has_file("config.json").await);
    assert!(bundle.has_file("tokenizer.json").await);
    assert!(bundle.subdir("webgpu").has_file("kernels.wgsl").await);
}

#[tokio::test]
async fn f16_mode_halves_weight_storage() {
    let weight: Vec<f32> = (0..128).map(|i| (i as f32) * 0.01 - 0.5).collect();
    let archive = build_archive(&[
        (
            "model.embed_tokens.weight",
            "F32",
            &[2, 64],
            f32_bytes(&vec![0.25; 128]),
        ),
        (
            "model.layers.0.mlp.gate_proj.weight",
            "F32",
            &[2, 64],
            f32_bytes(&weight),
        ),
    ]);

    let tmp = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(tmp.path()).await.unwrap();
    let bundle = store.dir("models").subdir("f16");

    let options = ConvertOptions {
        policy: QuantPolicy {
            mode: QuantMode::F16,
            ..Default::default()
        },
        ..Default::default()
    };
    convert_archive(archive, &bundle, None, None, &options, &mut |_| {})
        .await
        .unwrap();

    let shard = bundle
        .subdir("shards")
        .read_file(&shard_name(0))
        .await
        .unwrap();
    let records = parse_shard(&shard).unwrap();
    let gate = &records[1];
    assert_eq!(gate.dtype, Dtype::F16);
    assert_eq!(gate.data.len(), 128 * 2);

    let tol = 2.0f32.powi(-10);
    for (i, chunk) in gate.data.chunks_exact(2).enumerate() {
        let back = quant::f16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]]));
        let orig = weight[i];
        let rel = if orig.abs() < 1e-6 {
            (orig - back).abs()
        } else {
            ((orig - back) / orig).abs()
        };
        assert!(rel <= tol);
    }
}
