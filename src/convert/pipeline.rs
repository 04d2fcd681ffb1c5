//! Converter pipeline: source archive in, quantized bundle out
//!
//! Tensors are processed strictly in header order so repeated conversions
//! of the same archive produce identical shard layouts. Shards roll over
//! once the open one crosses the configured byte cap; everything already
//! converted lives only on disk.

use tracing::{debug, info};

use super::infer::infer_config;
use super::safetensors::{ByteSource, SafetensorsReader, SourceDtype, TensorMeta};
use crate::gpu::shaders;
use crate::model::{ConfigOverrides, Manifest, ModelConfig, ACC_VERSION};
use crate::quant::{self, Dtype, QuantPolicy};
use crate::shard::pack_tensor;
use crate::store::{ObjectDir, ObjectWriter};
use crate::utils::error::{AccelError, Result};

/// Default shard rollover threshold
pub const DEFAULT_SHARD_CAP: u64 = 256 * 1024 * 1024;

/// Converter settings
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub policy: QuantPolicy,
    pub shard_cap_bytes: u64,
    pub overrides: ConfigOverrides,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            policy: QuantPolicy::default(),
            shard_cap_bytes: DEFAULT_SHARD_CAP,
            overrides: ConfigOverrides::default(),
        }
    }
}

/// Progress event over the four converter phases
#[derive(Debug, Clone)]
pub struct ConvertProgress {
    /// Monotone 0-100
    pub percent: f32,
    /// "header" | "inspect" | "convert" | "finalize"
    pub phase: &'static str,
    pub message: String,
}

/// What a finished conversion wrote
#[derive(Debug, Clone)]
pub struct ConvertOutcome {
    pub manifest: Manifest,
    pub config: ModelConfig,
}

/// Convert `source` into a bundle under `bundle`.
///
/// On any failure the partially written bundle directory is removed, so the
/// destination either holds a complete bundle or nothing.
pub async fn convert_archive<S: ByteSource>(
    source: S,
    bundle: &ObjectDir,
    tokenizer: Option<&[u8]>,
    source_digest: Option<String>,
    options: &ConvertOptions,
    progress: &mut (dyn FnMut(ConvertProgress) + Send),
) -> Result<ConvertOutcome> {
    options.policy.validate()?;

    match run_pipeline(source, bundle, tokenizer, source_digest, options, progress).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            // Leave no partial bundle behind
            let _ = bundle.remove().await;
            Err(e)
        }
    }
}

async fn run_pipeline<S: ByteSource>(
    source: S,
    bundle: &ObjectDir,
    tokenizer: Option<&[u8]>,
    source_digest: Option<String>,
    options: &ConvertOptions,
    progress: &mut (dyn FnMut(ConvertProgress) + Send),
) -> Result<ConvertOutcome> {
    progress(ConvertProgress {
        percent: 0.0,
        phase: "header",
        message: "parsing source header".into(),
    });

    let reader = SafetensorsReader::open(source)?;
    let tensor_count = reader.tensors().len();
    if tensor_count == 0 {
        return Err(AccelError::SourceMalformed(
            "archive declares no tensors".into(),
        ));
    }
    if !reader.tensors().iter().any(|t| is_embedding(&t.name)) {
        return Err(AccelError::SourceMalformed(
            "archive has no embedding tensor".into(),
        ));
    }

    progress(ConvertProgress {
        percent: 5.0,
        phase: "inspect",
        message: format!("inspecting {} tensors", tensor_count),
    });

    let config = infer_config(reader.tensors(), &options.overrides);
    let block = options.policy.block_size;

    info!(
        tensors = tensor_count,
        mode = options.policy.mode.as_str(),
        block,
        "starting conversion"
    );

    let shards_dir = bundle.subdir("shards");
    let mut shards = ShardRoller::new(&shards_dir, options.shard_cap_bytes);

    for (idx, meta) in reader.tensors().iter().enumerate() {
        let raw = reader.read_tensor(meta)?;
        let (dtype, blob) = encode_tensor(meta, raw, options)?;
        let record = pack_tensor(&meta.name, dtype, &meta.shape, &blob)?;
        shards.append(&record).await?;

        debug!(
            tensor = %meta.name,
            dtype = dtype.as_str(),
            bytes = blob.len(),
            "converted tensor"
        );
        progress(ConvertProgress {
            percent: 10.0 + 75.0 * (idx + 1) as f32 / tensor_count as f32,
            phase: "convert",
            message: meta.name.clone(),
        });
    }

    let num_shards = shards.finish().await?;

    progress(ConvertProgress {
        percent: 85.0,
        phase: "finalize",
        message: "writing manifest".into(),
    });

    let manifest = Manifest {
        acc_version: ACC_VERSION.to_string(),
        arch: config.arch.clone(),
        quant: options.policy.mode.as_str().to_string(),
        num_shards,
        tensor_count,
        created_at: chrono::Utc::now().to_rfc3339(),
        block_size: block,
        source_digest,
    };

    bundle
        .write_file(
            "config.json",
            &serde_json::to_vec_pretty(&config)
                .map_err(|e| AccelError::InternalError(e.to_string()))?,
        )
        .await?;
    if let Some(tok) = tokenizer {
        bundle.write_file("tokenizer.json", tok).await?;
    }
    bundle
        .subdir("webgpu")
        .write_file("kernels.wgsl", shaders::full_source().as_bytes())
        .await?;
    bundle
        .write_file(
            "manifest.json",
            &serde_json::to_vec_pretty(&manifest)
                .map_err(|e| AccelError::InternalError(e.to_string()))?,
        )
        .await?;

    progress(ConvertProgress {
        percent: 100.0,
        phase: "finalize",
        message: format!("wrote {} shards", num_shards),
    });
    info!(shards = num_shards, "conversion complete");

    Ok(ConvertOutcome { manifest, config })
}

/// Pick the stored dtype and produce the record's data blob
fn encode_tensor(
    meta: &TensorMeta,
    raw: &[u8],
    options: &ConvertOptions,
) -> Result<(Dtype, Vec<u8>)> {
    let policy = &options.policy;
    let cols = meta.shape.last().copied().unwrap_or(0) as usize;
    let is_weight = meta.shape.len() >= 2;

    // Unknown source dtypes (bitsandbytes-style pre-quantized blobs) pass
    // through untouched under an F32 label.
    if let SourceDtype::Other(ref name) = meta.dtype {
        debug!(tensor = %meta.name, source_dtype = %name, "opaque dtype passthrough");
        return Ok((Dtype::F32, raw.to_vec()));
    }

    let target = if is_weight
        && !is_quant_exempt(&meta.name)
        && cols > 0
        && cols % policy.block_size == 0
    {
        policy.mode.weight_dtype()
    } else {
        Dtype::F32
    };

    match target {
        Dtype::F32 => match meta.dtype {
            // Straight byte copy keeps f32 sources byte-exact
            SourceDtype::F32 => Ok((Dtype::F32, raw.to_vec())),
            _ => Ok((Dtype::F32, f32_blob(&decode_f32(meta, raw)?))),
        },
        Dtype::F16 => match meta.dtype {
            SourceDtype::F16 => Ok((Dtype::F16, raw.to_vec())),
            _ => {
                let values = decode_f32(meta, raw)?;
                let bits = quant::f32_to_f16(&values);
                let mut blob = Vec::with_capacity(bits.len() * 2);
                for b in bits {
                    blob.extend_from_slice(&b.to_le_bytes());
                }
                Ok((Dtype::F16, blob))
            }
        },
        Dtype::Q8 => {
            let values = decode_f32(meta, raw)?;
            let (data, scales) = quant::quantize_q8(&values, policy.block_size);
            Ok((Dtype::Q8, scale_prefixed(&scales, &data)))
        }
        Dtype::Q4 => {
            let values = decode_f32(meta, raw)?;
            let (data, scales) =
                quant::quantize_q4(&values, policy.block_size, policy.calibrate);
            Ok((Dtype::Q4, scale_prefixed(&scales, &data)))
        }
    }
}

/// Decode a source tensor's bytes to f32 values
fn decode_f32(meta: &TensorMeta, raw: &[u8]) -> Result<Vec<f32>> {
    let expect = |elem_size: usize| -> Result<()> {
        if raw.len() != meta.n_elems() * elem_size {
            return Err(AccelError::SourceMalformed(format!(
                "tensor {} declares {} elements but carries {} bytes",
                meta.name,
                meta.n_elems(),
                raw.len()
            )));
        }
        Ok(())
    };

    match meta.dtype {
        SourceDtype::F32 => {
            expect(4)?;
            Ok(raw
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect())
        }
        SourceDtype::F16 => {
            expect(2)?;
            Ok(raw
                .chunks_exact(2)
                .map(|c| quant::f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                .collect())
        }
        SourceDtype::BF16 => {
            expect(2)?;
            Ok(raw
                .chunks_exact(2)
                .map(|c| quant::bf16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                .collect())
        }
        SourceDtype::Other(ref name) => Err(AccelError::Unsupported(format!(
            "cannot decode source dtype {}",
            name
        ))),
    }
}

fn f32_blob(values: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(values.len() * 4);
    for v in values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn scale_prefixed(scales: &[f32], data: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(scales.len() * 4 + data.len());
    for s in scales {
        blob.extend_from_slice(&s.to_le_bytes());
    }
    blob.extend_from_slice(data);
    blob
}

fn is_embedding(name: &str) -> bool {
    name.contains("embed_tokens") || name.contains("tok_embeddings") || name.contains("wte")
}

/// Tensors the f32 kernel contracts read directly, never quantized
fn is_quant_exempt(name: &str) -> bool {
    is_embedding(name) || name.contains("lm_head")
}

/// Rolls shard files over once the open one crosses the byte cap
struct ShardRoller<'a> {
    dir: &'a ObjectDir,
    cap: u64,
    index: usize,
    writer: Option<ObjectWriter>,
}

impl<'a> ShardRoller<'a> {
    fn new(dir: &'a ObjectDir, cap: u64) -> Self {
        Self {
            dir,
            cap,
            index: 0,
            writer: None,
        }
    }

    async fn append(&mut self, record: &[u8]) -> Result<()> {
        if self.writer.is_none() {
            let name = shard_name(self.index);
            self.writer = Some(self.dir.create_file(&name).await?);
        }
        let writer = self.writer.as_mut().expect("writer just ensured");
        writer.write(record).await?;

        // Roll over only after at least one record landed
        if writer.bytes_written() >= self.cap {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn rotate(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            if writer.bytes_written() > 0 {
                writer.close().await?;
                self.index += 1;
            } else {
                writer.abort().await?;
            }
        }
        Ok(())
    }

    /// Flush the trailing shard and report how many were written
    async fn finish(&mut self) -> Result<usize> {
        self.rotate().await?;
        Ok(self.index)
    }
}

/// `shard_NN.bin` naming, two digits minimum
pub fn shard_name(index: usize) -> String {
    format!("shard_{:02}.bin", index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::safetensors::build_archive;
    use crate::quant::QuantMode;
    use crate::shard::parse_shard;
    use crate::store::ObjectStore;

    fn f32_bytes(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    async fn convert_to_temp(
        archive: Vec<u8>,
        options: ConvertOptions,
    ) -> (tempfile::TempDir, ObjectDir, ConvertOutcome) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(tmp.path()).await.unwrap();
        let bundle = store.dir("models").subdir("test");
        let outcome = convert_archive(archive, &bundle, None, None, &options, &mut |_| {})
            .await
            .unwrap();
        (tmp, bundle, outcome)
    }

    #[tokio::test]
    async fn identity_f32_conversion_is_byte_exact() {
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let b = [0.5f32, -0.5, 0.0];
        let archive = build_archive(&[
            ("model.embed_tokens.weight", "F32", &[2, 2], f32_bytes(&a)),
            ("b", "F32", &[3], f32_bytes(&b)),
        ]);

        let options = ConvertOptions {
            policy: QuantPolicy {
                mode: QuantMode::F32,
                ..Default::default()
            },
            ..Default::default()
        };
        let (_tmp, bundle, outcome) = convert_to_temp(archive, options).await;

        assert_eq!(outcome.manifest.num_shards, 1);
        assert_eq!(outcome.manifest.tensor_count, 2);

        let shard = bundle
            .subdir("shards")
            .read_file(&shard_name(0))
            .await
            .unwrap();
        let records = parse_shard(&shard).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "model.embed_tokens.weight");
        assert_eq!(records[0].data, f32_bytes(&a));
        assert_eq!(records[1].data, f32_bytes(&b));
    }

    #[tokio::test]
    async fn quantizes_weights_but_not_vectors() {
        let weight = vec![0.25f32; 64];
        let norm = vec![1.0f32; 32];
        let archive = build_archive(&[
            (
                "model.embed_tokens.weight",
                "F32",
                &[2, 32],
                f32_bytes(&weight),
            ),
            (
                "model.layers.0.self_attn.q_proj.weight",
                "F32",
                &[2, 32],
                f32_bytes(&weight),
            ),
            ("model.norm.weight", "F32", &[32], f32_bytes(&norm)),
        ]);

        let options = ConvertOptions {
            policy: QuantPolicy {
                mode: QuantMode::Q4,
                ..Default::default()
            },
            ..Default::default()
        };
        let (_tmp, bundle, _) = convert_to_temp(archive, options).await;

        let shard = bundle
            .subdir("shards")
            .read_file(&shard_name(0))
            .await
            .unwrap();
        let records = parse_shard(&shard).unwrap();
        // Embedding stays f32 for the embed kernel, projection quantizes,
        // rank-1 norm stays f32
        assert_eq!(records[0].dtype, Dtype::F32);
        assert_eq!(records[1].dtype, Dtype::Q4);
        assert_eq!(records[1].data.len(), Dtype::Q4.data_len(64, 32));
        assert_eq!(records[2].dtype, Dtype::F32);
    }

    #[tokio::test]
    async fn shard_rollover_respects_cap() {
        let big = vec![0.1f32; 1024];
        let archive = build_archive(&[
            ("model.embed_tokens.weight", "F32", &[4, 256], f32_bytes(&big)),
            ("t1", "F32", &[4, 256], f32_bytes(&big)),
            ("t2", "F32", &[4, 256], f32_bytes(&big)),
        ]);

        // Each record is ~4.1 KiB, so a 4 KiB cap rolls over on every tensor
        let options = ConvertOptions {
            policy: QuantPolicy {
                mode: QuantMode::F32,
                ..Default::default()
            },
            shard_cap_bytes: 4000,
            ..Default::default()
        };
        let (_tmp, bundle, outcome) = convert_to_temp(archive, options).await;

        assert_eq!(outcome.manifest.num_shards, 3);
        let names = bundle.subdir("shards").list().await.unwrap();
        assert_eq!(names, vec!["shard_00.bin", "shard_01.bin", "shard_02.bin"]);

        // Concatenated shards still parse to the full tensor stream
        let mut all = Vec::new();
        for name in &names {
            all.extend(bundle.subdir("shards").read_file(name).await.unwrap());
        }
        assert_eq!(parse_shard(&all).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn bf16_source_decodes_to_f32() {
        let bits: Vec<u8> = [3.5f32, -1.25]
            .iter()
            .flat_map(|v| ((v.to_bits() >> 16) as u16).to_le_bytes())
            .collect();
        let archive = build_archive(&[
            ("model.embed_tokens.weight", "BF16", &[1, 2], bits),
        ]);

        let options = ConvertOptions {
            policy: QuantPolicy {
                mode: QuantMode::F32,
                ..Default::default()
            },
            ..Default::default()
        };
        let (_tmp, bundle, _) = convert_to_temp(archive, options).await;
        let shard = bundle
            .subdir("shards")
            .read_file(&shard_name(0))
            .await
            .unwrap();
        let records = parse_shard(&shard).unwrap();
        assert_eq!(records[0].dtype, Dtype::F32);
        assert_eq!(records[0].data, f32_bytes(&[3.5, -1.25]));
    }

    #[tokio::test]
    async fn failed_conversion_leaves_no_bundle() {
        // No embedding tensor: the pipeline must fail and clean up
        let archive = build_archive(&[("w", "F32", &[2, 2], f32_bytes(&[1.0; 4]))]);

        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(tmp.path()).await.unwrap();
        let bundle = store.dir("models").subdir("broken");
        let err = convert_archive(
            archive,
            &bundle,
            None,
            None,
            &ConvertOptions::default(),
            &mut |_| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AccelError::SourceMalformed(_)));
        assert!(!bundle.exists().await);
    }

    #[tokio::test]
    async fn progress_is_monotone() {
        let archive = build_archive(&[
            (
                "model.embed_tokens.weight",
                "F32",
                &[2, 32],
                f32_bytes(&vec![0.5; 64]),
            ),
            ("a", "F32", &[32], f32_bytes(&vec![1.0; 32])),
        ]);

        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(tmp.path()).await.unwrap();
        let bundle = store.dir("models").subdir("p");
        let mut seen = Vec::new();
        convert_archive(
            archive,
            &bundle,
            None,
            None,
            &ConvertOptions::default(),
            &mut |p| seen.push(p.percent),
        )
        .await
        .unwrap();

        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 100.0);
    }
}
