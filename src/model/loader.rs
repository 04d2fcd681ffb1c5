//! Bundle acquisition: cache hit, hosted download, or source conversion
//!
//! `ensure_bundle` resolves a model descriptor to a complete on-disk
//! bundle. Order of preference: an already-cached bundle, pre-built shards
//! from `hosted_base`, and finally downloading the source safetensors
//! archive and running the converter. Progress lands on the caller's
//! callback with percentages mapped into one monotone 0-100 run.

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::convert::{convert_archive, ConvertOptions, MmapSource};
use crate::engine::events::{LoadPhase, LoadProgress};
use crate::model::{ConfigOverrides, Manifest, ModelConfig, ModelDescriptor};
use crate::quant::{QuantMode, QuantPolicy};
use crate::store::{ObjectDir, ObjectStore};
use crate::utils::error::{AccelError, Result};

/// A complete bundle on disk, ready for GPU upload
pub struct LoadedBundle {
    pub dir: ObjectDir,
    pub manifest: Manifest,
    pub config: ModelConfig,
    pub tokenizer: Option<Vec<u8>>,
}

pub struct BundleLoader {
    store: ObjectStore,
    http: reqwest::Client,
    default_quant: QuantMode,
}

impl BundleLoader {
    pub fn new(store: ObjectStore, default_quant: QuantMode) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            default_quant,
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Resolve `descriptor` to a bundle, downloading/converting as needed
    pub async fn ensure_bundle(
        &self,
        descriptor: &ModelDescriptor,
        progress: &mut (dyn FnMut(LoadProgress) + Send),
    ) -> Result<LoadedBundle> {
        let bundle_dir = self.store.dir("models").subdir(&descriptor.id);

        progress(LoadProgress {
            percent: 0.0,
            phase: LoadPhase::Cache,
            message: format!("checking cache for {}", descriptor.id),
        });

        if bundle_dir.has_file("manifest.json").await {
            info!(model = %descriptor.id, "bundle cache hit");
            progress(LoadProgress {
                percent: 10.0,
                phase: LoadPhase::Cache,
                message: "bundle found in cache".into(),
            });
            return self.open_bundle(bundle_dir).await;
        }

        if let Some(hosted_base) = &descriptor.hosted_base {
            self.fetch_hosted(descriptor, hosted_base, &bundle_dir, progress)
                .await?;
        } else {
            self.fetch_and_convert(descriptor, &bundle_dir, progress)
                .await?;
        }

        self.open_bundle(bundle_dir).await
    }

    async fn open_bundle(&self, dir: ObjectDir) -> Result<LoadedBundle> {
        let manifest: Manifest = serde_json::from_slice(&dir.read_file("manifest.json").await?)
            .map_err(|e| AccelError::Storage(format!("corrupt manifest.json: {}", e)))?;
        let config: ModelConfig = serde_json::from_slice(&dir.read_file("config.json").await?)
            .map_err(|e| AccelError::Storage(format!("corrupt config.json: {}", e)))?;
        let tokenizer = if dir.has_file("tokenizer.json").await {
            Some(dir.read_file("tokenizer.json").await?)
        } else {
            None
        };
        Ok(LoadedBundle {
            dir,
            manifest,
            config,
            tokenizer,
        })
    }

    /// Download a pre-built bundle straight from `hosted_base`
    async fn fetch_hosted(
        &self,
        descriptor: &ModelDescriptor,
        hosted_base: &str,
        bundle_dir: &ObjectDir,
        progress: &mut (dyn FnMut(LoadProgress) + Send),
    ) -> Result<()> {
        info!(model = %descriptor.id, "downloading hosted bundle");
        let result = self
            .fetch_hosted_inner(hosted_base, bundle_dir, progress)
            .await;
        if result.is_err() {
            let _ = bundle_dir.remove().await;
        }
        result
    }

    async fn fetch_hosted_inner(
        &self,
        hosted_base: &str,
        bundle_dir: &ObjectDir,
        progress: &mut (dyn FnMut(LoadProgress) + Send),
    ) -> Result<()> {
        let manifest_bytes = self.fetch_bytes(&join_url(hosted_base, "manifest.json")).await?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| AccelError::SourceMalformed(format!("hosted manifest: {}", e)))?;

        let config_bytes = self.fetch_bytes(&join_url(hosted_base, "config.json")).await?;
        bundle_dir.write_file("config.json", &config_bytes).await?;

        match self.fetch_bytes(&join_url(hosted_base, "tokenizer.json")).await {
            Ok(tok) => bundle_dir.write_file("tokenizer.json", &tok).await?,
            Err(_) => warn!("hosted bundle has no tokenizer.json"),
        }

        let shards = bundle_dir.subdir("shards");
        for i in 0..manifest.num_shards {
            let name = crate::convert::pipeline::shard_name(i);
            let url = join_url(hosted_base, &format!("shards/{}", name));
            let percent_base = 10.0 + 75.0 * i as f32 / manifest.num_shards as f32;
            let span = 75.0 / manifest.num_shards as f32;
            self.download_to_dir(&url, &shards, &name, &mut |frac| {
                progress(LoadProgress {
                    percent: percent_base + span * frac,
                    phase: LoadPhase::Download,
                    message: format!("shard {}/{}", i + 1, manifest.num_shards),
                });
            })
            .await?;
        }

        // The manifest lands last so a partial bundle is never mistaken
        // for a complete one
        bundle_dir.write_file("manifest.json", &manifest_bytes).await?;
        Ok(())
    }

    /// Download the source archive and run the converter over it
    async fn fetch_and_convert(
        &self,
        descriptor: &ModelDescriptor,
        bundle_dir: &ObjectDir,
        progress: &mut (dyn FnMut(LoadProgress) + Send),
    ) -> Result<()> {
        let staging = self.store.dir("staging").subdir(&descriptor.id);
        let result = self
            .fetch_and_convert_inner(descriptor, bundle_dir, &staging, progress)
            .await;
        let _ = staging.remove().await;
        result
    }

    async fn fetch_and_convert_inner(
        &self,
        descriptor: &ModelDescriptor,
        bundle_dir: &ObjectDir,
        staging: &ObjectDir,
        progress: &mut (dyn FnMut(LoadProgress) + Send),
    ) -> Result<()> {
        let weight_url = join_url(&descriptor.source_base, &descriptor.weight_file);
        info!(model = %descriptor.id, url = %weight_url, "downloading source archive");

        let digest = self
            .download_to_dir(&weight_url, staging, "source.safetensors", &mut |frac| {
                progress(LoadProgress {
                    percent: 10.0 + 30.0 * frac,
                    phase: LoadPhase::Download,
                    message: "downloading weights".into(),
                });
            })
            .await?;

        let tokenizer = match &descriptor.tokenizer_file {
            Some(file) => Some(
                self.fetch_bytes(&join_url(&descriptor.source_base, file))
                    .await?,
            ),
            None => None,
        };

        let options = ConvertOptions {
            policy: QuantPolicy {
                mode: descriptor
                    .quant
                    .as_deref()
                    .map(QuantMode::from_str_lossy)
                    .unwrap_or(self.default_quant),
                ..Default::default()
            },
            overrides: ConfigOverrides {
                arch: descriptor.arch.clone(),
                max_position_embeddings: descriptor.max_position,
                ..Default::default()
            },
            ..Default::default()
        };

        let source = MmapSource::open(&staging.file_path("source.safetensors"))?;
        convert_archive(
            source,
            bundle_dir,
            tokenizer.as_deref(),
            Some(digest),
            &options,
            &mut |p| {
                // Converter's own 0-100 maps into the 40-90 band
                progress(LoadProgress {
                    percent: 40.0 + p.percent * 0.5,
                    phase: LoadPhase::Convert,
                    message: p.message,
                });
            },
        )
        .await?;
        Ok(())
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AccelError::Storage(format!("GET {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(AccelError::Storage(format!(
                "GET {}: HTTP {}",
                url,
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| AccelError::Storage(format!("GET {}: {}", url, e)))
    }

    /// Stream a URL into the store, reporting fraction complete and
    /// returning the SHA-256 of the fetched bytes
    async fn download_to_dir(
        &self,
        url: &str,
        dir: &ObjectDir,
        name: &str,
        progress: &mut (dyn FnMut(f32) + Send),
    ) -> Result<String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AccelError::Storage(format!("GET {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(AccelError::Storage(format!(
                "GET {}: HTTP {}",
                url,
                response.status()
            )));
        }

        let total = response.content_length();
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut writer = dir.create_file(name).await?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AccelError::Storage(format!("GET {}: {}", url, e)))?;
            hasher.update(&chunk);
            writer.write(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(total) = total {
                progress(written as f32 / total as f32);
            }
        }
        writer.close().await?;
        progress(1.0);

        Ok(hex::encode(hasher.finalize()))
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(
            join_url("https://host/models/", "weights.safetensors"),
            "https://host/models/weights.safetensors"
        );
        assert_eq!(join_url("https://host", "a/b"), "https://host/a/b");
    }
}
