//! Build orchestration
//!
//! The builder owns the whole pipeline: it admits input files, runs one
//! ingest task per file on the worker pool, routes every decoded point
//! through the registry, and drives the save / load / finalize lifecycle.
//!
//! `save` is a global barrier: the pool joins (no in-flight inserts), every
//! branch serializes its state under the `meta` blob, then the pool reopens.
//! `finalize` rewrites the build layout into the portable output layout.

use crate::config::BuildConfig;
use crate::decode::{self, DecoderKind, PassThrough, PointSink, Transform, ViewTarget};
use crate::error::{IndexError, Result};
use crate::manifest::{FileStatus, Manifest};
use crate::pool::Pool;
use crate::storage::{is_remote_path, LocalSource, Source};
use crate::tree::{calc_offset, Clipper, Registry, Roller};
use crate::types::{BBox, PointInfo, Schema};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct Builder {
    core: Arc<BuilderCore>,
}

pub(crate) struct BuilderCore {
    name: String,
    schema: Arc<Schema>,
    bbox: BBox,
    dimensions: u64,
    chunk_points: u64,
    transform: Option<Box<dyn Transform>>,
    num_points: AtomicU64,
    num_tossed: AtomicU64,
    manifest: Manifest,
    pool: Pool,
    build: Arc<dyn Source>,
    tmp: Arc<dyn Source>,
    registry: Arc<Registry>,
}

impl Builder {
    /// Start a fresh build. Configuration problems are fatal here.
    pub fn new(config: BuildConfig) -> Result<Self> {
        config.validate()?;
        if is_remote_path(&config.build_path) {
            return Err(IndexError::Config(
                "remote build paths need a remote source implementation".into(),
            ));
        }

        let build_local = LocalSource::new(&config.build_path);
        build_local.mkdirp()?;
        let tmp_local = LocalSource::new(&config.tmp_path);
        tmp_local.mkdirp()?;

        let schema = Arc::new(Schema::new(config.dimensions.clone())?);
        let build: Arc<dyn Source> = Arc::new(build_local);
        let tmp: Arc<dyn Source> = Arc::new(tmp_local);

        let registry = Arc::new(Registry::new(
            Arc::clone(&build),
            Arc::clone(&schema),
            config.chunk_points,
            config.base_depth,
            config.flat_depth,
            config.disk_depth,
        )?);

        let transform = config.reprojection.as_ref().map(|r| {
            Box::new(PassThrough {
                in_srs: r.in_srs.clone(),
                out_srs: r.out_srs.clone(),
            }) as Box<dyn Transform>
        });

        Ok(Self {
            core: Arc::new(BuilderCore {
                name: build_name(&config.build_path),
                schema,
                bbox: config.bbox,
                dimensions: config.num_dimensions,
                chunk_points: config.chunk_points,
                transform,
                num_points: AtomicU64::new(0),
                num_tossed: AtomicU64::new(0),
                manifest: Manifest::new(),
                pool: Pool::new(config.num_threads),
                build,
                tmp,
                registry,
            }),
        })
    }

    /// Reopen a saved build from its `meta` blob.
    pub fn load(build_path: &str, tmp_path: &str, num_threads: usize) -> Result<Self> {
        let build_local = LocalSource::new(build_path);
        let build: Arc<dyn Source> = Arc::new(build_local);

        let meta: serde_json::Value = serde_json::from_str(&build.get_as_string("meta")?)?;

        let bbox: BBox = serde_json::from_value(meta["bbox"].clone())?;
        let schema: Schema = serde_json::from_value(meta["schema"].clone())?;
        let schema = Arc::new(schema);
        let field = |key: &str| -> Result<u64> {
            meta[key]
                .as_u64()
                .ok_or_else(|| IndexError::Serialization(format!("meta missing {}", key)))
        };
        let dimensions = field("dimensions")?;
        let chunk_points = field("chunkPoints")?;
        let num_points = field("numPoints")?;
        let num_tossed = field("numTossed")?;
        let manifest = Manifest::from_json(&meta["manifest"])?;

        let registry = Arc::new(Registry::load(
            Arc::clone(&build),
            Arc::clone(&schema),
            chunk_points,
            &meta["registry"],
        )?);

        let tmp_local = LocalSource::new(tmp_path);
        tmp_local.mkdirp()?;

        Ok(Self {
            core: Arc::new(BuilderCore {
                name: build_name(build_path),
                schema,
                bbox,
                dimensions,
                chunk_points,
                transform: None,
                num_points: AtomicU64::new(num_points),
                num_tossed: AtomicU64::new(num_tossed),
                manifest,
                pool: Pool::new(num_threads),
                build,
                tmp: Arc::new(tmp_local),
                registry,
            }),
        })
    }

    /// Admit one input file. Submits an ingest task and returns immediately;
    /// false means no decoder recognized the path and it was recorded as an
    /// omission.
    pub fn insert(&self, path: &str) -> Result<bool> {
        let Some(kind) = decode::infer(path) else {
            self.core.manifest.add_omission(path);
            tracing::warn!(path, "no decoder for input; recorded as omission");
            return Ok(false);
        };

        let origin = self.core.manifest.add_origin(path);
        tracing::info!(origin, path, "adding input");

        let core = Arc::clone(&self.core);
        let path = path.to_string();
        self.core.pool.add(move || {
            match ingest_task(&core, kind, &path, origin) {
                Ok(()) => tracing::info!(origin, path = %path, "done"),
                Err(e) => {
                    core.manifest.set_status(origin, FileStatus::Failed);
                    tracing::error!(origin, path = %path, error = %e, "input task failed");
                }
            }
        });
        Ok(true)
    }

    /// Barrier: drain the pool, serialize all state, reopen for inserts.
    pub fn save(&self) -> Result<()> {
        self.core.pool.join();
        tracing::info!("saving build state");

        let mut meta = self.core.save_props()?;
        meta["registry"] = self.core.registry.save(self.core.build.as_ref())?;
        self.core
            .build
            .put("meta", serde_json::to_string_pretty(&meta)?.as_bytes())?;

        tracing::info!(
            num_points = self.num_points(),
            num_tossed = self.num_tossed(),
            "save complete"
        );
        self.core.pool.go();
        Ok(())
    }

    /// Rewrite the build into the portable output layout at `out_path`:
    /// indices below `calc_offset(base)` form the base blob, the rest
    /// regroups into `chunk_points`-wide chunks. Emits the `cairn` metadata
    /// blob and the `ids` listing alongside the chunks.
    pub fn finalize(
        &self,
        out_path: &str,
        chunk_points: u64,
        base: u64,
        compress: bool,
    ) -> Result<()> {
        self.core.pool.join();

        let out_local = LocalSource::new(out_path);
        out_local.mkdirp()?;
        let out: Arc<dyn Source> = Arc::new(out_local);

        let base_end = calc_offset(base);
        tracing::info!(out = out_path, first_chunk = base_end, "finalizing");

        let ids = Registry::finalize(
            &self.core.registry,
            &out,
            &self.core.pool,
            base_end,
            chunk_points,
            compress,
        )?;

        let mut meta = self.core.save_props()?;
        meta["numIds"] = json!(ids.len());
        meta["firstChunk"] = json!(base_end);
        meta["chunkPoints"] = json!(chunk_points);
        out.put("cairn", serde_json::to_string_pretty(&meta)?.as_bytes())?;
        out.put("ids", serde_json::to_string(&ids)?.as_bytes())?;

        tracing::info!(num_ids = ids.len(), "finalize complete");
        self.core.pool.go();
        Ok(())
    }

    /// Insert a decoded view directly (the per-point path without a file).
    pub fn insert_view(&self, view: &mut [u8], origin: u64, clipper: &mut Clipper) -> Result<()> {
        self.core.insert_view(view, origin, clipper)
    }

    pub fn clipper(&self) -> Clipper {
        Clipper::new(Arc::clone(&self.core.registry))
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.core.schema
    }

    pub fn bbox(&self) -> BBox {
        self.core.bbox
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.core.registry
    }

    pub fn manifest(&self) -> &Manifest {
        &self.core.manifest
    }

    pub fn num_points(&self) -> u64 {
        self.core.num_points.load(Ordering::Relaxed)
    }

    pub fn num_tossed(&self) -> u64 {
        self.core.num_tossed.load(Ordering::Relaxed)
    }
}

impl BuilderCore {
    fn insert_view(&self, view: &mut [u8], origin: u64, clipper: &mut Clipper) -> Result<()> {
        let point_size = self.schema.point_size();
        for record in view.chunks_mut(point_size) {
            let point = self.schema.point_of(record);
            if !self.bbox.contains(point) {
                self.num_tossed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.schema.set_origin(record, origin);
            let info = PointInfo::new(point, record.to_vec());
            let roller = Roller::new(self.bbox);
            if self.registry.add_point(info, roller, clipper)? {
                self.num_points.fetch_add(1, Ordering::Relaxed);
            } else {
                self.num_tossed.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn save_props(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "bbox": self.bbox,
            "schema": &*self.schema,
            "dimensions": self.dimensions,
            "chunkPoints": self.chunk_points,
            "numPoints": self.num_points.load(Ordering::Relaxed),
            "numTossed": self.num_tossed.load(Ordering::Relaxed),
            "manifest": self.manifest.to_json()?,
        }))
    }
}

struct InsertTarget<'a> {
    core: &'a BuilderCore,
    origin: u64,
    clipper: &'a mut Clipper,
    inserted_any: &'a mut bool,
}

impl ViewTarget for InsertTarget<'_> {
    fn insert_view(&mut self, view: &mut [u8]) -> Result<()> {
        self.core.insert_view(view, self.origin, self.clipper)?;
        *self.inserted_any = true;
        Ok(())
    }
}

/// Stage a remote input into tmp under `name-origin`; local inputs pass
/// through untouched. Returns the path to decode from and the staged key to
/// clean up afterwards.
pub(crate) fn stage_input(
    source: &dyn Source,
    tmp: &dyn Source,
    name: &str,
    origin: u64,
) -> Result<(String, Option<String>)> {
    if !source.is_remote() {
        return Ok((source.path().to_string(), None));
    }
    let key = format!("{}-{}", name, origin);
    tmp.put(&key, &source.get_root()?)?;
    Ok((tmp.resolve(&key), Some(key)))
}

/// One worker's whole journey through a single input file.
fn ingest_task(
    core: &Arc<BuilderCore>,
    kind: DecoderKind,
    path: &str,
    origin: u64,
) -> Result<()> {
    let source: Arc<dyn Source> = Arc::new(LocalSource::new(path));
    let (local_path, staged_key) =
        stage_input(source.as_ref(), core.tmp.as_ref(), &core.name, origin)?;

    let mut decoder = kind.open(&local_path, Arc::clone(&core.schema));
    let mut clipper = Clipper::new(Arc::clone(&core.registry));
    let mut inserted_any = false;
    {
        let mut target = InsertTarget {
            core: core.as_ref(),
            origin,
            clipper: &mut clipper,
            inserted_any: &mut inserted_any,
        };
        let mut sink = PointSink::new(
            Arc::clone(&core.schema),
            core.transform.as_deref(),
            &mut target,
        );
        // Leftover records flush after the decoder drains.
        let outcome = decoder.execute(&mut sink).and_then(|()| sink.flush());
        match outcome {
            Ok(()) => core.manifest.set_status(origin, FileStatus::Inserted),
            Err(e) => {
                // Decode failure is terminal for the file, not the build.
                let status = if inserted_any {
                    FileStatus::Partial
                } else {
                    FileStatus::Failed
                };
                core.manifest.set_status(origin, status);
                tracing::error!(origin, path, error = %e, "decode failed");
            }
        }
    }

    // Eviction writes triggered here must surface.
    clipper.release()?;

    if let Some(key) = staged_key {
        core.tmp.remove(&key)?;
    }
    Ok(())
}

fn build_name(build_path: &str) -> String {
    Path::new(build_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("build")
        .to_string()
}
