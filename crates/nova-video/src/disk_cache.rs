//! Append-only on-disk pipeline cache.
//!
//! Layout: the 8-byte magic `NOVACACH`, a `u32` [`CACHE_VERSION`], then records of
//! `u8 kind, key bytes, u32 environment count, environments`. All integers are little-endian.
//! A file with another magic or version is deleted and rebuilt from scratch; a corrupt record
//! ends loading and deletes the file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use nova_shader::Stage;
use tracing::{debug, error, info};

use crate::config::ShaderBackend;
use crate::environment::{FileEnvironment, GenericEnvironment};
use crate::error::{CacheError, Result};
use crate::io::{ReadLeExt, WriteLeExt};
use crate::pipeline_key::{ComputePipelineKey, GraphicsPipelineKey};
use crate::sync::lock;

pub const CACHE_MAGIC: [u8; 8] = *b"NOVACACH";

/// Version of the disk cache contents.
///
/// Bump this when the record layout changes, or when translation changes in a way that makes
/// previously recorded environments produce different programs.
pub const CACHE_VERSION: u32 = 1;

const KIND_GRAPHICS: u8 = 0;
const KIND_COMPUTE: u8 = 1;

/// One pipeline read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub enum DiskRecord {
    Graphics {
        key: GraphicsPipelineKey,
        /// One environment per stage the key uses, in pipeline order.
        envs: Vec<FileEnvironment>,
    },
    Compute {
        key: ComputePipelineKey,
        env: FileEnvironment,
    },
}

#[derive(Debug)]
pub struct DiskCache {
    path: PathBuf,
    version: u32,
    file: Mutex<Option<File>>,
}

impl DiskCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_version(path, CACHE_VERSION)
    }

    /// A cache that writes and accepts `version` instead of [`CACHE_VERSION`].
    pub fn with_version(path: impl Into<PathBuf>, version: u32) -> Self {
        Self {
            path: path.into(),
            version,
            file: Mutex::new(None),
        }
    }

    /// `<dir>/<title_id:016x>/<backend>.bin`
    pub fn path_for(dir: &Path, title_id: u64, backend: ShaderBackend) -> PathBuf {
        dir.join(format!("{title_id:016x}"))
            .join(format!("{}.bin", backend.cache_name()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_graphics(
        &self,
        key: &GraphicsPipelineKey,
        envs: &[&GenericEnvironment<'_>],
    ) -> Result<()> {
        self.append(&Self::graphics_record(key, envs)?)
    }

    pub fn append_compute(
        &self,
        key: &ComputePipelineKey,
        env: &GenericEnvironment<'_>,
    ) -> Result<()> {
        self.append(&Self::compute_record(key, env)?)
    }

    /// Serialized record for a graphics pipeline, ready for [`DiskCache::append`].
    pub(crate) fn graphics_record(
        key: &GraphicsPipelineKey,
        envs: &[&GenericEnvironment<'_>],
    ) -> Result<Vec<u8>> {
        let count = u32::try_from(envs.len()).map_err(|_| CacheError::Corrupt("too many stages"))?;
        let mut record = Vec::new();
        record.write_u8(KIND_GRAPHICS)?;
        record.write_bytes(key.as_bytes())?;
        record.write_u32_le(count)?;
        for env in envs {
            env.serialize(&mut record)?;
        }
        Ok(record)
    }

    pub(crate) fn compute_record(
        key: &ComputePipelineKey,
        env: &GenericEnvironment<'_>,
    ) -> Result<Vec<u8>> {
        let mut record = Vec::new();
        record.write_u8(KIND_COMPUTE)?;
        record.write_bytes(key.as_bytes())?;
        record.write_u32_le(1)?;
        env.serialize(&mut record)?;
        Ok(record)
    }

    pub(crate) fn append(&self, record: &[u8]) -> Result<()> {
        let mut file = lock(&self.file);
        let handle = match file.take() {
            Some(handle) => handle,
            None => self.open_for_append()?,
        };
        let handle = file.insert(handle);
        handle.write_all(record)?;
        handle.flush()?;
        Ok(())
    }

    fn open_for_append(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if file.metadata()?.len() == 0 {
            file.write_bytes(&CACHE_MAGIC)?;
            file.write_u32_le(self.version)?;
        }
        Ok(file)
    }

    /// Reads every record, handing each to `on_record`, until the file ends or `stop` is raised.
    /// Returns the number of records delivered. Never fails: an unusable file is removed and
    /// counts as empty.
    pub fn load(&self, stop: &AtomicBool, mut on_record: impl FnMut(DiskRecord)) -> usize {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no pipeline cache file");
                return 0;
            }
            Err(err) => {
                error!(path = %self.path.display(), %err, "failed to open pipeline cache");
                return 0;
            }
        };
        let mut reader = BufReader::new(file);
        match self.read_header(&mut reader) {
            Ok(()) => {}
            Err(err @ (CacheError::InvalidMagic | CacheError::UnsupportedVersion(_))) => {
                info!(path = %self.path.display(), %err, "removing stale pipeline cache");
                self.remove();
                return 0;
            }
            Err(err) => {
                error!(path = %self.path.display(), %err, "corrupt pipeline cache header");
                self.remove();
                return 0;
            }
        }

        let mut loaded = 0;
        while !stop.load(Ordering::Relaxed) {
            let mut kind = [0u8; 1];
            match reader.read(&mut kind) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    error!(path = %self.path.display(), %err, "failed to read pipeline cache");
                    break;
                }
            }
            match read_record(&mut reader, kind[0]) {
                Ok(record) => {
                    on_record(record);
                    loaded += 1;
                }
                Err(err) => {
                    error!(
                        path = %self.path.display(),
                        loaded,
                        %err,
                        "corrupt pipeline cache record"
                    );
                    self.remove();
                    break;
                }
            }
        }
        info!(path = %self.path.display(), loaded, "loaded pipeline cache entries");
        loaded
    }

    fn read_header(&self, reader: &mut impl Read) -> Result<()> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != CACHE_MAGIC {
            return Err(CacheError::InvalidMagic);
        }
        let version = reader.read_u32_le()?;
        if version != self.version {
            return Err(CacheError::UnsupportedVersion(version));
        }
        Ok(())
    }

    fn remove(&self) {
        let mut file = lock(&self.file);
        file.take();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                error!(path = %self.path.display(), %err, "failed to remove pipeline cache")
            }
        }
    }
}

fn read_record(reader: &mut impl Read, kind: u8) -> Result<DiskRecord> {
    match kind {
        KIND_GRAPHICS => {
            let bytes = reader.read_exact_vec(std::mem::size_of::<GraphicsPipelineKey>())?;
            let key = GraphicsPipelineKey::from_bytes(&bytes)
                .ok_or(CacheError::Corrupt("graphics key"))?;
            let count = reader.read_u32_le()? as usize;
            if count != key.stages().count() || count > Stage::NUM_GRAPHICS {
                return Err(CacheError::Corrupt("graphics environment count"));
            }
            let envs = (0..count)
                .map(|_| FileEnvironment::deserialize(reader))
                .collect::<Result<Vec<_>>>()?;
            Ok(DiskRecord::Graphics { key, envs })
        }
        KIND_COMPUTE => {
            let bytes = reader.read_exact_vec(std::mem::size_of::<ComputePipelineKey>())?;
            let key = ComputePipelineKey::from_bytes(&bytes)
                .ok_or(CacheError::Corrupt("compute key"))?;
            if reader.read_u32_le()? != 1 {
                return Err(CacheError::Corrupt("compute environment count"));
            }
            let env = FileEnvironment::deserialize(reader)?;
            Ok(DiskRecord::Compute { key, env })
        }
        _ => Err(CacheError::Corrupt("unknown record kind")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_per_title_and_backend() {
        let path = DiskCache::path_for(Path::new("/cache"), 0x0100_ABCD, ShaderBackend::SpirV);
        assert_eq!(path, Path::new("/cache/000000000100abcd/spirv.bin"));
    }

    #[test]
    fn unknown_record_kind_is_corrupt() {
        let err = read_record(&mut io::Cursor::new(vec![0u8; 64]), 7).unwrap_err();
        assert!(matches!(err, CacheError::Corrupt("unknown record kind")));
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().join("absent.bin"));
        assert_eq!(cache.load(&AtomicBool::new(false), |_| panic!("no records")), 0);
    }

    #[test]
    fn foreign_magic_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        fs::write(&path, b"NOTACACHE\x01\x00\x00\x00").unwrap();
        let cache = DiskCache::new(&path);
        assert_eq!(cache.load(&AtomicBool::new(false), |_| {}), 0);
        assert!(!path.exists());
    }
}
