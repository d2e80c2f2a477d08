//! Process-wide shared map cache.
//!
//! One instance per serving process holds the loaded model capabilities
//! and, per map, the global-descriptor retrieval index. Readers take a
//! [`CacheSnapshot`] at request entry and are unaffected by concurrent
//! reloads: a reload builds the replacement index off to the side and
//! installs it with a single pointer swap under the lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use feature_store::{BlobStore, GlobalDescriptorIndex, GLOBAL_DESCRIPTORS_STORE};
use maploc_models::CapabilitySet;
use maploc_types::{layout, MapDirs, MapName};

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("map {0:?} is not loaded")]
    MapNotLoaded(String),
    #[error("{source}")]
    Store {
        #[from]
        source: feature_store::StoreError,
    },
    #[error("{source}")]
    Types {
        #[from]
        source: maploc_types::Error,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Everything the localizer needs for one map, immutable once published.
#[derive(Debug)]
pub struct MapEntry {
    pub name: MapName,
    pub dirs: MapDirs,
    pub descriptor_index: GlobalDescriptorIndex,
}

/// An immutable view of the cache taken at request entry. Holding a
/// snapshot keeps its entries alive across any number of reloads.
#[derive(Clone)]
pub struct CacheSnapshot {
    capabilities: CapabilitySet,
    maps: Arc<BTreeMap<MapName, Arc<MapEntry>>>,
}

impl CacheSnapshot {
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn map(&self, name: &MapName) -> Result<Arc<MapEntry>> {
        self.maps
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::MapNotLoaded(name.to_string()))
    }

    pub fn map_names(&self) -> Vec<MapName> {
        self.maps.keys().cloned().collect()
    }
}

pub struct MapCache {
    data_root: PathBuf,
    capabilities: CapabilitySet,
    maps: RwLock<Arc<BTreeMap<MapName, Arc<MapEntry>>>>,
}

impl MapCache {
    /// Scan the data root and load every map found there. A map that fails
    /// to load is logged and skipped — it must never block the others.
    pub fn load<P: AsRef<Path>>(data_root: P, capabilities: CapabilitySet) -> Result<MapCache> {
        let data_root = data_root.as_ref().to_path_buf();
        let mut maps = BTreeMap::new();
        for name in layout::list_map_names(&data_root)? {
            match load_entry(&data_root, &name) {
                Ok(entry) => {
                    info!(map = %name, images = entry.descriptor_index.len(), "loaded descriptor index");
                    maps.insert(name, Arc::new(entry));
                }
                Err(e) => {
                    warn!(map = %name, error = %e, "skipping map");
                }
            }
        }
        Ok(MapCache {
            data_root,
            capabilities,
            maps: RwLock::new(Arc::new(maps)),
        })
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            capabilities: self.capabilities.clone(),
            maps: self.maps.read().clone(),
        }
    }

    /// Rebuild one map's entry from disk and swap it in. Readers holding
    /// an older snapshot keep the previous entry until they drop it.
    pub fn reload(&self, name: &MapName) -> Result<()> {
        let entry = load_entry(&self.data_root, name)?;
        info!(map = %name, images = entry.descriptor_index.len(), "reloaded descriptor index");
        let mut guard = self.maps.write();
        let mut next = BTreeMap::clone(&guard);
        next.insert(name.clone(), Arc::new(entry));
        *guard = Arc::new(next);
        Ok(())
    }

    /// Drop a map from the cache (after deletion on disk).
    pub fn evict(&self, name: &MapName) {
        let mut guard = self.maps.write();
        if guard.contains_key(name) {
            let mut next = BTreeMap::clone(&guard);
            next.remove(name);
            *guard = Arc::new(next);
        }
    }
}

fn load_entry(data_root: &Path, name: &MapName) -> Result<MapEntry> {
    let dirs = MapDirs::new(data_root, name);
    let store = BlobStore::open(dirs.hloc_dir().join(GLOBAL_DESCRIPTORS_STORE))?;
    let descriptor_index = GlobalDescriptorIndex::load(&store)?;
    Ok(MapEntry {
        name: name.clone(),
        dirs,
        descriptor_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use feature_store::GlobalDescriptor;
    

    fn write_descriptors(root: &Path, map: &str, names: &[&str]) {
        let name = MapName::new(map).unwrap();
        let dirs = MapDirs::new(root, &name);
        let store = BlobStore::open(dirs.hloc_dir().join(GLOBAL_DESCRIPTORS_STORE)).unwrap();
        for n in names {
            store
                .put(n, &GlobalDescriptor { values: vec![1.0, 0.0] })
                .unwrap();
        }
    }

    #[test]
    fn snapshot_is_isolated_from_reload() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptors(tmp.path(), "lobby", &["a.jpg", "b.jpg"]);
        let cache = MapCache::load(tmp.path(), CapabilitySet::unconfigured()).unwrap();
        let name = MapName::new("lobby").unwrap();

        let before = cache.snapshot();
        let entry_before = before.map(&name).unwrap();
        assert_eq!(entry_before.descriptor_index.len(), 2);

        // A build adds an image and reloads.
        write_descriptors(tmp.path(), "lobby", &["c.jpg"]);
        cache.reload(&name).unwrap();

        // The old snapshot still sees the pre-reload index.
        assert_eq!(before.map(&name).unwrap().descriptor_index.len(), 2);
        assert!(Arc::ptr_eq(&entry_before, &before.map(&name).unwrap()));
        // A fresh snapshot sees the new one.
        assert_eq!(cache.snapshot().map(&name).unwrap().descriptor_index.len(), 3);
    }

    #[test]
    fn broken_map_is_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptors(tmp.path(), "good", &["a.jpg"]);
        // "broken" exists but has an empty descriptor store.
        let broken = MapName::new("broken").unwrap();
        let dirs = MapDirs::new(tmp.path(), &broken);
        std::fs::create_dir_all(dirs.hloc_dir()).unwrap();

        let cache = MapCache::load(tmp.path(), CapabilitySet::unconfigured()).unwrap();
        let snap = cache.snapshot();
        assert_eq!(snap.map_names(), vec![MapName::new("good").unwrap()]);
        assert!(matches!(
            snap.map(&broken),
            Err(CacheError::MapNotLoaded(_))
        ));
    }

    #[test]
    fn concurrent_readers_never_see_a_torn_index() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptors(tmp.path(), "lobby", &["a.jpg", "b.jpg"]);
        let cache =
            Arc::new(MapCache::load(tmp.path(), CapabilitySet::unconfigured()).unwrap());
        let name = MapName::new("lobby").unwrap();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let name = name.clone();
            let stop = stop.clone();
            readers.push(std::thread::spawn(move || {
                let mut seen = std::collections::BTreeSet::new();
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let entry = cache.snapshot().map(&name).unwrap();
                    let index = &entry.descriptor_index;
                    // Names and matrix always agree; the row count is one
                    // of the published versions, never a mix.
                    assert_eq!(index.names.len(), index.matrix.nrows());
                    seen.insert(index.names.len());
                }
                seen
            }));
        }

        for i in 0..50 {
            write_descriptors(tmp.path(), "lobby", &[&format!("extra{i}.jpg")]);
            cache.reload(&name).unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for handle in readers {
            let seen = handle.join().unwrap();
            assert!(seen.iter().all(|&n| (2..=52).contains(&n)));
        }
    }

    #[test]
    fn evict_removes_entry() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptors(tmp.path(), "lobby", &["a.jpg"]);
        let cache = MapCache::load(tmp.path(), CapabilitySet::unconfigured()).unwrap();
        let name = MapName::new("lobby").unwrap();
        cache.evict(&name);
        assert!(cache.snapshot().map(&name).is_err());
    }
}
