#![deny(warnings)]
#![deny(missing_docs)]
#![warn(clippy::all)]

//! GpuInventory probes the host for visible GPU devices and hands out
//! per-launch device reservations for the inference engine.

use std::fs;
use std::io;
use std::path::PathBuf;

/// Source of the GPU device ids visible on this host.
///
/// The supervisor only talks to this trait so tests and CPU-only hosts can
/// substitute a synthetic inventory.
pub trait GpuInventory {
    /// Device ids currently present on the host.
    fn probe(&self) -> io::Result<Vec<u32>>;
}

/// Errors during reservation.
#[derive(Debug)]
pub enum Error {
    /// Probing the host failed.
    Io(io::Error),
    /// Fewer devices are present than requested.
    Insufficient {
        /// Devices the launch asked for.
        requested: usize,
        /// Devices the host actually has.
        available: usize,
    },
}

/// Devices assigned to one engine launch.
///
/// Reservations are advisory at the host level; one is requested per launch
/// attempt and availability is re-validated on every restart.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    ids: Vec<u32>,
}

impl Reservation {
    /// The reserved device ids, ascending.
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Render the CUDA_VISIBLE_DEVICES value for the child process.
    pub fn visible_devices(&self) -> String {
        self.ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Reserve `count` devices from `inventory`.
///
/// `count == 0` means a CPU-only launch: no reservation is attempted and
/// `Ok(None)` is returned. Otherwise the lowest `count` device ids are
/// taken.
pub fn reserve(
    inventory: &dyn GpuInventory,
    count: usize,
) -> Result<Option<Reservation>, Error> {
    if count == 0 {
        return Ok(None);
    }
    let mut ids = inventory.probe().map_err(Error::Io)?;
    ids.sort_unstable();
    if ids.len() < count {
        return Err(Error::Insufficient {
            requested: count,
            available: ids.len(),
        });
    }
    ids.truncate(count);
    Ok(Some(Reservation { ids }))
}

/// Inventory backed by the NVIDIA driver's procfs listing.
///
/// Each directory entry under the root is one physical device; entries are
/// mapped to ordinals 0..n in enumeration order, matching the runtime's
/// default device ordering.
pub struct NvidiaProcInventory {
    root: PathBuf,
}

impl NvidiaProcInventory {
    /// Inventory over an alternate listing root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        NvidiaProcInventory { root: root.into() }
    }
}

impl Default for NvidiaProcInventory {
    fn default() -> Self {
        NvidiaProcInventory::new("/proc/driver/nvidia/gpus")
    }
}

impl GpuInventory for NvidiaProcInventory {
    fn probe(&self) -> io::Result<Vec<u32>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            // No listing means no driver loaded, which is a valid
            // zero-device host, not a probe failure.
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("no driver listing at {:?}, assuming 0 GPUs", self.root);
                return Ok(vec![]);
            }
            Err(e) => return Err(e),
        };
        let count = entries.filter_map(|e| e.ok()).count();
        Ok((0..count as u32).collect())
    }
}

/// Fixed device set, for CPU-only hosts and tests.
pub struct FixedInventory {
    ids: Vec<u32>,
}

impl FixedInventory {
    /// Inventory reporting exactly `ids`.
    pub fn new(ids: Vec<u32>) -> Self {
        FixedInventory { ids }
    }
}

impl GpuInventory for FixedInventory {
    fn probe(&self) -> io::Result<Vec<u32>> {
        Ok(self.ids.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_zero_count_skips_reservation() {
        let inventory = FixedInventory::new(vec![]);
        assert_eq!(reserve(&inventory, 0).unwrap(), None);
    }

    #[test]
    fn test_reserve_takes_lowest_ids() {
        let inventory = FixedInventory::new(vec![3, 0, 2, 1]);
        let reservation = reserve(&inventory, 2).unwrap().unwrap();
        assert_eq!(reservation.ids(), &[0, 1]);
        assert_eq!(reservation.visible_devices(), "0,1");
    }

    #[test]
    fn test_insufficient_devices() {
        let inventory = FixedInventory::new(vec![0]);
        match reserve(&inventory, 2) {
            Err(Error::Insufficient {
                requested,
                available,
            }) => {
                assert_eq!(requested, 2);
                assert_eq!(available, 1);
            }
            other => panic!("expected Insufficient, got {:?}", other),
        }
    }

    #[test]
    fn test_reserve_reprobes_each_attempt() {
        let inventory = FixedInventory::new(vec![0, 1]);
        // A device disappearing between attempts must surface on the next
        // reservation, so every call probes afresh.
        assert!(reserve(&inventory, 2).is_ok());
        let shrunk = FixedInventory::new(vec![0]);
        assert!(reserve(&shrunk, 2).is_err());
    }

    fn listing_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gpu_inventory_test_{}_{}", name, std::process::id()))
    }

    #[serial]
    #[test]
    fn test_proc_listing_maps_entries_to_ordinals() {
        let root = listing_root("entries");
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("0000:01:00.0")).unwrap();
        fs::create_dir_all(root.join("0000:41:00.0")).unwrap();
        let inventory = NvidiaProcInventory::new(&root);
        assert_eq!(inventory.probe().unwrap(), vec![0, 1]);
        fs::remove_dir_all(&root).unwrap();
    }

    #[serial]
    #[test]
    fn test_missing_proc_listing_means_no_devices() {
        let root = listing_root("missing");
        let _ = fs::remove_dir_all(&root);
        let inventory = NvidiaProcInventory::new(&root);
        assert_eq!(inventory.probe().unwrap(), Vec::<u32>::new());
    }
}
