//! `aya` backed kprobe loader.

use std::path::Path;

use aya::Ebpf;
use aya::maps::{HashMap as BpfHashMap, MapData};
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::{KProbe, ProgramError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::InstrumentationError;
use super::manager::{ProbeBackend, ProbeObject};
use super::table::{CounterEntry, CounterTable, TableError};

/// Loads compiled eBPF objects from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct AyaBackend;

impl ProbeBackend for AyaBackend {
    type Object = AyaObject;

    fn load(&self, path: &Path) -> Result<AyaObject, InstrumentationError> {
        let ebpf = Ebpf::load_file(path).map_err(|e| InstrumentationError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!(path = %path.display(), "eBPF object loaded");
        Ok(AyaObject { ebpf })
    }
}

/// A loaded eBPF collection.
pub struct AyaObject {
    ebpf: Ebpf,
}

/// Kprobe attachment, identified by the program that owns it.
pub struct AyaLink {
    program: String,
    id: KProbeLinkId,
}

impl AyaObject {
    fn kprobe_mut(&mut self, name: &str) -> Result<&mut KProbe, ProgramError> {
        let program = self
            .ebpf
            .program_mut(name)
            .ok_or_else(|| ProgramError::UnexpectedProgramType)?;
        program.try_into()
    }
}

impl ProbeObject for AyaObject {
    type Link = AyaLink;
    type Table = AyaCountsTable;

    fn has_entry_point(&self, name: &str) -> bool {
        self.ebpf.program(name).is_some()
    }

    fn attach(
        &mut self,
        entry_point: &str,
        symbol: &str,
    ) -> Result<AyaLink, InstrumentationError> {
        let attach_error = |e: ProgramError| InstrumentationError::Attach {
            entry_point: entry_point.to_string(),
            symbol: symbol.to_string(),
            reason: e.to_string(),
        };

        let probe = self.kprobe_mut(entry_point).map_err(attach_error)?;
        probe.load().map_err(attach_error)?;
        let id = probe.attach(symbol, 0).map_err(attach_error)?;

        Ok(AyaLink {
            program: entry_point.to_string(),
            id,
        })
    }

    fn take_table(&mut self, name: &str) -> Option<AyaCountsTable> {
        let map = self.ebpf.take_map(name)?;
        match BpfHashMap::<MapData, u32, u64>::try_from(map) {
            Ok(map) => Some(AyaCountsTable::new(map)),
            Err(e) => {
                warn!(table = %name, error = %e, "Map is not a u32 -> u64 hash map");
                None
            }
        }
    }

    fn detach(&mut self, link: AyaLink) -> Result<(), InstrumentationError> {
        let detach_error = |e: ProgramError| InstrumentationError::Detach(e.to_string());
        self.kprobe_mut(&link.program)
            .map_err(detach_error)?
            .detach(link.id)
            .map_err(detach_error)
    }

    fn close(self) -> Result<(), InstrumentationError> {
        // Dropping the collection unloads its programs and closes its map fds.
        drop(self.ebpf);
        Ok(())
    }
}

/// `pid -> count` hash map taken out of the collection.
pub struct AyaCountsTable {
    map: Mutex<Option<BpfHashMap<MapData, u32, u64>>>,
}

impl AyaCountsTable {
    fn new(map: BpfHashMap<MapData, u32, u64>) -> Self {
        Self {
            map: Mutex::new(Some(map)),
        }
    }
}

impl CounterTable for AyaCountsTable {
    fn entries(&self) -> Result<Vec<CounterEntry>, TableError> {
        let guard = self.map.lock();
        let Some(map) = guard.as_ref() else {
            return Err(TableError::Closed);
        };

        map.iter()
            .map(|entry| {
                entry
                    .map(|(pid, count)| CounterEntry::new(pid, count))
                    .map_err(|e| TableError::Read(e.to_string()))
            })
            .collect()
    }

    fn release(&self) {
        self.map.lock().take();
    }
}
